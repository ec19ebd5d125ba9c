use thiserror::Error;

/// Result alias used throughout the crate.
pub type PlsrResult<T> = Result<T, PlsrError>;

/// Every failure the analysis can produce. None of them is recovered locally:
/// each one propagates to the caller and ends the run.
#[derive(Error, Debug)]
pub enum PlsrError {
    /// The export endpoint answered with a non-success HTTP status.
    #[error("request to {url} failed with HTTP status {status}")]
    Network { url: String, status: u16 },

    /// The request never produced a response (DNS, TLS, connection reset, body read).
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// A metadata column the assembler needs is absent from the table.
    #[error("required column '{0}' is missing from the input table")]
    MissingColumn(String),

    /// An integer wavelength inside the requested range has no column.
    #[error("wavelength column {0} nm is missing from the input table")]
    MissingWavelength(u32),

    /// Any other structural problem with the input table.
    #[error("schema error: {0}")]
    Schema(String),

    /// The regression solver could not produce a model.
    #[error("PLSR fit failed: {0}")]
    Fit(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("statistics error: {0}")]
    Stats(String),

    #[error("failed to render plot: {0}")]
    Plot(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),
}

impl PlsrError {
    /// True for the errors raised while talking to the export endpoint.
    pub fn is_network(&self) -> bool {
        matches!(self, PlsrError::Network { .. } | PlsrError::Transport { .. })
    }

    /// True for the errors raised because the input table has the wrong shape.
    pub fn is_schema(&self) -> bool {
        matches!(
            self,
            PlsrError::MissingColumn(_) | PlsrError::MissingWavelength(_) | PlsrError::Schema(_)
        )
    }
}
