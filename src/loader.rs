// Data acquisition: export URL, HTTP fetch and delimited-text parsing.

use crate::error::{PlsrError, PlsrResult};
use csv::{ReaderBuilder, Trim};
use log::{debug, info};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::Instant;
use url::Url;

/// A parsed export: header row plus string cells, one row per sample.
/// Cells are kept as text; the assembler decides what is numeric.
#[derive(Clone, Debug, PartialEq)]
pub struct RawTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl RawTable {
    /// Builds a table, checking every row has one cell per header.
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> PlsrResult<Self> {
        if headers.is_empty() {
            return Err(PlsrError::Schema("table has no header row".into()));
        }
        if let Some((idx, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != headers.len()) {
            return Err(PlsrError::Schema(format!(
                "row {} has {} cells but the header has {}",
                idx,
                row.len(),
                headers.len()
            )));
        }
        Ok(Self { headers, rows })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_columns(&self) -> usize {
        self.headers.len()
    }

    /// Index of the column with exactly this header.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }
}

/// Builds `https://<host>/api/package/<id>/export?metadata=true`.
///
/// A host given with an explicit `http://` or `https://` scheme keeps it, which
/// lets a local server stand in for the real endpoint.
pub fn export_url(host: &str, dataset_id: &str) -> PlsrResult<Url> {
    let base = if host.starts_with("http://") || host.starts_with("https://") {
        host.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", host.trim_end_matches('/'))
    };
    let mut url = Url::parse(&base)?;
    url.path_segments_mut()
        .map_err(|_| PlsrError::Config(format!("host '{}' cannot carry a path", host)))?
        .pop_if_empty()
        .extend(&["api", "package", dataset_id, "export"]);
    url.query_pairs_mut().append_pair("metadata", "true");
    Ok(url)
}

/// Downloads and parses the export at `url`. One blocking request, no retry:
/// a non-success status fails immediately with `PlsrError::Network`.
pub fn fetch_raw_table(url: &Url) -> PlsrResult<RawTable> {
    info!("Fetching spectral dataset from {}", url);
    let start = Instant::now();

    let transport = |source: reqwest::Error| PlsrError::Transport {
        url: url.to_string(),
        source,
    };
    let response = reqwest::blocking::get(url.as_str()).map_err(transport)?;
    let status = response.status();
    if !status.is_success() {
        return Err(PlsrError::Network {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let body = response.text().map_err(transport)?;
    debug!("Downloaded {} bytes in {:?}", body.len(), start.elapsed());

    let table = parse_raw_table(body.as_bytes())?;
    info!(
        "Parsed export: {} rows x {} columns in {:?}",
        table.num_rows(),
        table.num_columns(),
        start.elapsed()
    );
    Ok(table)
}

/// Reads a previously saved export from disk.
pub fn read_raw_table(path: &Path) -> PlsrResult<RawTable> {
    info!("Reading spectral dataset from {}", path.display());
    let file = File::open(path)?;
    let table = parse_raw_table(BufReader::new(file))?;
    info!("Parsed {} rows x {} columns", table.num_rows(), table.num_columns());
    Ok(table)
}

/// Parses comma-delimited text with a header row.
pub fn parse_raw_table<R: Read>(reader: R) -> PlsrResult<RawTable> {
    let mut csv_reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::Headers)
        .from_reader(reader);

    let headers: Vec<String> = csv_reader
        .headers()?
        .iter()
        .enumerate()
        // Exports written on Windows often lead with a byte-order mark.
        .map(|(i, h)| if i == 0 { h.trim_start_matches('\u{feff}').to_string() } else { h.to_string() })
        .collect();
    if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
        return Err(PlsrError::Schema("payload is empty or has no header row".into()));
    }

    let mut rows = Vec::new();
    for record in csv_reader.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    RawTable::new(headers, rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_url_uses_https_by_default() {
        let url = export_url("ecosis.org", "abc-123").unwrap();
        assert_eq!(url.as_str(), "https://ecosis.org/api/package/abc-123/export?metadata=true");
    }

    #[test]
    fn export_url_keeps_explicit_scheme() {
        let url = export_url("http://127.0.0.1:8080/", "xyz").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8080/api/package/xyz/export?metadata=true");
    }

    #[test]
    fn parses_header_and_rows() {
        let text = "\u{feff}Sample_ID,LMA,500,501\ns1,55.2,0.05,0.06\ns2,60.1,0.04,0.05\n";
        let table = parse_raw_table(text.as_bytes()).unwrap();
        assert_eq!(table.headers(), &["Sample_ID", "LMA", "500", "501"]);
        assert_eq!(table.num_rows(), 2);
        assert_eq!(table.rows()[1][1], "60.1");
        assert_eq!(table.column_index("501"), Some(3));
        assert_eq!(table.column_index("missing"), None);
    }

    #[test]
    fn empty_payload_is_a_schema_error() {
        let err = parse_raw_table("".as_bytes()).unwrap_err();
        assert!(err.is_schema(), "unexpected error: {}", err);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let text = "a,b\n1,2\n3\n";
        assert!(parse_raw_table(text.as_bytes()).is_err());
    }
}
