// src/linalg_backends.rs

#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider<F: 'static + Copy + Send + Sync> {
    _phantom: PhantomData<F>,
}

impl<F: 'static + Copy + Send + Sync> LinAlgBackendProvider<F> {
    pub fn new() -> Self {
        Self { _phantom: PhantomData }
    }
}

use ndarray::{Array1, Array2};
use std::error::Error;
use std::marker::PhantomData;

// --- Trait Definitions ---

/// Trait for solving a triangular system, used where the structure is known in advance
/// (e.g. the `P^T W` matrix of a NIPALS fit is upper triangular).
pub trait BackendTriangularSolve<F: 'static + Copy + Send + Sync> {
    fn solve_upper_triangular(&self, matrix: &Array2<F>, rhs: &Array1<F>) -> Result<Array1<F>, Box<dyn Error + Send + Sync>>;
}

// --- NdarrayLinAlgBackend Implementation ---
use ndarray_linalg::{Diag, SolveTriangular as NdLinalgSolveTriangular, UPLO};

#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

// Helper to convert ndarray-linalg's error to Box<dyn Error + Send + Sync>
fn to_dyn_error<E: Error + Send + Sync + 'static>(e: E) -> Box<dyn Error + Send + Sync> {
    Box::new(e)
}

impl BackendTriangularSolve<f64> for NdarrayLinAlgBackend {
    fn solve_upper_triangular(&self, matrix: &Array2<f64>, rhs: &Array1<f64>) -> Result<Array1<f64>, Box<dyn Error + Send + Sync>> {
        if matrix.nrows() != matrix.ncols() || matrix.nrows() != rhs.len() {
            return Err(format!(
                "solve_upper_triangular expects a square system, got {:?} with rhs of length {}",
                matrix.dim(),
                rhs.len()
            )
            .into());
        }
        // LAPACK's trtrs does not report near-singular diagonals, so check them here.
        let max_abs_diag = matrix.diag().iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
        if matrix.diag().iter().any(|v| !v.is_finite() || v.abs() <= 1e-12 * max_abs_diag.max(1.0)) {
            return Err("upper triangular system is singular to working precision".into());
        }
        matrix
            .solve_triangular(UPLO::Upper, Diag::NonUnit, rhs)
            .map_err(to_dyn_error)
    }
}

// --- LinAlgBackendProvider Dispatch ---

impl<F> BackendTriangularSolve<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendTriangularSolve<F>,
{
    fn solve_upper_triangular(&self, matrix: &Array2<F>, rhs: &Array1<F>) -> Result<Array1<F>, Box<dyn Error + Send + Sync>> {
        NdarrayLinAlgBackend.solve_upper_triangular(matrix, rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn solves_upper_triangular_system() {
        let backend = LinAlgBackendProvider::<f64>::new();
        let a = array![[2.0, 1.0, 0.5], [0.0, 1.0, 3.0], [0.0, 0.0, 4.0]];
        let b = array![6.0, 10.0, 8.0];
        let x = backend.solve_upper_triangular(&a, &b).unwrap();
        let back = a.dot(&x);
        for (lhs, rhs) in back.iter().zip(b.iter()) {
            assert_abs_diff_eq!(*lhs, *rhs, epsilon = 1e-12);
        }
    }

    #[test]
    fn rejects_singular_triangular_system() {
        let backend = LinAlgBackendProvider::<f64>::new();
        let a = array![[1.0, 2.0], [0.0, 0.0]];
        let b = array![1.0, 1.0];
        assert!(backend.solve_upper_triangular(&a, &b).is_err());
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let backend = LinAlgBackendProvider::<f64>::new();
        let a = array![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let b = array![1.0, 1.0];
        assert!(backend.solve_upper_triangular(&a, &b).is_err());
        let square = array![[1.0, 0.0], [0.0, 1.0]];
        assert!(backend.solve_upper_triangular(&square, &array![1.0, 2.0, 3.0]).is_err());
    }
}
