//! Least-squares solves for response-matrix alignment.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Singular values below this are treated as zero.
const SVD_EPS: f64 = 1e-10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LstsqError {
    #[error("System is underdetermined: {rows} equations for {cols} unknowns")]
    Underdetermined { rows: usize, cols: usize },

    #[error("Dimension mismatch: matrix has {rows} rows, right-hand side has {rhs}")]
    DimensionMismatch { rows: usize, rhs: usize },

    #[error("SVD solve failed: {0}")]
    SvdFailed(String),
}

/// Solve `a * x ≈ b` in the least-squares sense.
///
/// Requires at least as many equations as unknowns; an alignment correction
/// computed from fewer sensor readings than actuators is not meaningful.
///
/// # Arguments
/// * `a` - Response matrix, one row per sensor reading
/// * `b` - Target reading deltas
///
/// # Returns
/// * `Ok(x)` - Minimum-norm least-squares solution
pub fn solve_least_squares(a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>, LstsqError> {
    if a.nrows() != b.len() {
        return Err(LstsqError::DimensionMismatch {
            rows: a.nrows(),
            rhs: b.len(),
        });
    }
    if a.nrows() < a.ncols() {
        return Err(LstsqError::Underdetermined {
            rows: a.nrows(),
            cols: a.ncols(),
        });
    }

    let svd = a.clone().svd(true, true);
    svd.solve(b, SVD_EPS)
        .map_err(|e| LstsqError::SvdFailed(e.to_string()))
}

/// Root-mean-square of `a * x - b`.
pub fn residual_rms(a: &DMatrix<f64>, x: &DVector<f64>, b: &DVector<f64>) -> f64 {
    let residual = a * x - b;
    if residual.is_empty() {
        return 0.0;
    }
    (residual.norm_squared() / residual.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_exact_square_system() {
        let a = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 4.0]);
        let b = DVector::from_vec(vec![2.0, 2.0]);
        let x = solve_least_squares(&a, &b).unwrap();

        assert_relative_eq!(x[0], 1.0, epsilon = 1e-10);
        assert_relative_eq!(x[1], 0.5, epsilon = 1e-10);
        assert_relative_eq!(residual_rms(&a, &x, &b), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_overdetermined_fit() {
        // y = 2x fitted through noisy-free points along one unknown
        let a = DMatrix::from_row_slice(3, 1, &[1.0, 2.0, 3.0]);
        let b = DVector::from_vec(vec![2.0, 4.0, 6.0]);
        let x = solve_least_squares(&a, &b).unwrap();
        assert_relative_eq!(x[0], 2.0, epsilon = 1e-10);
    }

    #[test]
    fn test_underdetermined_rejected() {
        let a = DMatrix::from_row_slice(2, 6, &[0.0; 12]);
        let b = DVector::zeros(2);
        assert_eq!(
            solve_least_squares(&a, &b),
            Err(LstsqError::Underdetermined { rows: 2, cols: 6 })
        );
    }

    #[test]
    fn test_dimension_mismatch() {
        let a = DMatrix::from_row_slice(2, 1, &[1.0, 1.0]);
        let b = DVector::zeros(3);
        assert!(matches!(
            solve_least_squares(&a, &b),
            Err(LstsqError::DimensionMismatch { rows: 2, rhs: 3 })
        ));
    }
}
