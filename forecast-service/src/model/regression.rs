//! Multiple linear regression by ordinary least squares.
//!
//! The normal equations `(XᵀX) β = Xᵀy` are solved by inverting `XᵀX` with
//! Gauss-Jordan elimination and partial pivoting. Feature counts here are
//! tiny (a handful of columns), so the explicit inverse is cheap.

use serde::Serialize;

const SINGULAR_EPSILON: f64 = 1e-10;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("X and y must have the same length: {x} != {y}")]
    LengthMismatch { x: usize, y: usize },
    #[error("training data must not be empty")]
    Empty,
    #[error("feature count mismatch: expected {expected}, got {got}")]
    FeatureMismatch { expected: usize, got: usize },
    #[error("matrix is singular")]
    Singular,
    #[error("model must be fitted before use")]
    NotFitted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinearRegression {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
    fitted: bool,
}

impl LinearRegression {
    pub fn new() -> Self {
        Self::default()
    }

    /// Model with known parameters, e.g. the fallback formula.
    pub fn from_parameters(intercept: f64, coefficients: Vec<f64>) -> Self {
        Self {
            intercept,
            coefficients,
            fitted: true,
        }
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted
    }

    pub fn n_features(&self) -> usize {
        self.coefficients.len()
    }

    pub fn fit(&mut self, x: &[Vec<f64>], y: &[f64]) -> Result<(), ModelError> {
        if x.len() != y.len() {
            return Err(ModelError::LengthMismatch { x: x.len(), y: y.len() });
        }
        if x.is_empty() {
            return Err(ModelError::Empty);
        }

        let n_features = x[0].len();
        if let Some(row) = x.iter().find(|r| r.len() != n_features) {
            return Err(ModelError::FeatureMismatch {
                expected: n_features,
                got: row.len(),
            });
        }

        // Design matrix with a leading column of ones for the intercept.
        let design: Vec<Vec<f64>> = x
            .iter()
            .map(|row| std::iter::once(1.0).chain(row.iter().copied()).collect())
            .collect();

        let xtx = transpose_mul(&design, &design);
        let xty = transpose_mul_vec(&design, y);
        let inverse = invert(xtx)?;
        let beta = mul_vec(&inverse, &xty);

        self.intercept = beta[0];
        self.coefficients = beta[1..].to_vec();
        self.fitted = true;

        tracing::debug!(intercept = self.intercept, coefficients = ?self.coefficients, "regression fitted");
        Ok(())
    }

    pub fn predict_one(&self, row: &[f64]) -> Result<f64, ModelError> {
        if !self.fitted {
            return Err(ModelError::NotFitted);
        }
        if row.len() != self.coefficients.len() {
            return Err(ModelError::FeatureMismatch {
                expected: self.coefficients.len(),
                got: row.len(),
            });
        }

        Ok(self.intercept
            + self
                .coefficients
                .iter()
                .zip(row)
                .map(|(c, v)| c * v)
                .sum::<f64>())
    }

    pub fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
        x.iter().map(|row| self.predict_one(row)).collect()
    }

    /// Coefficient of determination, `1 - SS_res / SS_tot`.
    ///
    /// A constant target (`SS_tot == 0`) scores 0.
    pub fn score(&self, x: &[Vec<f64>], y: &[f64]) -> Result<f64, ModelError> {
        if x.len() != y.len() {
            return Err(ModelError::LengthMismatch { x: x.len(), y: y.len() });
        }
        if y.is_empty() {
            return Err(ModelError::Empty);
        }

        let predictions = self.predict(x)?;
        let mean = y.iter().sum::<f64>() / y.len() as f64;
        let ss_tot: f64 = y.iter().map(|v| (v - mean).powi(2)).sum();
        let ss_res: f64 = y.iter().zip(&predictions).map(|(v, p)| (v - p).powi(2)).sum();

        if ss_tot == 0.0 {
            return Ok(0.0);
        }
        Ok(1.0 - ss_res / ss_tot)
    }
}

/// `Aᵀ B` for row-major matrices with equal row counts.
fn transpose_mul(a: &[Vec<f64>], b: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = a[0].len();
    let m = b[0].len();
    let mut out = vec![vec![0.0; m]; n];

    for (ra, rb) in a.iter().zip(b) {
        for i in 0..n {
            for j in 0..m {
                out[i][j] += ra[i] * rb[j];
            }
        }
    }
    out
}

/// `Aᵀ v`.
fn transpose_mul_vec(a: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
    let n = a[0].len();
    let mut out = vec![0.0; n];

    for (row, &vk) in a.iter().zip(v) {
        for i in 0..n {
            out[i] += row[i] * vk;
        }
    }
    out
}

/// `A v`.
fn mul_vec(a: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
    a.iter()
        .map(|row| row.iter().zip(v).map(|(x, y)| x * y).sum())
        .collect()
}

/// Gauss-Jordan inverse of a square matrix: `[A | I] -> [I | A⁻¹]`.
fn invert(matrix: Vec<Vec<f64>>) -> Result<Vec<Vec<f64>>, ModelError> {
    let n = matrix.len();
    let mut aug: Vec<Vec<f64>> = matrix
        .into_iter()
        .enumerate()
        .map(|(i, mut row)| {
            row.extend((0..n).map(|j| if i == j { 1.0 } else { 0.0 }));
            row
        })
        .collect();

    for col in 0..n {
        let pivot_row = (col..n)
            .max_by(|&a, &b| aug[a][col].abs().total_cmp(&aug[b][col].abs()))
            .unwrap_or(col);
        aug.swap(col, pivot_row);

        let pivot = aug[col][col];
        if pivot.abs() < SINGULAR_EPSILON {
            return Err(ModelError::Singular);
        }

        for v in aug[col].iter_mut() {
            *v /= pivot;
        }

        let pivot_values = aug[col].clone();
        for (r, row) in aug.iter_mut().enumerate() {
            if r == col {
                continue;
            }
            let factor = row[col];
            if factor == 0.0 {
                continue;
            }
            for (v, p) in row.iter_mut().zip(&pivot_values) {
                *v -= factor * p;
            }
        }
    }

    Ok(aug.into_iter().map(|row| row[n..].to_vec()).collect())
}
