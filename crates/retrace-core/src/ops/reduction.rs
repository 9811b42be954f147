//! Reductions: sum, mean, variance, standard deviation, p-norm.
//!
//! Single-matrix reductions return a scalar matrix. The `*_of` variants reduce a
//! set of equally shaped matrices element-wise into one matrix of that shape.

use rayon::prelude::*;

use crate::error::MatrixError;
use crate::matrix::Matrix;
use crate::ops::arithmetic::PAR_THRESHOLD;
use crate::shape::Shape;
use crate::Result;

impl Matrix {
    /// Sum of all elements.
    pub fn sum_value(&self) -> f64 {
        let data = self.read();
        if data.len() >= PAR_THRESHOLD {
            data.par_iter().sum()
        } else {
            data.iter().sum()
        }
    }

    /// Sum of all elements as a scalar matrix.
    pub fn sum(&self) -> Matrix {
        Matrix::scalar(self.sum_value())
    }

    /// Mean of all elements.
    pub fn mean_value(&self) -> f64 {
        if self.size() == 0 {
            return 0.0;
        }
        self.sum_value() / self.size() as f64
    }

    /// Mean of all elements as a scalar matrix.
    pub fn mean(&self) -> Matrix {
        Matrix::scalar(self.mean_value())
    }

    /// Population variance around `mean` as a scalar matrix.
    pub fn variance(&self, mean: f64) -> Matrix {
        Matrix::scalar(self.variance_value(mean))
    }

    fn variance_value(&self, mean: f64) -> f64 {
        if self.size() == 0 {
            return 0.0;
        }
        let data = self.read();
        data.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / data.len() as f64
    }

    /// Population standard deviation around `mean` as a scalar matrix.
    pub fn standard_deviation(&self, mean: f64) -> Matrix {
        Matrix::scalar(self.variance_value(mean).sqrt())
    }

    /// p-norm `(Σ|x|^p)^(1/p)` as a scalar matrix.
    pub fn norm(&self, p: f64) -> Result<Matrix> {
        if p < 1.0 {
            return Err(MatrixError::InvalidParameter(format!(
                "norm requires p >= 1, got {p}"
            )));
        }
        let data = self.read();
        let total: f64 = data.iter().map(|x| x.abs().powf(p)).sum();
        Ok(Matrix::scalar(total.powf(1.0 / p)))
    }

    // =========================================================================
    // Element-wise reductions across matrices
    // =========================================================================

    /// Element-wise sum over `matrices`.
    pub fn sum_of(matrices: &[Matrix]) -> Result<Matrix> {
        fold_of(matrices, "sum_of", |acc, values| {
            for (a, v) in acc.iter_mut().zip(values) {
                *a += v;
            }
        })
    }

    /// Element-wise mean over `matrices`.
    pub fn mean_of(matrices: &[Matrix]) -> Result<Matrix> {
        let sum = Self::sum_of(matrices)?;
        Ok(sum.mul_scalar(1.0 / matrices.len() as f64))
    }

    /// Element-wise population variance over `matrices` around `mean`.
    pub fn variance_of(matrices: &[Matrix], mean: &Matrix) -> Result<Matrix> {
        let mean_values = mean.to_vec();
        let count = matrices.len() as f64;
        let squares = fold_of(matrices, "variance_of", |acc, values| {
            for ((a, v), m) in acc.iter_mut().zip(values).zip(&mean_values) {
                *a += (v - m) * (v - m);
            }
        })?;
        if squares.shape() != mean.shape() {
            return Err(MatrixError::ShapeMismatch {
                op: "variance_of",
                left: squares.shape(),
                right: mean.shape(),
            });
        }
        Ok(squares.mul_scalar(1.0 / count))
    }

    /// Element-wise p-norm over `matrices`.
    pub fn norm_of(matrices: &[Matrix], p: f64) -> Result<Matrix> {
        let powered = fold_of(matrices, "norm_of", |acc, values| {
            for (a, v) in acc.iter_mut().zip(values) {
                *a += v.abs().powf(p);
            }
        })?;
        Ok(powered.apply(|x| x.powf(1.0 / p)))
    }
}

fn fold_of(
    matrices: &[Matrix],
    op: &'static str,
    mut step: impl FnMut(&mut [f64], &[f64]),
) -> Result<Matrix> {
    let first = matrices.first().ok_or(MatrixError::EmptyInput(op))?;
    let shape: Shape = first.shape();
    let mut acc = vec![0.0; shape.size()];
    for matrix in matrices {
        if matrix.shape() != shape {
            return Err(MatrixError::ShapeMismatch {
                op,
                left: shape,
                right: matrix.shape(),
            });
        }
        matrix.with_data(|values| step(&mut acc, values));
    }
    Ok(Matrix::from_parts(acc, shape))
}
