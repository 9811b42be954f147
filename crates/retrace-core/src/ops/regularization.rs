//! Dropout masks and gradient clipping.

use rand::Rng;

use crate::error::MatrixError;
use crate::matrix::Matrix;
use crate::shape::Shape;
use crate::Result;

impl Matrix {
    /// Inverted-dropout mask: each cell is dropped with `probability`, kept
    /// cells carry `1 / (1 - probability)` so the expected value is unchanged.
    pub fn dropout_mask<R: Rng + ?Sized>(shape: impl Into<Shape>, probability: f64, rng: &mut R) -> Result<Matrix> {
        if !(0.0..=1.0).contains(&probability) {
            return Err(MatrixError::InvalidParameter(format!(
                "Probability must be between 0 and 1, got {probability}"
            )));
        }
        let shape = shape.into();
        if probability >= 1.0 {
            return Ok(Matrix::zeros(shape));
        }
        let scale = 1.0 / (1.0 - probability);
        let data = (0..shape.size())
            .map(|_| if rng.gen::<f64>() < probability { 0.0 } else { scale })
            .collect();
        Ok(Matrix::from_parts(data, shape))
    }

    /// Clamp every element to `[-threshold, threshold]`.
    pub fn clip(&self, threshold: f64) -> Result<Matrix> {
        if threshold.is_nan() || threshold <= 0.0 {
            return Err(MatrixError::InvalidParameter(format!(
                "clipping threshold must be positive, got {threshold}"
            )));
        }
        Ok(self.apply(|v| v.clamp(-threshold, threshold)))
    }
}
