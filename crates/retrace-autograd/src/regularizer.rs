//! Penalties on trainable parameters.
//!
//! A [`Procedure`](crate::Procedure) calls [`Regularizer::forward`] once per
//! regularized parameter before the first sample of a forward pass, and
//! [`Regularizer::backward`] once after the last sample of a backward pass.
//! The penalty gradient is added to the parameter's mean gradient.

use std::fmt;

use retrace_core::Matrix;
use serde::{Deserialize, Serialize};

use crate::error::AutogradError;
use crate::Result;

/// A penalty term of the training objective.
pub trait Regularizer: fmt::Debug + Send {
    /// Observe a parameter before a forward pass.
    fn forward(&mut self, _parameter: &Matrix) -> Result<()> {
        Ok(())
    }

    /// Penalty contributed by `parameter`.
    fn error(&self, parameter: &Matrix) -> Result<f64>;

    /// Gradient of the penalty with respect to `parameter`.
    fn backward(&mut self, parameter: &Matrix) -> Result<Matrix>;

    fn name(&self) -> &'static str;
}

fn check_lambda(lambda: f64) -> Result<f64> {
    if !lambda.is_finite() || lambda < 0.0 {
        return Err(AutogradError::InvalidParameter(format!(
            "Regularization lambda must be finite and non-negative, got {lambda}."
        )));
    }
    Ok(lambda)
}

/// `λ · Σ|w|`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct L1 {
    lambda: f64,
}

impl L1 {
    pub fn new(lambda: f64) -> Result<Self> {
        Ok(Self {
            lambda: check_lambda(lambda)?,
        })
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }
}

impl Default for L1 {
    fn default() -> Self {
        Self { lambda: 0.01 }
    }
}

impl Regularizer for L1 {
    fn error(&self, parameter: &Matrix) -> Result<f64> {
        Ok(self.lambda * parameter.abs().sum_value())
    }

    fn backward(&mut self, parameter: &Matrix) -> Result<Matrix> {
        Ok(parameter.sign().mul_scalar(self.lambda))
    }

    fn name(&self) -> &'static str {
        "L1_REGULARIZATION"
    }
}

/// `λ · Σw²`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct L2 {
    lambda: f64,
}

impl L2 {
    pub fn new(lambda: f64) -> Result<Self> {
        Ok(Self {
            lambda: check_lambda(lambda)?,
        })
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }
}

impl Default for L2 {
    fn default() -> Self {
        Self { lambda: 0.01 }
    }
}

impl Regularizer for L2 {
    fn error(&self, parameter: &Matrix) -> Result<f64> {
        Ok(self.lambda * parameter.power(2.0).sum_value())
    }

    fn backward(&mut self, parameter: &Matrix) -> Result<Matrix> {
        Ok(parameter.mul_scalar(2.0 * self.lambda))
    }

    fn name(&self) -> &'static str {
        "L2_REGULARIZATION"
    }
}
