//! Convenience re-exports for downstream crates.

pub use crate::error::MatrixError;
pub use crate::function::{BinaryFunction, UnaryFunction};
pub use crate::matrix::{Matrix, MatrixId};
pub use crate::ops::convolution::ConvolutionParams;
pub use crate::ops::manipulation::JoinAxis;
pub use crate::ops::pool::{PoolParams, PoolPositions};
pub use crate::shape::Shape;
pub use crate::Result;
