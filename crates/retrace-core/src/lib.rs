//! # retrace-core
//!
//! Dense matrix capability for the retrace autodiff engine.
//!
//! Provides the `Matrix` type consumed by `retrace-autograd`:
//! - Stable allocation identity (`MatrixId`) shared by clones of a handle
//! - Element-wise arithmetic with scalar broadcast
//! - Dot product, transpose, join/unjoin, flatten
//! - Convolution and cross-correlation with stride and dilation
//! - Max, average, cyclic and random pooling with a position side channel
//! - Reductions (sum, mean, variance, standard deviation, p-norm)
//! - Unary and binary functions paired with their derivatives

pub mod error;
pub mod function;
pub mod matrix;
pub mod ops;
pub mod prelude;
pub mod shape;

pub use error::MatrixError;
pub use function::{BinaryFunction, UnaryFunction};
pub use matrix::{Matrix, MatrixId};
pub use ops::convolution::ConvolutionParams;
pub use ops::manipulation::JoinAxis;
pub use ops::pool::{PoolParams, PoolPositions};
pub use shape::Shape;

pub type Result<T> = std::result::Result<T, MatrixError>;
