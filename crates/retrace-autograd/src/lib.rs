//! # retrace-autograd
//!
//! Trace-based automatic differentiation engine for retrace.
//!
//! Provides a dynamic, replayable computation graph with:
//! - `Node` slots holding per-sample values and accumulated gradients
//! - `NodeRegister` identity-keyed deduplication of traced matrices
//! - The `Expression` family: 24 operators with forward and local gradient rules
//! - `ProcedureFactory` tracing a definition twice to discover cross-step
//!   (recurrent) dependencies from matrix identity alone
//! - `Procedure` runtime with per-sample and per-step execution and
//!   truncated backpropagation through time
//! - `Regularizer` penalties on trainable parameters

pub mod config;
pub mod error;
pub mod expression;
pub mod factory;
pub mod node;
pub mod prelude;
pub mod procedure;
pub mod register;
pub mod regularizer;

pub use config::{FactoryConfig, LockMode};
pub use error::AutogradError;
pub use expression::{Expression, ExpressionId, Operation, ReductionMode};
pub use factory::{ExpressionLock, ForwardProcedure, ProcedureFactory, TraceSession};
pub use node::{Node, NodeArena, NodeId};
pub use procedure::{ExecutionMode, Procedure, Sample, Sequence};
pub use register::NodeRegister;
pub use regularizer::{Regularizer, L1, L2};

pub type Result<T> = std::result::Result<T, AutogradError>;
