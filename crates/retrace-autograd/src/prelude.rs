//! Convenience re-exports for code defining forward procedures.

pub use crate::config::{FactoryConfig, LockMode};
pub use crate::error::AutogradError;
pub use crate::expression::{Operation, ReductionMode};
pub use crate::factory::{ForwardProcedure, ProcedureFactory, TraceSession};
pub use crate::procedure::{ExecutionMode, Procedure, Sample, Sequence};
pub use crate::regularizer::{Regularizer, L1, L2};
pub use crate::Result;
pub use retrace_core::prelude::*;
