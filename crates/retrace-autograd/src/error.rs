use retrace_core::{MatrixError, MatrixId, Shape};

use crate::factory::ExpressionLock;
use crate::node::NodeId;

/// Failure raised while building or running a procedure.
#[derive(Debug, thiserror::Error)]
pub enum AutogradError {
    /// A matrix kernel rejected its operands.
    #[error(transparent)]
    Matrix(#[from] MatrixError),

    /// A forward step ran before its argument values were populated.
    #[error("{expression}: Arguments for operation not defined at index {index}")]
    MissingArgument { expression: &'static str, index: usize },

    /// A backward step ran before the result gradient was populated.
    #[error("{expression}: Result gradient not defined at index {index}")]
    MissingGradient { expression: &'static str, index: usize },

    /// Pool positions recorded by the forward step are gone.
    #[error("{expression}: Maximum positions for gradient calculation are not defined at index {index}")]
    MissingPoolPositions { expression: &'static str, index: usize },

    /// Another expression holds the construction lock.
    #[error("Procedure factory is reserved by: {holder}")]
    Reserved { holder: ExpressionLock },

    /// A lock that does not own the ongoing expression was presented.
    #[error("Expression lock {given} does not own the ongoing expression")]
    LockMismatch { given: ExpressionLock },

    /// Gradient lookup for a matrix the procedure does not know.
    #[error("No such reference matrix registered: {0}")]
    UnregisteredMatrix(MatrixId),

    /// A declared parameter or constant was never referenced while tracing.
    #[error("Parameter matrix {0} is not referenced by the traced procedure")]
    UntracedParameter(MatrixId),

    /// Recurrent state changes shape across the unroll.
    #[error("Cross-step dependency from {from} {from_shape} to {to} {to_shape} has mismatched shapes")]
    DependencyShapeMismatch {
        from: NodeId,
        to: NodeId,
        from_shape: Shape,
        to_shape: Shape,
    },

    /// The two traces of a definition diverged.
    #[error("Traces of the forward procedure diverge: {0}")]
    TraceMismatch(String),

    #[error("No input node at position {0}")]
    MissingInput(usize),

    #[error("No output node at position {0}")]
    MissingOutput(usize),

    #[error("Forward procedure produced no outputs")]
    NoOutputs,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("No such node: {0}")]
    NoSuchNode(NodeId),
}
