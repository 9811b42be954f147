use crate::shape::Shape;

/// Errors raised by matrix operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MatrixError {
    #[error("Shape mismatch in {op}: {left} vs {right}")]
    ShapeMismatch {
        op: &'static str,
        left: Shape,
        right: Shape,
    },

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Position ({row}, {column}, {depth}) out of bounds for shape {shape}")]
    IndexOutOfBounds {
        row: usize,
        column: usize,
        depth: usize,
        shape: Shape,
    },

    #[error("Filter {filter} does not fit input {input}")]
    Filter { filter: Shape, input: Shape },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("{0} requires at least one matrix")]
    EmptyInput(&'static str),
}
