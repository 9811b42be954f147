use std::fmt;

use serde::{Deserialize, Serialize};

/// Matrix shape: rows × columns × depth.
///
/// Depth slices are stored one after another, each slice row-major.
/// A `1×1×1` shape is a scalar and broadcasts against any other shape.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    rows: usize,
    columns: usize,
    depth: usize,
}

impl Shape {
    /// Two-dimensional shape with depth 1.
    pub const fn new(rows: usize, columns: usize) -> Self {
        Self {
            rows,
            columns,
            depth: 1,
        }
    }

    /// Three-dimensional shape.
    pub const fn new_3d(rows: usize, columns: usize, depth: usize) -> Self {
        Self {
            rows,
            columns,
            depth,
        }
    }

    /// Scalar shape (1×1×1).
    pub const fn scalar() -> Self {
        Self::new(1, 1)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Dimension sizes as `[rows, columns, depth]`.
    pub fn dims(&self) -> [usize; 3] {
        [self.rows, self.columns, self.depth]
    }

    /// Total number of elements.
    pub fn size(&self) -> usize {
        self.rows * self.columns * self.depth
    }

    /// Number of elements in one depth slice.
    pub fn slice_size(&self) -> usize {
        self.rows * self.columns
    }

    /// Whether this shape holds exactly one element.
    pub fn is_scalar(&self) -> bool {
        self.size() == 1
    }

    /// Whether the shape has no elements at all.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Flat offset of `(row, column, depth)` in storage order.
    pub fn offset(&self, row: usize, column: usize, depth: usize) -> usize {
        (depth * self.rows + row) * self.columns + column
    }

    /// Whether `(row, column, depth)` lies inside this shape.
    pub fn contains(&self, row: usize, column: usize, depth: usize) -> bool {
        row < self.rows && column < self.columns && depth < self.depth
    }

    /// Broadcast this shape with another.
    /// Equal shapes broadcast to themselves and a scalar broadcasts to the other
    /// shape; anything else is incompatible.
    pub fn broadcast_with(&self, other: &Shape) -> Option<Shape> {
        if self == other {
            Some(*self)
        } else if other.is_scalar() {
            Some(*self)
        } else if self.is_scalar() {
            Some(*other)
        } else {
            None
        }
    }

    /// Shape with rows and columns swapped.
    pub fn transpose(&self) -> Shape {
        Shape::new_3d(self.columns, self.rows, self.depth)
    }

    /// Shape of the column vector holding every element.
    pub fn flattened(&self) -> Shape {
        Shape::new(self.size(), 1)
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({}, {}, {})", self.rows, self.columns, self.depth)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.depth == 1 {
            write!(f, "[{}x{}]", self.rows, self.columns)
        } else {
            write!(f, "[{}x{}x{}]", self.rows, self.columns, self.depth)
        }
    }
}

impl From<(usize, usize)> for Shape {
    fn from((rows, columns): (usize, usize)) -> Self {
        Shape::new(rows, columns)
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((rows, columns, depth): (usize, usize, usize)) -> Self {
        Shape::new_3d(rows, columns, depth)
    }
}

macro_rules! impl_shape_from_array {
    ($n:expr, |$dims:ident| $build:expr) => {
        impl From<[usize; $n]> for Shape {
            fn from($dims: [usize; $n]) -> Self {
                $build
            }
        }
    };
}

impl_shape_from_array!(1, |dims| Shape::new(dims[0], 1));
impl_shape_from_array!(2, |dims| Shape::new(dims[0], dims[1]));
impl_shape_from_array!(3, |dims| Shape::new_3d(dims[0], dims[1], dims[2]));
