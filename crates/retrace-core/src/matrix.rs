use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use rand::Rng;

use crate::error::MatrixError;
use crate::shape::Shape;
use crate::Result;

static NEXT_MATRIX_ID: AtomicUsize = AtomicUsize::new(0);

/// Identity of one matrix allocation.
///
/// Every handle cloned from the same allocation reports the same id, so the id
/// identifies *which* matrix a value came from, never *what* it contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatrixId(usize);

impl MatrixId {
    fn next() -> Self {
        MatrixId(NEXT_MATRIX_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for MatrixId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M{}", self.0)
    }
}

/// A dense `f64` matrix handle.
///
/// Cloning a `Matrix` yields another handle to the same allocation: both share
/// storage and identity, so an in-place update through one handle (`assign`,
/// `update`, `set`) is visible through the other. Every operation that computes
/// a new value returns a fresh allocation with a fresh identity.
///
/// # Examples
///
/// ```
/// use retrace_core::Matrix;
///
/// let a = Matrix::from_rows(&[&[1.0, 2.0], &[3.0, 4.0]]).unwrap();
/// let b = a.clone();
/// assert_eq!(a.id(), b.id());
///
/// let c = a.add(&b).unwrap();
/// assert_ne!(c.id(), a.id());
/// assert_eq!(c.to_vec(), vec![2.0, 4.0, 6.0, 8.0]);
/// ```
#[derive(Clone)]
pub struct Matrix {
    id: MatrixId,
    shape: Shape,
    data: Arc<RwLock<Vec<f64>>>,
}

impl Matrix {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Build a matrix from raw data laid out depth slice by depth slice.
    pub fn from_vec(data: Vec<f64>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if shape.size() != data.len() {
            return Err(MatrixError::InvalidShape(format!(
                "{} requires {} elements, got {}",
                shape,
                shape.size(),
                data.len()
            )));
        }
        Ok(Self::from_parts(data, shape))
    }

    /// Build a two-dimensional matrix from row slices.
    pub fn from_rows(rows: &[&[f64]]) -> Result<Self> {
        let columns = rows.first().map_or(0, |row| row.len());
        if rows.iter().any(|row| row.len() != columns) {
            return Err(MatrixError::InvalidShape(
                "rows have differing lengths".to_string(),
            ));
        }
        let data = rows.iter().flat_map(|row| row.iter().copied()).collect();
        Self::from_vec(data, Shape::new(rows.len(), columns))
    }

    /// Column vector from values.
    pub fn column(values: &[f64]) -> Self {
        Self::from_parts(values.to_vec(), Shape::new(values.len(), 1))
    }

    /// Zero `rows × columns` matrix.
    pub fn new(rows: usize, columns: usize) -> Self {
        Self::zeros(Shape::new(rows, columns))
    }

    pub fn new_3d(rows: usize, columns: usize, depth: usize) -> Self {
        Self::zeros(Shape::new_3d(rows, columns, depth))
    }

    /// Matrix of zeros.
    pub fn zeros(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        Self::from_parts(vec![0.0; shape.size()], shape)
    }

    /// Matrix with every element set to `value`.
    pub fn filled(shape: impl Into<Shape>, value: f64) -> Self {
        let shape = shape.into();
        Self::from_parts(vec![value; shape.size()], shape)
    }

    /// Scalar (1×1×1) matrix.
    pub fn scalar(value: f64) -> Self {
        Self::from_parts(vec![value], Shape::scalar())
    }

    /// Zero matrix with the same shape as `self` and a new identity.
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.shape)
    }

    /// Matrix sampled from the standard normal distribution N(0, 1).
    pub fn randn(shape: impl Into<Shape>) -> Self {
        Self::randn_with(shape, &mut rand::thread_rng())
    }

    /// Matrix sampled from N(0, 1) using the given generator.
    pub fn randn_with<R: Rng + ?Sized>(shape: impl Into<Shape>, rng: &mut R) -> Self {
        let shape = shape.into();
        // Box-Muller transform
        let data = (0..shape.size())
            .map(|_| {
                let u1: f64 = rng.gen_range(1e-12..1.0);
                let u2: f64 = rng.gen_range(0.0..std::f64::consts::TAU);
                (-2.0 * u1.ln()).sqrt() * u2.cos()
            })
            .collect();
        Self::from_parts(data, shape)
    }

    /// Matrix sampled uniformly from `[low, high)`.
    pub fn rand_uniform(shape: impl Into<Shape>, low: f64, high: f64) -> Self {
        Self::rand_uniform_with(shape, low, high, &mut rand::thread_rng())
    }

    /// Matrix sampled uniformly from `[low, high)` using the given generator.
    pub fn rand_uniform_with<R: Rng + ?Sized>(
        shape: impl Into<Shape>,
        low: f64,
        high: f64,
        rng: &mut R,
    ) -> Self {
        let shape = shape.into();
        let data = (0..shape.size()).map(|_| rng.gen_range(low..high)).collect();
        Self::from_parts(data, shape)
    }

    pub(crate) fn from_parts(data: Vec<f64>, shape: Shape) -> Self {
        debug_assert_eq!(data.len(), shape.size());
        Self {
            id: MatrixId::next(),
            shape,
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Copy values into a new allocation with a new identity.
    pub fn deep_copy(&self) -> Self {
        Self::from_parts(self.to_vec(), self.shape)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> MatrixId {
        self.id
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn rows(&self) -> usize {
        self.shape.rows()
    }

    pub fn columns(&self) -> usize {
        self.shape.columns()
    }

    pub fn depth(&self) -> usize {
        self.shape.depth()
    }

    pub fn size(&self) -> usize {
        self.shape.size()
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_scalar()
    }

    /// Whether both handles point at the same allocation.
    pub fn same_allocation(&self, other: &Matrix) -> bool {
        self.id == other.id
    }

    /// Value at `(row, column)` of the first depth slice.
    ///
    /// # Panics
    /// Panics if the position is out of bounds.
    pub fn get(&self, row: usize, column: usize) -> f64 {
        self.get_3d(row, column, 0)
    }

    /// Value at `(row, column, depth)`.
    ///
    /// # Panics
    /// Panics if the position is out of bounds.
    pub fn get_3d(&self, row: usize, column: usize, depth: usize) -> f64 {
        assert!(
            self.shape.contains(row, column, depth),
            "({row}, {column}, {depth}) out of bounds for {}",
            self.shape
        );
        self.read()[self.shape.offset(row, column, depth)]
    }

    /// Value of a scalar matrix, or the first element otherwise.
    pub fn value(&self) -> f64 {
        self.read().first().copied().unwrap_or(0.0)
    }

    /// Copy of the underlying data.
    pub fn to_vec(&self) -> Vec<f64> {
        self.read().clone()
    }

    /// Run `f` with read access to the underlying data.
    pub fn with_data<R>(&self, f: impl FnOnce(&[f64]) -> R) -> R {
        f(&self.read())
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<f64>> {
        self.data.read_recursive()
    }

    // =========================================================================
    // In-place updates (visible through every handle)
    // =========================================================================

    /// Set the value at `(row, column, depth)`.
    pub fn set(&self, row: usize, column: usize, depth: usize, value: f64) -> Result<()> {
        if !self.shape.contains(row, column, depth) {
            return Err(MatrixError::IndexOutOfBounds {
                row,
                column,
                depth,
                shape: self.shape,
            });
        }
        self.data.write()[self.shape.offset(row, column, depth)] = value;
        Ok(())
    }

    /// Overwrite this allocation with the values of `other`.
    pub fn assign(&self, other: &Matrix) -> Result<()> {
        if self.same_allocation(other) {
            return Ok(());
        }
        if self.shape != other.shape {
            return Err(MatrixError::ShapeMismatch {
                op: "assign",
                left: self.shape,
                right: other.shape,
            });
        }
        let values = other.to_vec();
        self.data.write().copy_from_slice(&values);
        Ok(())
    }

    /// Mutate the underlying data in place.
    pub fn update(&self, f: impl FnOnce(&mut [f64])) {
        f(&mut self.data.write());
    }

    /// Largest absolute element-wise difference to `other`.
    pub fn max_abs_diff(&self, other: &Matrix) -> Result<f64> {
        if self.shape != other.shape {
            return Err(MatrixError::ShapeMismatch {
                op: "max_abs_diff",
                left: self.shape,
                right: other.shape,
            });
        }
        let a = self.read();
        let b = other.read();
        Ok(a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f64::max))
    }
}

impl fmt::Debug for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.read();
        write!(f, "Matrix({}, shape={}, ", self.id, self.shape)?;
        if data.len() <= 16 {
            write!(f, "data={:?})", data.as_slice())
        } else {
            write!(f, "data=[{:?}, ... {} more])", &data[..8], data.len() - 8)
        }
    }
}

impl fmt::Display for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.read();
        for depth in 0..self.depth() {
            if self.depth() > 1 {
                writeln!(f, "depth {depth}:")?;
            }
            for row in 0..self.rows() {
                let start = self.shape.offset(row, 0, depth);
                let values: Vec<String> = data[start..start + self.columns()]
                    .iter()
                    .map(|v| format!("{v:.4}"))
                    .collect();
                writeln!(f, "[{}]", values.join(", "))?;
            }
        }
        Ok(())
    }
}
