use std::fmt;

use crate::error::{Error, Result};

// Shape - N-dimensional size descriptor with an explicit batch placeholder
//
// Graph nodes are declared before any data exists, so the leading "batch"
// dimension of instance inputs cannot be known at definition time. Instead of
// a magic negative number, a dimension is either:
//
//   Dim::Fixed(n)  - known at definition time
//   Dim::Batch     - the batch placeholder, bound once per batch
//
// Examples:
//   [?, 4]    - a batch of 4-feature rows (placeholder at axis 0)
//   [4, 8]    - an embedding table, fully concrete
//   [1]       - a single element
//
// The placeholder is only legal at axis 0; graphs reject other positions when
// a node is added. Resolving a shape against a concrete batch size yields the
// dims used to size dense tensors.

/// Largest element count a concrete shape may describe.
pub const MAX_TOTAL_DIM: usize = i32::MAX as usize;

/// A single dimension: concrete, or the batch placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dim {
    Fixed(usize),
    Batch,
}

impl Dim {
    pub fn is_batch(&self) -> bool {
        matches!(self, Dim::Batch)
    }

    /// The concrete value, or `None` for the placeholder.
    pub fn fixed(&self) -> Option<usize> {
        match self {
            Dim::Fixed(n) => Some(*n),
            Dim::Batch => None,
        }
    }

    /// Substitute `batch` for the placeholder.
    pub fn resolve(&self, batch: usize) -> usize {
        match self {
            Dim::Fixed(n) => *n,
            Dim::Batch => batch,
        }
    }

    /// Does a concrete value fit this dimension?
    ///
    /// The placeholder matches anything until a batch size is bound.
    pub fn matches(&self, value: usize, batch: Option<usize>) -> bool {
        match self {
            Dim::Fixed(n) => value == *n,
            Dim::Batch => batch.map_or(true, |b| b == value),
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(n) => write!(f, "{n}"),
            Dim::Batch => write!(f, "?"),
        }
    }
}

impl From<usize> for Dim {
    fn from(n: usize) -> Self {
        Dim::Fixed(n)
    }
}

/// Checked product of concrete dims, bounded by [`MAX_TOTAL_DIM`].
pub fn checked_total(dims: &[usize]) -> Result<usize> {
    let mut total = 1usize;
    for &d in dims {
        total = total
            .checked_mul(d)
            .filter(|&t| t <= MAX_TOTAL_DIM)
            .ok_or_else(|| Error::msg(format!("too many elements for dims {dims:?}")))?;
    }
    Ok(total)
}

/// N-dimensional shape of a graph node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<Dim>);

impl Shape {
    pub fn new(dims: Vec<Dim>) -> Self {
        Shape(dims)
    }

    /// A shape with the batch placeholder at axis 0 followed by `rest`.
    pub fn batch(rest: &[usize]) -> Self {
        let mut dims = Vec::with_capacity(rest.len() + 1);
        dims.push(Dim::Batch);
        dims.extend(rest.iter().map(|&d| Dim::Fixed(d)));
        Shape(dims)
    }

    pub fn dims(&self) -> &[Dim] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn is_rank(&self, rank: usize) -> bool {
        self.0.len() == rank
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> Result<Dim> {
        self.0.get(d).copied().ok_or_else(|| {
            Error::msg(format!(
                "dimension {d} out of range for shape {self} of rank {}",
                self.rank()
            ))
        })
    }

    /// Concrete size of dimension `d`, `None` for the placeholder or out of range.
    pub fn fixed_dim(&self, d: usize) -> Option<usize> {
        self.0.get(d).and_then(Dim::fixed)
    }

    /// Normalize a possibly negative axis (`-1` is the last axis).
    pub fn real_axis(&self, axis: isize) -> Result<usize> {
        let rank = self.rank() as isize;
        let real = if axis < 0 { axis + rank } else { axis };
        if real < 0 || real >= rank {
            return Err(Error::msg(format!(
                "axis {axis} out of range for shape {self}"
            )));
        }
        Ok(real as usize)
    }

    pub fn has_batch(&self) -> bool {
        self.0.iter().any(Dim::is_batch)
    }

    pub fn is_concrete(&self) -> bool {
        !self.has_batch()
    }

    /// The placeholder appears at most at axis 0.
    pub fn has_valid_batch_axis(&self) -> bool {
        self.0.iter().skip(1).all(|d| !d.is_batch())
    }

    pub fn concrete_dims(&self) -> Option<Vec<usize>> {
        self.0.iter().map(Dim::fixed).collect()
    }

    /// Total number of elements of a concrete shape.
    ///
    /// Fails if the shape still contains the placeholder or the product does
    /// not fit in a signed 32-bit integer.
    pub fn total_dim(&self) -> Result<usize> {
        let dims = self.concrete_dims().ok_or_else(|| {
            Error::msg(format!("shape {self} has an unresolved batch dimension"))
        })?;
        checked_total(&dims)
    }

    /// Product of the concrete dims, treating the placeholder as 1.
    pub fn fixed_total(&self) -> Result<usize> {
        let dims: Vec<usize> = self.0.iter().map(|d| d.fixed().unwrap_or(1)).collect();
        checked_total(&dims)
    }

    /// Substitute a concrete batch size and return the resulting dims.
    pub fn resolve(&self, batch: usize) -> Result<Vec<usize>> {
        let dims: Vec<usize> = self.0.iter().map(|d| d.resolve(batch)).collect();
        checked_total(&dims)?;
        Ok(dims)
    }

    /// The batch size implied by a concrete dims slice, if this shape has a
    /// placeholder at axis 0 and the ranks agree.
    pub fn infer_batch(&self, dims: &[usize]) -> Option<usize> {
        match (self.0.first(), dims.first()) {
            (Some(Dim::Batch), Some(&b)) if dims.len() == self.rank() => Some(b),
            _ => None,
        }
    }

    /// Does a concrete dims slice fit this pattern under `batch`?
    pub fn matches(&self, dims: &[usize], batch: Option<usize>) -> bool {
        self.rank() == dims.len()
            && self
                .0
                .iter()
                .zip(dims.iter())
                .all(|(pattern, &value)| pattern.matches(value, batch))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

// Convenient From implementations
// These let you write: Shape::from((3, 4)) instead of Shape::new(vec![..])

impl From<()> for Shape {
    /// Scalar shape (0 dimensions).
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    /// 1-D shape.
    fn from(d: usize) -> Self {
        Shape(vec![Dim::Fixed(d)])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![Dim::Fixed(d0), Dim::Fixed(d1)])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![Dim::Fixed(d0), Dim::Fixed(d1), Dim::Fixed(d2)])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v.into_iter().map(Dim::Fixed).collect())
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.iter().map(|&d| Dim::Fixed(d)).collect())
    }
}

impl From<Vec<Dim>> for Shape {
    fn from(dims: Vec<Dim>) -> Self {
        Shape(dims)
    }
}
