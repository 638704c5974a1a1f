//! Shape model.
//!
//! A [`Size`] is an ordered list of positive dimensions, optionally grouped
//! into nested sub-shapes whose dimensions may carry a name and a
//! [`DimScope`]. Names and scopes only feed diagnostics: equality, hashing
//! and every shape rule look at the flattened dimensions alone.
//!
//! Derived shapes (transpose, broadcast, matmul plans) are always new values.

use std::fmt;
use std::hash::{Hash, Hasher};

use smallvec::SmallVec;

use crate::error::{AutogradError, Result};

/// Which side of an operation a named dimension belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DimScope {
    Input,
    Output,
    #[default]
    Any,
}

/// One dimension with optional diagnostic metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dim {
    size: usize,
    name: Option<String>,
    scope: DimScope,
}

impl Dim {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            name: None,
            scope: DimScope::Any,
        }
    }

    /// Attach a name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach a scope tag.
    pub fn scoped(mut self, scope: DimScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn scope(&self) -> DimScope {
        self.scope
    }

    fn label(&self) -> String {
        let tag = match self.scope {
            DimScope::Input => "in:",
            DimScope::Output => "out:",
            DimScope::Any => "",
        };
        match &self.name {
            Some(name) => format!("{tag}{name}={}", self.size),
            None => format!("{tag}{}", self.size),
        }
    }
}

#[derive(Debug, Clone)]
enum Component {
    Dim(Dim),
    Nested(Size),
}

/// Multi-dimensional shape.
#[derive(Debug, Clone)]
pub struct Size {
    components: Vec<Component>,
    flat: SmallVec<[usize; 6]>,
}

impl PartialEq for Size {
    fn eq(&self, other: &Self) -> bool {
        self.flat == other.flat
    }
}

impl Eq for Size {}

impl Hash for Size {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.flat.hash(state);
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.labels().join(", "))
    }
}

impl From<&[usize]> for Size {
    fn from(dims: &[usize]) -> Self {
        Size::new(dims)
    }
}

impl From<Vec<usize>> for Size {
    fn from(dims: Vec<usize>) -> Self {
        Size::new(&dims)
    }
}

impl<const N: usize> From<[usize; N]> for Size {
    fn from(dims: [usize; N]) -> Self {
        Size::new(&dims)
    }
}

/// Result of [`Size::broadcast_plan`].
///
/// `lhs_scale`/`rhs_scale` are `numel(shape) / numel(operand)`: how many
/// output elements each operand element contributes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastPlan {
    pub shape: Size,
    pub lhs_scale: usize,
    pub rhs_scale: usize,
}

impl BroadcastPlan {
    /// Whether either operand actually had to be expanded.
    pub fn is_broadcast(&self) -> bool {
        self.lhs_scale != 1 || self.rhs_scale != 1
    }
}

/// Shapes needed to execute and differentiate a matrix product.
///
/// `lhs` and `rhs` are the operands after promoting 1-D inputs to
/// `[1, k]` / `[k, 1]`; `product` is `batch ++ [m, n]`; `result` is
/// `product` with the promoted axes removed again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatmulPlan {
    pub lhs: Size,
    pub rhs: Size,
    pub product: Size,
    pub result: Size,
    pub batch: Size,
    /// The lhs batch was folded into the row dimension of a single 2-D
    /// product (`[B*m, k] x [k, n]`).
    pub flattened: bool,
}

impl MatmulPlan {
    pub fn m(&self) -> usize {
        self.lhs.dim(-2)
    }

    pub fn k(&self) -> usize {
        self.lhs.dim(-1)
    }

    pub fn n(&self) -> usize {
        self.rhs.dim(-1)
    }
}

impl Size {
    /// Shape from plain dimensions.
    pub fn new(dims: &[usize]) -> Self {
        Self::from_dims(dims.iter().map(|&d| Dim::new(d)).collect())
    }

    /// Like [`Size::new`] but rejects zero-sized dimensions.
    pub fn checked(dims: &[usize]) -> Result<Self> {
        if let Some(axis) = dims.iter().position(|&d| d == 0) {
            return Err(AutogradError::InvalidConstruction(format!(
                "dimension {axis} of {dims:?} is zero"
            )));
        }
        Ok(Self::new(dims))
    }

    /// Rank-0 shape.
    pub fn scalar() -> Self {
        Self {
            components: Vec::new(),
            flat: SmallVec::new(),
        }
    }

    /// Shape from annotated dimensions.
    pub fn from_dims(dims: Vec<Dim>) -> Self {
        let flat = dims.iter().map(Dim::size).collect();
        Self {
            components: dims.into_iter().map(Component::Dim).collect(),
            flat,
        }
    }

    /// Shape concatenating nested sub-shapes.
    pub fn nested(parts: Vec<Size>) -> Self {
        let flat = parts.iter().flat_map(|p| p.flat.iter().copied()).collect();
        Self {
            components: parts.into_iter().map(Component::Nested).collect(),
            flat,
        }
    }

    /// Flattened dimensions.
    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.flat
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.flat.len()
    }

    #[inline]
    pub fn is_scalar(&self) -> bool {
        self.flat.is_empty()
    }

    /// Number of elements; 1 for a rank-0 shape.
    #[inline]
    pub fn numel(&self) -> usize {
        self.flat.iter().product()
    }

    /// Dimension at `axis`; negative axes count from the end.
    ///
    /// # Panics
    ///
    /// Panics if the axis is out of range.
    pub fn dim(&self, axis: isize) -> usize {
        let idx = if axis < 0 {
            self.rank() as isize + axis
        } else {
            axis
        };
        self.flat[idx as usize]
    }

    /// Number of top-level components (dimensions or nested sub-shapes).
    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Flat list of annotated dimensions.
    pub fn annotated(&self) -> Vec<Dim> {
        let mut out = Vec::with_capacity(self.rank());
        self.collect_dims(&mut out);
        out
    }

    fn collect_dims(&self, out: &mut Vec<Dim>) {
        for component in &self.components {
            match component {
                Component::Dim(d) => out.push(d.clone()),
                Component::Nested(s) => s.collect_dims(out),
            }
        }
    }

    fn labels(&self) -> Vec<String> {
        self.annotated().iter().map(Dim::label).collect()
    }

    /// Split into one 1-D sub-shape per flattened dimension, keeping names.
    pub fn decompose(&self) -> Vec<Size> {
        self.annotated()
            .into_iter()
            .map(|d| Size::from_dims(vec![d]))
            .collect()
    }

    /// Swap the two dimensions of a 2-D shape.
    pub fn transpose(&self) -> Result<Size> {
        if self.rank() != 2 {
            return Err(AutogradError::incompatible(
                self.dims(),
                &[],
                "transpose requires a 2-D shape",
            ));
        }
        let mut dims = self.annotated();
        dims.swap(0, 1);
        Ok(Size::from_dims(dims))
    }

    /// Swap the last two dimensions; shapes of rank < 2 are returned as is.
    pub fn batch_transpose(&self) -> Size {
        let mut dims = self.annotated();
        let r = dims.len();
        if r >= 2 {
            dims.swap(r - 2, r - 1);
        }
        Size::from_dims(dims)
    }

    /// Canonical 2-D projection.
    ///
    /// 0-D becomes `1 x 1`, 1-D `n` becomes `1 x n`, 2-D is unchanged, and a
    /// higher-rank shape is accepted when all but its last two dimensions
    /// are 1.
    pub fn matrix_shape(&self) -> Result<Size> {
        match self.rank() {
            0 => Ok(Size::new(&[1, 1])),
            1 => Ok(Size::nested(vec![Size::new(&[1]), self.clone()])),
            2 => Ok(self.clone()),
            r => {
                if self.flat[..r - 2].iter().all(|&d| d == 1) {
                    let dims = self.annotated();
                    Ok(Size::from_dims(dims[r - 2..].to_vec()))
                } else {
                    Err(AutogradError::MatrixProjection {
                        shape: self.dims().to_vec(),
                    })
                }
            }
        }
    }

    /// Reinterpret with new dimensions of the same element count.
    pub fn resize(&self, dims: &[usize]) -> Result<Size> {
        let target = Size::new(dims);
        if target.numel() != self.numel() {
            return Err(AutogradError::ShapeMismatch {
                expected: self.numel(),
                actual: target.numel(),
            });
        }
        Ok(target)
    }

    /// Numpy-style broadcast of two shapes.
    ///
    /// ```
    /// use ndgrad::Size;
    ///
    /// let out = Size::new(&[2, 128, 65]).broadcast(&Size::new(&[1, 65])).unwrap();
    /// assert_eq!(out.dims(), &[2, 128, 65]);
    /// assert!(Size::new(&[3]).broadcast(&Size::new(&[4])).is_err());
    /// ```
    pub fn broadcast(&self, other: &Size) -> Result<Size> {
        if self == other {
            return Ok(self.clone());
        }
        let a = self.annotated();
        let b = other.annotated();
        let rank = a.len().max(b.len());
        let mut dims = Vec::with_capacity(rank);
        for i in 0..rank {
            let da = (i + a.len()).checked_sub(rank).map(|j| &a[j]);
            let db = (i + b.len()).checked_sub(rank).map(|j| &b[j]);
            let picked = match (da, db) {
                (Some(x), None) => x.clone(),
                (None, Some(y)) => y.clone(),
                (Some(x), Some(y)) if x.size == y.size || y.size == 1 => x.clone(),
                (Some(x), Some(y)) if x.size == 1 => y.clone(),
                _ => {
                    return Err(AutogradError::incompatible(
                        self.dims(),
                        other.dims(),
                        self.describe_mismatch(other),
                    ));
                }
            };
            dims.push(picked);
        }
        Ok(Size::from_dims(dims))
    }

    /// Broadcast shape plus the two operand scale factors.
    pub fn broadcast_plan(lhs: &Size, rhs: &Size) -> Result<BroadcastPlan> {
        let shape = lhs.broadcast(rhs)?;
        let total = shape.numel();
        Ok(BroadcastPlan {
            lhs_scale: total / lhs.numel().max(1),
            rhs_scale: total / rhs.numel().max(1),
            shape,
        })
    }

    /// Whether `self` broadcasts to exactly `target`.
    pub fn broadcasts_to(&self, target: &Size) -> bool {
        self.broadcast(target).is_ok_and(|s| &s == target)
    }

    /// Human-readable description of why two shapes do not line up.
    pub fn describe_mismatch(&self, other: &Size) -> String {
        let a = self.annotated();
        let b = other.annotated();
        let offending = a
            .iter()
            .rev()
            .zip(b.iter().rev())
            .enumerate()
            .find(|(_, (x, y))| x.size != y.size && x.size != 1 && y.size != 1);
        match offending {
            Some((i, (x, y))) => format!(
                "{self} vs {other}: axis -{} has {} vs {}",
                i + 1,
                x.label(),
                y.label()
            ),
            None => format!("{self} vs {other}"),
        }
    }

    /// Plan a matrix product between two shapes of arbitrary rank.
    ///
    /// Cases, in order: vector dot product, plain matrix product,
    /// vector-matrix and matrix-vector (with the promoted axis removed from
    /// the result), then batched products where the batch prefixes are
    /// broadcast. When only the lhs carries a batch it is flattened into
    /// the row dimension.
    pub fn matmul_plan(lhs: &Size, rhs: &Size) -> Result<MatmulPlan> {
        let (lr, rr) = (lhs.rank(), rhs.rank());
        if lr == 0 || rr == 0 {
            return Err(AutogradError::incompatible(
                lhs.dims(),
                rhs.dims(),
                "matmul requires operands of rank >= 1",
            ));
        }

        let lhs_m = if lr == 1 {
            Size::nested(vec![Size::new(&[1]), lhs.clone()])
        } else {
            lhs.clone()
        };
        let rhs_m = if rr == 1 {
            Size::nested(vec![rhs.clone(), Size::new(&[1])])
        } else {
            rhs.clone()
        };

        let k = lhs_m.dim(-1);
        if rhs_m.dim(-2) != k {
            return Err(AutogradError::incompatible(
                lhs.dims(),
                rhs.dims(),
                format!(
                    "inner dimensions differ: {} vs {}",
                    lhs_m.annotated()[lhs_m.rank() - 1].label(),
                    rhs_m.annotated()[rhs_m.rank() - 2].label()
                ),
            ));
        }

        let lhs_dims = lhs_m.annotated();
        let rhs_dims = rhs_m.annotated();
        let lhs_batch = Size::from_dims(lhs_dims[..lhs_dims.len() - 2].to_vec());
        let rhs_batch = Size::from_dims(rhs_dims[..rhs_dims.len() - 2].to_vec());
        let batch = lhs_batch.broadcast(&rhs_batch)?;
        let flattened = lhs_batch.rank() > 0 && rhs_batch.rank() == 0;

        let m = lhs_dims[lhs_dims.len() - 2].clone();
        let n = rhs_dims[rhs_dims.len() - 1].clone();
        let product = Size::nested(vec![batch.clone(), Size::from_dims(vec![m.clone(), n.clone()])]);

        let mut tail = Vec::with_capacity(2);
        if lr > 1 {
            tail.push(m);
        }
        if rr > 1 {
            tail.push(n);
        }
        let result = Size::nested(vec![batch.clone(), Size::from_dims(tail)]);

        Ok(MatmulPlan {
            lhs: lhs_m,
            rhs: rhs_m,
            product,
            result,
            batch,
            flattened,
        })
    }
}
