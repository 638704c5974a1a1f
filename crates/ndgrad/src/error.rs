//! Error types for ndgrad.

use thiserror::Error;

/// Errors raised by shapes, payload backends and the autograd engine.
///
/// Every variant is reported synchronously at the offending call; the
/// engine never retries.
#[derive(Debug, Error)]
pub enum AutogradError {
    /// Element count of a requested shape differs from the source.
    #[error("shape mismatch: expected {expected} elements, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// Two shapes cannot be combined by the requested operation.
    #[error("incompatible shapes {lhs:?} and {rhs:?}: {detail}")]
    IncompatibleShapes {
        lhs: Vec<usize>,
        rhs: Vec<usize>,
        detail: String,
    },

    /// A shape has no two-dimensional projection.
    #[error("shape {shape:?} cannot be projected onto a matrix")]
    MatrixProjection { shape: Vec<usize> },

    /// Index out of bounds.
    #[error("index out of bounds: index {index} is out of range for dimension {dim_size}")]
    IndexOutOfBounds { index: usize, dim_size: usize },

    /// Wrong number of indices provided.
    #[error("wrong number of indices: expected {expected}, got {actual}")]
    WrongNumberOfIndices { expected: usize, actual: usize },

    /// Slice range out of bounds.
    #[error("slice range {start}..{end} out of bounds for dimension {dim} with size {size}")]
    SliceOutOfBounds {
        start: usize,
        end: usize,
        dim: usize,
        size: usize,
    },

    /// Invalid permutation.
    #[error("invalid permutation {perm:?} for tensor with {ndim} dimensions")]
    InvalidPermutation { perm: Vec<usize>, ndim: usize },

    /// A value could not be constructed.
    #[error("invalid construction: {0}")]
    InvalidConstruction(String),

    /// An operation was requested in a state that does not allow it.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A grad-node was assigned inconsistently.
    #[error("invalid gradient assignment: {0}")]
    InvalidGradient(String),

    /// Two values cannot exchange their identities.
    #[error("cannot swap values: {0}")]
    Swap(String),

    /// The backend does not implement the operation.
    #[error("operation `{op}` is not supported by the {backend} backend")]
    Unsupported {
        op: &'static str,
        backend: &'static str,
    },

    /// A backward pass reached a node whose graph was already released.
    #[error(
        "node {node} was released by an earlier backward pass; \
         pass keep_graph=true to traverse it again"
    )]
    GraphReleased { node: usize },

    /// The forward graph contains a cycle.
    #[error("computation graph contains a cycle through node {node}")]
    CyclicGraph { node: usize },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AutogradError>;

impl AutogradError {
    pub(crate) fn incompatible(lhs: &[usize], rhs: &[usize], detail: impl Into<String>) -> Self {
        Self::IncompatibleShapes {
            lhs: lhs.to_vec(),
            rhs: rhs.to_vec(),
            detail: detail.into(),
        }
    }
}
