//! Dense tensor kernels.
//!
//! Free functions over [`DenseTensor`](crate::DenseTensor). They know
//! nothing about graphs; the dense payload adapter calls them and the
//! autograd layer calls the adapter.

mod elementwise;
mod matmul;
mod permutedims;
mod reduce;
mod slice;

pub use elementwise::{relu, scale, scale_inplace, sigmoid, threshold, zip_broadcast};
pub use matmul::matmul;
pub use permutedims::{permutedims, transpose_last2};
pub use reduce::{argmax, broadcast_to, mean, norm, sum, sum_to};
pub use slice::{slice, slice_assign};
