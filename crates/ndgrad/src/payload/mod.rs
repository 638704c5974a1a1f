//! Payload capability contract.
//!
//! A payload is the concrete numeric value carried by an
//! [`AutogradValue`](crate::AutogradValue). The engine only ever talks to
//! payloads through this trait, so any backend that implements it becomes
//! differentiable.
//!
//! Two backends ship with the crate:
//!
//! - [`scalar`]: `f32` / `f64` as rank-0 values; `matmul` is unsupported.
//! - [`dense`]: [`DenseTensor`](crate::DenseTensor) over `f32` / `f64`.

use std::fmt::Debug;
use std::ops::Range;

use crate::error::Result;
use crate::size::Size;

pub mod dense;
pub mod scalar;

/// Operations a numeric backend must provide to be differentiable.
///
/// Binary elementwise operations broadcast numpy-style. Reductions
/// (`sum`, `mean`, `norm`) return rank-0 payloads. Element access goes
/// through `f64` regardless of the element type.
pub trait Payload: Clone + Debug + Send + Sync + 'static {
    /// Backend name used in diagnostics.
    const BACKEND: &'static str;

    fn size(&self) -> Size;

    fn numel(&self) -> usize {
        self.size().numel()
    }

    fn zeros(size: &Size) -> Self;

    fn ones(size: &Size) -> Self;

    fn full(size: &Size, value: f64) -> Self;

    fn add(&self, rhs: &Self) -> Result<Self>;

    fn sub(&self, rhs: &Self) -> Result<Self>;

    fn mul(&self, rhs: &Self) -> Result<Self>;

    fn div(&self, rhs: &Self) -> Result<Self>;

    /// Matrix product following [`Size::matmul_plan`].
    fn matmul(&self, rhs: &Self) -> Result<Self>;

    fn neg(&self) -> Self;

    fn relu(&self) -> Self;

    fn sigmoid(&self) -> Self;

    fn exp(&self) -> Self;

    fn log(&self) -> Self;

    /// Swap the last two axes; payloads of rank < 2 are returned unchanged.
    fn transpose(&self) -> Result<Self>;

    /// Same elements, new shape.
    fn reshape(&self, size: &Size) -> Result<Self>;

    fn sum(&self) -> Self;

    fn mean(&self) -> Self;

    /// Euclidean norm of all elements.
    fn norm(&self) -> Self;

    /// Flat index of the largest element.
    fn argmax(&self) -> Option<usize>;

    /// 0/1 mask of elements strictly greater than `threshold`.
    fn threshold(&self, threshold: f64) -> Self;

    fn scale(&self, alpha: f64) -> Self;

    /// Sum over broadcast axes down to `size`.
    fn sum_to(&self, size: &Size) -> Result<Self>;

    /// Repeat along broadcast axes up to `size`.
    fn broadcast_to(&self, size: &Size) -> Result<Self>;

    /// Element at a flat index.
    fn get(&self, index: usize) -> Result<f64>;

    fn put(&mut self, index: usize, value: f64) -> Result<()>;

    /// Element at a per-dimension index.
    fn get_at(&self, indices: &[usize]) -> Result<f64>;

    fn put_at(&mut self, indices: &[usize], value: f64) -> Result<()>;

    /// Copy of the block selected by one range per dimension.
    fn slice(&self, ranges: &[Range<usize>]) -> Result<Self>;

    fn put_slice(&mut self, ranges: &[Range<usize>], values: &Self) -> Result<()>;

    /// Elements in storage order.
    fn to_vec(&self) -> Vec<f64>;

    /// Hook invoked when the owning value is closed.
    fn release(&mut self) {}
}
