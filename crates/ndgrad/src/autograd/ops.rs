//! Differentiable operators.
//!
//! Every operator is a thin pairing of a [`Payload`] forward computation
//! with a gradient rule expressed in terms of other differentiable
//! operators, so gradients of gradients come for free when the graph is
//! kept.

use std::ops::Range;

use super::broadcast::{matmul_lhs_grad, matmul_rhs_grad};
use super::value::AutogradValue;
use crate::error::{AutogradError, Result};
use crate::payload::Payload;
use crate::size::Size;

impl<P: Payload> AutogradValue<P> {
    pub fn add(&self, other: &AutogradValue<P>) -> Result<AutogradValue<P>> {
        self.apply_binary(
            other,
            "add",
            true,
            |a, b| a.add(b),
            |g, _, _| Ok(g.clone()),
            |g, _, _| Ok(g.clone()),
        )
    }

    pub fn sub(&self, other: &AutogradValue<P>) -> Result<AutogradValue<P>> {
        self.apply_binary(
            other,
            "sub",
            true,
            |a, b| a.sub(b),
            |g, _, _| Ok(g.clone()),
            |g, _, _| g.neg(),
        )
    }

    pub fn mul(&self, other: &AutogradValue<P>) -> Result<AutogradValue<P>> {
        self.apply_binary(
            other,
            "mul",
            true,
            |a, b| a.mul(b),
            |g, _, r| g.mul(r),
            |g, l, _| g.mul(l),
        )
    }

    pub fn div(&self, other: &AutogradValue<P>) -> Result<AutogradValue<P>> {
        self.apply_binary(
            other,
            "div",
            true,
            |a, b| a.div(b),
            |g, _, r| g.div(r),
            |g, l, r| g.mul(l)?.div(&r.mul(r)?)?.neg(),
        )
    }

    /// Matrix product; see [`Size::matmul_plan`] for the shape rules.
    pub fn matmul(&self, other: &AutogradValue<P>) -> Result<AutogradValue<P>> {
        self.apply_binary(
            other,
            "matmul",
            false,
            |a, b| a.matmul(b),
            matmul_lhs_grad,
            matmul_rhs_grad,
        )
    }

    pub fn neg(&self) -> Result<AutogradValue<P>> {
        self.apply_unary("neg", |x| Ok(x.neg()), |g, _| g.neg())
    }

    pub fn relu(&self) -> Result<AutogradValue<P>> {
        self.apply_unary(
            "relu",
            |x| Ok(x.relu()),
            |g, x| g.mul(&x.threshold(0.0)?),
        )
    }

    pub fn sigmoid(&self) -> Result<AutogradValue<P>> {
        self.apply_unary(
            "sigmoid",
            |x| Ok(x.sigmoid()),
            |g, x| {
                let s = x.sigmoid()?;
                g.mul(&s.sub(&s.mul(&s)?)?)
            },
        )
    }

    pub fn exp(&self) -> Result<AutogradValue<P>> {
        self.apply_unary("exp", |x| Ok(x.exp()), |g, x| g.mul(&x.exp()?))
    }

    /// Natural logarithm.
    pub fn log(&self) -> Result<AutogradValue<P>> {
        self.apply_unary("log", |x| Ok(x.log()), |g, x| g.div(x))
    }

    /// Swap the last two axes.
    pub fn transpose(&self) -> Result<AutogradValue<P>> {
        self.apply_unary("transpose", |x| x.transpose(), |g, _| g.transpose())
    }

    /// Same elements under another shape.
    pub fn reshape(&self, size: impl Into<Size>) -> Result<AutogradValue<P>> {
        let size = size.into();
        let current = self.size()?;
        if size.numel() != current.numel() {
            return Err(AutogradError::ShapeMismatch {
                expected: current.numel(),
                actual: size.numel(),
            });
        }
        self.apply_unary(
            "reshape",
            move |x| x.reshape(&size),
            |g, x| g.reshape(x.size()?),
        )
    }

    /// Sum of all elements as a rank-0 value.
    pub fn sum(&self) -> Result<AutogradValue<P>> {
        self.apply_unary("sum", |x| Ok(x.sum()), |g, x| g.broadcast_to(x.size()?))
    }

    pub fn mean(&self) -> Result<AutogradValue<P>> {
        self.apply_unary(
            "mean",
            |x| Ok(x.mean()),
            |g, x| {
                let size = x.size()?;
                let n = size.numel() as f64;
                g.broadcast_to(size)?.scale(1.0 / n)
            },
        )
    }

    /// Euclidean norm of all elements.
    ///
    /// At the zero vector the gradient is the zero subgradient.
    pub fn norm(&self) -> Result<AutogradValue<P>> {
        self.apply_unary(
            "norm",
            |x| Ok(x.norm()),
            |g, x| {
                let n = x.norm()?;
                if n.item()? == 0.0 {
                    let size = x.size()?;
                    return Ok(x.registry().leaf_sized(P::zeros(&size), size));
                }
                g.mul(x)?.div(&n)
            },
        )
    }

    /// Sum over broadcast axes down to `size`.
    pub fn sum_to(&self, size: impl Into<Size>) -> Result<AutogradValue<P>> {
        let size = size.into();
        self.apply_unary(
            "sum_to",
            move |x| x.sum_to(&size),
            |g, x| g.broadcast_to(x.size()?),
        )
    }

    /// Repeat along broadcast axes up to `size`.
    pub fn broadcast_to(&self, size: impl Into<Size>) -> Result<AutogradValue<P>> {
        let size = size.into();
        self.apply_unary(
            "broadcast_to",
            move |x| x.broadcast_to(&size),
            |g, x| g.sum_to(x.size()?),
        )
    }

    /// Multiply every element by `alpha`.
    pub fn scale(&self, alpha: f64) -> Result<AutogradValue<P>> {
        self.apply_unary("scale", move |x| Ok(x.scale(alpha)), move |g, _| g.scale(alpha))
    }

    /// Block selected by one range per dimension.
    pub fn slice(&self, ranges: &[Range<usize>]) -> Result<AutogradValue<P>> {
        let forward = ranges.to_vec();
        let backward = ranges.to_vec();
        self.apply_unary(
            "slice",
            move |x| x.slice(&forward),
            move |g, x| g.scatter(&backward, x.size()?),
        )
    }

    /// Zeros of shape `size` with `self` written into the block `ranges`.
    pub(crate) fn scatter(&self, ranges: &[Range<usize>], size: Size) -> Result<AutogradValue<P>> {
        let forward = ranges.to_vec();
        let backward = ranges.to_vec();
        self.apply_unary(
            "scatter",
            move |x| {
                let mut out = P::zeros(&size);
                out.put_slice(&forward, x)?;
                Ok(out)
            },
            move |g, _| g.slice(&backward),
        )
    }

    /// 0/1 mask of elements strictly greater than `threshold`.
    ///
    /// The mask is piecewise constant and never tracked.
    pub fn threshold(&self, threshold: f64) -> Result<AutogradValue<P>> {
        let mask = self.data()?.threshold(threshold);
        Ok(self.registry.leaf_sized(mask, self.size()?))
    }

    /// Flat index of the largest element.
    pub fn argmax(&self) -> Result<Option<usize>> {
        Ok(self.data()?.argmax())
    }

    pub fn add_(&self, other: &AutogradValue<P>) -> Result<&Self> {
        let rhs = other.data()?;
        self.apply_inplace("add_", |x| x.add(&rhs))
    }

    pub fn sub_(&self, other: &AutogradValue<P>) -> Result<&Self> {
        let rhs = other.data()?;
        self.apply_inplace("sub_", |x| x.sub(&rhs))
    }

    pub fn mul_(&self, other: &AutogradValue<P>) -> Result<&Self> {
        let rhs = other.data()?;
        self.apply_inplace("mul_", |x| x.mul(&rhs))
    }

    pub fn div_(&self, other: &AutogradValue<P>) -> Result<&Self> {
        let rhs = other.data()?;
        self.apply_inplace("div_", |x| x.div(&rhs))
    }

    pub fn scale_(&self, alpha: f64) -> Result<&Self> {
        self.apply_inplace("scale_", |x| Ok(x.scale(alpha)))
    }

    /// Overwrite the element at a flat index.
    pub fn put_(&self, index: usize, value: f64) -> Result<&Self> {
        self.apply_inplace("put_", |x| {
            let mut out = x.clone();
            out.put(index, value)?;
            Ok(out)
        })
    }

    /// Overwrite the element at a per-dimension index.
    pub fn put_at_(&self, indices: &[usize], value: f64) -> Result<&Self> {
        self.apply_inplace("put_at_", |x| {
            let mut out = x.clone();
            out.put_at(indices, value)?;
            Ok(out)
        })
    }

    /// Overwrite the block `ranges` with `values`.
    pub fn put_slice_(&self, ranges: &[Range<usize>], values: &AutogradValue<P>) -> Result<&Self> {
        let values = values.data()?;
        self.apply_inplace("put_slice_", |x| {
            let mut out = x.clone();
            out.put_slice(ranges, &values)?;
            Ok(out)
        })
    }
}
