//! Scalar trait for payload element types.

use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Neg, Sub};

use faer::linalg::matmul::matmul;
use faer::{Accum, MatMut, MatRef, Par};

/// Real floating-point element type usable by every payload backend.
///
/// The arithmetic supertraits cover the elementwise operators; the
/// transcendental functions cover the activation rules; `gemm` is the
/// dense matrix product hook, delegated to faer.
pub trait Scalar:
    Copy
    + Debug
    + Default
    + PartialOrd
    + Send
    + Sync
    + 'static
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
{
    /// Short type name used in diagnostics.
    const NAME: &'static str;

    /// Returns the additive identity (zero).
    fn zero() -> Self {
        Self::default()
    }

    /// Returns the multiplicative identity (one).
    fn one() -> Self;

    /// Converts from `f64`, rounding when the target is narrower.
    fn from_f64(value: f64) -> Self;

    /// Widens to `f64`.
    fn to_f64(self) -> f64;

    fn exp(self) -> Self;

    fn ln(self) -> Self;

    fn sqrt(self) -> Self;

    /// `dst = lhs * rhs` for column-major `m x k` and `k x n` operands.
    fn gemm(dst: &mut [Self], lhs: &[Self], rhs: &[Self], m: usize, k: usize, n: usize);
}

macro_rules! impl_scalar {
    ($t:ty, $name:literal) => {
        impl Scalar for $t {
            const NAME: &'static str = $name;

            fn one() -> Self {
                1.0
            }

            fn from_f64(value: f64) -> Self {
                value as $t
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn exp(self) -> Self {
                <$t>::exp(self)
            }

            fn ln(self) -> Self {
                <$t>::ln(self)
            }

            fn sqrt(self) -> Self {
                <$t>::sqrt(self)
            }

            fn gemm(dst: &mut [Self], lhs: &[Self], rhs: &[Self], m: usize, k: usize, n: usize) {
                let a = MatRef::from_column_major_slice(lhs, m, k);
                let b = MatRef::from_column_major_slice(rhs, k, n);
                let mut c = MatMut::from_column_major_slice_mut(dst, m, n);
                matmul(c.as_mut(), Accum::Replace, a, b, 1.0, Par::Seq);
            }
        }
    };
}

impl_scalar!(f32, "f32");
impl_scalar!(f64, "f64");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_one() {
        assert_eq!(f64::zero(), 0.0);
        assert_eq!(f64::one(), 1.0);
        assert_eq!(f32::zero(), 0.0);
        assert_eq!(f32::one(), 1.0);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(<f32 as Scalar>::from_f64(2.5), 2.5f32);
        assert_eq!(Scalar::to_f64(1.5f32), 1.5);
    }

    #[test]
    fn test_gemm_column_major() {
        // A = [[1, 3], [2, 4]] (column-major [1, 2, 3, 4]), B = identity
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [1.0, 0.0, 0.0, 1.0];
        let mut c = [0.0f64; 4];
        f64::gemm(&mut c, &a, &b, 2, 2, 2);
        assert_eq!(c, a);

        // 1x3 times 3x1
        let mut dot = [0.0f64; 1];
        f64::gemm(&mut dot, &[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0], 1, 3, 1);
        assert_eq!(dot[0], 32.0);
    }
}
