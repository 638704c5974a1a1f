//! Rank-0 payloads backed by plain floats.

use std::ops::Range;

use crate::error::{AutogradError, Result};
use crate::payload::Payload;
use crate::scalar::Scalar;
use crate::size::Size;

const BACKEND: &str = "scalar";

fn single(size: &Size, op: &'static str) -> Result<()> {
    if size.numel() == 1 {
        Ok(())
    } else {
        Err(AutogradError::Unsupported { op, backend: BACKEND })
    }
}

fn check_index(index: usize) -> Result<()> {
    if index == 0 {
        Ok(())
    } else {
        Err(AutogradError::IndexOutOfBounds { index, dim_size: 1 })
    }
}

fn check_rank(count: usize) -> Result<()> {
    if count == 0 {
        Ok(())
    } else {
        Err(AutogradError::WrongNumberOfIndices {
            expected: 0,
            actual: count,
        })
    }
}

macro_rules! impl_scalar_payload {
    ($t:ty) => {
        impl Payload for $t {
            const BACKEND: &'static str = BACKEND;

            fn size(&self) -> Size {
                Size::scalar()
            }

            fn zeros(_size: &Size) -> Self {
                0.0
            }

            fn ones(_size: &Size) -> Self {
                1.0
            }

            fn full(_size: &Size, value: f64) -> Self {
                value as $t
            }

            fn add(&self, rhs: &Self) -> Result<Self> {
                Ok(self + rhs)
            }

            fn sub(&self, rhs: &Self) -> Result<Self> {
                Ok(self - rhs)
            }

            fn mul(&self, rhs: &Self) -> Result<Self> {
                Ok(self * rhs)
            }

            fn div(&self, rhs: &Self) -> Result<Self> {
                Ok(self / rhs)
            }

            fn matmul(&self, _rhs: &Self) -> Result<Self> {
                Err(AutogradError::Unsupported {
                    op: "matmul",
                    backend: BACKEND,
                })
            }

            fn neg(&self) -> Self {
                -*self
            }

            fn relu(&self) -> Self {
                self.max(0.0)
            }

            fn sigmoid(&self) -> Self {
                1.0 / (1.0 + Scalar::exp(-*self))
            }

            fn exp(&self) -> Self {
                Scalar::exp(*self)
            }

            fn log(&self) -> Self {
                Scalar::ln(*self)
            }

            fn transpose(&self) -> Result<Self> {
                Ok(*self)
            }

            fn reshape(&self, size: &Size) -> Result<Self> {
                if size.numel() != 1 {
                    return Err(AutogradError::ShapeMismatch {
                        expected: 1,
                        actual: size.numel(),
                    });
                }
                Ok(*self)
            }

            fn sum(&self) -> Self {
                *self
            }

            fn mean(&self) -> Self {
                *self
            }

            fn norm(&self) -> Self {
                self.abs()
            }

            fn argmax(&self) -> Option<usize> {
                Some(0)
            }

            fn threshold(&self, threshold: f64) -> Self {
                if Scalar::to_f64(*self) > threshold { 1.0 } else { 0.0 }
            }

            fn scale(&self, alpha: f64) -> Self {
                self * alpha as $t
            }

            fn sum_to(&self, size: &Size) -> Result<Self> {
                single(size, "sum_to")?;
                Ok(*self)
            }

            fn broadcast_to(&self, size: &Size) -> Result<Self> {
                single(size, "broadcast_to")?;
                Ok(*self)
            }

            fn get(&self, index: usize) -> Result<f64> {
                check_index(index)?;
                Ok(Scalar::to_f64(*self))
            }

            fn put(&mut self, index: usize, value: f64) -> Result<()> {
                check_index(index)?;
                *self = value as $t;
                Ok(())
            }

            fn get_at(&self, indices: &[usize]) -> Result<f64> {
                check_rank(indices.len())?;
                Ok(Scalar::to_f64(*self))
            }

            fn put_at(&mut self, indices: &[usize], value: f64) -> Result<()> {
                check_rank(indices.len())?;
                *self = value as $t;
                Ok(())
            }

            fn slice(&self, ranges: &[Range<usize>]) -> Result<Self> {
                check_rank(ranges.len())?;
                Ok(*self)
            }

            fn put_slice(&mut self, ranges: &[Range<usize>], values: &Self) -> Result<()> {
                check_rank(ranges.len())?;
                *self = *values;
                Ok(())
            }

            fn to_vec(&self) -> Vec<f64> {
                vec![Scalar::to_f64(*self)]
            }
        }
    };
}

impl_scalar_payload!(f32);
impl_scalar_payload!(f64);

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_arithmetic() {
        assert_relative_eq!(Payload::add(&2.6f64, &3.6).unwrap(), 6.2);
        assert_eq!(Payload::mul(&2.0f32, &4.0).unwrap(), 8.0);
        assert_eq!(Payload::neg(&2.0f64), -2.0);
        assert_eq!(Payload::relu(&-1.0f64), 0.0);
        assert_relative_eq!(Payload::sigmoid(&0.0f64), 0.5);
    }

    #[test]
    fn test_matmul_unsupported() {
        let err = Payload::matmul(&1.0f64, &2.0).unwrap_err();
        assert!(matches!(
            err,
            AutogradError::Unsupported {
                op: "matmul",
                backend: "scalar"
            }
        ));
    }

    #[test]
    fn test_reshape_and_reduce_to_single() {
        assert_eq!(Payload::reshape(&3.0f64, &Size::new(&[1, 1])).unwrap(), 3.0);
        assert!(Payload::reshape(&3.0f64, &Size::new(&[2])).is_err());
        assert_eq!(Payload::sum_to(&3.0f64, &Size::scalar()).unwrap(), 3.0);
        assert!(Payload::broadcast_to(&3.0f64, &Size::new(&[2])).is_err());
    }

    #[test]
    fn test_indexing() {
        let mut x = 1.5f64;
        assert_eq!(Payload::get(&x, 0).unwrap(), 1.5);
        assert!(Payload::get(&x, 1).is_err());
        x.put_at(&[], 4.0).unwrap();
        assert_eq!(x.to_vec(), vec![4.0]);
        assert!(x.put_at(&[0], 1.0).is_err());
        assert_eq!(Payload::size(&x), Size::scalar());
    }
}
