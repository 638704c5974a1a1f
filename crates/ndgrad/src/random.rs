//! Random dense payloads.

use rand::Rng;
use rand::distr::StandardUniform;
use rand_distr::StandardNormal;

use crate::scalar::Scalar;
use crate::tensor::DenseTensor;

/// Element types that can be drawn from the standard distributions.
pub trait RandomScalar: Scalar {
    /// Sample from the uniform distribution on [0, 1).
    fn sample_uniform<R: Rng>(rng: &mut R) -> Self;

    /// Sample from the standard normal distribution.
    fn sample_normal<R: Rng>(rng: &mut R) -> Self;
}

macro_rules! impl_random_scalar {
    ($t:ty) => {
        impl RandomScalar for $t {
            fn sample_uniform<R: Rng>(rng: &mut R) -> Self {
                rng.sample(StandardUniform)
            }

            fn sample_normal<R: Rng>(rng: &mut R) -> Self {
                rng.sample(StandardNormal)
            }
        }
    };
}

impl_random_scalar!(f32);
impl_random_scalar!(f64);

impl<T: RandomScalar> DenseTensor<T> {
    /// Uniform random values in [0, 1).
    ///
    /// ```
    /// use ndgrad::DenseTensor;
    ///
    /// let t: DenseTensor<f64> = DenseTensor::random(&[2, 3]);
    /// assert!(t.data().iter().all(|v| (0.0..1.0).contains(v)));
    /// ```
    pub fn random(shape: &[usize]) -> Self {
        Self::random_with_rng(shape, &mut rand::rng())
    }

    /// Uniform random values from a caller-supplied RNG.
    ///
    /// ```
    /// use ndgrad::DenseTensor;
    /// use rand::SeedableRng;
    /// use rand::rngs::StdRng;
    ///
    /// let t1: DenseTensor<f64> = DenseTensor::random_with_rng(&[2, 3], &mut StdRng::seed_from_u64(42));
    /// let t2: DenseTensor<f64> = DenseTensor::random_with_rng(&[2, 3], &mut StdRng::seed_from_u64(42));
    /// assert_eq!(t1.data(), t2.data());
    /// ```
    pub fn random_with_rng<R: Rng>(shape: &[usize], rng: &mut R) -> Self {
        Self::from_fn(shape, |_| T::sample_uniform(rng))
    }

    /// Standard normal random values.
    pub fn randn(shape: &[usize]) -> Self {
        Self::randn_with_rng(shape, &mut rand::rng())
    }

    pub fn randn_with_rng<R: Rng>(shape: &[usize], rng: &mut R) -> Self {
        Self::from_fn(shape, |_| T::sample_normal(rng))
    }
}
