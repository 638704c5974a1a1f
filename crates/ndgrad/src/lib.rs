//! ndgrad - reverse-mode automatic differentiation over pluggable payloads
//!
//! This crate records operations on differentiable values as a graph and
//! propagates gradients back through it with the chain rule. The numeric
//! work is delegated to a payload type implementing [`Payload`]; scalars
//! (`f32`, `f64`) and column-major dense tensors ([`DenseTensor`]) ship
//! with the crate.
//!
//! # Architecture
//!
//! ```text
//! Level 1: Autograd (autograd module)
//!     → Registry, AutogradValue, backward, hvp
//!
//! Level 2: Payload contract (payload module)
//!     → scalar and dense adapters
//!
//! Level 3: Dense backend (tensor, operations)
//!     → elementwise, reductions, slicing, faer GEMM
//! ```
//!
//! # Example
//!
//! ```
//! use ndgrad::{DenseTensor, Registry};
//!
//! let r = Registry::<DenseTensor<f64>>::new("readme");
//! let w = r.variable(DenseTensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap()).unwrap();
//! let x = r.value(DenseTensor::ones(&[2, 1])).unwrap();
//!
//! let loss = w.matmul(&x).unwrap().relu().unwrap().sum().unwrap();
//! loss.backward().unwrap();
//!
//! let grad = w.grad().unwrap().unwrap();
//! assert_eq!(grad.to_vec().unwrap(), vec![1.0, 1.0, 1.0, 1.0]);
//! r.close_all();
//! ```

pub mod autograd;
pub mod error;
pub mod operations;
pub mod payload;
pub mod random;
pub mod scalar;
pub mod size;
pub mod strides;
pub mod tensor;

pub use autograd::{AutogradValue, BackwardConfig, NoGradGuard, Registry, SavePolicy, ValueBuilder};
pub use error::{AutogradError, Result};
pub use payload::Payload;
pub use scalar::Scalar;
pub use size::{Dim, DimScope, Size};
pub use tensor::DenseTensor;
