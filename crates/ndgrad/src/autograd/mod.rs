//! Reverse-mode automatic differentiation.
//!
//! # Architecture
//!
//! ```text
//! Registry<P>            arena of value slots and node pairs, one lock
//!   ├─ Slot              payload cell, size, flags, links
//!   ├─ ValueNode         producing operator, prev/next, backward fn
//!   └─ GradNode          accumulated gradient, native gradient hook
//!
//! AutogradValue<P>       (registry, ValueId) handle
//!   ├─ apply_unary / apply_binary   forward eagerly, record backward
//!   └─ backward                     toposort, reverse walk, cleanup
//! ```
//!
//! # Example
//!
//! ```
//! use ndgrad::{BackwardConfig, Registry};
//!
//! let r = Registry::<f64>::new("quadratic");
//! let x = r.variable(3.0).unwrap();
//! let y = r.variable(4.0).unwrap();
//!
//! // z = x^2 + yx + y^2
//! let z = x.mul(&x).unwrap()
//!     .add(&y.mul(&x).unwrap()).unwrap()
//!     .add(&y.mul(&y).unwrap()).unwrap();
//! z.backward_with(BackwardConfig::default()).unwrap();
//!
//! assert_eq!(x.grad().unwrap().unwrap().item().unwrap(), 10.0);
//! assert_eq!(y.grad().unwrap().unwrap().item().unwrap(), 11.0);
//! r.close_all();
//! ```

mod apply;
pub mod backward;
mod broadcast;
pub mod cell;
pub mod hessian;
pub mod lifecycle;
pub mod node;
mod ops;
pub mod registry;
pub mod scope;
pub mod value;

pub use backward::BackwardConfig;
pub use cell::{SavePolicy, Saved, Supplier};
pub use hessian::hvp;
pub use lifecycle::{RegistryStatus, all_closed, shutdown, status_report};
pub use node::{BackwardFn, NativeGrad, NodeId, ValueId};
pub use registry::{Registry, RegistryReport};
pub use scope::{NoGradGuard, is_grad_enabled, no_grad};
pub use value::{AutogradValue, ValueBuilder};
