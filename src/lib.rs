//! wmatrix: device-resident matrices and a small neural network engine.
//!
//! The numeric core runs on a [`DeviceContext`] built over a backend: the
//! host backend (always available, a pool of queue workers executing native
//! kernels) or, with the `wgpu` feature, a GPU through WGSL compute shaders.
//! Every primitive submits work and returns an [`Event`] immediately; a
//! wait-list of events orders submissions, and blocking happens only when
//! data is read back.
//!
//! # Modules
//!
//! - [`tensor`]: matrices, views, elementwise ops, GEMM, reductions and
//!   Gauss-Jordan linear algebra.
//! - [`nn`]: activations, dense layers, networks, losses and optimizers.
//! - [`device`]: contexts, events, dtypes, the kernel cache and the release
//!   worker.
//! - [`backend`]: the device contract and its implementations.
//!
//! # Example
//!
//! ```rust
//! use wmatrix::{DeviceContext, Dtype, Tensor};
//! use wmatrix::tensor::gemm::matmul;
//!
//! let ctx = DeviceContext::cpu()?;
//! let a = Tensor::from_f64(&ctx, 2, 2, Dtype::F64, &[1.0, 2.0, 3.0, 4.0])?;
//! let (c, ev) = matmul(&a, &a, &[])?;
//! assert_eq!(c.to_f64_vec(&[ev])?, vec![7.0, 10.0, 15.0, 22.0]);
//! # Ok::<(), wmatrix::Error>(())
//! ```

pub mod approx;
pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod nn;
pub mod tensor;

pub use backend::BackendKind;
pub use config::ContextConfig;
pub use device::dtype::Dtype;
pub use device::event::{Event, UserEvent};
pub use device::{DeviceContext, DeviceHandle};
pub use error::{CompileError, Error, ReleaseError, Result};
pub use tensor::{AsOperand, Operand, Part, Tensor, TensorView};
