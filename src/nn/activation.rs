//! Activation functions.
//!
//! An [`Activation`] transforms a layer's pre-activation in place and
//! evaluates its own derivative at the *activated* output, which is what the
//! backward pass has cached.

use core::fmt;

use crate::device::event::Event;
use crate::device::kernel::KernelId;
use crate::error::Result;
use crate::tensor::ops::{map_in_place, map_into};
use crate::tensor::Tensor;

/// Element-wise (or row-wise, for softmax) non-linearity.
pub trait Activation: fmt::Debug + Send + Sync {
    /// Short lowercase name.
    fn name(&self) -> &'static str;

    /// Applies the activation to `z` in place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compile`](crate::Error::Compile) when the variant has
    /// no kernel for `z`'s dtype or representation.
    fn forward(&self, z: &Tensor, wait: &[Event]) -> Result<Event>;

    /// Evaluates `∂y/∂z` at the activated output `y` into a new tensor.
    ///
    /// # Errors
    ///
    /// See [`Activation::forward`].
    fn derivative(&self, y: &Tensor, wait: &[Event]) -> Result<(Tensor, Event)>;

    /// Drops any device resources the activation holds.
    fn release(&mut self) {}
}

/// Identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct Linear;

impl Activation for Linear {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn forward(&self, z: &Tensor, wait: &[Event]) -> Result<Event> {
        z.context().barrier(wait)
    }

    fn derivative(&self, y: &Tensor, wait: &[Event]) -> Result<(Tensor, Event)> {
        let (ones, ev) = Tensor::full(y.context(), y.rows(), y.cols(), y.dtype(), 1.0)?;
        let ready = y.context().barrier(&[wait, &[ev]].concat())?;
        Ok((ones, ready))
    }
}

/// Logistic sigmoid, `1 / (1 + e⁻ᶻ)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sigmoid;

impl Activation for Sigmoid {
    fn name(&self) -> &'static str {
        "sigmoid"
    }

    fn forward(&self, z: &Tensor, wait: &[Event]) -> Result<Event> {
        map_in_place(KernelId::Sigmoid, z, 0.0, wait)
    }

    fn derivative(&self, y: &Tensor, wait: &[Event]) -> Result<(Tensor, Event)> {
        map_into(KernelId::SigmoidGrad, y, 0.0, wait)
    }
}

/// Hyperbolic tangent.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tanh;

impl Activation for Tanh {
    fn name(&self) -> &'static str {
        "tanh"
    }

    fn forward(&self, z: &Tensor, wait: &[Event]) -> Result<Event> {
        map_in_place(KernelId::Tanh, z, 0.0, wait)
    }

    fn derivative(&self, y: &Tensor, wait: &[Event]) -> Result<(Tensor, Event)> {
        map_into(KernelId::TanhGrad, y, 0.0, wait)
    }
}

/// Rectified linear unit. Real tensors only.
#[derive(Debug, Clone, Copy, Default)]
pub struct Relu;

impl Activation for Relu {
    fn name(&self) -> &'static str {
        "relu"
    }

    fn forward(&self, z: &Tensor, wait: &[Event]) -> Result<Event> {
        map_in_place(KernelId::Relu, z, 0.0, wait)
    }

    fn derivative(&self, y: &Tensor, wait: &[Event]) -> Result<(Tensor, Event)> {
        map_into(KernelId::ReluGrad, y, 0.0, wait)
    }
}

/// ReLU with slope `slope` for negative inputs. Real tensors only.
#[derive(Debug, Clone, Copy)]
pub struct LeakyRelu {
    /// Slope applied to non-positive inputs.
    pub slope: f64,
}

impl LeakyRelu {
    /// A leaky ReLU with the given negative slope.
    #[must_use]
    pub const fn new(slope: f64) -> Self {
        Self { slope }
    }
}

impl Default for LeakyRelu {
    fn default() -> Self {
        Self::new(0.01)
    }
}

impl Activation for LeakyRelu {
    fn name(&self) -> &'static str {
        "leaky_relu"
    }

    fn forward(&self, z: &Tensor, wait: &[Event]) -> Result<Event> {
        map_in_place(KernelId::LeakyRelu, z, self.slope, wait)
    }

    fn derivative(&self, y: &Tensor, wait: &[Event]) -> Result<(Tensor, Event)> {
        map_into(KernelId::LeakyReluGrad, y, self.slope, wait)
    }
}

/// Row-wise softmax. Real tensors only.
///
/// The derivative is the diagonal of the Jacobian, `y(1 - y)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Softmax;

impl Activation for Softmax {
    fn name(&self) -> &'static str {
        "softmax"
    }

    fn forward(&self, z: &Tensor, wait: &[Event]) -> Result<Event> {
        map_in_place(KernelId::Softmax, z, 0.0, wait)
    }

    fn derivative(&self, y: &Tensor, wait: &[Event]) -> Result<(Tensor, Event)> {
        map_into(KernelId::SoftmaxGrad, y, 0.0, wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceContext;
    use crate::device::dtype::Dtype;
    use crate::error::Error;
    use num_complex::Complex64;

    #[test]
    fn forward_values() {
        let ctx = DeviceContext::cpu().unwrap();
        let z = Tensor::from_f64(&ctx, 1, 3, Dtype::F64, &[-2.0, 0.0, 3.0]).unwrap();
        let ev = LeakyRelu::new(0.5).forward(&z, &[]).unwrap();
        assert_eq!(z.to_f64_vec(&[ev]).unwrap(), vec![-1.0, 0.0, 3.0]);

        let z = Tensor::from_f64(&ctx, 2, 2, Dtype::F64, &[1.0, 1.0, 0.0, 2.0_f64.ln()]).unwrap();
        let ev = Softmax.forward(&z, &[]).unwrap();
        let got = z.to_f64_vec(&[ev]).unwrap();
        assert!((got[0] - 0.5).abs() < 1e-12 && (got[1] - 0.5).abs() < 1e-12);
        assert!((got[2] - 1.0 / 3.0).abs() < 1e-12 && (got[3] - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn linear_derivative_is_one() {
        let ctx = DeviceContext::cpu().unwrap();
        let y = Tensor::from_f64(&ctx, 2, 1, Dtype::F32, &[4.0, -4.0]).unwrap();
        let (d, ev) = Linear.derivative(&y, &[]).unwrap();
        assert_eq!(d.to_f64_vec(&[ev]).unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn real_only_variants_reject_complex_tensors() {
        let ctx = DeviceContext::cpu().unwrap();
        let z = Tensor::from_complex(&ctx, 1, 1, Dtype::F64, &[Complex64::new(1.0, 1.0)]).unwrap();
        assert!(matches!(Relu.forward(&z, &[]), Err(Error::Compile(_))));
        assert!(Sigmoid.forward(&z, &[]).is_ok());
    }
}
