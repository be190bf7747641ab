//! Weight penalties.

use num_complex::Complex64;

use crate::device::event::Event;
use crate::error::Result;
use crate::tensor::ops::{abs, abs2, axpby, sign};
use crate::tensor::reduce::sum;
use crate::tensor::Tensor;

/// Penalty added to a layer's loss through its final weight.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Regularizer {
    /// No penalty.
    #[default]
    None,
    /// `λ·Σ|w|`, gradient `λ·sign(w)`.
    L1(f64),
    /// `λ/2·Σ|w|²`, gradient `λ·w`.
    L2(f64),
}

impl Regularizer {
    /// Whether this regularizer contributes anything.
    #[must_use]
    pub fn is_active(&self) -> bool {
        match *self {
            Self::None => false,
            Self::L1(lambda) | Self::L2(lambda) => lambda != 0.0,
        }
    }

    /// The penalty gradient of `weight` in a new tensor, or `None` when
    /// inactive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`](crate::Error::AllocationFailure)
    /// when the device is out of memory.
    pub fn gradient(&self, weight: &Tensor, wait: &[Event]) -> Result<Option<(Tensor, Event)>> {
        if !self.is_active() {
            return Ok(None);
        }
        let out = weight.zeros_like()?;
        let ev = self.accumulate(weight, &out, wait)?;
        Ok(Some((out, ev)))
    }

    /// `gradient ← gradient + ∂penalty/∂weight`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`](crate::Error::ShapeMismatch) if the
    /// shapes differ.
    pub fn accumulate(&self, weight: &Tensor, gradient: &Tensor, wait: &[Event]) -> Result<Event> {
        let one = Complex64::from(1.0);
        match *self {
            Self::None => gradient.context().barrier(wait),
            Self::L1(lambda) => {
                let signs = weight.zeros_like()?;
                let ev = sign(weight, &signs, wait)?;
                axpby(Complex64::from(lambda), &signs, one, gradient, &[ev])
            }
            Self::L2(lambda) => axpby(Complex64::from(lambda), weight, one, gradient, wait),
        }
    }

    /// Value of the penalty at `weight`. Blocks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceExecution`](crate::Error::DeviceExecution) if a
    /// dependency failed.
    pub fn value(&self, weight: &Tensor, wait: &[Event]) -> Result<f64> {
        let (lambda, squared) = match *self {
            Self::None => return Ok(0.0),
            Self::L1(lambda) => (lambda, false),
            Self::L2(lambda) => (lambda, true),
        };
        let magnitudes = Tensor::zeros(weight.context(), weight.rows(), weight.cols(), weight.dtype())?;
        let ev = if squared {
            abs2(weight, &magnitudes, wait)?
        } else {
            abs(weight, &magnitudes, wait)?
        };
        let total = sum(&magnitudes, &[ev])?.re;
        Ok(if squared { 0.5 * lambda * total } else { lambda * total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceContext;
    use crate::device::dtype::Dtype;

    #[test]
    fn penalty_gradients() {
        let ctx = DeviceContext::cpu().unwrap();
        let w = Tensor::from_f64(&ctx, 1, 3, Dtype::F64, &[-2.0, 0.0, 4.0]).unwrap();

        let (g, ev) = Regularizer::L1(0.5).gradient(&w, &[]).unwrap().unwrap();
        assert_eq!(g.to_f64_vec(&[ev]).unwrap(), vec![-0.5, 0.0, 0.5]);

        let g = Tensor::from_f64(&ctx, 1, 3, Dtype::F64, &[1.0, 1.0, 1.0]).unwrap();
        let ev = Regularizer::L2(0.5).accumulate(&w, &g, &[]).unwrap();
        assert_eq!(g.to_f64_vec(&[ev]).unwrap(), vec![0.0, 1.0, 3.0]);

        assert!(Regularizer::None.gradient(&w, &[]).unwrap().is_none());
    }

    #[test]
    fn penalty_values() {
        let ctx = DeviceContext::cpu().unwrap();
        let w = Tensor::from_f64(&ctx, 2, 1, Dtype::F64, &[-3.0, 4.0]).unwrap();
        assert!((Regularizer::L1(0.1).value(&w, &[]).unwrap() - 0.7).abs() < 1e-12);
        assert!((Regularizer::L2(0.1).value(&w, &[]).unwrap() - 1.25).abs() < 1e-12);
        assert_eq!(Regularizer::None.value(&w, &[]).unwrap(), 0.0);
    }
}
