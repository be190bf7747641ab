//! Training objectives.

use num_complex::Complex64;

use super::gradient::GradientSignal;
use crate::device::event::Event;
use crate::error::Result;
use crate::tensor::ops::{abs, abs2, scale, sign, sub};
use crate::tensor::reduce::mean;
use crate::tensor::{Tensor, check_dtype, check_shape};

/// Reduces a network output and its target to a scalar error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Loss {
    /// Mean squared error, `mean(|t − o|²)`.
    #[default]
    Mse,
    /// Mean absolute error, `mean(|t − o|)`.
    Mae,
}

impl Loss {
    /// Scores `output` against `target`. Blocks until the value is read.
    ///
    /// With `with_gradient`, also returns the seed for
    /// [`Network::backward`](super::Network::backward): `−2·(t − o)` for
    /// [`Loss::Mse`] and `−sign(t − o)` for [`Loss::Mae`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`](crate::Error::ShapeMismatch) or
    /// [`Error::DtypeMismatch`](crate::Error::DtypeMismatch) when the tensors
    /// do not line up and
    /// [`Error::InvalidArgument`](crate::Error::InvalidArgument) when they
    /// are empty.
    pub fn compute(
        &self,
        output: &Tensor,
        target: &Tensor,
        with_gradient: bool,
        wait: &[Event],
    ) -> Result<(f64, Option<GradientSignal>)> {
        check_shape("loss", output.shape(), target.shape())?;
        check_dtype(output.dtype(), target.dtype())?;

        // diff = t − o
        let (diff, ev) = target.try_clone(wait)?;
        let ev = sub(output, &diff, &[ev])?;

        let ctx = output.context();
        let magnitudes = Tensor::zeros(ctx, diff.rows(), diff.cols(), diff.dtype())?;
        let ev_m = match self {
            Self::Mse => abs2(&diff, &magnitudes, &[ev.clone()])?,
            Self::Mae => abs(&diff, &magnitudes, &[ev.clone()])?,
        };
        let value = mean(&magnitudes, &[ev_m])?.re;
        if !with_gradient {
            return Ok((value, None));
        }

        let seed = match self {
            Self::Mse => {
                let ev = scale(Complex64::from(-2.0), &diff, &[ev])?;
                GradientSignal::new(diff, ev)
            }
            Self::Mae => {
                let signs = diff.zeros_like()?;
                let ev = sign(&diff, &signs, &[ev])?;
                let ev = scale(Complex64::from(-1.0), &signs, &[ev])?;
                GradientSignal::new(signs, ev)
            }
        };
        Ok((value, Some(seed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceContext;
    use crate::device::dtype::Dtype;

    #[test]
    fn mse_value_and_seed() {
        let ctx = DeviceContext::cpu().unwrap();
        let o = Tensor::from_f64(&ctx, 2, 1, Dtype::F64, &[1.0, 3.0]).unwrap();
        let t = Tensor::from_f64(&ctx, 2, 1, Dtype::F64, &[2.0, 1.0]).unwrap();
        let (value, seed) = Loss::Mse.compute(&o, &t, true, &[]).unwrap();
        assert!((value - 2.5).abs() < 1e-12);
        assert_eq!(seed.unwrap().to_f64_vec().unwrap(), vec![-2.0, 4.0]);
    }

    #[test]
    fn mae_value_and_seed() {
        let ctx = DeviceContext::cpu().unwrap();
        let o = Tensor::from_f64(&ctx, 1, 3, Dtype::F64, &[1.0, 3.0, 0.0]).unwrap();
        let t = Tensor::from_f64(&ctx, 1, 3, Dtype::F64, &[2.0, 1.0, 0.0]).unwrap();
        let (value, seed) = Loss::Mae.compute(&o, &t, true, &[]).unwrap();
        assert!((value - 1.0).abs() < 1e-12);
        assert_eq!(seed.unwrap().to_f64_vec().unwrap(), vec![-1.0, 1.0, 0.0]);
    }

    #[test]
    fn scoring_only() {
        let ctx = DeviceContext::cpu().unwrap();
        let o = Tensor::zeros(&ctx, 2, 2, Dtype::F32).unwrap();
        let (value, seed) = Loss::Mse.compute(&o, &o, false, &[]).unwrap();
        assert_eq!(value, 0.0);
        assert!(seed.is_none());

        let t = Tensor::zeros(&ctx, 2, 1, Dtype::F32).unwrap();
        assert!(Loss::Mae.compute(&o, &t, false, &[]).is_err());
    }
}
