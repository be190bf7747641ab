//! Dense layers.
//!
//! A [`Layer`] is a stack of fully connected sub-layers sharing one
//! activation. Sub-layer `k` maps `X` to `act(X·Wₖᵀ + bₖ)` where `Wₖ` is
//! `out × in` and the optional bias `bₖ` is a `1 × out` row broadcast over the
//! batch.

use std::sync::Arc;

use rand::Rng;
use tracing::trace;

use super::activation::Activation;
use super::cache::Cache;
use super::gradient::{GradientSignal, LayerGradients};
use super::regularizer::Regularizer;
use crate::device::DeviceContext;
use crate::device::dtype::Dtype;
use crate::device::event::Event;
use crate::error::{Error, Result};
use crate::tensor::gemm::{Gemm, Op, product};
use crate::tensor::ops::{add_row, conj, hadamard};
use crate::tensor::reduce::sum_rows;
use crate::tensor::{Tensor, check_dtype, check_shape};

/// Stack of dense sub-layers with a shared activation.
#[derive(Debug)]
pub struct Layer {
    weights: Vec<Tensor>,
    biases: Vec<Option<Tensor>>,
    activation: Box<dyn Activation>,
    regularizer: Regularizer,
    dtype: Dtype,
}

impl Layer {
    /// Randomly initialized sub-layers mapping `sizes[0]` features through
    /// `sizes[1..]`.
    ///
    /// Weights are drawn from the Xavier uniform range
    /// `±√(6 / (in + out))`; biases start at zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for fewer than two sizes or a zero
    /// size, and [`Error::AllocationFailure`] when the device is out of
    /// memory.
    #[allow(clippy::cast_precision_loss)]
    pub fn dense<R: Rng + ?Sized>(
        ctx: &Arc<DeviceContext>,
        sizes: &[usize],
        dtype: Dtype,
        bias: bool,
        activation: impl Activation + 'static,
        rng: &mut R,
    ) -> Result<Self> {
        if sizes.len() < 2 || sizes.contains(&0) {
            return Err(Error::invalid(format!("invalid layer sizes {sizes:?}")));
        }
        let mut weights = Vec::with_capacity(sizes.len() - 1);
        let mut biases = Vec::with_capacity(sizes.len() - 1);
        for pair in sizes.windows(2) {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
            let data: Vec<f64> = (0..fan_in * fan_out)
                .map(|_| rng.random_range(-limit..limit))
                .collect();
            weights.push(Tensor::from_f64(ctx, fan_out, fan_in, dtype, &data)?);
            biases.push(if bias {
                Some(Tensor::zeros(ctx, 1, fan_out, dtype)?)
            } else {
                None
            });
        }
        Self::from_parameters(weights, biases, activation)
    }

    /// A layer over existing parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when there are no weights or the
    /// bias list has a different length, [`Error::ShapeMismatch`] when
    /// consecutive weights do not chain or a bias is not `1 × out`, and
    /// [`Error::DtypeMismatch`] for mixed dtypes.
    pub fn from_parameters(
        weights: Vec<Tensor>,
        biases: Vec<Option<Tensor>>,
        activation: impl Activation + 'static,
    ) -> Result<Self> {
        let first = weights
            .first()
            .ok_or_else(|| Error::invalid("a layer needs at least one weight"))?;
        if biases.len() != weights.len() {
            return Err(Error::invalid(format!(
                "{} weights but {} bias entries",
                weights.len(),
                biases.len()
            )));
        }
        let dtype = first.dtype();
        for (k, w) in weights.iter().enumerate() {
            check_dtype(dtype, w.dtype())?;
            if k > 0 {
                let prev = &weights[k - 1];
                check_shape("layer chain", (w.rows(), w.cols()), (w.rows(), prev.rows()))?;
            }
            if let Some(b) = &biases[k] {
                check_dtype(dtype, b.dtype())?;
                check_shape("layer bias", b.shape(), (1, w.rows()))?;
            }
        }
        Ok(Self {
            weights,
            biases,
            activation: Box::new(activation),
            regularizer: Regularizer::None,
            dtype,
        })
    }

    /// Binds a weight penalty.
    #[must_use]
    pub const fn with_regularizer(mut self, regularizer: Regularizer) -> Self {
        self.regularizer = regularizer;
        self
    }

    /// Number of sub-layers.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.weights.len()
    }

    /// Input features.
    #[must_use]
    pub fn input_size(&self) -> usize {
        self.weights.first().map_or(0, Tensor::cols)
    }

    /// Output features.
    #[must_use]
    pub fn output_size(&self) -> usize {
        self.weights.last().map_or(0, Tensor::rows)
    }

    /// Element type of every parameter.
    #[must_use]
    pub const fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Weights, first sub-layer first.
    #[must_use]
    pub fn weights(&self) -> &[Tensor] {
        &self.weights
    }

    /// Biases, `None` for bias-free sub-layers.
    #[must_use]
    pub fn biases(&self) -> &[Option<Tensor>] {
        &self.biases
    }

    /// The shared activation.
    #[must_use]
    pub fn activation(&self) -> &dyn Activation {
        self.activation.as_ref()
    }

    /// The bound penalty.
    #[must_use]
    pub const fn regularizer(&self) -> Regularizer {
        self.regularizer
    }

    /// Parameters per sub-layer, weight before bias.
    pub fn parameters(&self) -> impl Iterator<Item = &Tensor> {
        self.weights
            .iter()
            .zip(&self.biases)
            .flat_map(|(w, b)| core::iter::once(w).chain(b.as_ref()))
    }

    /// Mutable [`Layer::parameters`].
    pub fn parameters_mut(&mut self) -> impl Iterator<Item = &mut Tensor> {
        self.weights
            .iter_mut()
            .zip(&mut self.biases)
            .flat_map(|(w, b)| core::iter::once(w).chain(b.as_mut()))
    }

    fn cache_shapes(&self, rows: usize) -> Vec<(usize, usize)> {
        core::iter::once((rows, self.input_size()))
            .chain(self.weights.iter().map(|w| (rows, w.rows())))
            .collect()
    }

    /// Runs every sub-layer on `input` (`batch × input_size`).
    ///
    /// With a cache, slot 0 receives a copy of `input` and slot `k + 1` the
    /// activated output of sub-layer `k`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if `input` has the wrong number of
    /// columns or a reused cache has different shapes, and whatever the
    /// kernels return.
    pub fn forward(
        &self,
        input: &Tensor,
        mut cache: Option<&mut Cache>,
        wait: &[Event],
    ) -> Result<(Tensor, Event)> {
        let rows = input.rows();
        check_shape("layer forward", input.shape(), (rows, self.input_size()))?;
        check_dtype(self.dtype, input.dtype())?;
        if let Some(cache) = cache.as_deref() {
            cache.check(&self.cache_shapes(rows))?;
        }

        let mut stored = Vec::new();
        if let Some(cache) = cache.as_deref_mut() {
            stored.push(cache.store(0, input, wait)?);
        }
        let mut ready = wait.to_vec();
        let mut current: Option<Tensor> = None;
        for (k, (w, b)) in self.weights.iter().zip(&self.biases).enumerate() {
            let x = current.as_ref().unwrap_or(input);
            let (z, ev) = product(Gemm::new().op_b(Op::T), x, w, false, &ready)?;
            let ev = match b {
                Some(b) => add_row(b, &z, &[ev])?,
                None => ev,
            };
            let ev = self.activation.forward(&z, &[ev])?;
            if let Some(cache) = cache.as_deref_mut() {
                stored.push(cache.store(k + 1, &z, core::slice::from_ref(&ev))?);
            }
            ready = vec![ev];
            current = Some(z);
        }
        trace!(
            activation = self.activation.name(),
            depth = self.depth(),
            rows,
            "layer forward"
        );

        let output = current.ok_or_else(|| Error::invalid("layer without sub-layers"))?;
        ready.extend(stored);
        let ev = output.context().barrier(&ready)?;
        Ok((output, ev))
    }

    /// Propagates `signal` (the error at this layer's output) back through
    /// every sub-layer using the activations in `cache`.
    ///
    /// Returns the error at the layer's input, carrying the per-sub-layer
    /// errors, and the parameter gradients. A bound regularizer contributes
    /// to the final weight's gradient only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `cache` does not belong to a
    /// cached forward of this layer and [`Error::ShapeMismatch`] if the
    /// signal does not match the cached output.
    pub fn backward(
        &self,
        signal: GradientSignal,
        cache: &Cache,
        wait: &[Event],
    ) -> Result<(GradientSignal, LayerGradients)> {
        let depth = self.depth();
        if cache.len() != depth + 1 {
            return Err(Error::invalid(format!(
                "cache has {} slots, layer needs {}",
                cache.len(),
                depth + 1
            )));
        }
        let (mut error, ev) = signal.into_error();
        check_shape("layer backward", error.shape(), cache.get(depth)?.shape())?;
        let ctx = Arc::clone(error.context());
        let mut ready = ctx.barrier(&[wait, &[ev]].concat())?;

        let mut regularizer = self.regularizer.is_active().then_some(self.regularizer);
        let mut weights = Vec::with_capacity(depth);
        let mut biases = Vec::with_capacity(depth);
        let mut propagated = Vec::with_capacity(depth);
        let mut pending = Vec::new();
        for k in (0..depth).rev() {
            let w = &self.weights[k];
            let (d, ev) = self.activation.derivative(cache.get(k + 1)?, &[ready.clone()])?;
            let ev = if d.is_complex() { conj(&d, &[ev])? } else { ev };
            let ev_e = hadamard(&d, &error, &[ev])?;

            let input = cache.get(k)?;
            let gemm = Gemm::new().op_a(Op::T);
            let (gw, ev_w) = if input.is_complex() {
                let (input, ev) = conjugated(input, &[])?;
                product(gemm, &error, &input, false, &[ev_e.clone(), ev])?
            } else {
                product(gemm, &error, input, false, &[ev_e.clone()])?
            };
            let ev_w = match regularizer.take() {
                Some(r) => r.accumulate(w, &gw, &[ev_w])?,
                None => ev_w,
            };
            pending.push(ev_w);
            weights.push(gw);

            biases.push(match &self.biases[k] {
                Some(_) => {
                    let (gb, ev) = sum_rows(&error, &[ev_e.clone()])?;
                    pending.push(ev);
                    Some(gb)
                }
                None => None,
            });

            let (next, ev) = if w.is_complex() {
                let (w, ev) = conjugated(w, &[])?;
                product(Gemm::new(), &error, &w, false, &[ev_e, ev])?
            } else {
                product(Gemm::new(), &error, w, false, &[ev_e])?
            };
            propagated.push(error);
            error = next;
            ready = ev;
        }
        weights.reverse();
        biases.reverse();
        propagated.reverse();
        trace!(activation = self.activation.name(), depth, "layer backward");

        pending.push(ready);
        let done = ctx.barrier(&pending)?;
        Ok((
            GradientSignal::with_propagated(error, done.clone(), propagated),
            LayerGradients {
                weights,
                biases,
                event: done,
            },
        ))
    }
}

impl Drop for Layer {
    fn drop(&mut self) {
        self.activation.release();
    }
}

fn conjugated(t: &Tensor, wait: &[Event]) -> Result<(Tensor, Event)> {
    let (copy, ev) = t.try_clone(wait)?;
    let ev = conj(&copy, &[ev])?;
    Ok((copy, ev))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::activation::{Linear, Sigmoid};
    use rand::{SeedableRng, rngs::StdRng};

    fn tensor(ctx: &Arc<DeviceContext>, rows: usize, cols: usize, data: &[f64]) -> Tensor {
        Tensor::from_f64(ctx, rows, cols, Dtype::F64, data).unwrap()
    }

    #[test]
    fn forward_matches_host_reference() {
        let ctx = DeviceContext::cpu().unwrap();
        let w = tensor(&ctx, 2, 3, &[1.0, 0.0, -1.0, 0.5, 0.5, 0.5]);
        let b = tensor(&ctx, 1, 2, &[0.0, 1.0]);
        let layer = Layer::from_parameters(vec![w], vec![Some(b)], Linear).unwrap();
        let x = tensor(&ctx, 2, 3, &[1.0, 2.0, 3.0, 0.0, 0.0, 2.0]);
        let (y, ev) = layer.forward(&x, None, &[]).unwrap();
        assert_eq!(y.shape(), (2, 2));
        assert_eq!(y.to_f64_vec(&[ev]).unwrap(), vec![-2.0, 4.0, -2.0, 2.0]);
    }

    #[test]
    fn forward_rejects_wrong_width() {
        let ctx = DeviceContext::cpu().unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let layer = Layer::dense(&ctx, &[3, 2], Dtype::F64, true, Sigmoid, &mut rng).unwrap();
        let x = Tensor::zeros(&ctx, 4, 2, Dtype::F64).unwrap();
        assert!(matches!(
            layer.forward(&x, None, &[]),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn cache_is_reused_and_checked() {
        let ctx = DeviceContext::cpu().unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let layer = Layer::dense(&ctx, &[2, 3, 1], Dtype::F64, false, Sigmoid, &mut rng).unwrap();
        let mut cache = Cache::new();
        let x = tensor(&ctx, 2, 2, &[1.0, 0.0, 0.0, 1.0]);
        let (y, ev) = layer.forward(&x, Some(&mut cache), &[]).unwrap();
        assert_eq!(cache.len(), 3);
        let cached = cache.slot(2).unwrap().to_f64_vec(&[ev.clone()]).unwrap();
        assert_eq!(cached, y.to_f64_vec(&[ev]).unwrap());

        let (_, ev) = layer.forward(&x, Some(&mut cache), &[]).unwrap();
        ev.wait().unwrap();
        assert_eq!(cache.len(), 3);

        let wider = Tensor::zeros(&ctx, 3, 2, Dtype::F64).unwrap();
        assert!(matches!(
            layer.forward(&wider, Some(&mut cache), &[]),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn linear_backward_gradients() {
        let ctx = DeviceContext::cpu().unwrap();
        let w = tensor(&ctx, 1, 2, &[2.0, -1.0]);
        let b = tensor(&ctx, 1, 1, &[0.5]);
        let layer = Layer::from_parameters(vec![w], vec![Some(b)], Linear)
            .unwrap()
            .with_regularizer(Regularizer::L2(1.0));
        let mut cache = Cache::new();
        let x = tensor(&ctx, 2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let (_, ev) = layer.forward(&x, Some(&mut cache), &[]).unwrap();

        let seed = tensor(&ctx, 2, 1, &[1.0, -1.0]);
        let signal = GradientSignal::new(seed, Event::complete());
        let (signal, grads) = layer.backward(signal, &cache, &[ev]).unwrap();
        let done = grads.event();

        // Eᵀ·X = [1·1 − 1·3, 1·2 − 1·4] plus λ·w.
        let gw = grads.weights()[0].to_f64_vec(&[done.clone()]).unwrap();
        assert_eq!(gw, vec![-2.0 + 2.0, -2.0 - 1.0]);
        let gb = grads.biases()[0].as_ref().unwrap().to_f64_vec(&[done]).unwrap();
        assert_eq!(gb, vec![0.0]);

        assert_eq!(signal.error().shape(), (2, 2));
        assert_eq!(signal.propagated().len(), 1);
        assert_eq!(signal.to_f64_vec().unwrap(), vec![2.0, -1.0, -2.0, 1.0]);
    }

    #[test]
    fn backward_without_cache_fails() {
        let ctx = DeviceContext::cpu().unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let layer = Layer::dense(&ctx, &[2, 2], Dtype::F64, true, Sigmoid, &mut rng).unwrap();
        let seed = Tensor::zeros(&ctx, 1, 2, Dtype::F64).unwrap();
        let signal = GradientSignal::new(seed, Event::complete());
        assert!(matches!(
            layer.backward(signal, &Cache::new(), &[]),
            Err(Error::InvalidArgument(_))
        ));
    }
}
