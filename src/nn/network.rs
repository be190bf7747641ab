//! Layer sequences.

use tracing::debug;

use super::cache::NetworkCache;
use super::gradient::{GradientSignal, Gradients};
use super::layer::Layer;
use crate::device::event::Event;
use crate::error::{Error, Result};
use crate::tensor::{Tensor, check_shape};

/// Ordered sequence of layers, each feeding the next.
#[derive(Debug)]
pub struct Network {
    layers: Vec<Layer>,
}

impl Network {
    /// Chains `layers`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an empty list and
    /// [`Error::ShapeMismatch`] if a layer's input size differs from the
    /// previous layer's output size.
    pub fn new(layers: Vec<Layer>) -> Result<Self> {
        if layers.is_empty() {
            return Err(Error::invalid("a network needs at least one layer"));
        }
        for pair in layers.windows(2) {
            check_shape(
                "network chain",
                (1, pair[0].output_size()),
                (1, pair[1].input_size()),
            )?;
        }
        debug!(
            layers = layers.len(),
            inputs = layers[0].input_size(),
            outputs = layers[layers.len() - 1].output_size(),
            "network built"
        );
        Ok(Self { layers })
    }

    /// The layers, input first.
    #[must_use]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Input features of the first layer.
    #[must_use]
    pub fn input_size(&self) -> usize {
        self.layers.first().map_or(0, Layer::input_size)
    }

    /// Output features of the last layer.
    #[must_use]
    pub fn output_size(&self) -> usize {
        self.layers.last().map_or(0, Layer::output_size)
    }

    fn run(
        &self,
        input: &Tensor,
        cache: Option<&mut NetworkCache>,
        wait: &[Event],
    ) -> Result<(Tensor, Event)> {
        let count = self.layers.len();
        let mut caches = cache.map(|c| c.layers_mut(count));
        let mut current: Option<(Tensor, Event)> = None;
        for (i, layer) in self.layers.iter().enumerate() {
            let slot = caches.as_deref_mut().map(|c| &mut c[i]);
            let next = match &current {
                Some((x, ev)) => layer.forward(x, slot, core::slice::from_ref(ev))?,
                None => layer.forward(input, slot, wait)?,
            };
            current = Some(next);
        }
        current.ok_or_else(|| Error::invalid("network without layers"))
    }

    /// Forward pass recording every layer's activations in `cache`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if `input` does not have
    /// [`Network::input_size`] columns or `cache` was filled for a different
    /// batch size.
    pub fn forward(
        &self,
        input: &Tensor,
        cache: &mut NetworkCache,
        wait: &[Event],
    ) -> Result<(Tensor, Event)> {
        self.run(input, Some(cache), wait)
    }

    /// Forward pass without caching.
    ///
    /// # Errors
    ///
    /// See [`Network::forward`].
    pub fn predict(&self, input: &Tensor, wait: &[Event]) -> Result<(Tensor, Event)> {
        self.run(input, None, wait)
    }

    /// Backward pass from the loss `seed` through every layer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `cache` was not filled by
    /// [`Network::forward`] and the first error any layer returns. No
    /// gradients are returned on failure.
    pub fn backward(
        &self,
        seed: GradientSignal,
        cache: &NetworkCache,
        wait: &[Event],
    ) -> Result<Gradients> {
        if cache.len() != self.layers.len() {
            return Err(Error::invalid("network cache does not match the network"));
        }
        let mut signal = seed;
        let mut wait = wait.to_vec();
        let mut layers = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate().rev() {
            let (next, grads) = layer.backward(signal, cache.get(i)?, &wait)?;
            wait.clear();
            signal = next;
            layers.push(grads);
        }
        layers.reverse();
        Ok(Gradients {
            layers,
            input: signal,
        })
    }

    /// Visits every parameter: layer by layer, sub-layer by sub-layer,
    /// weight before bias.
    pub fn for_each_parameter<'a, F: FnMut(&'a Tensor)>(&'a self, f: F) {
        self.layers.iter().flat_map(Layer::parameters).for_each(f);
    }

    /// Mutable [`Network::for_each_parameter`], in the same order.
    pub fn for_each_parameter_mut<'a, F: FnMut(&'a mut Tensor)>(&'a mut self, f: F) {
        self.layers
            .iter_mut()
            .flat_map(Layer::parameters_mut)
            .for_each(f);
    }

    /// Number of parameter tensors.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.layers.iter().flat_map(Layer::parameters).count()
    }

    /// Number of scalar parameters.
    #[must_use]
    pub fn parameter_elements(&self) -> usize {
        self.layers
            .iter()
            .flat_map(Layer::parameters)
            .map(Tensor::len)
            .sum()
    }
}
