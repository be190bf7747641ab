//! Backward-pass carriers.

use crate::device::event::Event;
use crate::error::Result;
use crate::tensor::Tensor;

/// The error flowing backwards through a network.
///
/// `error` is the error with respect to the input of whatever produced the
/// signal. After a layer's backward step, `propagated` holds, per sub-layer,
/// the error once the activation derivative had been applied.
#[derive(Debug)]
pub struct GradientSignal {
    error: Tensor,
    event: Event,
    propagated: Vec<Tensor>,
}

impl GradientSignal {
    /// A seed signal, as produced by a loss.
    #[must_use]
    pub const fn new(error: Tensor, event: Event) -> Self {
        Self {
            error,
            event,
            propagated: Vec::new(),
        }
    }

    pub(crate) const fn with_propagated(error: Tensor, event: Event, propagated: Vec<Tensor>) -> Self {
        Self {
            error,
            event,
            propagated,
        }
    }

    /// The current error.
    #[must_use]
    pub const fn error(&self) -> &Tensor {
        &self.error
    }

    /// Completes once [`GradientSignal::error`] and every propagated error
    /// are written.
    #[must_use]
    pub fn event(&self) -> Event {
        self.event.clone()
    }

    /// Per-sub-layer errors, first sub-layer first. Empty for a seed.
    #[must_use]
    pub fn propagated(&self) -> &[Tensor] {
        &self.propagated
    }

    /// Splits into the error and its event, dropping the propagated errors.
    #[must_use]
    pub fn into_error(self) -> (Tensor, Event) {
        (self.error, self.event)
    }

    /// Downloads the current error. Blocks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceExecution`](crate::Error::DeviceExecution) if
    /// the signal's computation failed.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        self.error.to_f64_vec(core::slice::from_ref(&self.event))
    }
}

/// Weight and bias gradients of one layer, in sub-layer order.
#[derive(Debug)]
pub struct LayerGradients {
    pub(crate) weights: Vec<Tensor>,
    pub(crate) biases: Vec<Option<Tensor>>,
    pub(crate) event: Event,
}

impl LayerGradients {
    /// Weight gradients, one per sub-layer.
    #[must_use]
    pub fn weights(&self) -> &[Tensor] {
        &self.weights
    }

    /// Bias gradients; `None` for bias-free sub-layers.
    #[must_use]
    pub fn biases(&self) -> &[Option<Tensor>] {
        &self.biases
    }

    /// Completes once every gradient is written.
    #[must_use]
    pub fn event(&self) -> Event {
        self.event.clone()
    }

    /// Gradients in parameter order: per sub-layer, weight before bias.
    pub fn iter(&self) -> impl Iterator<Item = &Tensor> {
        self.weights
            .iter()
            .zip(&self.biases)
            .flat_map(|(w, b)| core::iter::once(w).chain(b.as_ref()))
    }
}

/// Everything [`Network::backward`](super::Network::backward) produces.
#[derive(Debug)]
pub struct Gradients {
    pub(crate) layers: Vec<LayerGradients>,
    pub(crate) input: GradientSignal,
}

impl Gradients {
    /// Per-layer gradients, first layer first.
    #[must_use]
    pub fn layers(&self) -> &[LayerGradients] {
        &self.layers
    }

    /// Error with respect to the network input.
    #[must_use]
    pub const fn input_error(&self) -> &GradientSignal {
        &self.input
    }

    /// Every gradient in the network's parameter order.
    pub fn iter(&self) -> impl Iterator<Item = &Tensor> {
        self.layers.iter().flat_map(LayerGradients::iter)
    }

    /// Number of gradient tensors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Whether there are no gradients at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events of every layer plus the input error.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.layers
            .iter()
            .map(LayerGradients::event)
            .chain(core::iter::once(self.input.event()))
            .collect()
    }
}
