//! Forward activations kept for the backward pass.

use crate::device::event::Event;
use crate::error::{Error, Result};
use crate::tensor::ops::copy;
use crate::tensor::{Tensor, check_shape};

/// One layer's snapshot: the input in slot 0, then the activated output of
/// every sub-layer.
#[derive(Debug, Default)]
pub struct Cache {
    slots: Vec<Tensor>,
}

impl Cache {
    /// An empty cache, filled by the first cached forward call.
    #[must_use]
    pub const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Number of filled slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing has been cached yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot `k`.
    #[must_use]
    pub fn slot(&self, k: usize) -> Option<&Tensor> {
        self.slots.get(k)
    }

    pub(crate) fn get(&self, k: usize) -> Result<&Tensor> {
        self.slots
            .get(k)
            .ok_or_else(|| Error::invalid(format!("cache slot {k} missing, run a cached forward first")))
    }

    /// Checks a reused cache against the shapes a forward pass will write.
    /// Nothing is written when this fails.
    pub(crate) fn check(&self, shapes: &[(usize, usize)]) -> Result<()> {
        if self.slots.is_empty() {
            return Ok(());
        }
        if self.slots.len() != shapes.len() {
            return Err(Error::invalid(format!(
                "cache has {} slots, layer needs {}",
                self.slots.len(),
                shapes.len()
            )));
        }
        for (slot, &shape) in self.slots.iter().zip(shapes) {
            check_shape("cache", slot.shape(), shape)?;
        }
        Ok(())
    }

    /// Copies `value` into slot `k`, allocating the slot on first use.
    pub(crate) fn store(&mut self, k: usize, value: &Tensor, wait: &[Event]) -> Result<Event> {
        if k == self.slots.len() {
            let (copy, ev) = value.try_clone(wait)?;
            self.slots.push(copy);
            return Ok(ev);
        }
        let slot = self.get(k)?;
        if value.is_complex() {
            slot.promote_complex()?;
        }
        copy(value, slot, wait)
    }

    /// Drops every slot.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Per-layer caches of a network.
#[derive(Debug, Default)]
pub struct NetworkCache {
    layers: Vec<Cache>,
}

impl NetworkCache {
    /// An empty cache.
    #[must_use]
    pub const fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Cache of layer `i`.
    #[must_use]
    pub fn layer(&self, i: usize) -> Option<&Cache> {
        self.layers.get(i)
    }

    /// Number of layer caches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether no forward pass has been cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub(crate) fn layers_mut(&mut self, count: usize) -> &mut [Cache] {
        if self.layers.len() != count {
            self.layers.resize_with(count, Cache::new);
        }
        &mut self.layers
    }

    pub(crate) fn get(&self, i: usize) -> Result<&Cache> {
        self.layers
            .get(i)
            .ok_or_else(|| Error::invalid(format!("no cache for layer {i}, run a cached forward first")))
    }

    /// Releases every cached tensor.
    pub fn free(self) {
        drop(self);
    }
}
