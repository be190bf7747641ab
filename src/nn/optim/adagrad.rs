use super::{Coefficient, Component, StateSlot, StepScalars, UpdateRule};
use crate::device::kernel::KernelId;

/// AdaGrad: `s ← s + g²`, then `w ← w − lr·g/√(s + ε)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaGrad {
    /// Learning rate.
    pub lr: Coefficient,
    /// Denominator offset `ε`.
    pub eps: Coefficient,
}

impl AdaGrad {
    /// AdaGrad with learning rate `lr` and `ε = 1e-8`.
    #[must_use]
    pub fn new(lr: impl Into<Coefficient>) -> Self {
        Self {
            lr: lr.into(),
            eps: Coefficient::new(1e-8),
        }
    }

    /// Replaces `ε`.
    #[must_use]
    pub fn with_eps(mut self, eps: impl Into<Coefficient>) -> Self {
        self.eps = eps.into();
        self
    }
}

impl UpdateRule for AdaGrad {
    fn name(&self) -> &'static str {
        "adagrad"
    }

    fn kernel(&self) -> KernelId {
        KernelId::AdagradStep
    }

    fn state(&self) -> &'static [StateSlot] {
        &[StateSlot {
            name: "sum_sq",
            init: 0.0,
        }]
    }

    fn scalars(&self, component: Component, _step: u64) -> StepScalars {
        [self.lr.get(component), 0.0, self.eps.get(component), 0.0, 1.0, 1.0]
    }
}
