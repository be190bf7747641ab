use super::{Coefficient, Component, StateSlot, StepScalars, UpdateRule};
use crate::device::kernel::KernelId;

/// RMSProp: `s ← β·s + (1 − β)·g²`, then `w ← w − lr·g/√(s + ε)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RmsProp {
    /// Learning rate.
    pub lr: Coefficient,
    /// Average decay `β`.
    pub decay: Coefficient,
    /// Denominator offset `ε`.
    pub eps: Coefficient,
}

impl RmsProp {
    /// RMSProp with learning rate `lr`, `β = 0.9` and `ε = 1e-8`.
    #[must_use]
    pub fn new(lr: impl Into<Coefficient>) -> Self {
        Self {
            lr: lr.into(),
            decay: Coefficient::new(0.9),
            eps: Coefficient::new(1e-8),
        }
    }

    /// Replaces `β`.
    #[must_use]
    pub fn with_decay(mut self, decay: impl Into<Coefficient>) -> Self {
        self.decay = decay.into();
        self
    }

    /// Replaces `ε`.
    #[must_use]
    pub fn with_eps(mut self, eps: impl Into<Coefficient>) -> Self {
        self.eps = eps.into();
        self
    }
}

impl UpdateRule for RmsProp {
    fn name(&self) -> &'static str {
        "rmsprop"
    }

    fn kernel(&self) -> KernelId {
        KernelId::RmspropStep
    }

    fn state(&self) -> &'static [StateSlot] {
        &[StateSlot {
            name: "mean_sq",
            init: 0.0,
        }]
    }

    fn scalars(&self, component: Component, _step: u64) -> StepScalars {
        [
            self.lr.get(component),
            self.decay.get(component),
            self.eps.get(component),
            0.0,
            1.0,
            1.0,
        ]
    }
}
