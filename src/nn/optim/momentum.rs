use super::{Coefficient, Component, StateSlot, StepScalars, UpdateRule};
use crate::device::kernel::KernelId;

/// Gradient descent with heavy-ball momentum.
///
/// `v ← β·v + g`, then `w ← w − lr·v`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Momentum {
    /// Learning rate.
    pub lr: Coefficient,
    /// Velocity decay `β`.
    pub momentum: Coefficient,
}

impl Momentum {
    /// Momentum descent with learning rate `lr` and decay `momentum`.
    #[must_use]
    pub fn new(lr: impl Into<Coefficient>, momentum: impl Into<Coefficient>) -> Self {
        Self {
            lr: lr.into(),
            momentum: momentum.into(),
        }
    }
}

impl UpdateRule for Momentum {
    fn name(&self) -> &'static str {
        "momentum"
    }

    fn kernel(&self) -> KernelId {
        KernelId::MomentumStep
    }

    fn state(&self) -> &'static [StateSlot] {
        &[StateSlot {
            name: "velocity",
            init: 0.0,
        }]
    }

    fn scalars(&self, component: Component, _step: u64) -> StepScalars {
        [
            self.lr.get(component),
            self.momentum.get(component),
            0.0,
            0.0,
            1.0,
            1.0,
        ]
    }
}
