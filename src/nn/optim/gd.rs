use super::{Coefficient, Component, StateSlot, StepScalars, UpdateRule};
use crate::device::kernel::KernelId;

/// Plain gradient descent, `w ← w − lr·g`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gd {
    /// Learning rate.
    pub lr: Coefficient,
}

impl Gd {
    /// Gradient descent with learning rate `lr`.
    #[must_use]
    pub fn new(lr: impl Into<Coefficient>) -> Self {
        Self { lr: lr.into() }
    }
}

impl UpdateRule for Gd {
    fn name(&self) -> &'static str {
        "gd"
    }

    fn kernel(&self) -> KernelId {
        KernelId::SgdStep
    }

    fn state(&self) -> &'static [StateSlot] {
        &[]
    }

    fn scalars(&self, component: Component, _step: u64) -> StepScalars {
        [self.lr.get(component), 0.0, 0.0, 0.0, 1.0, 1.0]
    }
}
