use super::{Coefficient, Component, StateSlot, StepScalars, UpdateRule};
use crate::device::kernel::KernelId;

/// Nesterov accelerated gradient.
///
/// `v ← μ·v + g`, then `w ← w − lr·(g + μ·v)`, every step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Nesterov {
    /// Learning rate.
    pub lr: Coefficient,
    /// Momentum `μ`.
    pub momentum: Coefficient,
}

impl Nesterov {
    /// Nesterov descent with learning rate `lr` and momentum `momentum`.
    #[must_use]
    pub fn new(lr: impl Into<Coefficient>, momentum: impl Into<Coefficient>) -> Self {
        Self {
            lr: lr.into(),
            momentum: momentum.into(),
        }
    }
}

impl UpdateRule for Nesterov {
    fn name(&self) -> &'static str {
        "nesterov"
    }

    fn kernel(&self) -> KernelId {
        KernelId::NesterovStep
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_ahead_with_the_updated_velocity() {
        let rule = Nesterov::new(0.1, Coefficient::split(0.9, 0.5));
        let s = rule.scalars(Component::Im, 3);
        assert_eq!((s[0], s[1]), (0.1, 0.5));
        assert_eq!(rule.state().len(), 1);
    }
}
