use super::{Coefficient, Component, StateSlot, StepScalars, UpdateRule};
use crate::device::kernel::KernelId;

/// Adam with bias-corrected moments.
///
/// `m ← β₁·m + (1 − β₁)·g`, `v ← β₂·v + (1 − β₂)·g²`, then
/// `w ← w − lr·m̂/(√v̂ + ε)` with `m̂ = m/(1 − β₁ᵗ)` and `v̂ = v/(1 − β₂ᵗ)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adam {
    /// Learning rate.
    pub lr: Coefficient,
    /// First moment decay `β₁`.
    pub beta1: Coefficient,
    /// Second moment decay `β₂`.
    pub beta2: Coefficient,
    /// Denominator offset `ε`.
    pub eps: Coefficient,
}

impl Adam {
    /// Adam with learning rate `lr`, `β₁ = 0.9`, `β₂ = 0.999`, `ε = 1e-8`.
    #[must_use]
    pub fn new(lr: impl Into<Coefficient>) -> Self {
        Self {
            lr: lr.into(),
            beta1: Coefficient::new(0.9),
            beta2: Coefficient::new(0.999),
            eps: Coefficient::new(1e-8),
        }
    }

    /// Replaces `β₁` and `β₂`.
    #[must_use]
    pub fn with_betas(mut self, beta1: impl Into<Coefficient>, beta2: impl Into<Coefficient>) -> Self {
        self.beta1 = beta1.into();
        self.beta2 = beta2.into();
        self
    }

    /// Replaces `ε`.
    #[must_use]
    pub fn with_eps(mut self, eps: impl Into<Coefficient>) -> Self {
        self.eps = eps.into();
        self
    }
}

impl UpdateRule for Adam {
    fn name(&self) -> &'static str {
        "adam"
    }

    fn kernel(&self) -> KernelId {
        KernelId::AdamStep
    }

    fn state(&self) -> &'static [StateSlot] {
        &[
            StateSlot {
                name: "first_moment",
                init: 0.0,
            },
            StateSlot {
                name: "second_moment",
                init: 0.0,
            },
        ]
    }

    fn scalars(&self, component: Component, step: u64) -> StepScalars {
        let t = i32::try_from(step).unwrap_or(i32::MAX);
        let (beta1, beta2) = (self.beta1.get(component), self.beta2.get(component));
        [
            self.lr.get(component),
            beta1,
            self.eps.get(component),
            beta2,
            1.0 - beta1.powi(t),
            1.0 - beta2.powi(t),
        ]
    }
}
