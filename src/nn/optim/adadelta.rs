use super::{Coefficient, Component, StateSlot, StepScalars, UpdateRule};
use crate::device::kernel::KernelId;

/// Adadelta.
///
/// `s ← ρ·s + (1 − ρ)·g²`, `Δ = √(u + ε)/√(s + ε)·g`,
/// `u ← ρ·u + (1 − ρ)·Δ²`, then `w ← w − Δ`. The update accumulator `u`
/// starts at one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adadelta {
    /// Average decay `ρ`.
    pub rho: Coefficient,
    /// Offset `ε`.
    pub eps: Coefficient,
}

impl Default for Adadelta {
    fn default() -> Self {
        Self::new()
    }
}

impl Adadelta {
    /// Adadelta with `ρ = 0.95` and `ε = 1e-6`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            rho: Coefficient::new(0.95),
            eps: Coefficient::new(1e-6),
        }
    }

    /// Replaces `ρ`.
    #[must_use]
    pub fn with_rho(mut self, rho: impl Into<Coefficient>) -> Self {
        self.rho = rho.into();
        self
    }

    /// Replaces `ε`.
    #[must_use]
    pub fn with_eps(mut self, eps: impl Into<Coefficient>) -> Self {
        self.eps = eps.into();
        self
    }
}

impl UpdateRule for Adadelta {
    fn name(&self) -> &'static str {
        "adadelta"
    }

    fn kernel(&self) -> KernelId {
        KernelId::AdadeltaStep
    }

    fn state(&self) -> &'static [StateSlot] {
        &[
            StateSlot {
                name: "mean_sq",
                init: 0.0,
            },
            StateSlot {
                name: "mean_update",
                init: 1.0,
            },
        ]
    }

    fn scalars(&self, component: Component, _step: u64) -> StepScalars {
        [0.0, self.rho.get(component), self.eps.get(component), 0.0, 1.0, 1.0]
    }
}
