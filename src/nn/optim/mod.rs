//! Parameter update rules.
//!
//! An [`UpdateRule`] describes one optimizer variant: the fused kernel that
//! applies it, the auxiliary tensors it keeps per parameter and the scalars
//! it feeds the kernel at each step. An [`Optimizer`] binds a rule to the
//! parameter shapes of a [`Network`] and owns the auxiliary state.
//!
//! Complex parameters are updated one component at a time: the kernel runs
//! on the real parts with the rules' `re` coefficients, then on the
//! imaginary parts with the `im` coefficients and a separate set of
//! auxiliary tensors.

mod adadelta;
mod adagrad;
mod adam;
mod gd;
mod momentum;
mod nesterov;
mod rmsprop;

use core::fmt;
use std::sync::Arc;

use num_complex::Complex64;
use tracing::{debug, trace};

pub use adadelta::Adadelta;
pub use adagrad::AdaGrad;
pub use adam::Adam;
pub use gd::Gd;
pub use momentum::Momentum;
pub use nesterov::Nesterov;
pub use rmsprop::RmsProp;

use super::gradient::Gradients;
use super::network::Network;
use crate::device::DeviceContext;
use crate::device::event::Event;
use crate::device::kernel::{KernelId, KernelParams};
use crate::error::{Error, Result};
use crate::tensor::ops::fill;
use crate::tensor::{AsOperand, Part, Tensor, check_shape, submit};

/// Component of a parameter being updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    /// Real part, or the whole value of a real parameter.
    Re,
    /// Imaginary part.
    Im,
}

/// A hyperparameter with separate values for real and imaginary components.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coefficient {
    /// Value used on real parts.
    pub re: f64,
    /// Value used on imaginary parts.
    pub im: f64,
}

impl Coefficient {
    /// The same value for both components.
    #[must_use]
    pub const fn new(value: f64) -> Self {
        Self {
            re: value,
            im: value,
        }
    }

    /// Distinct values per component.
    #[must_use]
    pub const fn split(re: f64, im: f64) -> Self {
        Self { re, im }
    }

    /// Value for `component`.
    #[must_use]
    pub const fn get(self, component: Component) -> f64 {
        match component {
            Component::Re => self.re,
            Component::Im => self.im,
        }
    }
}

impl From<f64> for Coefficient {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

/// One auxiliary tensor kept per parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateSlot {
    /// Short name, for diagnostics.
    pub name: &'static str,
    /// Value the tensor starts at and returns to on [`Optimizer::zero`].
    pub init: f64,
}

/// Kernel scalars of one update: `[lr, decay, eps, beta2, bias1, bias2]`.
pub type StepScalars = [f64; 6];

/// One optimizer variant.
pub trait UpdateRule: fmt::Debug + Send + Sync {
    /// Short lowercase name.
    fn name(&self) -> &'static str;

    /// Fused update kernel. Its signature is `[w, g, state...]`.
    fn kernel(&self) -> KernelId;

    /// Auxiliary tensors, in kernel slot order.
    fn state(&self) -> &'static [StateSlot];

    /// Scalars for `component` at 1-based step `step`.
    fn scalars(&self, component: Component, step: u64) -> StepScalars;
}

#[derive(Debug)]
struct ParamState {
    shape: (usize, usize),
    re: Vec<Tensor>,
    im: Option<Vec<Tensor>>,
}

/// An [`UpdateRule`] bound to a network's parameters.
#[derive(Debug)]
pub struct Optimizer<R: UpdateRule> {
    rule: R,
    params: Vec<ParamState>,
    steps: u64,
    pending: Vec<Event>,
}

fn allocate(slots: &[StateSlot], like: &Tensor, pending: &mut Vec<Event>) -> Result<Vec<Tensor>> {
    slots
        .iter()
        .map(|slot| {
            let (t, ev) = Tensor::full(like.context(), like.rows(), like.cols(), like.dtype(), slot.init)?;
            pending.push(ev);
            Ok(t)
        })
        .collect()
}

impl<R: UpdateRule> Optimizer<R> {
    /// Allocates `rule`'s auxiliary state for every parameter of `network`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] when the device is out of memory.
    pub fn new(rule: R, network: &Network) -> Result<Self> {
        let mut tensors = Vec::new();
        network.for_each_parameter(|t| tensors.push(t));
        let slots = rule.state();
        let mut pending = Vec::new();
        let mut params = Vec::with_capacity(tensors.len());
        for t in tensors {
            let re = allocate(slots, t, &mut pending)?;
            let im = if t.is_complex() {
                Some(allocate(slots, t, &mut pending)?)
            } else {
                None
            };
            params.push(ParamState {
                shape: t.shape(),
                re,
                im,
            });
        }
        debug!(
            rule = rule.name(),
            parameters = params.len(),
            slots = slots.len(),
            "optimizer bound"
        );
        Ok(Self {
            rule,
            params,
            steps: 0,
            pending,
        })
    }

    /// The bound rule.
    #[must_use]
    pub const fn rule(&self) -> &R {
        &self.rule
    }

    /// Steps taken since construction or the last [`Optimizer::zero`].
    #[must_use]
    pub const fn steps(&self) -> u64 {
        self.steps
    }

    /// Auxiliary tensors of parameter `index` (real component).
    #[must_use]
    pub fn state(&self, index: usize) -> Option<&[Tensor]> {
        self.params.get(index).map(|p| p.re.as_slice())
    }

    /// Auxiliary tensors of parameter `index` for the imaginary component,
    /// if the parameter is complex.
    #[must_use]
    pub fn imag_state(&self, index: usize) -> Option<&[Tensor]> {
        self.params.get(index).and_then(|p| p.im.as_deref())
    }

    /// Applies one update to every parameter of `network`.
    ///
    /// Every gradient is checked against the bound shapes before anything is
    /// submitted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `gradients` or `network` has a
    /// different number of parameters than the optimizer was bound to, and
    /// [`Error::ShapeMismatch`] if any shape differs.
    pub fn step(&mut self, network: &mut Network, gradients: &Gradients, wait: &[Event]) -> Result<Event> {
        let mut weights = Vec::with_capacity(self.params.len());
        network.for_each_parameter(|t| weights.push(t));
        let grads: Vec<&Tensor> = gradients.iter().collect();
        if weights.len() != self.params.len() || grads.len() != self.params.len() {
            return Err(Error::invalid(format!(
                "optimizer bound to {} parameters, got {} parameters and {} gradients",
                self.params.len(),
                weights.len(),
                grads.len()
            )));
        }
        for ((state, w), g) in self.params.iter().zip(&weights).zip(&grads) {
            check_shape("optimizer step", w.shape(), state.shape)?;
            check_shape("optimizer step", g.shape(), state.shape)?;
        }

        let slots = self.rule.state();
        let mut ready = [wait, gradients.events().as_slice()].concat();
        ready.append(&mut self.pending);
        let step = self.steps + 1;
        let mut done = Vec::with_capacity(self.params.len());
        let rule = &self.rule;
        for ((state, w), g) in self.params.iter_mut().zip(weights).zip(grads) {
            let real = Update { rule, w, g, step };
            if !w.is_complex() {
                done.push(real.submit(Part::Full, &state.re, Component::Re, &ready)?);
                continue;
            }
            if state.im.is_none() {
                let mut fresh = Vec::new();
                state.im = Some(allocate(slots, w, &mut fresh)?);
                ready.extend(fresh);
            }
            g.promote_complex()?;
            done.push(real.submit(Part::Re, &state.re, Component::Re, &ready)?);
            if let Some(im) = &state.im {
                done.push(real.submit(Part::Im, im, Component::Im, &ready)?);
            }
        }
        self.steps = step;
        trace!(rule = self.rule.name(), step, "optimizer step");
        match weights_context(network) {
            Some(ctx) => ctx.barrier(&done),
            None => Ok(Event::complete()),
        }
    }

    /// Resets every auxiliary tensor to its initial value and the step
    /// counter to zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceExecution`] if a previous submission failed.
    pub fn zero(&mut self) -> Result<Event> {
        let slots = self.rule.state();
        let wait = core::mem::take(&mut self.pending);
        let mut done = Vec::new();
        for state in &self.params {
            let sets = core::iter::once(&state.re).chain(state.im.as_ref());
            for tensors in sets {
                for (t, slot) in tensors.iter().zip(slots) {
                    done.push(fill(t, Complex64::from(slot.init), &wait)?);
                }
            }
        }
        self.steps = 0;
        self.pending.clone_from(&done);
        let first = self.params.iter().flat_map(|p| p.re.first()).next();
        match first {
            Some(t) => t.context().barrier(&done),
            None => Ok(Event::complete()),
        }
    }

    /// Releases the auxiliary state.
    pub fn free(self) {
        drop(self);
    }
}

/// One parameter's update at a given step.
struct Update<'a, R> {
    rule: &'a R,
    w: &'a Tensor,
    g: &'a Tensor,
    step: u64,
}

impl<R: UpdateRule> Update<'_, R> {
    fn submit(&self, part: Part, state: &[Tensor], component: Component, wait: &[Event]) -> Result<Event> {
        let mut operands = vec![
            self.w.operand().with_part(part),
            self.g.operand().with_part(part),
        ];
        operands.extend(state.iter().map(AsOperand::operand));
        let scalars = self.rule.scalars(component, self.step);
        let params = scalars
            .iter()
            .enumerate()
            .fold(KernelParams::new(self.w.rows(), self.w.cols()), |p, (i, &v)| {
                p.scalar(i, v)
            });
        submit(self.rule.kernel(), &operands, params, false, 0, wait)
    }
}

fn weights_context(network: &Network) -> Option<&Arc<DeviceContext>> {
    network
        .layers()
        .first()
        .and_then(|l| l.weights().first())
        .map(Tensor::context)
}
