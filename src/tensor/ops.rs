//! Elementwise primitives.
//!
//! Every primitive takes its operands plus a wait-list and returns the
//! [`Event`] of its last submission without blocking. Shapes and dtypes are
//! validated on the host before anything is submitted. Operands whose result
//! may become complex are promoted first.

use num_complex::Complex64;

use super::{AsOperand, Operand, Tensor, check_shape, submit};
use crate::device::event::Event;
use crate::device::kernel::{KernelId, KernelParams};
use crate::error::{Error, Result};

fn domain(op: &Operand<'_>) -> KernelParams {
    KernelParams::new(op.rows(), op.cols())
}

fn is_complex_scalar(v: Complex64) -> bool {
    v.im != 0.0
}

/// If `x` overlaps `y` without being the same region, copies it to a
/// temporary so the kernel never reads elements it is writing.
fn detach(x: Operand<'_>, y: &Operand<'_>, wait: &[Event]) -> Result<Option<(Tensor, Event)>> {
    if x.overlaps(y) && !x.same_region(y) {
        return x.to_tensor(wait).map(Some);
    }
    Ok(None)
}

/// Like [`detach`] but also for identical regions; for kernels whose
/// elements read other positions of their input.
fn detach_any(x: Operand<'_>, y: &Operand<'_>, wait: &[Event]) -> Result<Option<(Tensor, Event)>> {
    if x.overlaps(y) {
        return x.to_tensor(wait).map(Some);
    }
    Ok(None)
}

/// Runs a two-operand kernel `x → y` after resolving aliasing.
fn binary(
    id: KernelId,
    x: Operand<'_>,
    y: Operand<'_>,
    params: KernelParams,
    complex: bool,
    strict: bool,
    wait: &[Event],
) -> Result<Event> {
    let tmp = if strict {
        detach_any(x, &y, wait)?
    } else {
        detach(x, &y, wait)?
    };
    match &tmp {
        Some((copy, ev)) => submit(
            id,
            &[copy.operand(), y],
            params,
            complex,
            0,
            core::slice::from_ref(ev),
        ),
        None => submit(id, &[x, y], params, complex, 0, wait),
    }
}

/// Sets every element of `y` to `value`.
///
/// # Errors
///
/// Returns [`Error::AllocationFailure`] if promotion fails.
pub fn fill(y: &impl AsOperand, value: Complex64, wait: &[Event]) -> Result<Event> {
    let y = y.operand();
    let complex = y.is_complex() || is_complex_scalar(value);
    let params = domain(&y).scalar(0, value.re).scalar(1, value.im);
    submit(KernelId::Fill, &[y], params, complex, 0, wait)
}

/// `y ← x`.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] or [`Error::DtypeMismatch`] for
/// incompatible operands.
pub fn copy(x: &impl AsOperand, y: &impl AsOperand, wait: &[Event]) -> Result<Event> {
    let (x, y) = (x.operand(), y.operand());
    check_shape("copy", x.shape(), y.shape())?;
    if x.same_region(&y) {
        return y.tensor().context().barrier(wait);
    }
    let complex = x.is_complex() || y.is_complex();
    binary(KernelId::Copy, x, y, domain(&y), complex, false, wait)
}

/// `y ← α·x + β·y`.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] or [`Error::DtypeMismatch`] for
/// incompatible operands.
pub fn axpby(
    alpha: Complex64,
    x: &impl AsOperand,
    beta: Complex64,
    y: &impl AsOperand,
    wait: &[Event],
) -> Result<Event> {
    let (x, y) = (x.operand(), y.operand());
    check_shape("axpby", x.shape(), y.shape())?;
    let complex = x.is_complex()
        || y.is_complex()
        || is_complex_scalar(alpha)
        || is_complex_scalar(beta);
    let params = domain(&y)
        .scalar(0, alpha.re)
        .scalar(1, alpha.im)
        .scalar(2, beta.re)
        .scalar(3, beta.im);
    binary(KernelId::Axpby, x, y, params, complex, false, wait)
}

/// `y ← y + x`.
///
/// # Errors
///
/// See [`axpby`].
pub fn add(x: &impl AsOperand, y: &impl AsOperand, wait: &[Event]) -> Result<Event> {
    axpby(Complex64::from(1.0), x, Complex64::from(1.0), y, wait)
}

/// `y ← y − x`.
///
/// # Errors
///
/// See [`axpby`].
pub fn sub(x: &impl AsOperand, y: &impl AsOperand, wait: &[Event]) -> Result<Event> {
    axpby(Complex64::from(-1.0), x, Complex64::from(1.0), y, wait)
}

/// `y ← α·y`.
///
/// # Errors
///
/// Returns [`Error::AllocationFailure`] if promotion fails.
pub fn scale(alpha: Complex64, y: &impl AsOperand, wait: &[Event]) -> Result<Event> {
    let y = y.operand();
    let complex = y.is_complex() || is_complex_scalar(alpha);
    let params = domain(&y).scalar(0, alpha.re).scalar(1, alpha.im);
    submit(KernelId::Scale, &[y], params, complex, 0, wait)
}

/// `y ← x ⊙ y` (elementwise product).
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] or [`Error::DtypeMismatch`] for
/// incompatible operands.
pub fn hadamard(x: &impl AsOperand, y: &impl AsOperand, wait: &[Event]) -> Result<Event> {
    let (x, y) = (x.operand(), y.operand());
    check_shape("hadamard", x.shape(), y.shape())?;
    let complex = x.is_complex() || y.is_complex();
    binary(KernelId::Hadamard, x, y, domain(&y), complex, false, wait)
}

/// `y ← conj(y)`. A no-op for real operands.
///
/// # Errors
///
/// Returns [`Error::DeviceExecution`] if the submission is rejected.
pub fn conj(y: &impl AsOperand, wait: &[Event]) -> Result<Event> {
    let y = y.operand();
    if !y.is_complex() {
        return y.tensor().context().barrier(wait);
    }
    submit(KernelId::Conj, &[y], domain(&y), true, 0, wait)
}

/// `y ← xᵀ`.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] unless `y` is `x.cols × x.rows`.
pub fn transpose(x: &impl AsOperand, y: &impl AsOperand, wait: &[Event]) -> Result<Event> {
    let (x, y) = (x.operand(), y.operand());
    check_shape("transpose", (x.cols(), x.rows()), y.shape())?;
    let complex = x.is_complex() || y.is_complex();
    binary(KernelId::Transpose, x, y, domain(&y), complex, true, wait)
}

/// Allocates and returns `xᵀ`.
///
/// # Errors
///
/// Returns [`Error::AllocationFailure`] when the device is out of memory.
pub fn transposed(x: &impl AsOperand, wait: &[Event]) -> Result<(Tensor, Event)> {
    let x = x.operand();
    let t = x.tensor();
    let out = Tensor::uninit(t.context(), x.cols(), x.rows(), x.dtype())?;
    let ev = transpose(&x, &out, wait)?;
    Ok((out, ev))
}

/// `y[r, :] ← y[r, :] + row` for every row of `y`.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] unless `row` is `1 × y.cols`.
pub fn add_row(row: &impl AsOperand, y: &impl AsOperand, wait: &[Event]) -> Result<Event> {
    let (x, y) = (row.operand(), y.operand());
    check_shape("add_row", x.shape(), (1, y.cols()))?;
    let complex = x.is_complex() || y.is_complex();
    binary(KernelId::AddRow, x, y, domain(&y), complex, true, wait)
}

fn magnitude(id: KernelId, name: &'static str, x: Operand<'_>, y: Operand<'_>, wait: &[Event]) -> Result<Event> {
    check_shape(name, x.shape(), y.shape())?;
    if y.is_complex() {
        return Err(Error::invalid(format!("`{name}` writes a real result")));
    }
    binary(id, x, y, domain(&y), x.is_complex(), false, wait)
}

/// `y ← |x|`. `y` must be real.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] for incompatible shapes and
/// [`Error::InvalidArgument`] for a complex `y`.
pub fn abs(x: &impl AsOperand, y: &impl AsOperand, wait: &[Event]) -> Result<Event> {
    magnitude(KernelId::Abs, "abs", x.operand(), y.operand(), wait)
}

/// `y ← |x|²`. `y` must be real.
///
/// # Errors
///
/// See [`abs`].
pub fn abs2(x: &impl AsOperand, y: &impl AsOperand, wait: &[Event]) -> Result<Event> {
    magnitude(KernelId::Abs2, "abs2", x.operand(), y.operand(), wait)
}

/// `y ← sign(x)`: `x / |x|`, or zero where `x` is zero.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] for incompatible shapes.
pub fn sign(x: &impl AsOperand, y: &impl AsOperand, wait: &[Event]) -> Result<Event> {
    let (x, y) = (x.operand(), y.operand());
    check_shape("sign", x.shape(), y.shape())?;
    let complex = x.is_complex() || y.is_complex();
    binary(KernelId::Sign, x, y, domain(&y), complex, false, wait)
}

/// Applies an in-place activation kernel with one optional scalar.
pub(crate) fn map_in_place(
    id: KernelId,
    y: &impl AsOperand,
    scalar: f64,
    wait: &[Event],
) -> Result<Event> {
    let y = y.operand();
    let params = domain(&y).scalar(0, scalar);
    submit(id, &[y], params, y.is_complex(), 0, wait)
}

/// Evaluates a derivative kernel of `x` into a new tensor.
pub(crate) fn map_into(
    id: KernelId,
    x: &impl AsOperand,
    scalar: f64,
    wait: &[Event],
) -> Result<(Tensor, Event)> {
    let x = x.operand();
    let out = if x.is_complex() {
        Tensor::complex_zeros(x.tensor().context(), x.rows(), x.cols(), x.dtype())?
    } else {
        Tensor::uninit(x.tensor().context(), x.rows(), x.cols(), x.dtype())?
    };
    let params = domain(&x).scalar(0, scalar);
    let ev = submit(id, &[x, out.operand()], params, x.is_complex(), 0, wait)?;
    Ok((out, ev))
}
