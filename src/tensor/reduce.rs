//! Reductions.
//!
//! Sums and products fold a scratch copy in a tree: the lower half of the
//! rows is combined onto the upper half until one row is left, then the same
//! happens over the columns. Each level is one kernel chained on the previous
//! level's event. Scalar results are read back synchronously.

use num_complex::Complex64;

use super::{AsOperand, Operand, Part, Tensor, check_shape, submit};
use crate::device::event::Event;
use crate::device::kernel::{KernelId, KernelParams};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fold {
    Sum,
    Product,
}

impl Fold {
    const fn code(self) -> usize {
        match self {
            Self::Sum => 0,
            Self::Product => 1,
        }
    }
}

/// Folds the first `rows` rows of `t` into row 0.
fn fold_rows(t: &Tensor, mode: Fold, mut ev: Event) -> Result<Event> {
    let mut rows = t.rows();
    while rows > 1 {
        let keep = rows.div_ceil(2);
        let params = KernelParams::new(rows - keep, t.cols())
            .extra(0, keep)
            .extra(1, mode.code());
        ev = submit(
            KernelId::FoldRows,
            &[t.operand()],
            params,
            t.is_complex(),
            0,
            core::slice::from_ref(&ev),
        )?;
        rows = keep;
    }
    Ok(ev)
}

/// Folds the columns of the first `rows` rows of `t` into column 0.
fn fold_cols(t: &Tensor, rows: usize, mode: Fold, mut ev: Event) -> Result<Event> {
    let mut cols = t.cols();
    while cols > 1 {
        let keep = cols.div_ceil(2);
        let params = KernelParams::new(rows, cols - keep)
            .extra(0, keep)
            .extra(1, mode.code());
        ev = submit(
            KernelId::FoldCols,
            &[t.operand()],
            params,
            t.is_complex(),
            0,
            core::slice::from_ref(&ev),
        )?;
        cols = keep;
    }
    Ok(ev)
}

fn fold_all(x: Operand<'_>, mode: Fold, wait: &[Event]) -> Result<Complex64> {
    if x.rows() == 0 || x.cols() == 0 {
        return Ok(match mode {
            Fold::Sum => Complex64::new(0.0, 0.0),
            Fold::Product => Complex64::new(1.0, 0.0),
        });
    }
    let (scratch, ev) = x.to_tensor(wait)?;
    let ev = fold_rows(&scratch, mode, ev)?;
    let ev = fold_cols(&scratch, 1, mode, ev)?;
    first_element(&scratch, ev)
}

fn first_element(t: &Tensor, ev: Event) -> Result<Complex64> {
    let (cell, ev) = t.view(0, 0, 1, 1)?.to_tensor(&[ev])?;
    let values = cell.to_complex_vec(&[ev])?;
    values
        .first()
        .copied()
        .ok_or_else(|| Error::DeviceExecution("reduction produced no value".into()))
}

/// Sum of all elements. An empty operand sums to zero.
///
/// # Errors
///
/// Returns [`Error::DeviceExecution`] if a dependency failed.
pub fn sum(x: &impl AsOperand, wait: &[Event]) -> Result<Complex64> {
    fold_all(x.operand(), Fold::Sum, wait)
}

/// Product of all elements. An empty operand multiplies to one.
///
/// # Errors
///
/// Returns [`Error::DeviceExecution`] if a dependency failed.
pub fn product(x: &impl AsOperand, wait: &[Event]) -> Result<Complex64> {
    fold_all(x.operand(), Fold::Product, wait)
}

/// Arithmetic mean of all elements.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] for an empty operand.
#[allow(clippy::cast_precision_loss)]
pub fn mean(x: &impl AsOperand, wait: &[Event]) -> Result<Complex64> {
    let x = x.operand();
    let n = x.rows() * x.cols();
    if n == 0 {
        return Err(Error::invalid("mean of an empty tensor"));
    }
    Ok(fold_all(x, Fold::Sum, wait)? / n as f64)
}

/// Sum of the main diagonal of a square operand.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] when the operand is not square.
pub fn trace(x: &impl AsOperand, wait: &[Event]) -> Result<Complex64> {
    let x = x.operand();
    let (rows, cols) = x.shape();
    check_shape("trace", (rows, cols), (cols, rows))?;
    let ctx = x.tensor().context();
    let diag = if x.is_complex() {
        Tensor::complex_zeros(ctx, 1, rows, x.dtype())?
    } else {
        Tensor::uninit(ctx, 1, rows, x.dtype())?
    };
    let ev = submit(
        KernelId::Diagonal,
        &[x, diag.operand()],
        KernelParams::new(1, rows),
        x.is_complex(),
        0,
        wait,
    )?;
    sum(&diag, &[ev])
}

/// Column sums: a `1 × cols` tensor whose entry `c` is `Σ_r x[r, c]`.
///
/// # Errors
///
/// Returns [`Error::AllocationFailure`] when the device is out of memory.
pub fn sum_rows(x: &impl AsOperand, wait: &[Event]) -> Result<(Tensor, Event)> {
    let x = x.operand();
    if x.rows() == 0 {
        let out = Tensor::zeros(x.tensor().context(), 1, x.cols(), x.dtype())?;
        return Ok((out, x.tensor().context().barrier(wait)?));
    }
    let (scratch, ev) = x.to_tensor(wait)?;
    let ev = fold_rows(&scratch, Fold::Sum, ev)?;
    scratch.view(0, 0, 1, x.cols())?.to_tensor(&[ev])
}

/// Row sums: a `rows × 1` tensor whose entry `r` is `Σ_c x[r, c]`.
///
/// # Errors
///
/// Returns [`Error::AllocationFailure`] when the device is out of memory.
pub fn sum_cols(x: &impl AsOperand, wait: &[Event]) -> Result<(Tensor, Event)> {
    let x = x.operand();
    if x.cols() == 0 {
        let out = Tensor::zeros(x.tensor().context(), x.rows(), 1, x.dtype())?;
        return Ok((out, x.tensor().context().barrier(wait)?));
    }
    let (scratch, ev) = x.to_tensor(wait)?;
    let ev = fold_cols(&scratch, x.rows(), Fold::Sum, ev)?;
    scratch.view(0, 0, x.rows(), 1)?.to_tensor(&[ev])
}

fn scan<F>(x: Operand<'_>, wait: &[Event], better: F) -> Result<(usize, usize)>
where
    F: Fn(f64, f64) -> bool,
{
    let (rows, cols) = x.shape();
    if rows == 0 || cols == 0 {
        return Err(Error::invalid("arg-reduction of an empty tensor"));
    }
    let complex = x.is_complex();
    let values = if x.part() == Part::Full && x.shape() == x.tensor().shape() {
        x.tensor().to_complex_vec(wait)?
    } else {
        let (copy, ev) = x.to_tensor(wait)?;
        copy.to_complex_vec(&[ev])?
    };
    let key = |v: &Complex64| if complex { v.norm() } else { v.re };
    let mut best = 0;
    for (i, v) in values.iter().enumerate().skip(1) {
        if better(key(v), key(&values[best])) {
            best = i;
        }
    }
    Ok((best / cols, best % cols))
}

/// Position of the largest element, first one on ties.
///
/// Complex operands compare by magnitude.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] for an empty operand.
pub fn argmax(x: &impl AsOperand, wait: &[Event]) -> Result<(usize, usize)> {
    scan(x.operand(), wait, |a, b| a > b)
}

/// Position of the smallest element, first one on ties.
///
/// Complex operands compare by magnitude.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] for an empty operand.
pub fn argmin(x: &impl AsOperand, wait: &[Event]) -> Result<(usize, usize)> {
    scan(x.operand(), wait, |a, b| a < b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceContext;
    use crate::device::dtype::Dtype;

    #[test]
    fn sums_and_products_over_odd_shapes() {
        let ctx = DeviceContext::cpu().unwrap();
        let data: Vec<f64> = (1..=15).map(f64::from).collect();
        let t = Tensor::from_f64(&ctx, 5, 3, Dtype::F64, &data).unwrap();
        assert_eq!(sum(&t, &[]).unwrap(), Complex64::new(120.0, 0.0));
        assert_eq!(mean(&t, &[]).unwrap(), Complex64::new(8.0, 0.0));

        let small = Tensor::from_f64(&ctx, 1, 5, Dtype::F64, &[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(product(&small, &[]).unwrap(), Complex64::new(120.0, 0.0));

        let view = t.view(1, 1, 2, 2).unwrap();
        assert_eq!(sum(&view, &[]).unwrap(), Complex64::new(5.0 + 6.0 + 8.0 + 9.0, 0.0));
        assert_eq!(t.to_f64_vec(&[]).unwrap(), data);
    }

    #[test]
    fn empty_reductions() {
        let ctx = DeviceContext::cpu().unwrap();
        let t = Tensor::zeros(&ctx, 0, 3, Dtype::F32).unwrap();
        assert_eq!(sum(&t, &[]).unwrap(), Complex64::new(0.0, 0.0));
        assert_eq!(product(&t, &[]).unwrap(), Complex64::new(1.0, 0.0));
        assert!(matches!(mean(&t, &[]), Err(Error::InvalidArgument(_))));
        assert!(matches!(argmax(&t, &[]), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn trace_of_complex_matrix() {
        let ctx = DeviceContext::cpu().unwrap();
        let c = |re, im| Complex64::new(re, im);
        let t = Tensor::from_complex(
            &ctx,
            2,
            2,
            Dtype::F64,
            &[c(1.0, 1.0), c(5.0, 0.0), c(7.0, 0.0), c(2.0, -3.0)],
        )
        .unwrap();
        assert_eq!(trace(&t, &[]).unwrap(), c(3.0, -2.0));

        let wide = Tensor::zeros(&ctx, 2, 3, Dtype::F64).unwrap();
        assert!(matches!(trace(&wide, &[]), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn row_and_column_sums() {
        let ctx = DeviceContext::cpu().unwrap();
        let t = Tensor::from_f64(&ctx, 3, 2, Dtype::F32, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let (rows, ev) = sum_rows(&t, &[]).unwrap();
        assert_eq!(rows.shape(), (1, 2));
        assert_eq!(rows.to_f64_vec(&[ev]).unwrap(), vec![9.0, 12.0]);
        let (cols, ev) = sum_cols(&t, &[]).unwrap();
        assert_eq!(cols.shape(), (3, 1));
        assert_eq!(cols.to_f64_vec(&[ev]).unwrap(), vec![3.0, 7.0, 11.0]);
    }

    #[test]
    fn arg_reductions() {
        let ctx = DeviceContext::cpu().unwrap();
        let t = Tensor::from_f64(&ctx, 2, 3, Dtype::F64, &[3.0, -7.0, 9.0, 9.0, 0.0, -7.0]).unwrap();
        assert_eq!(argmax(&t, &[]).unwrap(), (0, 2));
        assert_eq!(argmin(&t, &[]).unwrap(), (0, 1));

        let c = |re, im| Complex64::new(re, im);
        let z = Tensor::from_complex(&ctx, 1, 3, Dtype::F64, &[c(1.0, 0.0), c(0.0, -4.0), c(2.0, 2.0)])
            .unwrap();
        assert_eq!(argmax(&z, &[]).unwrap(), (0, 1));
        assert_eq!(argmin(&z, &[]).unwrap(), (0, 0));
    }
}
