//! Gauss-Jordan linear algebra.
//!
//! Elimination runs on a device copy of the operand. Every pivot column costs
//! three chained submissions: pivot search and row swap, pivot row
//! normalisation, and elimination of the column from every other row. The
//! pivot kernel keeps its bookkeeping in a small meta tensor laid out as
//! `[det, skip, pivot_row, pivot_count, pivot, factors...]`.

use std::sync::Arc;

use num_complex::Complex64;
use tracing::trace;

use super::gemm::{Gemm, Op, product};
use super::reduce::sum_cols;
use super::{AsOperand, Operand, Tensor, check_shape, ops, submit};
use crate::device::DeviceContext;
use crate::device::event::Event;
use crate::device::kernel::{KernelId, KernelParams};
use crate::error::{Error, Result};

const META_FIXED: usize = 5;

/// Bookkeeping read back after an elimination.
struct Summary {
    det: Complex64,
    pivots: usize,
}

/// An in-progress reduction of `matrix` to reduced row echelon form.
struct Elimination {
    matrix: Tensor,
    meta: Tensor,
    event: Event,
}

impl Elimination {
    /// Copies `x` and eliminates its first `pivot_cols` columns.
    fn run(x: Operand<'_>, pivot_cols: usize, wait: &[Event]) -> Result<Self> {
        let (matrix, event) = x.to_tensor(wait)?;
        Self::run_in_place(matrix, pivot_cols, event)
    }

    fn run_in_place(matrix: Tensor, pivot_cols: usize, mut event: Event) -> Result<Self> {
        let (rows, cols) = matrix.shape();
        let dtype = matrix.dtype();
        let complex = matrix.is_complex();
        #[allow(clippy::cast_precision_loss)]
        let tol = dtype.epsilon() * rows.max(cols) as f64;

        let mut init = vec![0.0; META_FIXED + rows];
        init[0] = 1.0;
        let meta = Tensor::from_f64(matrix.context(), 1, META_FIXED + rows, dtype, &init)?;
        if complex {
            meta.promote_complex()?;
        }

        let operands = [matrix.operand(), meta.operand()];
        for k in 0..pivot_cols {
            let pivot = KernelParams::new(1, 1)
                .extra(0, rows)
                .extra(1, cols)
                .extra(2, k)
                .scalar(0, tol);
            event = submit(KernelId::GjPivot, &operands, pivot, complex, 0, &[event])?;
            event = submit(
                KernelId::GjNormalize,
                &operands,
                KernelParams::new(1, cols),
                complex,
                0,
                &[event],
            )?;
            event = submit(
                KernelId::GjEliminate,
                &operands,
                KernelParams::new(rows, cols),
                complex,
                0,
                &[event],
            )?;
        }
        trace!(rows, cols, pivot_cols, "gauss-jordan submitted");
        Ok(Self {
            matrix,
            meta,
            event,
        })
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn summary(&self) -> Result<Summary> {
        let meta = self.meta.to_complex_vec(core::slice::from_ref(&self.event))?;
        Ok(Summary {
            det: meta[0],
            pivots: meta[3].re as usize,
        })
    }
}

fn square(op: &'static str, x: &Operand<'_>) -> Result<usize> {
    let (rows, cols) = x.shape();
    check_shape(op, (rows, cols), (cols, rows))?;
    Ok(rows)
}

/// Determinant of a square operand. Singular matrices give zero.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] when the operand is not square and
/// [`Error::Compile`] for integer dtypes.
pub fn determinant(a: &impl AsOperand, wait: &[Event]) -> Result<Complex64> {
    let a = a.operand();
    let n = square("determinant", &a)?;
    if n == 0 {
        return Ok(Complex64::new(1.0, 0.0));
    }
    let summary = Elimination::run(a, n, wait)?.summary()?;
    if summary.pivots < n {
        return Ok(Complex64::new(0.0, 0.0));
    }
    Ok(summary.det)
}

/// Inverse of a square operand, by eliminating `[A | I]`.
///
/// Blocks until the elimination finished, since singularity is only known
/// afterwards.
///
/// # Errors
///
/// Returns [`Error::Singular`] when a pivot column has no usable entry and
/// [`Error::ShapeMismatch`] when the operand is not square.
pub fn inverse(a: &impl AsOperand, wait: &[Event]) -> Result<(Tensor, Event)> {
    let a = a.operand();
    let n = square("inverse", &a)?;
    let ctx: &Arc<DeviceContext> = a.tensor().context();
    let augmented = if a.is_complex() {
        Tensor::complex_zeros(ctx, n, 2 * n, a.dtype())?
    } else {
        Tensor::zeros(ctx, n, 2 * n, a.dtype())?
    };
    let eye = Tensor::identity(ctx, n, a.dtype())?;
    let left = ops::copy(&a, &augmented.view(0, 0, n, n)?, wait)?;
    let right = ops::copy(&eye, &augmented.view(0, n, n, n)?, &[])?;
    let ready = ctx.barrier(&[left, right])?;

    let elimination = Elimination::run_in_place(augmented, n, ready)?;
    if elimination.summary()?.pivots < n {
        return Err(Error::Singular);
    }
    elimination
        .matrix
        .view(0, n, n, n)?
        .to_tensor(&[elimination.event.clone()])
}

/// Number of non-zero rows left after elimination.
///
/// A row counts when the sum of its magnitudes exceeds the dtype's epsilon
/// scaled by the matrix size. Badly scaled input can fool this threshold.
///
/// # Errors
///
/// Returns [`Error::Compile`] for integer dtypes.
pub fn rank(a: &impl AsOperand, wait: &[Event]) -> Result<usize> {
    let a = a.operand();
    let (rows, cols) = a.shape();
    if rows == 0 || cols == 0 {
        return Ok(0);
    }
    let elimination = Elimination::run(a, cols, wait)?;
    let magnitudes = Tensor::uninit(a.tensor().context(), rows, cols, a.dtype())?;
    let ev = ops::abs(&elimination.matrix, &magnitudes, &[elimination.event.clone()])?;
    let (row_sums, ev) = sum_cols(&magnitudes, &[ev])?;
    #[allow(clippy::cast_precision_loss)]
    let tol = a.dtype().epsilon() * rows.max(cols) as f64;
    Ok(row_sums
        .to_f64_vec(&[ev])?
        .into_iter()
        .filter(|v| *v > tol)
        .count())
}

/// Moore-Penrose pseudo-inverse of a full-rank operand.
///
/// Uses `(AᴴA)⁻¹Aᴴ` when the operand has at least as many rows as columns and
/// `Aᴴ(AAᴴ)⁻¹` otherwise.
///
/// # Errors
///
/// Returns [`Error::Singular`] when the operand is rank deficient.
pub fn pinv(a: &impl AsOperand, wait: &[Event]) -> Result<(Tensor, Event)> {
    let a = a.operand();
    let (rows, cols) = a.shape();
    if rows >= cols {
        let (gram, ev) = product(Gemm::new().op_a(Op::C), &a, &a, false, wait)?;
        let (inv, ev) = inverse(&gram, &[ev])?;
        product(Gemm::new().op_b(Op::C), &inv, &a, false, &[ev])
    } else {
        let (gram, ev) = product(Gemm::new().op_b(Op::C), &a, &a, false, wait)?;
        let (inv, ev) = inverse(&gram, &[ev])?;
        product(Gemm::new().op_a(Op::C), &a, &inv, false, &[ev])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approx::approx_eq_slice;
    use crate::device::dtype::Dtype;
    use crate::tensor::gemm::matmul;

    #[test]
    fn determinant_with_row_swaps() {
        let ctx = DeviceContext::cpu().unwrap();
        let a = Tensor::from_f64(&ctx, 3, 3, Dtype::F64, &[0.0, 2.0, 1.0, 1.0, 1.0, 0.0, 2.0, 0.0, 3.0])
            .unwrap();
        let det = determinant(&a, &[]).unwrap();
        assert!((det.re - -8.0).abs() < 1e-9, "{det}");

        let singular = Tensor::from_f64(&ctx, 2, 2, Dtype::F64, &[1.0, 2.0, 2.0, 4.0]).unwrap();
        assert_eq!(determinant(&singular, &[]).unwrap(), Complex64::new(0.0, 0.0));
        assert_eq!(
            a.to_f64_vec(&[]).unwrap(),
            vec![0.0, 2.0, 1.0, 1.0, 1.0, 0.0, 2.0, 0.0, 3.0]
        );
    }

    #[test]
    fn inverse_times_matrix_is_identity() {
        let ctx = DeviceContext::cpu().unwrap();
        let a = Tensor::from_f64(&ctx, 3, 3, Dtype::F64, &[4.0, 7.0, 2.0, 3.0, 6.0, 1.0, 2.0, 5.0, 3.0])
            .unwrap();
        let (inv, ev) = inverse(&a, &[]).unwrap();
        let (id, ev) = matmul(&a, &inv, &[ev]).unwrap();
        let got = id.to_f64_vec(&[ev]).unwrap();
        assert!(approx_eq_slice(
            &got,
            &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]
        ));
    }

    #[test]
    fn singular_inverse_fails() {
        let ctx = DeviceContext::cpu().unwrap();
        let a = Tensor::from_f64(&ctx, 2, 2, Dtype::F32, &[1.0, 2.0, 2.0, 4.0]).unwrap();
        assert!(matches!(inverse(&a, &[]), Err(Error::Singular)));
        let wide = Tensor::zeros(&ctx, 2, 3, Dtype::F32).unwrap();
        assert!(matches!(inverse(&wide, &[]), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn rank_of_deficient_matrices() {
        let ctx = DeviceContext::cpu().unwrap();
        let a = Tensor::from_f64(&ctx, 3, 3, Dtype::F64, &[1.0, 2.0, 3.0, 2.0, 4.0, 6.0, 1.0, 0.0, 1.0])
            .unwrap();
        assert_eq!(rank(&a, &[]).unwrap(), 2);
        let wide = Tensor::from_f64(&ctx, 2, 3, Dtype::F64, &[1.0, -1.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
        assert_eq!(rank(&wide, &[]).unwrap(), 1);
        let eye = Tensor::identity(&ctx, 4, Dtype::F32).unwrap();
        assert_eq!(rank(&eye, &[]).unwrap(), 4);
    }

    #[test]
    fn pseudo_inverse_of_tall_and_wide() {
        let ctx = DeviceContext::cpu().unwrap();
        let tall = Tensor::from_f64(&ctx, 3, 2, Dtype::F64, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
        let (p, ev) = pinv(&tall, &[]).unwrap();
        assert_eq!(p.shape(), (2, 3));
        let (left, ev) = matmul(&p, &tall, &[ev]).unwrap();
        assert!(approx_eq_slice(&left.to_f64_vec(&[ev]).unwrap(), &[1.0, 0.0, 0.0, 1.0]));

        let wide = Tensor::from_f64(&ctx, 2, 3, Dtype::F64, &[1.0, 0.0, 1.0, 0.0, 1.0, 1.0]).unwrap();
        let (p, ev) = pinv(&wide, &[]).unwrap();
        assert_eq!(p.shape(), (3, 2));
        let (right, ev) = matmul(&wide, &p, &[ev]).unwrap();
        assert!(approx_eq_slice(&right.to_f64_vec(&[ev]).unwrap(), &[1.0, 0.0, 0.0, 1.0]));
    }

    #[test]
    fn complex_inverse() {
        let ctx = DeviceContext::cpu().unwrap();
        let c = |re, im| Complex64::new(re, im);
        let a = Tensor::from_complex(&ctx, 2, 2, Dtype::F64, &[c(0.0, 1.0), c(0.0, 0.0), c(0.0, 0.0), c(2.0, 0.0)])
            .unwrap();
        let (inv, ev) = inverse(&a, &[]).unwrap();
        let got = inv.to_complex_vec(&[ev]).unwrap();
        assert!((got[0] - c(0.0, -1.0)).norm() < 1e-12);
        assert!((got[3] - c(0.5, 0.0)).norm() < 1e-12);
        assert!(got[1].norm() < 1e-12 && got[2].norm() < 1e-12);
    }
}
