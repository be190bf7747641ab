//! General matrix multiply.
//!
//! [`Gemm`] computes `C = α·op(A)·op(B) + β·C`. The tiled variant splits the
//! operands into 2×2 quadrant views and evaluates the seven Strassen products
//! on independent queues before combining them into `C`'s quadrants.

use num_complex::Complex64;
use tracing::trace;

use super::{AsOperand, Operand, Tensor, TensorView, check_shape, submit};
use crate::device::event::Event;
use crate::device::kernel::{KernelId, KernelParams};
use crate::error::{Error, Result};

/// Operand transformation applied before multiplying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Op {
    /// As is.
    #[default]
    N,
    /// Transposed.
    T,
    /// Conjugate transposed.
    C,
}

impl Op {
    const fn code(self) -> usize {
        match self {
            Self::N => 0,
            Self::T => 1,
            Self::C => 2,
        }
    }

    const fn apply(self, (rows, cols): (usize, usize)) -> (usize, usize) {
        match self {
            Self::N => (rows, cols),
            Self::T | Self::C => (cols, rows),
        }
    }
}

/// Coefficients and operand transformations of one GEMM call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gemm {
    /// Scale of the product.
    pub alpha: Complex64,
    /// Scale of the previous `C`. Zero overwrites `C` without reading it.
    pub beta: Complex64,
    /// Transformation of `A`.
    pub op_a: Op,
    /// Transformation of `B`.
    pub op_b: Op,
}

impl Default for Gemm {
    fn default() -> Self {
        Self::new()
    }
}

impl Gemm {
    /// `C = A·B`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            alpha: Complex64::new(1.0, 0.0),
            beta: Complex64::new(0.0, 0.0),
            op_a: Op::N,
            op_b: Op::N,
        }
    }

    /// Sets `α`.
    #[must_use]
    pub const fn alpha(mut self, alpha: Complex64) -> Self {
        self.alpha = alpha;
        self
    }

    /// Sets `β`.
    #[must_use]
    pub const fn beta(mut self, beta: Complex64) -> Self {
        self.beta = beta;
        self
    }

    /// Sets `op(A)`.
    #[must_use]
    pub const fn op_a(mut self, op: Op) -> Self {
        self.op_a = op;
        self
    }

    /// Sets `op(B)`.
    #[must_use]
    pub const fn op_b(mut self, op: Op) -> Self {
        self.op_b = op;
        self
    }

    /// Output shape and inner dimension for the given operands.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if the inner dimensions differ.
    pub fn output_shape(
        &self,
        a: (usize, usize),
        b: (usize, usize),
    ) -> Result<((usize, usize), usize)> {
        let (m, k) = self.op_a.apply(a);
        let (k2, n) = self.op_b.apply(b);
        if k != k2 {
            return Err(Error::shape("gemm", (m, k), (k2, n)));
        }
        Ok(((m, n), k))
    }

    fn validate(&self, a: &Operand<'_>, b: &Operand<'_>, c: &Operand<'_>) -> Result<usize> {
        let (shape, k) = self.output_shape(a.shape(), b.shape())?;
        check_shape("gemm", shape, c.shape())?;
        if c.same_storage(a) || c.same_storage(b) {
            return Err(Error::invalid("gemm output must not share storage with its inputs"));
        }
        Ok(k)
    }

    fn is_complex(&self, a: &Operand<'_>, b: &Operand<'_>, c: &Operand<'_>) -> bool {
        a.is_complex()
            || b.is_complex()
            || c.is_complex()
            || self.alpha.im != 0.0
            || self.beta.im != 0.0
    }

    fn submit_on(
        &self,
        a: Operand<'_>,
        b: Operand<'_>,
        c: Operand<'_>,
        k: usize,
        queue: usize,
        wait: &[Event],
    ) -> Result<Event> {
        let params = KernelParams::new(c.rows(), c.cols())
            .extra(0, k)
            .extra(1, self.op_a.code())
            .extra(2, self.op_b.code())
            .scalar(0, self.alpha.re)
            .scalar(1, self.alpha.im)
            .scalar(2, self.beta.re)
            .scalar(3, self.beta.im);
        let complex = self.is_complex(&a, &b, &c);
        submit(KernelId::Gemm, &[a, b, c], params, complex, queue, wait)
    }

    /// `C ← α·op(A)·op(B) + β·C` as one kernel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] for incompatible shapes and
    /// [`Error::InvalidArgument`] if `C` shares storage with `A` or `B`.
    pub fn run(
        &self,
        a: &impl AsOperand,
        b: &impl AsOperand,
        c: &impl AsOperand,
        wait: &[Event],
    ) -> Result<Event> {
        let (a, b, c) = (a.operand(), b.operand(), c.operand());
        let k = self.validate(&a, &b, &c)?;
        self.submit_on(a, b, c, k, 0, wait)
    }

    /// Same result as [`Gemm::run`], computed with one level of Strassen
    /// partitioning spread across the context's queues.
    ///
    /// Falls back to [`Gemm::run`] for odd dimensions, transformed operands,
    /// or operands smaller than the configured tile threshold.
    ///
    /// # Errors
    ///
    /// See [`Gemm::run`].
    pub fn run_tiled(
        &self,
        a: &impl AsOperand,
        b: &impl AsOperand,
        c: &impl AsOperand,
        wait: &[Event],
    ) -> Result<Event> {
        let (a, b, c) = (a.operand(), b.operand(), c.operand());
        let k = self.validate(&a, &b, &c)?;
        let (m, n) = c.shape();
        let ctx = c.tensor().context();
        let threshold = ctx.config().tile_threshold.max(2);
        let even = m % 2 == 0 && n % 2 == 0 && k % 2 == 0;
        let plain = self.op_a == Op::N && self.op_b == Op::N;
        if !even || !plain || m.min(n).min(k) < threshold {
            return self.submit_on(a, b, c, k, 0, wait);
        }
        trace!(m, n, k, "strassen gemm");
        self.strassen(a, b, c, wait)
    }

    fn strassen(&self, a: Operand<'_>, b: Operand<'_>, c: Operand<'_>, wait: &[Event]) -> Result<Event> {
        let ctx = c.tensor().context();
        let queues = ctx.queue_count();
        let complex = self.is_complex(&a, &b, &c);
        let dtype = c.dtype();
        let [a11, a12, a21, a22] = a.quadrants()?.map(TensorView::into_operand);
        let [b11, b12, b21, b22] = b.quadrants()?.map(TensorView::into_operand);
        let [c11, c12, c21, c22] = c.quadrants()?.map(TensorView::into_operand);
        let (h, kh, w) = (a11.rows(), a11.cols(), b11.cols());

        let scratch = |rows: usize, cols: usize| -> Result<Tensor> {
            if complex {
                Tensor::complex_zeros(ctx, rows, cols, dtype)
            } else {
                Tensor::zeros(ctx, rows, cols, dtype)
            }
        };

        let plans: [(Vec<(f64, Operand<'_>)>, Vec<(f64, Operand<'_>)>); 7] = [
            (vec![(1.0, a11), (1.0, a22)], vec![(1.0, b11), (1.0, b22)]),
            (vec![(1.0, a21), (1.0, a22)], vec![(1.0, b11)]),
            (vec![(1.0, a11)], vec![(1.0, b12), (-1.0, b22)]),
            (vec![(1.0, a22)], vec![(1.0, b21), (-1.0, b11)]),
            (vec![(1.0, a11), (1.0, a12)], vec![(1.0, b22)]),
            (vec![(1.0, a21), (-1.0, a11)], vec![(1.0, b11), (1.0, b12)]),
            (vec![(1.0, a12), (-1.0, a22)], vec![(1.0, b21), (1.0, b22)]),
        ];

        // Operand sums first, each on the queue of the product consuming it.
        let mut sums: Vec<Tensor> = Vec::new();
        let mut inputs = Vec::with_capacity(7);
        for (i, (left, right)) in plans.iter().enumerate() {
            let queue = i % queues;
            let lhs = materialise(left, (h, kh), &scratch, queue, wait, &mut sums)?;
            let rhs = materialise(right, (kh, w), &scratch, queue, wait, &mut sums)?;
            inputs.push((lhs, rhs));
        }

        let products = (0..7).map(|_| scratch(h, w)).collect::<Result<Vec<_>>>()?;
        let mut product_events = Vec::with_capacity(7);
        for (i, ((lhs, rhs), product)) in inputs.iter().zip(&products).enumerate() {
            let deps: Vec<Event> = lhs.event().into_iter().chain(rhs.event()).collect();
            let deps = if deps.is_empty() { wait } else { deps.as_slice() };
            let ev = Gemm::new().submit_on(
                lhs.resolve(&sums),
                rhs.resolve(&sums),
                product.operand(),
                kh,
                i % queues,
                deps,
            )?;
            product_events.push(ev);
        }

        let p = |i: usize| products[i].operand();
        let combinations: [(Operand<'_>, Vec<(f64, Operand<'_>)>); 4] = [
            (c11, vec![(1.0, p(0)), (1.0, p(3)), (-1.0, p(4)), (1.0, p(6))]),
            (c12, vec![(1.0, p(2)), (1.0, p(4))]),
            (c21, vec![(1.0, p(1)), (1.0, p(3))]),
            (c22, vec![(1.0, p(0)), (-1.0, p(1)), (1.0, p(2)), (1.0, p(5))]),
        ];

        let one = Complex64::new(1.0, 0.0);
        let mut done = Vec::with_capacity(4);
        for (target, terms) in &combinations {
            let mut ev = if self.beta == Complex64::new(0.0, 0.0) {
                super::ops::fill(target, Complex64::new(0.0, 0.0), &product_events)?
            } else {
                super::ops::scale(self.beta, target, &product_events)?
            };
            for (sign, term) in terms {
                ev = super::ops::axpby(self.alpha * *sign, term, one, target, &[ev])?;
            }
            done.push(ev);
        }
        ctx.barrier(&done)
    }
}

/// One Strassen input: a quadrant used in place, or a materialised sum.
enum Input<'t> {
    Direct(Operand<'t>),
    Sum(usize, Event),
}

impl<'t> Input<'t> {
    fn event(&self) -> Option<Event> {
        match self {
            Self::Direct(_) => None,
            Self::Sum(_, ev) => Some(ev.clone()),
        }
    }

    fn resolve<'s>(&self, sums: &'s [Tensor]) -> Operand<'s>
    where
        't: 's,
    {
        match self {
            Self::Direct(op) => *op,
            Self::Sum(index, _) => sums[*index].operand(),
        }
    }
}

/// Evaluates `Σ coeff·term` into a scratch tensor, unless it is a single
/// unit term that can be used in place.
fn materialise<'t, F>(
    terms: &[(f64, Operand<'t>)],
    shape: (usize, usize),
    scratch: &F,
    queue: usize,
    wait: &[Event],
    sums: &mut Vec<Tensor>,
) -> Result<Input<'t>>
where
    F: Fn(usize, usize) -> Result<Tensor>,
{
    if let [(coeff, term)] = terms {
        if *coeff == 1.0 {
            return Ok(Input::Direct(*term));
        }
    }
    let out = scratch(shape.0, shape.1)?;
    let complex = out.is_complex();
    let mut ev: Option<Event> = None;
    for &(coeff, term) in terms {
        let params = KernelParams::new(shape.0, shape.1)
            .scalar(0, coeff)
            .scalar(2, 1.0);
        let deps = ev.as_ref().map_or(wait, core::slice::from_ref);
        ev = Some(submit(KernelId::Axpby, &[term, out.operand()], params, complex, queue, deps)?);
    }
    let ev = ev.ok_or_else(|| Error::invalid("empty strassen sum"))?;
    sums.push(out);
    Ok(Input::Sum(sums.len() - 1, ev))
}

/// Allocates `C = op(A)·op(B)` and computes it.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] before allocating anything when the
/// inner dimensions differ.
pub fn matmul(a: &impl AsOperand, b: &impl AsOperand, wait: &[Event]) -> Result<(Tensor, Event)> {
    product(Gemm::new(), a, b, false, wait)
}

/// [`matmul`] using the tiled path.
///
/// # Errors
///
/// See [`matmul`].
pub fn matmul_tiled(a: &impl AsOperand, b: &impl AsOperand, wait: &[Event]) -> Result<(Tensor, Event)> {
    product(Gemm::new(), a, b, true, wait)
}

/// Allocates the output of `gemm` (with `β` ignored) and computes it.
///
/// # Errors
///
/// See [`matmul`].
pub fn product(
    gemm: Gemm,
    a: &impl AsOperand,
    b: &impl AsOperand,
    tiled: bool,
    wait: &[Event],
) -> Result<(Tensor, Event)> {
    let (a, b) = (a.operand(), b.operand());
    check_dtype_pair(&a, &b)?;
    let ((m, n), _) = gemm.output_shape(a.shape(), b.shape())?;
    let ctx = a.tensor().context();
    let c = Tensor::zeros(ctx, m, n, a.dtype())?;
    let gemm = gemm.beta(Complex64::new(0.0, 0.0));
    let ev = if tiled {
        gemm.run_tiled(&a, &b, &c, wait)?
    } else {
        gemm.run(&a, &b, &c, wait)?
    };
    Ok((c, ev))
}

fn check_dtype_pair(a: &Operand<'_>, b: &Operand<'_>) -> Result<()> {
    super::check_dtype(a.dtype(), b.dtype())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approx::approx_eq_slice;
    use crate::config::ContextConfig;
    use crate::device::DeviceContext;
    use crate::device::dtype::Dtype;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    #[test]
    fn gemm_honours_ops_and_coefficients() {
        let ctx = DeviceContext::cpu().unwrap();
        // A is 3x2, so Aᵀ·A is 2x2
        let a = Tensor::from_f64(&ctx, 3, 2, Dtype::F64, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let c = Tensor::from_f64(&ctx, 2, 2, Dtype::F64, &[1.0, 1.0, 1.0, 1.0]).unwrap();
        let ev = Gemm::new()
            .op_a(Op::T)
            .alpha(Complex64::new(2.0, 0.0))
            .beta(Complex64::new(1.0, 0.0))
            .run(&a, &a, &c, &[])
            .unwrap();
        assert_eq!(c.to_f64_vec(&[ev]).unwrap(), vec![71.0, 89.0, 89.0, 113.0]);
    }

    #[test]
    fn shape_mismatch_allocates_nothing() {
        let ctx = DeviceContext::cpu().unwrap();
        let a = Tensor::zeros(&ctx, 2, 3, Dtype::F32).unwrap();
        let b = Tensor::zeros(&ctx, 2, 3, Dtype::F32).unwrap();
        let before = ctx.stats();
        assert!(matches!(matmul(&a, &b, &[]), Err(Error::ShapeMismatch { .. })));
        assert_eq!(ctx.stats(), before);
        assert!(matches!(
            Gemm::new().run(&a, &b, &a, &[]),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn output_may_not_alias_inputs() {
        let ctx = DeviceContext::cpu().unwrap();
        let a = Tensor::zeros(&ctx, 2, 2, Dtype::F64).unwrap();
        let b = Tensor::zeros(&ctx, 2, 2, Dtype::F64).unwrap();
        assert!(matches!(
            Gemm::new().run(&a, &b, &a, &[]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn conjugate_transpose_of_complex_operand() {
        let ctx = DeviceContext::cpu().unwrap();
        let a = Tensor::from_complex(
            &ctx,
            1,
            2,
            Dtype::F64,
            &[Complex64::new(1.0, 1.0), Complex64::new(0.0, 2.0)],
        )
        .unwrap();
        // Aᴴ·A = [[2, 2+2i], [2-2i, 4]]
        let (g, ev) = product(Gemm::new().op_a(Op::C), &a, &a, false, &[]).unwrap();
        assert_eq!(
            g.to_complex_vec(&[ev]).unwrap(),
            vec![
                Complex64::new(2.0, 0.0),
                Complex64::new(2.0, 2.0),
                Complex64::new(2.0, -2.0),
                Complex64::new(4.0, 0.0),
            ]
        );
    }

    #[test]
    fn tiled_matches_simple() {
        let cfg = ContextConfig::default().with_tile_threshold(4).with_queues(3);
        let ctx = DeviceContext::from_config(cfg).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let mut sample = |n| (0..n).map(|_| rng.random_range(-1.0..1.0)).collect::<Vec<f64>>();
        let a = Tensor::from_f64(&ctx, 8, 6, Dtype::F64, &sample(48)).unwrap();
        let b = Tensor::from_f64(&ctx, 6, 10, Dtype::F64, &sample(60)).unwrap();
        let init = sample(80);
        let c1 = Tensor::from_f64(&ctx, 8, 10, Dtype::F64, &init).unwrap();
        let c2 = Tensor::from_f64(&ctx, 8, 10, Dtype::F64, &init).unwrap();

        let gemm = Gemm::new()
            .alpha(Complex64::new(0.5, 0.0))
            .beta(Complex64::new(-1.0, 0.0));
        let e1 = gemm.run(&a, &b, &c1, &[]).unwrap();
        let e2 = gemm.run_tiled(&a, &b, &c2, &[]).unwrap();
        let simple = c1.to_f64_vec(&[e1]).unwrap();
        let tiled = c2.to_f64_vec(&[e2]).unwrap();
        assert!(approx_eq_slice(&simple, &tiled));
    }

    #[test]
    fn tiled_falls_back_for_odd_shapes() {
        let ctx = DeviceContext::from_config(ContextConfig::default().with_tile_threshold(2)).unwrap();
        let a = Tensor::from_f64(&ctx, 3, 3, Dtype::F64, &[1.0; 9]).unwrap();
        let (c, ev) = matmul_tiled(&a, &a, &[]).unwrap();
        assert_eq!(c.to_f64_vec(&[ev]).unwrap(), vec![3.0; 9]);
    }
}
