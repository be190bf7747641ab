//! Host kernel bodies.
//!
//! A job snapshots every bound buffer into `f64` planes, runs the kernel over
//! those planes, and writes back only the elements a written operand changed.
//! Reading snapshots gives the same semantics a GPU dispatch has for aliased
//! bindings, and writing back changed elements only keeps disjoint views of a
//! shared buffer independent.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use num_complex::Complex64;
use rayon::prelude::*;

use super::HostBuffer;
use crate::device::dtype::{self, Dtype};
use crate::device::kernel::{KernelId, KernelKey, KernelParams};

const ZERO: Complex64 = Complex64::new(0.0, 0.0);
const ONE: Complex64 = Complex64::new(1.0, 0.0);

/// Compiled form of a host kernel.
#[derive(Debug, Clone, Copy)]
pub(super) struct HostKernel {
    pub(super) key: KernelKey,
}

struct Plane {
    buffer: usize,
    values: Vec<f64>,
    original: Option<Vec<f64>>,
}

impl Plane {
    fn load(dtype: Dtype, buffer: usize, source: &HostBuffer, writes: bool) -> Self {
        let bytes = source.bytes.read();
        let mut values = vec![0.0; bytes.len() / dtype.size()];
        dtype::decode(dtype, &bytes, &mut values);
        let original = writes.then(|| values.clone());
        Self {
            buffer,
            values,
            original,
        }
    }

    fn store(&self, dtype: Dtype, target: &HostBuffer) {
        let Some(original) = &self.original else {
            return;
        };
        let size = dtype.size();
        let mut bytes = target.bytes.write();
        for (i, (&new, &old)) in self.values.iter().zip(original).enumerate() {
            if new.to_bits() != old.to_bits() {
                dtype::encode(dtype, &[new], &mut bytes[i * size..(i + 1) * size]);
            }
        }
    }
}

/// One bound operand: a real plane, an optional imaginary plane and the
/// placement of the operand's `(0, 0)` element.
struct Operand {
    re: Plane,
    im: Option<Plane>,
    off: usize,
    ld: usize,
}

impl Operand {
    fn get(&self, r: usize, c: usize) -> Complex64 {
        let i = self.off + r * self.ld + c;
        Complex64::new(
            self.re.values[i],
            self.im.as_ref().map_or(0.0, |p| p.values[i]),
        )
    }

    fn real(&self, r: usize, c: usize) -> f64 {
        self.re.values[self.off + r * self.ld + c]
    }

    fn set(&mut self, r: usize, c: usize, v: Complex64) {
        let i = self.off + r * self.ld + c;
        self.re.values[i] = v.re;
        if let Some(im) = &mut self.im {
            im.values[i] = v.im;
        }
    }

    fn set_real(&mut self, r: usize, c: usize, v: f64) {
        let i = self.off + r * self.ld + c;
        self.re.values[i] = v;
    }

    fn assign(&mut self, rows: usize, cols: usize, values: &[Complex64]) {
        for r in 0..rows {
            for c in 0..cols {
                self.set(r, c, values[r * cols + c]);
            }
        }
    }
}

/// Evaluates `f` over a `rows × cols` domain in parallel, row-major.
fn compute<F>(rows: usize, cols: usize, f: F) -> Vec<Complex64>
where
    F: Fn(usize, usize) -> Complex64 + Sync + Send,
{
    if cols == 0 {
        return Vec::new();
    }
    (0..rows * cols)
        .into_par_iter()
        .map(|i| f(i / cols, i % cols))
        .collect()
}

fn sign(v: Complex64) -> Complex64 {
    let norm = v.norm();
    if norm == 0.0 { ZERO } else { v / norm }
}

fn sigmoid(v: Complex64) -> Complex64 {
    ONE / (ONE + (-v).exp())
}

fn op_element(op: usize, m: &Operand, i: usize, j: usize) -> Complex64 {
    match op {
        0 => m.get(i, j),
        1 => m.get(j, i),
        _ => m.get(j, i).conj(),
    }
}

impl HostKernel {
    pub(super) fn run(
        self,
        params: &KernelParams,
        buffers: &[Arc<HostBuffer>],
    ) -> Result<(), String> {
        let key = self.key;
        let dtype = key.dtype;
        let mut next = 0;
        let mut ops = Vec::with_capacity(key.id.signature().len());
        for (index, slot) in key.id.signature().iter().enumerate() {
            let writes = slot.access.writes();
            let re = Plane::load(dtype, next, &buffers[next], writes);
            next += 1;
            let im = if key.complex && slot.paired {
                let plane = Plane::load(dtype, next, &buffers[next], writes);
                next += 1;
                Some(plane)
            } else {
                None
            };
            let (off, ld) = params.placement(index);
            ops.push(Operand { re, im, off, ld });
        }

        catch_unwind(AssertUnwindSafe(|| execute(key.id, params, &mut ops)))
            .map_err(|_| format!("kernel `{key}` accessed memory outside its operands"))?;

        for op in &ops {
            op.re.store(dtype, &buffers[op.re.buffer]);
            if let Some(im) = &op.im {
                im.store(dtype, &buffers[im.buffer]);
            }
        }
        Ok(())
    }
}

#[allow(clippy::too_many_lines)]
fn execute(id: KernelId, p: &KernelParams, ops: &mut [Operand]) {
    let (rows, cols) = (p.rows(), p.cols());
    let s = p.scalars;
    let alpha = Complex64::new(s[0], s[1]);
    let beta = Complex64::new(s[2], s[3]);

    macro_rules! unary {
        (|$v:ident| $body:expr) => {{
            let y = &ops[0];
            let vals = compute(rows, cols, |r, c| {
                let $v = y.get(r, c);
                $body
            });
            ops[0].assign(rows, cols, &vals);
        }};
    }

    macro_rules! binary {
        (|$x:ident, $y:ident, $r:ident, $c:ident| $body:expr) => {{
            let (src, dst) = (&ops[0], &ops[1]);
            let vals = compute(rows, cols, |$r, $c| {
                let $x = src;
                let $y = dst;
                $body
            });
            ops[1].assign(rows, cols, &vals);
        }};
    }

    match id {
        KernelId::Fill => unary!(|_v| alpha),
        KernelId::Scale => unary!(|v| alpha * v),
        KernelId::Conj => unary!(|v| v.conj()),
        KernelId::Sigmoid => unary!(|v| sigmoid(v)),
        KernelId::Tanh => unary!(|v| v.tanh()),
        KernelId::Relu => unary!(|v| Complex64::from(v.re.max(0.0))),
        KernelId::LeakyRelu => unary!(|v| if v.re > 0.0 { v } else { v * s[0] }),

        KernelId::Copy => binary!(|x, _y, r, c| x.get(r, c)),
        KernelId::Axpby => binary!(|x, y, r, c| alpha * x.get(r, c) + beta * y.get(r, c)),
        KernelId::Hadamard => binary!(|x, y, r, c| x.get(r, c) * y.get(r, c)),
        KernelId::Transpose => binary!(|x, _y, r, c| x.get(c, r)),
        KernelId::AddRow => binary!(|x, y, r, c| y.get(r, c) + x.get(0, c)),
        KernelId::Abs => binary!(|x, _y, r, c| Complex64::from(x.get(r, c).norm())),
        KernelId::Abs2 => binary!(|x, _y, r, c| Complex64::from(x.get(r, c).norm_sqr())),
        KernelId::Sign => binary!(|x, _y, r, c| sign(x.get(r, c))),
        KernelId::SigmoidGrad | KernelId::SoftmaxGrad => {
            binary!(|x, _y, r, c| {
                let v = x.get(r, c);
                v * (ONE - v)
            });
        }
        KernelId::TanhGrad => binary!(|x, _y, r, c| {
            let v = x.get(r, c);
            ONE - v * v
        }),
        KernelId::ReluGrad => binary!(|x, _y, r, c| {
            if x.real(r, c) > 0.0 { ONE } else { ZERO }
        }),
        KernelId::LeakyReluGrad => binary!(|x, _y, r, c| {
            if x.real(r, c) > 0.0 { ONE } else { Complex64::from(s[0]) }
        }),
        KernelId::Diagonal => binary!(|x, _y, _r, c| x.get(c, c)),

        KernelId::Softmax => {
            for r in 0..rows {
                let max = (0..cols)
                    .map(|c| ops[0].real(r, c))
                    .fold(f64::NEG_INFINITY, f64::max);
                let exps: Vec<f64> = (0..cols).map(|c| (ops[0].real(r, c) - max).exp()).collect();
                let sum: f64 = exps.iter().sum();
                for (c, e) in exps.into_iter().enumerate() {
                    ops[0].set_real(r, c, e / sum);
                }
            }
        }

        KernelId::FoldRows | KernelId::FoldCols => {
            let keep = p.extra_at(0);
            let product = p.extra_at(1) == 1;
            let by_rows = id == KernelId::FoldRows;
            let y = &ops[0];
            let vals = compute(rows, cols, |r, c| {
                let (a, b) = if by_rows {
                    (y.get(r, c), y.get(r + keep, c))
                } else {
                    (y.get(r, c), y.get(r, c + keep))
                };
                if product { a * b } else { a + b }
            });
            ops[0].assign(rows, cols, &vals);
        }

        KernelId::Gemm => {
            let k = p.extra_at(0);
            let (op_a, op_b) = (p.extra_at(1), p.extra_at(2));
            let (a, b, dst) = (&ops[0], &ops[1], &ops[2]);
            let vals = compute(rows, cols, |i, j| {
                let acc = (0..k).fold(ZERO, |acc, l| {
                    acc + op_element(op_a, a, i, l) * op_element(op_b, b, l, j)
                });
                if beta == ZERO {
                    alpha * acc
                } else {
                    alpha * acc + beta * dst.get(i, j)
                }
            });
            ops[2].assign(rows, cols, &vals);
        }

        KernelId::GjPivot => gj_pivot(p, ops),
        KernelId::GjNormalize => {
            let (m, meta) = split(ops);
            if meta.real(0, 1) != 0.0 {
                return;
            }
            let pr = pivot_row(meta);
            let pivot = meta.get(0, 4);
            for c in 0..cols {
                let v = m.get(pr, c) / pivot;
                m.set(pr, c, v);
            }
        }
        KernelId::GjEliminate => {
            let (m, meta) = split(ops);
            if meta.real(0, 1) != 0.0 {
                return;
            }
            let pr = pivot_row(meta);
            for r in (0..rows).filter(|&r| r != pr) {
                let factor = meta.get(0, 5 + r);
                for c in 0..cols {
                    let v = m.get(r, c) - factor * m.get(pr, c);
                    m.set(r, c, v);
                }
            }
        }

        KernelId::SgdStep
        | KernelId::MomentumStep
        | KernelId::NesterovStep
        | KernelId::AdagradStep
        | KernelId::RmspropStep
        | KernelId::AdadeltaStep
        | KernelId::AdamStep => {
            for r in 0..rows {
                for c in 0..cols {
                    optimizer_step(id, &s, ops, r, c);
                }
            }
        }
    }
}

fn split(ops: &mut [Operand]) -> (&mut Operand, &Operand) {
    let (head, tail) = ops.split_at_mut(1);
    (&mut head[0], &tail[0])
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn pivot_row(meta: &Operand) -> usize {
    meta.real(0, 2) as usize
}

/// Meta layout: `[det, skip, pivot_row, pivot_count, pivot, factors...]`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn gj_pivot(p: &KernelParams, ops: &mut [Operand]) {
    let (m_rows, m_cols, k) = (p.extra_at(0), p.extra_at(1), p.extra_at(2));
    let tol = p.scalars[0];
    let (head, tail) = ops.split_at_mut(1);
    let (m, meta) = (&mut head[0], &mut tail[0]);

    let row = meta.real(0, 3) as usize;
    if row >= m_rows {
        meta.set(0, 1, ONE);
        return;
    }

    let (best, magnitude) = (row..m_rows)
        .map(|r| (r, m.get(r, k).norm()))
        .fold((row, -1.0), |acc, cur| if cur.1 > acc.1 { cur } else { acc });
    if magnitude <= tol {
        meta.set(0, 0, ZERO);
        meta.set(0, 1, ONE);
        return;
    }

    let mut det = meta.get(0, 0);
    if best != row {
        for c in 0..m_cols {
            let (a, b) = (m.get(row, c), m.get(best, c));
            m.set(row, c, b);
            m.set(best, c, a);
        }
        det = -det;
    }
    let pivot = m.get(row, k);
    meta.set(0, 0, det * pivot);
    meta.set(0, 1, ZERO);
    meta.set(0, 2, Complex64::from(row as f64));
    meta.set(0, 3, Complex64::from((row + 1) as f64));
    meta.set(0, 4, pivot);
    for r in 0..m_rows {
        let factor = if r == row { ZERO } else { m.get(r, k) };
        meta.set(0, 5 + r, factor);
    }
}

/// Scalars: `[lr, decay, eps, beta2, bias1, bias2]`.
fn optimizer_step(id: KernelId, s: &[f64; 8], ops: &mut [Operand], r: usize, c: usize) {
    let (lr, decay, eps) = (s[0], s[1], s[2]);
    let w = ops[0].real(r, c);
    let g = ops[1].real(r, c);
    let delta = match id {
        KernelId::SgdStep => lr * g,
        KernelId::MomentumStep => {
            let v = decay * ops[2].real(r, c) + g;
            ops[2].set_real(r, c, v);
            lr * v
        }
        KernelId::NesterovStep => {
            let v = decay * ops[2].real(r, c) + g;
            ops[2].set_real(r, c, v);
            lr * (g + decay * v)
        }
        KernelId::AdagradStep => {
            let acc = ops[2].real(r, c) + g * g;
            ops[2].set_real(r, c, acc);
            lr * g / (acc + eps).sqrt()
        }
        KernelId::RmspropStep => {
            let acc = decay * ops[2].real(r, c) + (1.0 - decay) * g * g;
            ops[2].set_real(r, c, acc);
            lr * g / (acc + eps).sqrt()
        }
        KernelId::AdadeltaStep => {
            let acc = decay * ops[2].real(r, c) + (1.0 - decay) * g * g;
            let upd = ops[3].real(r, c);
            let step = (upd + eps).sqrt() / (acc + eps).sqrt() * g;
            ops[2].set_real(r, c, acc);
            ops[3].set_real(r, c, decay * upd + (1.0 - decay) * step * step);
            step
        }
        KernelId::AdamStep => {
            let (beta2, bias1, bias2) = (s[3], s[4], s[5]);
            let m = decay * ops[2].real(r, c) + (1.0 - decay) * g;
            let v = beta2 * ops[3].real(r, c) + (1.0 - beta2) * g * g;
            ops[2].set_real(r, c, m);
            ops[3].set_real(r, c, v);
            lr * (m / bias1) / ((v / bias2).sqrt() + eps)
        }
        _ => return,
    };
    ops[0].set_real(r, c, w - delta);
}
