//! Device-resident matrices.
//!
//! A [`Tensor`] is a row-major `rows × cols` matrix living in device memory,
//! made of a real buffer and an optional imaginary buffer. The imaginary
//! buffer is allocated the first time an operation may produce a non-zero
//! imaginary part ("promotion") and is zero-filled at that point.
//!
//! [`TensorView`] borrows a rectangular window of a tensor without owning
//! any memory; dropping a view never touches the buffers, dropping the owner
//! releases them. Every primitive accepts tensors, views, or single
//! components of them through [`AsOperand`].
//!
//! Device memory is interior-mutable: kernels write through shared
//! references, and ordering is expressed with [`Event`] wait-lists.

pub mod gemm;
pub mod linalg;
pub mod ops;
pub mod reduce;

use core::fmt;
use std::sync::Arc;

use num_complex::Complex64;
use parking_lot::Mutex;
use tracing::trace;

use crate::backend::{BufferId, Launch};
use crate::device::DeviceContext;
use crate::device::dtype::{self, Dtype, Element};
use crate::device::event::Event;
use crate::device::kernel::{KernelId, KernelParams};
use crate::error::{Error, Result};

/// Work-group counts a kernel over this tensor's shape dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchHint {
    /// Work-group extent `(x, y)` = `(cols, rows)` per group.
    pub local: [u32; 2],
    /// Number of groups `(x, y)`.
    pub groups: [u32; 2],
}

impl DispatchHint {
    #[allow(clippy::cast_possible_truncation)]
    fn new(rows: usize, cols: usize, ctx: &DeviceContext) -> Self {
        let limits = ctx.limits();
        let [lx, ly] = limits.workgroup;
        let groups = |n: usize, l: u32| {
            (n.div_ceil(l.max(1) as usize)).min(limits.max_groups as usize) as u32
        };
        Self {
            local: [lx, ly],
            groups: [groups(cols, lx), groups(rows, ly)],
        }
    }
}

/// Largest element count a tensor may hold.
pub const MAX_ELEMENTS: usize = u32::MAX as usize;

/// A GPU-resident 2-D array with an optional imaginary component.
pub struct Tensor {
    ctx: Arc<DeviceContext>,
    rows: usize,
    cols: usize,
    dtype: Dtype,
    re: BufferId,
    im: Mutex<Option<BufferId>>,
    hint: DispatchHint,
}

impl Tensor {
    fn allocate(
        ctx: &Arc<DeviceContext>,
        rows: usize,
        cols: usize,
        dtype: Dtype,
        zeroed: bool,
    ) -> Result<Self> {
        // kernels address elements with 32-bit offsets
        let bytes = rows
            .checked_mul(cols)
            .filter(|&n| n <= MAX_ELEMENTS)
            .and_then(|n| n.checked_mul(dtype.size()))
            .ok_or_else(|| Error::invalid(format!("{rows}x{cols} {dtype} tensor is too large")))?;
        let re = ctx.allocate(bytes, zeroed)?;
        trace!(rows, cols, %dtype, buffer = %re, "tensor allocated");
        Ok(Self {
            ctx: Arc::clone(ctx),
            rows,
            cols,
            dtype,
            re,
            im: Mutex::new(None),
            hint: DispatchHint::new(rows, cols, ctx),
        })
    }

    /// Allocates a zero-filled real tensor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] when the device is out of memory. Returns
    /// [`Error::InvalidArgument`] for more than [`MAX_ELEMENTS`] elements.
    pub fn zeros(ctx: &Arc<DeviceContext>, rows: usize, cols: usize, dtype: Dtype) -> Result<Self> {
        Self::allocate(ctx, rows, cols, dtype, true)
    }

    /// Allocates a real tensor without initialising its contents.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] when the device is out of memory. Returns
    /// [`Error::InvalidArgument`] for more than [`MAX_ELEMENTS`] elements.
    pub fn uninit(ctx: &Arc<DeviceContext>, rows: usize, cols: usize, dtype: Dtype) -> Result<Self> {
        Self::allocate(ctx, rows, cols, dtype, false)
    }

    /// Allocates a zero-filled tensor that already carries an imaginary buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] when the device is out of memory.
    pub fn complex_zeros(
        ctx: &Arc<DeviceContext>,
        rows: usize,
        cols: usize,
        dtype: Dtype,
    ) -> Result<Self> {
        let t = Self::zeros(ctx, rows, cols, dtype)?;
        t.promote_complex()?;
        Ok(t)
    }

    /// Allocates a tensor of the same shape, dtype and representation as `self`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] when the device is out of memory.
    pub fn zeros_like(&self) -> Result<Self> {
        if self.is_complex() {
            Self::complex_zeros(&self.ctx, self.rows, self.cols, self.dtype)
        } else {
            Self::zeros(&self.ctx, self.rows, self.cols, self.dtype)
        }
    }

    /// Uploads host data, blocking until the copy finished.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if `data.len() != rows * cols`.
    pub fn from_slice<T: Element>(
        ctx: &Arc<DeviceContext>,
        rows: usize,
        cols: usize,
        data: &[T],
    ) -> Result<Self> {
        check_len("from_slice", rows, cols, data.len())?;
        let t = Self::uninit(ctx, rows, cols, T::DTYPE)?;
        t.write_raw(bytemuck::cast_slice(data), &[])?.wait()?;
        Ok(t)
    }

    /// Uploads `f64` values converted to `dtype`, blocking until done.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if `data.len() != rows * cols`.
    pub fn from_f64(
        ctx: &Arc<DeviceContext>,
        rows: usize,
        cols: usize,
        dtype: Dtype,
        data: &[f64],
    ) -> Result<Self> {
        check_len("from_f64", rows, cols, data.len())?;
        let t = Self::uninit(ctx, rows, cols, dtype)?;
        t.write_f64(data, &[])?.wait()?;
        Ok(t)
    }

    /// Uploads complex values, blocking until done.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if `data.len() != rows * cols`.
    pub fn from_complex(
        ctx: &Arc<DeviceContext>,
        rows: usize,
        cols: usize,
        dtype: Dtype,
        data: &[Complex64],
    ) -> Result<Self> {
        check_len("from_complex", rows, cols, data.len())?;
        let t = Self::uninit(ctx, rows, cols, dtype)?;
        t.write_complex(data, &[])?.wait()?;
        Ok(t)
    }

    /// A tensor with every element set to `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] when the device is out of memory.
    pub fn full(
        ctx: &Arc<DeviceContext>,
        rows: usize,
        cols: usize,
        dtype: Dtype,
        value: f64,
    ) -> Result<(Self, Event)> {
        let t = Self::uninit(ctx, rows, cols, dtype)?;
        let ev = ops::fill(&t, Complex64::from(value), &[])?;
        Ok((t, ev))
    }

    /// The `n × n` identity matrix.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] when the device is out of memory.
    pub fn identity(ctx: &Arc<DeviceContext>, n: usize, dtype: Dtype) -> Result<Self> {
        let mut data = vec![0.0; n * n];
        data.iter_mut().step_by(n + 1).for_each(|v| *v = 1.0);
        Self::from_f64(ctx, n, n, dtype, &data)
    }

    /// Number of rows.
    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    #[must_use]
    pub const fn cols(&self) -> usize {
        self.cols
    }

    /// `(rows, cols)`.
    #[must_use]
    pub const fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Number of elements.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Returns `true` for tensors without elements.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element type.
    #[must_use]
    pub const fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Whether the imaginary buffer exists.
    #[must_use]
    pub fn is_complex(&self) -> bool {
        self.im.lock().is_some()
    }

    /// The owning context.
    #[must_use]
    pub const fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Dispatch sizing for kernels over this tensor.
    #[must_use]
    pub const fn hint(&self) -> DispatchHint {
        self.hint
    }

    /// Buffer of the real component.
    #[must_use]
    pub const fn real_buffer(&self) -> BufferId {
        self.re
    }

    /// Buffer of the imaginary component, if promoted.
    #[must_use]
    pub fn imag_buffer(&self) -> Option<BufferId> {
        *self.im.lock()
    }

    fn bytes(&self) -> usize {
        self.len() * self.dtype.size()
    }

    /// Allocates the zero-filled imaginary buffer. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] when the device is out of memory.
    pub fn promote_complex(&self) -> Result<()> {
        let mut im = self.im.lock();
        if im.is_none() {
            let buffer = self.ctx.allocate(self.bytes(), true)?;
            trace!(re = %self.re, im = %buffer, "tensor promoted to complex");
            *im = Some(buffer);
        }
        Ok(())
    }

    /// A rectangular window starting at `(row, col)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the window leaves the tensor.
    pub fn view(&self, row: usize, col: usize, rows: usize, cols: usize) -> Result<TensorView<'_>> {
        if row + rows > self.rows || col + cols > self.cols {
            return Err(Error::invalid(format!(
                "view {rows}x{cols} at ({row}, {col}) exceeds {}x{} tensor",
                self.rows, self.cols
            )));
        }
        Ok(TensorView {
            owner: self,
            row,
            col,
            rows,
            cols,
        })
    }

    /// Splits an even-sized tensor into its `[11, 12, 21, 22]` quadrants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if a dimension is odd.
    pub fn quadrants(&self) -> Result<[TensorView<'_>; 4]> {
        self.operand().quadrants()
    }

    /// The real component as an operand.
    #[must_use]
    pub fn real_part(&self) -> Operand<'_> {
        self.operand().with_part(Part::Re)
    }

    /// The imaginary component as an operand.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for real tensors.
    pub fn imag_part(&self) -> Result<Operand<'_>> {
        if !self.is_complex() {
            return Err(Error::invalid("tensor has no imaginary component"));
        }
        Ok(self.operand().with_part(Part::Im))
    }

    /// Device copy of this tensor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] when the device is out of memory.
    pub fn try_clone(&self, wait: &[Event]) -> Result<(Self, Event)> {
        self.operand().to_tensor(wait)
    }

    /// Copies the real buffer's bytes to the host once `wait` completed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceExecution`] if a dependency failed.
    pub fn read_raw(&self, wait: &[Event]) -> Result<Vec<u8>> {
        let mut out = vec![0; self.bytes()];
        self.ctx.backend().read(self.re, 0, &mut out, wait)?;
        Ok(out)
    }

    /// Copies the imaginary buffer's bytes to the host, if promoted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceExecution`] if a dependency failed.
    pub fn read_imag_raw(&self, wait: &[Event]) -> Result<Option<Vec<u8>>> {
        let Some(im) = self.imag_buffer() else {
            return Ok(None);
        };
        let mut out = vec![0; self.bytes()];
        self.ctx.backend().read(im, 0, &mut out, wait)?;
        Ok(Some(out))
    }

    /// Overwrites the real buffer with raw element bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if the byte count does not match.
    pub fn write_raw(&self, bytes: &[u8], wait: &[Event]) -> Result<Event> {
        self.check_bytes("write_raw", bytes.len())?;
        self.ctx.backend().write(self.re, 0, bytes, wait)
    }

    /// Overwrites the imaginary buffer with raw element bytes, promoting first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if the byte count does not match.
    pub fn write_imag_raw(&self, bytes: &[u8], wait: &[Event]) -> Result<Event> {
        self.check_bytes("write_imag_raw", bytes.len())?;
        self.promote_complex()?;
        let im = self
            .imag_buffer()
            .ok_or_else(|| Error::invalid("promotion did not allocate an imaginary buffer"))?;
        self.ctx.backend().write(im, 0, bytes, wait)
    }

    fn check_bytes(&self, op: &'static str, len: usize) -> Result<()> {
        if len == self.bytes() {
            Ok(())
        } else {
            Err(Error::shape(
                op,
                (1, len / self.dtype.size()),
                (self.rows, self.cols),
            ))
        }
    }

    /// Writes `f64` values converted to the tensor's dtype.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if `values.len() != self.len()`.
    pub fn write_f64(&self, values: &[f64], wait: &[Event]) -> Result<Event> {
        check_len("write_f64", self.rows, self.cols, values.len())?;
        let mut bytes = vec![0; self.bytes()];
        dtype::encode(self.dtype, values, &mut bytes);
        self.write_raw(&bytes, wait)
    }

    /// Writes complex values, promoting when any imaginary part is non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if `values.len() != self.len()`.
    pub fn write_complex(&self, values: &[Complex64], wait: &[Event]) -> Result<Event> {
        check_len("write_complex", self.rows, self.cols, values.len())?;
        let re: Vec<f64> = values.iter().map(|v| v.re).collect();
        let first = self.write_f64(&re, wait)?;
        if !self.is_complex() && values.iter().all(|v| v.im == 0.0) {
            return Ok(first);
        }
        let im: Vec<f64> = values.iter().map(|v| v.im).collect();
        let mut bytes = vec![0; self.bytes()];
        dtype::encode(self.dtype, &im, &mut bytes);
        let second = self.write_imag_raw(&bytes, wait)?;
        self.ctx.barrier(&[first, second])
    }

    /// Reads the real component as `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DtypeMismatch`] if `T` is not the tensor's dtype.
    pub fn to_vec<T: Element>(&self, wait: &[Event]) -> Result<Vec<T>> {
        check_dtype(T::DTYPE, self.dtype)?;
        let bytes = self.read_raw(wait)?;
        Ok(bytes
            .chunks_exact(self.dtype.size())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// Reads the real component widened to `f64`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceExecution`] if a dependency failed.
    pub fn to_f64_vec(&self, wait: &[Event]) -> Result<Vec<f64>> {
        let bytes = self.read_raw(wait)?;
        let mut out = vec![0.0; self.len()];
        dtype::decode(self.dtype, &bytes, &mut out);
        Ok(out)
    }

    /// Reads both components.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceExecution`] if a dependency failed.
    pub fn to_complex_vec(&self, wait: &[Event]) -> Result<Vec<Complex64>> {
        let re = self.to_f64_vec(wait)?;
        let mut im = vec![0.0; self.len()];
        if let Some(bytes) = self.read_imag_raw(&[])? {
            dtype::decode(self.dtype, &bytes, &mut im);
        }
        Ok(re
            .into_iter()
            .zip(im)
            .map(|(re, im)| Complex64::new(re, im))
            .collect())
    }

    /// Releases the tensor's buffers. Same as dropping it.
    pub fn free(self) {
        drop(self);
    }
}

impl Drop for Tensor {
    fn drop(&mut self) {
        self.ctx.release(self.re);
        if let Some(im) = self.im.get_mut().take() {
            self.ctx.release(im);
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape())
            .field("dtype", &self.dtype)
            .field("complex", &self.is_complex())
            .field("re", &self.re)
            .finish_non_exhaustive()
    }
}

/// A borrowed rectangular window of a [`Tensor`].
#[derive(Clone, Copy)]
pub struct TensorView<'a> {
    owner: &'a Tensor,
    row: usize,
    col: usize,
    rows: usize,
    cols: usize,
}

impl<'a> TensorView<'a> {
    /// The view as an operand with the owner's lifetime.
    #[must_use]
    pub const fn into_operand(self) -> Operand<'a> {
        Operand {
            tensor: self.owner,
            row: self.row,
            col: self.col,
            rows: self.rows,
            cols: self.cols,
            part: Part::Full,
        }
    }

    /// The tensor this view borrows.
    #[must_use]
    pub const fn owner(&self) -> &'a Tensor {
        self.owner
    }

    /// `(row, col)` of the view's first element inside the owner.
    #[must_use]
    pub const fn origin(&self) -> (usize, usize) {
        (self.row, self.col)
    }

    /// `(rows, cols)` of the view.
    #[must_use]
    pub const fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// A window of this view, relative to its origin.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the window leaves the view.
    pub fn view(&self, row: usize, col: usize, rows: usize, cols: usize) -> Result<Self> {
        if row + rows > self.rows || col + cols > self.cols {
            return Err(Error::invalid(format!(
                "view {rows}x{cols} at ({row}, {col}) exceeds {}x{} view",
                self.rows, self.cols
            )));
        }
        Ok(Self {
            owner: self.owner,
            row: self.row + row,
            col: self.col + col,
            rows,
            cols,
        })
    }

    /// Copies the window into a new tensor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] when the device is out of memory.
    pub fn to_tensor(&self, wait: &[Event]) -> Result<(Tensor, Event)> {
        self.operand().to_tensor(wait)
    }
}

impl fmt::Debug for TensorView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorView")
            .field("origin", &self.origin())
            .field("shape", &self.shape())
            .field("owner", &self.owner.re)
            .finish()
    }
}

/// Which buffers of a tensor an operand binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Part {
    /// Real and, when present, imaginary buffers.
    Full,
    /// Only the real buffer.
    Re,
    /// Only the imaginary buffer.
    Im,
}

/// A region of a tensor as bound to a kernel.
#[derive(Clone, Copy)]
pub struct Operand<'a> {
    tensor: &'a Tensor,
    row: usize,
    col: usize,
    rows: usize,
    cols: usize,
    part: Part,
}

impl<'a> Operand<'a> {
    /// The tensor the operand lives in.
    #[must_use]
    pub const fn tensor(&self) -> &'a Tensor {
        self.tensor
    }

    /// Number of rows.
    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    #[must_use]
    pub const fn cols(&self) -> usize {
        self.cols
    }

    /// `(rows, cols)`.
    #[must_use]
    pub const fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Element type.
    #[must_use]
    pub const fn dtype(&self) -> Dtype {
        self.tensor.dtype
    }

    /// Selected buffers.
    #[must_use]
    pub const fn part(&self) -> Part {
        self.part
    }

    /// Whether the operand carries an imaginary component.
    #[must_use]
    pub fn is_complex(&self) -> bool {
        self.part == Part::Full && self.tensor.is_complex()
    }

    /// Element offset of the operand's first element.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.row * self.tensor.cols + self.col
    }

    /// Leading dimension (owner row length).
    #[must_use]
    pub const fn ld(&self) -> usize {
        self.tensor.cols
    }

    /// The same region restricted to one component.
    #[must_use]
    pub const fn with_part(mut self, part: Part) -> Self {
        self.part = part;
        self
    }

    /// Returns `true` when both operands live in the same tensor.
    #[must_use]
    pub fn same_storage(&self, other: &Operand<'_>) -> bool {
        core::ptr::eq(self.tensor, other.tensor)
    }

    /// Returns `true` when both operands address at least one common element
    /// of the same component.
    #[must_use]
    pub fn overlaps(&self, other: &Operand<'_>) -> bool {
        let parts_meet = match (self.part, other.part) {
            (Part::Re, Part::Im) | (Part::Im, Part::Re) => false,
            _ => true,
        };
        self.same_storage(other)
            && parts_meet
            && self.row < other.row + other.rows
            && other.row < self.row + self.rows
            && self.col < other.col + other.cols
            && other.col < self.col + self.cols
    }

    /// Returns `true` when both operands address exactly the same elements.
    #[must_use]
    pub fn same_region(&self, other: &Operand<'_>) -> bool {
        self.same_storage(other)
            && self.part == other.part
            && (self.row, self.col, self.rows, self.cols)
                == (other.row, other.col, other.rows, other.cols)
    }

    fn window(&self, row: usize, col: usize, rows: usize, cols: usize) -> TensorView<'a> {
        TensorView {
            owner: self.tensor,
            row: self.row + row,
            col: self.col + col,
            rows,
            cols,
        }
    }

    /// Splits an even-sized operand into `[11, 12, 21, 22]` quadrant views.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if a dimension is odd.
    pub fn quadrants(&self) -> Result<[TensorView<'a>; 4]> {
        if self.rows % 2 != 0 || self.cols % 2 != 0 {
            return Err(Error::invalid(format!(
                "cannot split {}x{} operand into quadrants",
                self.rows, self.cols
            )));
        }
        let (h, w) = (self.rows / 2, self.cols / 2);
        Ok([
            self.window(0, 0, h, w),
            self.window(0, w, h, w),
            self.window(h, 0, h, w),
            self.window(h, w, h, w),
        ])
    }

    /// Copies the region (all its components) into a new tensor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] when the device is out of memory.
    pub fn to_tensor(&self, wait: &[Event]) -> Result<(Tensor, Event)> {
        let out = if self.is_complex() {
            Tensor::complex_zeros(&self.tensor.ctx, self.rows, self.cols, self.dtype())?
        } else {
            Tensor::uninit(&self.tensor.ctx, self.rows, self.cols, self.dtype())?
        };
        let ev = ops::copy(self, &out, wait)?;
        Ok((out, ev))
    }

    fn buffer(&self) -> Result<BufferId> {
        match self.part {
            Part::Full | Part::Re => Ok(self.tensor.re),
            Part::Im => self
                .tensor
                .imag_buffer()
                .ok_or_else(|| Error::invalid("operand has no imaginary component")),
        }
    }
}

impl fmt::Debug for Operand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operand")
            .field("origin", &(self.row, self.col))
            .field("shape", &self.shape())
            .field("part", &self.part)
            .field("tensor", &self.tensor.re)
            .finish()
    }
}

/// Anything a kernel can bind: tensors, views and operands.
pub trait AsOperand {
    /// The bound region.
    fn operand(&self) -> Operand<'_>;
}

impl AsOperand for Tensor {
    fn operand(&self) -> Operand<'_> {
        Operand {
            tensor: self,
            row: 0,
            col: 0,
            rows: self.rows,
            cols: self.cols,
            part: Part::Full,
        }
    }
}

impl AsOperand for TensorView<'_> {
    fn operand(&self) -> Operand<'_> {
        self.into_operand()
    }
}

impl AsOperand for Operand<'_> {
    fn operand(&self) -> Operand<'_> {
        *self
    }
}

impl<T: AsOperand + ?Sized> AsOperand for &T {
    fn operand(&self) -> Operand<'_> {
        (**self).operand()
    }
}

fn check_len(op: &'static str, rows: usize, cols: usize, len: usize) -> Result<()> {
    if rows * cols == len {
        Ok(())
    } else {
        Err(Error::shape(op, (rows, cols), (1, len)))
    }
}

pub(crate) fn check_dtype(expected: Dtype, found: Dtype) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(Error::DtypeMismatch { expected, found })
    }
}

pub(crate) fn check_shape(op: &'static str, lhs: (usize, usize), rhs: (usize, usize)) -> Result<()> {
    if lhs == rhs {
        Ok(())
    } else {
        Err(Error::shape(op, lhs, rhs))
    }
}

/// Binds `operands` to kernel `id` and submits it on `queue`.
///
/// `params` must already carry the domain, extras and scalars; operand
/// placements are filled in here. When `complex` is set, every operand bound
/// to a paired slot is promoted first.
pub(crate) fn submit(
    id: KernelId,
    operands: &[Operand<'_>],
    params: KernelParams,
    complex: bool,
    queue: usize,
    wait: &[Event],
) -> Result<Event> {
    let first = operands
        .first()
        .ok_or_else(|| Error::invalid(format!("kernel `{id}` submitted without operands")))?;
    let ctx = &first.tensor.ctx;
    let dtype = first.dtype();
    for op in &operands[1..] {
        check_dtype(dtype, op.dtype())?;
    }
    let signature = id.signature();
    if signature.len() != operands.len() {
        return Err(Error::invalid(format!(
            "kernel `{id}` takes {} operands, got {}",
            signature.len(),
            operands.len()
        )));
    }
    if params.rows() == 0 || params.cols() == 0 {
        return ctx.barrier(wait);
    }

    let kernel = ctx.kernel(id, dtype, complex)?;
    let mut params = params;
    let mut bindings = Vec::with_capacity(id.binding_count(complex));
    for (index, (slot, op)) in signature.iter().zip(operands).enumerate() {
        params = params.operand(index, op.offset(), op.ld());
        if complex && slot.paired {
            if op.part != Part::Full {
                return Err(Error::invalid(format!(
                    "kernel `{id}` needs both components of operand {index}"
                )));
            }
            op.tensor.promote_complex()?;
            bindings.push(op.tensor.re);
            bindings.push(op.buffer_im()?);
        } else {
            bindings.push(op.buffer()?);
        }
    }

    ctx.launch(
        Launch {
            kernel,
            params,
            bindings,
            queue,
        },
        wait,
    )
}

impl Operand<'_> {
    fn buffer_im(&self) -> Result<BufferId> {
        self.with_part(Part::Im).buffer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_is_idempotent() {
        let ctx = DeviceContext::cpu().unwrap();
        let t = Tensor::from_f64(&ctx, 1, 2, Dtype::F64, &[1.0, 2.0]).unwrap();
        assert!(!t.is_complex());
        t.promote_complex().unwrap();
        let im = t.imag_buffer();
        t.write_imag_raw(bytemuck::cast_slice(&[0.5f64, -0.5]), &[])
            .unwrap()
            .wait()
            .unwrap();
        t.promote_complex().unwrap();
        assert_eq!(t.imag_buffer(), im);
        assert_eq!(
            t.to_complex_vec(&[]).unwrap(),
            vec![Complex64::new(1.0, 0.5), Complex64::new(2.0, -0.5)]
        );
    }

    #[test]
    fn oversized_tensors_are_rejected_before_allocation() {
        let ctx = DeviceContext::cpu().unwrap();
        let live = ctx.stats().live_buffers;
        let side = 1 << 16;
        assert!(matches!(
            Tensor::zeros(&ctx, side, side + 1, Dtype::F32),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            Tensor::uninit(&ctx, MAX_ELEMENTS, 2, Dtype::I8),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(ctx.stats().live_buffers, live);
    }

    #[test]
    fn views_are_bounds_checked() {
        let ctx = DeviceContext::cpu().unwrap();
        let t = Tensor::zeros(&ctx, 3, 4, Dtype::F32).unwrap();
        assert!(t.view(1, 1, 2, 3).is_ok());
        assert!(t.view(2, 0, 2, 1).is_err());
        assert!(t.quadrants().is_err());
        let v = t.view(1, 0, 2, 4).unwrap();
        let inner = v.view(1, 2, 1, 2).unwrap();
        assert_eq!(inner.origin(), (2, 2));
        assert_eq!(inner.operand().offset(), 10);
    }

    #[test]
    fn length_mismatch_is_a_shape_error() {
        let ctx = DeviceContext::cpu().unwrap();
        assert!(matches!(
            Tensor::from_slice(&ctx, 2, 2, &[1.0f32, 2.0, 3.0]),
            Err(Error::ShapeMismatch { .. })
        ));
        let t = Tensor::zeros(&ctx, 2, 2, Dtype::I32).unwrap();
        assert!(matches!(t.to_vec::<f32>(&[]), Err(Error::DtypeMismatch { .. })));
    }

    #[test]
    fn typed_round_trip_preserves_integers() {
        let ctx = DeviceContext::cpu().unwrap();
        let t = Tensor::from_slice(&ctx, 2, 2, &[1i16, -2, 300, 4]).unwrap();
        assert_eq!(t.to_vec::<i16>(&[]).unwrap(), vec![1, -2, 300, 4]);
        assert_eq!(t.hint().groups, [1, 1]);
    }
}
