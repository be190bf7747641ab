//! Kernel identities, launch parameters, and the per-context kernel cache.
//!
//! A kernel is addressed by `(KernelId, Dtype, complex)`. The cache is a flat
//! table of `KernelId::COUNT × Dtype::ALL.len() × 2` slots; a slot is filled
//! the first time its kernel is requested and never invalidated afterwards.

use core::fmt;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;
use tracing::debug;

use crate::backend::{DeviceBackend, KernelHandle};
use crate::device::dtype::{Dtype, DtypeTable};
use crate::error::CompileError;

/// Maximum number of tensor operands a kernel binds.
pub const MAX_OPERANDS: usize = 4;

/// Index of the first kernel-specific entry in [`KernelParams::dims`].
pub const EXTRA_BASE: usize = 2 + 2 * MAX_OPERANDS;

/// Number of scalar slots in [`KernelParams::scalars`].
pub const MAX_SCALARS: usize = 8;

macro_rules! kernels {
    ($($variant:ident => $name:literal),* $(,)?) => {
        /// Every device kernel the engine submits.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum KernelId {
            $(
                #[doc = concat!("The `", $name, "` kernel.")]
                $variant,
            )*
        }

        impl KernelId {
            /// Every kernel, in table order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),*];

            /// Number of distinct kernels.
            pub const COUNT: usize = Self::ALL.len();

            /// Stable kernel name, also the source file stem for compiled backends.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }
        }
    };
}

kernels! {
    Fill => "fill",
    Copy => "copy",
    Axpby => "axpby",
    Scale => "scale",
    Hadamard => "hadamard",
    Conj => "conj",
    Transpose => "transpose",
    AddRow => "add_row",
    Abs => "abs",
    Abs2 => "abs2",
    Sign => "sign",
    Sigmoid => "sigmoid",
    Tanh => "tanh",
    Relu => "relu",
    LeakyRelu => "leaky_relu",
    Softmax => "softmax",
    SigmoidGrad => "sigmoid_grad",
    TanhGrad => "tanh_grad",
    ReluGrad => "relu_grad",
    LeakyReluGrad => "leaky_relu_grad",
    SoftmaxGrad => "softmax_grad",
    FoldRows => "fold_rows",
    FoldCols => "fold_cols",
    Diagonal => "diagonal",
    Gemm => "gemm",
    GjPivot => "gj_pivot",
    GjNormalize => "gj_normalize",
    GjEliminate => "gj_eliminate",
    SgdStep => "sgd_step",
    MomentumStep => "momentum_step",
    NesterovStep => "nesterov_step",
    AdagradStep => "adagrad_step",
    RmspropStep => "rmsprop_step",
    AdadeltaStep => "adadelta_step",
    AdamStep => "adam_step",
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a kernel touches one of its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Only read.
    Read,
    /// Only written.
    Write,
    /// Read and written.
    ReadWrite,
}

impl Access {
    /// Whether the kernel writes the operand.
    #[must_use]
    pub const fn writes(self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// One operand slot of a kernel signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Access mode.
    pub access: Access,
    /// Whether complex variants bind a real *and* an imaginary buffer.
    pub paired: bool,
}

const fn pair(access: Access) -> Slot {
    Slot {
        access,
        paired: true,
    }
}

const fn real(access: Access) -> Slot {
    Slot {
        access,
        paired: false,
    }
}

const OUT: &[Slot] = &[pair(Access::Write)];
const INOUT: &[Slot] = &[pair(Access::ReadWrite)];
const IN_OUT: &[Slot] = &[pair(Access::Read), pair(Access::Write)];
const IN_ACC: &[Slot] = &[pair(Access::Read), pair(Access::ReadWrite)];
const IN_REAL_OUT: &[Slot] = &[pair(Access::Read), real(Access::Write)];
const GEMM: &[Slot] = &[pair(Access::Read), pair(Access::Read), pair(Access::ReadWrite)];
const PIVOT: &[Slot] = &[pair(Access::ReadWrite), pair(Access::ReadWrite)];
const ELIMINATE: &[Slot] = &[pair(Access::ReadWrite), pair(Access::Read)];
const STEP: &[Slot] = &[real(Access::ReadWrite), real(Access::Read)];
const STEP_ONE_STATE: &[Slot] = &[
    real(Access::ReadWrite),
    real(Access::Read),
    real(Access::ReadWrite),
];
const STEP_TWO_STATES: &[Slot] = &[
    real(Access::ReadWrite),
    real(Access::Read),
    real(Access::ReadWrite),
    real(Access::ReadWrite),
];

/// Which element types and representations a kernel supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Support {
    /// Any dtype, real or complex.
    Any,
    /// Float dtypes, real or complex.
    Float,
    /// Float dtypes, real only.
    FloatReal,
    /// Any dtype, complex only.
    ComplexOnly,
}

impl KernelId {
    /// Ordered operand slots. Bindings follow this order; a paired slot
    /// expands to `(re, im)` in complex variants.
    #[must_use]
    pub const fn signature(self) -> &'static [Slot] {
        match self {
            Self::Fill | Self::Scale | Self::Conj => OUT,
            Self::Copy | Self::Transpose | Self::Diagonal | Self::Sign => IN_OUT,
            Self::Axpby | Self::Hadamard | Self::AddRow => IN_ACC,
            Self::Abs | Self::Abs2 => IN_REAL_OUT,
            Self::Sigmoid | Self::Tanh | Self::Relu | Self::LeakyRelu | Self::Softmax => INOUT,
            Self::SigmoidGrad
            | Self::TanhGrad
            | Self::ReluGrad
            | Self::LeakyReluGrad
            | Self::SoftmaxGrad => IN_OUT,
            Self::FoldRows | Self::FoldCols => INOUT,
            Self::Gemm => GEMM,
            Self::GjPivot => PIVOT,
            Self::GjNormalize | Self::GjEliminate => ELIMINATE,
            Self::SgdStep => STEP,
            Self::MomentumStep | Self::NesterovStep | Self::AdagradStep | Self::RmspropStep => {
                STEP_ONE_STATE
            }
            Self::AdadeltaStep | Self::AdamStep => STEP_TWO_STATES,
        }
    }

    /// Variants the kernel can be built for.
    #[must_use]
    pub const fn support(self) -> Support {
        match self {
            Self::Fill
            | Self::Copy
            | Self::Axpby
            | Self::Scale
            | Self::Hadamard
            | Self::Transpose
            | Self::AddRow
            | Self::Abs
            | Self::Abs2
            | Self::Sign
            | Self::FoldRows
            | Self::FoldCols
            | Self::Diagonal
            | Self::Gemm => Support::Any,
            Self::Conj => Support::ComplexOnly,
            Self::Sigmoid
            | Self::Tanh
            | Self::SigmoidGrad
            | Self::TanhGrad
            | Self::GjPivot
            | Self::GjNormalize
            | Self::GjEliminate => Support::Float,
            Self::Relu
            | Self::LeakyRelu
            | Self::Softmax
            | Self::ReluGrad
            | Self::LeakyReluGrad
            | Self::SoftmaxGrad
            | Self::SgdStep
            | Self::MomentumStep
            | Self::NesterovStep
            | Self::AdagradStep
            | Self::RmspropStep
            | Self::AdadeltaStep
            | Self::AdamStep => Support::FloatReal,
        }
    }

    /// Checks a `(dtype, complex)` request against [`KernelId::support`].
    ///
    /// # Errors
    ///
    /// Returns the [`CompileError`] a backend must report for the combination.
    pub fn check(self, dtype: Dtype, complex: bool) -> Result<(), CompileError> {
        let support = self.support();
        let float_only = matches!(
            support,
            Support::Float | Support::FloatReal
        );
        if float_only && !dtype.is_float() {
            return Err(CompileError::UnsupportedDtype {
                kernel: self,
                dtype,
            });
        }
        match (support, complex) {
            (Support::FloatReal, true) => Err(CompileError::UnsupportedComplex { kernel: self }),
            (Support::ComplexOnly, false) => Err(CompileError::RequiresComplex { kernel: self }),
            _ => Ok(()),
        }
    }

    /// Number of buffers bound by the `complex` variant.
    #[must_use]
    pub fn binding_count(self, complex: bool) -> usize {
        self.signature()
            .iter()
            .map(|slot| if complex && slot.paired { 2 } else { 1 })
            .sum()
    }
}

/// Cache key of one compiled kernel variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelKey {
    /// Which kernel.
    pub id: KernelId,
    /// Element type the kernel is specialised for.
    pub dtype: Dtype,
    /// Whether paired operands carry an imaginary buffer.
    pub complex: bool,
}

impl KernelKey {
    const fn slot(self) -> usize {
        ((self.id as usize) * Dtype::ALL.len() + self.dtype.index()) * 2 + self.complex as usize
    }
}

impl fmt::Display for KernelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}<{}{}>",
            self.id,
            self.dtype,
            if self.complex { ",complex" } else { "" }
        )
    }
}

/// Preprocessor parameters a backend builds a kernel with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    /// Element type.
    pub dtype: Dtype,
    /// Preferred lane width for the element type.
    pub vector_width: u32,
    /// Whether the complex variant is built.
    pub complex: bool,
}

/// Launch parameters shared by every kernel.
///
/// `dims[0..2]` hold the iteration shape `(rows, cols)`, `dims[2 + 2i]` and
/// `dims[3 + 2i]` the element offset and leading dimension of operand `i`, and
/// `dims[EXTRA_BASE..]` kernel-specific integers. `scalars` carries
/// kernel-specific coefficients.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct KernelParams {
    /// Integer parameters.
    pub dims: [u32; 16],
    /// Scalar coefficients.
    pub scalars: [f64; MAX_SCALARS],
}

impl KernelParams {
    /// Parameters iterating over a `rows × cols` domain.
    #[must_use]
    pub fn new(rows: usize, cols: usize) -> Self {
        let mut params = Self::zeroed();
        params.dims[0] = to_u32(rows);
        params.dims[1] = to_u32(cols);
        params
    }

    /// Sets the placement of operand `index`.
    #[must_use]
    pub fn operand(mut self, index: usize, offset: usize, ld: usize) -> Self {
        self.dims[2 + 2 * index] = to_u32(offset);
        self.dims[3 + 2 * index] = to_u32(ld);
        self
    }

    /// Sets kernel-specific integer `index`.
    #[must_use]
    pub fn extra(mut self, index: usize, value: usize) -> Self {
        self.dims[EXTRA_BASE + index] = to_u32(value);
        self
    }

    /// Sets scalar `index`.
    #[must_use]
    pub const fn scalar(mut self, index: usize, value: f64) -> Self {
        self.scalars[index] = value;
        self
    }

    /// Iteration rows.
    #[must_use]
    pub const fn rows(&self) -> usize {
        self.dims[0] as usize
    }

    /// Iteration columns.
    #[must_use]
    pub const fn cols(&self) -> usize {
        self.dims[1] as usize
    }

    /// Offset and leading dimension of operand `index`.
    #[must_use]
    pub const fn placement(&self, index: usize) -> (usize, usize) {
        (
            self.dims[2 + 2 * index] as usize,
            self.dims[3 + 2 * index] as usize,
        )
    }

    /// Kernel-specific integer `index`.
    #[must_use]
    pub const fn extra_at(&self, index: usize) -> usize {
        self.dims[EXTRA_BASE + index] as usize
    }
}

// Tensor extents are capped at `MAX_ELEMENTS`, so offsets and strides fit.
#[allow(clippy::cast_possible_truncation)]
fn to_u32(v: usize) -> u32 {
    debug_assert!(u32::try_from(v).is_ok(), "kernel parameter {v} exceeds u32");
    v as u32
}

type Entry = Option<Result<Arc<KernelHandle>, CompileError>>;

/// Lazily populated table of compiled kernels owned by one context.
pub struct KernelCache {
    table: Mutex<Vec<Entry>>,
}

impl KernelCache {
    /// Creates an empty table with one slot per `(kernel, dtype, complex)`.
    #[must_use]
    pub fn new() -> Self {
        let slots = KernelId::COUNT * Dtype::ALL.len() * 2;
        Self {
            table: Mutex::new(vec![None; slots]),
        }
    }

    /// Returns the compiled kernel for `key`, building it on first use.
    ///
    /// # Errors
    ///
    /// Returns the [`CompileError`] of the first build attempt; failed
    /// variants are not rebuilt.
    pub fn get(
        &self,
        backend: &dyn DeviceBackend,
        dtypes: &DtypeTable,
        key: KernelKey,
    ) -> Result<Arc<KernelHandle>, CompileError> {
        let mut table = self.table.lock();
        let slot = &mut table[key.slot()];
        if let Some(entry) = slot {
            return entry.clone();
        }

        let options = BuildOptions {
            dtype: key.dtype,
            vector_width: dtypes.get(key.dtype).vector_width,
            complex: key.complex,
        };
        let built = key
            .id
            .check(key.dtype, key.complex)
            .and_then(|()| backend.build(key, &options))
            .map(Arc::new);
        match &built {
            Ok(_) => debug!(kernel = %key, backend = backend.name(), "compiled kernel"),
            Err(err) => debug!(kernel = %key, error = %err, "kernel build failed"),
        }
        *slot = Some(built.clone());
        built
    }

    /// Number of populated slots, successful or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().iter().filter(|e| e.is_some()).count()
    }

    /// Returns `true` when no kernel has been requested yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every cached kernel.
    pub(crate) fn teardown(&self) {
        self.table.lock().iter_mut().for_each(|e| *e = None);
    }
}

impl Default for KernelCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KernelCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelCache")
            .field("compiled", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_are_static_and_consistent() {
        let sigs: Vec<&'static [Slot]> = KernelId::ALL.iter().map(|id| id.signature()).collect();
        assert!(sigs.iter().all(|sig| !sig.is_empty()));
        // kernels with no paired slot have no complex variant
        for (id, sig) in KernelId::ALL.iter().zip(&sigs) {
            if sig.iter().all(|slot| !slot.paired) {
                assert_eq!(id.support(), Support::FloatReal, "{id:?}");
            }
        }
        assert_eq!(KernelId::Gemm.signature().len(), 3);
        assert_eq!(KernelId::AdamStep.signature().len(), 4);
        assert_eq!(KernelId::Abs.signature()[1], Slot { access: Access::Write, paired: false });
    }

    #[test]
    fn slots_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for &id in KernelId::ALL {
            for dtype in Dtype::ALL {
                for complex in [false, true] {
                    assert!(seen.insert(KernelKey { id, dtype, complex }.slot()));
                }
            }
        }
        assert_eq!(seen.len(), KernelId::COUNT * Dtype::ALL.len() * 2);
    }

    #[test]
    fn support_rules() {
        assert!(KernelId::Gemm.check(Dtype::I32, true).is_ok());
        assert!(matches!(
            KernelId::Sigmoid.check(Dtype::I32, false),
            Err(CompileError::UnsupportedDtype { .. })
        ));
        assert!(matches!(
            KernelId::Relu.check(Dtype::F32, true),
            Err(CompileError::UnsupportedComplex { .. })
        ));
        assert!(matches!(
            KernelId::Conj.check(Dtype::F64, false),
            Err(CompileError::RequiresComplex { .. })
        ));
    }

    #[test]
    fn complex_variants_double_paired_bindings() {
        assert_eq!(KernelId::Gemm.binding_count(false), 3);
        assert_eq!(KernelId::Gemm.binding_count(true), 6);
        assert_eq!(KernelId::Abs2.binding_count(true), 3);
        assert_eq!(KernelId::AdamStep.binding_count(false), 4);
    }

    #[test]
    fn params_layout() {
        let p = KernelParams::new(3, 4).operand(1, 5, 8).extra(0, 7).scalar(2, 0.5);
        assert_eq!((p.rows(), p.cols()), (3, 4));
        assert_eq!(p.placement(1), (5, 8));
        assert_eq!(p.extra_at(0), 7);
        assert_eq!(p.scalars[2], 0.5);
    }
}
