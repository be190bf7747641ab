//! Error taxonomy shared by the device core and the learning engine.
//!
//! Every fallible operation in the crate returns [`Result`]. Shape problems are
//! always detected on the host before anything is submitted, so an
//! [`Error::ShapeMismatch`] never leaves work queued on the device.

use thiserror::Error;

use crate::device::dtype::Dtype;
use crate::device::kernel::KernelId;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors surfaced by tensor primitives, layers, and optimizers.
#[derive(Debug, Error)]
pub enum Error {
    /// Operand dimensions are incompatible for the requested operation.
    #[error("shape mismatch in `{op}`: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        /// The operation that rejected its operands.
        op: &'static str,
        /// Shape of the left (or first) operand.
        lhs: (usize, usize),
        /// Shape of the right (or expected) operand.
        rhs: (usize, usize),
    },
    /// The device could not provide the requested memory.
    #[error("device allocation of {bytes} bytes failed")]
    AllocationFailure {
        /// Size of the allocation that failed.
        bytes: usize,
    },
    /// A kernel could not be built for the requested variant.
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// The backend reported a failure while submitting or executing work.
    #[error("device execution failed: {0}")]
    DeviceExecution(String),
    /// Gauss-Jordan elimination found no usable pivot.
    #[error("matrix is singular")]
    Singular,
    /// Operands carry different element types.
    #[error("dtype mismatch: expected {expected}, found {found}")]
    DtypeMismatch {
        /// Element type required by the operation.
        expected: Dtype,
        /// Element type that was supplied.
        found: Dtype,
    },
    /// Arguments are well-shaped but otherwise unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    pub(crate) fn shape(op: &'static str, lhs: (usize, usize), rhs: (usize, usize)) -> Self {
        Self::ShapeMismatch { op, lhs, rhs }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

/// Kernel build failures.
///
/// These are fatal for the `(kernel, dtype, complex)` combination that produced
/// them: the kernel cache stores the failure and returns it again on every
/// later lookup instead of rebuilding.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    /// The kernel has no variant for this element type.
    #[error("kernel `{kernel}` has no {dtype} variant")]
    UnsupportedDtype {
        /// Kernel that was requested.
        kernel: KernelId,
        /// Element type that is not supported.
        dtype: Dtype,
    },
    /// The kernel only operates on real data.
    #[error("kernel `{kernel}` has no complex variant")]
    UnsupportedComplex {
        /// Kernel that was requested.
        kernel: KernelId,
    },
    /// The kernel only operates on complex data.
    #[error("kernel `{kernel}` has no real variant")]
    RequiresComplex {
        /// Kernel that was requested.
        kernel: KernelId,
    },
    /// The backend compiler rejected the kernel source.
    #[error("failed to build kernel `{kernel}`: {message}")]
    Build {
        /// Kernel that was requested.
        kernel: KernelId,
        /// Diagnostic produced by the backend compiler.
        message: String,
    },
}

/// Why a buffer release did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReleaseError {
    /// The buffer is still referenced by an in-flight operation. Retry later.
    #[error("buffer is still in use by the device")]
    Busy,
    /// The backend does not know this buffer (already released or foreign).
    #[error("unknown buffer")]
    Unknown,
}

impl ReleaseError {
    /// Returns `true` when retrying the release may succeed.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_errors_convert_into_crate_errors() {
        let err: Error = CompileError::UnsupportedComplex {
            kernel: KernelId::Relu,
        }
        .into();
        assert!(matches!(err, Error::Compile(_)));
        assert_eq!(err.to_string(), "kernel `relu` has no complex variant");
    }

    #[test]
    fn only_busy_releases_are_transient() {
        assert!(ReleaseError::Busy.is_transient());
        assert!(!ReleaseError::Unknown.is_transient());
    }
}
