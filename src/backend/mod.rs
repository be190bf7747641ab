//! Device backend contract.
//!
//! This module defines what a compute device must provide so that tensors,
//! layers and optimizers can run on it: buffers, kernel handles, an
//! asynchronous queue that accepts wait-lists, and completion handles.
//!
//! # Supported Backends
//!
//! - `Cpu`: host backend executing kernels on worker threads (default).
//! - `Wgpu`: GPU backend compiling WGSL compute shaders (feature `wgpu`).
//!
//! Backends never decide *what* to run. The tensor layer builds a [`Launch`]
//! for a kernel obtained from the context's kernel cache and the backend
//! only schedules it after every event in the wait-list completed.

use core::any::Any;
use core::fmt;
use core::str::FromStr;
use std::sync::Arc;

use crate::device::event::Event;
use crate::device::kernel::{BuildOptions, KernelKey, KernelParams};
use crate::error::{CompileError, Error, ReleaseError, Result};

pub mod cpu;
#[cfg(feature = "wgpu")]
pub mod wgpu;

/// Enumeration of the available backend implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    /// Host backend (default).
    #[default]
    Cpu,
    /// WebGPU backend using `wgpu`.
    Wgpu,
}

impl BackendKind {
    /// Lowercase name as accepted by [`FromStr`].
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Wgpu => "wgpu",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" | "host" => Ok(Self::Cpu),
            "wgpu" | "gpu" | "webgpu" => Ok(Self::Wgpu),
            other => Err(Error::invalid(format!("unknown backend `{other}`"))),
        }
    }
}

/// Opaque handle to one device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) u64);

impl BufferId {
    /// Raw numeric id, unique within one backend.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Device limits used to size dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Largest single allocation in bytes.
    pub max_buffer_bytes: u64,
    /// Work-group extent `(x, y)` kernels are written for.
    pub workgroup: [u32; 2],
    /// Largest number of work-groups per dispatch dimension.
    pub max_groups: u32,
    /// Preferred vector width in bytes.
    pub vector_bytes: u32,
    /// Number of independent command queues.
    pub queues: usize,
}

/// Allocation counters reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Buffers allocated and not yet released.
    pub live_buffers: usize,
    /// Bytes held by live buffers.
    pub allocated_bytes: usize,
}

/// A compiled kernel, as returned by [`DeviceBackend::build`].
///
/// The payload is backend specific; backends downcast it when the handle
/// comes back to them in a [`Launch`].
pub struct KernelHandle {
    key: KernelKey,
    inner: Arc<dyn Any + Send + Sync>,
}

impl KernelHandle {
    /// Wraps a backend-specific compiled kernel.
    pub fn new(key: KernelKey, inner: impl Any + Send + Sync) -> Self {
        Self {
            key,
            inner: Arc::new(inner),
        }
    }

    /// The variant this handle was built for.
    #[must_use]
    pub const fn key(&self) -> KernelKey {
        self.key
    }

    /// Borrows the backend payload as `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref()
    }
}

impl fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelHandle")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// One kernel submission.
#[derive(Debug, Clone)]
pub struct Launch {
    /// Kernel to run.
    pub kernel: Arc<KernelHandle>,
    /// Iteration domain, operand placement and coefficients.
    pub params: KernelParams,
    /// Buffers in binding order (see [`KernelId::signature`](crate::device::kernel::KernelId::signature)).
    pub bindings: Vec<BufferId>,
    /// Queue index; taken modulo the number of queues.
    pub queue: usize,
}

/// Contract every compute device implements.
///
/// All submission methods return immediately with an [`Event`]; work starts
/// only after every event of its wait-list has completed. Submissions on the
/// same queue execute in order.
pub trait DeviceBackend: Send + Sync {
    /// Which implementation this is.
    fn kind(&self) -> BackendKind;

    /// Human readable device name.
    fn name(&self) -> &str;

    /// Limits of the device.
    fn limits(&self) -> DeviceLimits;

    /// Allocates `bytes` of device memory, zero-filled when `zeroed` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] when the device is out of memory.
    fn allocate(&self, bytes: usize, zeroed: bool) -> Result<BufferId>;

    /// Releases a buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::Busy`] while in-flight work still uses the
    /// buffer and [`ReleaseError::Unknown`] for ids the backend does not own.
    fn release(&self, buffer: BufferId) -> Result<(), ReleaseError>;

    /// Copies host bytes into `buffer` at byte `offset` once `wait` completed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for out-of-range copies.
    fn write(&self, buffer: BufferId, offset: usize, data: &[u8], wait: &[Event]) -> Result<Event>;

    /// Blocks until `wait` completed, then copies bytes out of `buffer`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceExecution`] if a dependency failed.
    fn read(&self, buffer: BufferId, offset: usize, out: &mut [u8], wait: &[Event]) -> Result<()>;

    /// Compiles one kernel variant.
    ///
    /// # Errors
    ///
    /// Returns a [`CompileError`] when the variant cannot be built.
    fn build(&self, key: KernelKey, options: &BuildOptions) -> Result<KernelHandle, CompileError>;

    /// Schedules a kernel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceExecution`] when the submission is rejected.
    fn enqueue(&self, launch: Launch, wait: &[Event]) -> Result<Event>;

    /// An event completing once every event in `wait` completed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceExecution`] when the submission is rejected.
    fn marker(&self, wait: &[Event]) -> Result<Event>;

    /// Blocks until all submitted work finished.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceExecution`] if the device was lost.
    fn finish(&self) -> Result<()>;

    /// Current allocation counters.
    fn stats(&self) -> BackendStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses_aliases() {
        assert_eq!("CPU".parse::<BackendKind>().unwrap(), BackendKind::Cpu);
        assert_eq!(" webgpu ".parse::<BackendKind>().unwrap(), BackendKind::Wgpu);
        assert!("cuda".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::default().to_string(), "cpu");
    }
}
