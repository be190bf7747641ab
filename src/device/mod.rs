//! Compute-context lifecycle.
//!
//! A [`DeviceContext`] is created once per device. It owns the backend queue,
//! the [`KernelCache`], the dtype metadata table and the [`GarbageWorker`]
//! that retries busy releases; every tensor keeps the context alive through an
//! `Arc`.

pub mod dtype;
pub mod event;
pub mod gc;
pub mod kernel;

use core::fmt;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::backend::cpu::CpuBackend;
use crate::backend::{BackendKind, BackendStats, BufferId, DeviceBackend, DeviceLimits, KernelHandle, Launch};
use crate::config::ContextConfig;
use crate::error::{Error, ReleaseError, Result};

use self::dtype::{Dtype, DtypeInfo, DtypeTable};
use self::event::Event;
use self::gc::{GarbageWorker, GcStats, Reclaim, RetryPolicy};
use self::kernel::{KernelCache, KernelId, KernelKey};

/// The device a context is built on, as supplied by device enumeration.
#[derive(Debug)]
pub enum DeviceHandle {
    /// The host, with the given number of command queues.
    Cpu {
        /// Number of independent queues.
        queues: usize,
    },
    /// A WebGPU adapter.
    #[cfg(feature = "wgpu")]
    Wgpu(::wgpu::Adapter),
}

/// A buffer whose release must be retried.
pub(crate) struct PendingRelease {
    backend: Arc<dyn DeviceBackend>,
    buffer: BufferId,
}

impl Reclaim for PendingRelease {
    fn reclaim(&mut self) -> Result<(), ReleaseError> {
        self.backend.release(self.buffer)
    }
}

/// Owner of a backend and the per-device state shared by all tensors.
pub struct DeviceContext {
    backend: Arc<dyn DeviceBackend>,
    kernels: KernelCache,
    dtypes: DtypeTable,
    gc: GarbageWorker<PendingRelease>,
    config: ContextConfig,
}

impl DeviceContext {
    /// Builds a context for `device`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceExecution`] if the backend cannot be started.
    pub fn new(device: DeviceHandle, config: ContextConfig) -> Result<Arc<Self>> {
        let backend: Arc<dyn DeviceBackend> = match device {
            DeviceHandle::Cpu { queues } => Arc::new(CpuBackend::new(queues, config.memory_limit)?),
            #[cfg(feature = "wgpu")]
            DeviceHandle::Wgpu(adapter) => {
                Arc::new(crate::backend::wgpu::WgpuBackend::new(&adapter)?)
            }
        };
        Self::with_backend(backend, config)
    }

    /// Builds a context on the backend named by `config.backend`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the backend is not compiled in
    /// and [`Error::DeviceExecution`] when no device is available.
    pub fn from_config(config: ContextConfig) -> Result<Arc<Self>> {
        let device = match config.backend {
            BackendKind::Cpu => DeviceHandle::Cpu {
                queues: config.queues,
            },
            #[cfg(feature = "wgpu")]
            BackendKind::Wgpu => DeviceHandle::Wgpu(crate::backend::wgpu::default_adapter()?),
            #[cfg(not(feature = "wgpu"))]
            BackendKind::Wgpu => {
                return Err(Error::invalid(
                    "the `wgpu` backend requires the `wgpu` cargo feature",
                ));
            }
        };
        Self::new(device, config)
    }

    /// A host context with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceExecution`] if the host queues cannot be started.
    pub fn cpu() -> Result<Arc<Self>> {
        Self::from_config(ContextConfig::default())
    }

    /// Wraps an already constructed backend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceExecution`] if the release worker cannot be started.
    pub fn with_backend(backend: Arc<dyn DeviceBackend>, config: ContextConfig) -> Result<Arc<Self>> {
        let limits = backend.limits();
        let gc = GarbageWorker::spawn(RetryPolicy {
            backoff: config.release_backoff,
            max_retries: config.max_release_retries,
        })?;
        debug!(
            backend = %backend.kind(),
            device = backend.name(),
            queues = limits.queues,
            "device context created"
        );
        Ok(Arc::new(Self {
            kernels: KernelCache::new(),
            dtypes: DtypeTable::new(limits.vector_bytes),
            gc,
            backend,
            config,
        }))
    }

    /// The backend this context submits to.
    #[must_use]
    pub fn backend(&self) -> &dyn DeviceBackend {
        &*self.backend
    }

    /// Settings the context was created with.
    #[must_use]
    pub const fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Device limits.
    #[must_use]
    pub fn limits(&self) -> DeviceLimits {
        self.backend.limits()
    }

    /// Number of independent queues.
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.backend.limits().queues.max(1)
    }

    /// Metadata of `dtype` on this device.
    #[must_use]
    pub const fn dtype_info(&self, dtype: Dtype) -> &DtypeInfo {
        self.dtypes.get(dtype)
    }

    /// The kernel cache.
    #[must_use]
    pub const fn kernels(&self) -> &KernelCache {
        &self.kernels
    }

    /// Looks up (compiling on first use) a kernel variant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compile`] when the variant cannot be built.
    pub fn kernel(&self, id: KernelId, dtype: Dtype, complex: bool) -> Result<Arc<KernelHandle>> {
        let key = KernelKey { id, dtype, complex };
        Ok(self.kernels.get(&*self.backend, &self.dtypes, key)?)
    }

    /// Submits a kernel launch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceExecution`] when the backend rejects it.
    pub fn launch(&self, launch: Launch, wait: &[Event]) -> Result<Event> {
        trace!(kernel = %launch.kernel.key(), queue = launch.queue, "launch");
        self.backend.enqueue(launch, wait)
    }

    /// Allocates device memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] when the device is out of memory.
    pub fn allocate(&self, bytes: usize, zeroed: bool) -> Result<BufferId> {
        self.backend.allocate(bytes, zeroed)
    }

    /// Releases a buffer, deferring to the release worker while it is busy.
    pub fn release(&self, buffer: BufferId) {
        match self.backend.release(buffer) {
            Ok(()) => {}
            Err(ReleaseError::Busy) => {
                trace!(%buffer, "release deferred");
                self.gc.push(PendingRelease {
                    backend: Arc::clone(&self.backend),
                    buffer,
                });
            }
            Err(err) => warn!(%buffer, error = %err, "release failed"),
        }
    }

    /// An event that completes once all of `wait` completed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceExecution`] when the backend rejects it.
    pub fn barrier(&self, wait: &[Event]) -> Result<Event> {
        self.backend.marker(wait)
    }

    /// Blocks until all submitted work finished.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceExecution`] if the device failed.
    pub fn finish(&self) -> Result<()> {
        self.backend.finish()
    }

    /// Releases still waiting on the release worker.
    #[must_use]
    pub fn pending_releases(&self) -> usize {
        self.gc.len()
    }

    /// Blocks until the release worker has nothing left to do.
    pub fn wait_releases(&self) {
        self.gc.wait_idle();
    }

    /// Release worker counters.
    #[must_use]
    pub fn gc_stats(&self) -> GcStats {
        self.gc.stats()
    }

    /// Backend allocation counters.
    #[must_use]
    pub fn stats(&self) -> BackendStats {
        self.backend.stats()
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("backend", &self.backend.kind())
            .field("device", &self.backend.name())
            .field("kernels", &self.kernels)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if let Err(err) = self.backend.finish() {
            warn!(error = %err, "device did not finish cleanly");
        }
        self.gc.shutdown();
        self.kernels.teardown();
        debug!("device context destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernels_are_compiled_once_and_failures_cached() {
        let ctx = DeviceContext::cpu().unwrap();
        let a = ctx.kernel(KernelId::Gemm, Dtype::F32, false).unwrap();
        let b = ctx.kernel(KernelId::Gemm, Dtype::F32, false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        assert!(matches!(
            ctx.kernel(KernelId::Relu, Dtype::F32, true),
            Err(Error::Compile(_))
        ));
        assert!(ctx.kernel(KernelId::Relu, Dtype::F32, true).is_err());
        assert_eq!(ctx.kernels().len(), 2);
    }

    #[test]
    fn wgpu_without_feature_is_rejected() {
        let cfg = ContextConfig::default().with_backend(BackendKind::Wgpu);
        if cfg!(not(feature = "wgpu")) {
            assert!(matches!(
                DeviceContext::from_config(cfg),
                Err(Error::InvalidArgument(_))
            ));
        }
    }
}
