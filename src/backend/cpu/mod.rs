//! Host backend.
//!
//! Buffers live in host memory as little-endian element bytes. Each logical
//! command queue is a worker thread fed through a `crossbeam-channel`; a job
//! waits for its wait-list, runs, unpins its buffers and then signals its
//! event, so submissions on one queue execute in order while different queues
//! run concurrently. Inside a kernel, `rayon` parallelises over the domain.
//!
//! A buffer bound to a queued or running job is *pinned*; releasing it fails
//! with [`ReleaseError::Busy`] until the job finished, which is exactly the
//! transient failure a GPU driver reports for memory still in use.

mod kernels;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use super::{BackendKind, BackendStats, BufferId, DeviceBackend, DeviceLimits, KernelHandle, Launch};
use crate::device::event::Event;
use crate::device::kernel::{BuildOptions, KernelKey};
use crate::error::{CompileError, Error, ReleaseError, Result};

use self::kernels::HostKernel;

pub(crate) struct HostBuffer {
    bytes: RwLock<Vec<u8>>,
    in_flight: AtomicUsize,
}

impl HostBuffer {
    fn pin(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    fn unpin(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    fn is_pinned(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) > 0
    }
}

type Work = Box<dyn FnOnce() -> core::result::Result<(), String> + Send>;

struct Job {
    work: Work,
    wait: Vec<Event>,
    done: Event,
    pins: Vec<Arc<HostBuffer>>,
}

impl Job {
    fn execute(self) {
        let Self {
            work,
            wait,
            done,
            pins,
        } = self;

        let outcome = match Event::wait_all(&wait) {
            Ok(()) => work(),
            Err(err) => Err(format!("dependency failed: {err}")),
        };
        for buffer in &pins {
            buffer.unpin();
        }
        drop(pins);

        match outcome {
            Ok(()) => done.signal(),
            Err(msg) => {
                warn!(job = done.label(), error = %msg, "host job failed");
                done.fail(msg);
            }
        }
    }
}

enum Command {
    Run(Job),
    Stop,
}

fn run_queue(index: usize, commands: &Receiver<Command>) {
    trace!(queue = index, "host queue started");
    while let Ok(command) = commands.recv() {
        match command {
            Command::Run(job) => job.execute(),
            Command::Stop => break,
        }
    }
    trace!(queue = index, "host queue stopped");
}

/// Host implementation of [`DeviceBackend`].
pub struct CpuBackend {
    buffers: RwLock<HashMap<BufferId, Arc<HostBuffer>>>,
    next_id: AtomicU64,
    allocated: AtomicUsize,
    memory_limit: Option<usize>,
    queues: Vec<Sender<Command>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CpuBackend {
    /// Starts a backend with `queues` worker queues (at least one).
    ///
    /// `memory_limit` caps the bytes that may be live at once, which lets
    /// callers exercise out-of-memory paths.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceExecution`] if a worker thread cannot be spawned.
    pub fn new(queues: usize, memory_limit: Option<usize>) -> Result<Self> {
        let count = queues.max(1);
        let mut senders = Vec::with_capacity(count);
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let (tx, rx) = unbounded();
            let worker = thread::Builder::new()
                .name(format!("wmatrix-cpu-{index}"))
                .spawn(move || run_queue(index, &rx))
                .map_err(|e| Error::DeviceExecution(format!("failed to spawn host queue: {e}")))?;
            senders.push(tx);
            workers.push(worker);
        }
        debug!(queues = count, ?memory_limit, "host backend started");

        Ok(Self {
            buffers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            allocated: AtomicUsize::new(0),
            memory_limit,
            queues: senders,
            workers: Mutex::new(workers),
        })
    }

    fn buffer(&self, id: BufferId) -> Result<Arc<HostBuffer>> {
        self.buffers
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::invalid(format!("unknown buffer {id}")))
    }

    fn submit(
        &self,
        queue: usize,
        label: &'static str,
        work: Work,
        wait: &[Event],
        pins: Vec<Arc<HostBuffer>>,
    ) -> Result<Event> {
        for buffer in &pins {
            buffer.pin();
        }
        let done = Event::pending(label, None);
        let job = Job {
            work,
            wait: wait.to_vec(),
            done: done.clone(),
            pins,
        };
        let index = queue % self.queues.len();
        trace!(queue = index, job = label, deps = wait.len(), "host submit");
        self.queues[index].send(Command::Run(job)).map_err(|err| {
            if let Command::Run(job) = err.into_inner() {
                job.pins.iter().for_each(|b| b.unpin());
            }
            Error::DeviceExecution("host queue is closed".into())
        })?;
        Ok(done)
    }

    fn reserve(&self, bytes: usize) -> Result<()> {
        let limit = self.memory_limit.unwrap_or(usize::MAX);
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= limit)
            })
            .map(drop)
            .map_err(|_| Error::AllocationFailure { bytes })
    }
}

impl DeviceBackend for CpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn name(&self) -> &str {
        "host"
    }

    fn limits(&self) -> DeviceLimits {
        DeviceLimits {
            max_buffer_bytes: self.memory_limit.map_or(u64::MAX, |l| l as u64),
            workgroup: [8, 8],
            max_groups: u32::MAX,
            vector_bytes: 16,
            queues: self.queues.len(),
        }
    }

    fn allocate(&self, bytes: usize, _zeroed: bool) -> Result<BufferId> {
        self.reserve(bytes)?;
        let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let buffer = Arc::new(HostBuffer {
            bytes: RwLock::new(vec![0; bytes]),
            in_flight: AtomicUsize::new(0),
        });
        self.buffers.write().insert(id, buffer);
        trace!(%id, bytes, "host allocate");
        Ok(id)
    }

    fn release(&self, id: BufferId) -> Result<(), ReleaseError> {
        let mut buffers = self.buffers.write();
        let buffer = buffers.get(&id).ok_or(ReleaseError::Unknown)?;
        if buffer.is_pinned() {
            return Err(ReleaseError::Busy);
        }
        let bytes = buffer.bytes.read().len();
        buffers.remove(&id);
        self.allocated.fetch_sub(bytes, Ordering::AcqRel);
        trace!(%id, bytes, "host release");
        Ok(())
    }

    fn write(&self, id: BufferId, offset: usize, data: &[u8], wait: &[Event]) -> Result<Event> {
        let buffer = self.buffer(id)?;
        let len = buffer.bytes.read().len();
        if offset.checked_add(data.len()).is_none_or(|end| end > len) {
            return Err(Error::invalid(format!(
                "write of {} bytes at {offset} exceeds {id} ({len} bytes)",
                data.len()
            )));
        }
        let data = data.to_vec();
        let target = Arc::clone(&buffer);
        let work: Work = Box::new(move || {
            target.bytes.write()[offset..offset + data.len()].copy_from_slice(&data);
            Ok(())
        });
        self.submit(0, "write", work, wait, vec![buffer])
    }

    fn read(&self, id: BufferId, offset: usize, out: &mut [u8], wait: &[Event]) -> Result<()> {
        Event::wait_all(wait)?;
        let buffer = self.buffer(id)?;
        let bytes = buffer.bytes.read();
        let src = offset
            .checked_add(out.len())
            .and_then(|end| bytes.get(offset..end))
            .ok_or_else(|| {
                Error::invalid(format!(
                    "read of {} bytes at {offset} exceeds {id} ({} bytes)",
                    out.len(),
                    bytes.len()
                ))
            })?;
        out.copy_from_slice(src);
        Ok(())
    }

    fn build(&self, key: KernelKey, _options: &BuildOptions) -> Result<KernelHandle, CompileError> {
        key.id.check(key.dtype, key.complex)?;
        Ok(KernelHandle::new(key, HostKernel { key }))
    }

    fn enqueue(&self, launch: Launch, wait: &[Event]) -> Result<Event> {
        let Launch {
            kernel,
            params,
            bindings,
            queue,
        } = launch;
        let key = kernel.key();
        let host = *kernel.downcast_ref::<HostKernel>().ok_or_else(|| {
            Error::DeviceExecution(format!("kernel `{key}` was not built by the host backend"))
        })?;
        let expected = key.id.binding_count(key.complex);
        if bindings.len() != expected {
            return Err(Error::invalid(format!(
                "kernel `{key}` binds {expected} buffers, got {}",
                bindings.len()
            )));
        }
        let buffers = bindings
            .iter()
            .map(|&id| self.buffer(id))
            .collect::<Result<Vec<_>>>()?;

        let bound = buffers.clone();
        let work: Work = Box::new(move || host.run(&params, &bound));
        self.submit(queue, key.id.name(), work, wait, buffers)
    }

    fn marker(&self, wait: &[Event]) -> Result<Event> {
        if wait.iter().all(Event::is_complete) {
            return Ok(Event::complete());
        }
        self.submit(0, "marker", Box::new(|| Ok(())), wait, Vec::new())
    }

    fn finish(&self) -> Result<()> {
        let events = (0..self.queues.len())
            .map(|q| self.submit(q, "finish", Box::new(|| Ok(())), &[], Vec::new()))
            .collect::<Result<Vec<_>>>()?;
        Event::wait_all(&events)
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            live_buffers: self.buffers.read().len(),
            allocated_bytes: self.allocated.load(Ordering::Acquire),
        }
    }
}

impl Drop for CpuBackend {
    fn drop(&mut self) {
        for queue in &self.queues {
            let _ = queue.send(Command::Stop);
        }
        for worker in self.workers.get_mut().drain(..) {
            if worker.join().is_err() {
                warn!("host queue worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dtype::Dtype;
    use crate::device::kernel::{KernelId, KernelParams};

    fn launch(backend: &CpuBackend, id: KernelId, params: KernelParams, bindings: Vec<BufferId>) -> Launch {
        let key = KernelKey {
            id,
            dtype: Dtype::F64,
            complex: false,
        };
        let options = BuildOptions {
            dtype: Dtype::F64,
            vector_width: 2,
            complex: false,
        };
        Launch {
            kernel: Arc::new(backend.build(key, &options).unwrap()),
            params,
            bindings,
            queue: 1,
        }
    }

    fn f64_bytes(values: &[f64]) -> Vec<u8> {
        bytemuck::cast_slice(values).to_vec()
    }

    #[test]
    fn pinned_buffers_refuse_release() {
        let backend = CpuBackend::new(1, None).unwrap();
        let buf = backend.allocate(64, true).unwrap();
        let gate = Event::pending("gate", None);
        let ev = backend.write(buf, 0, &[1; 8], &[gate.clone()]).unwrap();
        assert_eq!(backend.release(buf), Err(ReleaseError::Busy));
        gate.signal();
        ev.wait().unwrap();
        assert_eq!(backend.release(buf), Ok(()));
        assert_eq!(backend.release(buf), Err(ReleaseError::Unknown));
        assert_eq!(backend.stats(), BackendStats::default());
    }

    #[test]
    fn memory_limit_reports_allocation_failure() {
        let backend = CpuBackend::new(1, Some(100)).unwrap();
        let a = backend.allocate(80, true).unwrap();
        assert!(matches!(
            backend.allocate(40, true),
            Err(Error::AllocationFailure { bytes: 40 })
        ));
        backend.release(a).unwrap();
        assert!(backend.allocate(40, true).is_ok());
    }

    #[test]
    fn kernels_wait_for_their_dependencies_across_queues() {
        let backend = CpuBackend::new(2, None).unwrap();
        let x = backend.allocate(32, true).unwrap();
        let y = backend.allocate(32, true).unwrap();
        let written = backend.write(x, 0, &f64_bytes(&[1.0, 2.0, 3.0, 4.0]), &[]).unwrap();

        let params = KernelParams::new(2, 2)
            .operand(0, 0, 2)
            .operand(1, 0, 2)
            .scalar(0, 2.0)
            .scalar(2, 0.0);
        let done = backend
            .enqueue(launch(&backend, KernelId::Axpby, params, vec![x, y]), &[written])
            .unwrap();

        let mut out = [0u8; 32];
        backend.read(y, 0, &mut out, &[done]).unwrap();
        let values: Vec<f64> = out
            .chunks_exact(8)
            .map(bytemuck::pod_read_unaligned::<f64>)
            .collect();
        assert_eq!(values, vec![2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn failed_dependencies_propagate() {
        let backend = CpuBackend::new(1, None).unwrap();
        let buf = backend.allocate(8, true).unwrap();
        let gate = Event::pending("gate", None);
        gate.fail("lost");
        let ev = backend.write(buf, 0, &[0; 8], &[gate]).unwrap();
        assert!(ev.wait().is_err());
        backend.finish().unwrap();
        assert!(backend.release(buf).is_ok());
    }
}
