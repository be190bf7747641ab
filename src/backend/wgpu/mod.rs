//! WebGPU backend.
//!
//! Kernels are WGSL compute shaders assembled per `(kernel, complex)` variant
//! and compiled into one pipeline each. A device has a single queue that
//! executes submissions in order, so wait-lists only need checking for failed
//! dependencies; ordering follows from submission order.
//!
//! Completion is reported through `Queue::on_submitted_work_done`, whose
//! callbacks only fire while the device is polled. Every event therefore
//! carries a pump that polls the device while a caller blocks on it.
//!
//! Only `f32` kernels are built; other dtypes report
//! [`CompileError::UnsupportedDtype`].

mod source;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use wgpu::util::DeviceExt;

use super::{BackendKind, BackendStats, BufferId, DeviceBackend, DeviceLimits, KernelHandle, Launch};
use crate::device::dtype::Dtype;
use crate::device::event::{Event, EventStatus, Pump};
use crate::device::kernel::{BuildOptions, KernelKey, KernelParams};
use crate::error::{CompileError, Error, ReleaseError, Result};

const WORKGROUP: [u32; 2] = [8, 8];

/// Uniform block matching `Params` in the WGSL prelude.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct GpuParams {
    dims: [u32; 16],
    scalars: [f32; 8],
}

impl From<&KernelParams> for GpuParams {
    #[allow(clippy::cast_possible_truncation)]
    fn from(p: &KernelParams) -> Self {
        Self {
            dims: p.dims,
            scalars: p.scalars.map(|s| s as f32),
        }
    }
}

struct WgpuKernel {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

struct Allocation {
    buffer: wgpu::Buffer,
    bytes: usize,
}

/// Requests the default adapter of the default instance.
///
/// # Errors
///
/// Returns [`Error::DeviceExecution`] when no adapter is available.
pub fn default_adapter() -> Result<wgpu::Adapter> {
    let instance = wgpu::Instance::default();
    pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
        .map_err(|e| Error::DeviceExecution(format!("no wgpu adapter: {e}")))
}

/// A `wgpu` device and its queue.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    name: String,
    limits: DeviceLimits,
    buffers: Mutex<HashMap<u64, Allocation>>,
    next_id: AtomicU64,
    pump: Pump,
}

impl WgpuBackend {
    /// Opens a device on `adapter`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceExecution`] when the device cannot be created.
    pub fn new(adapter: &wgpu::Adapter) -> Result<Self> {
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("wmatrix"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|e| Error::DeviceExecution(format!("failed to open wgpu device: {e}")))?;

        let device_limits = device.limits();
        let limits = DeviceLimits {
            max_buffer_bytes: device_limits
                .max_buffer_size
                .min(u64::from(device_limits.max_storage_buffer_binding_size)),
            workgroup: WORKGROUP,
            max_groups: device_limits.max_compute_workgroups_per_dimension,
            vector_bytes: 16,
            queues: 1,
        };
        let name = adapter.get_info().name;
        debug!(device = %name, ?limits, "wgpu device opened");

        let polled = device.clone();
        let pump: Pump = Arc::new(move || {
            if let Err(err) = polled.poll(wgpu::PollType::Wait) {
                warn!(error = %err, "device poll failed");
            }
        });

        Ok(Self {
            device,
            queue,
            name,
            limits,
            buffers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            pump,
        })
    }

    fn buffer(&self, id: BufferId) -> Result<wgpu::Buffer> {
        self.buffers
            .lock()
            .get(&id.0)
            .map(|a| a.buffer.clone())
            .ok_or_else(|| Error::invalid(format!("unknown buffer {id}")))
    }

    /// An event signalled once everything submitted so far has finished.
    fn completion(&self, label: &'static str) -> Event {
        let event = Event::pending(label, Some(Arc::clone(&self.pump)));
        let done = event.clone();
        self.queue.on_submitted_work_done(move || done.signal());
        event
    }

    fn error_scope<T>(&self, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        let error = pollster::block_on(self.device.pop_error_scope());
        (value, error)
    }
}

/// Returns a failed event when a dependency already failed.
fn failed_dependency(label: &'static str, wait: &[Event]) -> Option<Event> {
    let failed = wait.iter().find(|e| e.status() == EventStatus::Failed)?;
    let event = Event::pending(label, None);
    event.fail(format!("dependency `{}` failed", failed.label()));
    Some(event)
}

/// Storage bindings are addressed in 4-byte words.
const fn padded(bytes: usize) -> usize {
    bytes.max(4).next_multiple_of(4)
}

impl DeviceBackend for WgpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Wgpu
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn allocate(&self, bytes: usize, _zeroed: bool) -> Result<BufferId> {
        let size = padded(bytes) as u64;
        if size > self.limits.max_buffer_bytes {
            return Err(Error::AllocationFailure { bytes });
        }
        // wgpu zero-initialises every buffer, so `zeroed` needs no extra work.
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.buffers.lock().insert(id, Allocation { buffer, bytes });
        trace!(buffer = id, bytes, "allocated");
        Ok(BufferId(id))
    }

    fn release(&self, id: BufferId) -> Result<(), ReleaseError> {
        // wgpu keeps buffers referenced by in-flight commands alive on its own.
        match self.buffers.lock().remove(&id.0) {
            Some(_) => Ok(()),
            None => Err(ReleaseError::Unknown),
        }
    }

    fn write(&self, id: BufferId, offset: usize, data: &[u8], wait: &[Event]) -> Result<Event> {
        if let Some(failed) = failed_dependency("write", wait) {
            return Ok(failed);
        }
        let buffer = self.buffer(id)?;
        if offset % 4 != 0 || offset + padded(data.len()) > buffer.size() as usize {
            return Err(Error::invalid(format!(
                "write of {} bytes at {offset} is out of range or unaligned for {id}",
                data.len()
            )));
        }
        if data.len() % 4 == 0 {
            self.queue.write_buffer(&buffer, offset as u64, data);
        } else {
            let mut padded_data = data.to_vec();
            padded_data.resize(padded(data.len()), 0);
            self.queue.write_buffer(&buffer, offset as u64, &padded_data);
        }
        self.queue.submit([]);
        Ok(self.completion("write"))
    }

    fn read(&self, id: BufferId, offset: usize, out: &mut [u8], wait: &[Event]) -> Result<()> {
        Event::wait_all(wait)?;
        let buffer = self.buffer(id)?;
        let size = padded(out.len());
        if offset % 4 != 0 || offset + size > buffer.size() as usize {
            return Err(Error::invalid(format!(
                "read of {} bytes at {offset} is out of range or unaligned for {id}",
                out.len()
            )));
        }

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size: size as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("read"),
            });
        encoder.copy_buffer_to_buffer(&buffer, offset as u64, &staging, 0, size as u64);
        self.queue.submit(Some(encoder.finish()));

        let mapped = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&mapped);
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| *slot.lock() = Some(result));
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| Error::DeviceExecution(format!("device poll failed: {e}")))?;

        match mapped.lock().take() {
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(Error::DeviceExecution(format!("map failed: {e}"))),
            None => return Err(Error::DeviceExecution("staging buffer was never mapped".into())),
        }
        {
            let view = staging.slice(..).get_mapped_range();
            out.copy_from_slice(&view[..out.len()]);
        }
        staging.unmap();
        Ok(())
    }

    fn build(&self, key: KernelKey, _options: &BuildOptions) -> Result<KernelHandle, CompileError> {
        if key.dtype != Dtype::F32 {
            return Err(CompileError::UnsupportedDtype {
                kernel: key.id,
                dtype: key.dtype,
            });
        }
        let wgsl = source::render(key, "f32");
        let label = key.to_string();
        let storage = key.id.binding_count(key.complex);

        let (kernel, error) = self.error_scope(|| {
            let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&label),
                source: wgpu::ShaderSource::Wgsl(wgsl.into()),
            });
            let entries: Vec<_> = (0..=storage)
                .map(|binding| wgpu::BindGroupLayoutEntry {
                    binding: binding as u32,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: if binding == 0 {
                            wgpu::BufferBindingType::Uniform
                        } else {
                            wgpu::BufferBindingType::Storage { read_only: false }
                        },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                })
                .collect();
            let layout = self
                .device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(&label),
                    entries: &entries,
                });
            let pipeline_layout = self
                .device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(&label),
                    bind_group_layouts: &[&layout],
                    push_constant_ranges: &[],
                });
            let pipeline = self
                .device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(&label),
                    layout: Some(&pipeline_layout),
                    module: &module,
                    entry_point: Some("main"),
                    cache: None,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                });
            WgpuKernel { pipeline, layout }
        });
        if let Some(err) = error {
            return Err(CompileError::Build {
                kernel: key.id,
                message: err.to_string(),
            });
        }
        Ok(KernelHandle::new(key, kernel))
    }

    fn enqueue(&self, launch: Launch, wait: &[Event]) -> Result<Event> {
        let label = launch.kernel.key().id.name();
        if let Some(failed) = failed_dependency(label, wait) {
            return Ok(failed);
        }
        let kernel = launch
            .kernel
            .downcast_ref::<WgpuKernel>()
            .ok_or_else(|| Error::DeviceExecution(format!("`{label}` was not built by wgpu")))?;

        let groups = |n: usize, local: u32| -> Result<u32> {
            let g = n.div_ceil(local as usize);
            u32::try_from(g)
                .ok()
                .filter(|&g| g <= self.limits.max_groups)
                .ok_or_else(|| Error::DeviceExecution(format!("`{label}` needs {g} work-groups")))
        };
        let gx = groups(launch.params.cols(), WORKGROUP[0])?;
        let gy = groups(launch.params.rows(), WORKGROUP[1])?;

        let buffers = launch
            .bindings
            .iter()
            .map(|&id| self.buffer(id))
            .collect::<Result<Vec<_>>>()?;
        let uniform = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("params"),
                contents: bytemuck::bytes_of(&GpuParams::from(&launch.params)),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let ((), error) = self.error_scope(|| {
            let mut entries = vec![wgpu::BindGroupEntry {
                binding: 0,
                resource: uniform.as_entire_binding(),
            }];
            entries.extend(buffers.iter().enumerate().map(|(i, b)| wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: b.as_entire_binding(),
            }));
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: &kernel.layout,
                entries: &entries,
            });
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(label),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&kernel.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(gx, gy, 1);
            }
            self.queue.submit(Some(encoder.finish()));
        });
        if let Some(err) = error {
            return Err(Error::DeviceExecution(format!("`{label}` rejected: {err}")));
        }
        Ok(self.completion(label))
    }

    fn marker(&self, wait: &[Event]) -> Result<Event> {
        if let Some(failed) = failed_dependency("marker", wait) {
            return Ok(failed);
        }
        if wait.iter().all(Event::is_complete) {
            return Ok(Event::complete());
        }
        self.queue.submit([]);
        Ok(self.completion("marker"))
    }

    fn finish(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|e| Error::DeviceExecution(format!("device poll failed: {e}")))
    }

    fn stats(&self) -> BackendStats {
        let buffers = self.buffers.lock();
        BackendStats {
            live_buffers: buffers.len(),
            allocated_bytes: buffers.values().map(|a| a.bytes).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_match_the_uniform_layout() {
        assert_eq!(size_of::<GpuParams>(), 96);
        let p = KernelParams::new(3, 4).scalar(0, 0.5);
        let gpu = GpuParams::from(&p);
        assert_eq!(gpu.dims[..2], [3, 4]);
        assert!((gpu.scalars[0] - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn padding_rounds_to_words() {
        assert_eq!(padded(0), 4);
        assert_eq!(padded(5), 8);
        assert_eq!(padded(12), 12);
    }
}
