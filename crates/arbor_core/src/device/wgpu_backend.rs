//! wgpu-backed device.
//!
//! A wgpu buffer can be bound for rendering and compute at the same time,
//! so interop registration and mapping are bookkeeping here. Copies go
//! through `Queue::write_buffer` and a staging read-back.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::{
    BufferTarget, DeviceBackend, DeviceError, DeviceErrorCode, DeviceId, DevicePtr, DeviceResult,
    GraphicsBuffer,
};

struct GraphicsEntry {
    address: u64,
    registered: bool,
    mapped: bool,
}

#[derive(Default)]
struct WgpuState {
    next_address: u64,
    next_graphics: u32,
    buffers: HashMap<u64, wgpu::Buffer>,
    graphics: HashMap<u32, GraphicsEntry>,
}

/// Device runtime on top of a single wgpu adapter.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    state: Mutex<WgpuState>,
}

/// `write_buffer` and buffer copies require 4-byte granularity.
const COPY_ALIGN: u64 = wgpu::COPY_BUFFER_ALIGNMENT;

fn padded(bytes: usize) -> u64 {
    let bytes = (bytes as u64).max(COPY_ALIGN);
    (bytes + COPY_ALIGN - 1) & !(COPY_ALIGN - 1)
}

fn aligned(offset: usize, len: usize) -> DeviceResult<()> {
    if offset as u64 % COPY_ALIGN != 0 || len as u64 % COPY_ALIGN != 0 {
        return Err(DeviceError::new(
            DeviceErrorCode::InvalidValue,
            format!("copy {offset}+{len} is not {COPY_ALIGN}-byte aligned"),
        ));
    }
    Ok(())
}

impl WgpuDevice {
    /// Opens the highest-performance adapter available.
    pub fn open() -> DeviceResult<Self> {
        pollster::block_on(Self::open_async())
    }

    async fn open_async() -> DeviceResult<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                ..Default::default()
            })
            .await
            .ok_or_else(|| DeviceError::new(DeviceErrorCode::InvalidDevice, "no suitable adapter"))?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("ARBOR Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .map_err(|e| DeviceError::new(DeviceErrorCode::InvalidDevice, e.to_string()))?;

        let adapter_name = adapter.get_info().name;
        tracing::info!(adapter = %adapter_name, "wgpu device opened");
        Ok(Self {
            device,
            queue,
            adapter_name,
            state: Mutex::new(WgpuState::default()),
        })
    }

    /// Adapter name reported by the driver.
    #[must_use]
    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    fn insert(&self, usage: wgpu::BufferUsages, bytes: usize, label: &str) -> u64 {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: padded(bytes),
            usage,
            mapped_at_creation: false,
        });
        let mut state = self.state.lock();
        state.next_address += 1;
        let address = state.next_address;
        state.buffers.insert(address, buffer);
        address
    }

    fn with_buffer<R>(
        &self,
        ptr: DevicePtr,
        f: impl FnOnce(&wgpu::Buffer) -> DeviceResult<R>,
    ) -> DeviceResult<R> {
        let state = self.state.lock();
        let interop_unmapped = state
            .graphics
            .values()
            .any(|g| g.address == ptr.raw() && !g.mapped);
        if interop_unmapped {
            return Err(DeviceError::new(
                DeviceErrorCode::InvalidDevicePointer,
                "interop buffer is not mapped",
            ));
        }
        let buffer = state.buffers.get(&ptr.raw()).ok_or_else(|| {
            DeviceError::new(
                DeviceErrorCode::InvalidDevicePointer,
                format!("{:#x} is not a live allocation", ptr.raw()),
            )
        })?;
        f(buffer)
    }
}

impl DeviceBackend for WgpuDevice {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn device_count(&self) -> u32 {
        1
    }

    fn current_device(&self) -> DeviceId {
        DeviceId(0)
    }

    fn set_device(&self, device: DeviceId) -> DeviceResult<()> {
        if device != DeviceId(0) {
            return Err(DeviceError::new(
                DeviceErrorCode::InvalidDevice,
                format!("{device} requested, wgpu exposes one adapter"),
            ));
        }
        Ok(())
    }

    fn malloc(&self, bytes: usize) -> DeviceResult<DevicePtr> {
        let usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST;
        Ok(DevicePtr::from_raw(self.insert(usage, bytes, "ARBOR Device Array")))
    }

    fn free(&self, ptr: DevicePtr) -> DeviceResult<()> {
        let mut state = self.state.lock();
        if state.graphics.values().any(|g| g.address == ptr.raw()) {
            return Err(DeviceError::new(
                DeviceErrorCode::InvalidDevicePointer,
                format!("{:#x} belongs to a graphics buffer", ptr.raw()),
            ));
        }
        let buffer = state.buffers.remove(&ptr.raw()).ok_or_else(|| {
            DeviceError::new(
                DeviceErrorCode::InvalidDevicePointer,
                format!("{:#x} is not a live allocation", ptr.raw()),
            )
        })?;
        buffer.destroy();
        Ok(())
    }

    fn create_graphics_buffer(
        &self,
        bytes: usize,
        target: BufferTarget,
    ) -> DeviceResult<GraphicsBuffer> {
        let binding = match target {
            BufferTarget::Array => wgpu::BufferUsages::VERTEX,
            BufferTarget::ElementArray => wgpu::BufferUsages::INDEX,
        };
        let usage = binding
            | wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST;
        let address = self.insert(usage, bytes, "ARBOR Interop Buffer");
        let mut state = self.state.lock();
        state.next_graphics += 1;
        let handle = state.next_graphics;
        state.graphics.insert(
            handle,
            GraphicsEntry {
                address,
                registered: false,
                mapped: false,
            },
        );
        Ok(GraphicsBuffer::from_raw(handle))
    }

    fn delete_graphics_buffer(&self, buffer: GraphicsBuffer) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let entry = state.graphics.get(&buffer.raw()).ok_or_else(|| {
            DeviceError::new(DeviceErrorCode::InvalidResourceHandle, "unknown graphics buffer")
        })?;
        if entry.registered {
            return Err(DeviceError::new(
                DeviceErrorCode::InvalidResourceHandle,
                format!("graphics buffer {} is still registered", buffer.raw()),
            ));
        }
        let address = entry.address;
        state.graphics.remove(&buffer.raw());
        if let Some(storage) = state.buffers.remove(&address) {
            storage.destroy();
        }
        Ok(())
    }

    fn register_interop(&self, buffer: GraphicsBuffer) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let entry = state.graphics.get_mut(&buffer.raw()).ok_or_else(|| {
            DeviceError::new(DeviceErrorCode::InvalidResourceHandle, "unknown graphics buffer")
        })?;
        entry.registered = true;
        Ok(())
    }

    fn unregister_interop(&self, buffer: GraphicsBuffer) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let entry = state.graphics.get_mut(&buffer.raw()).ok_or_else(|| {
            DeviceError::new(DeviceErrorCode::InvalidResourceHandle, "unknown graphics buffer")
        })?;
        if entry.mapped {
            return Err(DeviceError::new(
                DeviceErrorCode::InvalidResourceHandle,
                "graphics buffer is still mapped",
            ));
        }
        entry.registered = false;
        Ok(())
    }

    fn map_interop(&self, buffer: GraphicsBuffer) -> DeviceResult<DevicePtr> {
        let mut state = self.state.lock();
        let entry = state.graphics.get_mut(&buffer.raw()).ok_or_else(|| {
            DeviceError::new(DeviceErrorCode::InvalidResourceHandle, "unknown graphics buffer")
        })?;
        if !entry.registered {
            return Err(DeviceError::new(
                DeviceErrorCode::MapBufferObjectFailed,
                "graphics buffer is not registered",
            ));
        }
        if entry.mapped {
            return Err(DeviceError::new(DeviceErrorCode::AlreadyMapped, "already mapped"));
        }
        entry.mapped = true;
        Ok(DevicePtr::from_raw(entry.address))
    }

    fn unmap_interop(&self, buffer: GraphicsBuffer) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let entry = state.graphics.get_mut(&buffer.raw()).ok_or_else(|| {
            DeviceError::new(DeviceErrorCode::InvalidResourceHandle, "unknown graphics buffer")
        })?;
        if !entry.mapped {
            return Err(DeviceError::new(DeviceErrorCode::NotMapped, "not mapped"));
        }
        entry.mapped = false;
        Ok(())
    }

    fn copy_host_to_device(&self, dst: DevicePtr, offset: usize, src: &[u8]) -> DeviceResult<()> {
        aligned(offset, src.len())?;
        self.with_buffer(dst, |buffer| {
            if (offset + src.len()) as u64 > buffer.size() {
                return Err(DeviceError::new(DeviceErrorCode::InvalidValue, "copy out of range"));
            }
            self.queue.write_buffer(buffer, offset as u64, src);
            self.queue.submit(None);
            Ok(())
        })
    }

    fn copy_device_to_host(
        &self,
        src: DevicePtr,
        offset: usize,
        dst: &mut [u8],
    ) -> DeviceResult<()> {
        aligned(offset, dst.len())?;
        if dst.is_empty() {
            return Ok(());
        }
        let byte_size = dst.len() as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("ARBOR Staging Buffer"),
            size: byte_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        self.with_buffer(src, |buffer| {
            if offset as u64 + byte_size > buffer.size() {
                return Err(DeviceError::new(DeviceErrorCode::InvalidValue, "copy out of range"));
            }
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("ARBOR Readback Encoder"),
                });
            encoder.copy_buffer_to_buffer(buffer, offset as u64, &staging, 0, byte_size);
            self.queue.submit(Some(encoder.finish()));
            Ok(())
        })?;

        let slice = staging.slice(..);
        let (sender, receiver) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|e| DeviceError::new(DeviceErrorCode::Unknown, format!("channel closed: {e}")))?
            .map_err(|e| {
                DeviceError::new(DeviceErrorCode::MapBufferObjectFailed, format!("read-back failed: {e}"))
            })?;

        let data = slice.get_mapped_range();
        dst.copy_from_slice(&data);
        drop(data);
        staging.unmap();
        Ok(())
    }
}
