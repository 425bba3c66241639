//! Host-memory device.
//!
//! Behaves like a strict device runtime: allocations are real byte buffers,
//! interop buffers must be registered before mapping, mapped before copying,
//! and touched only from the device that owns them. Useful for tests and for
//! machines without an accelerator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{
    BufferTarget, DeviceBackend, DeviceError, DeviceErrorCode, DeviceId, DevicePtr, DeviceResult,
    GraphicsBuffer,
};

/// Spacing between emulated addresses.
const ADDRESS_STRIDE: u64 = 0x1000;

struct Allocation {
    device: DeviceId,
    bytes: Vec<u8>,
    /// Storage of an interop buffer. Only reachable while mapped.
    interop_of: Option<GraphicsBuffer>,
}

struct GraphicsObject {
    target: BufferTarget,
    device: DeviceId,
    storage: u64,
    registered: bool,
    mapped: bool,
}

#[derive(Default)]
struct EmulatedState {
    next_address: u64,
    next_buffer: u32,
    used_bytes: usize,
    allocations: HashMap<u64, Allocation>,
    graphics: HashMap<u32, GraphicsObject>,
}

impl EmulatedState {
    fn reserve(
        &mut self,
        capacity: usize,
        device: DeviceId,
        bytes: usize,
        interop_of: Option<GraphicsBuffer>,
    ) -> DeviceResult<u64> {
        let used = self.used_bytes.saturating_add(bytes);
        if used > capacity {
            return Err(DeviceError::new(
                DeviceErrorCode::MemoryAllocation,
                format!("requested {bytes} bytes with {} of {capacity} in use", self.used_bytes),
            ));
        }
        let mut storage = Vec::new();
        storage.try_reserve_exact(bytes).map_err(|_| {
            DeviceError::new(DeviceErrorCode::MemoryAllocation, format!("host refused {bytes} bytes"))
        })?;
        storage.resize(bytes, 0);

        self.next_address += ADDRESS_STRIDE;
        let address = self.next_address;
        self.used_bytes = used;
        self.allocations.insert(
            address,
            Allocation {
                device,
                bytes: storage,
                interop_of,
            },
        );
        Ok(address)
    }

    fn release(&mut self, address: u64) {
        if let Some(allocation) = self.allocations.remove(&address) {
            self.used_bytes -= allocation.bytes.len();
        }
    }

    fn accessible(&mut self, ptr: DevicePtr, current: DeviceId) -> DeviceResult<&mut Vec<u8>> {
        let allocation = self.allocations.get_mut(&ptr.raw()).ok_or_else(|| {
            DeviceError::new(
                DeviceErrorCode::InvalidDevicePointer,
                format!("{:#x} is not a live allocation", ptr.raw()),
            )
        })?;
        if let Some(buffer) = allocation.interop_of {
            let mapped = self.graphics.get(&buffer.raw()).is_some_and(|g| g.mapped);
            if !mapped {
                return Err(DeviceError::new(
                    DeviceErrorCode::InvalidDevicePointer,
                    format!("interop buffer {} is not mapped", buffer.raw()),
                ));
            }
            if allocation.device != current {
                return Err(DeviceError::new(
                    DeviceErrorCode::InvalidDevice,
                    format!(
                        "interop buffer {} belongs to {} but {current} is active",
                        buffer.raw(),
                        allocation.device
                    ),
                ));
            }
        }
        Ok(&mut allocation.bytes)
    }

    fn graphics_mut(&mut self, buffer: GraphicsBuffer) -> DeviceResult<&mut GraphicsObject> {
        self.graphics.get_mut(&buffer.raw()).ok_or_else(|| {
            DeviceError::new(
                DeviceErrorCode::InvalidResourceHandle,
                format!("graphics buffer {} does not exist", buffer.raw()),
            )
        })
    }
}

fn bounds(len: usize, offset: usize, count: usize) -> DeviceResult<std::ops::Range<usize>> {
    match offset.checked_add(count) {
        Some(end) if end <= len => Ok(offset..end),
        _ => Err(DeviceError::new(
            DeviceErrorCode::InvalidValue,
            format!("range {offset}+{count} exceeds allocation of {len} bytes"),
        )),
    }
}

/// Device runtime backed by host memory.
pub struct EmulatedDevice {
    device_count: u32,
    capacity_bytes: usize,
    current: AtomicU32,
    switches: AtomicU64,
    state: Mutex<EmulatedState>,
}

impl EmulatedDevice {
    /// Creates `device_count` devices with unlimited memory.
    #[must_use]
    pub fn new(device_count: u32) -> Self {
        Self::with_capacity(device_count, usize::MAX)
    }

    /// Creates devices that fail allocations beyond `capacity_bytes` in total.
    #[must_use]
    pub fn with_capacity(device_count: u32, capacity_bytes: usize) -> Self {
        Self {
            device_count: device_count.max(1),
            capacity_bytes,
            current: AtomicU32::new(0),
            switches: AtomicU64::new(0),
            state: Mutex::new(EmulatedState::default()),
        }
    }

    /// Bytes currently allocated.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.state.lock().used_bytes
    }

    /// Number of live plain and interop allocations.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Number of live graphics buffers.
    #[must_use]
    pub fn live_graphics_buffers(&self) -> usize {
        self.state.lock().graphics.len()
    }

    /// How many times the active device changed.
    #[must_use]
    pub fn device_switches(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    /// Whether `buffer` is currently mapped.
    #[must_use]
    pub fn is_mapped(&self, buffer: GraphicsBuffer) -> bool {
        self.state
            .lock()
            .graphics
            .get(&buffer.raw())
            .is_some_and(|g| g.mapped)
    }

    /// Binding target `buffer` was created with.
    #[must_use]
    pub fn buffer_target(&self, buffer: GraphicsBuffer) -> Option<BufferTarget> {
        self.state.lock().graphics.get(&buffer.raw()).map(|g| g.target)
    }

    /// Whether `buffer` is currently registered for interop.
    #[must_use]
    pub fn is_registered(&self, buffer: GraphicsBuffer) -> bool {
        self.state
            .lock()
            .graphics
            .get(&buffer.raw())
            .is_some_and(|g| g.registered)
    }
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new(1)
    }
}

impl DeviceBackend for EmulatedDevice {
    fn name(&self) -> &str {
        "emulated"
    }

    fn device_count(&self) -> u32 {
        self.device_count
    }

    fn current_device(&self) -> DeviceId {
        DeviceId(self.current.load(Ordering::Acquire))
    }

    fn set_device(&self, device: DeviceId) -> DeviceResult<()> {
        if device.0 >= self.device_count {
            return Err(DeviceError::new(
                DeviceErrorCode::InvalidDevice,
                format!("{device} requested, {} available", self.device_count),
            ));
        }
        if self.current.swap(device.0, Ordering::AcqRel) != device.0 {
            self.switches.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn malloc(&self, bytes: usize) -> DeviceResult<DevicePtr> {
        let device = self.current_device();
        let address = self
            .state
            .lock()
            .reserve(self.capacity_bytes, device, bytes, None)?;
        Ok(DevicePtr::from_raw(address))
    }

    fn free(&self, ptr: DevicePtr) -> DeviceResult<()> {
        let mut state = self.state.lock();
        match state.allocations.get(&ptr.raw()) {
            Some(allocation) if allocation.interop_of.is_none() => {
                state.release(ptr.raw());
                Ok(())
            }
            Some(_) => Err(DeviceError::new(
                DeviceErrorCode::InvalidDevicePointer,
                format!("{:#x} belongs to a graphics buffer", ptr.raw()),
            )),
            None => Err(DeviceError::new(
                DeviceErrorCode::InvalidDevicePointer,
                format!("{:#x} is not a live allocation", ptr.raw()),
            )),
        }
    }

    fn create_graphics_buffer(
        &self,
        bytes: usize,
        target: BufferTarget,
    ) -> DeviceResult<GraphicsBuffer> {
        let device = self.current_device();
        let mut state = self.state.lock();
        state.next_buffer += 1;
        let buffer = GraphicsBuffer::from_raw(state.next_buffer);
        let storage = state.reserve(self.capacity_bytes, device, bytes, Some(buffer))?;
        state.graphics.insert(
            buffer.raw(),
            GraphicsObject {
                target,
                device,
                storage,
                registered: false,
                mapped: false,
            },
        );
        Ok(buffer)
    }

    fn delete_graphics_buffer(&self, buffer: GraphicsBuffer) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let object = state.graphics_mut(buffer)?;
        if object.registered {
            return Err(DeviceError::new(
                DeviceErrorCode::InvalidResourceHandle,
                format!("graphics buffer {} is still registered", buffer.raw()),
            ));
        }
        let storage = object.storage;
        state.graphics.remove(&buffer.raw());
        state.release(storage);
        Ok(())
    }

    fn register_interop(&self, buffer: GraphicsBuffer) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let object = state.graphics_mut(buffer)?;
        if object.registered {
            return Err(DeviceError::new(
                DeviceErrorCode::InvalidResourceHandle,
                format!("graphics buffer {} is already registered", buffer.raw()),
            ));
        }
        object.registered = true;
        Ok(())
    }

    fn unregister_interop(&self, buffer: GraphicsBuffer) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let object = state.graphics_mut(buffer)?;
        if object.mapped {
            return Err(DeviceError::new(
                DeviceErrorCode::InvalidResourceHandle,
                format!("graphics buffer {} is still mapped", buffer.raw()),
            ));
        }
        object.registered = false;
        Ok(())
    }

    fn map_interop(&self, buffer: GraphicsBuffer) -> DeviceResult<DevicePtr> {
        let current = self.current_device();
        let mut state = self.state.lock();
        let object = state.graphics_mut(buffer)?;
        if !object.registered {
            return Err(DeviceError::new(
                DeviceErrorCode::MapBufferObjectFailed,
                format!("graphics buffer {} is not registered", buffer.raw()),
            ));
        }
        if object.mapped {
            return Err(DeviceError::new(
                DeviceErrorCode::AlreadyMapped,
                format!("graphics buffer {} is already mapped", buffer.raw()),
            ));
        }
        if object.device != current {
            return Err(DeviceError::new(
                DeviceErrorCode::InvalidDevice,
                format!("graphics buffer {} belongs to {}", buffer.raw(), object.device),
            ));
        }
        object.mapped = true;
        Ok(DevicePtr::from_raw(object.storage))
    }

    fn unmap_interop(&self, buffer: GraphicsBuffer) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let object = state.graphics_mut(buffer)?;
        if !object.mapped {
            return Err(DeviceError::new(
                DeviceErrorCode::NotMapped,
                format!("graphics buffer {} is not mapped", buffer.raw()),
            ));
        }
        object.mapped = false;
        Ok(())
    }

    fn copy_host_to_device(&self, dst: DevicePtr, offset: usize, src: &[u8]) -> DeviceResult<()> {
        let current = self.current_device();
        let mut state = self.state.lock();
        let storage = state.accessible(dst, current)?;
        let range = bounds(storage.len(), offset, src.len())?;
        storage[range].copy_from_slice(src);
        Ok(())
    }

    fn copy_device_to_host(
        &self,
        src: DevicePtr,
        offset: usize,
        dst: &mut [u8],
    ) -> DeviceResult<()> {
        let current = self.current_device();
        let mut state = self.state.lock();
        let storage = state.accessible(src, current)?;
        let range = bounds(storage.len(), offset, dst.len())?;
        dst.copy_from_slice(&storage[range]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malloc_roundtrip_and_free() {
        let device = EmulatedDevice::new(1);
        let ptr = device.malloc(16).unwrap();
        device.copy_host_to_device(ptr, 4, &[1, 2, 3, 4]).unwrap();

        let mut out = [0u8; 8];
        device.copy_device_to_host(ptr, 0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 0, 0, 1, 2, 3, 4]);

        device.free(ptr).unwrap();
        assert_eq!(device.used_bytes(), 0);
        assert!(device.free(ptr).is_err());
    }

    #[test]
    fn test_capacity_limit_fails_allocation() {
        let device = EmulatedDevice::with_capacity(1, 64);
        let _a = device.malloc(48).unwrap();
        let err = device.malloc(32).unwrap_err();
        assert_eq!(err.code, DeviceErrorCode::MemoryAllocation);
    }

    #[test]
    fn test_out_of_range_copy_rejected() {
        let device = EmulatedDevice::new(1);
        let ptr = device.malloc(8).unwrap();
        let err = device.copy_host_to_device(ptr, 6, &[0; 4]).unwrap_err();
        assert_eq!(err.code, DeviceErrorCode::InvalidValue);
    }

    #[test]
    fn test_interop_requires_registration_and_mapping() {
        let device = EmulatedDevice::new(1);
        let buffer = device.create_graphics_buffer(16, BufferTarget::Array).unwrap();
        assert_eq!(
            device.map_interop(buffer).unwrap_err().code,
            DeviceErrorCode::MapBufferObjectFailed
        );

        device.register_interop(buffer).unwrap();
        let ptr = device.map_interop(buffer).unwrap();
        assert_eq!(device.map_interop(buffer).unwrap_err().code, DeviceErrorCode::AlreadyMapped);
        device.copy_host_to_device(ptr, 0, &[9; 16]).unwrap();

        device.unmap_interop(buffer).unwrap();
        assert!(device.copy_host_to_device(ptr, 0, &[9; 16]).is_err());
        assert!(device.free(ptr).is_err());

        assert!(device.delete_graphics_buffer(buffer).is_err());
        device.unregister_interop(buffer).unwrap();
        device.delete_graphics_buffer(buffer).unwrap();
        assert_eq!(device.live_allocations(), 0);
        assert_eq!(device.live_graphics_buffers(), 0);
    }

    #[test]
    fn test_interop_bound_to_owning_device() {
        let device = EmulatedDevice::new(2);
        device.set_device(DeviceId(1)).unwrap();
        let buffer = device.create_graphics_buffer(8, BufferTarget::ElementArray).unwrap();
        device.register_interop(buffer).unwrap();

        device.set_device(DeviceId(0)).unwrap();
        assert_eq!(device.map_interop(buffer).unwrap_err().code, DeviceErrorCode::InvalidDevice);
        device.set_device(DeviceId(1)).unwrap();
        assert!(device.map_interop(buffer).is_ok());
        assert_eq!(device.device_switches(), 3);
    }
}
