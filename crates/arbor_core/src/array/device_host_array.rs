//! Owned host mirror plus device storage.

use std::mem::size_of;

use bytemuck::Pod;

use crate::device::{
    checked, BufferTarget, DeviceContext, DeviceError, DeviceErrorCode, DevicePtr, DeviceResult,
    DeviceSwitch, Direction, GraphicsBuffer,
};

/// How an array's device storage is created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocOptions {
    /// Back the device side with graphics buffers registered for interop.
    pub interop: bool,
    /// Keep a second device buffer for ping-pong updates.
    pub double_buffer: bool,
    /// Create interop buffers as index buffers instead of vertex buffers.
    pub element_array: bool,
}

impl AllocOptions {
    /// Plain single device buffer.
    pub const PLAIN: Self = Self {
        interop: false,
        double_buffer: false,
        element_array: false,
    };

    /// Sets interop backing.
    #[must_use]
    pub const fn interop(mut self, on: bool) -> Self {
        self.interop = on;
        self
    }

    /// Sets double buffering.
    #[must_use]
    pub const fn double_buffer(mut self, on: bool) -> Self {
        self.double_buffer = on;
        self
    }

    /// Sets index-buffer binding for interop buffers.
    #[must_use]
    pub const fn element_array(mut self, on: bool) -> Self {
        self.element_array = on;
        self
    }

    fn slot_count(self) -> usize {
        if self.double_buffer {
            2
        } else {
            1
        }
    }

    fn target(self) -> BufferTarget {
        if self.element_array {
            BufferTarget::ElementArray
        } else {
            BufferTarget::Array
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DeviceSlot {
    Empty,
    Plain(DevicePtr),
    Interop {
        buffer: GraphicsBuffer,
        registered: bool,
        /// Null unless mapped.
        mapped: DevicePtr,
    },
}

impl DeviceSlot {
    fn device_ptr(self) -> DevicePtr {
        match self {
            Self::Plain(ptr) => ptr,
            Self::Interop { mapped, .. } => mapped,
            Self::Empty => DevicePtr::NULL,
        }
    }

    fn graphics_buffer(self) -> GraphicsBuffer {
        match self {
            Self::Interop { buffer, .. } => buffer,
            _ => GraphicsBuffer::NONE,
        }
    }
}

/// Fixed-size array with a host mirror and one or two device buffers.
///
/// Dropping the array releases everything it holds.
pub struct DeviceHostArray<T: Pod> {
    ctx: DeviceContext,
    size: usize,
    host: Vec<T>,
    slots: [DeviceSlot; 2],
    options: AllocOptions,
    read: usize,
    write: usize,
    mapped: bool,
}

impl<T: Pod> DeviceHostArray<T> {
    /// Creates an empty array bound to `ctx`.
    #[must_use]
    pub fn new(ctx: DeviceContext) -> Self {
        Self {
            ctx,
            size: 0,
            host: Vec::new(),
            slots: [DeviceSlot::Empty; 2],
            options: AllocOptions::PLAIN,
            read: 0,
            write: 0,
            mapped: false,
        }
    }

    /// Allocates `size` elements on host and device.
    ///
    /// Any storage already held is released first. The host mirror is
    /// zero-filled.
    pub fn alloc(&mut self, size: usize, options: AllocOptions) -> DeviceResult<()> {
        if self.is_allocated() {
            self.free()?;
        }
        let bytes = size.checked_mul(size_of::<T>()).ok_or_else(|| {
            DeviceError::new(
                DeviceErrorCode::InvalidValue,
                format!("{size} elements of {} bytes overflow", size_of::<T>()),
            )
        })?;

        let mut host = Vec::new();
        host.try_reserve_exact(size).map_err(|_| {
            DeviceError::new(
                DeviceErrorCode::MemoryAllocation,
                format!("host mirror of {bytes} bytes"),
            )
        })?;
        host.resize(size, T::zeroed());
        self.ctx.tracker().record_host_alloc(bytes);
        self.host = host;
        self.size = size;
        self.options = options;
        self.read = 0;
        self.write = usize::from(options.double_buffer);

        if options.interop {
            self.alloc_interop(bytes)?;
        } else {
            self.alloc_device(bytes)?;
        }

        tracing::debug!(
            size,
            bytes,
            interop = options.interop,
            double_buffer = options.double_buffer,
            "array allocated"
        );
        Ok(())
    }

    fn alloc_device(&mut self, bytes: usize) -> DeviceResult<()> {
        let backend = self.ctx.backend();
        for index in 0..self.options.slot_count() {
            let ptr = checked(backend.malloc(bytes))?;
            self.slots[index] = DeviceSlot::Plain(ptr);
            self.ctx.tracker().record_device_alloc(bytes);
        }
        Ok(())
    }

    fn alloc_interop(&mut self, bytes: usize) -> DeviceResult<()> {
        // Graphics buffers live with the render context.
        let switch = DeviceSwitch::enter(self.ctx.backend().clone(), self.ctx.render_device())?;
        let target = self.options.target();
        for index in 0..self.options.slot_count() {
            let backend = self.ctx.backend();
            let buffer = checked(backend.create_graphics_buffer(bytes, target))?;
            self.slots[index] = DeviceSlot::Interop {
                buffer,
                registered: false,
                mapped: DevicePtr::NULL,
            };
            self.ctx.tracker().record_device_alloc(bytes);
            checked(backend.register_interop(buffer))?;
            self.slots[index] = DeviceSlot::Interop {
                buffer,
                registered: true,
                mapped: DevicePtr::NULL,
            };
        }
        switch.restore()
    }

    /// Releases host and device storage.
    ///
    /// Every slot is nulled even when a release fails. Calling this on an
    /// already freed array does nothing.
    pub fn free(&mut self) -> DeviceResult<()> {
        let bytes = self.size * size_of::<T>();
        let mut first_error = None;

        if self.mapped {
            if let Err(err) = self.unmap() {
                first_error.get_or_insert(err);
            }
        }

        let backend = self.ctx.backend().clone();
        for index in 0..self.slots.len() {
            let slot = std::mem::replace(&mut self.slots[index], DeviceSlot::Empty);
            let result = match slot {
                DeviceSlot::Empty => continue,
                DeviceSlot::Plain(ptr) => checked(backend.free(ptr)),
                DeviceSlot::Interop {
                    buffer, registered, ..
                } => {
                    let unregistered = if registered {
                        checked(backend.unregister_interop(buffer))
                    } else {
                        Ok(())
                    };
                    unregistered.and_then(|()| checked(backend.delete_graphics_buffer(buffer)))
                }
            };
            self.ctx.tracker().record_device_free(bytes);
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }

        if self.host.capacity() > 0 {
            self.host = Vec::new();
            self.ctx.tracker().record_host_free(bytes);
        }
        self.size = 0;
        self.read = 0;
        self.write = 0;
        self.mapped = false;

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Exchanges the read and write buffers. No-op unless double-buffered.
    pub fn swap(&mut self) {
        if self.options.double_buffer {
            std::mem::swap(&mut self.read, &mut self.write);
        }
    }

    /// Maps every interop buffer so its device address becomes valid.
    ///
    /// Mapping an already mapped array is an error. Plain arrays have
    /// nothing to map.
    pub fn map(&mut self) -> DeviceResult<()> {
        if self.mapped {
            return Err(DeviceError::new(
                DeviceErrorCode::AlreadyMapped,
                "array is already mapped",
            ));
        }
        let backend = self.ctx.backend().clone();
        let mut mapped_any = false;
        for index in 0..self.slots.len() {
            if let DeviceSlot::Interop {
                buffer, registered, ..
            } = self.slots[index]
            {
                match checked(backend.map_interop(buffer)) {
                    Ok(ptr) => {
                        self.slots[index] = DeviceSlot::Interop {
                            buffer,
                            registered,
                            mapped: ptr,
                        };
                        mapped_any = true;
                    }
                    Err(err) => {
                        self.mapped = mapped_any;
                        if mapped_any {
                            if let Err(rollback) = self.unmap() {
                                tracing::warn!(%rollback, "unmap after partial map failed");
                            }
                        }
                        return Err(err);
                    }
                }
            }
        }
        self.mapped = mapped_any;
        Ok(())
    }

    /// Unmaps interop buffers. No-op when nothing is mapped.
    pub fn unmap(&mut self) -> DeviceResult<()> {
        if !self.mapped {
            return Ok(());
        }
        let backend = self.ctx.backend().clone();
        let mut first_error = None;
        for index in 0..self.slots.len() {
            if let DeviceSlot::Interop {
                buffer,
                registered,
                mapped,
            } = self.slots[index]
            {
                if mapped.is_null() {
                    continue;
                }
                if let Err(err) = checked(backend.unmap_interop(buffer)) {
                    first_error.get_or_insert(err);
                }
                self.slots[index] = DeviceSlot::Interop {
                    buffer,
                    registered,
                    mapped: DevicePtr::NULL,
                };
            }
        }
        self.mapped = false;
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Copies `count` elements starting at `start` between host and the
    /// read buffer. `count == 0` means the whole array.
    ///
    /// Runs on the render device and maps interop buffers for the duration
    /// of the transfer when the caller has not. The previous device is
    /// active again afterwards, even on error.
    pub fn copy(&mut self, direction: Direction, start: usize, count: usize) -> DeviceResult<()> {
        let count = if count == 0 { self.size } else { count };
        let end = match start.checked_add(count) {
            Some(end) if end <= self.size => end,
            _ => {
                return Err(DeviceError::new(
                    DeviceErrorCode::InvalidValue,
                    format!("copy of {start}+{count} exceeds array of {}", self.size),
                ))
            }
        };
        if self.slots[self.read] == DeviceSlot::Empty {
            return Err(DeviceError::new(
                DeviceErrorCode::InvalidDevicePointer,
                "array has no device storage",
            ));
        }

        let switch = DeviceSwitch::enter(self.ctx.backend().clone(), self.ctx.render_device())?;
        let bracket = !self.mapped;
        if bracket {
            self.map()?;
        }
        let moved = self.transfer(direction, start, end);
        let unmapped = if bracket { self.unmap() } else { Ok(()) };
        let restored = switch.restore();
        moved.and(unmapped).and(restored)
    }

    fn transfer(&mut self, direction: Direction, start: usize, end: usize) -> DeviceResult<()> {
        let ptr = self.slots[self.read].device_ptr();
        let offset = start * size_of::<T>();
        let backend = self.ctx.backend();
        match direction {
            Direction::HostToDevice => checked(backend.copy_host_to_device(
                ptr,
                offset,
                bytemuck::cast_slice(&self.host[start..end]),
            )),
            Direction::DeviceToHost => checked(backend.copy_device_to_host(
                ptr,
                offset,
                bytemuck::cast_slice_mut(&mut self.host[start..end]),
            )),
        }
    }

    /// Copies the whole host mirror to the device.
    pub fn upload(&mut self) -> DeviceResult<()> {
        self.copy(Direction::HostToDevice, 0, 0)
    }

    /// Copies the whole device buffer into the host mirror.
    pub fn download(&mut self) -> DeviceResult<()> {
        self.copy(Direction::DeviceToHost, 0, 0)
    }

    /// Accepted for interface compatibility. Does nothing.
    pub fn memset(&mut self, _value: u8, _start: usize, _count: usize) {}

    /// Device address of the read buffer. Null when unallocated or when an
    /// interop buffer is unmapped.
    #[inline]
    #[must_use]
    pub fn device_ptr(&self) -> DevicePtr {
        self.slots[self.read].device_ptr()
    }

    /// Device address of the write buffer.
    #[inline]
    #[must_use]
    pub fn device_write_ptr(&self) -> DevicePtr {
        self.slots[self.write].device_ptr()
    }

    /// Graphics buffer behind the read slot.
    #[inline]
    #[must_use]
    pub fn graphics_buffer(&self) -> GraphicsBuffer {
        self.slots[self.read].graphics_buffer()
    }

    /// Graphics buffer behind the write slot.
    #[inline]
    #[must_use]
    pub fn write_graphics_buffer(&self) -> GraphicsBuffer {
        self.slots[self.write].graphics_buffer()
    }

    /// Host mirror.
    #[inline]
    #[must_use]
    pub fn host(&self) -> &[T] {
        &self.host
    }

    /// Mutable host mirror.
    #[inline]
    pub fn host_mut(&mut self) -> &mut [T] {
        &mut self.host
    }

    /// Element count.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether any storage is held.
    #[inline]
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.host.capacity() > 0 || self.slots.iter().any(|s| *s != DeviceSlot::Empty)
    }

    /// Whether a second device buffer exists.
    #[inline]
    #[must_use]
    pub fn is_double_buffered(&self) -> bool {
        self.options.double_buffer
    }

    /// Whether device storage is graphics interop.
    #[inline]
    #[must_use]
    pub fn is_interop(&self) -> bool {
        self.options.interop
    }

    /// Whether interop buffers are currently mapped.
    #[inline]
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    /// Index of the read slot.
    #[inline]
    #[must_use]
    pub fn read_index(&self) -> usize {
        self.read
    }

    /// Index of the write slot.
    #[inline]
    #[must_use]
    pub fn write_index(&self) -> usize {
        self.write
    }

    /// Device context the array allocates from.
    #[inline]
    #[must_use]
    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }
}

impl<T: Pod> Drop for DeviceHostArray<T> {
    fn drop(&mut self) {
        if !self.is_allocated() {
            return;
        }
        if let Err(err) = self.free() {
            tracing::error!(%err, "array release failed");
        }
    }
}

impl<T: Pod> std::fmt::Debug for DeviceHostArray<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHostArray")
            .field("size", &self.size)
            .field("options", &self.options)
            .field("read", &self.read)
            .field("write", &self.write)
            .field("mapped", &self.mapped)
            .finish_non_exhaustive()
    }
}
