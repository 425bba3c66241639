//! # Device Abstraction
//!
//! Everything the runtime asks of an accelerator goes through
//! [`DeviceBackend`]: plain allocations, graphics buffers that can be
//! registered for compute interop, mapping, and byte copies.
//!
//! ```text
//! ┌──────────────────┐      ┌──────────────────────┐
//! │ DeviceHostArray  │─────▶│ DeviceContext        │
//! │ (host Vec + 1-2  │      │  compute / render id │
//! │  device slots)   │      │  MemoryTracker       │
//! └──────────────────┘      └──────────┬───────────┘
//!                                      │ Arc<dyn DeviceBackend>
//!                     ┌────────────────┴────────────────┐
//!                     ▼                                 ▼
//!             ┌───────────────┐                ┌────────────────┐
//!             │ EmulatedDevice│                │ WgpuDevice     │
//!             │ (host memory) │                │ (feature wgpu) │
//!             └───────────────┘                └────────────────┘
//! ```
//!
//! The active device is backend-global state, just like a runtime's current
//! device. [`DeviceSwitch`] changes it for a scope and restores it on exit.

mod emulated;
mod error;
#[cfg(feature = "wgpu")]
mod wgpu_backend;

pub use emulated::EmulatedDevice;
pub use error::{checked, DeviceError, DeviceErrorCode, DeviceResult};
#[cfg(feature = "wgpu")]
pub use wgpu_backend::WgpuDevice;

use std::fmt;
use std::sync::Arc;

use crate::memory::MemoryTracker;

/// Ordinal of a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Opaque address of device memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DevicePtr(u64);

impl DevicePtr {
    /// The null address.
    pub const NULL: Self = Self(0);

    /// Wraps a raw backend address.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw backend address.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// True for the null address.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Handle of a graphics buffer object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct GraphicsBuffer(u32);

impl GraphicsBuffer {
    /// No buffer.
    pub const NONE: Self = Self(0);

    /// Wraps a raw handle.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw handle.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// True when no buffer is held.
    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Binding target of a graphics buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BufferTarget {
    /// Vertex data.
    #[default]
    Array,
    /// Index data.
    ElementArray,
}

/// Direction of a host/device transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host mirror to device.
    HostToDevice,
    /// Device to host mirror.
    DeviceToHost,
}

/// Operations a device runtime provides.
///
/// All methods take `&self`; implementations synchronize internally. Offsets
/// and lengths are in bytes.
pub trait DeviceBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Number of usable devices.
    fn device_count(&self) -> u32;

    /// Currently active device.
    fn current_device(&self) -> DeviceId;

    /// Makes `device` active.
    fn set_device(&self, device: DeviceId) -> DeviceResult<()>;

    /// Allocates `bytes` of device memory on the active device.
    fn malloc(&self, bytes: usize) -> DeviceResult<DevicePtr>;

    /// Releases a plain allocation.
    fn free(&self, ptr: DevicePtr) -> DeviceResult<()>;

    /// Creates a graphics buffer of `bytes` on the active device.
    fn create_graphics_buffer(&self, bytes: usize, target: BufferTarget)
        -> DeviceResult<GraphicsBuffer>;

    /// Deletes a graphics buffer. It must be unregistered first.
    fn delete_graphics_buffer(&self, buffer: GraphicsBuffer) -> DeviceResult<()>;

    /// Registers a graphics buffer for compute access.
    fn register_interop(&self, buffer: GraphicsBuffer) -> DeviceResult<()>;

    /// Reverses [`register_interop`](Self::register_interop).
    fn unregister_interop(&self, buffer: GraphicsBuffer) -> DeviceResult<()>;

    /// Maps a registered buffer and returns its device address.
    fn map_interop(&self, buffer: GraphicsBuffer) -> DeviceResult<DevicePtr>;

    /// Unmaps a mapped buffer.
    fn unmap_interop(&self, buffer: GraphicsBuffer) -> DeviceResult<()>;

    /// Copies `src` into device memory at `dst + offset`.
    fn copy_host_to_device(&self, dst: DevicePtr, offset: usize, src: &[u8]) -> DeviceResult<()>;

    /// Copies device memory at `src + offset` into `dst`.
    fn copy_device_to_host(&self, src: DevicePtr, offset: usize, dst: &mut [u8])
        -> DeviceResult<()>;
}

/// Device state shared by every array of one process.
#[derive(Clone)]
pub struct DeviceContext {
    backend: Arc<dyn DeviceBackend>,
    compute: DeviceId,
    render: DeviceId,
    tracker: MemoryTracker,
}

impl DeviceContext {
    /// Creates a context computing and rendering on `compute`.
    #[must_use]
    pub fn new(backend: Arc<dyn DeviceBackend>, compute: DeviceId) -> Self {
        Self {
            backend,
            compute,
            render: compute,
            tracker: MemoryTracker::new(),
        }
    }

    /// Uses a different device for graphics interop.
    #[must_use]
    pub fn with_render_device(mut self, render: DeviceId) -> Self {
        self.render = render;
        self
    }

    /// Records allocations into `tracker`.
    #[must_use]
    pub fn with_tracker(mut self, tracker: MemoryTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Makes the compute device active.
    pub fn activate(&self) -> DeviceResult<()> {
        checked(self.backend.set_device(self.compute))
    }

    /// The backend.
    #[inline]
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    /// Compute device.
    #[inline]
    #[must_use]
    pub fn compute_device(&self) -> DeviceId {
        self.compute
    }

    /// Device owning the graphics context.
    #[inline]
    #[must_use]
    pub fn render_device(&self) -> DeviceId {
        self.render
    }

    /// Allocation tracker.
    #[inline]
    #[must_use]
    pub fn tracker(&self) -> &MemoryTracker {
        &self.tracker
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("backend", &self.backend.name())
            .field("compute", &self.compute)
            .field("render", &self.render)
            .finish_non_exhaustive()
    }
}

/// Scoped change of the active device.
///
/// Restores the previous device when dropped. Call [`restore`](Self::restore)
/// to observe a failure to switch back.
pub struct DeviceSwitch {
    backend: Arc<dyn DeviceBackend>,
    previous: Option<DeviceId>,
}

impl DeviceSwitch {
    /// Activates `target`, remembering the current device if it differs.
    pub fn enter(backend: Arc<dyn DeviceBackend>, target: DeviceId) -> DeviceResult<Self> {
        let current = backend.current_device();
        if current == target {
            return Ok(Self {
                backend,
                previous: None,
            });
        }
        checked(backend.set_device(target))?;
        Ok(Self {
            backend,
            previous: Some(current),
        })
    }

    /// Whether entering actually changed the device.
    #[must_use]
    pub fn switched(&self) -> bool {
        self.previous.is_some()
    }

    /// Switches back now.
    pub fn restore(mut self) -> DeviceResult<()> {
        match self.previous.take() {
            Some(previous) => checked(self.backend.set_device(previous)),
            None => Ok(()),
        }
    }
}

impl Drop for DeviceSwitch {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            if let Err(err) = self.backend.set_device(previous) {
                tracing::error!(%err, "failed to restore device {previous}");
            }
        }
    }
}
