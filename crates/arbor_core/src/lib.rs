//! # ARBOR Core Runtime
//!
//! Device-facing building blocks of the simulator:
//! - Owned host/device arrays with optional interop and double buffering
//! - A pluggable device backend (host emulation, optional wgpu)
//! - The single-slot handoff between the physics loop and the writer
//! - Process groups for multi-rank runs
//!
//! ## Example
//!
//! ```rust,ignore
//! use arbor_core::{AllocOptions, DeviceContext, DeviceHostArray, DeviceId, EmulatedDevice};
//! use std::sync::Arc;
//!
//! let ctx = DeviceContext::new(Arc::new(EmulatedDevice::new(1)), DeviceId(0));
//! let mut positions = DeviceHostArray::<arbor_shared::Real4>::new(ctx);
//! positions.alloc(1 << 20, AllocOptions::PLAIN.double_buffer(true))?;
//! positions.upload()?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod array;
pub mod device;
pub mod group;
pub mod memory;
pub mod sync;

pub use array::{AllocOptions, DeviceHostArray};
pub use device::{
    checked, BufferTarget, DeviceBackend, DeviceContext, DeviceError, DeviceErrorCode, DeviceId,
    DevicePtr, DeviceResult, DeviceSwitch, Direction, EmulatedDevice, GraphicsBuffer,
};
#[cfg(feature = "wgpu")]
pub use device::WgpuDevice;
pub use group::{GroupError, GroupResult, LocalGroup, ProcessGroup, SoloGroup, Tag};
pub use memory::{MemoryTracker, MemoryUsage};
pub use sync::{handoff_slot, HandoffStats, SlotConsumer, SlotProducer, StageError, Staged, TakeError};
