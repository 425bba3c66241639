//! # Host/Device Arrays
//!
//! A [`DeviceHostArray`] pairs a host mirror with one or two device buffers.
//!
//! ```text
//!            host: Vec<T>  (always `size` elements)
//!                 │  copy(HostToDevice) ▲ copy(DeviceToHost)
//!                 ▼                     │
//!   slots[read]  ◀── device_ptr()       │
//!   slots[write] ◀── device_write_ptr() (== read unless double-buffered)
//! ```
//!
//! With double buffering, [`DeviceHostArray::swap`] exchanges the read and
//! write indices. Slots are either plain device allocations or graphics
//! buffers registered for interop, which must be mapped to be reachable.

mod device_host_array;

pub use device_host_array::{AllocOptions, DeviceHostArray};
