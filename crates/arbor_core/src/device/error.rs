//! # Device Error Types
//!
//! Every device failure carries a code and the source location that issued
//! the failing call, so a fatal report reads like
//! `src/array/device_host_array.rs(212) : device runtime API error 2: MemoryAllocation. ...`

use std::fmt;
use std::panic::Location;

/// Device runtime error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DeviceErrorCode {
    /// An argument was out of range.
    InvalidValue = 1,
    /// The device (or host) ran out of memory.
    MemoryAllocation = 2,
    /// The requested device does not exist.
    InvalidDevice = 10,
    /// Mapping a graphics resource failed.
    MapBufferObjectFailed = 14,
    /// Unmapping a graphics resource failed.
    UnmapBufferObjectFailed = 15,
    /// The pointer does not name a live device allocation.
    InvalidDevicePointer = 17,
    /// The graphics buffer handle is unknown or in the wrong state.
    InvalidResourceHandle = 33,
    /// The resource is already mapped.
    AlreadyMapped = 208,
    /// The resource is not mapped.
    NotMapped = 211,
    /// The backend cannot perform this operation.
    NotSupported = 801,
    /// Any other backend failure.
    Unknown = 999,
}

impl DeviceErrorCode {
    /// Numeric value of the code.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

/// A failed device operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceError {
    /// Error code.
    pub code: DeviceErrorCode,
    /// Human readable detail.
    pub message: String,
    /// Source file of the failing call.
    pub file: &'static str,
    /// Source line of the failing call.
    pub line: u32,
}

impl DeviceError {
    /// Creates an error stamped with the caller's location.
    #[track_caller]
    pub fn new(code: DeviceErrorCode, message: impl Into<String>) -> Self {
        let location = Location::caller();
        Self {
            code,
            message: message.into(),
            file: location.file(),
            line: location.line(),
        }
    }

    /// Re-stamps the error with the caller's location.
    #[track_caller]
    #[must_use]
    pub fn relocate(mut self) -> Self {
        let location = Location::caller();
        self.file = location.file();
        self.line = location.line();
        self
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}) : device runtime API error {}: {:?}. {}",
            self.file,
            self.line,
            self.code.as_i32(),
            self.code,
            self.message
        )
    }
}

impl std::error::Error for DeviceError {}

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Passes a result through, stamping any error with the caller's location.
///
/// Wrap every backend call with this so the report names the call site, not
/// the backend internals.
#[track_caller]
pub fn checked<T>(result: DeviceResult<T>) -> DeviceResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(err) => Err(err.relocate()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_reports_location_and_code() {
        let err = DeviceError::new(DeviceErrorCode::MemoryAllocation, "out of memory");
        let text = err.to_string();
        assert!(text.contains("error.rs("));
        assert!(text.contains("device runtime API error 2"));
        assert!(text.contains("out of memory"));
    }

    #[test]
    fn test_checked_restamps_location() {
        let original = DeviceError::new(DeviceErrorCode::InvalidValue, "bad");
        let line = original.line;
        let restamped = checked::<()>(Err(original)).unwrap_err();
        assert_ne!(restamped.line, line);
    }
}
