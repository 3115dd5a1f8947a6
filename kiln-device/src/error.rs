use thiserror::Error;

use crate::device::DevicePtr;

/// A failed host/device copy or an access through an invalid device address.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum TransferError {
    #[error("{len} bytes at {ptr} exceed the allocation of {allocation_len} bytes starting at {base}")]
    OutOfBounds {
        ptr: DevicePtr,
        len: usize,
        base: DevicePtr,
        allocation_len: usize,
    },
    #[error("{0} does not point into a live allocation")]
    InvalidAddress(DevicePtr),
    #[error("{0} points into an allocation that has already been freed")]
    UseAfterFree(DevicePtr),
    #[error("{ptr} belongs to device {actual}, expected device {expected}")]
    WrongDevice {
        ptr: DevicePtr,
        expected: u32,
        actual: u32,
    },
    #[error("{0} belongs to another device instance with the same ordinal")]
    OtherInstance(DevicePtr),
    #[error("host data for {name:?} has size {actual}, expected {expected}")]
    SizeMismatch {
        name: String,
        expected: String,
        actual: String,
    },
}

/// Errors reported by the device, either immediately or at stream synchronization.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum DeviceError {
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },
    #[error("cannot free {0}, it is not the start of a live allocation")]
    InvalidFree(DevicePtr),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("kernel {kernel:?} failed: {reason}")]
    Kernel { kernel: String, reason: String },
    #[error("stream work panicked: {0}")]
    Panicked(String),
}
