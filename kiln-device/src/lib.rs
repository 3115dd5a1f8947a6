#![warn(missing_debug_implementations)]
#![allow(clippy::new_without_default)]

//! A simulated accelerator for the Kiln inference engine.
//!
//! * [Device](device::Device) owns a device address space. Allocations are handed out as
//!   [DeviceBuffer](device::DeviceBuffer)s and addressed through [DevicePtr](device::DevicePtr)s.
//! * All data movement between host and device is explicit, see
//!   [Device::copy_host_to_device](device::Device::copy_host_to_device) and
//!   [Device::copy_device_to_host](device::Device::copy_device_to_host).
//! * [Stream](stream::Stream)s are ordered queues of asynchronous work, errors surface at synchronization.

/// Device handles, memory and copies.
pub mod device;
/// Device and transfer errors.
pub mod error;
/// Ordered asynchronous work queues.
pub mod stream;
