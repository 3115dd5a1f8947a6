use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{DeviceError, TransferError};

/// Start of the address range handed out by each device, so that null and small integers are never valid.
const ADDRESS_BASE: u64 = 0x1_0000_0000;
/// Allocations are aligned to this many bytes.
pub const ALLOCATION_ALIGNMENT: usize = 256;
/// With validation on, at most this many freed allocations are remembered. Older ones report as invalid addresses.
pub const FREED_HISTORY: usize = 4096;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DeviceConfig {
    /// Total amount of device memory.
    pub capacity_bytes: usize,
    /// Remember freed allocations so that accesses through them are reported as use-after-free.
    pub validation: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            capacity_bytes: 4 << 30,
            validation: cfg!(debug_assertions),
        }
    }
}

/// Handle to a simulated accelerator.
///
/// Device memory lives in its own address space: host code only ever sees [DevicePtr] addresses and moves data
/// with explicit copies. Cloning the handle does not create a new device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    ordinal: u32,
    /// Distinguishes devices created with the same ordinal, their address ranges overlap.
    instance: u64,
    config: DeviceConfig,
    memory: Mutex<MemoryTable>,
}

#[derive(Default)]
struct MemoryTable {
    live: BTreeMap<u64, Vec<u8>>,
    freed: BTreeMap<u64, usize>,
    next_address: u64,
    used_bytes: usize,
}

/// A raw device address. Does not keep the underlying allocation alive.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DevicePtr {
    device: u32,
    instance: u64,
    address: u64,
}

/// An owned device allocation, freed when dropped.
pub struct DeviceBuffer {
    device: Device,
    ptr: DevicePtr,
    len_bytes: usize,
    owned: bool,
}

impl DevicePtr {
    pub fn device(self) -> u32 {
        self.device
    }

    pub fn address(self) -> u64 {
        self.address
    }

    pub fn offset_bytes(self, offset: usize) -> DevicePtr {
        DevicePtr {
            address: self.address + offset as u64,
            ..self
        }
    }
}

impl Debug for DevicePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DevicePtr({})", self)
    }
}

impl Display for DevicePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev{}:{:#x}", self.device, self.address)
    }
}

/// Where an address range ended up after looking it up in the memory table.
enum Lookup {
    Live { base: u64 },
    Freed,
    Unknown,
}

impl MemoryTable {
    fn lookup(&self, address: u64) -> Lookup {
        if let Some((&base, data)) = self.live.range(..=address).next_back() {
            if address < base + data.len().max(1) as u64 {
                return Lookup::Live { base };
            }
        }
        if let Some((&base, &len)) = self.freed.range(..=address).next_back() {
            if address < base + len.max(1) as u64 {
                return Lookup::Freed;
            }
        }
        Lookup::Unknown
    }

    /// Resolve `len` bytes starting at `ptr` to the owning allocation and the offset within it.
    fn resolve(&self, ptr: DevicePtr, len: usize) -> Result<(u64, usize), TransferError> {
        match self.lookup(ptr.address) {
            Lookup::Live { base } => {
                let allocation_len = self.live[&base].len();
                let offset = (ptr.address - base) as usize;
                if offset + len > allocation_len {
                    return Err(TransferError::OutOfBounds {
                        ptr,
                        len,
                        base: DevicePtr { address: base, ..ptr },
                        allocation_len,
                    });
                }
                Ok((base, offset))
            }
            Lookup::Freed => Err(TransferError::UseAfterFree(ptr)),
            Lookup::Unknown => Err(TransferError::InvalidAddress(ptr)),
        }
    }
}

impl Device {
    pub fn new(ordinal: u32) -> Device {
        Device::with_config(ordinal, DeviceConfig::default())
    }

    pub fn with_config(ordinal: u32, config: DeviceConfig) -> Device {
        tracing::debug!(
            "Creating device {} with {} bytes of memory, validation={}",
            ordinal,
            config.capacity_bytes,
            config.validation
        );
        let memory = MemoryTable {
            next_address: ADDRESS_BASE,
            ..MemoryTable::default()
        };
        Device {
            inner: Arc::new(DeviceInner {
                ordinal,
                instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
                config,
                memory: Mutex::new(memory),
            }),
        }
    }

    pub fn ordinal(&self) -> u32 {
        self.inner.ordinal
    }

    pub fn config(&self) -> DeviceConfig {
        self.inner.config
    }

    pub fn name(&self) -> String {
        format!("kiln simulated device {}", self.inner.ordinal)
    }

    /// Whether both handles refer to the same device instance.
    pub fn same_device(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn memory(&self) -> MutexGuard<MemoryTable> {
        self.inner.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn used_bytes(&self) -> usize {
        self.memory().used_bytes
    }

    pub fn live_allocations(&self) -> usize {
        self.memory().live.len()
    }

    fn check_device(&self, ptr: DevicePtr) -> Result<(), TransferError> {
        if ptr.device != self.inner.ordinal {
            Err(TransferError::WrongDevice {
                ptr,
                expected: self.inner.ordinal,
                actual: ptr.device,
            })
        } else if ptr.instance != self.inner.instance {
            Err(TransferError::OtherInstance(ptr))
        } else {
            Ok(())
        }
    }

    /// Allocate `len_bytes` of zeroed device memory.
    pub fn alloc(&self, len_bytes: usize) -> Result<DeviceBuffer, DeviceError> {
        let ptr = self.alloc_raw(len_bytes)?;
        Ok(DeviceBuffer {
            device: self.clone(),
            ptr,
            len_bytes,
            owned: true,
        })
    }

    fn alloc_raw(&self, len_bytes: usize) -> Result<DevicePtr, DeviceError> {
        let mut memory = self.memory();

        let available = self.inner.config.capacity_bytes - memory.used_bytes;
        if len_bytes > available {
            return Err(DeviceError::OutOfMemory {
                requested: len_bytes,
                available,
            });
        }

        let address = memory.next_address;
        // addresses are never reused, zero-sized allocations still get a unique address
        let reserved = (len_bytes.max(1) + ALLOCATION_ALIGNMENT - 1) / ALLOCATION_ALIGNMENT * ALLOCATION_ALIGNMENT;
        memory.next_address += reserved as u64;
        memory.used_bytes += len_bytes;
        memory.live.insert(address, vec![0; len_bytes]);

        let ptr = DevicePtr {
            device: self.inner.ordinal,
            instance: self.inner.instance,
            address,
        };
        tracing::trace!("Allocated {} bytes at {}", len_bytes, ptr);
        Ok(ptr)
    }

    /// Free the allocation starting at `ptr`.
    pub fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        if self.check_device(ptr).is_err() {
            return Err(DeviceError::InvalidFree(ptr));
        }

        let mut memory = self.memory();
        let data = memory.live.remove(&ptr.address).ok_or(DeviceError::InvalidFree(ptr))?;
        memory.used_bytes -= data.len();
        if self.inner.config.validation {
            memory.freed.insert(ptr.address, data.len());
            // addresses only grow, so the first entry is the oldest free
            if memory.freed.len() > FREED_HISTORY {
                memory.freed.pop_first();
            }
        }

        tracing::trace!("Freed {} bytes at {}", data.len(), ptr);
        Ok(())
    }

    /// Check that `len` bytes starting at `ptr` lie within a single live allocation.
    pub fn check_range(&self, ptr: DevicePtr, len: usize) -> Result<(), TransferError> {
        self.check_device(ptr)?;
        self.memory().resolve(ptr, len).map(|_| ())
    }

    pub fn copy_host_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<(), TransferError> {
        self.check_device(dst)?;
        let mut memory = self.memory();
        let (base, offset) = memory.resolve(dst, src.len())?;
        let data = memory.live.get_mut(&base).expect("resolved allocation is live");
        data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    pub fn copy_device_to_host(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), TransferError> {
        self.check_device(src)?;
        let memory = self.memory();
        let (base, offset) = memory.resolve(src, dst.len())?;
        dst.copy_from_slice(&memory.live[&base][offset..offset + dst.len()]);
        Ok(())
    }

    pub fn copy_device_to_device(&self, dst: DevicePtr, src: DevicePtr, len: usize) -> Result<(), TransferError> {
        self.check_device(dst)?;
        self.check_device(src)?;
        let mut memory = self.memory();
        let (src_base, src_offset) = memory.resolve(src, len)?;
        let (dst_base, dst_offset) = memory.resolve(dst, len)?;

        let bytes = memory.live[&src_base][src_offset..src_offset + len].to_vec();
        let data = memory.live.get_mut(&dst_base).expect("resolved allocation is live");
        data[dst_offset..dst_offset + len].copy_from_slice(&bytes);
        Ok(())
    }

    /// Read `len` bytes into a new vector.
    pub fn read(&self, src: DevicePtr, len: usize) -> Result<Vec<u8>, TransferError> {
        let mut result = vec![0; len];
        self.copy_device_to_host(&mut result, src)?;
        Ok(result)
    }
}

impl Debug for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("ordinal", &self.inner.ordinal)
            .field("config", &self.inner.config)
            .field("used_bytes", &self.used_bytes())
            .finish()
    }
}

impl DeviceBuffer {
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn len_bytes(&self) -> usize {
        self.len_bytes
    }

    pub fn copy_from_host(&self, src: &[u8]) -> Result<(), TransferError> {
        self.device.copy_host_to_device(self.ptr, src)
    }

    pub fn copy_to_host(&self, dst: &mut [u8]) -> Result<(), TransferError> {
        self.device.copy_device_to_host(dst, self.ptr)
    }

    pub fn free(mut self) -> Result<(), DeviceError> {
        self.owned = false;
        self.device.free(self.ptr)
    }

    /// Give up ownership, the allocation must be released with [Device::free].
    pub fn into_raw(mut self) -> DevicePtr {
        self.owned = false;
        self.ptr
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if self.owned {
            if let Err(e) = self.device.free(self.ptr) {
                tracing::warn!("Failed to free device buffer on drop: {}", e);
            }
        }
    }
}

impl Debug for DeviceBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("len_bytes", &self.len_bytes)
            .finish()
    }
}
