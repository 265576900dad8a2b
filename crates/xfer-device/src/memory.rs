//! Device memory.
//!
//! Each device owns a private address window. Allocations are carved from the window with a
//! monotonic cursor, so a freed address is never handed out again and a stale or foreign
//! [`DevicePtr`] always fails to resolve instead of aliasing newer data.
//!
//! Queued copies resolve their device range when they are *issued* and hold the backing region
//! alive until they execute, so dropping a [`DeviceAllocation`] with copies in flight is memory
//! safe (the bytes simply stop being reachable through the allocator).

use std::collections::BTreeMap;
use std::fmt;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{DeviceError, Result};
use crate::{DeviceId, DevicePtr};

/// Alignment of every allocation's base address.
pub const ALLOCATION_ALIGNMENT: u64 = 256;

/// Each device gets a 1 TiB address window; window 0 is left unused so `DevicePtr::NULL` and
/// small integers never resolve.
const WINDOW_SHIFT: u32 = 40;
const WINDOW_SIZE: u64 = 1 << WINDOW_SHIFT;

/// Round `value` up to the nearest multiple of `alignment` (`alignment` must be > 0).
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    let add = alignment - 1;
    match value.checked_add(add) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

pub(crate) struct Region {
    base: u64,
    len: usize,
    bytes: Mutex<Box<[u8]>>,
}

impl Region {
    fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        match self.bytes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// # Safety
    ///
    /// `dst` must be valid for `len` byte writes and `offset + len <= self.len`.
    pub(crate) unsafe fn copy_to_host(&self, offset: usize, dst: *mut u8, len: usize) {
        debug_assert!(offset + len <= self.len);
        let bytes = self.lock();
        // SAFETY: bounds checked at resolve time; `dst` validity is the caller's contract.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr().add(offset), dst, len) };
    }

    /// # Safety
    ///
    /// `src` must be valid for `len` byte reads and `offset + len <= self.len`.
    pub(crate) unsafe fn copy_from_host(&self, offset: usize, src: *const u8, len: usize) {
        debug_assert!(offset + len <= self.len);
        let mut bytes = self.lock();
        // SAFETY: as above.
        unsafe { ptr::copy_nonoverlapping(src, bytes.as_mut_ptr().add(offset), len) };
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        dst.copy_from_slice(&self.lock()[offset..offset + dst.len()]);
    }

    fn write(&self, offset: usize, src: &[u8]) {
        self.lock()[offset..offset + src.len()].copy_from_slice(src);
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("base", &format_args!("0x{:x}", self.base))
            .field("len", &self.len)
            .finish()
    }
}

#[derive(Debug)]
struct MemoryState {
    cursor: u64,
    used: u64,
    regions: BTreeMap<u64, Arc<Region>>,
}

/// The memory of one device.
pub struct DeviceMemory {
    device: DeviceId,
    capacity: u64,
    window_base: u64,
    state: Mutex<MemoryState>,
}

impl DeviceMemory {
    pub(crate) fn new(device: DeviceId, window: u32, capacity: u64) -> Self {
        let window_base = (u64::from(window) + 1) << WINDOW_SHIFT;
        Self {
            device,
            capacity,
            window_base,
            state: Mutex::new(MemoryState {
                cursor: window_base,
                used: 0,
                regions: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used_bytes(&self) -> u64 {
        self.lock().used
    }

    pub fn live_allocations(&self) -> usize {
        self.lock().regions.len()
    }

    /// Allocate `len` zero-filled bytes.
    pub fn allocate(self: &Arc<Self>, len: u64) -> Result<DeviceAllocation> {
        if len == 0 {
            return Err(DeviceError::ZeroSizedAllocation(self.device));
        }

        let mut state = self.lock();
        let available = self.capacity.saturating_sub(state.used);
        let out_of_memory = DeviceError::OutOfMemory {
            device: self.device,
            requested: len,
            available,
        };
        if len > available {
            return Err(out_of_memory);
        }
        let Ok(len_usize) = usize::try_from(len) else {
            return Err(out_of_memory);
        };

        let base = align_up(state.cursor, ALLOCATION_ALIGNMENT);
        let end = match base.checked_add(len) {
            Some(end) if end <= self.window_base.saturating_add(WINDOW_SIZE) => end,
            _ => return Err(out_of_memory),
        };

        let mut bytes = Vec::new();
        if bytes.try_reserve_exact(len_usize).is_err() {
            return Err(out_of_memory);
        }
        bytes.resize(len_usize, 0u8);

        state.cursor = end;
        state.used += len;
        state.regions.insert(
            base,
            Arc::new(Region {
                base,
                len: len_usize,
                bytes: Mutex::new(bytes.into_boxed_slice()),
            }),
        );

        Ok(DeviceAllocation {
            memory: Arc::clone(self),
            ptr: DevicePtr::from_addr(base),
            len,
        })
    }

    fn release(&self, ptr: DevicePtr, len: u64) {
        let mut state = self.lock();
        if state.regions.remove(&ptr.addr()).is_some() {
            state.used -= len;
        }
    }

    /// Resolve `[ptr, ptr + len)` to the live region that contains it and the offset into it.
    pub(crate) fn resolve(&self, ptr: DevicePtr, len: usize) -> Result<(Arc<Region>, usize)> {
        let invalid = || DeviceError::InvalidAddress {
            device: self.device,
            ptr,
            len,
        };

        let state = self.lock();
        let (base, region) = state
            .regions
            .range(..=ptr.addr())
            .next_back()
            .ok_or_else(invalid)?;
        let offset = ptr.addr() - base;
        let end = offset.checked_add(len as u64).ok_or_else(invalid)?;
        if end > region.len as u64 {
            return Err(invalid());
        }
        Ok((Arc::clone(region), offset as usize))
    }

    /// Synchronously read device memory, bypassing every queue.
    pub fn read(&self, ptr: DevicePtr, dst: &mut [u8]) -> Result<()> {
        let (region, offset) = self.resolve(ptr, dst.len())?;
        region.read(offset, dst);
        Ok(())
    }

    /// Synchronously write device memory, bypassing every queue.
    pub fn write(&self, ptr: DevicePtr, src: &[u8]) -> Result<()> {
        let (region, offset) = self.resolve(ptr, src.len())?;
        region.write(offset, src);
        Ok(())
    }
}

impl fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("DeviceMemory")
            .field("device", &self.device)
            .field("capacity", &self.capacity)
            .field("used", &state.used)
            .field("allocations", &state.regions.len())
            .finish()
    }
}

/// A live device allocation; the memory is released when this is dropped.
pub struct DeviceAllocation {
    memory: Arc<DeviceMemory>,
    ptr: DevicePtr,
    len: u64,
}

impl DeviceAllocation {
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn device(&self) -> DeviceId {
        self.memory.device
    }

    /// Read from `offset` bytes into the allocation.
    pub fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.memory.read(self.ptr.byte_add(offset), dst)
    }

    /// Write at `offset` bytes into the allocation.
    pub fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        self.memory.write(self.ptr.byte_add(offset), src)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.len as usize];
        self.read(0, &mut out)?;
        Ok(out)
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        self.memory.release(self.ptr, self.len);
    }
}

impl fmt::Debug for DeviceAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAllocation")
            .field("device", &self.memory.device)
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}
