use super::allocator::Allocator;
use super::error::{AllocError, FreeError, FreeResult, Result};
use super::record::{AllocationRecord, Attr, Place};
use super::stats;
use super::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::{Mutex, lock};
use std::collections::HashMap;

/// Raw OS memory source: one private anonymous mapping per request.
///
/// Sizes are rounded up to whole pages for the mapping, but records report
/// the requested size. Every call is a syscall, which is what the buffered
/// layer exists to avoid; this is the bottom of the stack, not something to
/// hammer directly.
///
/// Thread-safe. The live table is keyed by record serial and stores the
/// mapped length needed to unmap.
pub struct SystemAllocator {
    place: Place,
    /// Serial → mapped (page-rounded) size.
    live: Mutex<HashMap<u64, usize>>,
}

impl Default for SystemAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::with_place(Place::Host)
    }

    /// Tag every produced record with `place`.
    #[must_use]
    pub fn with_place(place: Place) -> Self {
        Self {
            place,
            live: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn page_size() -> usize {
        PlatformVmOps::page_size()
    }

    /// Records produced and not yet freed.
    #[must_use]
    pub fn live_records(&self) -> usize {
        lock(&self.live).len()
    }

    fn map(size: usize) -> std::result::Result<(std::ptr::NonNull<u8>, usize), VmError> {
        let page_size = PlatformVmOps::page_size();
        let mapped = size.checked_next_multiple_of(page_size).ok_or_else(|| {
            VmError::ReservationFailed(std::io::ErrorKind::OutOfMemory.into())
        })?;
        // Safety: FFI calls to reserve and commit memory; a failed commit
        // releases the fresh reservation.
        unsafe {
            let ptr = PlatformVmOps::reserve(mapped)?;
            if let Err(e) = PlatformVmOps::commit(ptr, mapped) {
                let _ = PlatformVmOps::release(ptr, mapped);
                return Err(e);
            }
            Ok((ptr, mapped))
        }
    }
}

impl Allocator for SystemAllocator {
    fn allocate(&self, size: usize, _attr: Attr) -> Result<AllocationRecord> {
        if size == 0 {
            // Safety: null records carry no region.
            let record = unsafe { AllocationRecord::new(None, 0, self.place) };
            lock(&self.live).insert(record.serial(), 0);
            return Ok(record);
        }

        let (ptr, mapped) = Self::map(size).map_err(|e| {
            if e.is_exhaustion() {
                AllocError::CapacityExhausted {
                    requested: size,
                    available: 0,
                }
            } else {
                AllocError::Vm(e)
            }
        })?;

        stats::SYSTEM_RESERVED.add(mapped);
        stats::SYSTEM_LIVE.add(size);
        // Safety: `ptr` is a fresh committed mapping of `mapped >= size` bytes,
        // unmapped only by `free`.
        let record = unsafe { AllocationRecord::new(Some(ptr), size, self.place) };
        lock(&self.live).insert(record.serial(), mapped);
        Ok(record)
    }

    fn free(&self, record: AllocationRecord) -> FreeResult {
        let Some(mapped) = lock(&self.live).remove(&record.serial()) else {
            return Err(FreeError::foreign(record));
        };
        let Some(ptr) = record.as_non_null() else {
            return Ok(());
        };

        // Safety: `ptr`/`mapped` describe a mapping created by `allocate`.
        if let Err(e) = unsafe { PlatformVmOps::release(ptr, mapped) } {
            // Still mapped: keep it tracked and hand it back.
            lock(&self.live).insert(record.serial(), mapped);
            return Err(FreeError::new(e.into(), record));
        }
        stats::SYSTEM_RESERVED.sub(mapped);
        stats::SYSTEM_LIVE.sub(record.size());
        Ok(())
    }

    fn is_thread_safe(&self) -> bool {
        true
    }
}
