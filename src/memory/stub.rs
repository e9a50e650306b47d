//! Counting heap-backed delegate used by tests.

use super::allocator::Allocator;
use super::error::{AllocError, FreeError, FreeResult, Result};
use super::record::{AllocationRecord, Attr, Place};
use super::vm::VmError;
use crate::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::sync::{Mutex, lock};
use std::alloc::Layout;
use std::collections::HashMap;
use std::ptr::NonNull;

const STUB_ALIGN: usize = 16;

struct Live {
    records: HashMap<u64, usize>,
    bytes: usize,
}

/// Delegate that counts every call and can enforce a byte budget.
pub(crate) struct StubAllocator {
    capacity: usize,
    live: Mutex<Live>,
    alloc_count: AtomicUsize,
    free_count: AtomicUsize,
    failed_count: AtomicUsize,
    thread_safe: AtomicBool,
    fail_next: AtomicBool,
    fail_next_free: AtomicBool,
}

impl StubAllocator {
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    /// Refuse with `CapacityExhausted` once live bytes would exceed
    /// `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            live: Mutex::new(Live {
                records: HashMap::new(),
                bytes: 0,
            }),
            alloc_count: AtomicUsize::new(0),
            free_count: AtomicUsize::new(0),
            failed_count: AtomicUsize::new(0),
            thread_safe: AtomicBool::new(true),
            fail_next: AtomicBool::new(false),
            fail_next_free: AtomicBool::new(false),
        }
    }

    pub fn reset_counters(&self) {
        self.alloc_count.store(0, Ordering::Relaxed);
        self.free_count.store(0, Ordering::Relaxed);
        self.failed_count.store(0, Ordering::Relaxed);
    }

    /// `allocate` calls, successful or not.
    pub fn alloc_count(&self) -> usize {
        self.alloc_count.load(Ordering::Relaxed)
    }

    /// Successful `free` calls; rejected ones are not counted.
    pub fn free_count(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    /// `allocate` calls refused for capacity.
    pub fn failed_count(&self) -> usize {
        self.failed_count.load(Ordering::Relaxed)
    }

    /// Records handed out and not yet freed.
    pub fn live(&self) -> usize {
        lock(&self.live).records.len()
    }

    pub fn set_thread_safe(&self, value: bool) {
        self.thread_safe.store(value, Ordering::Relaxed);
    }

    /// Make the next `allocate` fail with a VM error instead of serving it.
    pub fn fail_next_with_vm_error(&self) {
        self.fail_next.store(true, Ordering::Relaxed);
    }

    /// Make the next `free` fail with a VM error. The record stays live and
    /// comes back with the error.
    pub fn fail_next_free(&self) {
        self.fail_next_free.store(true, Ordering::Relaxed);
    }

    fn layout(size: usize) -> Layout {
        match Layout::from_size_align(size, STUB_ALIGN) {
            Ok(layout) => layout,
            Err(e) => panic!("stub layout for {size} bytes: {e}"),
        }
    }
}

impl Allocator for StubAllocator {
    fn allocate(&self, size: usize, _attr: Attr) -> Result<AllocationRecord> {
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        if self.fail_next.swap(false, Ordering::Relaxed) {
            return Err(AllocError::Vm(VmError::CommitFailed(std::io::Error::other(
                "injected failure",
            ))));
        }

        let mut live = lock(&self.live);
        if live.bytes.saturating_add(size) > self.capacity {
            self.failed_count.fetch_add(1, Ordering::Relaxed);
            return Err(AllocError::CapacityExhausted {
                requested: size,
                available: self.capacity - live.bytes,
            });
        }

        let ptr = if size == 0 {
            None
        } else {
            // Safety: non-zero size.
            let raw = unsafe { std::alloc::alloc_zeroed(Self::layout(size)) };
            Some(NonNull::new(raw).ok_or(AllocError::CapacityExhausted {
                requested: size,
                available: 0,
            })?)
        };
        // Safety: `ptr` is a fresh heap block of `size` bytes, freed only here.
        let record = unsafe { AllocationRecord::new(ptr, size, Place::Host) };
        live.records.insert(record.serial(), size);
        live.bytes += size;
        Ok(record)
    }

    fn free(&self, record: AllocationRecord) -> FreeResult {
        if self.fail_next_free.swap(false, Ordering::Relaxed) {
            let error = AllocError::Vm(VmError::ReleaseFailed(std::io::Error::other(
                "injected failure",
            )));
            return Err(FreeError::new(error, record));
        }

        let mut live = lock(&self.live);
        let Some(size) = live.records.remove(&record.serial()) else {
            return Err(FreeError::foreign(record));
        };
        live.bytes -= size;
        drop(live);

        if let Some(ptr) = record.as_non_null() {
            // Safety: allocated in `allocate` with the same layout.
            unsafe { std::alloc::dealloc(ptr.as_ptr(), Self::layout(size)) };
        }
        self.free_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn is_thread_safe(&self) -> bool {
        self.thread_safe.load(Ordering::Relaxed)
    }
}
