//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., reserved may briefly disagree with live).
//! This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

// Address space reserved by `SystemAllocator` (page-rounded).
crate::sync::static_atomic! {
    pub static SYSTEM_RESERVED: Counter = Counter::new();
}
// Bytes handed out by `SystemAllocator` and not yet freed (requested sizes).
crate::sync::static_atomic! {
    pub static SYSTEM_LIVE: Counter = Counter::new();
}
// Bytes parked in the bin caches of every buffered allocator in the process.
crate::sync::static_atomic! {
    pub static BUFFERED_CACHED: Counter = Counter::new();
}

/// Process-wide snapshot of the diagnostic gauges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub system_reserved: usize,
    pub system_live: usize,
    pub buffered_cached: usize,
}

#[must_use]
pub fn memory_stats() -> MemoryStats {
    MemoryStats {
        system_reserved: SYSTEM_RESERVED.load(Ordering::Relaxed),
        system_live: SYSTEM_LIVE.load(Ordering::Relaxed),
        buffered_cached: BUFFERED_CACHED.load(Ordering::Relaxed),
    }
}

/// Per-instance counters of a `MultiBinBufferedAllocator`.
#[derive(Default)]
pub(crate) struct CacheCounters {
    pub hits: Counter,
    pub misses: Counter,
    pub recoveries: Counter,
    pub failed_recoveries: Counter,
}

/// Snapshot returned by `MultiBinBufferedAllocator::stats`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Binned requests served from the cache.
    pub hits: usize,
    /// Binned requests that went to the delegate.
    pub misses: usize,
    /// Evict-and-retry sequences run after a delegate capacity failure.
    pub recoveries: usize,
    /// Recoveries whose retry still failed.
    pub failed_recoveries: usize,
    pub cached_bytes: usize,
    pub cached_records: usize,
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_clamps_negative() {
        let c = Counter::new();
        c.sub(5);
        assert_eq!(c.get(), 0);
        c.add(8);
        assert_eq!(c.get(), 3);
    }

    #[test]
    fn test_counter_huge_delta_does_not_wrap() {
        let c = Counter::new();
        c.add(usize::MAX);
        assert_eq!(c.get(), isize::MAX as usize);
    }
}
