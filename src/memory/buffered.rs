use super::allocator::Allocator;
use super::bin_cache::BinCache;
use super::division::{BinClass, DivisionPlan};
use super::error::{AllocError, FreeError, FreeResult, Result};
use super::record::{AllocationRecord, Attr};
use super::stats::{CacheCounters, CacheStats};
use crate::sync::{Mutex, lock};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

/// Configuration for [`MultiBinBufferedAllocator`]. All fields have sensible
/// defaults.
#[derive(Clone, Debug, Default)]
pub struct BufferedAllocatorConfig {
    /// Bin boundaries. Default: powers of two from 4 KiB to 1 GiB.
    pub division_plan: DivisionPlan,

    /// Reuse ceiling. When `Some(k)`, a cached record is reissued for a
    /// request of `size` bytes only if its real size is at most `k * size`.
    /// Default: `None` (any covering record in the bin is reused).
    pub excess_times: Option<usize>,
}

impl BufferedAllocatorConfig {
    /// Default configuration with the division plan taken from
    /// `BINBUF_DIVISION_PLAN_PATH` when set.
    ///
    /// # Errors
    ///
    /// See [`DivisionPlan::from_env`].
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            division_plan: DivisionPlan::from_env()?,
            ..Self::default()
        })
    }
}

/// Outcome of handing cached records back to the delegate.
#[derive(Default)]
struct Eviction {
    /// Real bytes the delegate accepted.
    freed: usize,
    /// First error the delegate reported.
    rejected: Option<AllocError>,
}

impl Eviction {
    fn into_result(self) -> Result<usize> {
        match self.rejected {
            Some(e) => Err(e),
            None => Ok(self.freed),
        }
    }
}

/// How a checked-out record must be handled when it comes back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    Zero,
    Binned(usize),
    Overflow,
}

struct State {
    cache: BinCache,
    /// Serial of every record currently held by a caller.
    outstanding: HashMap<u64, Route>,
}

/// Caching layer that keeps freed regions per size bin and reissues them
/// instead of calling the delegate again.
///
/// - Requests of zero bytes and requests at or above the last division plan
///   boundary go straight to the delegate in both directions.
/// - Other requests are served best-fit from their bin's cache, or from the
///   delegate on a miss. Freeing them parks the record in the bin cache.
/// - When the delegate reports [`AllocError::CapacityExhausted`] on a miss,
///   the whole cache is released to the delegate and the request is retried
///   exactly once.
///
/// One mutex guards the cache and the table of checked-out records. Delegate
/// allocations run outside it; cache evictions run inside it so no thread
/// sees a partly drained cache.
///
/// The allocator is `Sync` exactly when its delegate is. Wrap a
/// single-threaded delegate in a [`LockedAllocator`](crate::LockedAllocator)
/// to share it.
pub struct MultiBinBufferedAllocator<A: Allocator> {
    delegate: A,
    plan: DivisionPlan,
    excess_times: Option<usize>,
    state: Mutex<State>,
    counters: CacheCounters,
}

impl<A: Allocator> MultiBinBufferedAllocator<A> {
    /// Buffer `delegate` with the default configuration.
    pub fn new(delegate: A) -> Self {
        Self::build(delegate, BufferedAllocatorConfig::default())
    }

    /// Buffer `delegate` with a custom configuration.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidConfig`] when `excess_times` is `Some(0)`.
    pub fn with_config(delegate: A, config: BufferedAllocatorConfig) -> Result<Self> {
        if config.excess_times == Some(0) {
            return Err(AllocError::InvalidConfig(
                "excess_times must be at least 1".into(),
            ));
        }
        Ok(Self::build(delegate, config))
    }

    /// Buffer `delegate` with the given bin boundaries.
    pub fn with_division_plan(delegate: A, division_plan: DivisionPlan) -> Self {
        Self::build(
            delegate,
            BufferedAllocatorConfig {
                division_plan,
                ..BufferedAllocatorConfig::default()
            },
        )
    }

    fn build(delegate: A, config: BufferedAllocatorConfig) -> Self {
        let cache = BinCache::new(config.division_plan.len());
        Self {
            delegate,
            plan: config.division_plan,
            excess_times: config.excess_times,
            state: Mutex::new(State {
                cache,
                outstanding: HashMap::new(),
            }),
            counters: CacheCounters::default(),
        }
    }

    /// Allocate at least `size` bytes.
    ///
    /// # Errors
    ///
    /// Whatever the delegate reports. Capacity exhaustion on a cache miss is
    /// surfaced only after eviction and one retry also failed.
    pub fn allocate(&self, size: usize, attr: Attr) -> Result<AllocationRecord> {
        if size == 0 {
            let record = self.delegate.allocate(0, attr)?;
            self.check_out(&record, Route::Zero);
            return Ok(record);
        }

        let bin = match self.plan.bin_of(size) {
            BinClass::Bin(bin) => bin,
            BinClass::Overflow => {
                let record = self.delegate.allocate(size, attr)?;
                self.check_out(&record, Route::Overflow);
                return Ok(record);
            }
        };

        let max = self.reuse_ceiling(size);
        {
            let mut state = lock(&self.state);
            if let Some(record) = state.cache.take_best_fit(bin, size, max) {
                state.outstanding.insert(record.serial(), Route::Binned(bin));
                drop(state);
                self.counters.hits.add(1);
                tracing::trace!(size, bin, real = record.size(), "cache hit");
                return Ok(record);
            }
        }

        self.counters.misses.add(1);
        tracing::trace!(size, bin, "cache miss");
        let record = match self.delegate.allocate(size, attr) {
            Ok(record) => record,
            Err(e) if e.is_capacity_exhausted() => self.recover(size, attr, &e)?,
            Err(e) => return Err(e),
        };
        self.check_out(&record, Route::Binned(bin));
        Ok(record)
    }

    /// Return a record obtained from [`allocate`](Self::allocate).
    ///
    /// Binned records are kept for reuse; zero-size and overflow records are
    /// released to the delegate immediately.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidArgument`] if the record is not currently checked
    /// out from this allocator (never issued here, or already freed). The
    /// cache is left untouched. Delegate errors on the immediate path are
    /// passed through, and the record stays checked out. In every case the
    /// record comes back inside the [`FreeError`].
    pub fn free(&self, record: AllocationRecord) -> FreeResult {
        let mut state = lock(&self.state);
        let serial = record.serial();
        match state.outstanding.remove(&serial) {
            Some(Route::Binned(bin)) => {
                state.cache.insert(bin, record);
                Ok(())
            }
            Some(route @ (Route::Zero | Route::Overflow)) => {
                drop(state);
                self.delegate.free(record).inspect_err(|_| {
                    lock(&self.state).outstanding.insert(serial, route);
                })
            }
            None => Err(FreeError::foreign(record)),
        }
    }

    /// Release every cached record to the delegate.
    ///
    /// Returns the sum of the released records' real sizes.
    ///
    /// # Errors
    ///
    /// The first error the delegate reported while freeing. The cache is
    /// empty afterwards regardless; rejected records are logged and dropped.
    pub fn clear_cache(&self) -> Result<usize> {
        self.evict_all().into_result()
    }

    /// Release cached records, largest first, until at most `target` bytes
    /// remain cached. Returns the bytes released.
    ///
    /// # Errors
    ///
    /// As for [`clear_cache`](Self::clear_cache).
    pub fn trim_cache(&self, target: usize) -> Result<usize> {
        let mut state = lock(&self.state);
        let records = state.cache.drain_to(target);
        let eviction = self.release(records);
        drop(state);
        eviction.into_result()
    }

    /// Allocate a region that is freed back through this allocator when the
    /// returned guard is dropped.
    ///
    /// # Errors
    ///
    /// As for [`allocate`](Self::allocate).
    pub fn allocate_scoped(&self, size: usize, attr: Attr) -> Result<AllocationGuard<'_, A>> {
        Ok(AllocationGuard {
            record: Some(self.allocate(size, attr)?),
            owner: self,
        })
    }

    /// Whether the delegate may be called concurrently.
    pub fn is_thread_safe(&self) -> bool {
        self.delegate.is_thread_safe()
    }

    #[inline]
    pub fn division_plan(&self) -> &DivisionPlan {
        &self.plan
    }

    #[inline]
    pub fn delegate(&self) -> &A {
        &self.delegate
    }

    pub fn cached_bytes(&self) -> usize {
        lock(&self.state).cache.cached_bytes()
    }

    /// Records currently held by callers.
    pub fn outstanding(&self) -> usize {
        lock(&self.state).outstanding.len()
    }

    pub fn stats(&self) -> CacheStats {
        let (cached_bytes, cached_records) = {
            let state = lock(&self.state);
            (state.cache.cached_bytes(), state.cache.cached_records())
        };
        CacheStats {
            hits: self.counters.hits.get(),
            misses: self.counters.misses.get(),
            recoveries: self.counters.recoveries.get(),
            failed_recoveries: self.counters.failed_recoveries.get(),
            cached_bytes,
            cached_records,
        }
    }

    fn reuse_ceiling(&self, size: usize) -> usize {
        self.excess_times
            .map_or(usize::MAX, |k| size.saturating_mul(k))
    }

    fn check_out(&self, record: &AllocationRecord, route: Route) {
        let previous = lock(&self.state).outstanding.insert(record.serial(), route);
        debug_assert!(
            previous.is_none(),
            "delegate issued record #{} twice",
            record.serial()
        );
    }

    /// Evict everything, then retry the delegate once. Rejected evictions
    /// are logged by `release` and do not prevent the retry.
    fn recover(&self, size: usize, attr: Attr, cause: &AllocError) -> Result<AllocationRecord> {
        self.counters.recoveries.add(1);
        let Eviction { freed, rejected } = self.evict_all();
        tracing::debug!(
            size,
            freed,
            rejected = rejected.is_some(),
            %cause,
            "delegate exhausted, evicted cache and retrying"
        );

        self.delegate.allocate(size, attr).inspect_err(|e| {
            self.counters.failed_recoveries.add(1);
            tracing::warn!(size, freed, error = %e, "allocation failed after cache eviction");
        })
    }

    /// Drain the whole cache into the delegate under the state lock.
    fn evict_all(&self) -> Eviction {
        let mut state = lock(&self.state);
        let records = state.cache.drain_all();
        // The lock stays held until the delegate has every record back.
        let eviction = self.release(records);
        drop(state);
        eviction
    }

    /// Hand `records` to the delegate. Caller holds the state lock.
    fn release(&self, records: Vec<AllocationRecord>) -> Eviction {
        let count = records.len();
        let mut eviction = Eviction::default();
        for record in records {
            let size = record.size();
            match self.delegate.free(record) {
                Ok(()) => eviction.freed += size,
                Err(FreeError { error, record }) => {
                    tracing::error!(
                        serial = record.serial(),
                        size,
                        %error,
                        "delegate rejected cached record"
                    );
                    // Leaked: the cache no longer tracks it.
                    drop(record);
                    eviction.rejected.get_or_insert(error);
                }
            }
        }
        if count > 0 {
            tracing::debug!(count, freed = eviction.freed, "released cached records");
        }
        eviction
    }
}

impl<A: Allocator> Allocator for MultiBinBufferedAllocator<A> {
    fn allocate(&self, size: usize, attr: Attr) -> Result<AllocationRecord> {
        MultiBinBufferedAllocator::allocate(self, size, attr)
    }

    fn free(&self, record: AllocationRecord) -> FreeResult {
        MultiBinBufferedAllocator::free(self, record)
    }

    fn is_thread_safe(&self) -> bool {
        MultiBinBufferedAllocator::is_thread_safe(self)
    }
}

impl<A: Allocator> Drop for MultiBinBufferedAllocator<A> {
    fn drop(&mut self) {
        if let Err(e) = self.clear_cache() {
            tracing::error!(error = %e, "failed to release cache on drop");
        }
    }
}

/// A checked-out record that frees itself through its allocator on drop.
pub struct AllocationGuard<'a, A: Allocator> {
    record: Option<AllocationRecord>,
    owner: &'a MultiBinBufferedAllocator<A>,
}

impl<A: Allocator> AllocationGuard<'_, A> {
    /// Take the record out; the caller becomes responsible for freeing it.
    pub fn into_record(mut self) -> AllocationRecord {
        match self.record.take() {
            Some(record) => record,
            None => unreachable!("guard record taken twice"),
        }
    }
}

impl<A: Allocator> Deref for AllocationGuard<'_, A> {
    type Target = AllocationRecord;

    fn deref(&self) -> &AllocationRecord {
        match &self.record {
            Some(record) => record,
            None => unreachable!("guard used after into_record"),
        }
    }
}

impl<A: Allocator> DerefMut for AllocationGuard<'_, A> {
    fn deref_mut(&mut self) -> &mut AllocationRecord {
        match &mut self.record {
            Some(record) => record,
            None => unreachable!("guard used after into_record"),
        }
    }
}

impl<A: Allocator> Drop for AllocationGuard<'_, A> {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            if let Err(FreeError { error, record }) = self.owner.free(record) {
                tracing::error!(
                    serial = record.serial(),
                    %error,
                    "scoped allocation failed to free"
                );
            }
        }
    }
}
