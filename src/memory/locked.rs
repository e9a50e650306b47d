use super::allocator::Allocator;
use super::error::{FreeResult, Result};
use super::record::{AllocationRecord, Attr};
use crate::sync::{Mutex, MutexGuard, lock};

/// Serializes every call to a delegate behind one mutex.
///
/// `LockedAllocator<A>` is `Sync` for any `Send` delegate, which makes a
/// single-threaded allocator such as
/// [`BestFitAllocator`](crate::BestFitAllocator) usable below a shared
/// [`MultiBinBufferedAllocator`](crate::MultiBinBufferedAllocator).
pub struct LockedAllocator<A> {
    inner: Mutex<A>,
}

impl<A: Allocator> LockedAllocator<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Run `f` with the delegate locked.
    pub fn with_inner<R>(&self, f: impl FnOnce(&A) -> R) -> R {
        f(&*self.guard())
    }

    pub fn into_inner(self) -> A {
        self.inner
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn guard(&self) -> MutexGuard<'_, A> {
        lock(&self.inner)
    }
}

impl<A: Allocator> Allocator for LockedAllocator<A> {
    fn allocate(&self, size: usize, attr: Attr) -> Result<AllocationRecord> {
        self.guard().allocate(size, attr)
    }

    fn free(&self, record: AllocationRecord) -> FreeResult {
        self.guard().free(record)
    }

    fn is_thread_safe(&self) -> bool {
        true
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::best_fit::BestFitAllocator;
    use crate::memory::stub::StubAllocator;
    use crate::sync::Arc;
    use crate::sync::barrier::Barrier;

    fn assert_sync<T: Sync>() {}

    #[test]
    fn test_makes_best_fit_shareable() {
        assert_sync::<LockedAllocator<BestFitAllocator>>();

        let stub = StubAllocator::new();
        let chunk = stub.allocate(1 << 16, Attr::Default).unwrap();
        let locked = LockedAllocator::new(BestFitAllocator::new(chunk));
        assert!(locked.is_thread_safe());
        assert!(!locked.with_inner(BestFitAllocator::is_thread_safe));

        let r = locked.allocate(100, Attr::Default).unwrap();
        assert_eq!(locked.with_inner(BestFitAllocator::live_records), 1);
        locked.free(r).unwrap();

        let chunk = locked.into_inner().into_chunk().unwrap();
        stub.free(chunk).unwrap();
    }

    #[test]
    fn test_concurrent_carving_never_overlaps() {
        let stub = StubAllocator::new();
        let chunk = stub.allocate(1 << 20, Attr::Default).unwrap();
        let locked = Arc::new(LockedAllocator::new(BestFitAllocator::new(chunk)));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0u8..4)
            .map(|t| {
                let locked = locked.clone();
                let barrier = barrier.clone();
                crate::sync::thread::spawn(move || {
                    barrier.wait();
                    let mut held = Vec::new();
                    for i in 0..100 {
                        let mut r = locked.allocate(64 + i * 8, Attr::Default).unwrap();
                        r.as_mut_slice().fill(t);
                        held.push(r);
                    }
                    for r in held {
                        assert!(r.as_slice().iter().all(|&b| b == t));
                        locked.free(r).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let Ok(locked) = Arc::try_unwrap(locked) else {
            panic!("threads still hold the allocator");
        };
        let best_fit = locked.into_inner();
        assert_eq!(best_fit.free_bytes(), 1 << 20);
        stub.free(best_fit.into_chunk().unwrap()).unwrap();
    }
}
