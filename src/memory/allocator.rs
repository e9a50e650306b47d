use super::error::{FreeResult, Result};
use super::record::{AllocationRecord, Attr};

/// The capability every allocator in the stack provides.
///
/// Implementations that are not safe to call concurrently stay `!Sync`
/// (typically through interior `RefCell` state) and report `false` from
/// [`is_thread_safe`](Allocator::is_thread_safe). Wrap them in a
/// [`LockedAllocator`](crate::LockedAllocator) to share them across threads.
pub trait Allocator {
    /// Produce a region of at least `size` bytes.
    ///
    /// # Errors
    ///
    /// [`AllocError::CapacityExhausted`](crate::AllocError::CapacityExhausted)
    /// when the request cannot be satisfied; other variants for internal
    /// failures.
    fn allocate(&self, size: usize, attr: Attr) -> Result<AllocationRecord>;

    /// Release a record previously returned by this allocator's `allocate`.
    ///
    /// # Errors
    ///
    /// [`FreeError`](crate::FreeError) carrying the record back, with
    /// [`AllocError::InvalidArgument`](crate::AllocError::InvalidArgument)
    /// for records this allocator does not own, or the platform error when
    /// the release itself failed. A rejected record is still live and may be
    /// freed again.
    fn free(&self, record: AllocationRecord) -> FreeResult;

    fn is_thread_safe(&self) -> bool;
}

impl<A: Allocator + ?Sized> Allocator for &A {
    fn allocate(&self, size: usize, attr: Attr) -> Result<AllocationRecord> {
        (**self).allocate(size, attr)
    }

    fn free(&self, record: AllocationRecord) -> FreeResult {
        (**self).free(record)
    }

    fn is_thread_safe(&self) -> bool {
        (**self).is_thread_safe()
    }
}

impl<A: Allocator + ?Sized> Allocator for Box<A> {
    fn allocate(&self, size: usize, attr: Attr) -> Result<AllocationRecord> {
        (**self).allocate(size, attr)
    }

    fn free(&self, record: AllocationRecord) -> FreeResult {
        (**self).free(record)
    }

    fn is_thread_safe(&self) -> bool {
        (**self).is_thread_safe()
    }
}

impl<A: Allocator + ?Sized> Allocator for crate::sync::Arc<A> {
    fn allocate(&self, size: usize, attr: Attr) -> Result<AllocationRecord> {
        (**self).allocate(size, attr)
    }

    fn free(&self, record: AllocationRecord) -> FreeResult {
        (**self).free(record)
    }

    fn is_thread_safe(&self) -> bool {
        (**self).is_thread_safe()
    }
}
