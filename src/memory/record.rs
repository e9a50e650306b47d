use crate::sync::atomic::{AtomicU64, Ordering};
use std::fmt;
use std::ptr::NonNull;

crate::sync::static_atomic! {
    static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);
}

/// Where a region lives. Carried through the allocator stack as a tag only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Place {
    #[default]
    Host,
    /// Page-locked host memory visible to devices.
    PinnedHost,
    Device(u32),
}

/// Allocation hint forwarded to the delegate untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Attr {
    #[default]
    Default,
    Tiny,
    FixedHuge,
    FluxHuge,
    CrossDevice,
    Communication,
}

/// Owning handle to one contiguous region produced by an [`Allocator`].
///
/// Records are move-only: whoever holds the value owns the region. The
/// serial is unique for the life of the process and is how allocators tell
/// their own records apart from foreign or stale ones.
///
/// Dropping a record without passing it back to `free` leaks the region.
///
/// [`Allocator`]: super::Allocator
#[must_use = "dropping an AllocationRecord leaks its region; pass it to `free`"]
pub struct AllocationRecord {
    ptr: Option<NonNull<u8>>,
    size: usize,
    place: Place,
    serial: u64,
}

// Safety: a record is the unique owner of its region; moving it to another
// thread moves that ownership, and shared access only reads the metadata.
unsafe impl Send for AllocationRecord {}
// Safety: see above. `&AllocationRecord` hands out only shared byte slices.
unsafe impl Sync for AllocationRecord {}

impl AllocationRecord {
    /// Wrap a region produced by an allocator.
    ///
    /// # Safety
    ///
    /// If `ptr` is `Some`, it must be valid for reads and writes of `size`
    /// bytes and not aliased by anything else until the record is freed by
    /// the allocator that produced it. `ptr` may be `None` only when `size`
    /// is zero.
    pub unsafe fn new(ptr: Option<NonNull<u8>>, size: usize, place: Place) -> Self {
        debug_assert!(ptr.is_some() || size == 0, "null record with size {size}");
        Self {
            ptr,
            size,
            place,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Start of the region; null for zero-size records.
    #[inline]
    pub fn ptr(&self) -> *mut u8 {
        self.ptr.map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    #[inline]
    pub fn as_non_null(&self) -> Option<NonNull<u8>> {
        self.ptr
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    /// Real size of the region in bytes. May exceed the size that was
    /// requested when the record was reissued from a cache.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn place(&self) -> Place {
        self.place
    }

    #[inline]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn as_slice(&self) -> &[u8] {
        match self.ptr {
            // Safety: construction contract guarantees `size` valid bytes.
            Some(p) => unsafe { std::slice::from_raw_parts(p.as_ptr(), self.size) },
            None => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.ptr {
            // Safety: construction contract guarantees `size` valid bytes and
            // `&mut self` guarantees exclusivity.
            Some(p) => unsafe { std::slice::from_raw_parts_mut(p.as_ptr(), self.size) },
            None => &mut [],
        }
    }
}

impl fmt::Debug for AllocationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationRecord")
            .field("serial", &self.serial)
            .field("ptr", &self.ptr())
            .field("size", &self.size)
            .field("place", &self.place)
            .finish()
    }
}
