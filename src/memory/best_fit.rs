use super::allocator::Allocator;
use super::error::{AllocError, FreeError, FreeResult, Result};
use super::record::{AllocationRecord, Attr};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ptr::NonNull;

/// Granularity of every carve. Offsets and lengths are multiples of this.
pub const BEST_FIT_ALIGN: usize = 16;

struct Arena {
    /// Free blocks by offset → length. Adjacent blocks are always merged.
    by_offset: BTreeMap<usize, usize>,
    /// Same blocks ordered by (length, offset) for best-fit lookup.
    by_len: BTreeSet<(usize, usize)>,
    /// Serial of each live record → (offset, carved length).
    live: HashMap<u64, (usize, usize)>,
    /// Serials of live zero-size records.
    live_null: HashSet<u64>,
    free_bytes: usize,
}

impl Arena {
    fn insert_free(&mut self, offset: usize, len: usize) {
        self.by_offset.insert(offset, len);
        self.by_len.insert((len, offset));
        self.free_bytes += len;
    }

    fn remove_free(&mut self, offset: usize, len: usize) {
        self.by_offset.remove(&offset);
        self.by_len.remove(&(len, offset));
        self.free_bytes -= len;
    }

    /// Carve `len` bytes from the smallest block that holds them.
    fn carve(&mut self, len: usize) -> Option<usize> {
        let &(block_len, offset) = self.by_len.range((len, 0)..).next()?;
        self.remove_free(offset, block_len);
        if block_len > len {
            self.insert_free(offset + len, block_len - len);
        }
        Some(offset)
    }

    /// Return `[offset, offset + len)` and merge it with free neighbours.
    fn release(&mut self, mut offset: usize, mut len: usize) {
        if let Some((&prev, &prev_len)) = self.by_offset.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.remove_free(prev, prev_len);
                offset = prev;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.by_offset.get(&(offset + len)) {
            self.remove_free(offset + len, next_len);
            len += next_len;
        }
        self.insert_free(offset, len);
    }

    fn largest_free(&self) -> usize {
        self.by_len.last().map_or(0, |&(len, _)| len)
    }
}

/// Single-threaded allocator carving regions out of one pre-allocated chunk.
///
/// Requests are rounded up to [`BEST_FIT_ALIGN`] and served from the smallest
/// free block that fits; the remainder stays free. Freed regions merge with
/// free neighbours, so a fully freed arena is again one block.
///
/// The arena lives in a `RefCell`: the type is `Send` but not `Sync`, and
/// [`is_thread_safe`](Allocator::is_thread_safe) reports `false`. Share it
/// across threads through a [`LockedAllocator`](crate::LockedAllocator).
pub struct BestFitAllocator {
    chunk: AllocationRecord,
    arena: RefCell<Arena>,
}

impl BestFitAllocator {
    /// Serve requests from `chunk`. The chunk is handed back by
    /// [`into_chunk`](Self::into_chunk).
    pub fn new(chunk: AllocationRecord) -> Self {
        let mut arena = Arena {
            by_offset: BTreeMap::new(),
            by_len: BTreeSet::new(),
            live: HashMap::new(),
            live_null: HashSet::new(),
            free_bytes: 0,
        };
        // Usable space: whole granules from an aligned start.
        let base = chunk.ptr() as usize;
        let head = base.next_multiple_of(BEST_FIT_ALIGN) - base;
        let usable = chunk.size().saturating_sub(head) / BEST_FIT_ALIGN * BEST_FIT_ALIGN;
        if !chunk.is_null() && usable > 0 {
            arena.insert_free(head, usable);
        }
        Self {
            chunk,
            arena: RefCell::new(arena),
        }
    }

    #[inline]
    pub fn chunk(&self) -> &AllocationRecord {
        &self.chunk
    }

    /// Bytes not currently carved out.
    pub fn free_bytes(&self) -> usize {
        self.arena.borrow().free_bytes
    }

    /// Largest request that can succeed right now.
    pub fn largest_free_block(&self) -> usize {
        self.arena.borrow().largest_free()
    }

    /// Records handed out and not yet freed.
    pub fn live_records(&self) -> usize {
        let arena = self.arena.borrow();
        arena.live.len() + arena.live_null.len()
    }

    /// Give back the chunk once nothing carved from it is live.
    ///
    /// # Errors
    ///
    /// Returns `self` unchanged while records are still outstanding.
    pub fn into_chunk(self) -> std::result::Result<AllocationRecord, Self> {
        if self.live_records() > 0 {
            return Err(self);
        }
        Ok(self.chunk)
    }
}

impl Allocator for BestFitAllocator {
    fn allocate(&self, size: usize, _attr: Attr) -> Result<AllocationRecord> {
        let place = self.chunk.place();
        let mut arena = self.arena.borrow_mut();

        if size == 0 {
            // Safety: null records carry no region.
            let record = unsafe { AllocationRecord::new(None, 0, place) };
            arena.live_null.insert(record.serial());
            return Ok(record);
        }

        let exhausted = |arena: &Arena| AllocError::CapacityExhausted {
            requested: size,
            available: arena.largest_free(),
        };
        let Some(len) = size.checked_next_multiple_of(BEST_FIT_ALIGN) else {
            return Err(exhausted(&*arena));
        };
        let Some(offset) = arena.carve(len) else {
            tracing::trace!(size, free = arena.free_bytes, "best-fit arena exhausted");
            return Err(exhausted(&*arena));
        };

        // Safety: `offset + len` lies inside the chunk, which is non-null
        // whenever a free block exists. Carved ranges never overlap.
        let record = unsafe {
            let ptr = NonNull::new_unchecked(self.chunk.ptr().add(offset));
            AllocationRecord::new(Some(ptr), size, place)
        };
        arena.live.insert(record.serial(), (offset, len));
        Ok(record)
    }

    fn free(&self, record: AllocationRecord) -> FreeResult {
        let mut arena = self.arena.borrow_mut();
        let serial = record.serial();
        if let Some((offset, len)) = arena.live.remove(&serial) {
            arena.release(offset, len);
            Ok(())
        } else if arena.live_null.remove(&serial) {
            Ok(())
        } else {
            Err(FreeError::foreign(record))
        }
    }

    fn is_thread_safe(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for BestFitAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let arena = self.arena.borrow();
        f.debug_struct("BestFitAllocator")
            .field("chunk", &self.chunk)
            .field("free_bytes", &arena.free_bytes)
            .field("free_blocks", &arena.by_offset.len())
            .field("live", &(arena.live.len() + arena.live_null.len()))
            .finish()
    }
}
