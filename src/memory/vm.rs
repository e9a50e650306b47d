use std::ptr::NonNull;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("VM reservation failed: {0}")]
    ReservationFailed(#[source] std::io::Error),
    #[error("VM commit failed: {0}")]
    CommitFailed(#[source] std::io::Error),
    #[error("VM release failed: {0}")]
    ReleaseFailed(#[source] std::io::Error),
}

impl VmError {
    /// True when the OS refused for lack of memory or address space, as
    /// opposed to a bad argument or a broken mapping.
    pub fn is_exhaustion(&self) -> bool {
        match self {
            VmError::ReservationFailed(e) | VmError::CommitFailed(e) => {
                e.kind() == std::io::ErrorKind::OutOfMemory
                    || e.raw_os_error() == Some(ENOMEM)
            }
            VmError::ReleaseFailed(_) => false,
        }
    }
}

#[cfg(unix)]
const ENOMEM: i32 = libc::ENOMEM;
#[cfg(not(unix))]
const ENOMEM: i32 = 12;

/// Abstract interface for virtual memory operations.
pub(crate) trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size (default/minimum).
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                usize::try_from(raw).ok().filter(|&p| p > 0).unwrap_or(4096)
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed VmOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls: loom runs inside a
// single OS process with its own scheduler. Miri cannot model mmap either, and
// non-unix targets have no implementation above. In all of these cases every
// "reservation" is a plain heap allocation (via `std::alloc::alloc_zeroed` /
// `dealloc`) and `commit` is a no-op.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri, not(unix)))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|e| VmError::ReservationFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(()) // heap memory is always accessible
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_release() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");
            PlatformVmOps::commit(ptr, size).expect("Commit failed");

            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            slice[size - 1] = 7;
            assert_eq!(slice[0], 42);
            assert_eq!(slice[size - 1], 7);

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_reserve_zero_size() {
        // mmap with 0 size fails with EINVAL; the heap mock rejects it too.
        // Safety: Test code.
        let result = unsafe { PlatformVmOps::reserve(0) };
        assert!(result.is_err(), "Reserving 0 bytes should fail");
        assert!(!result.unwrap_err().is_exhaustion());
    }

    #[test]
    fn test_commit_idempotent() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");
            PlatformVmOps::commit(ptr, size).expect("First commit failed");
            PlatformVmOps::commit(ptr, size).expect("Second commit failed");
            *(ptr.as_ptr()) = 123;
            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PlatformVmOps::page_size();
        assert!(size > 0);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn test_exhaustion_classification() {
        let oom = VmError::CommitFailed(std::io::Error::from_raw_os_error(ENOMEM));
        assert!(oom.is_exhaustion());
        let kind = VmError::ReservationFailed(std::io::ErrorKind::OutOfMemory.into());
        assert!(kind.is_exhaustion());
        let release = VmError::ReleaseFailed(std::io::ErrorKind::OutOfMemory.into());
        assert!(!release.is_exhaustion());
    }
}
