pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// delegate capability and records
pub use memory::allocator::Allocator;
pub use memory::record::{AllocationRecord, Attr, Place};

// caching layer
pub use memory::buffered::{AllocationGuard, BufferedAllocatorConfig, MultiBinBufferedAllocator};
pub use memory::division::{BinClass, DIVISION_PLAN_PATH_ENV, DivisionPlan};

// delegates
pub use memory::best_fit::{BEST_FIT_ALIGN, BestFitAllocator};
pub use memory::locked::LockedAllocator;
pub use memory::system::SystemAllocator;

// stats
pub use memory::stats::{CacheStats, MemoryStats, memory_stats};

// errors
pub use memory::error::{AllocError, FreeError, FreeResult, Result};
pub use memory::vm::VmError;
