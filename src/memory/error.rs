use super::record::AllocationRecord;
use super::vm::VmError;
use thiserror::Error;

/// Errors raised by the buffered allocator and the bundled delegates.
#[derive(Debug, Error)]
pub enum AllocError {
    /// Rejected construction input, such as a malformed division plan.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A record was handed to `free` by someone who does not own it.
    #[error("invalid argument: record #{serial} {reason}")]
    InvalidArgument { serial: u64, reason: &'static str },

    /// The delegate could not satisfy the request.
    #[error("capacity exhausted: requested {requested} bytes, {available} available")]
    CapacityExhausted { requested: usize, available: usize },

    #[error(transparent)]
    Vm(#[from] VmError),

    #[error("failed to read division plan: {0}")]
    Io(#[from] std::io::Error),
}

impl AllocError {
    /// True for the one failure class the buffered allocator recovers from.
    #[must_use]
    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(self, AllocError::CapacityExhausted { .. })
    }

    pub(crate) fn foreign(serial: u64) -> Self {
        AllocError::InvalidArgument {
            serial,
            reason: "was not produced by this allocator or was already freed",
        }
    }
}

pub type Result<T> = std::result::Result<T, AllocError>;

/// A rejected `free`. The record comes back to the caller untouched, so a
/// record handed to the wrong allocator can still be returned to its owner.
#[derive(Debug, Error)]
#[error("free of record #{serial} rejected: {error}", serial = .record.serial())]
pub struct FreeError {
    pub error: AllocError,
    pub record: AllocationRecord,
}

impl FreeError {
    pub fn new(error: AllocError, record: AllocationRecord) -> Self {
        Self { error, record }
    }

    pub(crate) fn foreign(record: AllocationRecord) -> Self {
        Self::new(AllocError::foreign(record.serial()), record)
    }

    pub fn into_record(self) -> AllocationRecord {
        self.record
    }
}

pub type FreeResult = std::result::Result<(), FreeError>;
