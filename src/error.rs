//! Unified error handling for distmem
//!
//! Every fallible operation in the crate returns [`DistResult`]. The error
//! kinds mirror the failure classes of the data-layout core:
//! - Caller mistakes (malformed sizes, ranks out of range)
//! - Broken invariants (volume mismatch, corrupted pool bookkeeping)
//! - Resource exhaustion (raw allocator out of memory)
//! - Handle misuse (double free, use after free)
//! - Backend and participant-group transport failures
//!
//! None of these are retried inside the crate. They are surfaced to the
//! caller immediately, carrying the offending values in the message.

use std::fmt;

use crate::backend::MemoryKind;

/// Unified error type for distmem
#[derive(Debug, thiserror::Error)]
pub enum DistMemError {
    /// Malformed input: zero participants, rank out of range, bad alignment, ...
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A conserved quantity or bookkeeping invariant does not hold
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// The platform raw allocator could not provide a new block
    #[error("Out of {kind} memory: failed to reserve {requested} bytes ({reason})")]
    OutOfMemory {
        kind: MemoryKind,
        requested: usize,
        reason: String,
    },

    /// A handle refers to a segment that has been released or reused
    #[error("Use after free: {0}")]
    UseAfterFree(String),

    /// A handle was returned to its pool twice
    #[error("Double free: {0}")]
    DoubleFree(String),

    /// Device runtime failure other than allocation
    #[error("Backend error: {0}")]
    Backend(String),

    /// Participant-group transport failure
    #[error("Communication error: {0}")]
    Communication(String),

    /// Lock poisoned (a participant panicked while holding shared state)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl DistMemError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            DistMemError::InvalidArgument(_) => ErrorCategory::User,

            DistMemError::InvariantViolation(_)
            | DistMemError::UseAfterFree(_)
            | DistMemError::DoubleFree(_)
            | DistMemError::LockPoisoned(_) => ErrorCategory::Internal,

            DistMemError::OutOfMemory { .. } => ErrorCategory::Resource,

            DistMemError::Backend(_) => ErrorCategory::Backend,

            DistMemError::Communication(_) => ErrorCategory::Communication,
        }
    }

    /// Check if this is a caller error (malformed input)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this error indicates a bug or corrupted state
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }

    /// Check if the raw allocator ran out of memory
    ///
    /// Callers that size arenas speculatively can match on this to degrade
    /// gracefully; everyone else should let it propagate.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, DistMemError::OutOfMemory { .. })
    }
}

/// Error category for handling decisions
///
/// - User: fix the call site
/// - Internal: report as a bug, shared state may be corrupted
/// - Resource: arena sizing exceeded what the platform can provide
/// - Backend: device runtime failure
/// - Communication: participant group failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    User,
    Internal,
    Resource,
    Backend,
    Communication,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Internal => write!(f, "Internal"),
            ErrorCategory::Resource => write!(f, "Resource"),
            ErrorCategory::Backend => write!(f, "Backend"),
            ErrorCategory::Communication => write!(f, "Communication"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for DistMemError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DistMemError::LockPoisoned(err.to_string())
    }
}

/// Result type used across the crate
pub type DistResult<T> = std::result::Result<T, DistMemError>;

/// Create an [`DistMemError::InvalidArgument`] with a formatted message
///
/// # Examples
/// ```ignore
/// return Err(invalid_argument!("rank {} out of range for {} parts", rank, num_parts));
/// ```
#[macro_export]
macro_rules! invalid_argument {
    ($msg:expr) => {
        $crate::error::DistMemError::InvalidArgument($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::DistMemError::InvalidArgument(format!($fmt, $($arg)*))
    };
}

/// Create an [`DistMemError::InvariantViolation`] with a formatted message
///
/// # Examples
/// ```ignore
/// return Err(invariant_violation!("free_size={} exceeds total_size={}", free, total));
/// ```
#[macro_export]
macro_rules! invariant_violation {
    ($msg:expr) => {
        $crate::error::DistMemError::InvariantViolation($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::DistMemError::InvariantViolation(format!($fmt, $($arg)*))
    };
}
