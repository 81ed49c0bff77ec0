//! HIP error types

use thiserror::Error;

use crate::backend::MemoryKind;
use crate::error::DistMemError;

/// HIP runtime failures
#[derive(Error, Debug, Clone)]
pub enum HipError {
    #[error("HIP initialization failed: {0}")]
    InitializationFailed(String),
    #[error("Device not found")]
    DeviceNotFound,
    #[error("Memory allocation failed: {requested} bytes ({reason})")]
    MemoryAllocationFailed { requested: usize, reason: String },
    #[error("Memory copy failed: {0}")]
    MemoryCopyFailed(String),
    #[error("Memory set failed: {0}")]
    MemsetFailed(String),
    #[error("Stream error: {0}")]
    StreamError(String),
}

/// HIP result type
pub type HipResult<T> = Result<T, HipError>;

impl From<HipError> for DistMemError {
    fn from(err: HipError) -> Self {
        match err {
            HipError::MemoryAllocationFailed { requested, reason } => DistMemError::OutOfMemory {
                kind: MemoryKind::Device,
                requested,
                reason,
            },
            other => DistMemError::Backend(other.to_string()),
        }
    }
}
