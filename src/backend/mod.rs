//! Platform raw allocators
//!
//! A [`RawAllocator`] hands out large untyped reservations of one
//! [`MemoryKind`]. Memory pools carve those reservations into segments; the
//! raw allocator is only called when a pool grows, merges or is dropped.
//!
//! Host memory is always available. Device memory needs the `rocm` feature,
//! which links against the HIP runtime.

use std::fmt;
use std::ptr::NonNull;
use std::str::FromStr;

use crate::error::{DistMemError, DistResult};

pub mod host;
#[cfg(feature = "rocm")]
pub mod hip_backend;

pub use host::HostAllocator;
#[cfg(feature = "rocm")]
pub use hip_backend::{HipAllocator, HipError, HipResult, HipStream};

/// Kind of memory managed by a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Ordinary process memory, directly addressable from the CPU
    Host,
    /// Accelerator memory, only reachable through the device runtime
    Device,
}

impl MemoryKind {
    pub fn is_host(self) -> bool {
        matches!(self, MemoryKind::Host)
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryKind::Host => write!(f, "host"),
            MemoryKind::Device => write!(f, "device"),
        }
    }
}

impl FromStr for MemoryKind {
    type Err = DistMemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "host" | "cpu" => Ok(MemoryKind::Host),
            "device" | "gpu" => Ok(MemoryKind::Device),
            other => Err(crate::invalid_argument!(
                "unknown memory kind '{}', expected 'host' or 'device'",
                other
            )),
        }
    }
}

/// Platform allocator for one memory kind
///
/// Implementations only see whole blocks: `raw_alloc` is called with the
/// block capacity and `raw_free` with the same pointer and size. The data
/// movement methods operate on sub-ranges of live blocks.
pub trait RawAllocator: Send + fmt::Debug {
    /// Memory kind produced by this allocator
    fn kind(&self) -> MemoryKind;

    /// Alignment every reservation from `raw_alloc` is guaranteed to have
    fn base_alignment(&self) -> usize;

    /// Reserve `bytes` (> 0) bytes.
    ///
    /// Exhaustion is reported as [`DistMemError::OutOfMemory`].
    fn raw_alloc(&mut self, bytes: usize) -> DistResult<NonNull<u8>>;

    /// Release a reservation.
    ///
    /// # Safety
    /// `ptr` must come from `raw_alloc(bytes)` on this allocator and must not
    /// have been released already.
    unsafe fn raw_free(&mut self, ptr: NonNull<u8>, bytes: usize);

    /// Fill `bytes` bytes at `ptr` with zeros. The write is complete (or
    /// ordered before any later access from any thread) when this returns.
    ///
    /// # Safety
    /// `[ptr, ptr + bytes)` must lie inside a live reservation.
    unsafe fn fill_zero(&mut self, ptr: NonNull<u8>, bytes: usize) -> DistResult<()>;

    /// Copy host bytes into the reservation at `dst`.
    ///
    /// # Safety
    /// `[dst, dst + src.len())` must lie inside a live reservation.
    unsafe fn copy_from_host(&mut self, dst: NonNull<u8>, src: &[u8]) -> DistResult<()>;

    /// Copy bytes from the reservation at `src` into host memory.
    ///
    /// # Safety
    /// `[src, src + dst.len())` must lie inside a live reservation.
    unsafe fn copy_to_host(&mut self, src: NonNull<u8>, dst: &mut [u8]) -> DistResult<()>;
}

/// Platform allocator for `kind`
///
/// Device memory requires the `rocm` feature and an available GPU.
pub fn raw_allocator_for(kind: MemoryKind) -> DistResult<Box<dyn RawAllocator>> {
    match kind {
        MemoryKind::Host => Ok(Box::new(HostAllocator::new())),
        #[cfg(feature = "rocm")]
        MemoryKind::Device => Ok(Box::new(HipAllocator::new()?)),
        #[cfg(not(feature = "rocm"))]
        MemoryKind::Device => Err(crate::invalid_argument!(
            "device memory pools require the 'rocm' feature"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_kind_round_trip_through_strings() {
        assert_eq!("host".parse::<MemoryKind>().unwrap(), MemoryKind::Host);
        assert_eq!("GPU".parse::<MemoryKind>().unwrap(), MemoryKind::Device);
        assert_eq!(MemoryKind::Device.to_string(), "device");
        assert!("tape".parse::<MemoryKind>().unwrap_err().is_user_error());
    }

    #[test]
    fn test_host_allocator_always_available() {
        let alloc = raw_allocator_for(MemoryKind::Host).unwrap();
        assert_eq!(alloc.kind(), MemoryKind::Host);
    }

    #[cfg(not(feature = "rocm"))]
    #[test]
    fn test_device_allocator_needs_rocm_feature() {
        let err = raw_allocator_for(MemoryKind::Device).unwrap_err();
        assert!(err.is_user_error());
    }
}
