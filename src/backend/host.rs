//! Host raw allocator backed by the global allocator

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::backend::{MemoryKind, RawAllocator};
use crate::error::{DistMemError, DistResult};

/// Host memory reservations with optional cap on outstanding bytes
///
/// The cap makes pool growth failures reproducible: once `reserved + bytes`
/// would exceed the limit, `raw_alloc` reports `OutOfMemory` exactly like an
/// exhausted device would.
#[derive(Debug, Default)]
pub struct HostAllocator {
    limit: Option<usize>,
    reserved: usize,
}

impl HostAllocator {
    /// Block alignment, matching the device allocation granularity
    pub const ALIGNMENT: usize = 256;

    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator that refuses to hold more than `limit` bytes at once
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            reserved: 0,
        }
    }

    /// Bytes currently reserved through this allocator
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    fn layout(bytes: usize) -> DistResult<Layout> {
        Layout::from_size_align(bytes, Self::ALIGNMENT).map_err(|e| DistMemError::OutOfMemory {
            kind: MemoryKind::Host,
            requested: bytes,
            reason: e.to_string(),
        })
    }
}

impl RawAllocator for HostAllocator {
    fn kind(&self) -> MemoryKind {
        MemoryKind::Host
    }

    fn base_alignment(&self) -> usize {
        Self::ALIGNMENT
    }

    fn raw_alloc(&mut self, bytes: usize) -> DistResult<NonNull<u8>> {
        if bytes == 0 {
            return Err(crate::invalid_argument!("raw allocation of zero bytes"));
        }

        if let Some(limit) = self.limit {
            if self.reserved.saturating_add(bytes) > limit {
                return Err(DistMemError::OutOfMemory {
                    kind: MemoryKind::Host,
                    requested: bytes,
                    reason: format!(
                        "host limit of {} bytes reached ({} reserved)",
                        limit, self.reserved
                    ),
                });
            }
        }

        let layout = Self::layout(bytes)?;
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            tracing::error!("HostAllocator: system allocator failed for {} bytes", bytes);
            DistMemError::OutOfMemory {
                kind: MemoryKind::Host,
                requested: bytes,
                reason: "system allocator returned null".to_string(),
            }
        })?;

        self.reserved += bytes;
        tracing::trace!("HostAllocator: reserved {} bytes at {:?}", bytes, ptr);
        Ok(ptr)
    }

    unsafe fn raw_free(&mut self, ptr: NonNull<u8>, bytes: usize) {
        // Layout was valid when the block was reserved
        if let Ok(layout) = Self::layout(bytes) {
            alloc::dealloc(ptr.as_ptr(), layout);
            self.reserved = self.reserved.saturating_sub(bytes);
            tracing::trace!("HostAllocator: released {} bytes at {:?}", bytes, ptr);
        }
    }

    unsafe fn fill_zero(&mut self, ptr: NonNull<u8>, bytes: usize) -> DistResult<()> {
        std::ptr::write_bytes(ptr.as_ptr(), 0, bytes);
        Ok(())
    }

    unsafe fn copy_from_host(&mut self, dst: NonNull<u8>, src: &[u8]) -> DistResult<()> {
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), src.len());
        Ok(())
    }

    unsafe fn copy_to_host(&mut self, src: NonNull<u8>, dst: &mut [u8]) -> DistResult<()> {
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr(), dst.len());
        Ok(())
    }
}
