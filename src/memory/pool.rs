//! Growable best-fit memory pool over one memory kind

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use super::block::{BlockId, MemoryBlock, SegmentFault};
use super::config::PoolConfig;
use crate::backend::{raw_allocator_for, MemoryKind, RawAllocator};
use crate::error::{DistMemError, DistResult};
use crate::{invalid_argument, invariant_violation};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Exclusive claim on one used segment of a [`MemoryPool`]
///
/// Handles cannot be cloned; returning one to the pool consumes it. A stale
/// handle (one whose segment was released through a different path) is
/// detected by its token and reported as `DoubleFree` or `UseAfterFree`.
#[derive(Debug)]
#[must_use = "pool handles must be returned with MemoryPool::deallocate"]
pub struct PoolHandle {
    pool_id: u64,
    block: Option<BlockId>,
    offset: usize,
    len: usize,
    token: u64,
}

impl PoolHandle {
    /// Requested size in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte offset inside the owning block
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Owning block, `None` for zero-length handles
    pub fn block_id(&self) -> Option<BlockId> {
        self.block
    }
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolStats {
    pub total_size: usize,
    pub free_size: usize,
    pub num_blocks: usize,
    pub num_stored_ptr: usize,
    /// Largest single free segment
    pub largest_free: usize,
    /// 0.0 = all free bytes contiguous, towards 1.0 = scattered
    pub fragmentation: f32,
}

/// Arena allocator for one memory kind
///
/// Requests are served best-fit from the free segments of all blocks. When
/// nothing fits, a new block of at least `max(request, min_block_size)`
/// bytes is reserved from the raw allocator. The reservation never shrinks
/// while the pool lives; once every handle is back, the blocks are merged
/// into a single block of the same total size so the next cycle of the same
/// working set is served from one contiguous region.
///
/// # Thread Safety
///
/// Mutation needs `&mut self`. Share a pool between threads by wrapping it in
/// a `Mutex`.
///
/// # Example
///
/// ```
/// use distmem::{MemoryKind, MemoryPool};
///
/// let mut pool = MemoryPool::new(MemoryKind::Host)?;
/// let handle = pool.allocate(1000)?;
/// pool.zero(&handle)?;
/// assert!(pool.slice(&handle)?.iter().all(|&b| b == 0));
/// pool.deallocate(handle)?;
/// assert_eq!(pool.free_size(), pool.total_size());
/// # Ok::<(), distmem::DistMemError>(())
/// ```
#[derive(Debug)]
pub struct MemoryPool {
    id: u64,
    kind: MemoryKind,
    allocator: Box<dyn RawAllocator>,
    config: PoolConfig,
    blocks: Vec<MemoryBlock>,
    next_block_id: BlockId,
    next_token: u64,
    total_size: usize,
    free_size: usize,
    num_stored_ptr: usize,
}

impl MemoryPool {
    /// Pool over the platform allocator of `kind` with default configuration
    pub fn new(kind: MemoryKind) -> DistResult<Self> {
        Self::with_config(kind, PoolConfig::default())
    }

    pub fn with_config(kind: MemoryKind, config: PoolConfig) -> DistResult<Self> {
        config.validate()?;
        Self::with_allocator(raw_allocator_for(kind)?, config)
    }

    /// Pool over a caller-supplied raw allocator
    ///
    /// # Errors
    /// `InvalidArgument` if the configured alignment exceeds what the
    /// allocator guarantees for its reservations.
    pub fn with_allocator(allocator: Box<dyn RawAllocator>, config: PoolConfig) -> DistResult<Self> {
        config.validate()?;
        if config.alignment > allocator.base_alignment() {
            return Err(invalid_argument!(
                "pool alignment {} exceeds the {} allocator's block alignment {}",
                config.alignment,
                allocator.kind(),
                allocator.base_alignment()
            ));
        }
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let kind = allocator.kind();

        tracing::debug!(
            "MemoryPool[{}]: created for {} memory (min block {} bytes, alignment {})",
            id,
            kind,
            config.min_block_size,
            config.alignment
        );

        Ok(Self {
            id,
            kind,
            allocator,
            config,
            blocks: Vec::new(),
            next_block_id: 0,
            next_token: 1,
            total_size: 0,
            free_size: 0,
            num_stored_ptr: 0,
        })
    }

    /// Allocate `nbytes` bytes
    ///
    /// Zero-byte requests return an untracked empty handle.
    ///
    /// # Errors
    /// - `OutOfMemory` if the pool must grow and the raw allocator refuses
    /// - `InvalidArgument` if the aligned size overflows
    pub fn allocate(&mut self, nbytes: usize) -> DistResult<PoolHandle> {
        if nbytes == 0 {
            return Ok(PoolHandle {
                pool_id: self.id,
                block: None,
                offset: 0,
                len: 0,
                token: 0,
            });
        }

        let need = align_up(nbytes, self.config.alignment)
            .ok_or_else(|| invalid_argument!("allocation of {} bytes overflows", nbytes))?;

        let (block_index, segment_index) = match self.find_best_fit(need) {
            Some(found) => found,
            None => (self.grow(need)?, 0),
        };

        let token = self.next_token;
        self.next_token += 1;

        let block = &mut self.blocks[block_index];
        let offset = block.carve(segment_index, need, token);
        let block_id = block.id();

        self.free_size -= need;
        self.num_stored_ptr += 1;

        tracing::trace!(
            "MemoryPool[{}]: allocated {} bytes at block {} offset {} ({} live)",
            self.id,
            nbytes,
            block_id,
            offset,
            self.num_stored_ptr
        );

        self.check_if_enabled()?;

        Ok(PoolHandle {
            pool_id: self.id,
            block: Some(block_id),
            offset,
            len: nbytes,
            token,
        })
    }

    /// Return a handle's segment to the pool
    ///
    /// # Errors
    /// - `InvalidArgument` if the handle belongs to another pool
    /// - `DoubleFree` if the segment was already returned
    pub fn deallocate(&mut self, handle: PoolHandle) -> DistResult<()> {
        self.check_owner(&handle)?;
        let Some(block_id) = handle.block else {
            return Ok(());
        };

        let block_index = self.block_index(block_id).ok_or_else(|| {
            DistMemError::DoubleFree(format!(
                "block {} of pool {} no longer exists (handle at offset {}, {} bytes)",
                block_id, self.id, handle.offset, handle.len
            ))
        })?;

        let released = self.blocks[block_index]
            .release(handle.offset, handle.token)
            .map_err(|fault| {
                DistMemError::DoubleFree(describe_fault(fault, block_id, &handle))
            })?;

        self.free_size += released;
        self.num_stored_ptr -= 1;

        tracing::trace!(
            "MemoryPool[{}]: released {} bytes at block {} offset {} ({} live)",
            self.id,
            handle.len,
            block_id,
            handle.offset,
            self.num_stored_ptr
        );

        if self.num_stored_ptr == 0 && self.blocks.len() > 1 && self.config.merge_on_drain {
            self.merge_drained_blocks();
        }

        self.check_if_enabled()
    }

    /// Fill the handle's bytes with zeros
    ///
    /// Device pools clear on the allocator's stream and synchronize before
    /// returning, so later reads from any stream observe the zeros.
    pub fn zero(&mut self, handle: &PoolHandle) -> DistResult<()> {
        let Some(ptr) = self.live_ptr(handle)? else {
            return Ok(());
        };
        // SAFETY: [ptr, ptr + len) is inside the live segment owned by handle
        unsafe { self.allocator.fill_zero(ptr, handle.len) }
    }

    /// Address of the handle's first byte (host or device address space)
    pub fn as_ptr(&self, handle: &PoolHandle) -> DistResult<NonNull<u8>> {
        Ok(self.live_ptr(handle)?.unwrap_or(NonNull::dangling()))
    }

    /// Host view of the handle's bytes
    pub fn slice(&self, handle: &PoolHandle) -> DistResult<&[u8]> {
        self.require_host("slice")?;
        match self.live_ptr(handle)? {
            // SAFETY: the segment is live, host-addressable and at least len bytes long
            Some(ptr) => Ok(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), handle.len) }),
            None => Ok(&[]),
        }
    }

    /// Mutable host view of the handle's bytes
    pub fn slice_mut(&mut self, handle: &PoolHandle) -> DistResult<&mut [u8]> {
        self.require_host("slice_mut")?;
        match self.live_ptr(handle)? {
            // SAFETY: segments never overlap and the view borrows the pool mutably
            Some(ptr) => Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), handle.len) }),
            None => Ok(&mut []),
        }
    }

    /// Copy `src` into the start of the handle's bytes
    pub fn copy_from_host(&mut self, handle: &PoolHandle, src: &[u8]) -> DistResult<()> {
        if src.len() > handle.len {
            return Err(invalid_argument!(
                "cannot copy {} bytes into a {}-byte handle",
                src.len(),
                handle.len
            ));
        }
        let Some(ptr) = self.live_ptr(handle)? else {
            return Ok(());
        };
        // SAFETY: src fits inside the live segment
        unsafe { self.allocator.copy_from_host(ptr, src) }
    }

    /// Copy the start of the handle's bytes into `dst`
    pub fn copy_to_host(&mut self, handle: &PoolHandle, dst: &mut [u8]) -> DistResult<()> {
        if dst.len() > handle.len {
            return Err(invalid_argument!(
                "cannot copy {} bytes out of a {}-byte handle",
                dst.len(),
                handle.len
            ));
        }
        let Some(ptr) = self.live_ptr(handle)? else {
            return Ok(());
        };
        // SAFETY: dst.len() bytes lie inside the live segment
        unsafe { self.allocator.copy_to_host(ptr, dst) }
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Bytes reserved from the raw allocator
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Bytes in free segments
    pub fn free_size(&self) -> usize {
        self.free_size
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of live handles
    pub fn num_stored_ptr(&self) -> usize {
        self.num_stored_ptr
    }

    pub fn stats(&self) -> PoolStats {
        let largest_free = self
            .blocks
            .iter()
            .map(MemoryBlock::largest_free)
            .max()
            .unwrap_or(0);
        let fragmentation = if self.free_size == 0 {
            0.0
        } else {
            1.0 - (largest_free as f32 / self.free_size as f32)
        };

        PoolStats {
            total_size: self.total_size,
            free_size: self.free_size,
            num_blocks: self.blocks.len(),
            num_stored_ptr: self.num_stored_ptr,
            largest_free,
            fragmentation,
        }
    }

    /// Recompute all counters from the segment records and check them
    pub fn validate(&self) -> DistResult<()> {
        let mut total = 0usize;
        let mut free = 0usize;
        let mut used = 0usize;

        for block in &self.blocks {
            block
                .check_layout()
                .map_err(|msg| invariant_violation!("pool {} block {}: {}", self.id, block.id(), msg))?;
            total += block.capacity();
            free += block.free_bytes();
            used += block.used_segments();
        }

        if total != self.total_size {
            return Err(invariant_violation!(
                "pool total_size mismatch: blocks hold {} bytes, counter says {}",
                total,
                self.total_size
            ));
        }
        if free != self.free_size {
            return Err(invariant_violation!(
                "pool free_size mismatch: free segments hold {} bytes, counter says {}",
                free,
                self.free_size
            ));
        }
        if used != self.num_stored_ptr {
            return Err(invariant_violation!(
                "pool num_stored_ptr mismatch: {} used segments, counter says {}",
                used,
                self.num_stored_ptr
            ));
        }
        if self.free_size > self.total_size {
            return Err(invariant_violation!(
                "pool free_size={} exceeds total_size={}",
                self.free_size,
                self.total_size
            ));
        }
        if self.num_stored_ptr == 0 && self.free_size != self.total_size {
            return Err(invariant_violation!(
                "pool free_size mismatch: expected total_size={} got free_size={} after full drain",
                self.total_size,
                self.free_size
            ));
        }
        Ok(())
    }

    fn find_best_fit(&self, need: usize) -> Option<(usize, usize)> {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(block_index, block)| {
                block
                    .best_fit(need)
                    .map(|(segment_index, len)| (block_index, segment_index, len))
            })
            .min_by_key(|&(_, _, len)| len)
            .map(|(block_index, segment_index, _)| (block_index, segment_index))
    }

    /// Reserve a new block able to hold `need` bytes; returns its index
    fn grow(&mut self, need: usize) -> DistResult<usize> {
        let capacity = need.max(self.config.min_block_size);
        let base = self.allocator.raw_alloc(capacity)?;
        let id = self.take_block_id();

        self.blocks.push(MemoryBlock::new(id, base, capacity));
        self.total_size += capacity;
        self.free_size += capacity;

        tracing::debug!(
            "MemoryPool[{}]: grew by block {} of {} bytes ({} blocks, {} bytes total)",
            self.id,
            id,
            capacity,
            self.blocks.len(),
            self.total_size
        );
        Ok(self.blocks.len() - 1)
    }

    /// Replace all (fully free) blocks with one block of the same total size
    ///
    /// The merged block is reserved next to the old ones first. If the raw
    /// allocator refuses, the old blocks are released and the reservation is
    /// retried; should that fail as well, blocks of the old capacities are
    /// reserved again.
    fn merge_drained_blocks(&mut self) {
        debug_assert!(self.blocks.iter().all(MemoryBlock::is_unused));

        let total = self.total_size;
        let merged = self.blocks.len();
        let base = match self.allocator.raw_alloc(total) {
            Ok(base) => {
                self.release_blocks();
                base
            }
            Err(e) => {
                tracing::debug!(
                    "MemoryPool[{}]: merged reservation of {} bytes next to {} blocks failed ({}), releasing first",
                    self.id,
                    total,
                    merged,
                    e
                );
                let capacities = self.release_blocks();
                match self.allocator.raw_alloc(total) {
                    Ok(base) => base,
                    Err(e) => {
                        tracing::warn!(
                            "MemoryPool[{}]: keeping {} blocks, merged reservation of {} bytes failed: {}",
                            self.id,
                            merged,
                            total,
                            e
                        );
                        self.restore_blocks(&capacities);
                        return;
                    }
                }
            }
        };

        let id = self.take_block_id();
        self.blocks.push(MemoryBlock::new(id, base, total));

        tracing::debug!(
            "MemoryPool[{}]: merged {} drained blocks into block {} of {} bytes",
            self.id,
            merged,
            id,
            total
        );
    }

    /// Hand every block back to the raw allocator; returns their capacities
    fn release_blocks(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.blocks)
            .into_iter()
            .map(|block| {
                // SAFETY: every block came from raw_alloc(capacity) and is released once
                unsafe { self.allocator.raw_free(block.base(), block.capacity()) };
                block.capacity()
            })
            .collect()
    }

    /// Reserve fresh empty blocks of the given capacities
    fn restore_blocks(&mut self, capacities: &[usize]) {
        for &capacity in capacities {
            match self.allocator.raw_alloc(capacity) {
                Ok(base) => {
                    let id = self.take_block_id();
                    self.blocks.push(MemoryBlock::new(id, base, capacity));
                }
                Err(e) => {
                    tracing::error!(
                        "MemoryPool[{}]: could not reserve {} bytes again after a failed merge: {}",
                        self.id,
                        capacity,
                        e
                    );
                    self.total_size -= capacity;
                    self.free_size -= capacity;
                }
            }
        }
    }

    fn take_block_id(&mut self) -> BlockId {
        let id = self.next_block_id;
        self.next_block_id += 1;
        id
    }

    fn block_index(&self, id: BlockId) -> Option<usize> {
        self.blocks.iter().position(|block| block.id() == id)
    }

    fn check_owner(&self, handle: &PoolHandle) -> DistResult<()> {
        if handle.pool_id != self.id {
            return Err(invalid_argument!(
                "handle belongs to pool {}, not pool {}",
                handle.pool_id,
                self.id
            ));
        }
        Ok(())
    }

    fn require_host(&self, op: &str) -> DistResult<()> {
        if !self.kind.is_host() {
            return Err(invalid_argument!(
                "{} needs host memory, pool {} holds {} memory",
                op,
                self.id,
                self.kind
            ));
        }
        Ok(())
    }

    /// Address of a live handle, `None` for zero-length handles
    fn live_ptr(&self, handle: &PoolHandle) -> DistResult<Option<NonNull<u8>>> {
        self.check_owner(handle)?;
        let Some(block_id) = handle.block else {
            return Ok(None);
        };

        let block = self
            .block_index(block_id)
            .map(|index| &self.blocks[index])
            .ok_or_else(|| {
                DistMemError::UseAfterFree(format!(
                    "block {} of pool {} no longer exists (handle at offset {}, {} bytes)",
                    block_id, self.id, handle.offset, handle.len
                ))
            })?;

        block
            .find_used(handle.offset, handle.token)
            .map_err(|fault| DistMemError::UseAfterFree(describe_fault(fault, block_id, handle)))?;

        Ok(Some(block.ptr_at(handle.offset)))
    }

    fn check_if_enabled(&self) -> DistResult<()> {
        if self.config.check_invariants {
            self.validate()?;
        }
        Ok(())
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        if self.num_stored_ptr > 0 {
            tracing::warn!(
                "MemoryPool[{}]: dropped with {} live handles ({} bytes in use)",
                self.id,
                self.num_stored_ptr,
                self.total_size - self.free_size
            );
        }
        for block in self.blocks.drain(..) {
            // SAFETY: every block came from raw_alloc(capacity) and is released once
            unsafe { self.allocator.raw_free(block.base(), block.capacity()) };
        }
    }
}

fn describe_fault(fault: SegmentFault, block_id: BlockId, handle: &PoolHandle) -> String {
    match fault {
        SegmentFault::NotFound => format!(
            "no segment starts at offset {} of block {} (handle of {} bytes)",
            handle.offset, block_id, handle.len
        ),
        SegmentFault::AlreadyFree => format!(
            "segment at offset {} of block {} is already free",
            handle.offset, block_id
        ),
        SegmentFault::TokenMismatch { current } => format!(
            "segment at offset {} of block {} now belongs to allocation #{}, handle is #{}",
            handle.offset, block_id, current, handle.token
        ),
    }
}

/// Round `value` up to a power-of-two `alignment`
fn align_up(value: usize, alignment: usize) -> Option<usize> {
    value
        .checked_add(alignment - 1)
        .map(|v| v & !(alignment - 1))
}
