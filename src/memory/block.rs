//! Memory blocks and their segment records
//!
//! A block is one raw reservation. Its segments are kept sorted by offset
//! and tile `[0, capacity)` exactly; adjacent free segments are merged as
//! soon as they appear, so no two free segments are ever neighbors.

use std::ptr::NonNull;

/// Stable identifier of a block within its pool
pub type BlockId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentState {
    Free,
    /// Live allocation, tagged with the token of the handle that owns it
    Used { token: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Segment {
    pub offset: usize,
    pub len: usize,
    pub state: SegmentState,
}

impl Segment {
    fn free(offset: usize, len: usize) -> Self {
        Self {
            offset,
            len,
            state: SegmentState::Free,
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self.state, SegmentState::Free)
    }

    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// Check if this segment ends where `other` starts
    pub fn is_adjacent_to(&self, other: &Segment) -> bool {
        self.end() == other.offset
    }
}

/// Why a segment lookup by `(offset, token)` failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentFault {
    /// No segment starts at the offset (it was merged into a free neighbor)
    NotFound,
    /// The segment is free
    AlreadyFree,
    /// The segment was handed out again to a newer handle
    TokenMismatch { current: u64 },
}

/// One raw reservation carved into segments
#[derive(Debug)]
pub(crate) struct MemoryBlock {
    id: BlockId,
    base: NonNull<u8>,
    capacity: usize,
    segments: Vec<Segment>,
}

// SAFETY: the block only stores the address of a reservation it exclusively
// owns; access goes through the owning pool
unsafe impl Send for MemoryBlock {}

impl MemoryBlock {
    pub fn new(id: BlockId, base: NonNull<u8>, capacity: usize) -> Self {
        Self {
            id,
            base,
            capacity,
            segments: vec![Segment::free(0, capacity)],
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(test)]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Address of `offset` bytes into the block
    pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.capacity);
        // SAFETY: offset stays within (or one past) the reservation
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// Smallest free segment holding at least `len` bytes
    ///
    /// Returns `(segment index, segment length)`; ties go to the lowest offset.
    pub fn best_fit(&self, len: usize) -> Option<(usize, usize)> {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, seg)| seg.is_free() && seg.len >= len)
            .map(|(idx, seg)| (idx, seg.len))
            .min_by_key(|&(_, seg_len)| seg_len)
    }

    /// Turn the first `len` bytes of free segment `index` into a used
    /// segment owned by `token`; the remainder stays free.
    ///
    /// Returns the offset of the new used segment.
    pub fn carve(&mut self, index: usize, len: usize, token: u64) -> usize {
        let seg = self.segments[index];
        debug_assert!(seg.is_free() && seg.len >= len && len > 0);

        self.segments[index] = Segment {
            offset: seg.offset,
            len,
            state: SegmentState::Used { token },
        };
        if seg.len > len {
            self.segments
                .insert(index + 1, Segment::free(seg.offset + len, seg.len - len));
        }
        seg.offset
    }

    /// Locate the used segment at `offset` owned by `token`
    pub fn find_used(&self, offset: usize, token: u64) -> Result<&Segment, SegmentFault> {
        let index = self.index_of(offset)?;
        let seg = &self.segments[index];
        match seg.state {
            SegmentState::Free => Err(SegmentFault::AlreadyFree),
            SegmentState::Used { token: current } if current != token => {
                Err(SegmentFault::TokenMismatch { current })
            }
            SegmentState::Used { .. } => Ok(seg),
        }
    }

    /// Free the used segment at `offset` owned by `token` and coalesce it
    /// with free neighbors. Returns the number of bytes released.
    pub fn release(&mut self, offset: usize, token: u64) -> Result<usize, SegmentFault> {
        let len = self.find_used(offset, token)?.len;
        let mut index = self.index_of(offset)?;
        self.segments[index].state = SegmentState::Free;

        if index + 1 < self.segments.len() && self.segments[index + 1].is_free() {
            let next = self.segments.remove(index + 1);
            self.segments[index].len += next.len;
        }
        if index > 0 && self.segments[index - 1].is_free() {
            let current = self.segments.remove(index);
            index -= 1;
            self.segments[index].len += current.len;
        }
        Ok(len)
    }

    /// True when the block holds no live segment
    pub fn is_unused(&self) -> bool {
        self.segments.len() == 1 && self.segments[0].is_free()
    }

    pub fn free_bytes(&self) -> usize {
        self.segments
            .iter()
            .filter(|seg| seg.is_free())
            .map(|seg| seg.len)
            .sum()
    }

    pub fn largest_free(&self) -> usize {
        self.segments
            .iter()
            .filter(|seg| seg.is_free())
            .map(|seg| seg.len)
            .max()
            .unwrap_or(0)
    }

    pub fn used_segments(&self) -> usize {
        self.segments.iter().filter(|seg| !seg.is_free()).count()
    }

    /// Verify that segments tile the block and free segments are coalesced
    pub fn check_layout(&self) -> Result<(), String> {
        let first = self
            .segments
            .first()
            .ok_or_else(|| "block has no segments".to_string())?;
        if first.offset != 0 {
            return Err(format!("first segment starts at {}, expected 0", first.offset));
        }

        for pair in self.segments.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if !prev.is_adjacent_to(next) {
                return Err(format!(
                    "segment [{}, {}) is followed by segment starting at {}",
                    prev.offset,
                    prev.end(),
                    next.offset
                ));
            }
            if prev.is_free() && next.is_free() {
                return Err(format!(
                    "adjacent free segments at offsets {} and {} were not coalesced",
                    prev.offset, next.offset
                ));
            }
        }

        if let Some(seg) = self.segments.iter().find(|seg| seg.len == 0) {
            return Err(format!("empty segment at offset {}", seg.offset));
        }

        let end = self.segments.last().map(Segment::end).unwrap_or(0);
        if end != self.capacity {
            return Err(format!(
                "segments end at {} but capacity is {}",
                end, self.capacity
            ));
        }
        Ok(())
    }

    fn index_of(&self, offset: usize) -> Result<usize, SegmentFault> {
        self.segments
            .binary_search_by_key(&offset, |seg| seg.offset)
            .map_err(|_| SegmentFault::NotFound)
    }
}
