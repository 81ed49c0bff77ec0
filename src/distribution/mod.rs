//! Block distribution of a global index range
//!
//! Splits `global_count` consecutive indices over `num_parts` participants:
//! with `q = global_count / num_parts` and `r = global_count % num_parts`,
//! ranks `[0, r)` own `q + 1` indices and ranks `[r, num_parts)` own `q`.
//! Ownership is contiguous and ordered by rank, so every participant can
//! compute any other participant's share locally, without communication.

use std::ops::Range;

use crate::comm::Communicator;
use crate::error::DistResult;
use crate::invalid_argument;

/// Balanced, order-preserving split of `[0, global_count)` over `num_parts`
/// participants, viewed from participant `rank`
///
/// # Example
/// ```
/// use distmem::BlockDistribution;
///
/// let spl = BlockDistribution::new(10, 3, 1)?;
/// assert_eq!(spl.counts(), vec![4, 3, 3]);
/// assert_eq!(spl.offsets(), vec![0, 4, 7]);
/// assert_eq!(spl.local_size(), 3);
/// assert_eq!(spl.global_offset(), 4);
/// # Ok::<(), distmem::DistMemError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockDistribution {
    global_count: usize,
    num_parts: usize,
    rank: usize,
}

impl BlockDistribution {
    /// Create the distribution seen by `rank`
    ///
    /// # Errors
    /// `InvalidArgument` if `num_parts == 0` or `rank >= num_parts`.
    pub fn new(global_count: usize, num_parts: usize, rank: usize) -> DistResult<Self> {
        if num_parts == 0 {
            return Err(invalid_argument!(
                "block distribution of {} indices needs at least one part",
                global_count
            ));
        }
        if rank >= num_parts {
            return Err(invalid_argument!(
                "rank {} out of range for {} parts",
                rank,
                num_parts
            ));
        }
        Ok(Self {
            global_count,
            num_parts,
            rank,
        })
    }

    /// Distribution over the participants of `comm`, seen by its own rank
    pub fn for_communicator<C: Communicator>(global_count: usize, comm: &C) -> DistResult<Self> {
        Self::new(global_count, comm.size(), comm.rank())
    }

    pub fn global_count(&self) -> usize {
        self.global_count
    }

    pub fn num_parts(&self) -> usize {
        self.num_parts
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of indices owned by this rank
    pub fn local_size(&self) -> usize {
        block_size(self.global_count, self.num_parts, self.rank)
    }

    /// First global index owned by this rank
    pub fn global_offset(&self) -> usize {
        block_offset(self.global_count, self.num_parts, self.rank)
    }

    /// Number of indices owned by `rank`
    pub fn local_size_of(&self, rank: usize) -> DistResult<usize> {
        self.check_rank(rank)?;
        Ok(block_size(self.global_count, self.num_parts, rank))
    }

    /// First global index owned by `rank`
    pub fn global_offset_of(&self, rank: usize) -> DistResult<usize> {
        self.check_rank(rank)?;
        Ok(block_offset(self.global_count, self.num_parts, rank))
    }

    /// Global indices owned by this rank
    pub fn range(&self) -> Range<usize> {
        block_range(self.global_count, self.num_parts, self.rank)
    }

    /// Global indices owned by `rank`
    pub fn range_of(&self, rank: usize) -> DistResult<Range<usize>> {
        self.check_rank(rank)?;
        Ok(block_range(self.global_count, self.num_parts, rank))
    }

    /// Per-rank local sizes
    pub fn counts(&self) -> Vec<usize> {
        (0..self.num_parts)
            .map(|p| block_size(self.global_count, self.num_parts, p))
            .collect()
    }

    /// Per-rank global offsets (exclusive prefix sums of [`counts`](Self::counts))
    pub fn offsets(&self) -> Vec<usize> {
        (0..self.num_parts)
            .map(|p| block_offset(self.global_count, self.num_parts, p))
            .collect()
    }

    /// Owner rank and local index of a global index
    pub fn location(&self, global_index: usize) -> DistResult<(usize, usize)> {
        if global_index >= self.global_count {
            return Err(invalid_argument!(
                "global index {} out of range for {} indices",
                global_index,
                self.global_count
            ));
        }

        let q = self.global_count / self.num_parts;
        let r = self.global_count % self.num_parts;
        let boundary = r * (q + 1);

        // q == 0 implies global_count == r, so every index is below the boundary
        if global_index < boundary {
            Ok((global_index / (q + 1), global_index % (q + 1)))
        } else {
            let shifted = global_index - boundary;
            Ok((r + shifted / q, shifted % q))
        }
    }

    /// Global index of `local_index` on `rank`
    pub fn global_index(&self, rank: usize, local_index: usize) -> DistResult<usize> {
        let size = self.local_size_of(rank)?;
        if local_index >= size {
            return Err(invalid_argument!(
                "local index {} out of range for rank {} holding {} indices",
                local_index,
                rank,
                size
            ));
        }
        Ok(block_offset(self.global_count, self.num_parts, rank) + local_index)
    }

    fn check_rank(&self, rank: usize) -> DistResult<()> {
        if rank >= self.num_parts {
            return Err(invalid_argument!(
                "rank {} out of range for {} parts",
                rank,
                self.num_parts
            ));
        }
        Ok(())
    }
}

// Unchecked closed forms; callers guarantee num_parts > 0 and rank < num_parts

pub(crate) fn block_size(global_count: usize, num_parts: usize, rank: usize) -> usize {
    let q = global_count / num_parts;
    let r = global_count % num_parts;
    if rank < r {
        q + 1
    } else {
        q
    }
}

pub(crate) fn block_offset(global_count: usize, num_parts: usize, rank: usize) -> usize {
    let q = global_count / num_parts;
    let r = global_count % num_parts;
    rank * q + rank.min(r)
}

pub(crate) fn block_range(global_count: usize, num_parts: usize, rank: usize) -> Range<usize> {
    let start = block_offset(global_count, num_parts, rank);
    start..start + block_size(global_count, num_parts, rank)
}
