//! All-to-all transfer plans
//!
//! A plan is one participant's row (and column) of the `P x P` transfer
//! matrix: how many elements it sends to and receives from every peer, and
//! where those elements sit in its send and receive buffers.

use crate::distribution::{block_range, BlockDistribution};
use crate::error::DistResult;
use crate::{invalid_argument, invariant_violation};

/// Counts and displacements for one participant's `alltoallv` call
///
/// All values are in elements. Displacements are exclusive prefix sums of
/// the matching counts, in participant order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlltoallPlan {
    pub sendcounts: Vec<usize>,
    pub sdispls: Vec<usize>,
    pub recvcounts: Vec<usize>,
    pub rdispls: Vec<usize>,
}

impl AlltoallPlan {
    /// Plan from counts; displacements are derived
    pub fn from_counts(sendcounts: Vec<usize>, recvcounts: Vec<usize>) -> DistResult<Self> {
        if sendcounts.len() != recvcounts.len() {
            return Err(invalid_argument!(
                "plan has {} send counts but {} receive counts",
                sendcounts.len(),
                recvcounts.len()
            ));
        }
        let sdispls = exclusive_prefix_sum(&sendcounts)?;
        let rdispls = exclusive_prefix_sum(&recvcounts)?;
        Ok(Self {
            sendcounts,
            sdispls,
            recvcounts,
            rdispls,
        })
    }

    pub fn num_participants(&self) -> usize {
        self.sendcounts.len()
    }

    /// Elements this participant sends (send buffer length)
    pub fn total_send(&self) -> usize {
        self.sendcounts.iter().sum()
    }

    /// Elements this participant receives (receive buffer length)
    pub fn total_recv(&self) -> usize {
        self.recvcounts.iter().sum()
    }

    /// Same plan in units of `factor` (e.g. element size in bytes)
    pub fn scaled(&self, factor: usize) -> DistResult<Self> {
        let scale = |counts: &[usize]| -> DistResult<Vec<usize>> {
            counts
                .iter()
                .map(|&c| {
                    c.checked_mul(factor)
                        .ok_or_else(|| invalid_argument!("{} elements of {} units overflow", c, factor))
                })
                .collect()
        };
        Self::from_counts(scale(&self.sendcounts)?, scale(&self.recvcounts)?)
    }

    /// Check array lengths and that displacements are prefix sums of counts
    pub fn validate(&self) -> DistResult<()> {
        let p = self.sendcounts.len();
        if p == 0 {
            return Err(invalid_argument!("plan has no participants"));
        }
        for (name, len) in [
            ("sdispls", self.sdispls.len()),
            ("recvcounts", self.recvcounts.len()),
            ("rdispls", self.rdispls.len()),
        ] {
            if len != p {
                return Err(invalid_argument!(
                    "plan {} has {} entries, expected {}",
                    name,
                    len,
                    p
                ));
            }
        }

        check_displacements("send", &self.sendcounts, &self.sdispls)?;
        check_displacements("receive", &self.recvcounts, &self.rdispls)
    }

    /// Transpose plan from row slabs to column slabs of a column-major
    /// `num_rows x num_cols` matrix
    ///
    /// Before the exchange every participant holds its block of rows for all
    /// columns; afterwards it holds all rows for its block of columns, stored
    /// as one `rows(p) x my_cols` chunk per source participant `p`.
    pub fn rows_to_columns(
        num_rows: usize,
        num_cols: usize,
        group_size: usize,
        rank: usize,
    ) -> DistResult<Self> {
        let rows = BlockDistribution::new(num_rows, group_size, rank)?;
        let cols = BlockDistribution::new(num_cols, group_size, rank)?;

        let chunk = |a: usize, b: usize| {
            a.checked_mul(b).ok_or_else(|| {
                invalid_argument!(
                    "{}x{} chunk of a {}x{} matrix overflows usize",
                    a,
                    b,
                    num_rows,
                    num_cols
                )
            })
        };
        let sendcounts = cols
            .counts()
            .into_iter()
            .map(|c| chunk(rows.local_size(), c))
            .collect::<DistResult<Vec<_>>>()?;
        let recvcounts = rows
            .counts()
            .into_iter()
            .map(|r| chunk(r, cols.local_size()))
            .collect::<DistResult<Vec<_>>>()?;
        Self::from_counts(sendcounts, recvcounts)
    }

    /// Inverse of [`rows_to_columns`](Self::rows_to_columns)
    pub fn columns_to_rows(
        num_rows: usize,
        num_cols: usize,
        group_size: usize,
        rank: usize,
    ) -> DistResult<Self> {
        let forward = Self::rows_to_columns(num_rows, num_cols, group_size, rank)?;
        Ok(Self {
            sendcounts: forward.recvcounts,
            sdispls: forward.rdispls,
            recvcounts: forward.sendcounts,
            rdispls: forward.sdispls,
        })
    }

    /// Move a block-distributed sequence of `global_count` elements from the
    /// first `src_parts` participants to the first `dst_parts` participants
    ///
    /// Boundaries come from the block distribution closed form, so no count
    /// vector has to be built or exchanged.
    pub fn regroup(
        global_count: usize,
        src_parts: usize,
        dst_parts: usize,
        group_size: usize,
        rank: usize,
    ) -> DistResult<Self> {
        for (name, parts) in [("source", src_parts), ("destination", dst_parts)] {
            if parts == 0 || parts > group_size {
                return Err(invalid_argument!(
                    "{} layout over {} parts does not fit a group of {}",
                    name,
                    parts,
                    group_size
                ));
            }
        }
        if rank >= group_size {
            return Err(invalid_argument!(
                "rank {} out of range for group of {}",
                rank,
                group_size
            ));
        }

        let src = |p: usize| {
            if p < src_parts {
                block_range(global_count, src_parts, p)
            } else {
                global_count..global_count
            }
        };
        let dst = |p: usize| {
            if p < dst_parts {
                block_range(global_count, dst_parts, p)
            } else {
                global_count..global_count
            }
        };

        let mine_src = src(rank);
        let mine_dst = dst(rank);
        let sendcounts = (0..group_size)
            .map(|j| {
                let d = dst(j);
                overlap(mine_src.start, mine_src.end, d.start, d.end)
            })
            .collect();
        let recvcounts = (0..group_size)
            .map(|i| {
                let s = src(i);
                overlap(s.start, s.end, mine_dst.start, mine_dst.end)
            })
            .collect();
        Self::from_counts(sendcounts, recvcounts)
    }
}

/// Plan the exchange that turns `counts_in` into `counts_out`
///
/// `counts_in[k]` is what participant `k` holds now, `counts_out[k]` what it
/// holds afterwards. Both vectors are known to every participant, so each one
/// computes its own row without communication. Elements keep their global
/// order: laying both partitions over the same index line, participant `i`
/// sends participant `j` exactly the overlap of source interval `i` and
/// destination interval `j`.
///
/// # Errors
/// - `InvalidArgument` for empty or mismatched vectors and out-of-range ranks
/// - `InvariantViolation` if the two vectors do not hold the same total
///
/// # Example
/// ```
/// use distmem::map_alltoall;
///
/// let plan = map_alltoall(&[16, 16], &[24, 8], 1)?;
/// assert_eq!(plan.sendcounts, vec![8, 8]);
/// assert_eq!(plan.recvcounts, vec![0, 8]);
/// # Ok::<(), distmem::DistMemError>(())
/// ```
pub fn map_alltoall(counts_in: &[usize], counts_out: &[usize], rank: usize) -> DistResult<AlltoallPlan> {
    let p = counts_in.len();
    if p == 0 {
        return Err(invalid_argument!("all-to-all over an empty group"));
    }
    if counts_out.len() != p {
        return Err(invalid_argument!(
            "counts_in has {} entries but counts_out has {}",
            p,
            counts_out.len()
        ));
    }
    if rank >= p {
        return Err(invalid_argument!(
            "rank {} out of range for group of {}",
            rank,
            p
        ));
    }

    let total_in = checked_sum(counts_in)?;
    let total_out = checked_sum(counts_out)?;
    if total_in != total_out {
        return Err(invariant_violation!(
            "all-to-all volume mismatch: counts_in sum to {} but counts_out sum to {}",
            total_in,
            total_out
        ));
    }

    let my_src_start: usize = counts_in[..rank].iter().sum();
    let my_src_end = my_src_start + counts_in[rank];
    let my_dst_start: usize = counts_out[..rank].iter().sum();
    let my_dst_end = my_dst_start + counts_out[rank];

    let sendcounts = row_overlaps(counts_out, my_src_start, my_src_end);
    let recvcounts = row_overlaps(counts_in, my_dst_start, my_dst_end);

    tracing::trace!(
        "map_alltoall: rank {} of {} sends {} and receives {} of {} elements",
        rank,
        p,
        counts_in[rank],
        counts_out[rank],
        total_in
    );

    AlltoallPlan::from_counts(sendcounts, recvcounts)
}

/// Overlap of `[start, end)` with every interval of the partition `counts`
///
/// Sweeps the partition boundaries once; intervals entirely past `end`
/// contribute zero without further arithmetic.
fn row_overlaps(counts: &[usize], start: usize, end: usize) -> Vec<usize> {
    let mut result = Vec::with_capacity(counts.len());
    let mut lo = 0usize;
    for &count in counts {
        let hi = lo + count;
        result.push(overlap(start, end, lo, hi));
        lo = hi;
    }
    result
}

fn overlap(a_start: usize, a_end: usize, b_start: usize, b_end: usize) -> usize {
    a_end.min(b_end).saturating_sub(a_start.max(b_start))
}

fn checked_sum(counts: &[usize]) -> DistResult<usize> {
    counts
        .iter()
        .try_fold(0usize, |acc, &c| acc.checked_add(c))
        .ok_or_else(|| invalid_argument!("element counts overflow usize"))
}

fn exclusive_prefix_sum(counts: &[usize]) -> DistResult<Vec<usize>> {
    let mut displs = Vec::with_capacity(counts.len());
    let mut acc = 0usize;
    for &count in counts {
        displs.push(acc);
        acc = acc
            .checked_add(count)
            .ok_or_else(|| invalid_argument!("element counts overflow usize"))?;
    }
    Ok(displs)
}

fn check_displacements(direction: &str, counts: &[usize], displs: &[usize]) -> DistResult<()> {
    let expected = exclusive_prefix_sum(counts)?;
    if let Some(k) = (0..counts.len()).find(|&k| expected[k] != displs[k]) {
        return Err(invariant_violation!(
            "{} displacement of participant {} is {}, expected {}",
            direction,
            k,
            displs[k],
            expected[k]
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::block_size;
    use crate::error::DistMemError;

    fn block_size_or_zero(global_count: usize, parts: usize, rank: usize) -> usize {
        if rank < parts {
            block_size(global_count, parts, rank)
        } else {
            0
        }
    }

    #[test]
    fn test_gather_to_first_participant() {
        let counts_in = [16, 16, 16, 16];
        let counts_out = [64, 0, 0, 0];

        let root = map_alltoall(&counts_in, &counts_out, 0).unwrap();
        assert_eq!(root.recvcounts, vec![16, 16, 16, 16]);
        assert_eq!(root.rdispls, vec![0, 16, 32, 48]);
        assert_eq!(root.sendcounts, vec![16, 0, 0, 0]);

        for rank in 1..4 {
            let plan = map_alltoall(&counts_in, &counts_out, rank).unwrap();
            assert_eq!(plan.sendcounts, vec![16, 0, 0, 0]);
            assert_eq!(plan.recvcounts, vec![0, 0, 0, 0]);
            assert_eq!(plan.total_recv(), 0);
        }
    }

    #[test]
    fn test_uneven_split() {
        let p0 = map_alltoall(&[16, 16], &[24, 8], 0).unwrap();
        let p1 = map_alltoall(&[16, 16], &[24, 8], 1).unwrap();
        assert_eq!(p0.sendcounts, vec![16, 0]);
        assert_eq!(p1.sendcounts, vec![8, 8]);
        assert_eq!(p0.recvcounts, vec![16, 8]);
        assert_eq!(p1.recvcounts, vec![0, 8]);
        assert_eq!(p1.sdispls, vec![0, 8]);
    }

    #[test]
    fn test_single_participant() {
        let plan = map_alltoall(&[5], &[5], 0).unwrap();
        assert_eq!(plan.sendcounts, vec![5]);
        assert_eq!(plan.recvcounts, vec![5]);
        assert_eq!(plan.sdispls, vec![0]);
    }

    #[test]
    fn test_empty_intervals_contribute_nothing() {
        let plan = map_alltoall(&[0, 10, 0], &[5, 0, 5], 1).unwrap();
        assert_eq!(plan.sendcounts, vec![5, 0, 5]);
        assert_eq!(plan.sdispls, vec![0, 5, 5]);
        assert_eq!(plan.recvcounts, vec![0, 0, 0]);

        let plan = map_alltoall(&[0, 0], &[0, 0], 0).unwrap();
        assert_eq!(plan.total_send(), 0);
    }

    #[test]
    fn test_volume_mismatch_is_invariant_violation() {
        let err = map_alltoall(&[16, 16], &[16, 15], 0).unwrap_err();
        assert!(err.is_internal_error());
        assert!(err.to_string().contains("32"));
        assert!(err.to_string().contains("31"));
    }

    #[test]
    fn test_malformed_inputs() {
        assert!(map_alltoall(&[], &[], 0).unwrap_err().is_user_error());
        assert!(map_alltoall(&[1, 2], &[3], 0).unwrap_err().is_user_error());
        assert!(map_alltoall(&[1, 2], &[2, 1], 2).unwrap_err().is_user_error());
        assert!(matches!(
            map_alltoall(&[usize::MAX, 1], &[1, 1], 0).unwrap_err(),
            DistMemError::InvalidArgument(_)
        ));
    }

    #[test]
    fn test_rows_to_columns_counts() {
        // 10 rows, 6 columns over 3 participants: rows [4, 3, 3], columns [2, 2, 2]
        let plan = AlltoallPlan::rows_to_columns(10, 6, 3, 0).unwrap();
        assert_eq!(plan.sendcounts, vec![8, 8, 8]);
        assert_eq!(plan.recvcounts, vec![8, 6, 6]);
        assert_eq!(plan.total_send(), 4 * 6);
        assert_eq!(plan.total_recv(), 10 * 2);
        plan.validate().unwrap();

        let back = AlltoallPlan::columns_to_rows(10, 6, 3, 0).unwrap();
        assert_eq!(back.sendcounts, plan.recvcounts);
        assert_eq!(back.recvcounts, plan.sendcounts);
        back.validate().unwrap();
    }

    #[test]
    fn test_scaled_to_bytes() {
        let plan = map_alltoall(&[3, 1], &[2, 2], 0).unwrap();
        let bytes = plan.scaled(16).unwrap();
        assert_eq!(bytes.sendcounts, vec![32, 16]);
        assert_eq!(bytes.sdispls, vec![0, 32]);
        assert_eq!(bytes.total_recv(), plan.total_recv() * 16);
        assert!(plan.scaled(usize::MAX).unwrap_err().is_user_error());
    }

    #[test]
    fn test_transpose_overflow_rejected() {
        let err = AlltoallPlan::rows_to_columns(usize::MAX / 2, 4, 1, 0).unwrap_err();
        assert!(matches!(err, DistMemError::InvalidArgument(_)));
        assert!(err.to_string().contains("overflows"));

        let err = AlltoallPlan::columns_to_rows(4, usize::MAX / 2, 1, 0).unwrap_err();
        assert!(err.is_user_error());

        // Per-participant chunks fit even though the whole matrix would not
        let plan = AlltoallPlan::rows_to_columns(1 << 20, 1 << 20, 1 << 12, 0).unwrap();
        assert_eq!(plan.sendcounts[0], 1 << 16);
    }

    #[test]
    fn test_rows_to_single_column_matches_gather() {
        for rank in 0..4 {
            let direct = AlltoallPlan::rows_to_columns(64, 1, 4, rank).unwrap();
            let general = map_alltoall(&[16, 16, 16, 16], &[64, 0, 0, 0], rank).unwrap();
            assert_eq!(direct, general);
        }
    }

    #[test]
    fn test_regroup_matches_map_alltoall() {
        let (n, group) = (23, 5);
        for (src_parts, dst_parts) in [(5, 5), (5, 2), (3, 5), (1, 4)] {
            let counts = |parts: usize| -> Vec<usize> {
                (0..group).map(|p| block_size_or_zero(n, parts, p)).collect()
            };
            let counts_in = counts(src_parts);
            let counts_out = counts(dst_parts);
            for rank in 0..group {
                let direct = AlltoallPlan::regroup(n, src_parts, dst_parts, group, rank).unwrap();
                let general = map_alltoall(&counts_in, &counts_out, rank).unwrap();
                assert_eq!(direct, general, "src {} dst {} rank {}", src_parts, dst_parts, rank);
            }
        }
    }

    #[test]
    fn test_regroup_same_layout_keeps_data_local() {
        let plan = AlltoallPlan::regroup(10, 3, 3, 3, 1).unwrap();
        assert_eq!(plan.sendcounts, vec![0, 3, 0]);
        assert_eq!(plan.recvcounts, vec![0, 3, 0]);
    }

    #[test]
    fn test_regroup_rejects_oversized_layouts() {
        assert!(AlltoallPlan::regroup(10, 4, 2, 3, 0).is_err());
        assert!(AlltoallPlan::regroup(10, 2, 0, 3, 0).is_err());
        assert!(AlltoallPlan::regroup(10, 2, 2, 3, 3).is_err());
    }

    #[test]
    fn test_validate_detects_bad_displacements() {
        let mut plan = map_alltoall(&[4, 4], &[4, 4], 0).unwrap();
        plan.validate().unwrap();

        plan.rdispls[1] = 3;
        assert!(plan.validate().unwrap_err().is_internal_error());

        plan.rdispls.pop();
        assert!(plan.validate().unwrap_err().is_user_error());
    }
}
