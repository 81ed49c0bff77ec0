//! All-to-all planning integration tests

mod common;

use common::{assert_plans_symmetric, gather_plans};
use distmem::{map_alltoall, AlltoallPlan, BlockDistribution, Communicator};
use proptest::prelude::*;

#[test]
fn test_gather_everything_to_first() -> anyhow::Result<()> {
    let plans = gather_plans(4, |comm| map_alltoall(&[16; 4], &[64, 0, 0, 0], comm.rank()))?;

    assert_eq!(plans[0].recvcounts, vec![16, 16, 16, 16]);
    assert_eq!(plans[0].sendcounts, vec![16, 0, 0, 0]);
    for plan in &plans[1..] {
        assert_eq!(plan.sendcounts, vec![16, 0, 0, 0]);
        assert_eq!(plan.recvcounts, vec![0, 0, 0, 0]);
    }
    assert_plans_symmetric(&plans);
    Ok(())
}

#[test]
fn test_split_into_uneven_halves() -> anyhow::Result<()> {
    let plans = gather_plans(2, |comm| map_alltoall(&[16, 16], &[24, 8], comm.rank()))?;

    assert_eq!(plans[0].sendcounts, vec![16, 0]);
    assert_eq!(plans[1].sendcounts, vec![8, 8]);
    assert_plans_symmetric(&plans);
    Ok(())
}

#[test]
fn test_spread_over_first_two() -> anyhow::Result<()> {
    // Every participant holds 16, the first two end up with half each
    let p = 6;
    let counts_out: Vec<usize> = (0..p).map(|k| if k < 2 { 8 * p } else { 0 }).collect();
    let plans = gather_plans(p, |comm| map_alltoall(&vec![16; p], &counts_out, comm.rank()))?;

    assert_plans_symmetric(&plans);
    for (rank, plan) in plans.iter().enumerate() {
        assert_eq!(plan.total_send(), 16);
        assert_eq!(plan.total_recv(), counts_out[rank]);
    }
    Ok(())
}

#[test]
fn test_volume_mismatch_refused() {
    let err = map_alltoall(&[10, 10, 10], &[10, 10, 11], 2).unwrap_err();
    assert!(err.is_internal_error());
    assert!(err.to_string().contains("volume mismatch"));
}

#[test]
fn test_transpose_plans_are_symmetric() -> anyhow::Result<()> {
    let (rows, cols) = (37, 11);
    let forward = gather_plans(5, |comm| AlltoallPlan::rows_to_columns(rows, cols, comm.size(), comm.rank()))?;
    let backward = gather_plans(5, |comm| AlltoallPlan::columns_to_rows(rows, cols, comm.size(), comm.rank()))?;

    assert_plans_symmetric(&forward);
    assert_plans_symmetric(&backward);

    let row_split = BlockDistribution::new(rows, 5, 0)?;
    let col_split = BlockDistribution::new(cols, 5, 0)?;
    for rank in 0..5 {
        assert_eq!(forward[rank].total_send(), row_split.local_size_of(rank)? * cols);
        assert_eq!(forward[rank].total_recv(), rows * col_split.local_size_of(rank)?);
    }
    Ok(())
}

#[test]
fn test_regroup_agrees_with_general_planner() -> anyhow::Result<()> {
    let (n, group) = (1000, 8);
    for (src, dst) in [(8, 8), (8, 3), (2, 8), (5, 5), (1, 1)] {
        let counts = |parts: usize| -> Vec<usize> {
            let spl = BlockDistribution::new(n, parts, 0).unwrap();
            (0..group).map(|p| if p < parts { spl.local_size_of(p).unwrap() } else { 0 }).collect()
        };
        let (counts_in, counts_out) = (counts(src), counts(dst));

        let direct = gather_plans(group, |comm| AlltoallPlan::regroup(n, src, dst, comm.size(), comm.rank()))?;
        let general = gather_plans(group, |comm| map_alltoall(&counts_in, &counts_out, comm.rank()))?;
        assert_eq!(direct, general, "regroup {} -> {}", src, dst);
        assert_plans_symmetric(&direct);
    }
    Ok(())
}

fn counts_with_total(parts: Vec<usize>, total: usize) -> Vec<usize> {
    // Scale arbitrary weights to an exact total, remainder to the last entry
    let weight: usize = parts.iter().sum::<usize>().max(1);
    let mut counts: Vec<usize> = parts.iter().map(|&w| w * total / weight).collect();
    let assigned: usize = counts.iter().sum();
    if let Some(last) = counts.last_mut() {
        *last += total - assigned;
    }
    counts
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_every_participant_agrees(
        weights_in in prop::collection::vec(0usize..50, 1..12),
        weights_out_seed in prop::collection::vec(0usize..50, 12),
        total in 0usize..5_000,
    ) {
        let p = weights_in.len();
        let counts_in = counts_with_total(weights_in, total);
        let counts_out = counts_with_total(weights_out_seed[..p].to_vec(), total);

        let plans: Vec<AlltoallPlan> = (0..p)
            .map(|rank| map_alltoall(&counts_in, &counts_out, rank).unwrap())
            .collect();

        for (i, sender) in plans.iter().enumerate() {
            prop_assert_eq!(sender.total_send(), counts_in[i]);
            prop_assert_eq!(sender.total_recv(), counts_out[i]);
            for (j, receiver) in plans.iter().enumerate() {
                prop_assert_eq!(sender.sendcounts[j], receiver.recvcounts[i]);
            }
        }
    }

    #[test]
    fn prop_displacements_are_prefix_sums(
        counts_in in prop::collection::vec(0usize..1_000, 1..16),
        rank_pick in any::<prop::sample::Index>(),
    ) {
        let total: usize = counts_in.iter().sum();
        let mut counts_out = vec![0; counts_in.len()];
        counts_out[counts_in.len() - 1] = total;
        let rank = rank_pick.index(counts_in.len());

        let plan = map_alltoall(&counts_in, &counts_out, rank).unwrap();
        let mut s = 0;
        let mut r = 0;
        for k in 0..counts_in.len() {
            prop_assert_eq!(plan.sdispls[k], s);
            prop_assert_eq!(plan.rdispls[k], r);
            s += plan.sendcounts[k];
            r += plan.recvcounts[k];
        }
        prop_assert!(plan.validate().is_ok());
    }

    #[test]
    fn prop_mismatch_always_refused(
        counts_in in prop::collection::vec(0usize..1_000, 1..16),
        extra in 1usize..100,
    ) {
        let mut counts_out = counts_in.clone();
        counts_out[0] += extra;
        let err = map_alltoall(&counts_in, &counts_out, 0).unwrap_err();
        prop_assert!(err.is_internal_error());
    }
}
