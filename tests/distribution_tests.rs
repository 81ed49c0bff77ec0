//! Block distribution integration tests

mod common;

use distmem::{BlockDistribution, LocalGroup};
use proptest::prelude::*;

#[test]
fn test_ten_over_three() -> anyhow::Result<()> {
    for rank in 0..3 {
        let spl = BlockDistribution::new(10, 3, rank)?;
        assert_eq!(spl.counts(), vec![4, 3, 3]);
        assert_eq!(spl.offsets(), vec![0, 4, 7]);
        assert_eq!(spl.local_size(), [4, 3, 3][rank]);
        assert_eq!(spl.global_offset(), [0, 4, 7][rank]);
    }
    Ok(())
}

#[test]
fn test_every_participant_computes_the_same_table() -> anyhow::Result<()> {
    let views = LocalGroup::run(5, |comm| {
        let spl = BlockDistribution::for_communicator(23, comm)?;
        Ok((spl.local_size(), spl.global_offset(), spl.counts(), spl.offsets()))
    })?;

    let (_, _, counts, offsets) = &views[0];
    for (rank, (local_size, global_offset, c, o)) in views.iter().enumerate() {
        assert_eq!(c, counts);
        assert_eq!(o, offsets);
        assert_eq!(*local_size, counts[rank]);
        assert_eq!(*global_offset, offsets[rank]);
    }
    assert_eq!(counts, &vec![5, 5, 5, 4, 4]);
    Ok(())
}

#[test]
fn test_ranges_tile_the_index_space() -> anyhow::Result<()> {
    let spl = BlockDistribution::new(1001, 7, 0)?;
    let mut next = 0;
    for rank in 0..7 {
        let range = spl.range_of(rank)?;
        assert_eq!(range.start, next);
        next = range.end;
    }
    assert_eq!(next, 1001);
    Ok(())
}

proptest! {
    #[test]
    fn prop_balance(global_count in 0usize..100_000, num_parts in 1usize..512) {
        let spl = BlockDistribution::new(global_count, num_parts, 0).unwrap();
        let counts = spl.counts();

        prop_assert_eq!(counts.iter().sum::<usize>(), global_count);
        let max = *counts.iter().max().unwrap();
        let min = *counts.iter().min().unwrap();
        prop_assert!(max - min <= 1);

        // Larger shares come first
        let r = global_count % num_parts;
        prop_assert!(counts[..r].iter().all(|&c| c == max));
    }

    #[test]
    fn prop_offsets_are_prefix_sums(global_count in 0usize..100_000, num_parts in 1usize..512) {
        let spl = BlockDistribution::new(global_count, num_parts, num_parts - 1).unwrap();
        let counts = spl.counts();
        let offsets = spl.offsets();

        let mut acc = 0;
        for p in 0..num_parts {
            prop_assert_eq!(offsets[p], acc);
            prop_assert_eq!(spl.global_offset_of(p).unwrap(), acc);
            acc += counts[p];
        }
    }

    #[test]
    fn prop_location_round_trips(global_count in 1usize..10_000, num_parts in 1usize..64, pick in any::<prop::sample::Index>()) {
        let spl = BlockDistribution::new(global_count, num_parts, 0).unwrap();
        let g = pick.index(global_count);
        let (rank, local) = spl.location(g).unwrap();
        prop_assert!(local < spl.local_size_of(rank).unwrap());
        prop_assert_eq!(spl.global_index(rank, local).unwrap(), g);
    }
}
