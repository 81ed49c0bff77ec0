//! Transpose all-to-all benchmark
//!
//! Each participant of an in-process group holds a block of rows of a
//! column-major complex matrix in a pool buffer. One repetition moves the
//! matrix to column slabs and back, then checks the row slab is unchanged.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Instant;

use anyhow::bail;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use distmem::logging::init_logging_default;
use distmem::{
    redistribute, AlltoallPlan, BlockDistribution, Communicator, DistMemError, DistResult,
    LocalCommunicator, LocalGroup, MemoryKind, MemoryPool, PoolHandle,
};

/// Bytes per complex double
const ELEMENT_BYTES: usize = 16;

#[derive(Parser, Debug)]
#[command(name = "alltoall_bench", version)]
#[command(about = "Row/column slab transpose through distmem all-to-all plans", long_about = None)]
struct Args {
    /// Number of matrix rows (distributed before the transpose)
    #[arg(long)]
    num_rows: usize,

    /// Number of matrix columns (distributed after the transpose)
    #[arg(long)]
    num_cols: usize,

    /// Participants in the group
    #[arg(long, default_value_t = 4)]
    participants: usize,

    /// Repetitions of the round trip
    #[arg(long, default_value_t = 1)]
    repeat: usize,

    /// Memory kind backing the slabs: host or device
    #[arg(long, default_value = "host")]
    memory: MemoryKind,
}

fn main() -> anyhow::Result<()> {
    init_logging_default();
    let args = Args::parse();
    if args.repeat == 0 {
        bail!("--repeat must be at least 1");
    }

    let timings = LocalGroup::run(args.participants, |comm| round_trips(comm, &args))?;

    // A repetition takes as long as its slowest participant
    let per_repeat: Vec<f64> = (0..args.repeat)
        .map(|i| timings.iter().map(|t| t[i]).fold(0.0, f64::max))
        .collect();

    let bytes = (2 * args.num_rows * args.num_cols * ELEMENT_BYTES) as f64;
    let perf: Vec<f64> = per_repeat
        .iter()
        .map(|&t| bytes / t / f64::from(1u32 << 30))
        .collect();

    let avg = perf.iter().sum::<f64>() / perf.len() as f64;
    let variance = perf.iter().map(|p| (p - avg).powi(2)).sum::<f64>() / perf.len() as f64;

    println!("average performance: {:12.4} GB/sec.", avg);
    println!("sigma: {:12.4} GB/sec.", variance.sqrt());
    Ok(())
}

fn round_trips(comm: &LocalCommunicator, args: &Args) -> DistResult<Vec<f64>> {
    let rows = BlockDistribution::for_communicator(args.num_rows, comm)?;
    let cols = BlockDistribution::for_communicator(args.num_cols, comm)?;

    let forward = AlltoallPlan::rows_to_columns(args.num_rows, args.num_cols, comm.size(), comm.rank())?
        .scaled(ELEMENT_BYTES)?;
    let backward = AlltoallPlan::columns_to_rows(args.num_rows, args.num_cols, comm.size(), comm.rank())?
        .scaled(ELEMENT_BYTES)?;

    let mut pool = MemoryPool::new(args.memory)?;
    let row_slab = pool.allocate(rows.local_size() * args.num_cols * ELEMENT_BYTES)?;
    let col_slab = pool.allocate(args.num_rows * cols.local_size() * ELEMENT_BYTES)?;

    let mut rng = StdRng::seed_from_u64(comm.rank() as u64);
    let mut staging = vec![0u8; row_slab.len()];
    rng.fill_bytes(&mut staging);
    pool.copy_from_host(&row_slab, &staging)?;
    pool.zero(&col_slab)?;
    let expected = checksum(&staging);

    let mut timings = Vec::with_capacity(args.repeat);
    for _ in 0..args.repeat {
        comm.barrier()?;
        let t = Instant::now();
        exchange(comm, &mut pool, &forward, &row_slab, &col_slab)?;
        exchange(comm, &mut pool, &backward, &col_slab, &row_slab)?;
        comm.barrier()?;
        timings.push(t.elapsed().as_secs_f64());
    }

    pool.copy_to_host(&row_slab, &mut staging)?;
    pool.deallocate(row_slab)?;
    pool.deallocate(col_slab)?;

    if checksum(&staging) != expected {
        return Err(DistMemError::InvariantViolation(format!(
            "rank {} row slab changed after {} round trips",
            comm.rank(),
            args.repeat
        )));
    }
    Ok(timings)
}

/// Stage `src` through host memory, exchange, and land the result in `dst`
fn exchange(
    comm: &LocalCommunicator,
    pool: &mut MemoryPool,
    plan: &AlltoallPlan,
    src: &PoolHandle,
    dst: &PoolHandle,
) -> DistResult<()> {
    let mut send = vec![0u8; src.len()];
    pool.copy_to_host(src, &mut send)?;
    let mut recv = vec![0u8; dst.len()];
    redistribute(comm, plan, &send, &mut recv)?;
    pool.copy_from_host(dst, &recv)
}

fn checksum(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}
