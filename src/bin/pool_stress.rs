//! Memory pool stress driver
//!
//! Allocates a random working set, zeroes every buffer, frees it in random
//! order and checks after each pass that the pool drained into one block of
//! exactly the working-set size.

use std::time::Instant;

use anyhow::{bail, Context};
use clap::Parser;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use distmem::logging::init_logging_default;
use distmem::{MemoryKind, MemoryPool, PoolConfig};

#[derive(Parser, Debug)]
#[command(name = "pool_stress", version)]
#[command(about = "Allocate/free cycles against a distmem memory pool", long_about = None)]
struct Args {
    /// Memory kind: host or device
    #[arg(long, default_value = "host")]
    memory: MemoryKind,

    /// Working set size in MiB
    #[arg(long, default_value_t = 256)]
    total_mb: usize,

    /// Upper bound of a single buffer in MiB
    #[arg(long, default_value_t = 32)]
    gran_mb: usize,

    /// Number of allocate/free passes
    #[arg(long, default_value_t = 30)]
    passes: usize,

    /// RNG seed for buffer sizes and free order
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> anyhow::Result<()> {
    init_logging_default();
    let args = Args::parse();

    if args.gran_mb == 0 {
        bail!("--gran-mb must be at least 1");
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let target = args.total_mb << 20;
    let max_size = args.gran_mb << 20;

    let mut sizes = Vec::new();
    let mut total_size = 0usize;
    while total_size < target {
        let size = rng.gen_range(1..=max_size);
        sizes.push(size);
        total_size += size;
    }

    println!("number of buffers: {}", sizes.len());
    println!("total size: {}", total_size);

    let config = PoolConfig::exact().with_invariant_checks(false);
    let mut pool = MemoryPool::with_config(args.memory, config)
        .with_context(|| format!("failed to create {} memory pool", args.memory))?;

    let started = Instant::now();
    for pass in 0..args.passes {
        let t = Instant::now();

        let mut handles = Vec::with_capacity(sizes.len());
        for &size in &sizes {
            let handle = pool.allocate(size)?;
            pool.zero(&handle)?;
            handles.push(handle);
        }

        handles.shuffle(&mut rng);
        for handle in handles {
            pool.deallocate(handle)?;
        }

        if pool.total_size() != total_size {
            bail!(
                "wrong total size: expected {} got {}",
                total_size,
                pool.total_size()
            );
        }
        if pool.free_size() != pool.total_size() {
            bail!(
                "wrong free size: expected {} got {}",
                pool.total_size(),
                pool.free_size()
            );
        }
        if pool.num_blocks() != 1 {
            bail!("wrong number of blocks: {}", pool.num_blocks());
        }
        if pool.num_stored_ptr() != 0 {
            bail!("wrong number of stored pointers: {}", pool.num_stored_ptr());
        }
        pool.validate()?;

        println!("pass : {}, time : {:.6}", pass, t.elapsed().as_secs_f64());
    }

    println!(
        "{} passes in {:.3} s",
        args.passes,
        started.elapsed().as_secs_f64()
    );
    Ok(())
}
