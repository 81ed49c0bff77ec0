//! Common test utilities for distmem integration tests
//!
//! - Host pool fixtures with invariant checking switched on
//! - A participant-group runner that checks cross-participant symmetry
//! - A shared device fixture (feature `rocm`) that skips when no GPU is present
//!
//! # Usage
//!
//! ```ignore
//! mod common;
//! use common::{checked_host_pool, gather_plans};
//!
//! let plans = gather_plans(4, |comm| map_alltoall(&counts_in, &counts_out, comm.rank()))?;
//! common::assert_plans_symmetric(&plans);
//! ```

#![allow(dead_code)]

use distmem::{
    AlltoallPlan, DistResult, LocalCommunicator, LocalGroup, MemoryKind, MemoryPool, PoolConfig,
};
pub use serial_test::serial;

/// Host pool that re-validates its bookkeeping after every mutation
pub fn checked_host_pool(config: PoolConfig) -> MemoryPool {
    MemoryPool::with_config(MemoryKind::Host, config.with_invariant_checks(true))
        .expect("host pools are always available")
}

/// Scenario pool: 1 MiB growth quantum, invariant checks on
pub fn quantum_pool() -> MemoryPool {
    checked_host_pool(PoolConfig::new().with_min_block_size(1 << 20))
}

/// Assert the post-drain invariants of a pool
pub fn assert_drained(pool: &MemoryPool) {
    assert_eq!(pool.num_stored_ptr(), 0, "live handles remain");
    assert_eq!(
        pool.free_size(),
        pool.total_size(),
        "free_size != total_size after full drain"
    );
    pool.validate().expect("pool bookkeeping is consistent");
}

/// Run `f` on every participant of an in-process group and collect the
/// resulting plans in rank order
pub fn gather_plans<F>(size: usize, f: F) -> DistResult<Vec<AlltoallPlan>>
where
    F: Fn(&LocalCommunicator) -> DistResult<AlltoallPlan> + Sync,
{
    LocalGroup::run(size, f)
}

/// Check `sendcounts[i][j] == recvcounts[j][i]` for every ordered pair
pub fn assert_plans_symmetric(plans: &[AlltoallPlan]) {
    for (i, sender) in plans.iter().enumerate() {
        for (j, receiver) in plans.iter().enumerate() {
            assert_eq!(
                sender.sendcounts[j], receiver.recvcounts[i],
                "participant {} sends {} to {}, which expects {}",
                i, sender.sendcounts[j], j, receiver.recvcounts[i]
            );
        }
    }
}

/// Shared device fixture, initialized once for all device tests
///
/// `None` when no GPU is available; tests skip gracefully.
#[cfg(feature = "rocm")]
pub static DEVICE_FIXTURE: once_cell::sync::Lazy<Option<DeviceFixture>> =
    once_cell::sync::Lazy::new(|| {
        if !distmem::HipAllocator::gpu_available() {
            eprintln!("WARNING: GPU not available - skipping device pool tests");
            return None;
        }
        match DeviceFixture::new() {
            Ok(fixture) => {
                eprintln!(
                    "Device fixture initialized: {} MB free of {} MB",
                    fixture.initial_free_mb, fixture.total_mb
                );
                Some(fixture)
            }
            Err(e) => {
                eprintln!("ERROR: failed to initialize device fixture: {}", e);
                None
            }
        }
    });

#[cfg(feature = "rocm")]
pub struct DeviceFixture {
    initial_free_mb: usize,
    total_mb: usize,
}

#[cfg(feature = "rocm")]
impl DeviceFixture {
    fn new() -> DistResult<Self> {
        let (free, total) = distmem::HipAllocator::new()?.memory_info()?;
        Ok(Self {
            initial_free_mb: free >> 20,
            total_mb: total >> 20,
        })
    }

    /// Device pool with invariant checking
    pub fn pool(&self, config: PoolConfig) -> DistResult<MemoryPool> {
        MemoryPool::with_config(MemoryKind::Device, config.with_invariant_checks(true))
    }

    /// Largest allocation a test may make (half of the free memory at startup)
    pub fn safe_alloc_bytes(&self) -> usize {
        (self.initial_free_mb << 20) / 2
    }

    /// Panic if free device memory dropped by more than `tolerance_percent`
    /// of the total since the fixture was created
    pub fn assert_no_leak(&self, tolerance_percent: usize) {
        let (free, _) = distmem::HipAllocator::new()
            .and_then(|a| a.memory_info())
            .expect("Failed to query GPU memory");
        let free_mb = free >> 20;
        let leaked_mb = self.initial_free_mb.saturating_sub(free_mb);
        let tolerance_mb = self.total_mb * tolerance_percent / 100;
        assert!(
            leaked_mb <= tolerance_mb,
            "device memory leak: {} MB free at start, {} MB now (tolerance {} MB)",
            self.initial_free_mb,
            free_mb,
            tolerance_mb
        );
    }
}
