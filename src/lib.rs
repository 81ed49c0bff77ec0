//! distmem - data-layout core for distributed scientific codes
//!
//! Three pieces that every participant of a process group computes or owns
//! locally:
//! - [`BlockDistribution`]: balanced, order-preserving split of a global
//!   index range over the participants
//! - [`MemoryPool`]: growable best-fit arena over host or device memory
//! - [`map_alltoall`]: per-participant counts and displacements for moving
//!   data from one partition to another with a variable all-to-all

#![allow(clippy::too_many_arguments)] // alltoallv mirrors the collective's signature
#![allow(clippy::missing_safety_doc)] // FFI bindings documented at module level
#![allow(clippy::needless_range_loop)] // Rank loops index several arrays at once

pub mod backend;
pub mod comm;
pub mod distribution;
pub mod error;
pub mod logging;
pub mod memory;

pub use backend::{raw_allocator_for, HostAllocator, MemoryKind, RawAllocator};
pub use comm::{
    map_alltoall, plan_exchange, redistribute, AlltoallPlan, Communicator, LocalCommunicator,
    LocalGroup,
};
pub use distribution::BlockDistribution;
pub use error::{DistMemError, DistResult, ErrorCategory};
pub use memory::{BlockId, MemoryPool, PoolConfig, PoolHandle, PoolStats};

#[cfg(feature = "rocm")]
pub use backend::HipAllocator;
