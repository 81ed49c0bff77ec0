//! Pooled memory for repeated cycles of short-lived buffers
//!
//! Raw reservations (host `alloc` or `hipMalloc`) are expensive and, on some
//! devices, unstable when issued hundreds of times per step. A
//! [`MemoryPool`] reserves memory in large blocks and serves requests from
//! those blocks instead.
//!
//! # Pattern
//!
//! 1. Serve each request best-fit from the free segments of all blocks
//! 2. Grow by a new block when no free segment is large enough
//! 3. Coalesce freed segments with free neighbors immediately
//! 4. When the last handle is returned, merge all blocks into one block of
//!    the same total size
//!
//! After one full cycle of a working set, the next cycle of the same working
//! set runs inside a single block without touching the raw allocator.

mod block;
pub mod config;
pub mod pool;

pub use block::BlockId;
pub use config::PoolConfig;
pub use pool::{MemoryPool, PoolHandle, PoolStats};
