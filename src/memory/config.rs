//! Memory pool configuration

use crate::error::DistResult;
use crate::invalid_argument;

/// Configuration for a [`MemoryPool`](super::MemoryPool)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Growth quantum: a new block is at least this large. Zero grows by
    /// exactly the (aligned) request.
    pub min_block_size: usize,

    /// Segment alignment in bytes (power of two). Segment offsets and
    /// lengths are multiples of it; pools reject values above the raw
    /// allocator's block alignment (256 for host and HIP).
    pub alignment: usize,

    /// Collapse all blocks into one once every handle has been returned.
    /// The merged block is reserved next to the old ones when possible and
    /// after releasing them otherwise.
    pub merge_on_drain: bool,

    /// Re-validate pool bookkeeping after every allocate/deallocate
    pub check_invariants: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_block_size: Self::DEFAULT_MIN_BLOCK_SIZE,
            alignment: Self::DEFAULT_ALIGNMENT,
            merge_on_drain: true,
            check_invariants: cfg!(debug_assertions),
        }
    }
}

impl PoolConfig {
    /// 1 MiB growth quantum
    pub const DEFAULT_MIN_BLOCK_SIZE: usize = 1 << 20;

    /// 256-byte segments, matching device allocation granularity
    pub const DEFAULT_ALIGNMENT: usize = 256;

    pub fn new() -> Self {
        Self::default()
    }

    /// Byte-exact pool: no alignment padding and blocks sized to the request
    ///
    /// After a full drain `total_size()` equals the peak number of bytes that
    /// were simultaneously live in the first pass.
    pub fn exact() -> Self {
        Self::default().with_alignment(1).with_min_block_size(0)
    }

    pub fn with_min_block_size(mut self, min_block_size: usize) -> Self {
        self.min_block_size = min_block_size;
        self
    }

    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_merge_on_drain(mut self, merge_on_drain: bool) -> Self {
        self.merge_on_drain = merge_on_drain;
        self
    }

    pub fn with_invariant_checks(mut self, check_invariants: bool) -> Self {
        self.check_invariants = check_invariants;
        self
    }

    /// Reject configurations the pool cannot honor
    pub fn validate(&self) -> DistResult<()> {
        if !self.alignment.is_power_of_two() {
            return Err(invalid_argument!(
                "pool alignment must be a power of two, got {}",
                self.alignment
            ));
        }
        if self.min_block_size % self.alignment != 0 {
            return Err(invalid_argument!(
                "minimum block size {} is not a multiple of the alignment {}",
                self.min_block_size,
                self.alignment
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PoolConfig::default();
        assert_eq!(config.min_block_size, 1 << 20);
        assert_eq!(config.alignment, 256);
        assert!(config.merge_on_drain);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_exact_preset() {
        let config = PoolConfig::exact();
        assert_eq!(config.alignment, 1);
        assert_eq!(config.min_block_size, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = PoolConfig::new()
            .with_min_block_size(4096)
            .with_alignment(64)
            .with_merge_on_drain(false)
            .with_invariant_checks(true);

        assert_eq!(config.min_block_size, 4096);
        assert_eq!(config.alignment, 64);
        assert!(!config.merge_on_drain);
        assert!(config.check_invariants);
    }

    #[test]
    fn test_rejects_bad_alignment() {
        assert!(PoolConfig::new().with_alignment(0).validate().is_err());
        assert!(PoolConfig::new().with_alignment(100).validate().is_err());
        assert!(PoolConfig::new()
            .with_alignment(256)
            .with_min_block_size(1000)
            .validate()
            .is_err());
    }
}
