//! # Allocator Statistics
//!
//! Point-in-time snapshots for profiling overlays and leak checks.

/// Snapshot of one bucket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BucketStats {
    /// Bytes per block.
    pub block_size: usize,
    /// Blocks per chunk.
    pub num_blocks: u8,
    /// Chunks owned by the bucket.
    pub chunk_count: usize,
    /// Blocks handed out and not yet returned.
    pub blocks_in_use: usize,
    /// Whether a completely free chunk is cached.
    pub has_empty_chunk: bool,
}

impl BucketStats {
    /// Bytes held in this bucket's chunk buffers.
    #[inline]
    #[must_use]
    pub const fn chunk_bytes(&self) -> usize {
        self.chunk_count * self.block_size * self.num_blocks as usize
    }

    /// Bytes handed out to callers (rounded up to the block size).
    #[inline]
    #[must_use]
    pub const fn bytes_in_use(&self) -> usize {
        self.blocks_in_use * self.block_size
    }
}

/// Snapshot of a whole allocator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Every bucket, smallest block size first.
    pub buckets: Vec<BucketStats>,
    /// Large objects currently served by the system allocator.
    pub large_live: usize,
    /// Bytes in those large objects.
    pub large_bytes: usize,
}

impl AllocatorStats {
    /// Total bytes held in chunk buffers.
    #[must_use]
    pub fn chunk_bytes(&self) -> usize {
        self.buckets.iter().map(BucketStats::chunk_bytes).sum()
    }

    /// Total chunks across buckets.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.chunk_count).sum()
    }

    /// Total small blocks handed out.
    #[must_use]
    pub fn blocks_in_use(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.blocks_in_use).sum()
    }

    /// Buckets currently caching an empty chunk.
    #[must_use]
    pub fn empty_chunks(&self) -> usize {
        self.buckets
            .iter()
            .filter(|bucket| bucket.has_empty_chunk)
            .count()
    }

    /// Fraction of chunk memory handed out, in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        let held = self.chunk_bytes();
        if held == 0 {
            return 0.0;
        }
        let used: usize = self.buckets.iter().map(BucketStats::bytes_in_use).sum();
        used as f64 / held as f64
    }

    /// Buckets that own at least one chunk.
    pub fn active_buckets(&self) -> impl Iterator<Item = &BucketStats> {
        self.buckets.iter().filter(|bucket| bucket.chunk_count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_totals() {
        let stats = AllocatorStats {
            buckets: vec![
                BucketStats {
                    block_size: 4,
                    num_blocks: 255,
                    chunk_count: 2,
                    blocks_in_use: 255,
                    has_empty_chunk: true,
                },
                BucketStats {
                    block_size: 8,
                    num_blocks: 255,
                    chunk_count: 0,
                    blocks_in_use: 0,
                    has_empty_chunk: false,
                },
            ],
            large_live: 1,
            large_bytes: 4000,
        };

        assert_eq!(stats.chunk_bytes(), 2 * 4 * 255);
        assert_eq!(stats.chunk_count(), 2);
        assert_eq!(stats.blocks_in_use(), 255);
        assert_eq!(stats.empty_chunks(), 1);
        assert_eq!(stats.active_buckets().count(), 1);
        assert!((stats.utilization() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_stats() {
        let stats = AllocatorStats::default();
        assert_eq!(stats.chunk_bytes(), 0);
        assert!(stats.utilization().abs() < f64::EPSILON);
    }
}
