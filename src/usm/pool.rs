//! Pooled sub-allocator for one (USM kind, device) pair.
//!
//! Small allocations are served from power-of-two buckets. Each bucket owns a
//! list of driver slabs carved into equal chunks; slab growth doubles up to a
//! cap, so a hot bucket converges to large, infrequent driver calls.
//! Anything above [`SubPool::MAX_POOLABLE`] bypasses the pool entirely and is
//! released straight back to the driver on free.

use crate::error::{UhalError, UhalResult};
use std::collections::HashMap;

/// Smallest bucket chunk size.
const MIN_CHUNK: u64 = 64;
const MIN_CHUNK_LOG: u32 = MIN_CHUNK.trailing_zeros();

/// Occupancy snapshot for the pool get-info entry point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Chunks currently handed out.
    pub live_chunks: u64,
    /// Chunks sitting on free lists.
    pub free_chunks: u64,
    /// Total bytes of driver slabs owned by the pool.
    pub slab_bytes: u64,
}

#[derive(Debug)]
struct Slab {
    base: u64,
    size: u64,
}

#[derive(Debug)]
struct Bucket {
    chunk_size: u64,
    free: Vec<u64>,
    slabs: Vec<Slab>,
    /// Chunks to carve from the next slab; doubles after each growth.
    next_slab_chunks: u64,
}

impl Bucket {
    const INITIAL_SLAB_CHUNKS: u64 = 8;
    const MAX_SLAB_CHUNKS: u64 = 64;

    const fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size,
            free: Vec::new(),
            slabs: Vec::new(),
            next_slab_chunks: Self::INITIAL_SLAB_CHUNKS,
        }
    }
}

/// A per-(kind, device) pool of power-of-two buckets.
#[derive(Debug)]
pub struct SubPool {
    buckets: Vec<Bucket>,
    /// Live chunk address -> bucket index, for free-side resolution.
    live: HashMap<u64, usize>,
}

impl Default for SubPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SubPool {
    /// Requests larger than this bypass the pool.
    pub const MAX_POOLABLE: u64 = 64 * 1024;

    #[must_use]
    pub fn new() -> Self {
        let bucket_count = (Self::MAX_POOLABLE.trailing_zeros() - MIN_CHUNK_LOG + 1) as usize;
        let buckets = (0..bucket_count)
            .map(|i| Bucket::new(MIN_CHUNK << i))
            .collect();
        Self {
            buckets,
            live: HashMap::new(),
        }
    }

    /// Whether a request of `size`/`align` is served by the pool at all.
    #[must_use]
    pub fn poolable(size: u64, align: u64) -> bool {
        size.max(align) <= Self::MAX_POOLABLE && size > 0
    }

    fn bucket_index(size: u64, align: u64) -> usize {
        let need = size.max(align).max(MIN_CHUNK).next_power_of_two();
        (need.trailing_zeros() - MIN_CHUNK_LOG) as usize
    }

    /// Serves a chunk satisfying `size` and `align`, growing the bucket via
    /// `grow_slab(slab_size, slab_align)` when its free list is empty.
    ///
    /// # Errors
    /// Propagates the driver error from `grow_slab`.
    pub fn acquire(
        &mut self,
        size: u64,
        align: u64,
        grow_slab: impl FnOnce(u64, u64) -> UhalResult<u64>,
    ) -> UhalResult<u64> {
        debug_assert!(Self::poolable(size, align));
        let idx = Self::bucket_index(size, align);
        let bucket = &mut self.buckets[idx];

        if bucket.free.is_empty() {
            let chunks = bucket.next_slab_chunks;
            let slab_size = chunks * bucket.chunk_size;
            // Slab base aligned to the chunk size keeps every chunk aligned.
            let base = grow_slab(slab_size, bucket.chunk_size)?;
            for i in 0..chunks {
                bucket.free.push(base + i * bucket.chunk_size);
            }
            bucket.slabs.push(Slab {
                base,
                size: slab_size,
            });
            bucket.next_slab_chunks = (chunks * 2).min(Bucket::MAX_SLAB_CHUNKS);
        }

        let ptr = bucket.free.pop().ok_or_else(|| {
            UhalError::InvalidOperation("pool bucket empty after growth".into())
        })?;
        self.live.insert(ptr, idx);
        Ok(ptr)
    }

    /// Returns a chunk to its bucket.
    ///
    /// # Errors
    /// `InvalidValue` when `ptr` was not handed out by this pool.
    pub fn release(&mut self, ptr: u64) -> UhalResult<()> {
        let idx = self.live.remove(&ptr).ok_or_else(|| {
            UhalError::InvalidValue(format!("pointer {ptr:#x} does not belong to this pool"))
        })?;
        self.buckets[idx].free.push(ptr);
        Ok(())
    }

    /// Whether `ptr` is a chunk currently handed out by this pool.
    #[must_use]
    pub fn owns(&self, ptr: u64) -> bool {
        self.live.contains_key(&ptr)
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live_chunks: self.live.len() as u64,
            free_chunks: self.buckets.iter().map(|b| b.free.len() as u64).sum(),
            slab_bytes: self
                .buckets
                .iter()
                .flat_map(|b| b.slabs.iter())
                .map(|s| s.size)
                .sum(),
        }
    }

    /// Takes ownership of every slab base for release back to the driver.
    /// The pool is unusable afterwards; called on context teardown.
    pub fn drain_slabs(&mut self) -> Vec<u64> {
        self.live.clear();
        let mut bases = Vec::new();
        for bucket in &mut self.buckets {
            bucket.free.clear();
            bases.extend(bucket.slabs.drain(..).map(|s| s.base));
        }
        bases
    }
}
