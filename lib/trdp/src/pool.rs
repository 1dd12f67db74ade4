//! Optional pre-sized buffer pool.
//!
//! Embedded deployments configure fixed block buckets up front and never
//! touch the allocator afterwards; everyone else leaves the configuration
//! empty and gets plain heap vectors.

use crate::config::MemoryConfig;
use crate::error::{Result, TrdpError};

struct Bucket {
    block_size: usize,
    free: Vec<Vec<u8>>,
    outstanding: usize,
}

pub struct BlockPool {
    buckets: Vec<Bucket>,
}

impl BlockPool {
    pub fn new(config: &MemoryConfig) -> BlockPool {
        let mut buckets: Vec<Bucket> = config
            .blocks
            .iter()
            .filter(|b| b.size > 0 && b.count > 0)
            .map(|b| Bucket {
                block_size: b.size,
                free: (0..b.count).map(|_| vec![0u8; b.size]).collect(),
                outstanding: 0,
            })
            .collect();
        buckets.sort_by_key(|b| b.block_size);
        BlockPool { buckets }
    }

    /// True when block buckets are configured; false means heap fallback.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        !self.buckets.is_empty()
    }

    /// Takes a zeroed buffer of at least `size` bytes from the smallest
    /// fitting bucket, or from the heap when the pool is disabled.
    pub fn take(&mut self, size: usize) -> Result<Vec<u8>> {
        if !self.is_enabled() {
            return Ok(vec![0u8; size]);
        }
        let bucket = self
            .buckets
            .iter_mut()
            .find(|b| b.block_size >= size)
            .ok_or(TrdpError::Memory(size))?;
        match bucket.free.pop() {
            Some(mut buf) => {
                buf.iter_mut().for_each(|b| *b = 0);
                bucket.outstanding += 1;
                Ok(buf)
            }
            None => Err(TrdpError::Memory(size)),
        }
    }

    /// Returns a buffer to its bucket. Buffers from the heap fallback (or
    /// foreign ones) are simply dropped.
    pub fn give(&mut self, buf: Vec<u8>) {
        if let Some(bucket) = self
            .buckets
            .iter_mut()
            .find(|b| b.block_size == buf.capacity() || b.block_size == buf.len())
        {
            if bucket.outstanding > 0 {
                bucket.outstanding -= 1;
                bucket.free.push(buf);
            }
        }
    }
}
