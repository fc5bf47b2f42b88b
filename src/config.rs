use std::time::Duration;

use crate::arena::CACHE_LINE_SIZE;
use crate::error::{Error, Result};

/// Default chunk size for the node arena (1MB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Smallest accepted chunk size. A chunk must hold the largest node (Node256).
pub const MIN_CHUNK_SIZE: usize = 4096;

/// Configuration for a [`Woart`](crate::Woart) tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Bytes per arena chunk. Nodes never straddle chunks.
    pub chunk_size: usize,
    /// Artificial latency enforced after every cache-line flush by
    /// [`CacheLineFlush`](crate::persist::CacheLineFlush), used to model media
    /// slower than DRAM. Zero disables it.
    pub flush_latency: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            flush_latency: Duration::ZERO,
        }
    }
}

impl Config {
    /// Set the arena chunk size.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the artificial per-line flush latency.
    pub fn flush_latency(mut self, latency: Duration) -> Self {
        self.flush_latency = latency;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "chunk_size {} is below the minimum of {}",
                self.chunk_size, MIN_CHUNK_SIZE
            )));
        }
        if self.chunk_size % CACHE_LINE_SIZE != 0 {
            return Err(Error::InvalidConfig(format!(
                "chunk_size {} is not a multiple of the {}-byte cache line",
                self.chunk_size, CACHE_LINE_SIZE
            )));
        }
        Ok(())
    }
}
