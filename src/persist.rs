//! Durability primitives.
//!
//! Every mutation of published memory follows one pattern: write into memory
//! no reader can reach yet, persist it, fence, then overwrite a single aligned
//! word that links it in and persist that word. [`Persistence`] abstracts the
//! two primitives the pattern needs so the same tree code runs on plain heap
//! memory, on real persistent memory, and under crash simulation.

use std::time::{Duration, Instant};

use crate::arena::{Arena, CACHE_LINE_SIZE};
use crate::config::Config;

/// Flush and ordering primitives used by the insert protocol.
pub trait Persistence: Send + Sync {
    /// Write back every cache line overlapping `offset..offset + len`.
    fn persist(&mut self, arena: &Arena, offset: u64, len: usize);

    /// Order all preceding persists before any following store.
    fn fence(&mut self);
}

/// Cache-line range covering `offset..offset + len`, as `(first, end)` offsets.
/// Empty when `len` is zero.
#[inline]
pub(crate) fn line_range(offset: u64, len: usize) -> (u64, u64) {
    let line = CACHE_LINE_SIZE as u64;
    let first = offset & !(line - 1);
    if len == 0 {
        return (first, first);
    }
    let end = (offset + len as u64 + line - 1) & !(line - 1);
    (first, end)
}

// =============================================================================
// NoFlush
// =============================================================================

/// Volatile operation: both primitives are no-ops.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFlush;

impl Persistence for NoFlush {
    #[inline]
    fn persist(&mut self, _arena: &Arena, _offset: u64, _len: usize) {}

    #[inline]
    fn fence(&mut self) {}
}

// =============================================================================
// CacheLineFlush
// =============================================================================

/// `clflush` per cache line and `mfence`, with an optional minimum latency per
/// flushed line to emulate media slower than DRAM.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheLineFlush {
    latency: Duration,
}

impl CacheLineFlush {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.flush_latency)
    }

    #[inline]
    fn delay(&self) {
        if self.latency.is_zero() {
            return;
        }
        let start = Instant::now();
        while start.elapsed() < self.latency {
            std::hint::spin_loop();
        }
    }
}

impl Persistence for CacheLineFlush {
    fn persist(&mut self, arena: &Arena, offset: u64, len: usize) {
        let (mut line, end) = line_range(offset, len);
        while line < end {
            flush_line(arena.addr(line));
            self.delay();
            line += CACHE_LINE_SIZE as u64;
        }
    }

    #[inline]
    fn fence(&mut self) {
        store_fence();
    }
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn flush_line(addr: *const u8) {
    // SAFETY: `addr` points into a live arena chunk; clflush has no other
    // requirement and SSE2 is part of the x86_64 baseline.
    unsafe { std::arch::x86_64::_mm_clflush(addr) }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
fn flush_line(_addr: *const u8) {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn store_fence() {
    // SAFETY: mfence has no preconditions.
    unsafe { std::arch::x86_64::_mm_mfence() }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
fn store_fence() {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

// =============================================================================
// Journal
// =============================================================================

/// One recorded durability event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEvent {
    /// Whole cache lines starting at `offset`, as they were when persisted.
    Persist { offset: u64, bytes: Vec<u8> },
    Fence,
}

/// Records every persist and fence so the durable image at any point can be
/// rebuilt. Only explicitly persisted lines are assumed to reach media.
#[derive(Debug, Default, Clone)]
pub struct Journal {
    events: Vec<JournalEvent>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[JournalEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Durable image after the first `upto` events.
    pub fn image(&self, chunk_size: usize, upto: usize) -> Arena {
        Self::replay(chunk_size, &self.events[..upto.min(self.events.len())])
    }

    /// Apply `events` in order onto a fresh zeroed arena.
    pub fn replay<'a>(chunk_size: usize, events: impl IntoIterator<Item = &'a JournalEvent>) -> Arena {
        let mut arena = Arena::heap(chunk_size);
        for event in events {
            if let JournalEvent::Persist { offset, bytes } = event {
                // Heap growth cannot fail short of allocator abort.
                if arena.ensure(offset + bytes.len() as u64).is_ok() {
                    arena.write_bytes(*offset, bytes);
                }
            }
        }
        arena
    }
}

impl Persistence for Journal {
    fn persist(&mut self, arena: &Arena, offset: u64, len: usize) {
        if len == 0 {
            return;
        }
        let (first, end) = line_range(offset, len);
        let bytes = arena.bytes(first, (end - first) as usize).to_vec();
        self.events.push(JournalEvent::Persist { offset: first, bytes });
    }

    fn fence(&mut self) {
        self.events.push(JournalEvent::Fence);
    }
}
