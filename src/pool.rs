//! The persistent pool: an [`Arena`], its header, a bump allocator and the
//! durability backend.
//!
//! Header layout (first cache line, all fields aligned 8-byte words):
//!
//! | offset | field                                   |
//! |--------|-----------------------------------------|
//! | 0      | magic                                   |
//! | 8      | key unit width in bits                  |
//! | 16     | chunk size                              |
//! | 24     | root pointer                            |
//! | 32     | allocation cursor                       |
//! | 40     | number of keys (best effort)            |

use tracing::debug;

use crate::arena::{Arena, CACHE_LINE_SIZE};
use crate::error::{Error, Result};
use crate::persist::Persistence;

pub(crate) const POOL_MAGIC: u64 = u64::from_le_bytes(*b"WOARTPL1");

const MAGIC_OFF: u64 = 0;
const UNIT_BITS_OFF: u64 = 8;
const CHUNK_SIZE_OFF: u64 = 16;
/// The root pointer word. Doubles as the parent slot of the root node.
pub(crate) const ROOT_SLOT: u64 = 24;
const CURSOR_OFF: u64 = 32;
const SIZE_OFF: u64 = 40;

pub(crate) const HEADER_SIZE: u64 = CACHE_LINE_SIZE as u64;

#[inline]
pub(crate) fn round_to_line(size: usize) -> usize {
    (size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)
}

pub(crate) struct Pool<P> {
    pub(crate) arena: Arena,
    pub(crate) backend: P,
    cursor: u64,
}

impl<P: Persistence> Pool<P> {
    /// Format `arena` as an empty pool.
    pub(crate) fn create(mut arena: Arena, mut backend: P, unit_bits: u8) -> Self {
        let chunk_size = arena.chunk_size();
        arena.write_u64(MAGIC_OFF, POOL_MAGIC);
        arena.write_u64(UNIT_BITS_OFF, unit_bits as u64);
        arena.write_u64(CHUNK_SIZE_OFF, chunk_size as u64);
        arena.write_u64(ROOT_SLOT, 0);
        arena.write_u64(CURSOR_OFF, HEADER_SIZE);
        arena.write_u64(SIZE_OFF, 0);
        backend.persist(&arena, 0, HEADER_SIZE as usize);
        backend.fence();

        debug!(chunk_size, unit_bits, file_backed = arena.is_file_backed(), "created pool");

        Self {
            arena,
            backend,
            cursor: HEADER_SIZE,
        }
    }

    /// Adopt an existing pool image. Only the header is validated; the tree
    /// itself needs no recovery pass.
    pub(crate) fn recover(mut arena: Arena, backend: P, unit_bits: u8) -> Result<Self> {
        let magic = arena.read_u64(MAGIC_OFF);
        if magic != POOL_MAGIC {
            return Err(Error::InvalidPool(format!("bad magic {magic:#018x}")));
        }

        let stored_bits = arena.read_u64(UNIT_BITS_OFF);
        if stored_bits != unit_bits as u64 {
            return Err(Error::InvalidPool(format!(
                "pool holds {stored_bits}-bit key units, expected {unit_bits}-bit"
            )));
        }

        let stored_chunk = arena.read_u64(CHUNK_SIZE_OFF);
        if stored_chunk != arena.chunk_size() as u64 {
            return Err(Error::InvalidPool(format!(
                "pool chunk size is {stored_chunk}, opened with {}",
                arena.chunk_size()
            )));
        }

        let cursor = arena.read_u64(CURSOR_OFF);
        if cursor < HEADER_SIZE || cursor % CACHE_LINE_SIZE as u64 != 0 {
            return Err(Error::InvalidPool(format!("bad allocation cursor {cursor}")));
        }

        let root = arena.read_u64(ROOT_SLOT) & !1;
        if root != 0 && (root < HEADER_SIZE || root >= cursor) {
            return Err(Error::InvalidPool(format!(
                "root {root} lies outside allocated memory"
            )));
        }

        // A replayed image only holds the chunks that saw a persist.
        arena.ensure(cursor)?;

        debug!(cursor, root, "recovered pool");

        Ok(Self {
            arena,
            backend,
            cursor,
        })
    }

    /// Allocate `size` zeroed bytes, rounded up to whole cache lines.
    ///
    /// The advanced cursor is persisted (unfenced) before the memory is
    /// returned, so the fence that precedes linking the allocation also makes
    /// the cursor durable.
    pub(crate) fn alloc(&mut self, size: usize) -> Result<u64> {
        let size = round_to_line(size) as u64;
        let chunk = self.arena.chunk_size() as u64;
        debug_assert!(size <= chunk);

        let mut off = self.cursor;
        if off / chunk != (off + size - 1) / chunk {
            off = (off / chunk + 1) * chunk;
        }
        self.arena.ensure(off + size)?;
        self.arena.zero(off, size as usize);

        self.cursor = off + size;
        self.arena.write_u64(CURSOR_OFF, self.cursor);
        self.backend.persist(&self.arena, CURSOR_OFF, 8);
        Ok(off)
    }

    #[inline]
    pub(crate) fn persist(&mut self, offset: u64, len: usize) {
        self.backend.persist(&self.arena, offset, len);
    }

    #[inline]
    pub(crate) fn fence(&mut self) {
        self.backend.fence();
    }

    /// Overwrite one aligned word and persist it.
    #[inline]
    pub(crate) fn store_word(&mut self, offset: u64, word: u64) {
        self.arena.write_u64(offset, word);
        self.backend.persist(&self.arena, offset, 8);
    }

    #[cfg(test)]
    pub(crate) fn root_word(&self) -> u64 {
        self.arena.read_u64(ROOT_SLOT)
    }

    #[inline]
    pub(crate) fn size(&self) -> u64 {
        self.arena.read_u64(SIZE_OFF)
    }

    /// Count one more key. Persisted without a fence.
    pub(crate) fn bump_size(&mut self) {
        let size = self.size() + 1;
        self.store_word(SIZE_OFF, size);
    }

    pub(crate) fn cursor(&self) -> u64 {
        self.cursor
    }
}

/// Chunk size recorded in a raw pool header, if it carries the magic.
pub(crate) fn header_chunk_size(header: &[u8]) -> Option<usize> {
    if header.len() < HEADER_SIZE as usize {
        return None;
    }
    let word = |off: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&header[off..off + 8]);
        u64::from_le_bytes(b)
    };
    (word(MAGIC_OFF as usize) == POOL_MAGIC).then(|| word(CHUNK_SIZE_OFF as usize) as usize)
}
