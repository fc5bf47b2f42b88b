//! Chunked, cache-line-aligned memory region holding every node and leaf.
//!
//! The arena plays the role of the memory-mapped persistent region:
//! - Offsets are 64-bit positions in the concatenation of all chunks
//! - Chunks are allocated once and never move, so a published offset stays
//!   valid for the life of the arena
//! - Every chunk starts on a cache-line boundary, so cache-line rounding of an
//!   offset matches rounding of the real address
//! - Chunks are either heap memory or regions of a memory-mapped pool file
//!
//! Nothing is ever freed individually; superseded nodes are abandoned.

use std::fs::File;
use std::io;
use std::ptr;

use memmap2::{MmapMut, MmapOptions};

/// Granularity of flushes and of every allocation.
pub const CACHE_LINE_SIZE: usize = 64;

#[derive(Clone, Copy)]
#[repr(C, align(64))]
struct CacheLine([u8; CACHE_LINE_SIZE]);

enum Chunk {
    Heap(Box<[CacheLine]>),
    Mapped(MmapMut),
}

impl Chunk {
    fn heap(chunk_size: usize) -> Self {
        // Allocation failure aborts through the global allocator's handler.
        Chunk::Heap(vec![CacheLine([0; CACHE_LINE_SIZE]); chunk_size / CACHE_LINE_SIZE].into_boxed_slice())
    }

    fn mapped(file: &File, index: usize, chunk_size: usize) -> io::Result<Self> {
        // SAFETY: the pool file is opened read-write by the arena that owns this
        // mapping and is not mapped a second time by this process. Concurrent
        // modification by other processes is outside the supported model.
        let map = unsafe {
            MmapOptions::new()
                .offset((index * chunk_size) as u64)
                .len(chunk_size)
                .map_mut(file)?
        };
        Ok(Chunk::Mapped(map))
    }

    #[inline]
    fn bytes(&self) -> &[u8] {
        match self {
            // SAFETY: `CacheLine` is a `repr(C)` byte array, so a slice of lines
            // is one contiguous, initialized run of bytes.
            Chunk::Heap(lines) => unsafe {
                std::slice::from_raw_parts(lines.as_ptr().cast::<u8>(), lines.len() * CACHE_LINE_SIZE)
            },
            Chunk::Mapped(map) => map,
        }
    }

    #[inline]
    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            // SAFETY: as in `bytes`, and the unique borrow of the box is held.
            Chunk::Heap(lines) => unsafe {
                std::slice::from_raw_parts_mut(
                    lines.as_mut_ptr().cast::<u8>(),
                    lines.len() * CACHE_LINE_SIZE,
                )
            },
            Chunk::Mapped(map) => map,
        }
    }
}

/// The persistent region.
pub struct Arena {
    chunks: Vec<Chunk>,
    chunk_size: usize,
    /// Backing file for mapped pools.
    file: Option<File>,
}

impl Arena {
    /// Create a heap arena with one zeroed chunk.
    pub fn heap(chunk_size: usize) -> Self {
        debug_assert_eq!(chunk_size % CACHE_LINE_SIZE, 0);
        Self {
            chunks: vec![Chunk::heap(chunk_size)],
            chunk_size,
            file: None,
        }
    }

    /// Map `file` as an arena. The file is extended to at least one chunk and
    /// every whole chunk it already contains is mapped.
    pub(crate) fn map_file(file: File, chunk_size: usize) -> io::Result<Self> {
        debug_assert_eq!(chunk_size % CACHE_LINE_SIZE, 0);
        let len = file.metadata()?.len();
        let mut num_chunks = (len / chunk_size as u64) as usize;
        if num_chunks == 0 {
            file.set_len(chunk_size as u64)?;
            num_chunks = 1;
        }

        let mut chunks = Vec::with_capacity(num_chunks);
        for index in 0..num_chunks {
            chunks.push(Chunk::mapped(&file, index, chunk_size)?);
        }

        Ok(Self {
            chunks,
            chunk_size,
            file: Some(file),
        })
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Total addressable bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        (self.chunks.len() * self.chunk_size) as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn is_file_backed(&self) -> bool {
        self.file.is_some()
    }

    /// Grow until `end` is addressable.
    pub(crate) fn ensure(&mut self, end: u64) -> io::Result<()> {
        while self.len() < end {
            let index = self.chunks.len();
            let chunk = match &self.file {
                Some(file) => {
                    file.set_len(((index + 1) * self.chunk_size) as u64)?;
                    Chunk::mapped(file, index, self.chunk_size)?
                }
                None => Chunk::heap(self.chunk_size),
            };
            self.chunks.push(chunk);
        }
        Ok(())
    }

    #[inline]
    fn locate(&self, off: u64, len: usize) -> (usize, usize) {
        let chunk = (off / self.chunk_size as u64) as usize;
        let within = (off % self.chunk_size as u64) as usize;
        debug_assert!(
            within + len <= self.chunk_size,
            "range {off}+{len} straddles a chunk boundary"
        );
        (chunk, within)
    }

    /// Borrow `len` bytes at `off`. The range must lie inside one chunk.
    #[inline]
    pub fn bytes(&self, off: u64, len: usize) -> &[u8] {
        let (chunk, within) = self.locate(off, len);
        &self.chunks[chunk].bytes()[within..within + len]
    }

    #[inline]
    pub(crate) fn bytes_mut(&mut self, off: u64, len: usize) -> &mut [u8] {
        let (chunk, within) = self.locate(off, len);
        &mut self.chunks[chunk].bytes_mut()[within..within + len]
    }

    #[inline]
    pub(crate) fn write_bytes(&mut self, off: u64, bytes: &[u8]) {
        self.bytes_mut(off, bytes.len()).copy_from_slice(bytes);
    }

    #[inline]
    pub(crate) fn zero(&mut self, off: u64, len: usize) {
        self.bytes_mut(off, len).fill(0);
    }

    #[inline]
    pub(crate) fn read_u8(&self, off: u64) -> u8 {
        self.bytes(off, 1)[0]
    }

    #[inline]
    pub(crate) fn write_u8(&mut self, off: u64, v: u8) {
        self.bytes_mut(off, 1)[0] = v;
    }

    #[inline]
    pub(crate) fn read_u32(&self, off: u64) -> u32 {
        let b = self.bytes(off, 4);
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    #[inline]
    pub(crate) fn write_u32(&mut self, off: u64, v: u32) {
        self.write_bytes(off, &v.to_le_bytes());
    }

    /// Read an aligned 8-byte word.
    #[inline]
    pub(crate) fn read_u64(&self, off: u64) -> u64 {
        debug_assert_eq!(off % 8, 0, "unaligned word read at {off}");
        let p = self.bytes(off, 8).as_ptr().cast::<u64>();
        // SAFETY: the slice is 8 bytes long, and chunk bases are cache-line
        // aligned so an 8-aligned offset is an 8-aligned address.
        u64::from_le(unsafe { ptr::read_volatile(p) })
    }

    /// Write an aligned 8-byte word with a single store. Linking writes go
    /// through here so a crash observes either the old or the new word.
    #[inline]
    pub(crate) fn write_u64(&mut self, off: u64, v: u64) {
        debug_assert_eq!(off % 8, 0, "unaligned word write at {off}");
        let p = self.bytes_mut(off, 8).as_mut_ptr().cast::<u64>();
        // SAFETY: see `read_u64`; the unique borrow of the arena is held.
        unsafe { ptr::write_volatile(p, v.to_le()) }
    }

    /// Address of the byte at `off`, for flush instructions.
    #[inline]
    pub(crate) fn addr(&self, off: u64) -> *const u8 {
        self.bytes(off, 1).as_ptr()
    }

    /// Flush every mapped chunk to its file. No-op for heap arenas.
    pub fn sync(&self) -> io::Result<()> {
        for chunk in &self.chunks {
            if let Chunk::Mapped(map) = chunk {
                map.flush()?;
            }
        }
        Ok(())
    }
}
