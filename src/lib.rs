//! # woart
//!
//! A write-optimal adaptive radix tree (WOART): an ordered key-value index whose
//! nodes live in a persistent memory region and which stays consistent across
//! crashes without a recovery pass.
//!
//! Every update is made visible by a single aligned 8-byte store, issued only
//! after everything it links has been flushed and fenced. Reopening a pool
//! after a crash only validates its header.
//!
//! ## Example
//!
//! ```rust
//! use woart::{BytesWoart, IntWoart};
//!
//! let tree = BytesWoart::new();
//! tree.insert(b"hello", 1).unwrap();
//! tree.insert(b"world", 2).unwrap();
//! assert_eq!(tree.search(b"hello"), Some(1));
//! assert_eq!(tree.scan(b"i", 10), vec![2]);
//!
//! let ints = IntWoart::new();
//! for k in [30u64, 10, 20] {
//!     ints.insert(&k, k * 100).unwrap();
//! }
//! assert_eq!(ints.scan(&15, 10), vec![2000, 3000]);
//! ```
//!
//! ## Persistence backends
//!
//! - [`NoFlush`]: plain volatile memory (default)
//! - [`CacheLineFlush`]: `clflush` + `mfence` with optional emulated latency
//! - [`Journal`]: records every persist so crash states can be replayed

#![deny(unsafe_op_in_unsafe_fn)]

pub mod arena;
mod art;
pub mod config;
pub mod error;
pub mod key;
pub mod persist;
mod pool;

#[cfg(test)]
mod proptests;

use std::fs::OpenOptions;
use std::io::{self, Read};
use std::marker::PhantomData;
use std::path::Path;

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use tracing::debug;

pub use arena::Arena;
pub use art::{NodeKind, TreeStats};
pub use config::Config;
pub use error::{Error, Result};
pub use key::{Bytes, IndexKey, KeyUnits, Nibbles, MAX_KEY_UNITS};
pub use persist::{CacheLineFlush, Journal, JournalEvent, NoFlush, Persistence};

use art::Trie;
use pool::HEADER_SIZE;

/// A crash-consistent ordered index from `K` to opaque `u64` handles.
///
/// One reader/writer lock per tree: lookups and scans share it, inserts hold it
/// exclusively for the whole descent and every persist.
pub struct Woart<K: ?Sized + IndexKey, P: Persistence = NoFlush> {
    inner: RwLock<Trie<K::Units, P>>,
    config: Config,
    _key: PhantomData<fn(&K)>,
}

/// Tree over `u64` keys, branching on nibbles.
pub type IntWoart<P = NoFlush> = Woart<u64, P>;

/// Tree over byte-string keys, branching on bytes.
pub type BytesWoart<P = NoFlush> = Woart<[u8], P>;

impl<K: ?Sized + IndexKey> Woart<K, NoFlush> {
    /// Create an empty volatile tree with default configuration.
    pub fn new() -> Self {
        let config = Config::default();
        let arena = Arena::heap(config.chunk_size);
        Self::from_trie(Trie::create(arena, NoFlush), config)
    }

    /// Create an empty volatile tree with the given configuration.
    pub fn with_config(config: Config) -> Result<Self> {
        Self::with_backend(config, NoFlush)
    }
}

impl<K: ?Sized + IndexKey> Default for Woart<K, NoFlush> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ?Sized + IndexKey, P: Persistence> Woart<K, P> {
    fn from_trie(trie: Trie<K::Units, P>, config: Config) -> Self {
        Self {
            inner: RwLock::new(trie),
            config,
            _key: PhantomData,
        }
    }

    /// Create an empty tree on a heap arena, flushing through `backend`.
    pub fn with_backend(config: Config, backend: P) -> Result<Self> {
        config.validate()?;
        let arena = Arena::heap(config.chunk_size);
        Ok(Self::from_trie(Trie::create(arena, backend), config))
    }

    /// Create (or truncate) a pool file at `path` and format an empty tree in it.
    pub fn create(path: impl AsRef<Path>, config: Config, backend: P) -> Result<Self> {
        config.validate()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        let arena = Arena::map_file(file, config.chunk_size)?;
        debug!(path = %path.as_ref().display(), "creating pool file");
        Ok(Self::from_trie(Trie::create(arena, backend), config))
    }

    /// Open an existing pool file. The chunk size is read from its header.
    pub fn open(path: impl AsRef<Path>, backend: P) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;

        let mut header = [0u8; HEADER_SIZE as usize];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(Error::InvalidPool("file is shorter than a pool header".into()));
            }
            Err(e) => return Err(e.into()),
        }
        let chunk_size = pool::header_chunk_size(&header)
            .ok_or_else(|| Error::InvalidPool("missing pool magic".into()))?;
        let config = Config::default().chunk_size(chunk_size);
        config
            .validate()
            .map_err(|e| Error::InvalidPool(format!("stored chunk size rejected: {e}")))?;

        let arena = Arena::map_file(file, chunk_size)?;
        debug!(path = %path.as_ref().display(), chunk_size, "opening pool file");
        Ok(Self::from_trie(Trie::recover(arena, backend)?, config))
    }

    /// Adopt a durable image, such as one rebuilt by [`Journal::image`].
    pub fn recover(config: Config, image: Arena, backend: P) -> Result<Self> {
        config.validate()?;
        if image.chunk_size() != config.chunk_size {
            return Err(Error::InvalidConfig(format!(
                "image chunk size {} differs from configured {}",
                image.chunk_size(),
                config.chunk_size
            )));
        }
        Ok(Self::from_trie(Trie::recover(image, backend)?, config))
    }

    /// Insert or update `key`. Returns the previous value if the key existed.
    ///
    /// Fails without modifying the tree if the key spans more than
    /// [`MAX_KEY_UNITS`] units, if it is a proper prefix of a stored key (or a
    /// stored key is a proper prefix of it), or if a file-backed pool cannot
    /// grow.
    pub fn insert(&self, key: &K, value: u64) -> Result<Option<u64>> {
        let key = key.encode();
        self.inner.write().insert(key.as_ref(), value)
    }

    /// Look up `key`.
    pub fn search(&self, key: &K) -> Option<u64> {
        let key = key.encode();
        self.inner.read().search(key.as_ref())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.search(key).is_some()
    }

    /// Up to `count` values whose keys are `>= min_key`, in key order.
    pub fn scan(&self, min_key: &K, count: usize) -> Vec<u64> {
        let min_key = min_key.encode();
        self.inner.read().scan(min_key.as_ref(), count)
    }

    /// Like [`scan`](Self::scan), but also returns the keys.
    pub fn scan_entries(&self, min_key: &K, count: usize) -> Vec<(K::Owned, u64)> {
        let min_key = min_key.encode();
        let inner = self.inner.read();
        let mut out = Vec::with_capacity(count.min(1024));
        inner.scan_with(min_key.as_ref(), count, |k, v| out.push((K::decode(k), v)));
        out
    }

    /// Entry with the smallest key.
    pub fn minimum(&self) -> Option<(K::Owned, u64)> {
        self.inner.read().minimum().map(|(k, v)| (K::decode(&k), v))
    }

    /// Number of keys. Best effort after a crash: the counter is persisted
    /// without ordering, so it may lag the last insert.
    pub fn len(&self) -> usize {
        self.inner.read().len() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TreeStats {
        self.inner.read().stats()
    }

    /// Verify tree integrity - returns list of issues found.
    pub fn verify(&self) -> Vec<String> {
        self.inner.read().verify()
    }

    /// Render the tree structure for debugging.
    pub fn dump(&self) -> String {
        self.inner.read().dump()
    }

    /// Print the tree structure to stdout.
    pub fn debug_print(&self) {
        print!("{}", self.dump());
    }

    /// Flush a file-backed pool to its file. No-op for heap pools.
    pub fn sync(&self) -> Result<()> {
        Ok(self.inner.read().arena().sync()?)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared access to the persistence backend.
    pub fn backend(&self) -> MappedRwLockReadGuard<'_, P> {
        RwLockReadGuard::map(self.inner.read(), |t| &t.pool.backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_basic_operations() {
        let tree = BytesWoart::new();

        assert_eq!(tree.insert(b"key1", 1).unwrap(), None);
        assert_eq!(tree.insert(b"key2", 2).unwrap(), None);
        assert_eq!(tree.insert(b"key1", 10).unwrap(), Some(1));

        assert_eq!(tree.search(b"key1"), Some(10));
        assert_eq!(tree.search(b"key2"), Some(2));
        assert_eq!(tree.search(b"key3"), None);

        assert!(tree.contains_key(b"key1"));
        assert!(!tree.contains_key(b"key3"));
        assert_eq!(tree.len(), 2);
        assert!(!tree.is_empty());
        assert_eq!(tree.minimum(), Some((b"key1".to_vec(), 10)));
    }

    #[test]
    fn test_idempotent_reinsert() {
        let tree = IntWoart::new();
        tree.insert(&7, 70).unwrap();
        let before = tree.stats();
        assert_eq!(tree.insert(&7, 70).unwrap(), Some(70));
        assert_eq!(tree.stats().inner_count(), before.inner_count());
        assert_eq!(tree.stats().leaf_count, 1);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_integer_node4_grows_on_fifth_key() {
        let tree = IntWoart::new();
        for k in 1..=4u64 {
            tree.insert(&k, k).unwrap();
        }
        let stats = tree.stats();
        assert_eq!((stats.node4_count, stats.node16_count), (1, 0));

        tree.insert(&5, 5).unwrap();
        let stats = tree.stats();
        assert_eq!((stats.node4_count, stats.node16_count), (0, 1));
        for k in 1..=5u64 {
            assert_eq!(tree.search(&k), Some(k));
        }
    }

    #[test]
    fn test_integer_scan_random_thousand() {
        let mut rng = StdRng::seed_from_u64(42);
        let tree = IntWoart::new();
        let mut model = BTreeMap::new();
        while model.len() < 1000 {
            let k: u64 = rng.gen();
            tree.insert(&k, !k).unwrap();
            model.insert(k, !k);
        }

        let all = tree.scan_entries(&0, 1000);
        assert_eq!(all, model.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>());
        assert_eq!(tree.scan(&0, usize::MAX).len(), 1000);
        assert!(tree.verify().is_empty());
    }

    #[test]
    fn test_byte_key_errors() {
        let tree = BytesWoart::new();
        tree.insert(b"prefix-and-more", 1).unwrap();
        assert!(matches!(tree.insert(b"prefix", 2), Err(Error::PrefixConflict)));

        let long = vec![b'x'; MAX_KEY_UNITS + 1];
        assert!(matches!(tree.insert(&long, 3), Err(Error::KeyTooLong { .. })));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_with_config_validates() {
        assert!(matches!(
            IntWoart::with_config(Config::default().chunk_size(100)),
            Err(Error::InvalidConfig(_))
        ));
        let tree = IntWoart::with_config(Config::default().chunk_size(8192)).unwrap();
        for k in 0..2000u64 {
            tree.insert(&(k * 7919), k).unwrap();
        }
        assert!(tree.stats().allocated_bytes > 8192);
        assert!(tree.verify().is_empty());
    }

    #[test]
    fn test_cache_line_flush_backend() {
        let config = Config::default().flush_latency(Duration::from_nanos(50));
        let backend = CacheLineFlush::from_config(&config);
        let tree: BytesWoart<CacheLineFlush> = Woart::with_backend(config, backend).unwrap();
        for i in 0..500u32 {
            tree.insert(format!("k{i:05}").as_bytes(), i as u64).unwrap();
        }
        assert_eq!(tree.search(b"k00042"), Some(42));
        assert_eq!(tree.scan(b"k00498", 10), vec![498, 499]);
    }

    #[test]
    fn test_recover_from_journal_image() {
        let tree: IntWoart<Journal> = Woart::with_backend(Config::default(), Journal::new()).unwrap();
        for k in 0..100u64 {
            tree.insert(&k, k + 1).unwrap();
        }
        let image = {
            let journal = tree.backend();
            journal.image(tree.config().chunk_size, journal.len())
        };

        let recovered: IntWoart = Woart::recover(Config::default(), image, NoFlush).unwrap();
        for k in 0..100u64 {
            assert_eq!(recovered.search(&k), Some(k + 1));
        }
        assert_eq!(recovered.len(), 100);
        recovered.insert(&1000, 1).unwrap();
        assert_eq!(recovered.search(&1000), Some(1));

        let wrong: Result<BytesWoart> = Woart::recover(
            Config::default(),
            tree.backend().image(tree.config().chunk_size, usize::MAX),
            NoFlush,
        );
        assert!(matches!(wrong, Err(Error::InvalidPool(_))));
    }

    #[test]
    fn test_file_pool_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.pool");
        let config = Config::default().chunk_size(16 * 1024);

        {
            let tree: BytesWoart = Woart::create(&path, config, NoFlush).unwrap();
            for i in 0..3000u32 {
                tree.insert(format!("user:{i:05}").as_bytes(), i as u64).unwrap();
            }
            // Ids are padded: unpadded "user:1" would be a prefix of "user:10".
            assert!(matches!(tree.insert(b"user:0", 1), Err(Error::PrefixConflict)));
            tree.sync().unwrap();
        }

        let tree: BytesWoart = Woart::open(&path, NoFlush).unwrap();
        assert_eq!(tree.config().chunk_size, 16 * 1024);
        assert_eq!(tree.len(), 3000);
        assert_eq!(tree.search(b"user:01234"), Some(1234));
        assert_eq!(tree.search(b"user:1234"), None);
        assert!(tree.verify().is_empty());

        tree.insert(b"zz", 9).unwrap();
        assert_eq!(tree.search(b"zz"), Some(9));

        assert!(matches!(
            IntWoart::open(&path, NoFlush),
            Err(Error::InvalidPool(_))
        ));
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let short = dir.path().join("short");
        std::fs::write(&short, b"nope").unwrap();
        assert!(matches!(BytesWoart::open(&short, NoFlush), Err(Error::InvalidPool(_))));

        let junk = dir.path().join("junk");
        std::fs::write(&junk, vec![0xAB; 8192]).unwrap();
        assert!(matches!(BytesWoart::open(&junk, NoFlush), Err(Error::InvalidPool(_))));

        let missing = dir.path().join("missing");
        assert!(matches!(BytesWoart::open(&missing, NoFlush), Err(Error::Io(_))));
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let tree = Arc::new(IntWoart::new());
        let writers: Vec<_> = (0..4u64)
            .map(|t| {
                let tree = Arc::clone(&tree);
                std::thread::spawn(move || {
                    for i in 0..2000u64 {
                        let k = i * 4 + t;
                        tree.insert(&k, k * 2).unwrap();
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..2)
            .map(|_| {
                let tree = Arc::clone(&tree);
                std::thread::spawn(move || {
                    for i in 0..2000u64 {
                        if let Some(v) = tree.search(&i) {
                            assert_eq!(v, i * 2);
                        }
                        let scanned = tree.scan_entries(&i, 8);
                        assert!(scanned.windows(2).all(|w| w[0].0 < w[1].0));
                    }
                })
            })
            .collect();
        for h in writers.into_iter().chain(readers) {
            h.join().unwrap();
        }

        assert_eq!(tree.len(), 8000);
        for k in 0..8000u64 {
            assert_eq!(tree.search(&k), Some(k * 2));
        }
        assert!(tree.verify().is_empty());
    }
}
