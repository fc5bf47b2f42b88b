//! The crash-consistent radix tree.
//!
//! Insertion descends iteratively, carrying the current `depth` (key units
//! consumed) and `slot`, the arena offset of the word that references the node
//! being visited. Every structural change is built in unreachable memory,
//! persisted and fenced, then published by storing one aligned word.
//!
//! The one multi-step change is the mid-path split, which publishes twice: the
//! existing node's path header is shortened first, then the new parent is
//! linked into `slot`. A crash in between leaves a node whose stored depth is
//! ahead of the depth at which it is reached. Such a *stale* header still ends
//! its compressed path at the right unit, so readers skip to that end and the
//! next writer to pass by rewrites the header from a descendant leaf.

mod debug;
pub(crate) mod node;
mod scan;


use std::marker::PhantomData;

use smallvec::SmallVec;
use tracing::{error, trace, warn};

use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::key::{KeyUnits, MAX_KEY_UNITS};
use crate::persist::Persistence;
use crate::pool::{Pool, ROOT_SLOT};

pub use debug::TreeStats;
pub use node::NodeKind;

use node::{
    add_child, add_child_unlinked, alloc_node, find_child, leaf_key, leaf_size, leaf_value,
    leaf_value_slot, minimum_leaf, read_path, read_ptr, write_leaf, Child, PathHeader, Ptr,
    MAX_PREFIX_LEN, PATH_OFF,
};

/// How a node's stored path header relates to the depth it was reached at.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PathState {
    Current(PathHeader),
    /// Left behind by an interrupted split. The compressed path still ends at
    /// `header.end()` but starts earlier than `header.depth` says.
    Stale(PathHeader),
}

impl PathState {
    #[inline]
    pub(crate) fn header(self) -> PathHeader {
        match self {
            PathState::Current(h) | PathState::Stale(h) => h,
        }
    }
}

/// Classify the header of `node` reached at `depth`. A stored depth behind
/// the traversal depth cannot be produced by any interleaving of crashes and
/// is treated as corruption.
pub(crate) fn path_state(arena: &Arena, node: u64, depth: usize) -> PathState {
    let header = read_path(arena, node);
    let stored = header.depth as usize;
    if stored == depth {
        PathState::Current(header)
    } else if stored > depth {
        PathState::Stale(header)
    } else {
        error!(node, stored, depth, "node depth behind traversal depth");
        panic!("corrupt tree: node at {node} stores depth {stored}, reached at depth {depth}");
    }
}

/// The tree proper: a pool plus the key decomposition.
pub(crate) struct Trie<U, P> {
    pub(crate) pool: Pool<P>,
    _units: PhantomData<U>,
}

impl<U: KeyUnits, P: Persistence> Trie<U, P> {
    pub(crate) fn create(arena: Arena, backend: P) -> Self {
        Self {
            pool: Pool::create(arena, backend, U::BITS),
            _units: PhantomData,
        }
    }

    pub(crate) fn recover(arena: Arena, backend: P) -> Result<Self> {
        Ok(Self {
            pool: Pool::recover(arena, backend, U::BITS)?,
            _units: PhantomData,
        })
    }

    #[inline]
    pub(crate) fn arena(&self) -> &Arena {
        &self.pool.arena
    }

    #[inline]
    fn root(&self) -> Ptr {
        read_ptr(self.arena(), ROOT_SLOT)
    }

    pub(crate) fn len(&self) -> u64 {
        self.pool.size()
    }

    /// Units `depth..header.end()` of `node`'s compressed path: inline when the
    /// header is current and untruncated, from the minimum leaf otherwise.
    pub(crate) fn path_units(&self, node: u64, depth: usize) -> SmallVec<[u8; 16]> {
        let state = path_state(self.arena(), node, depth);
        let header = state.header();
        match state {
            PathState::Current(h) if h.partial_len as usize <= MAX_PREFIX_LEN => {
                h.partial[..h.inline_len()].iter().copied().collect()
            }
            _ => {
                let leaf = self.min_leaf_of(node);
                let key = leaf_key(self.arena(), leaf);
                (depth..header.end()).map(|i| U::unit(key, i)).collect()
            }
        }
    }

    fn min_leaf_of(&self, node: u64) -> u64 {
        match minimum_leaf(self.arena(), Ptr::node(node)) {
            Some(leaf) => leaf,
            None => {
                error!(node, "inner node without leaves");
                panic!("corrupt tree: node at {node} has no descendant leaf");
            }
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub(crate) fn search(&self, key: &[u8]) -> Option<u64> {
        let arena = self.arena();
        let units = U::unit_count(key);
        let mut ptr = self.root();
        let mut depth = 0usize;

        loop {
            match ptr.decode() {
                Child::Null => return None,
                Child::Leaf(leaf) => {
                    return (leaf_key(arena, leaf) == key).then(|| leaf_value(arena, leaf));
                }
                Child::Node(node) => {
                    match path_state(arena, node, depth) {
                        PathState::Current(h) => {
                            // Optimistic: only the inline units are compared,
                            // the leaf comparison settles the rest.
                            let n = h.inline_len().min(units.saturating_sub(depth));
                            if (0..n).any(|i| h.partial[i] != U::unit(key, depth + i)) {
                                return None;
                            }
                            depth = h.end();
                        }
                        PathState::Stale(h) => depth = h.end(),
                    }
                    if depth >= units {
                        return None;
                    }
                    let slot = find_child(arena, node, U::unit(key, depth))?;
                    ptr = read_ptr(arena, slot);
                    depth += 1;
                }
            }
        }
    }

    /// Position where `key` and the compressed path of `node` (reached at
    /// `depth`) first differ, capped at the path length. Long paths are
    /// completed from the node's minimum leaf.
    fn prefix_mismatch(&self, node: u64, header: PathHeader, key: &[u8], depth: usize) -> usize {
        let available = U::unit_count(key).saturating_sub(depth);
        let inline = header.inline_len().min(available);
        for idx in 0..inline {
            if header.partial[idx] != U::unit(key, depth + idx) {
                return idx;
            }
        }

        let full = (header.partial_len as usize).min(available);
        if full > inline {
            let leaf = self.min_leaf_of(node);
            let leaf_bytes = leaf_key(self.arena(), leaf);
            for idx in inline..full {
                if U::unit(leaf_bytes, depth + idx) != U::unit(key, depth + idx) {
                    return idx;
                }
            }
        }
        full
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Insert or update. Returns the previous value for an existing key.
    pub(crate) fn insert(&mut self, key: &[u8], value: u64) -> Result<Option<u64>> {
        let units = U::unit_count(key);
        if units > MAX_KEY_UNITS {
            return Err(Error::KeyTooLong {
                units,
                max: MAX_KEY_UNITS,
            });
        }

        let mut slot = ROOT_SLOT;
        let mut depth = 0usize;

        loop {
            match read_ptr(self.arena(), slot).decode() {
                Child::Null => {
                    let leaf = self.persisted_leaf(key, value)?;
                    self.pool.store_word(slot, Ptr::leaf(leaf).raw());
                    self.pool.fence();
                    self.pool.bump_size();
                    return Ok(None);
                }
                Child::Leaf(leaf) => return self.insert_at_leaf(slot, leaf, depth, key, value),
                Child::Node(node) => {
                    let header = match path_state(self.arena(), node, depth) {
                        PathState::Current(h) => h,
                        PathState::Stale(h) => self.repair_path(node, depth, h),
                    };

                    if header.partial_len > 0 {
                        let diff = self.prefix_mismatch(node, header, key, depth);
                        if diff < header.partial_len as usize {
                            if depth + diff >= units {
                                return Err(Error::PrefixConflict);
                            }
                            self.split_path(slot, node, header, depth, diff, key, value)?;
                            self.pool.bump_size();
                            return Ok(None);
                        }
                        depth += header.partial_len as usize;
                    }

                    if depth >= units {
                        return Err(Error::PrefixConflict);
                    }
                    let unit = U::unit(key, depth);
                    match find_child(self.arena(), node, unit) {
                        Some(child_slot) => {
                            slot = child_slot;
                            depth += 1;
                        }
                        None => {
                            let leaf = self.persisted_leaf(key, value)?;
                            add_child(&mut self.pool, node, slot, unit, Ptr::leaf(leaf))?;
                            self.pool.bump_size();
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    /// Allocate a leaf, persist it and fence.
    fn persisted_leaf(&mut self, key: &[u8], value: u64) -> Result<u64> {
        let leaf = write_leaf(&mut self.pool, key, value)?;
        self.pool.persist(leaf, leaf_size(key.len()));
        self.pool.fence();
        Ok(leaf)
    }

    /// Update the value of an equal key, or split the leaf under a new Node4.
    fn insert_at_leaf(&mut self, slot: u64, leaf: u64, depth: usize, key: &[u8], value: u64) -> Result<Option<u64>> {
        let existing = leaf_key(self.arena(), leaf);
        if existing == key {
            let old = leaf_value(self.arena(), leaf);
            self.pool.store_word(leaf_value_slot(leaf), value);
            self.pool.fence();
            return Ok(Some(old));
        }

        let units = U::unit_count(key);
        let shorter = units.min(U::unit_count(existing));
        let lcp = (depth..shorter)
            .take_while(|&i| U::unit(existing, i) == U::unit(key, i))
            .count();
        let split = depth + lcp;
        if split >= shorter {
            return Err(Error::PrefixConflict);
        }
        let existing_unit = U::unit(existing, split);

        let mut path = PathHeader {
            depth: depth as u8,
            partial_len: lcp as u8,
            ..PathHeader::default()
        };
        for i in 0..path.inline_len() {
            path.partial[i] = U::unit(key, depth + i);
        }

        let new_leaf = write_leaf(&mut self.pool, key, value)?;
        let node = alloc_node(&mut self.pool, NodeKind::Node4, path)?;
        add_child_unlinked(&mut self.pool.arena, node, existing_unit, Ptr::leaf(leaf));
        add_child_unlinked(&mut self.pool.arena, node, U::unit(key, split), Ptr::leaf(new_leaf));

        self.pool.persist(node, NodeKind::Node4.size());
        self.pool.persist(new_leaf, leaf_size(key.len()));
        self.pool.fence();
        self.pool.store_word(slot, Ptr::node(node).raw());
        self.pool.fence();
        self.pool.bump_size();

        trace!(depth, lcp, node, "split leaf");
        Ok(None)
    }

    /// Split the compressed path of `node` after `diff` matching units.
    #[allow(clippy::too_many_arguments)]
    fn split_path(
        &mut self,
        slot: u64,
        node: u64,
        header: PathHeader,
        depth: usize,
        diff: usize,
        key: &[u8],
        value: u64,
    ) -> Result<()> {
        let mut upper = PathHeader {
            depth: depth as u8,
            partial_len: diff as u8,
            ..PathHeader::default()
        };
        let copied = upper.inline_len();
        upper.partial[..copied].copy_from_slice(&header.partial[..copied]);

        // The existing node keeps the units after its branching unit.
        let mut lower = PathHeader {
            depth: (depth + diff + 1) as u8,
            partial_len: header.partial_len - diff as u8 - 1,
            ..PathHeader::default()
        };
        let branch_unit;
        if header.partial_len as usize <= MAX_PREFIX_LEN {
            branch_unit = header.partial[diff];
            let n = lower.inline_len();
            lower.partial[..n].copy_from_slice(&header.partial[diff + 1..diff + 1 + n]);
        } else {
            let leaf = self.min_leaf_of(node);
            let leaf_bytes = leaf_key(self.arena(), leaf);
            branch_unit = U::unit(leaf_bytes, depth + diff);
            for i in 0..lower.inline_len() {
                lower.partial[i] = U::unit(leaf_bytes, depth + diff + 1 + i);
            }
        }

        let new_leaf = write_leaf(&mut self.pool, key, value)?;
        let parent = alloc_node(&mut self.pool, NodeKind::Node4, upper)?;
        add_child_unlinked(&mut self.pool.arena, parent, branch_unit, Ptr::node(node));
        add_child_unlinked(&mut self.pool.arena, parent, U::unit(key, depth + diff), Ptr::leaf(new_leaf));

        self.pool.persist(parent, NodeKind::Node4.size());
        self.pool.persist(new_leaf, leaf_size(key.len()));
        self.pool.fence();

        self.pool.store_word(node + PATH_OFF, lower.to_word());
        self.pool.fence();

        self.pool.store_word(slot, Ptr::node(parent).raw());
        self.pool.fence();

        trace!(depth, diff, old = node, parent, "split compressed path");
        Ok(())
    }

    /// Rewrite a stale header so its path starts at `depth`. One word store.
    fn repair_path(&mut self, node: u64, depth: usize, stale: PathHeader) -> PathHeader {
        let leaf = self.min_leaf_of(node);
        let leaf_bytes = leaf_key(self.arena(), leaf);

        let mut header = PathHeader {
            depth: depth as u8,
            partial_len: (stale.end() - depth) as u8,
            ..PathHeader::default()
        };
        for i in 0..header.inline_len() {
            header.partial[i] = U::unit(leaf_bytes, depth + i);
        }

        warn!(
            node,
            stored_depth = stale.depth,
            depth,
            "repairing path header left by an interrupted split"
        );
        self.pool.store_word(node + PATH_OFF, header.to_word());
        self.pool.fence();
        header
    }

    /// Smallest entry.
    pub(crate) fn minimum(&self) -> Option<(Vec<u8>, u64)> {
        let leaf = minimum_leaf(self.arena(), self.root())?;
        Some((leaf_key(self.arena(), leaf).to_vec(), leaf_value(self.arena(), leaf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{Bytes, Nibbles};
    use crate::persist::NoFlush;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn bytes_trie() -> Trie<Bytes, NoFlush> {
        Trie::create(Arena::heap(1 << 16), NoFlush)
    }

    fn int_trie() -> Trie<Nibbles, NoFlush> {
        Trie::create(Arena::heap(1 << 16), NoFlush)
    }

    fn root_node<U: KeyUnits>(t: &Trie<U, NoFlush>) -> u64 {
        match t.root().decode() {
            Child::Node(n) => n,
            other => panic!("root is {other:?}"),
        }
    }

    #[test]
    fn test_empty_tree() {
        let t = bytes_trie();
        assert_eq!(t.search(b"anything"), None);
        assert_eq!(t.minimum(), None);
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn test_insert_search_update() {
        let mut t = bytes_trie();
        assert_eq!(t.insert(b"apple", 1).unwrap(), None);
        assert_eq!(t.insert(b"apricot", 2).unwrap(), None);
        assert_eq!(t.insert(b"banana", 3).unwrap(), None);

        assert_eq!(t.search(b"apple"), Some(1));
        assert_eq!(t.search(b"apricot"), Some(2));
        assert_eq!(t.search(b"banana"), Some(3));
        assert_eq!(t.search(b"apples"), None);
        assert_eq!(t.search(b"ap"), None);
        assert_eq!(t.search(b""), None);

        assert_eq!(t.insert(b"apple", 10).unwrap(), Some(1));
        assert_eq!(t.insert(b"apple", 10).unwrap(), Some(10));
        assert_eq!(t.search(b"apple"), Some(10));
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn test_node4_grows_on_fifth_child() {
        let mut t = int_trie();
        for k in 1..=4u64 {
            t.insert(&k.to_be_bytes(), k).unwrap();
        }
        let node = root_node(&t);
        assert_eq!(node::node_kind(t.arena(), node), NodeKind::Node4);

        t.insert(&5u64.to_be_bytes(), 5).unwrap();
        let node = root_node(&t);
        assert_eq!(node::node_kind(t.arena(), node), NodeKind::Node16);
        for k in 1..=5u64 {
            assert_eq!(t.search(&k.to_be_bytes()), Some(k));
        }
    }

    #[test]
    fn test_long_shared_prefix_is_compressed() {
        let mut t = bytes_trie();
        let a = b"0123456789abcdefX";
        let b = b"0123456789abcdefY";
        t.insert(a, 1).unwrap();
        t.insert(b, 2).unwrap();

        let node = root_node(&t);
        let header = read_path(t.arena(), node);
        assert_eq!(header.depth, 0);
        assert_eq!(header.partial_len, 16);
        assert_eq!(&header.partial, b"012345");
        assert_eq!(node::children(t.arena(), node).len(), 2);

        assert_eq!(t.search(a), Some(1));
        assert_eq!(t.search(b), Some(2));
        assert_eq!(t.search(b"0123456789abcdefZ"), None);
        // Differs beyond the inline units: the leaf comparison rejects it.
        assert_eq!(t.search(b"0123456789abcdxfX"), None);
    }

    #[test]
    fn test_mid_path_split() {
        let mut t = bytes_trie();
        t.insert(b"abcdefghij1", 1).unwrap();
        t.insert(b"abcdefghij2", 2).unwrap();
        // Diverges at unit 3, inside the inline partial.
        t.insert(b"abcXefghij3", 3).unwrap();
        // Diverges at unit 8, beyond the inline partial of the lower node.
        t.insert(b"abcdefghXj4", 4).unwrap();

        for (k, v) in [
            (b"abcdefghij1", 1),
            (b"abcdefghij2", 2),
            (b"abcXefghij3", 3),
            (b"abcdefghXj4", 4),
        ] {
            assert_eq!(t.search(k), Some(v), "{}", String::from_utf8_lossy(k));
        }

        let root = root_node(&t);
        let header = read_path(t.arena(), root);
        assert_eq!((header.depth, header.partial_len), (0, 3));
        assert!(t.verify().is_empty(), "{:?}", t.verify());
    }

    #[test]
    fn test_prefix_conflicts_are_rejected() {
        let mut t = bytes_trie();
        t.insert(b"abcdef", 1).unwrap();
        assert!(matches!(t.insert(b"abc", 2), Err(Error::PrefixConflict)));
        assert!(matches!(t.insert(b"abcdefgh", 2), Err(Error::PrefixConflict)));

        t.insert(b"abcxyz", 3).unwrap();
        // Runs out inside the compressed path and exactly at its end.
        assert!(matches!(t.insert(b"ab", 4), Err(Error::PrefixConflict)));
        assert!(matches!(t.insert(b"abc", 4), Err(Error::PrefixConflict)));
        assert!(matches!(t.insert(b"abcdefg", 4), Err(Error::PrefixConflict)));

        assert_eq!(t.len(), 2);
        assert_eq!(t.search(b"abcdef"), Some(1));
        assert_eq!(t.search(b"abcxyz"), Some(3));
    }

    #[test]
    fn test_key_too_long() {
        let mut t = bytes_trie();
        let key = vec![7u8; MAX_KEY_UNITS + 1];
        assert!(matches!(t.insert(&key, 1), Err(Error::KeyTooLong { units: 256, max: 255 })));
        let key = vec![7u8; MAX_KEY_UNITS];
        assert_eq!(t.insert(&key, 1).unwrap(), None);
        assert_eq!(t.search(&key), Some(1));
    }

    #[test]
    fn test_stale_header_is_tolerated_and_repaired() {
        let mut t = bytes_trie();
        t.insert(b"abcdefghij1", 1).unwrap();
        t.insert(b"abcdefghij2", 2).unwrap();

        // Simulate a crash after the header rewrite of a split at unit 3,
        // before the new parent was linked.
        let node = root_node(&t);
        let header = read_path(t.arena(), node);
        let shortened = PathHeader {
            depth: 4,
            partial_len: header.partial_len - 4,
            partial: [b'e', b'f', b'g', b'h', b'i', b'j'],
        };
        t.pool.store_word(node + PATH_OFF, shortened.to_word());

        assert_eq!(t.search(b"abcdefghij1"), Some(1));
        assert_eq!(t.search(b"abcdefghij2"), Some(2));
        assert!(t.verify().is_empty(), "{:?}", t.verify());
        assert_eq!(t.scan_entries(b"", 10).len(), 2);

        t.insert(b"abcdefghij3", 3).unwrap();
        assert_eq!(read_path(t.arena(), root_node(&t)), header);
        assert_eq!(t.search(b"abcdefghij3"), Some(3));
    }

    #[test]
    #[should_panic(expected = "corrupt tree")]
    fn test_depth_behind_traversal_panics() {
        let mut t = bytes_trie();
        t.insert(b"xa", 1).unwrap();
        t.insert(b"xb", 2).unwrap();
        t.insert(b"ya", 3).unwrap();
        let root = root_node(&t);
        let child = node::find_child(t.arena(), root, b'x').unwrap();
        let Child::Node(inner) = read_ptr(t.arena(), child).decode() else {
            panic!("expected inner node");
        };
        t.pool.store_word(inner + PATH_OFF, PathHeader::default().to_word());
        t.search(b"xa");
    }

    #[test]
    fn test_random_integers_against_model() {
        let mut rng = StdRng::seed_from_u64(0xA27);
        let mut t = int_trie();
        let mut model = std::collections::BTreeMap::new();
        for _ in 0..5_000 {
            let k: u64 = if rng.gen_bool(0.5) { rng.gen() } else { rng.gen_range(0..512) };
            let v: u64 = rng.gen();
            assert_eq!(t.insert(&k.to_be_bytes(), v).unwrap(), model.insert(k, v));
        }
        for (k, v) in &model {
            assert_eq!(t.search(&k.to_be_bytes()), Some(*v));
        }
        assert_eq!(t.len(), model.len() as u64);
        assert!(t.verify().is_empty());
    }
}
