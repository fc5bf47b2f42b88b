//! Node layouts in the arena.
//!
//! Every inner node starts with the same 16-byte header:
//!
//! ```text
//! 0      kind (1 = Node4, 2 = Node16, 3 = Node48, 4 = Node256)
//! 8      path word: depth, partial_len, partial[6]
//! ```
//!
//! followed by a shape-specific body. Each shape has exactly one 8-byte word
//! whose store publishes a new child:
//!
//! - Node4: four sorted `(unit, child index)` pairs packed in the slot word
//! - Node16: the occupancy bitmap word
//! - Node48: the bitmap group word for the unit (`k_bits` | `p_bits << 16`)
//! - Node256: the child pointer itself
//!
//! Leaves are `value: u64`, `key_len: u32`, then the key bytes.

use smallvec::SmallVec;
use tracing::{debug, error};

use crate::arena::Arena;
use crate::error::Result;
use crate::persist::Persistence;
use crate::pool::Pool;

/// Inline partial units kept in a node header.
pub const MAX_PREFIX_LEN: usize = 6;

// =============================================================================
// Pointer type
// =============================================================================

/// Child pointer word: `0` is null, bit 0 tags a leaf, anything else is the
/// offset of an inner node. Allocations are cache-line aligned so the tag bit
/// is always free.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Ptr(u64);

impl Ptr {
    const LEAF_BIT: u64 = 1;
    pub(crate) const NULL: Ptr = Ptr(0);

    #[inline]
    pub(crate) fn leaf(off: u64) -> Self {
        debug_assert!(off != 0 && off & Self::LEAF_BIT == 0);
        Self(off | Self::LEAF_BIT)
    }

    #[inline]
    pub(crate) fn node(off: u64) -> Self {
        debug_assert!(off != 0 && off & Self::LEAF_BIT == 0);
        Self(off)
    }

    #[inline]
    pub(crate) fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub(crate) fn decode(self) -> Child {
        if self.0 == 0 {
            Child::Null
        } else if self.0 & Self::LEAF_BIT != 0 {
            Child::Leaf(self.0 & !Self::LEAF_BIT)
        } else {
            Child::Node(self.0)
        }
    }
}

/// Decoded child pointer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Child {
    Null,
    Leaf(u64),
    Node(u64),
}

#[inline]
pub(crate) fn read_ptr(arena: &Arena, slot: u64) -> Ptr {
    Ptr(arena.read_u64(slot))
}

// =============================================================================
// Node kinds and layout constants
// =============================================================================

/// Shape of an inner node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeKind {
    Node4 = 1,
    Node16 = 2,
    Node48 = 3,
    Node256 = 4,
}

impl NodeKind {
    #[inline]
    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(NodeKind::Node4),
            2 => Some(NodeKind::Node16),
            3 => Some(NodeKind::Node48),
            4 => Some(NodeKind::Node256),
            _ => None,
        }
    }

    /// Bytes occupied by a node of this kind.
    #[inline]
    pub(crate) fn size(self) -> usize {
        match self {
            NodeKind::Node4 => N4_CHILDREN as usize + 4 * 8,
            NodeKind::Node16 => N16_CHILDREN as usize + 16 * 8,
            NodeKind::Node48 => N48_CHILDREN as usize + 48 * 8,
            NodeKind::Node256 => N256_CHILDREN as usize + 256 * 8,
        }
    }

    #[inline]
    pub(crate) fn capacity(self) -> usize {
        match self {
            NodeKind::Node4 => 4,
            NodeKind::Node16 => 16,
            NodeKind::Node48 => 48,
            NodeKind::Node256 => 256,
        }
    }

    fn grown(self) -> Option<Self> {
        match self {
            NodeKind::Node4 => Some(NodeKind::Node16),
            NodeKind::Node16 => Some(NodeKind::Node48),
            NodeKind::Node48 => Some(NodeKind::Node256),
            NodeKind::Node256 => None,
        }
    }
}

const KIND_OFF: u64 = 0;
pub(crate) const PATH_OFF: u64 = 8;

const N4_SLOTS: u64 = 16;
const N4_CHILDREN: u64 = 24;
/// Slot word with every pair unused (unit 0, child index -1).
const N4_EMPTY_SLOTS: u64 = 0xFF00_FF00_FF00_FF00;

const N16_BITMAP: u64 = 16;
const N16_KEYS: u64 = 24;
const N16_CHILDREN: u64 = 40;
const N16_FULL: u64 = 0xFFFF;

const N48_GROUPS: u64 = 16;
const N48_INDEX: u64 = 144;
const N48_CHILDREN: u64 = 400;
const N48_FULL: u64 = (1 << 48) - 1;

const N256_CHILDREN: u64 = 16;

const LEAF_VALUE: u64 = 0;
const LEAF_KEY_LEN: u64 = 8;
const LEAF_KEY: u64 = 12;

/// Read a node's kind. An unknown tag is corruption.
#[inline]
pub(crate) fn node_kind(arena: &Arena, node: u64) -> NodeKind {
    let tag = arena.read_u8(node + KIND_OFF);
    match NodeKind::from_tag(tag) {
        Some(kind) => kind,
        None => {
            error!(node, tag, "unknown node kind");
            panic!("corrupt tree: node at {node} has unknown kind tag {tag}");
        }
    }
}

// =============================================================================
// Path header
// =============================================================================

/// The compressed-path descriptor, stored as one aligned word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct PathHeader {
    /// Units consumed before this node's compressed path.
    pub depth: u8,
    /// Units compressed into this node.
    pub partial_len: u8,
    /// First `min(partial_len, MAX_PREFIX_LEN)` of those units.
    pub partial: [u8; MAX_PREFIX_LEN],
}

impl PathHeader {
    #[inline]
    pub(crate) fn from_word(word: u64) -> Self {
        let b = word.to_le_bytes();
        Self {
            depth: b[0],
            partial_len: b[1],
            partial: [b[2], b[3], b[4], b[5], b[6], b[7]],
        }
    }

    #[inline]
    pub(crate) fn to_word(self) -> u64 {
        let p = self.partial;
        u64::from_le_bytes([self.depth, self.partial_len, p[0], p[1], p[2], p[3], p[4], p[5]])
    }

    /// Units of the path that are held inline.
    #[inline]
    pub(crate) fn inline_len(self) -> usize {
        (self.partial_len as usize).min(MAX_PREFIX_LEN)
    }

    /// First unit position past the compressed path.
    #[inline]
    pub(crate) fn end(self) -> usize {
        self.depth as usize + self.partial_len as usize
    }
}

#[inline]
pub(crate) fn read_path(arena: &Arena, node: u64) -> PathHeader {
    PathHeader::from_word(arena.read_u64(node + PATH_OFF))
}

// =============================================================================
// Leaves
// =============================================================================

#[inline]
pub(crate) fn leaf_value(arena: &Arena, leaf: u64) -> u64 {
    arena.read_u64(leaf + LEAF_VALUE)
}

#[inline]
pub(crate) fn leaf_key(arena: &Arena, leaf: u64) -> &[u8] {
    let len = arena.read_u32(leaf + LEAF_KEY_LEN) as usize;
    arena.bytes(leaf + LEAF_KEY, len)
}

#[inline]
pub(crate) fn leaf_value_slot(leaf: u64) -> u64 {
    leaf + LEAF_VALUE
}

/// Allocate and fill a leaf. Not persisted.
pub(crate) fn write_leaf<P: Persistence>(pool: &mut Pool<P>, key: &[u8], value: u64) -> Result<u64> {
    let leaf = pool.alloc(leaf_size(key.len()))?;
    pool.arena.write_u64(leaf + LEAF_VALUE, value);
    pool.arena.write_u32(leaf + LEAF_KEY_LEN, key.len() as u32);
    pool.arena.write_bytes(leaf + LEAF_KEY, key);
    Ok(leaf)
}

#[inline]
pub(crate) fn leaf_size(key_len: usize) -> usize {
    LEAF_KEY as usize + key_len
}

// =============================================================================
// Node4 slot word
// =============================================================================

/// Decoded Node4 slot word: `(unit, child index)` pairs, `-1` marks unused.
#[inline]
fn n4_pairs(word: u64) -> [(u8, i8); 4] {
    let b = word.to_le_bytes();
    [
        (b[0], b[1] as i8),
        (b[2], b[3] as i8),
        (b[4], b[5] as i8),
        (b[6], b[7] as i8),
    ]
}

#[inline]
fn n4_word(pairs: [(u8, i8); 4]) -> u64 {
    let mut b = [0u8; 8];
    for (i, (unit, idx)) in pairs.into_iter().enumerate() {
        b[2 * i] = unit;
        b[2 * i + 1] = idx as u8;
    }
    u64::from_le_bytes(b)
}

/// Used pairs of a Node4, in unit order.
#[inline]
fn n4_used(arena: &Arena, node: u64) -> SmallVec<[(u8, i8); 4]> {
    n4_pairs(arena.read_u64(node + N4_SLOTS))
        .into_iter()
        .take_while(|&(_, idx)| idx != -1)
        .collect()
}

/// Slot word with `(unit, idx)` inserted in order, or `None` when full.
fn n4_insert_pair(word: u64, unit: u8, idx: i8) -> Option<u64> {
    let pairs = n4_pairs(word);
    let used = pairs.iter().take_while(|&&(_, i)| i != -1).count();
    if used == 4 {
        return None;
    }
    let pos = pairs[..used].iter().position(|&(u, _)| unit < u).unwrap_or(used);

    let mut out = [(0u8, -1i8); 4];
    out[..pos].copy_from_slice(&pairs[..pos]);
    out[pos] = (unit, idx);
    out[pos + 1..=used].copy_from_slice(&pairs[pos..used]);
    Some(n4_word(out))
}

// =============================================================================
// Node48 bitmap groups
// =============================================================================

#[inline]
fn n48_group(arena: &Arena, node: u64, unit: u8) -> u64 {
    arena.read_u64(node + N48_GROUPS + (unit as u64 / 16) * 8)
}

#[inline]
fn n48_has(group: u64, unit: u8) -> bool {
    group & (1 << (unit % 16)) != 0
}

/// Union of every group's child-slot occupancy bits.
fn n48_occupied(arena: &Arena, node: u64) -> u64 {
    (0..16u64).fold(0, |acc, g| acc | (arena.read_u64(node + N48_GROUPS + g * 8) >> 16))
}

// =============================================================================
// Reads
// =============================================================================

/// Arena offset of the word holding the child for `unit`, if present.
pub(crate) fn find_child(arena: &Arena, node: u64, unit: u8) -> Option<u64> {
    match node_kind(arena, node) {
        NodeKind::Node4 => n4_used(arena, node)
            .into_iter()
            .find(|&(u, _)| u == unit)
            .map(|(_, idx)| node + N4_CHILDREN + idx as u64 * 8),
        NodeKind::Node16 => {
            let bitmap = arena.read_u64(node + N16_BITMAP);
            (0..16u64)
                .filter(|i| bitmap & (1 << i) != 0)
                .find(|&i| arena.read_u8(node + N16_KEYS + i) == unit)
                .map(|i| node + N16_CHILDREN + i * 8)
        }
        NodeKind::Node48 => {
            if !n48_has(n48_group(arena, node, unit), unit) {
                return None;
            }
            let idx = arena.read_u8(node + N48_INDEX + unit as u64) as u64;
            Some(node + N48_CHILDREN + idx * 8)
        }
        NodeKind::Node256 => {
            let slot = node + N256_CHILDREN + unit as u64 * 8;
            (arena.read_u64(slot) != 0).then_some(slot)
        }
    }
}

/// Child with the smallest unit strictly greater than `after` (any unit when
/// `after` is `None`).
pub(crate) fn next_child(arena: &Arena, node: u64, after: Option<u8>) -> Option<(u8, Ptr)> {
    let above = |unit: u8| after.map_or(true, |a| unit > a);
    match node_kind(arena, node) {
        NodeKind::Node4 => n4_used(arena, node)
            .into_iter()
            .find(|&(u, _)| above(u))
            .map(|(u, idx)| (u, read_ptr(arena, node + N4_CHILDREN + idx as u64 * 8))),
        NodeKind::Node16 => {
            // Entries are in arrival order; pick the smallest qualifying unit.
            let bitmap = arena.read_u64(node + N16_BITMAP);
            (0..16u64)
                .filter(|i| bitmap & (1 << i) != 0)
                .map(|i| (arena.read_u8(node + N16_KEYS + i), i))
                .filter(|&(u, _)| above(u))
                .min_by_key(|&(u, _)| u)
                .map(|(u, i)| (u, read_ptr(arena, node + N16_CHILDREN + i * 8)))
        }
        NodeKind::Node48 => {
            let start = after.map_or(0, |a| a as usize + 1);
            (start..256).map(|u| u as u8).find_map(|unit| {
                if !n48_has(n48_group(arena, node, unit), unit) {
                    return None;
                }
                let idx = arena.read_u8(node + N48_INDEX + unit as u64) as u64;
                Some((unit, read_ptr(arena, node + N48_CHILDREN + idx * 8)))
            })
        }
        NodeKind::Node256 => {
            let start = after.map_or(0, |a| a as usize + 1);
            (start..256).map(|u| u as u8).find_map(|unit| {
                let ptr = read_ptr(arena, node + N256_CHILDREN + unit as u64 * 8);
                (ptr != Ptr::NULL).then_some((unit, ptr))
            })
        }
    }
}

/// Every child in unit order.
pub(crate) fn children(arena: &Arena, node: u64) -> SmallVec<[(u8, Ptr); 16]> {
    let mut out = SmallVec::new();
    let mut after = None;
    while let Some((unit, ptr)) = next_child(arena, node, after) {
        out.push((unit, ptr));
        after = Some(unit);
    }
    out
}

/// Leaf with the smallest key under `ptr`.
pub(crate) fn minimum_leaf(arena: &Arena, mut ptr: Ptr) -> Option<u64> {
    loop {
        match ptr.decode() {
            Child::Null => return None,
            Child::Leaf(leaf) => return Some(leaf),
            Child::Node(node) => ptr = next_child(arena, node, None)?.1,
        }
    }
}

// =============================================================================
// Layout checks used by `verify`
// =============================================================================

/// Shape-specific inconsistencies of one node, as messages.
pub(crate) fn layout_issues(arena: &Arena, node: u64, kind: NodeKind) -> Vec<String> {
    let mut issues = Vec::new();
    match kind {
        NodeKind::Node4 => {
            let pairs = n4_pairs(arena.read_u64(node + N4_SLOTS));
            let used = n4_used(arena, node);
            if pairs[used.len()..].iter().any(|&(_, idx)| idx != -1) {
                issues.push(format!("Node4 at {node} has a used pair after an unused one"));
            }
            if used.windows(2).any(|w| w[0].0 >= w[1].0) {
                issues.push(format!("Node4 at {node} pairs are not strictly sorted: {used:?}"));
            }
            let mut seen = 0u8;
            for &(unit, idx) in &used {
                if !(0..4).contains(&idx) || seen & (1 << idx) != 0 {
                    issues.push(format!("Node4 at {node} unit {unit} has bad child index {idx}"));
                } else {
                    seen |= 1 << idx;
                }
            }
        }
        NodeKind::Node16 => {
            let bitmap = arena.read_u64(node + N16_BITMAP);
            if bitmap & !N16_FULL != 0 {
                issues.push(format!("Node16 at {node} bitmap {bitmap:#x} has stray bits"));
            }
            let mut units: SmallVec<[u8; 16]> = (0..16u64)
                .filter(|i| bitmap & (1 << i) != 0)
                .map(|i| arena.read_u8(node + N16_KEYS + i))
                .collect();
            let n = units.len();
            units.sort_unstable();
            units.dedup();
            if units.len() != n {
                issues.push(format!("Node16 at {node} has duplicate units"));
            }
        }
        NodeKind::Node48 => {
            let mut slots = 0u64;
            for g in 0..16u64 {
                let word = arena.read_u64(node + N48_GROUPS + g * 8);
                let k_bits = word & 0xFFFF;
                let p_bits = word >> 16;
                let mut expected = 0u64;
                for b in 0..16u64 {
                    if k_bits & (1 << b) != 0 {
                        let idx = arena.read_u8(node + N48_INDEX + g * 16 + b) as u64;
                        if idx >= 48 {
                            issues.push(format!("Node48 at {node} unit {} maps to slot {idx}", g * 16 + b));
                            continue;
                        }
                        expected |= 1 << idx;
                    }
                }
                if expected != p_bits {
                    issues.push(format!(
                        "Node48 at {node} group {g} slot bits {p_bits:#x} disagree with its units ({expected:#x})"
                    ));
                }
                if slots & p_bits != 0 {
                    issues.push(format!("Node48 at {node} group {g} reuses a child slot"));
                }
                slots |= p_bits;
            }
        }
        NodeKind::Node256 => {}
    }
    issues
}

// =============================================================================
// Writes
// =============================================================================

/// Allocate an empty node carrying `path`. Not persisted.
pub(crate) fn alloc_node<P: Persistence>(pool: &mut Pool<P>, kind: NodeKind, path: PathHeader) -> Result<u64> {
    let node = pool.alloc(kind.size())?;
    pool.arena.write_u8(node + KIND_OFF, kind as u8);
    pool.arena.write_u64(node + PATH_OFF, path.to_word());
    if kind == NodeKind::Node4 {
        pool.arena.write_u64(node + N4_SLOTS, N4_EMPTY_SLOTS);
    }
    Ok(node)
}

/// Where a new child went, and the word that publishes it.
struct Placement {
    /// Entry fields written in place, to persist before linking.
    entry: SmallVec<[(u64, usize); 2]>,
    link_off: u64,
    link_word: u64,
}

/// Write the entry for `unit -> child` into free space of `node` and compute
/// its linking word without storing it. `None` when the node is full.
fn place(arena: &mut Arena, node: u64, kind: NodeKind, unit: u8, child: Ptr) -> Option<Placement> {
    match kind {
        NodeKind::Node4 => {
            let word = arena.read_u64(node + N4_SLOTS);
            let taken = n4_pairs(word)
                .iter()
                .filter(|&&(_, idx)| idx != -1)
                .fold(0u8, |acc, &(_, idx)| acc | (1 << idx));
            let idx = (0..4).find(|i| taken & (1 << i) == 0)?;
            let link_word = n4_insert_pair(word, unit, idx as i8)?;
            let slot = node + N4_CHILDREN + idx as u64 * 8;
            arena.write_u64(slot, child.raw());
            Some(Placement {
                entry: smallvec::smallvec![(slot, 8)],
                link_off: node + N4_SLOTS,
                link_word,
            })
        }
        NodeKind::Node16 => {
            let bitmap = arena.read_u64(node + N16_BITMAP);
            if bitmap == N16_FULL {
                return None;
            }
            let idx = (!bitmap).trailing_zeros() as u64;
            arena.write_u8(node + N16_KEYS + idx, unit);
            arena.write_u64(node + N16_CHILDREN + idx * 8, child.raw());
            Some(Placement {
                entry: smallvec::smallvec![(node + N16_KEYS + idx, 1), (node + N16_CHILDREN + idx * 8, 8)],
                link_off: node + N16_BITMAP,
                link_word: bitmap | (1 << idx),
            })
        }
        NodeKind::Node48 => {
            let occupied = n48_occupied(arena, node);
            if occupied == N48_FULL {
                return None;
            }
            let idx = (!occupied).trailing_zeros() as u64;
            arena.write_u8(node + N48_INDEX + unit as u64, idx as u8);
            arena.write_u64(node + N48_CHILDREN + idx * 8, child.raw());
            let group = n48_group(arena, node, unit);
            Some(Placement {
                entry: smallvec::smallvec![(node + N48_INDEX + unit as u64, 1), (node + N48_CHILDREN + idx * 8, 8)],
                link_off: node + N48_GROUPS + (unit as u64 / 16) * 8,
                link_word: group | (1 << (unit % 16)) | (1 << (16 + idx)),
            })
        }
        NodeKind::Node256 => Some(Placement {
            entry: SmallVec::new(),
            link_off: node + N256_CHILDREN + unit as u64 * 8,
            link_word: child.raw(),
        }),
    }
}

/// Add a child to a node no reader can reach yet. Nothing is persisted.
pub(crate) fn add_child_unlinked(arena: &mut Arena, node: u64, unit: u8, child: Ptr) {
    let kind = node_kind(arena, node);
    match place(arena, node, kind, unit, child) {
        Some(p) => arena.write_u64(p.link_off, p.link_word),
        None => {
            error!(node, ?kind, "adding to a full unpublished node");
            panic!("corrupt tree: unpublished {kind:?} at {node} is full");
        }
    }
}

/// Add `unit -> child` to a published node, promoting it when full.
///
/// With room: the entry is persisted and fenced, then one linking word is
/// stored and persisted. When full: a node of the next shape is built with
/// every entry plus the new one, persisted and fenced, then the reference in
/// `slot` is swapped. The old node is abandoned.
pub(crate) fn add_child<P: Persistence>(
    pool: &mut Pool<P>,
    node: u64,
    slot: u64,
    unit: u8,
    child: Ptr,
) -> Result<()> {
    let kind = node_kind(&pool.arena, node);
    if let Some(p) = place(&mut pool.arena, node, kind, unit, child) {
        if !p.entry.is_empty() {
            for &(off, len) in &p.entry {
                pool.persist(off, len);
            }
            pool.fence();
        }
        pool.store_word(p.link_off, p.link_word);
        pool.fence();
        return Ok(());
    }

    let Some(to) = kind.grown() else {
        error!(node, "Node256 reported full");
        panic!("corrupt tree: Node256 at {node} has no room");
    };
    let path = read_path(&pool.arena, node);
    let grown = alloc_node(pool, to, path)?;
    for (u, ptr) in children(&pool.arena, node) {
        add_child_unlinked(&mut pool.arena, grown, u, ptr);
    }
    add_child_unlinked(&mut pool.arena, grown, unit, child);

    pool.persist(grown, to.size());
    pool.fence();
    pool.store_word(slot, Ptr::node(grown).raw());
    pool.fence();

    debug!(from = ?kind, to = ?to, old = node, new = grown, "promoted node");
    Ok(())
}
