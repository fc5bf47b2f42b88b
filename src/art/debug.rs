//! Integrity checks, statistics and dumps.

use std::fmt::Write as _;

use smallvec::SmallVec;

use super::node::{
    children, layout_issues, leaf_key, leaf_value, minimum_leaf, read_path, read_ptr, Child, NodeKind, Ptr,
};
use super::Trie;
use crate::key::KeyUnits;
use crate::persist::Persistence;
use crate::pool::ROOT_SLOT;

/// Node census.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub node4_count: usize,
    pub node16_count: usize,
    pub node48_count: usize,
    pub node256_count: usize,
    pub leaf_count: usize,
    /// Inner nodes on the longest root-to-leaf path.
    pub max_height: usize,
    /// Bytes handed out by the pool allocator, header included.
    pub allocated_bytes: u64,
}

impl TreeStats {
    pub fn inner_count(&self) -> usize {
        self.node4_count + self.node16_count + self.node48_count + self.node256_count
    }
}

impl<U: KeyUnits, P: Persistence> Trie<U, P> {
    /// Verify tree integrity - returns list of issues found.
    ///
    /// Stale path headers are accepted: they are a legal post-crash state.
    pub(crate) fn verify(&self) -> Vec<String> {
        let arena = self.arena();
        let mut issues = Vec::new();

        // (pointer, units consumed before it, units fixed by the path so far)
        let mut stack: Vec<(Ptr, usize, SmallVec<[u8; 32]>)> = vec![(read_ptr(arena, ROOT_SLOT), 0, SmallVec::new())];

        while let Some((ptr, depth, prefix)) = stack.pop() {
            match ptr.decode() {
                Child::Null => {
                    if depth != 0 {
                        issues.push(format!("null child at depth {depth}"));
                    }
                }
                Child::Leaf(leaf) => {
                    let key = leaf_key(arena, leaf);
                    if U::unit_count(key) < depth {
                        issues.push(format!("leaf at {leaf} is shorter than its depth {depth}"));
                        continue;
                    }
                    if let Some(i) = (0..depth).find(|&i| U::unit(key, i) != prefix[i]) {
                        issues.push(format!(
                            "leaf at {leaf} disagrees with its path at unit {i}: {key:?}"
                        ));
                    }
                    if self.search(key) != Some(leaf_value(arena, leaf)) {
                        issues.push(format!("leaf at {leaf} is not found by its own key {key:?}"));
                    }
                }
                Child::Node(node) => {
                    let Some(kind) = NodeKind::from_tag(arena.read_u8(node)) else {
                        issues.push(format!("node at {node} has unknown kind {}", arena.read_u8(node)));
                        continue;
                    };
                    let header = read_path(arena, node);
                    if (header.depth as usize) < depth {
                        issues.push(format!(
                            "node at {node} stores depth {} but is reached at depth {depth}",
                            header.depth
                        ));
                        continue;
                    }
                    if header.end() > crate::key::MAX_KEY_UNITS {
                        issues.push(format!("node at {node} path ends past the key limit"));
                        continue;
                    }

                    let node_issues = layout_issues(arena, node, kind);
                    if !node_issues.is_empty() {
                        issues.extend(node_issues);
                        continue;
                    }

                    let kids = children(arena, node);
                    if kids.len() < 2 {
                        issues.push(format!("{kind:?} at {node} has {} children", kids.len()));
                    }
                    if kids.iter().any(|(_, p)| *p == Ptr::NULL) {
                        issues.push(format!("{kind:?} at {node} links a null child"));
                        continue;
                    }

                    // The inline partial must agree with the leaves beneath.
                    let Some(min_leaf) = minimum_leaf(arena, ptr) else {
                        issues.push(format!("{kind:?} at {node} has no descendant leaf"));
                        continue;
                    };
                    let min_key = leaf_key(arena, min_leaf);
                    if U::unit_count(min_key) <= header.end() {
                        issues.push(format!("node at {node} path runs past its minimum leaf"));
                        continue;
                    }
                    let path: SmallVec<[u8; 32]> = (depth..header.end()).map(|i| U::unit(min_key, i)).collect();
                    // A stale header keeps only the tail of the path inline.
                    let skip = header.depth as usize - depth;
                    let n = header.inline_len();
                    if header.partial[..n] != path[skip..skip + n] {
                        issues.push(format!(
                            "node at {node} inline partial {:?} disagrees with its leaves {:?}",
                            &header.partial[..n],
                            &path[skip..skip + n]
                        ));
                    }

                    let mut below = prefix.clone();
                    below.extend_from_slice(&path);
                    for (unit, child) in kids {
                        let mut p = below.clone();
                        p.push(unit);
                        stack.push((child, header.end() + 1, p));
                    }
                }
            }
        }
        issues
    }

    pub(crate) fn stats(&self) -> TreeStats {
        let arena = self.arena();
        let mut stats = TreeStats {
            allocated_bytes: self.pool.cursor(),
            ..TreeStats::default()
        };
        let mut stack = vec![(read_ptr(arena, ROOT_SLOT), 0usize)];
        while let Some((ptr, height)) = stack.pop() {
            match ptr.decode() {
                Child::Null => {}
                Child::Leaf(_) => {
                    stats.leaf_count += 1;
                    stats.max_height = stats.max_height.max(height);
                }
                Child::Node(node) => {
                    match super::node::node_kind(arena, node) {
                        NodeKind::Node4 => stats.node4_count += 1,
                        NodeKind::Node16 => stats.node16_count += 1,
                        NodeKind::Node48 => stats.node48_count += 1,
                        NodeKind::Node256 => stats.node256_count += 1,
                    }
                    stack.extend(children(arena, node).into_iter().map(|(_, p)| (p, height + 1)));
                }
            }
        }
        stats
    }

    /// Render the tree structure for debugging.
    pub(crate) fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== WOART ({} keys) ===", self.len());
        let root = read_ptr(self.arena(), ROOT_SLOT);
        if root == Ptr::NULL {
            out.push_str("(empty)\n");
        } else {
            self.dump_ptr(&mut out, root, 0);
        }
        out
    }

    fn dump_ptr(&self, out: &mut String, ptr: Ptr, indent: usize) {
        let arena = self.arena();
        let pad = "  ".repeat(indent);
        match ptr.decode() {
            Child::Null => {
                let _ = writeln!(out, "{pad}(null)");
            }
            Child::Leaf(leaf) => {
                let _ = writeln!(
                    out,
                    "{pad}Leaf {:?} -> {}",
                    String::from_utf8_lossy(leaf_key(arena, leaf)),
                    leaf_value(arena, leaf)
                );
            }
            Child::Node(node) => {
                let kind = super::node::node_kind(arena, node);
                let h = read_path(arena, node);
                let kids = children(arena, node);
                let _ = writeln!(
                    out,
                    "{pad}{kind:?} @{node} (depth={}, partial_len={}, partial={:?}, children={}/{})",
                    h.depth,
                    h.partial_len,
                    &h.partial[..h.inline_len()],
                    kids.len(),
                    kind.capacity()
                );
                for (unit, child) in kids {
                    let _ = writeln!(out, "{pad}  [{unit:#04x}] ->");
                    self.dump_ptr(out, child, indent + 2);
                }
            }
        }
    }
}
