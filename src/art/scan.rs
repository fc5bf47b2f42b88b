//! Ordered range scan.
//!
//! The scan first descends toward `min_key`, recording one frame per inner node
//! it passes through. A frame remembers the unit it descended by, so only
//! strictly greater children remain to be visited there. The walk then pops
//! frames deepest-first and visits the remaining children in unit order,
//! descending min-first into every subtree, until `count` entries are emitted.

use smallvec::SmallVec;

use super::node::{find_child, leaf_key, leaf_value, next_child, read_ptr, Child};
use super::{path_state, PathState, Trie};
use crate::key::KeyUnits;
use crate::persist::Persistence;
use crate::pool::ROOT_SLOT;

#[derive(Clone, Copy, Debug)]
struct Frame {
    node: u64,
    /// Largest unit already handled in this node.
    after: Option<u8>,
}

impl<U: KeyUnits, P: Persistence> Trie<U, P> {
    /// Visit up to `count` entries with keys `>= min_key` in ascending order.
    pub(crate) fn scan_with(&self, min_key: &[u8], count: usize, mut visit: impl FnMut(&[u8], u64)) {
        if count == 0 {
            return;
        }
        let arena = self.arena();
        let units = U::unit_count(min_key);
        let mut stack: SmallVec<[Frame; 32]> = SmallVec::new();
        let mut emitted = 0usize;

        // Descend toward `min_key`.
        let mut ptr = read_ptr(arena, ROOT_SLOT);
        let mut depth = 0usize;
        'descend: loop {
            match ptr.decode() {
                Child::Null => break,
                Child::Leaf(leaf) => {
                    let key = leaf_key(arena, leaf);
                    if key >= min_key {
                        visit(key, leaf_value(arena, leaf));
                        emitted += 1;
                    }
                    break;
                }
                Child::Node(node) => {
                    let whole = Frame { node, after: None };
                    let end = match path_state(arena, node, depth) {
                        PathState::Current(h) | PathState::Stale(h) => h.end(),
                    };
                    let path = self.path_units(node, depth);
                    for (i, &unit) in (depth..end).zip(path.iter()) {
                        if i >= units {
                            // `min_key` is a prefix of everything below.
                            stack.push(whole);
                            break 'descend;
                        }
                        let probe = U::unit(min_key, i);
                        if unit > probe {
                            stack.push(whole);
                            break 'descend;
                        }
                        if unit < probe {
                            break 'descend;
                        }
                    }
                    depth = end;
                    if depth >= units {
                        stack.push(whole);
                        break;
                    }

                    let unit = U::unit(min_key, depth);
                    stack.push(Frame { node, after: Some(unit) });
                    match find_child(arena, node, unit) {
                        Some(slot) => {
                            ptr = read_ptr(arena, slot);
                            depth += 1;
                        }
                        None => break,
                    }
                }
            }
        }

        // In-order successor walk.
        while emitted < count {
            let Some(&Frame { node, after }) = stack.last() else {
                break;
            };
            let Some((unit, child)) = next_child(arena, node, after) else {
                stack.pop();
                continue;
            };
            let top = stack.len() - 1;
            stack[top].after = Some(unit);
            match child.decode() {
                Child::Leaf(leaf) => {
                    visit(leaf_key(arena, leaf), leaf_value(arena, leaf));
                    emitted += 1;
                }
                Child::Node(node) => stack.push(Frame { node, after: None }),
                Child::Null => {}
            }
        }
    }

    pub(crate) fn scan(&self, min_key: &[u8], count: usize) -> Vec<u64> {
        let mut out = Vec::with_capacity(count.min(1024));
        self.scan_with(min_key, count, |_, v| out.push(v));
        out
    }

    #[cfg(test)]
    pub(crate) fn scan_entries(&self, min_key: &[u8], count: usize) -> Vec<(Vec<u8>, u64)> {
        let mut out = Vec::with_capacity(count.min(1024));
        self.scan_with(min_key, count, |k, v| out.push((k.to_vec(), v)));
        out
    }
}
