//! Persistent B-tree
//!
//! The ordered container backing in-memory Z-set indexes. Nodes are
//! immutable and shared: insertion copies the spine and reuses every
//! untouched child, so snapshots of older trees stay valid.
//!
//! Leaves hold up to 15 entries; a full node splits around the middle
//! element (index 7). Comparison is per-component with `None` least and a
//! per-component ascending flag folded into the base ordering.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::index::compare_components;
use crate::value::{Key, Value};

/// Max entries per node; a node splits when it would exceed this.
pub const MAX_KEYS: usize = 15;
/// Index of the element hoisted on split.
pub const J: usize = MAX_KEYS / 2;

/// An immutable B-tree node. Internal nodes have `keys.len() + 1` children;
/// leaves have none.
#[derive(Debug, Clone)]
pub struct Node {
    keys: Vec<(Value, Key)>,
    children: Vec<Arc<Node>>,
}

impl Node {
    pub fn empty() -> Arc<Node> {
        Arc::new(Node {
            keys: Vec::new(),
            children: Vec::new(),
        })
    }

    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

fn lt(a: &Key, b: &Key, ascending: &[bool]) -> bool {
    compare_components(a.components(), b.components(), ascending) == Ordering::Less
}

fn gt(a: &Key, b: &Key, ascending: &[bool]) -> bool {
    compare_components(a.components(), b.components(), ascending) == Ordering::Greater
}

/// Split child `i` of `node`, hoisting its middle key.
fn split(node: &Node, i: usize) -> Node {
    let child = &node.children[i];
    let (value, key) = child.keys[J].clone();

    let left = Arc::new(Node {
        keys: child.keys[..J].to_vec(),
        children: if child.is_leaf() {
            Vec::new()
        } else {
            child.children[..=J].to_vec()
        },
    });
    let right = Arc::new(Node {
        keys: child.keys[J + 1..].to_vec(),
        children: if child.is_leaf() {
            Vec::new()
        } else {
            child.children[J + 1..].to_vec()
        },
    });

    let mut keys = node.keys.clone();
    keys.insert(i, (value, key));
    let mut children = node.children.clone();
    children[i] = left;
    children.insert(i + 1, right);

    Node { keys, children }
}

/// Insert an entry, returning the new root. Existing nodes are never
/// mutated.
pub fn add(root: &Arc<Node>, value: Value, key: Key, ascending: &[bool]) -> Arc<Node> {
    let root = if root.keys.len() == MAX_KEYS {
        let grown = Node {
            keys: Vec::new(),
            children: vec![Arc::clone(root)],
        };
        Arc::new(split(&grown, 0))
    } else {
        Arc::clone(root)
    };
    insert(&root, value, key, ascending)
}

fn find_slot(node: &Node, key: &Key, ascending: &[bool]) -> usize {
    node.keys
        .iter()
        .position(|(_, k)| lt(key, k, ascending))
        .unwrap_or(node.keys.len())
}

fn insert(node: &Arc<Node>, value: Value, key: Key, ascending: &[bool]) -> Arc<Node> {
    let mut i = find_slot(node, &key, ascending);

    if node.is_leaf() {
        let mut keys = node.keys.clone();
        keys.insert(i, (value, key));
        return Arc::new(Node {
            keys,
            children: Vec::new(),
        });
    }

    let node = if node.children[i].keys.len() == MAX_KEYS {
        let split_node = Arc::new(split(node, i));
        let (_, ref hoisted) = split_node.keys[i];
        if gt(&key, hoisted, ascending) {
            i += 1;
        }
        split_node
    } else {
        Arc::clone(node)
    };

    let new_child = insert(&node.children[i], value, key, ascending);
    let mut children = node.children.clone();
    children[i] = new_child;
    Arc::new(Node {
        keys: node.keys.clone(),
        children,
    })
}

/// Visit values in key order, restricted to `match_key` when given.
/// Subtrees that cannot contain the key are pruned.
pub fn for_each_matching<'a>(
    node: &'a Node,
    match_key: Option<&Key>,
    ascending: &[bool],
    f: &mut dyn FnMut(&'a Value),
) {
    if node.keys.is_empty() {
        return;
    }

    if node.is_leaf() {
        for (value, key) in &node.keys {
            if match_key.map_or(true, |m| key == m) {
                f(value);
            }
        }
        return;
    }

    for (child, (value, key)) in node.children.iter().zip(node.keys.iter()) {
        if let Some(m) = match_key {
            if lt(key, m, ascending) {
                continue;
            }
        }

        for_each_matching(child, match_key, ascending, f);
        if match_key.map_or(true, |m| key == m) {
            f(value);
        }

        if let Some(m) = match_key {
            if gt(key, m, ascending) {
                return;
            }
        }
    }

    if let Some(last) = node.children.last() {
        for_each_matching(last, match_key, ascending, f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Atom;

    fn int_key(i: i64) -> Key {
        Key::Atom(Atom::Int(i))
    }

    fn collect_sorted(root: &Node) -> Vec<i64> {
        let mut out = Vec::new();
        for_each_matching(root, None, &[true], &mut |v| {
            out.push(v.as_int().expect("int"));
        });
        out
    }

    #[test]
    fn test_sorted_insertion() {
        let mut root = Node::empty();
        for i in [5i64, 3, 9, 1, 7, 2, 8, 4, 6, 0] {
            root = add(&root, Value::int(i), int_key(i), &[true]);
        }
        assert_eq!(collect_sorted(&root), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_splits_stay_sorted() {
        let mut root = Node::empty();
        for i in 0..500i64 {
            let v = (i * 379) % 500;
            root = add(&root, Value::int(v), int_key(v), &[true]);
        }
        assert_eq!(collect_sorted(&root), (0..500).collect::<Vec<_>>());
    }

    #[test]
    fn test_persistence_of_old_roots() {
        let mut root = Node::empty();
        for i in 0..50i64 {
            root = add(&root, Value::int(i), int_key(i), &[true]);
        }
        let snapshot = Arc::clone(&root);
        for i in 50..100i64 {
            root = add(&root, Value::int(i), int_key(i), &[true]);
        }
        assert_eq!(collect_sorted(&snapshot), (0..50).collect::<Vec<_>>());
        assert_eq!(collect_sorted(&root), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_matching_scan() {
        let mut root = Node::empty();
        for i in 0..100i64 {
            root = add(&root, Value::int(i), int_key(i % 10), &[true]);
        }
        let mut hits = Vec::new();
        for_each_matching(&root, Some(&int_key(3)), &[true], &mut |v| {
            hits.push(v.as_int().expect("int"));
        });
        assert_eq!(hits.len(), 10);
        assert!(hits.iter().all(|v| v % 10 == 3));
    }

    #[test]
    fn test_descending_order() {
        let mut root = Node::empty();
        for i in [2i64, 0, 3, 1] {
            root = add(&root, Value::int(i), int_key(i), &[false]);
        }
        let mut out = Vec::new();
        for_each_matching(&root, None, &[false], &mut |v| {
            out.push(v.as_int().expect("int"));
        });
        assert_eq!(out, vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_duplicate_keys_all_surface() {
        let mut root = Node::empty();
        for i in 0..20i64 {
            root = add(&root, Value::int(i), int_key(1), &[true]);
        }
        assert_eq!(collect_sorted(&root).len(), 20);
    }
}
