//! Sorted Set
//!
//! An ordered view over the persistent B-tree keyed by one [`Index`].
//! Removal is a logical tombstone in a side map, so removing and later
//! re-adding a value never duplicates its B-tree entry. Matched iteration
//! scans each queried key in key-sorted order, which keeps scan output
//! deterministic and aligned with the SQL backends' ORDER BY.

use std::collections::HashSet;
use std::sync::Arc;

use crate::btree::{add, for_each_matching, Node};
use crate::error::Result;
use crate::index::Index;
use crate::value::{Key, Value};

#[derive(Debug, Clone)]
pub struct SortedSet {
    pub index: Index,
    added: HashSet<Value>,
    removed: HashSet<Value>,
    root: Arc<Node>,
}

impl SortedSet {
    pub fn new(index: Index) -> SortedSet {
        SortedSet {
            index,
            added: HashSet::new(),
            removed: HashSet::new(),
            root: Node::empty(),
        }
    }

    /// Add a value. Values already present (even behind a tombstone) are
    /// not re-inserted into the tree.
    pub fn add(&mut self, value: &Value) -> Result<()> {
        if !self.added.contains(value) {
            let key = self.index.key_of(value)?;
            self.root = add(&self.root, value.clone(), key, &self.index.ascending);
            self.added.insert(value.clone());
        }
        self.removed.remove(value);
        Ok(())
    }

    /// Tombstone a value.
    pub fn remove(&mut self, value: &Value) {
        self.removed.insert(value.clone());
    }

    fn is_live(&self, value: &Value) -> bool {
        self.added.contains(value) && !self.removed.contains(value)
    }

    /// All live values in index order.
    pub fn iter_sorted(&self) -> Vec<Value> {
        let mut out = Vec::new();
        for_each_matching(&self.root, None, &self.index.ascending, &mut |v| {
            if self.is_live(v) {
                out.push(v.clone());
            }
        });
        out
    }

    /// Live values for the given keys, keys scanned in index-sorted order.
    pub fn iter_matching(&self, match_keys: &[Key]) -> Vec<Value> {
        let mut keys: Vec<&Key> = match_keys.iter().collect();
        keys.sort_by(|a, b| self.index.compare_keys(a, b));
        keys.dedup();

        let mut out = Vec::new();
        for key in keys {
            for_each_matching(&self.root, Some(key), &self.index.ascending, &mut |v| {
                if self.is_live(v) {
                    out.push(v.clone());
                }
            });
        }
        out
    }

    pub fn len(&self) -> usize {
        self.added.len() - self.removed.iter().filter(|v| self.added.contains(*v)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Atom, DataType};

    fn int_set() -> SortedSet {
        SortedSet::new(Index::identity(DataType::Int))
    }

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().map(|i| Value::int(*i)).collect()
    }

    #[test]
    fn test_add_remove_readd() {
        let mut s = int_set();
        s.add(&Value::int(1)).expect("add");
        s.add(&Value::int(2)).expect("add");
        s.remove(&Value::int(1));
        assert_eq!(s.iter_sorted(), ints(&[2]));

        // Re-insertion after a tombstone is idempotent
        s.add(&Value::int(1)).expect("add");
        assert_eq!(s.iter_sorted(), ints(&[1, 2]));
    }

    #[test]
    fn test_iter_matching_sorts_queried_keys() {
        let mut s = int_set();
        for i in [4i64, 1, 3, 2] {
            s.add(&Value::int(i)).expect("add");
        }
        let keys = vec![
            Key::Atom(Atom::Int(3)),
            Key::Atom(Atom::Int(1)),
            Key::Atom(Atom::Int(3)),
        ];
        assert_eq!(s.iter_matching(&keys), ints(&[1, 3]));
    }

    #[test]
    fn test_empty_match_yields_nothing() {
        let mut s = int_set();
        s.add(&Value::int(1)).expect("add");
        assert!(s.iter_matching(&[]).is_empty());
    }
}
