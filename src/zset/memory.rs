//! In-memory Z-set
//!
//! An ordered mapping from values to non-zero signed counts, plus one
//! sorted-set view per declared index. Addition folds the right operand
//! into a copy of the left and keeps every index in step: entries whose
//! count reaches zero disappear from the map and from all indexes.

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

use crate::error::{Error, Result};
use crate::index::Index;
use crate::sorted_set::SortedSet;
use crate::value::{DataType, Key, Value};
use crate::zset::{KeyMatch, Match};

#[derive(Debug, Clone)]
pub struct ZSetMemory {
    t: DataType,
    data: BTreeMap<Value, i64>,
    indexes: Vec<Index>,
    sorted: Vec<SortedSet>,
}

impl ZSetMemory {
    pub fn new(t: DataType, indexes: Vec<Index>) -> ZSetMemory {
        let sorted = indexes.iter().cloned().map(SortedSet::new).collect();
        ZSetMemory {
            t,
            data: BTreeMap::new(),
            indexes,
            sorted,
        }
    }

    /// Build from `(value, count)` pairs; counts for repeated values sum.
    pub fn from_pairs(
        t: DataType,
        indexes: Vec<Index>,
        pairs: impl IntoIterator<Item = (Value, i64)>,
    ) -> Result<ZSetMemory> {
        let mut z = ZSetMemory::new(t, indexes);
        for (value, count) in pairs {
            z.update(value, count)?;
        }
        Ok(z)
    }

    /// The singleton `{value: count}`.
    pub fn singleton(t: DataType, value: Value, count: i64) -> Result<ZSetMemory> {
        ZSetMemory::from_pairs(t, Vec::new(), [(value, count)])
    }

    pub fn element_type(&self) -> &DataType {
        &self.t
    }

    pub fn indexes(&self) -> &[Index] {
        &self.indexes
    }

    /// Re-declare the index tuple, re-indexing current entries.
    pub fn with_indexes(&self, indexes: Vec<Index>) -> Result<ZSetMemory> {
        let mut z = ZSetMemory::new(self.t.clone(), indexes);
        for (value, count) in &self.data {
            z.update(value.clone(), *count)?;
        }
        Ok(z)
    }

    pub fn get_count(&self, value: &Value) -> i64 {
        self.data.get(value).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Add `delta` to one value's count, maintaining the zero-free
    /// invariant and all indexes.
    pub fn update(&mut self, value: Value, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        match self.data.get(&value).copied() {
            Some(count) => {
                let new_count = count + delta;
                if new_count == 0 {
                    self.data.remove(&value);
                    for s in &mut self.sorted {
                        s.remove(&value);
                    }
                } else {
                    self.data.insert(value, new_count);
                }
            }
            None => {
                self.data.insert(value.clone(), delta);
                for s in &mut self.sorted {
                    s.add(&value)?;
                }
            }
        }
        Ok(())
    }

    /// Pointwise addition into a copy of `self`; the left operand's
    /// declared indexes carry over.
    pub fn add_zset(&self, other: &ZSetMemory) -> Result<ZSetMemory> {
        let mut out = self.clone();
        for (value, count) in &other.data {
            out.update(value.clone(), *count)?;
        }
        Ok(out)
    }

    /// Negate all counts.
    pub fn neg(&self) -> ZSetMemory {
        let mut out = self.clone();
        for count in out.data.values_mut() {
            *count = -*count;
        }
        out
    }

    /// Multiply all counts by `r`; `r = 0` yields the empty Z-set.
    pub fn mul(&self, r: i64) -> ZSetMemory {
        if r == 0 {
            return ZSetMemory::new(self.t.clone(), self.indexes.clone());
        }
        let mut out = self.clone();
        for count in out.data.values_mut() {
            *count *= r;
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, i64)> {
        self.data.iter().map(|(v, c)| (v, *c))
    }

    /// Enumerate entries, restricted to a finite value set when given.
    pub fn iter_match(&self, m: &Match) -> Vec<(Value, i64)> {
        match m {
            Match::All => self.data.iter().map(|(v, c)| (v.clone(), *c)).collect(),
            Match::Values(values) => values
                .iter()
                .filter_map(|v| self.data.get(v).map(|c| (v.clone(), *c)))
                .collect(),
        }
    }

    /// Scan a declared index in ascending key order. An empty key match
    /// yields nothing; a finite key match scans keys in sorted order.
    pub fn iter_by_index(&self, index: &Index, keys: &KeyMatch) -> Result<Vec<(Key, Value, i64)>> {
        let position = self
            .indexes
            .iter()
            .position(|i| i == index)
            .ok_or_else(|| Error::runtime(format!("ZSet does not have index: {index}")))?;
        let sorted = &self.sorted[position];

        let values = match keys {
            KeyMatch::All => sorted.iter_sorted(),
            KeyMatch::Keys(keys) => sorted.iter_matching(keys),
        };
        values
            .into_iter()
            .map(|v| {
                let key = index.key_of(&v)?;
                let count = self.get_count(&v);
                Ok((key, v, count))
            })
            .collect()
    }
}

// Identity is the entry map alone: two Z-sets with the same entries are
// equal regardless of declared indexes.
impl PartialEq for ZSetMemory {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for ZSetMemory {}

impl PartialOrd for ZSetMemory {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ZSetMemory {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.data.cmp(&other.data)
    }
}

impl std::hash::Hash for ZSetMemory {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        for (value, count) in &self.data {
            value.hash(state);
            count.hash(state);
        }
    }
}

impl fmt::Display for ZSetMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut header = String::from("<ZSet");
        for index in &self.indexes {
            let _ = write!(header, " {index}");
        }
        header.push('>');
        writeln!(f, "{header}")?;
        writeln!(f, "  count | value")?;
        for (value, count) in &self.data {
            writeln!(f, "  {count:>5} | {value}")?;
        }
        Ok(())
    }
}
