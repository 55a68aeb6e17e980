//! Z-sets and the runtime flow values
//!
//! A Z-set maps values to non-zero signed multiplicities. Two
//! representations exist behind the [`ZSet`] handle: the in-memory form
//! ([`memory::ZSetMemory`]) and the SQL-backed form ([`sql::ZSetSql`]) whose
//! arithmetic buffers deltas against a durable table.
//!
//! Between vertices, data flows as a [`Datum`]: a scalar value, a Z-set
//! handle, a per-key [`Grouped`] collection, or a key set. After the rewrite
//! pipeline runs, delay state is always a Z-set, so stores only ever
//! persist Z-sets.

pub mod memory;
pub mod sql;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{Error, Result};
use crate::index::Index;
use crate::value::{DataType, Key, Value};

use self::memory::ZSetMemory;
use self::sql::{PgConn, SqliteConn, ZSetSql};

/// Restriction of plain iteration to a finite set of values.
#[derive(Debug, Clone)]
pub enum Match {
    All,
    Values(Vec<Value>),
}

/// Restriction of indexed iteration to a finite set of keys.
#[derive(Debug, Clone)]
pub enum KeyMatch {
    All,
    Keys(Vec<Key>),
}

/// A Z-set handle: in-memory, or buffered changes over a SQL table.
#[derive(Debug, Clone)]
pub enum ZSet {
    Mem(ZSetMemory),
    Sqlite(ZSetSql<SqliteConn>),
    Postgres(ZSetSql<PgConn>),
}

impl ZSet {
    pub fn element_type(&self) -> &DataType {
        match self {
            ZSet::Mem(z) => z.element_type(),
            ZSet::Sqlite(z) => z.element_type(),
            ZSet::Postgres(z) => z.element_type(),
        }
    }

    pub fn indexes(&self) -> &[Index] {
        match self {
            ZSet::Mem(z) => z.indexes(),
            ZSet::Sqlite(z) => z.indexes(),
            ZSet::Postgres(z) => z.indexes(),
        }
    }

    /// Pointwise addition; the left operand's representation and indexes
    /// carry over. Adding to a SQL handle buffers the delta.
    pub fn add(&self, other: &ZSet) -> Result<ZSet> {
        match self {
            ZSet::Mem(z) => Ok(ZSet::Mem(z.add_zset(&other.to_memory()?)?)),
            ZSet::Sqlite(z) => Ok(ZSet::Sqlite(z.add(&other.to_memory()?))),
            ZSet::Postgres(z) => Ok(ZSet::Postgres(z.add(&other.to_memory()?))),
        }
    }

    /// Negate all multiplicities.
    pub fn neg(&self) -> ZSet {
        match self {
            ZSet::Mem(z) => ZSet::Mem(z.neg()),
            ZSet::Sqlite(z) => ZSet::Sqlite(z.neg()),
            ZSet::Postgres(z) => ZSet::Postgres(z.neg()),
        }
    }

    /// Enumerate `(value, count)` entries, optionally restricted to a
    /// finite set of values.
    pub fn iter_match(&self, m: &Match) -> Result<Vec<(Value, i64)>> {
        match self {
            ZSet::Mem(z) => Ok(z.iter_match(m)),
            ZSet::Sqlite(z) => z.iter_match(m),
            ZSet::Postgres(z) => z.iter_match(m),
        }
    }

    /// Enumerate all entries.
    pub fn entries(&self) -> Result<Vec<(Value, i64)>> {
        self.iter_match(&Match::All)
    }

    /// Enumerate `(key, value, count)` in ascending key order via a
    /// declared index. Fails if the index was not declared.
    pub fn iter_by_index(&self, index: &Index, keys: &KeyMatch) -> Result<Vec<(Key, Value, i64)>> {
        match self {
            ZSet::Mem(z) => z.iter_by_index(index, keys),
            ZSet::Sqlite(z) => z.iter_by_index(index, keys),
            ZSet::Postgres(z) => z.iter_by_index(index, keys),
        }
    }

    /// Materialise as an in-memory Z-set (no declared indexes).
    pub fn to_memory(&self) -> Result<ZSetMemory> {
        match self {
            ZSet::Mem(z) => Ok(z.clone()),
            ZSet::Sqlite(z) => z.to_memory(),
            ZSet::Postgres(z) => z.to_memory(),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        match self {
            ZSet::Mem(z) => Ok(z.is_empty()),
            _ => Ok(self.entries()?.is_empty()),
        }
    }
}

impl PartialEq for ZSet {
    fn eq(&self, other: &Self) -> bool {
        match (self.to_memory(), other.to_memory()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

/// A per-key collection of flow values, produced by `group` and consumed by
/// the lifted vertices.
#[derive(Debug, Clone, PartialEq)]
pub struct Grouped {
    data: BTreeMap<Key, Datum>,
}

impl Grouped {
    pub fn new() -> Grouped {
        Grouped {
            data: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, key: Key, value: Datum) {
        self.data.insert(key, value);
    }

    /// `None` means the key is absent: there is no zero for an arbitrary
    /// group element type.
    pub fn get(&self, key: &Key) -> Option<&Datum> {
        self.data.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Datum)> {
        self.data.iter()
    }

    pub fn keys(&self) -> BTreeSet<Key> {
        self.data.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for Grouped {
    fn default() -> Self {
        Grouped::new()
    }
}

/// A value flowing along a graph edge.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    /// A plain scalar (int, record, pair, ...).
    Value(Value),
    /// A Z-set handle.
    ZSet(ZSet),
    /// A per-key collection.
    Grouped(Grouped),
    /// A finite key set, flowing from `get_keys` to `pick_relevant`.
    Keys(BTreeSet<Key>),
}

impl Datum {
    pub fn as_zset(&self) -> Result<&ZSet> {
        match self {
            Datum::ZSet(z) => Ok(z),
            other => Err(Error::runtime(format!("expected a Z-set, saw {other}"))),
        }
    }

    pub fn as_value(&self) -> Result<&Value> {
        match self {
            Datum::Value(v) => Ok(v),
            other => Err(Error::runtime(format!("expected a scalar, saw {other}"))),
        }
    }

    pub fn as_grouped(&self) -> Result<&Grouped> {
        match self {
            Datum::Grouped(g) => Ok(g),
            other => Err(Error::runtime(format!("expected a group, saw {other}"))),
        }
    }

    pub fn as_keys(&self) -> Result<&BTreeSet<Key>> {
        match self {
            Datum::Keys(k) => Ok(k),
            other => Err(Error::runtime(format!("expected a key set, saw {other}"))),
        }
    }

    /// In-memory Z-set shorthand.
    pub fn mem(z: ZSetMemory) -> Datum {
        Datum::ZSet(ZSet::Mem(z))
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Value(v) => write!(f, "{v}"),
            Datum::ZSet(ZSet::Mem(z)) => write!(f, "{z}"),
            Datum::ZSet(_) => write!(f, "<sql zset>"),
            Datum::Grouped(g) => write!(f, "<grouped: {} keys>", g.len()),
            Datum::Keys(k) => write!(f, "<keys: {}>", k.len()),
        }
    }
}
