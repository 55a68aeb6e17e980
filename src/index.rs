//! Index Metadata
//!
//! An [`Index`] is a deterministic key-extraction function over a value type
//! plus ordering metadata: one dot-separated field-path name per key
//! component (used for display and SQL column naming), a per-component
//! ascending/descending direction, the static key type, and whether the key
//! is composite.
//!
//! Key functions are either derived from the field paths themselves
//! ([`Index::field`], [`Index::composite`], [`Index::identity`]) or supplied
//! explicitly with a display name ([`Index::atom`]) when the key is computed
//! rather than projected. Two indexes are equal iff their field names,
//! directions, source type and key type coincide; the function is derived
//! state and does not participate in identity.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::value::{Atom, DataType, Key, Value};

type KeyFn = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

/// A key extraction function `T -> K` with ordering metadata.
#[derive(Clone)]
pub struct Index {
    /// One dot-separated field path per key component; `""` means the value
    /// itself.
    pub fields: Vec<String>,
    /// Per-component scan direction.
    pub ascending: Vec<bool>,
    /// The indexed element type `T`.
    pub source: DataType,
    /// The key type `K`: an atom or a fixed tuple of atoms.
    pub key_type: DataType,
    /// True iff `K` is a tuple.
    pub composite: bool,
    f: KeyFn,
}

impl Index {
    /// The index whose key function is the identity. `t` must be an atom
    /// type.
    pub fn identity(t: DataType) -> Index {
        Index {
            fields: vec![String::new()],
            ascending: vec![true],
            source: t.clone(),
            key_type: t,
            composite: false,
            f: Arc::new(|v| Ok(v.clone())),
        }
    }

    /// Project one field path out of `source`; the key type is derived from
    /// the path.
    pub fn field(source: DataType, path: &str) -> Result<Index> {
        let key_type = source.lookup_path(path)?;
        let path_owned = path.to_string();
        Ok(Index {
            fields: vec![path.to_string()],
            ascending: vec![true],
            source,
            key_type,
            composite: false,
            f: Arc::new(move |v| v.lookup_path(&path_owned)),
        })
    }

    /// Project a tuple of field paths out of `source`.
    pub fn composite(source: DataType, paths: &[&str]) -> Result<Index> {
        let key_types = paths
            .iter()
            .map(|p| source.lookup_path(p))
            .collect::<Result<Vec<_>>>()?;
        let owned: Vec<String> = paths.iter().map(|p| (*p).to_string()).collect();
        let extract = owned.clone();
        Ok(Index {
            ascending: vec![true; paths.len()],
            fields: owned,
            source,
            key_type: DataType::Tuple(key_types),
            composite: true,
            f: Arc::new(move |v| {
                let parts = extract
                    .iter()
                    .map(|p| v.lookup_path(p))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::Tuple(parts.into()))
            }),
        })
    }

    /// A computed atomic key with an explicit display name, for keys that
    /// are not plain field projections (e.g. a string's length).
    pub fn atom(
        name: &str,
        source: DataType,
        key_type: DataType,
        f: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Index {
        Index {
            fields: vec![name.to_string()],
            ascending: vec![true],
            source,
            key_type,
            composite: false,
            f: Arc::new(move |v| Ok(f(v))),
        }
    }

    /// Flip every component's direction.
    pub fn descending(mut self) -> Index {
        for asc in &mut self.ascending {
            *asc = false;
        }
        self
    }

    /// Override per-component directions.
    pub fn with_directions(mut self, ascending: Vec<bool>) -> Result<Index> {
        if ascending.len() != self.fields.len() {
            return Err(Error::runtime(format!(
                "index has {} components but {} directions given",
                self.fields.len(),
                ascending.len()
            )));
        }
        self.ascending = ascending;
        Ok(self)
    }

    /// Display/SQL name: field paths joined, dots flattened.
    pub fn name(&self) -> String {
        let joined = self
            .fields
            .iter()
            .map(|f| if f.is_empty() { "value" } else { f })
            .collect::<Vec<_>>()
            .join("__");
        joined.replace('.', "_")
    }

    /// Extract the key for one value.
    pub fn key_of(&self, value: &Value) -> Result<Key> {
        let raw = (self.f)(value)?;
        key_from_value(&raw, self.composite)
    }

    /// The atom type of each key component, in order.
    pub fn component_types(&self) -> Vec<DataType> {
        match &self.key_type {
            DataType::Tuple(items) => items.clone(),
            other => vec![other.clone()],
        }
    }

    /// Compare two keys under this index's per-component directions.
    /// `None` is least in the underlying order; descending components invert
    /// the comparison.
    pub fn compare_keys(&self, a: &Key, b: &Key) -> Ordering {
        compare_components(a.components(), b.components(), &self.ascending)
    }
}

/// Direction-aware component comparison shared with the ordered containers.
pub fn compare_components(a: &[Atom], b: &[Atom], ascending: &[bool]) -> Ordering {
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let asc = ascending.get(i).copied().unwrap_or(true);
        let ord = x.cmp(y);
        let ord = if asc { ord } else { ord.reverse() };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// Interpret an extracted value as a key.
pub fn key_from_value(value: &Value, composite: bool) -> Result<Key> {
    if composite {
        match value {
            Value::Tuple(items) => {
                let atoms = items
                    .iter()
                    .map(|v| v.as_atom().cloned())
                    .collect::<Result<Arc<[Atom]>>>()?;
                Ok(Key::Composite(atoms))
            }
            other => Err(Error::runtime(format!(
                "composite index extracted a non-tuple key: {other:?}"
            ))),
        }
    } else {
        Ok(Key::Atom(value.as_atom()?.clone()))
    }
}

impl PartialEq for Index {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
            && self.ascending == other.ascending
            && self.source == other.source
            && self.key_type == other.key_type
    }
}

impl Eq for Index {}

impl std::hash::Hash for Index {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.fields.hash(state);
        self.ascending.hash(state);
        self.source.hash(state);
        self.key_type.hash(state);
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("fields", &self.fields)
            .field("ascending", &self.ascending)
            .field("source", &self.source)
            .field("key_type", &self.key_type)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "index on {}", self.name())
    }
}
