//! Grouping operator evaluation
//!
//! `group`/`flatten` partition a Z-set by key and re-emit `(value, key)`
//! pairs; the remaining four kinds exist for the grouped-delay expansion:
//! `make_indexed_pairs` and `make_grouped` convert between a grouped
//! collection and its indexed pair form, `get_keys` snapshots the keys
//! touched this step, and `pick_relevant` selects only those keys from the
//! durable buffer.

use std::rc::Rc;

use crate::error::Result;
use crate::index::Index;
use crate::ir::{BinaryFn, UnaryFn};
use crate::value::{DataType, Value};
use crate::zset::memory::ZSetMemory;
use crate::zset::{Datum, Grouped, KeyMatch};

/// `group(z, by)`: partition into per-key Z-sets.
pub fn group(by: Index, element: DataType) -> UnaryFn {
    Rc::new(move |datum| {
        let z = datum.as_zset()?;
        let mut out = Grouped::new();
        for (value, count) in z.entries()? {
            let key = by.key_of(&value)?;
            let member = match out.get(&key) {
                Some(existing) => {
                    let existing = existing.as_zset()?.to_memory()?;
                    let mut merged = existing;
                    merged.update(value, count)?;
                    merged
                }
                None => ZSetMemory::singleton(element.clone(), value, count)?,
            };
            out.set(key, Datum::mem(member));
        }
        Ok(Datum::Grouped(out))
    })
}

/// `flatten(g)`: re-emit every group as `(value, key)` pairs.
pub fn flatten(out_elem: DataType) -> UnaryFn {
    Rc::new(move |datum| {
        let grouped = datum.as_grouped()?;
        let mut out = ZSetMemory::new(out_elem.clone(), Vec::new());
        for (key, member) in grouped.iter() {
            match member {
                Datum::ZSet(z) => {
                    for (value, count) in z.entries()? {
                        out.update(Value::pair(value, key.to_value()), count)?;
                    }
                }
                Datum::Value(v) => {
                    // groups of scalars (a lifted reduce) flatten to
                    // singleton pairs
                    out.update(Value::pair(v.clone(), key.to_value()), 1)?;
                }
                other => {
                    return Err(crate::error::Error::runtime(format!(
                        "cannot flatten group member {other}"
                    )))
                }
            }
        }
        Ok(Datum::mem(out))
    })
}

/// `make_indexed_pairs(g, index)`: the indexed pair form of a grouped
/// collection, feeding the durable per-key delay buffer.
pub fn make_indexed_pairs(index: Index, out_elem: DataType) -> UnaryFn {
    Rc::new(move |datum| {
        let grouped = datum.as_grouped()?;
        let mut out = ZSetMemory::new(out_elem.clone(), vec![index.clone()]);
        for (key, member) in grouped.iter() {
            let z = member.as_zset()?;
            for (value, count) in z.entries()? {
                out.update(Value::pair(value, key.to_value()), count)?;
            }
        }
        Ok(Datum::mem(out))
    })
}

/// `make_grouped(z, index)`: rebuild the grouped collection from indexed
/// pairs.
pub fn make_grouped(index: Index, element: DataType) -> UnaryFn {
    Rc::new(move |datum| {
        let z = datum.as_zset()?;
        let mut out = Grouped::new();
        for (key, value, count) in z.iter_by_index(&index, &KeyMatch::All)? {
            let left = value.lookup_path("left")?;
            let member = match out.get(&key) {
                Some(existing) => {
                    let mut merged = existing.as_zset()?.to_memory()?;
                    merged.update(left, count)?;
                    merged
                }
                None => ZSetMemory::singleton(element.clone(), left, count)?,
            };
            out.set(key, Datum::mem(member));
        }
        Ok(Datum::Grouped(out))
    })
}

/// `get_keys(g)`: the keys present this step.
pub fn get_keys() -> UnaryFn {
    Rc::new(|datum| {
        let grouped = datum.as_grouped()?;
        Ok(Datum::Keys(grouped.keys()))
    })
}

/// `pick_relevant(keys, z, index)`: restrict the durable buffer to the
/// touched keys, preserving the declared index.
pub fn pick_relevant(index: Index, out_elem: DataType) -> BinaryFn {
    Rc::new(move |keys_datum, z_datum| {
        let keys = keys_datum.as_keys()?;
        let z = z_datum.as_zset()?;
        let mut out = ZSetMemory::new(out_elem.clone(), vec![index.clone()]);
        let key_list: Vec<_> = keys.iter().cloned().collect();
        for (_, value, count) in z.iter_by_index(&index, &KeyMatch::Keys(key_list))? {
            out.update(value, count)?;
        }
        Ok(Datum::mem(out))
    })
}
