//! Linear operator evaluation
//!
//! The runtime closures bound into unary/binary vertices for the linear
//! fragment of the operator library: elementwise maps and filters, Z-set
//! and scalar arithmetic, the `haitch` sign-change indicator, indexed
//! equi-join, and `first_n`.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::index::Index;
use crate::ir::{BinaryFn, UnaryFn};
use crate::value::{Atom, DataType, Key, Value};
use crate::zset::memory::ZSetMemory;
use crate::zset::{Datum, KeyMatch, Match, ZSet};

use std::rc::Rc;

pub type MapFn = Rc<dyn Fn(&Value) -> Result<Value>>;
pub type MapManyFn = Rc<dyn Fn(&Value) -> Result<Vec<Value>>>;
pub type PredFn = Rc<dyn Fn(&Value) -> Result<bool>>;

/// `map(z, f)`: elementwise, counts preserved.
pub fn map(out: DataType, f: MapFn) -> UnaryFn {
    Rc::new(move |datum| {
        let z = datum.as_zset()?;
        let mut result = ZSetMemory::new(out.clone(), Vec::new());
        for (value, count) in z.entries()? {
            result.update(f(&value)?, count)?;
        }
        Ok(Datum::mem(result))
    })
}

/// `map_many(z, f)`: each produced element inherits its origin's count.
pub fn map_many(out: DataType, f: MapManyFn) -> UnaryFn {
    Rc::new(move |datum| {
        let z = datum.as_zset()?;
        let mut result = ZSetMemory::new(out.clone(), Vec::new());
        for (value, count) in z.entries()? {
            for produced in f(&value)? {
                result.update(produced, count)?;
            }
        }
        Ok(Datum::mem(result))
    })
}

/// `filter(z, p)`: drop entries failing the predicate.
pub fn filter(f: PredFn) -> UnaryFn {
    Rc::new(move |datum| {
        let z = datum.as_zset()?;
        let mut result = ZSetMemory::new(z.element_type().clone(), Vec::new());
        for (value, count) in z.entries()? {
            if f(&value)? {
                result.update(value, count)?;
            }
        }
        Ok(Datum::mem(result))
    })
}

/// `neg`: Z-set or numeric scalar negation.
pub fn neg() -> UnaryFn {
    Rc::new(|datum| match datum {
        Datum::ZSet(z) => Ok(Datum::ZSet(z.neg())),
        Datum::Value(v) => Ok(Datum::Value(value_neg(v)?)),
        other => Err(Error::runtime(format!("cannot negate {other}"))),
    })
}

/// `add`: Z-set or numeric scalar addition.
pub fn add() -> BinaryFn {
    Rc::new(|a, b| match (a, b) {
        (Datum::ZSet(a), Datum::ZSet(b)) => Ok(Datum::ZSet(a.add(b)?)),
        (Datum::Value(a), Datum::Value(b)) => Ok(Datum::Value(value_add(a, b)?)),
        (a, b) => Err(Error::runtime(format!("cannot add {a} and {b}"))),
    })
}

/// `make_set(v)`: the singleton `{v: 1}`.
pub fn make_set(t: DataType) -> UnaryFn {
    Rc::new(move |datum| {
        let value = datum.as_value()?;
        Ok(Datum::mem(ZSetMemory::singleton(
            t.clone(),
            value.clone(),
            1,
        )?))
    })
}

/// `make_scalar(z)`: the partial inverse of `make_set`; the zero of the
/// element type for the empty Z-set.
pub fn make_scalar(zero: Value) -> UnaryFn {
    Rc::new(move |datum| {
        let z = datum.as_zset()?;
        let entries = z.entries()?;
        match entries.as_slice() {
            [] => Ok(Datum::Value(zero.clone())),
            [(value, 1)] => Ok(Datum::Value(value.clone())),
            _ => Err(Error::runtime(
                "can only make scalars from ZSets of length 1, count 1",
            )),
        }
    })
}

/// `reduce(z, zero, pick)`: the scalar `sum(pick(v) * count) + zero`.
pub fn reduce(zero: Value, pick: MapFn) -> UnaryFn {
    Rc::new(move |datum| {
        let z = datum.as_zset()?;
        let mut total = zero.clone();
        for (value, count) in z.entries()? {
            total = value_add(&total, &value_mul_count(&pick(&value)?, count)?)?;
        }
        Ok(Datum::Value(total))
    })
}

/// Pin a Z-set to the in-memory representation.
pub fn ensure_memory() -> UnaryFn {
    Rc::new(|datum| {
        let z = datum.as_zset()?;
        Ok(Datum::mem(z.to_memory()?))
    })
}

fn sign_change(from: i64, delta: i64) -> i64 {
    if from <= 0 && from + delta > 0 {
        1
    } else if from > 0 && from + delta <= 0 {
        -1
    } else {
        0
    }
}

/// `haitch(a, b)`: the sign-change indicator over values appearing in `b`
/// (the per-step delta), reading prior counts from `a` (the integral).
pub fn haitch() -> BinaryFn {
    Rc::new(|a, b| {
        let l = a.as_zset()?;
        let r = b.as_zset()?;

        let mut changes: Vec<Value> = Vec::new();
        let mut to_counts: BTreeMap<Value, i64> = BTreeMap::new();
        for (value, count) in r.entries()? {
            changes.push(value.clone());
            to_counts.insert(value, count);
        }

        // `l` is assumed the larger side; only changed values are read.
        let mut from_counts: BTreeMap<Value, i64> = BTreeMap::new();
        for (value, count) in l.iter_match(&Match::Values(changes.clone()))? {
            from_counts.insert(value, count);
        }

        let mut out = ZSetMemory::new(r.element_type().clone(), Vec::new());
        for value in changes {
            let from = from_counts.get(&value).copied().unwrap_or(0);
            let delta = to_counts.get(&value).copied().unwrap_or(0);
            let indicator = sign_change(from, delta);
            if indicator != 0 {
                out.update(value, indicator)?;
            }
        }
        Ok(Datum::mem(out))
    })
}

/// `join(l, r, on_left, on_right)`: indexed equi-join with product counts.
pub fn join(on_left: Index, on_right: Index, out: DataType) -> BinaryFn {
    Rc::new(move |a, b| {
        let l = a.as_zset()?;
        let r = b.as_zset()?;
        let rows = join_rows(l, r, &on_left, &on_right)?;
        let mut result = ZSetMemory::new(out.clone(), Vec::new());
        for ((left, right), count) in rows {
            result.update(Value::pair(left, right), count)?;
        }
        Ok(Datum::mem(result))
    })
}

/// Joined `(left, right)` rows with product counts. When only the right
/// operand carries the matching index, operands swap and outputs remap.
fn join_rows(
    l: &ZSet,
    r: &ZSet,
    on_left: &Index,
    on_right: &Index,
) -> Result<Vec<((Value, Value), i64)>> {
    if r.indexes().contains(on_right) && !l.indexes().contains(on_left) {
        let swapped = join_rows(r, l, on_right, on_left)?;
        return Ok(swapped
            .into_iter()
            .map(|((a, b), count)| ((b, a), count))
            .collect());
    }

    let mut by_key: BTreeMap<Key, Vec<(Value, i64)>> = BTreeMap::new();
    if l.indexes().contains(on_left) {
        let keys = r
            .entries()?
            .iter()
            .map(|(value, _)| on_right.key_of(value))
            .collect::<Result<Vec<_>>>()?;
        for (key, value, count) in l.iter_by_index(on_left, &KeyMatch::Keys(keys))? {
            by_key.entry(key).or_default().push((value, count));
        }
    } else {
        for (value, count) in l.entries()? {
            by_key
                .entry(on_left.key_of(&value)?)
                .or_default()
                .push((value, count));
        }
    }

    let mut out = Vec::new();
    for (right, right_count) in r.entries()? {
        let key = on_right.key_of(&right)?;
        if let Some(lefts) = by_key.get(&key) {
            for (left, left_count) in lefts {
                let count = left_count * right_count;
                if count != 0 {
                    out.push(((left.clone(), right.clone()), count));
                }
            }
        }
    }
    Ok(out)
}

/// `first_n(z, index, n)`: the first `n` elements (counting multiplicity)
/// in index order. Requires an integrated (all-positive) input.
pub fn first_n(index: Index, n: usize) -> UnaryFn {
    let n = n as i64;
    Rc::new(move |datum| {
        let z = datum.as_zset()?;
        let mut result = ZSetMemory::new(z.element_type().clone(), vec![index.clone()]);
        let mut total = 0i64;
        for (_, value, mut count) in z.iter_by_index(&index, &KeyMatch::All)? {
            if count <= 0 {
                return Err(Error::runtime(
                    "first_n requires positive counts; integrate before taking",
                ));
            }
            total += count;
            if total > n {
                count -= total - n;
            }
            if count > 0 {
                result.update(value, count)?;
            }
            if total >= n {
                break;
            }
        }
        Ok(Datum::mem(result))
    })
}

// --- scalar arithmetic -----------------------------------------------------

pub fn value_add(a: &Value, b: &Value) -> Result<Value> {
    match (a, b) {
        (Value::Atom(Atom::Int(x)), Value::Atom(Atom::Int(y))) => Ok(Value::int(x + y)),
        (Value::Atom(Atom::Float(x)), Value::Atom(Atom::Float(y))) => Ok(Value::float(x + y)),
        (a, b) => Err(Error::runtime(format!("cannot add scalars {a} and {b}"))),
    }
}

pub fn value_neg(v: &Value) -> Result<Value> {
    match v {
        Value::Atom(Atom::Int(x)) => Ok(Value::int(-x)),
        Value::Atom(Atom::Float(x)) => Ok(Value::float(-x)),
        other => Err(Error::runtime(format!("cannot negate scalar {other}"))),
    }
}

pub fn value_mul_count(v: &Value, count: i64) -> Result<Value> {
    match v {
        Value::Atom(Atom::Int(x)) => Ok(Value::int(x * count)),
        #[allow(clippy::cast_precision_loss)]
        Value::Atom(Atom::Float(x)) => Ok(Value::float(x * count as f64)),
        other => Err(Error::runtime(format!("cannot scale scalar {other}"))),
    }
}
