//! Canonical Value Codec
//!
//! Deterministic, schema-driven byte encoding of the value universe, plus
//! the identity function used as the SQL primary key.
//!
//! Encoding rules:
//! - atoms carry a one-byte tag and a fixed-width or length-prefixed body;
//!   timestamps are UTC microseconds, dates are days from the common era;
//! - tuples and records encode as ordered arrays (records in declared field
//!   order);
//! - frozen sets encode as arrays sorted by encoded bytes;
//! - Z-sets encode as `[encoded_value, count]` arrays sorted by encoded
//!   value;
//! - tagged unions disambiguate on the discriminant field; atoms and tuples
//!   participate by type shape (try-in-order on decode).
//!
//! Identity: atoms are their own identity (the encoded bytes, zero-digest
//! overhead); every composite is the MD5 of its canonical form. Identities
//! are stable across processes that share the schema.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::value::{lookup_schema, Atom, DataType, Record, RecordSchema, Value};
use crate::zset::memory::ZSetMemory;

const TAG_NONE: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_STR: u8 = 0x05;
const TAG_DATE: u8 = 0x06;
const TAG_TIMESTAMP: u8 = 0x07;
const TAG_UUID: u8 = 0x08;
const TAG_TUPLE: u8 = 0x10;
const TAG_SET: u8 = 0x11;
const TAG_PAIR: u8 = 0x12;
const TAG_RECORD: u8 = 0x13;
const TAG_ZSET: u8 = 0x14;
const TAG_EMPTY: u8 = 0x15;

/// The identity of a value: primary key in SQL storage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Identity {
    /// Atoms carry their encoded form directly.
    Atom(Vec<u8>),
    /// Composites are fingerprinted.
    Digest([u8; 16]),
}

impl Identity {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Identity::Atom(b) => b,
            Identity::Digest(d) => d,
        }
    }
}

/// Canonical encoding of a value.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(&mut out, value);
    out
}

/// The identity of a value: the encoded atom itself, or MD5 of the
/// canonical form for composites.
pub fn identity(value: &Value) -> Identity {
    match value {
        Value::Atom(_) => Identity::Atom(encode(value)),
        _ => Identity::Digest(md5::compute(encode(value)).0),
    }
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Atom(atom) => write_atom(out, atom),
        Value::Tuple(items) => {
            out.push(TAG_TUPLE);
            write_len(out, items.len());
            for item in items.iter() {
                write_value(out, item);
            }
        }
        Value::Set(items) => {
            out.push(TAG_SET);
            write_len(out, items.len());
            let mut encoded: Vec<Vec<u8>> = items.iter().map(encode).collect();
            encoded.sort();
            for bytes in encoded {
                out.extend_from_slice(&bytes);
            }
        }
        Value::Pair(p) => {
            out.push(TAG_PAIR);
            write_value(out, &p.0);
            write_value(out, &p.1);
        }
        Value::Record(r) => {
            out.push(TAG_RECORD);
            write_len(out, r.values.len());
            for v in &r.values {
                write_value(out, v);
            }
        }
        Value::ZSet(z) => {
            out.push(TAG_ZSET);
            let mut rows: Vec<(Vec<u8>, i64)> =
                z.iter().map(|(v, count)| (encode(v), count)).collect();
            rows.sort();
            write_len(out, rows.len());
            for (bytes, count) in rows {
                out.extend_from_slice(&bytes);
                out.extend_from_slice(&count.to_be_bytes());
            }
        }
        Value::Empty => out.push(TAG_EMPTY),
    }
}

fn write_atom(out: &mut Vec<u8>, atom: &Atom) {
    match atom {
        Atom::None => out.push(TAG_NONE),
        Atom::Bool(false) => out.push(TAG_FALSE),
        Atom::Bool(true) => out.push(TAG_TRUE),
        Atom::Int(i) => {
            out.push(TAG_INT);
            out.extend_from_slice(&i.to_be_bytes());
        }
        Atom::Float(f) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&f.to_bits().to_be_bytes());
        }
        Atom::Str(s) => {
            out.push(TAG_STR);
            write_len(out, s.len());
            out.extend_from_slice(s.as_bytes());
        }
        Atom::Date(d) => {
            out.push(TAG_DATE);
            out.extend_from_slice(&d.num_days_from_ce().to_be_bytes());
        }
        Atom::Timestamp(t) => {
            out.push(TAG_TIMESTAMP);
            out.extend_from_slice(&t.timestamp_micros().to_be_bytes());
        }
        Atom::Uuid(u) => {
            out.push(TAG_UUID);
            out.extend_from_slice(u.as_bytes());
        }
    }
}

fn write_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&u32::try_from(len).unwrap_or(u32::MAX).to_be_bytes());
}

/// Decode a canonical encoding against its declared type.
pub fn decode(ty: &DataType, bytes: &[u8]) -> Result<Value> {
    let mut reader = Reader { bytes, pos: 0 };
    let value = read_value(&mut reader, ty)?;
    if reader.pos != bytes.len() {
        return Err(Error::Decode(format!(
            "{} trailing bytes after decoding {ty}",
            bytes.len() - reader.pos
        )));
    }
    Ok(value)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(Error::Decode("truncated encoding".to_string()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn tag(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn peek_tag(&self) -> Result<u8> {
        self.bytes
            .get(self.pos)
            .copied()
            .ok_or_else(|| Error::Decode("truncated encoding".to_string()))
    }

    fn len(&mut self) -> Result<usize> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize)
    }

    fn i64(&mut self) -> Result<i64> {
        let raw = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(i64::from_be_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64> {
        let raw = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(u64::from_be_bytes(buf))
    }
}

fn read_value(r: &mut Reader<'_>, ty: &DataType) -> Result<Value> {
    match ty {
        DataType::None
        | DataType::Bool
        | DataType::Int
        | DataType::Float
        | DataType::Str
        | DataType::Date
        | DataType::Timestamp
        | DataType::Uuid => read_atom(r, ty),
        DataType::EmptyMarker => {
            expect_tag(r, TAG_EMPTY, ty)?;
            Ok(Value::Empty)
        }
        DataType::Tuple(items) => {
            expect_tag(r, TAG_TUPLE, ty)?;
            let n = r.len()?;
            if n != items.len() {
                return Err(Error::Decode(format!(
                    "tuple arity mismatch: expected {}, saw {n}",
                    items.len()
                )));
            }
            let values = items
                .iter()
                .map(|item| read_value(r, item))
                .collect::<Result<_>>()?;
            Ok(Value::Tuple(values))
        }
        DataType::Variadic(inner) => {
            expect_tag(r, TAG_TUPLE, ty)?;
            let n = r.len()?;
            let values = (0..n)
                .map(|_| read_value(r, inner))
                .collect::<Result<_>>()?;
            Ok(Value::Tuple(values))
        }
        DataType::Set(inner) => {
            expect_tag(r, TAG_SET, ty)?;
            let n = r.len()?;
            let mut values = BTreeSet::new();
            for _ in 0..n {
                values.insert(read_value(r, inner)?);
            }
            Ok(Value::Set(Arc::new(values)))
        }
        DataType::Pair(a, b) => {
            expect_tag(r, TAG_PAIR, ty)?;
            let left = read_value(r, a)?;
            let right = read_value(r, b)?;
            Ok(Value::pair(left, right))
        }
        DataType::Record(schema) => read_record(r, schema),
        DataType::Ref(name) => read_record(r, &lookup_schema(name)?),
        DataType::ZSet(inner) => {
            expect_tag(r, TAG_ZSET, ty)?;
            let n = r.len()?;
            let mut z = ZSetMemory::new((**inner).clone(), Vec::new());
            for _ in 0..n {
                let value = read_value(r, inner)?;
                let count = r.i64()?;
                z.update(value, count)?;
            }
            Ok(Value::ZSet(Arc::new(z)))
        }
        DataType::Union(alternatives) => read_union(r, alternatives),
        other => Err(Error::Decode(format!("cannot decode type {other}"))),
    }
}

fn read_atom(r: &mut Reader<'_>, ty: &DataType) -> Result<Value> {
    let tag = r.tag()?;
    let atom = match (tag, ty) {
        (TAG_NONE, DataType::None) => Atom::None,
        (TAG_FALSE, DataType::Bool) => Atom::Bool(false),
        (TAG_TRUE, DataType::Bool) => Atom::Bool(true),
        (TAG_INT, DataType::Int) => Atom::Int(r.i64()?),
        (TAG_FLOAT, DataType::Float) => Atom::Float(f64::from_bits(r.u64()?)),
        (TAG_STR, DataType::Str) => {
            let n = r.len()?;
            let raw = r.take(n)?;
            let s = std::str::from_utf8(raw)
                .map_err(|e| Error::Decode(format!("invalid utf8 in string atom: {e}")))?;
            Atom::Str(Arc::from(s))
        }
        (TAG_DATE, DataType::Date) => {
            let raw = r.take(4)?;
            let days = i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
            let date = NaiveDate::from_num_days_from_ce_opt(days)
                .ok_or_else(|| Error::Decode(format!("date out of range: {days}")))?;
            Atom::Date(date)
        }
        (TAG_TIMESTAMP, DataType::Timestamp) => {
            let micros = r.i64()?;
            let ts = DateTime::<Utc>::from_timestamp_micros(micros)
                .ok_or_else(|| Error::Decode(format!("timestamp out of range: {micros}")))?;
            Atom::Timestamp(ts)
        }
        (TAG_UUID, DataType::Uuid) => {
            let raw = r.take(16)?;
            let mut buf = [0u8; 16];
            buf.copy_from_slice(raw);
            Atom::Uuid(Uuid::from_bytes(buf))
        }
        (tag, ty) => {
            return Err(Error::Decode(format!(
                "tag 0x{tag:02x} does not decode as {ty}"
            )))
        }
    };
    Ok(Value::Atom(atom))
}

fn read_record(r: &mut Reader<'_>, schema: &Arc<RecordSchema>) -> Result<Value> {
    expect_tag(r, TAG_RECORD, &DataType::Record(Arc::clone(schema)))?;
    let n = r.len()?;
    if n != schema.fields.len() {
        return Err(Error::Decode(format!(
            "record '{}' arity mismatch: expected {}, saw {n}",
            schema.name,
            schema.fields.len()
        )));
    }
    let values = schema
        .fields
        .iter()
        .map(|f| read_value(r, &f.ty))
        .collect::<Result<Vec<_>>>()?;
    Ok(Value::Record(Arc::new(Record {
        schema: Arc::clone(schema),
        values,
    })))
}

/// Union decoding: record alternatives must declare a discriminant whose
/// default literal identifies them; atoms and tuples are disambiguated by
/// type shape, tried in declared order.
fn read_union(r: &mut Reader<'_>, alternatives: &[DataType]) -> Result<Value> {
    let tag = r.peek_tag()?;
    for alternative in alternatives {
        let resolved = match alternative {
            DataType::Ref(name) => DataType::Record(lookup_schema(name)?),
            other => other.clone(),
        };
        if let DataType::Record(schema) = &resolved {
            if tag != TAG_RECORD {
                continue;
            }
            let mut attempt = Reader {
                bytes: r.bytes,
                pos: r.pos,
            };
            if let Ok(value) = read_record(&mut attempt, schema) {
                if record_discriminant_matches(schema, &value) {
                    r.pos = attempt.pos;
                    return Ok(value);
                }
            }
            continue;
        }
        let mut attempt = Reader {
            bytes: r.bytes,
            pos: r.pos,
        };
        if let Ok(value) = read_value(&mut attempt, &resolved) {
            r.pos = attempt.pos;
            return Ok(value);
        }
    }
    Err(Error::Decode(
        "union decoding found no matching alternative".to_string(),
    ))
}

fn record_discriminant_matches(schema: &Arc<RecordSchema>, value: &Value) -> bool {
    let Value::Record(record) = value else {
        return false;
    };
    match schema.discriminant {
        // Untagged record alternatives match on shape alone.
        None => true,
        Some(i) => {
            let expected = schema.fields[i].default.as_ref();
            expected.is_none() || expected == Some(&record.values[i])
        }
    }
}

fn expect_tag(r: &mut Reader<'_>, expected: u8, ty: &DataType) -> Result<()> {
    let tag = r.tag()?;
    if tag != expected {
        return Err(Error::Decode(format!(
            "tag 0x{tag:02x} does not decode as {ty}"
        )));
    }
    Ok(())
}
