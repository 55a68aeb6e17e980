//! # Value Type System
//!
//! The closed universe of values the engine transports and stores:
//! atoms (int, float, bool, string, none, date, timestamp, UUID), fixed and
//! variadic tuples, frozen sets, pairs, user records with per-field defaults
//! and optional discriminants, and Z-sets of values.
//!
//! Values are deeply immutable (shared via `Arc`) and structurally
//! comparable. Floats compare and hash by bit pattern, so equality is exact
//! after canonical encoding. `None` sorts before every other value of the
//! same type, matching the comparison rules of the ordered containers and
//! the SQL index columns.
//!
//! Runtime type descriptors (`DataType`) drive the canonical codec, SQL
//! column typing and the compiler's type-variable unification. Cyclic record
//! types are broken with a [`DataType::Ref`] node resolved through the
//! global schema registry.

pub mod codec;

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::zset::memory::ZSetMemory;

// ---------------------------------------------------------------------------
// Atoms
// ---------------------------------------------------------------------------

/// An indexable atom: the leaf values of the universe.
///
/// Atoms are the only values allowed as index key components and as SQL
/// index columns.
#[derive(Debug, Clone)]
pub enum Atom {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
}

impl Atom {
    fn type_rank(&self) -> u8 {
        match self {
            Atom::None => 0,
            Atom::Bool(_) => 1,
            Atom::Int(_) => 2,
            Atom::Float(_) => 3,
            Atom::Str(_) => 4,
            Atom::Date(_) => 5,
            Atom::Timestamp(_) => 6,
            Atom::Uuid(_) => 7,
        }
    }

    /// The runtime type of this atom.
    pub fn data_type(&self) -> DataType {
        match self {
            Atom::None => DataType::None,
            Atom::Bool(_) => DataType::Bool,
            Atom::Int(_) => DataType::Int,
            Atom::Float(_) => DataType::Float,
            Atom::Str(_) => DataType::Str,
            Atom::Date(_) => DataType::Date,
            Atom::Timestamp(_) => DataType::Timestamp,
            Atom::Uuid(_) => DataType::Uuid,
        }
    }
}

impl PartialEq for Atom {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Atom::None, Atom::None) => true,
            (Atom::Bool(a), Atom::Bool(b)) => a == b,
            (Atom::Int(a), Atom::Int(b)) => a == b,
            // bit-level float equality
            (Atom::Float(a), Atom::Float(b)) => a.to_bits() == b.to_bits(),
            (Atom::Str(a), Atom::Str(b)) => a == b,
            (Atom::Date(a), Atom::Date(b)) => a == b,
            (Atom::Timestamp(a), Atom::Timestamp(b)) => a == b,
            (Atom::Uuid(a), Atom::Uuid(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Atom {}

impl Ord for Atom {
    fn cmp(&self, other: &Self) -> Ordering {
        // `None` is least; mixed atom types fall back to type rank so the
        // ordering stays total.
        match (self, other) {
            (Atom::None, Atom::None) => Ordering::Equal,
            (Atom::None, _) => Ordering::Less,
            (_, Atom::None) => Ordering::Greater,
            (Atom::Bool(a), Atom::Bool(b)) => a.cmp(b),
            (Atom::Int(a), Atom::Int(b)) => a.cmp(b),
            (Atom::Float(a), Atom::Float(b)) => a.total_cmp(b),
            (Atom::Str(a), Atom::Str(b)) => a.cmp(b),
            (Atom::Date(a), Atom::Date(b)) => a.cmp(b),
            (Atom::Timestamp(a), Atom::Timestamp(b)) => a.cmp(b),
            (Atom::Uuid(a), Atom::Uuid(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for Atom {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::hash::Hash for Atom {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.type_rank().hash(state);
        match self {
            Atom::None => {}
            Atom::Bool(b) => b.hash(state),
            Atom::Int(i) => i.hash(state),
            Atom::Float(f) => f.to_bits().hash(state),
            Atom::Str(s) => s.hash(state),
            Atom::Date(d) => d.hash(state),
            Atom::Timestamp(t) => t.hash(state),
            Atom::Uuid(u) => u.hash(state),
        }
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::None => write!(f, "none"),
            Atom::Bool(b) => write!(f, "{b}"),
            Atom::Int(i) => write!(f, "{i}"),
            Atom::Float(x) => write!(f, "{x}"),
            Atom::Str(s) => write!(f, "{s}"),
            Atom::Date(d) => write!(f, "{d}"),
            Atom::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            Atom::Uuid(u) => write!(f, "{u}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// An extracted index key: a single atom or a fixed tuple of atoms.
///
/// The natural `Ord` here is all-ascending; direction-aware comparison lives
/// with the index metadata (`Index::compare_keys`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Atom(Atom),
    Composite(Arc<[Atom]>),
}

impl Key {
    /// The key's components, whether atomic or composite.
    pub fn components(&self) -> &[Atom] {
        match self {
            Key::Atom(a) => std::slice::from_ref(a),
            Key::Composite(parts) => parts,
        }
    }

    /// True iff the key is a tuple of atoms.
    pub fn is_composite(&self) -> bool {
        matches!(self, Key::Composite(_))
    }

    /// Re-wrap the key as a plain value.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Atom(a) => Value::Atom(a.clone()),
            Key::Composite(parts) => {
                Value::Tuple(parts.iter().cloned().map(Value::Atom).collect())
            }
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Atom(a) => write!(f, "{a}"),
            Key::Composite(parts) => {
                write!(f, "(")?;
                for (i, p) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, ")")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A value in the closed universe.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Atom(Atom),
    /// Fixed-arity or variadic tuple (the distinction lives in the type).
    Tuple(Arc<[Value]>),
    /// Frozen set.
    Set(Arc<BTreeSet<Value>>),
    /// Binary record with `left` and `right` fields.
    Pair(Arc<(Value, Value)>),
    /// User record: named ordered fields against a registered schema.
    Record(Arc<Record>),
    /// A Z-set of values.
    ZSet(Arc<ZSetMemory>),
    /// The missing-side marker emitted by outer joins.
    Empty,
}

impl Value {
    pub fn int(i: i64) -> Value {
        Value::Atom(Atom::Int(i))
    }

    pub fn float(f: f64) -> Value {
        Value::Atom(Atom::Float(f))
    }

    pub fn bool(b: bool) -> Value {
        Value::Atom(Atom::Bool(b))
    }

    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Atom(Atom::Str(Arc::from(s.as_ref())))
    }

    pub fn none() -> Value {
        Value::Atom(Atom::None)
    }

    pub fn pair(left: Value, right: Value) -> Value {
        Value::Pair(Arc::new((left, right)))
    }

    pub fn tuple(values: impl IntoIterator<Item = Value>) -> Value {
        Value::Tuple(values.into_iter().collect())
    }

    /// View this value as an atom, failing on composites.
    pub fn as_atom(&self) -> Result<&Atom> {
        match self {
            Value::Atom(a) => Ok(a),
            other => Err(Error::runtime(format!(
                "expected an atom, saw composite value: {other:?}"
            ))),
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Atom(Atom::Int(i)) => Ok(*i),
            other => Err(Error::runtime(format!("expected an int, saw: {other:?}"))),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Atom(Atom::Str(s)) => Ok(s),
            other => Err(Error::runtime(format!("expected a string, saw: {other:?}"))),
        }
    }

    /// Resolve one dot-separated field path against this value.
    ///
    /// Digit segments index tuples; `left`/`right` select pair sides; other
    /// segments select record fields by name. The empty path is the value
    /// itself.
    pub fn lookup_path(&self, path: &str) -> Result<Value> {
        if path.is_empty() {
            return Ok(self.clone());
        }
        let mut out = self.clone();
        for part in path.split('.') {
            out = out.lookup_segment(part)?;
        }
        Ok(out)
    }

    fn lookup_segment(&self, part: &str) -> Result<Value> {
        match self {
            Value::Tuple(items) => {
                let i: usize = part.parse().map_err(|_| {
                    Error::runtime(format!("tuple field segments must be digits, saw '{part}'"))
                })?;
                items.get(i).cloned().ok_or_else(|| {
                    Error::runtime(format!("tuple index {i} out of range ({})", items.len()))
                })
            }
            Value::Pair(p) => match part {
                "left" => Ok(p.0.clone()),
                "right" => Ok(p.1.clone()),
                _ => Err(Error::runtime(format!("pair has no field '{part}'"))),
            },
            Value::Record(r) => r.field(part),
            other => Err(Error::runtime(format!(
                "cannot look up '{part}' in non-composite value: {other:?}"
            ))),
        }
    }

    /// The runtime type of this value (best-effort for empty containers).
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Atom(a) => a.data_type(),
            Value::Tuple(items) => DataType::Tuple(items.iter().map(Value::data_type).collect()),
            Value::Set(items) => {
                let inner = items
                    .iter()
                    .next()
                    .map_or(DataType::None, Value::data_type);
                DataType::Set(Box::new(inner))
            }
            Value::Pair(p) => {
                DataType::Pair(Box::new(p.0.data_type()), Box::new(p.1.data_type()))
            }
            Value::Record(r) => DataType::Record(Arc::clone(&r.schema)),
            Value::ZSet(z) => DataType::ZSet(Box::new(z.element_type().clone())),
            Value::Empty => DataType::EmptyMarker,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Atom(a) => write!(f, "{a}"),
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
            Value::Set(items) => {
                write!(f, "{{")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "}}")
            }
            Value::Pair(p) => write!(f, "Pair({}, {})", p.0, p.1),
            Value::Record(r) => {
                write!(f, "{}(", r.schema.name)?;
                for (i, (field, v)) in r.schema.fields.iter().zip(r.values.iter()).enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={v}", field.name)?;
                }
                write!(f, ")")
            }
            Value::ZSet(z) => write!(f, "{z}"),
            Value::Empty => write!(f, "<EMPTY>"),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One field of a record schema.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldDef {
    pub name: String,
    pub ty: DataType,
    pub default: Option<Value>,
}

/// The schema of a user record: named ordered fields, optional per-field
/// defaults, and an optional string discriminant for tagged unions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordSchema {
    /// Fully-qualified name; the registry key for cyclic references.
    pub name: String,
    pub fields: Vec<FieldDef>,
    /// Index of the discriminant field, if the record participates in a
    /// tagged union.
    pub discriminant: Option<usize>,
}

impl RecordSchema {
    pub fn new(name: impl Into<String>, fields: Vec<(&str, DataType)>) -> Arc<RecordSchema> {
        let schema = Arc::new(RecordSchema {
            name: name.into(),
            fields: fields
                .into_iter()
                .map(|(n, ty)| FieldDef {
                    name: n.to_string(),
                    ty,
                    default: None,
                })
                .collect(),
            discriminant: None,
        });
        register_schema(&schema);
        schema
    }

    /// Build a schema whose `discriminant_field` tags union alternatives.
    pub fn tagged(
        name: impl Into<String>,
        fields: Vec<(&str, DataType)>,
        discriminant_field: &str,
    ) -> Result<Arc<RecordSchema>> {
        let mut schema = RecordSchema {
            name: name.into(),
            fields: fields
                .into_iter()
                .map(|(n, ty)| FieldDef {
                    name: n.to_string(),
                    ty,
                    default: None,
                })
                .collect(),
            discriminant: None,
        };
        let idx = schema
            .fields
            .iter()
            .position(|f| f.name == discriminant_field)
            .ok_or_else(|| {
                Error::runtime(format!(
                    "schema '{}' has no field '{discriminant_field}' to use as discriminant",
                    schema.name
                ))
            })?;
        schema.discriminant = Some(idx);
        let schema = Arc::new(schema);
        register_schema(&schema);
        Ok(schema)
    }

    /// Position of a field by name.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// The discriminant literal for this alternative, when tagged.
    pub fn discriminant_value<'a>(&self, record: &'a Record) -> Option<&'a Value> {
        self.discriminant.map(|i| &record.values[i])
    }
}

/// A record value: ordered field values against a schema.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Record {
    pub schema: Arc<RecordSchema>,
    pub values: Vec<Value>,
}

impl Record {
    /// Build a record from `(field, value)` pairs, filling remaining fields
    /// from schema defaults.
    pub fn new(schema: &Arc<RecordSchema>, fields: Vec<(&str, Value)>) -> Result<Value> {
        let mut values: Vec<Option<Value>> = vec![None; schema.fields.len()];
        for (name, value) in fields {
            let i = schema.field_index(name).ok_or_else(|| {
                Error::runtime(format!("record '{}' has no field '{name}'", schema.name))
            })?;
            values[i] = Some(value);
        }
        let values = values
            .into_iter()
            .zip(schema.fields.iter())
            .map(|(v, field)| {
                v.or_else(|| field.default.clone()).ok_or_else(|| {
                    Error::runtime(format!(
                        "missing field '{}' for record '{}' and no default",
                        field.name, schema.name
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Value::Record(Arc::new(Record {
            schema: Arc::clone(schema),
            values,
        })))
    }

    pub fn field(&self, name: &str) -> Result<Value> {
        let i = self.schema.field_index(name).ok_or_else(|| {
            Error::runtime(format!(
                "record '{}' has no field '{name}'",
                self.schema.name
            ))
        })?;
        Ok(self.values[i].clone())
    }
}

// ---------------------------------------------------------------------------
// Runtime types
// ---------------------------------------------------------------------------

/// Runtime type descriptor.
///
/// Vertices carry these so the invariant checker can compare edge types, the
/// codec can decode stored bytes, and the SQL store can type index columns.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataType {
    None,
    Bool,
    Int,
    Float,
    Str,
    Date,
    Timestamp,
    Uuid,
    Tuple(Vec<DataType>),
    /// Homogeneous variable-arity tuple.
    Variadic(Box<DataType>),
    Set(Box<DataType>),
    Pair(Box<DataType>, Box<DataType>),
    Record(Arc<RecordSchema>),
    /// Reference to a registered record schema by name; breaks cycles.
    Ref(String),
    /// Untagged union, disambiguated by discriminant or type shape.
    Union(Vec<DataType>),
    ZSet(Box<DataType>),
    /// Per-key collection flowing between lifted vertices.
    Grouped(Box<DataType>, Box<DataType>),
    /// The key set emitted by `get_keys`.
    Keys(Box<DataType>),
    /// The `<EMPTY>` marker's type, used in outer-join unions.
    EmptyMarker,
    /// Operator-signature type variable; must be fully ground after
    /// unification.
    Var(&'static str),
}

impl DataType {
    pub fn zset(inner: DataType) -> DataType {
        DataType::ZSet(Box::new(inner))
    }

    pub fn pair(left: DataType, right: DataType) -> DataType {
        DataType::Pair(Box::new(left), Box::new(right))
    }

    pub fn grouped(inner: DataType, key: DataType) -> DataType {
        DataType::Grouped(Box::new(inner), Box::new(key))
    }

    /// True if this type contains an unresolved type variable.
    pub fn has_var(&self) -> bool {
        match self {
            DataType::Var(_) => true,
            DataType::Tuple(items) | DataType::Union(items) => items.iter().any(DataType::has_var),
            DataType::Variadic(t) | DataType::Set(t) | DataType::ZSet(t) | DataType::Keys(t) => {
                t.has_var()
            }
            DataType::Pair(a, b) | DataType::Grouped(a, b) => a.has_var() || b.has_var(),
            _ => false,
        }
    }

    /// The additive zero of this type, used by `make_scalar` and delay
    /// initialisation.
    pub fn zero_value(&self) -> Result<Value> {
        Ok(match self {
            DataType::None => Value::none(),
            DataType::Bool => Value::bool(false),
            DataType::Int => Value::int(0),
            DataType::Float => Value::float(0.0),
            DataType::Str => Value::str(""),
            DataType::Tuple(items) => Value::Tuple(
                items
                    .iter()
                    .map(DataType::zero_value)
                    .collect::<Result<_>>()?,
            ),
            DataType::Variadic(_) => Value::Tuple(Arc::from([])),
            DataType::Set(_) => Value::Set(Arc::new(BTreeSet::new())),
            DataType::Pair(a, b) => Value::pair(a.zero_value()?, b.zero_value()?),
            DataType::Record(schema) => {
                let fields = schema
                    .fields
                    .iter()
                    .map(|f| {
                        f.default
                            .clone()
                            .map(Ok)
                            .unwrap_or_else(|| f.ty.zero_value())
                    })
                    .collect::<Result<Vec<_>>>()?;
                Value::Record(Arc::new(Record {
                    schema: Arc::clone(schema),
                    values: fields,
                }))
            }
            DataType::Ref(name) => {
                let schema = lookup_schema(name)?;
                DataType::Record(schema).zero_value()?
            }
            DataType::ZSet(inner) => {
                Value::ZSet(Arc::new(ZSetMemory::new((**inner).clone(), Vec::new())))
            }
            DataType::EmptyMarker => Value::Empty,
            other => {
                return Err(Error::runtime(format!(
                    "type has no additive zero: {other}"
                )))
            }
        })
    }

    /// Resolve one dot-separated field path to the component type.
    pub fn lookup_path(&self, path: &str) -> Result<DataType> {
        if path.is_empty() {
            return Ok(self.clone());
        }
        let mut out = self.clone();
        for part in path.split('.') {
            out = out.lookup_segment(part)?;
        }
        Ok(out)
    }

    fn lookup_segment(&self, part: &str) -> Result<DataType> {
        match self {
            DataType::Tuple(items) => {
                let i: usize = part
                    .parse()
                    .map_err(|_| Error::runtime(format!("non-digit tuple segment '{part}'")))?;
                items
                    .get(i)
                    .cloned()
                    .ok_or_else(|| Error::runtime(format!("tuple type index {i} out of range")))
            }
            DataType::Pair(a, b) => match part {
                "left" => Ok((**a).clone()),
                "right" => Ok((**b).clone()),
                _ => Err(Error::runtime(format!("pair type has no field '{part}'"))),
            },
            DataType::Record(schema) => schema
                .fields
                .iter()
                .find(|f| f.name == part)
                .map(|f| f.ty.clone())
                .ok_or_else(|| {
                    Error::runtime(format!(
                        "record type '{}' has no field '{part}'",
                        schema.name
                    ))
                }),
            DataType::Ref(name) => DataType::Record(lookup_schema(name)?).lookup_segment(part),
            other => Err(Error::runtime(format!(
                "cannot descend into '{part}' of type {other}"
            ))),
        }
    }

    /// Serialize the type to a self-describing JSON form. Record types
    /// nest their full schema once; recursive mentions serialize as
    /// `{"ref": name}` nodes.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            DataType::None => json!("none"),
            DataType::Bool => json!("bool"),
            DataType::Int => json!("int"),
            DataType::Float => json!("float"),
            DataType::Str => json!("str"),
            DataType::Date => json!("date"),
            DataType::Timestamp => json!("timestamp"),
            DataType::Uuid => json!("uuid"),
            DataType::EmptyMarker => json!("empty"),
            DataType::Tuple(items) => {
                json!({"tuple": items.iter().map(DataType::to_json).collect::<Vec<_>>()})
            }
            DataType::Variadic(t) => json!({"variadic": t.to_json()}),
            DataType::Set(t) => json!({"set": t.to_json()}),
            DataType::Pair(a, b) => json!({"pair": [a.to_json(), b.to_json()]}),
            DataType::Record(schema) => json!({
                "record": schema.name,
                "fields": schema
                    .fields
                    .iter()
                    .map(|f| json!({"name": f.name, "type": f.ty.to_json()}))
                    .collect::<Vec<_>>(),
                "discriminant": schema.discriminant,
            }),
            DataType::Ref(name) => json!({"ref": name}),
            DataType::Union(items) => {
                json!({"union": items.iter().map(DataType::to_json).collect::<Vec<_>>()})
            }
            DataType::ZSet(t) => json!({"zset": t.to_json()}),
            DataType::Grouped(t, k) => json!({"grouped": [t.to_json(), k.to_json()]}),
            DataType::Keys(t) => json!({"keys": t.to_json()}),
            DataType::Var(name) => json!({"var": name}),
        }
    }

    /// Rebuild a type from its JSON form. Record schemas are registered as
    /// they are read, so later `{"ref": name}` nodes (and cyclic mentions)
    /// resolve.
    pub fn from_json(json: &serde_json::Value) -> Result<DataType> {
        use serde_json::Value as J;
        let err = || Error::Decode(format!("malformed schema json: {json}"));

        if let J::String(atom) = json {
            return match atom.as_str() {
                "none" => Ok(DataType::None),
                "bool" => Ok(DataType::Bool),
                "int" => Ok(DataType::Int),
                "float" => Ok(DataType::Float),
                "str" => Ok(DataType::Str),
                "date" => Ok(DataType::Date),
                "timestamp" => Ok(DataType::Timestamp),
                "uuid" => Ok(DataType::Uuid),
                "empty" => Ok(DataType::EmptyMarker),
                _ => Err(err()),
            };
        }
        let J::Object(map) = json else { return Err(err()) };

        if let Some(items) = map.get("tuple").and_then(J::as_array) {
            let items = items.iter().map(DataType::from_json).collect::<Result<_>>()?;
            return Ok(DataType::Tuple(items));
        }
        if let Some(inner) = map.get("variadic") {
            return Ok(DataType::Variadic(Box::new(DataType::from_json(inner)?)));
        }
        if let Some(inner) = map.get("set") {
            return Ok(DataType::Set(Box::new(DataType::from_json(inner)?)));
        }
        if let Some(sides) = map.get("pair").and_then(J::as_array) {
            let [a, b] = sides.as_slice() else { return Err(err()) };
            return Ok(DataType::pair(DataType::from_json(a)?, DataType::from_json(b)?));
        }
        if let Some(name) = map.get("record").and_then(J::as_str) {
            let fields = map
                .get("fields")
                .and_then(J::as_array)
                .ok_or_else(err)?
                .iter()
                .map(|f| {
                    let name = f.get("name").and_then(J::as_str).ok_or_else(err)?;
                    let ty = DataType::from_json(f.get("type").ok_or_else(err)?)?;
                    Ok(FieldDef {
                        name: name.to_string(),
                        ty,
                        default: None,
                    })
                })
                .collect::<Result<_>>()?;
            let discriminant = map
                .get("discriminant")
                .and_then(J::as_u64)
                .map(|i| i as usize);
            let schema = Arc::new(RecordSchema {
                name: name.to_string(),
                fields,
                discriminant,
            });
            register_schema(&schema);
            return Ok(DataType::Record(schema));
        }
        if let Some(name) = map.get("ref").and_then(J::as_str) {
            return Ok(DataType::Ref(name.to_string()));
        }
        if let Some(items) = map.get("union").and_then(J::as_array) {
            let items = items.iter().map(DataType::from_json).collect::<Result<_>>()?;
            return Ok(DataType::Union(items));
        }
        if let Some(inner) = map.get("zset") {
            return Ok(DataType::zset(DataType::from_json(inner)?));
        }
        if let Some(sides) = map.get("grouped").and_then(J::as_array) {
            let [t, k] = sides.as_slice() else { return Err(err()) };
            return Ok(DataType::grouped(DataType::from_json(t)?, DataType::from_json(k)?));
        }
        if let Some(inner) = map.get("keys") {
            return Ok(DataType::Keys(Box::new(DataType::from_json(inner)?)));
        }
        Err(err())
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::None => write!(f, "none"),
            DataType::Bool => write!(f, "bool"),
            DataType::Int => write!(f, "int"),
            DataType::Float => write!(f, "float"),
            DataType::Str => write!(f, "str"),
            DataType::Date => write!(f, "date"),
            DataType::Timestamp => write!(f, "timestamp"),
            DataType::Uuid => write!(f, "uuid"),
            DataType::EmptyMarker => write!(f, "empty"),
            DataType::Tuple(items) => {
                write!(f, "(")?;
                for (i, t) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, ")")
            }
            DataType::Variadic(t) => write!(f, "({t}, ...)"),
            DataType::Set(t) => write!(f, "set<{t}>"),
            DataType::Pair(a, b) => write!(f, "Pair<{a}, {b}>"),
            DataType::Record(schema) => write!(f, "{}", schema.name),
            DataType::Ref(name) => write!(f, "&{name}"),
            DataType::Union(items) => {
                for (i, t) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{t}")?;
                }
                Ok(())
            }
            DataType::ZSet(t) => write!(f, "ZSet<{t}>"),
            DataType::Grouped(t, k) => write!(f, "Grouped<{t}, {k}>"),
            DataType::Keys(t) => write!(f, "keys<{t}>"),
            DataType::Var(name) => write!(f, "?{name}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Schema registry
// ---------------------------------------------------------------------------

fn registry() -> &'static RwLock<HashMap<String, Arc<RecordSchema>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, Arc<RecordSchema>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a record schema under its fully-qualified name so
/// [`DataType::Ref`] nodes can resolve it. Idempotent for identical schemas;
/// re-registration with a different shape replaces the entry.
pub fn register_schema(schema: &Arc<RecordSchema>) {
    registry()
        .write()
        .insert(schema.name.clone(), Arc::clone(schema));
}

/// Look up a registered schema by name.
pub fn lookup_schema(name: &str) -> Result<Arc<RecordSchema>> {
    registry()
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| Error::runtime(format!("no registered schema named '{name}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom_ordering_none_least() {
        let mut atoms = vec![Atom::Int(3), Atom::None, Atom::Int(-1)];
        atoms.sort();
        assert_eq!(atoms, vec![Atom::None, Atom::Int(-1), Atom::Int(3)]);
    }

    #[test]
    fn test_float_bit_equality() {
        assert_eq!(Atom::Float(1.5), Atom::Float(1.5));
        assert_ne!(Atom::Float(0.0), Atom::Float(-0.0));
        assert_eq!(Atom::Float(f64::NAN), Atom::Float(f64::NAN));
    }

    #[test]
    fn test_lookup_path() {
        let schema = RecordSchema::new(
            "tests.Animal",
            vec![("kind", DataType::Str), ("sound_id", DataType::Int)],
        );
        let v = Record::new(
            &schema,
            vec![("kind", Value::str("cat")), ("sound_id", Value::int(1))],
        )
        .expect("record");
        assert_eq!(v.lookup_path("sound_id").expect("field"), Value::int(1));

        let pair = Value::pair(v, Value::int(9));
        assert_eq!(
            pair.lookup_path("left.kind").expect("path"),
            Value::str("cat")
        );
        assert_eq!(pair.lookup_path("right").expect("path"), Value::int(9));
    }

    #[test]
    fn test_tuple_digit_path() {
        let v = Value::tuple([Value::int(1), Value::tuple([Value::str("x"), Value::int(2)])]);
        assert_eq!(v.lookup_path("1.0").expect("path"), Value::str("x"));
    }

    #[test]
    fn test_zero_values() {
        assert_eq!(DataType::Int.zero_value().expect("zero"), Value::int(0));
        let z = DataType::zset(DataType::Int).zero_value().expect("zero");
        match z {
            Value::ZSet(z) => assert!(z.is_empty()),
            other => panic!("expected zset, saw {other:?}"),
        }
    }

    #[test]
    fn test_schema_registry_roundtrip() {
        let schema = RecordSchema::new("tests.Node", vec![("id", DataType::Int)]);
        let found = lookup_schema("tests.Node").expect("registered");
        assert_eq!(found, schema);
        let ty = DataType::Ref("tests.Node".to_string());
        assert_eq!(
            ty.lookup_path("id").expect("resolves through registry"),
            DataType::Int
        );
    }

    #[test]
    fn test_schema_json_shape() {
        let schema = RecordSchema::new("tests.Edge", vec![("src", DataType::Int)]);
        let json = DataType::Record(schema).to_json();
        assert_eq!(json["record"], "tests.Edge");
        assert_eq!(json["fields"][0]["name"], "src");
    }

    #[test]
    fn test_schema_json_round_trip() {
        let schema = RecordSchema::new(
            "tests.Reading",
            vec![("id", DataType::Int), ("at", DataType::Timestamp)],
        );
        let ty = DataType::zset(DataType::pair(
            DataType::Record(schema),
            DataType::Tuple(vec![DataType::Str, DataType::Bool]),
        ));
        let back = DataType::from_json(&ty.to_json()).expect("parse");
        assert_eq!(back, ty);
    }

    #[test]
    fn test_schema_json_ref_resolves_after_record() {
        let schema = RecordSchema::new("tests.Linked", vec![("next_id", DataType::Int)]);
        // a reference node read after the record registers resolves to it
        let _ = DataType::from_json(&DataType::Record(schema).to_json()).expect("record");
        let back = DataType::from_json(&serde_json::json!({"ref": "tests.Linked"}))
            .expect("ref");
        assert_eq!(back.lookup_path("next_id").expect("field"), DataType::Int);
    }
}
