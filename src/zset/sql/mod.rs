//! SQL-backed Z-set
//!
//! A Z-set persisted as one table per delay vertex:
//!
//! ```text
//! CREATE TABLE <table> (
//!     identity  BLOB PRIMARY KEY,   -- encoded atom, or MD5 of the encoding
//!     data      BLOB NOT NULL,      -- omitted when the element is atomic
//!     ixd__<index>__<field> <type> NOT NULL,  -- one per index component
//!     c         BIGINT NOT NULL
//! )
//! ```
//!
//! plus one secondary B-tree index per declared [`Index`] (with DESC markers
//! matching the declared directions) and a shared `last_update(table_name,
//! t)` sidecar recording the logical timestamp of the last committed change.
//!
//! Arithmetic on the handle never touches the database: `add` appends a
//! delta Z-set to an in-memory change list and `neg` flips a sign flag.
//! Reads combine on-disk rows with the consolidated changes so net-zero
//! effects are suppressed; indexed reads interleave buffered changes into
//! the index-ordered scan so output stays globally ordered by key. `flush`
//! consolidates the change list, upserts in batches of 1000 with
//! `ON CONFLICT (identity) DO UPDATE SET c = c + excluded.c`, deletes rows
//! whose count reached zero, and advances the table's frontier.
//!
//! Cross-process readers poll `last_update.t` with exponential back-off
//! ([`ZSetSql::wait_til_time`]) to establish a happens-before frontier.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PgConn;
pub use self::sqlite::SqliteConn;

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::index::Index;
use crate::value::codec::{self, Identity};
use crate::value::{Atom, DataType, Key, Value};
use crate::zset::memory::ZSetMemory;
use crate::zset::{KeyMatch, Match};

/// Rows per upsert statement.
pub const UPSERT_BATCH: usize = 1000;
/// Upper bound on any single frontier-polling sleep, in seconds.
pub const MAX_SLEEP_SECS: f64 = 5.0;

/// The two supported SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

/// A connection a [`ZSetSql`] can run statements on. Statements arrive
/// fully rendered (values inlined as literals, strings escaped), so the
/// trait stays narrow.
pub trait SqlConn: Clone {
    fn dialect(&self) -> Dialect;
    /// Run one or more statements, discarding results.
    fn execute(&self, sql: &str) -> Result<()>;
    /// Run a query returning `(bytes, count)` rows.
    fn query_rows(&self, sql: &str) -> Result<Vec<(Vec<u8>, i64)>>;
    /// Run a query returning a single optional integer.
    fn query_i64(&self, sql: &str) -> Result<Option<i64>>;
}

/// A durable Z-set handle with buffered in-memory changes.
#[derive(Clone)]
pub struct ZSetSql<C: SqlConn> {
    conn: C,
    t: DataType,
    table: String,
    indexes: Vec<Index>,
    changes: Vec<ZSetMemory>,
    negative: bool,
}

impl<C: SqlConn> ZSetSql<C> {
    pub fn new(conn: C, t: DataType, table: impl Into<String>, indexes: Vec<Index>) -> ZSetSql<C> {
        ZSetSql {
            conn,
            t,
            table: table.into(),
            indexes,
            changes: Vec::new(),
            negative: false,
        }
    }

    pub fn element_type(&self) -> &DataType {
        &self.t
    }

    pub fn indexes(&self) -> &[Index] {
        &self.indexes
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// True when the element is atomic: the identity column carries the
    /// encoded element itself and the `data` column is omitted.
    fn identity_is_data(&self) -> bool {
        matches!(
            self.t,
            DataType::None
                | DataType::Bool
                | DataType::Int
                | DataType::Float
                | DataType::Str
                | DataType::Date
                | DataType::Timestamp
                | DataType::Uuid
        )
    }

    fn data_column(&self) -> &'static str {
        if self.identity_is_data() {
            "identity"
        } else {
            "data"
        }
    }

    // --- arithmetic -------------------------------------------------------

    /// Append a delta to the change list. A negated handle folds the delta
    /// in negated, so `(-z) + d` reads as `-(z + -d)`.
    pub fn add(&self, delta: &ZSetMemory) -> ZSetSql<C> {
        let mut out = self.clone();
        if self.negative {
            out.changes.push(delta.neg());
        } else {
            out.changes.push(delta.clone());
        }
        out
    }

    pub fn neg(&self) -> ZSetSql<C> {
        let mut out = self.clone();
        out.negative = !out.negative;
        out
    }

    /// Fold the change list into a single delta.
    pub fn consolidate_changes(&self) -> Result<ZSetMemory> {
        let mut out = ZSetMemory::new(self.t.clone(), Vec::new());
        for delta in &self.changes {
            out = out.add_zset(delta)?;
        }
        Ok(out)
    }

    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(|z| !z.is_empty())
    }

    // --- schema -----------------------------------------------------------

    /// Create the data table, its secondary indexes, and the `last_update`
    /// sidecar row.
    pub fn create_data_table(&self) -> Result<()> {
        let dialect = self.conn.dialect();
        let mut columns = vec![format!(
            "identity {} PRIMARY KEY",
            dialect.blob_type_name()
        )];
        if !self.identity_is_data() {
            columns.push(format!("data {} NOT NULL", dialect.blob_type_name()));
        }
        for index in &self.indexes {
            for component in index_components(index) {
                columns.push(format!(
                    "{} {} NOT NULL",
                    component.column,
                    dialect.type_name(&component.ty)
                ));
            }
        }
        columns.push("c BIGINT NOT NULL".to_string());

        self.conn.execute(&format!(
            "CREATE TABLE {} ({})",
            self.table,
            columns.join(", ")
        ))?;

        for index in &self.indexes {
            let ordered: Vec<String> = index_components(index)
                .iter()
                .map(IndexComponent::ordered_column)
                .collect();
            self.conn.execute(&format!(
                "CREATE INDEX ix__{}__{} ON {} ({})",
                self.table,
                index.name(),
                self.table,
                ordered.join(", ")
            ))?;
        }

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS last_update (\
             table_name TEXT PRIMARY KEY, t BIGINT NOT NULL)",
        )?;
        self.conn.execute(&format!(
            "INSERT INTO last_update (table_name, t) VALUES ('{}', 0) \
             ON CONFLICT (table_name) DO NOTHING",
            self.table
        ))?;
        Ok(())
    }

    // --- reads ------------------------------------------------------------

    fn get_all(&self, m: &Match) -> Result<Vec<(Value, i64)>> {
        let data_column = self.data_column();
        let qry = match m {
            Match::All => format!("SELECT {data_column}, c FROM {}", self.table),
            Match::Values(values) => {
                if values.is_empty() {
                    return Ok(Vec::new());
                }
                let dialect = self.conn.dialect();
                let literals: Vec<String> = values
                    .iter()
                    .map(|v| dialect.blob_literal(self.identity_bytes(v).as_slice()))
                    .collect();
                format!(
                    "SELECT {data_column}, c FROM {} WHERE identity IN ({})",
                    self.table,
                    literals.join(", ")
                )
            }
        };
        let rows = self.conn.query_rows(&qry)?;
        rows.into_iter()
            .map(|(bytes, count)| Ok((codec::decode(&self.t, &bytes)?, count)))
            .collect()
    }

    fn identity_bytes(&self, value: &Value) -> Vec<u8> {
        match codec::identity(value) {
            Identity::Atom(bytes) => bytes,
            Identity::Digest(digest) => digest.to_vec(),
        }
    }

    /// On-disk rows for one index, optionally joined against a literal JSON
    /// array of key components (forcing the index scan), in index order.
    fn get_by_key(&self, index: &Index, keys: &KeyMatch) -> Result<Vec<(Key, Value, i64)>> {
        let dialect = self.conn.dialect();
        let components = index_components(index);
        let data_column = self.data_column();
        let order_by: Vec<String> = components
            .iter()
            .map(IndexComponent::ordered_column)
            .collect();

        let qry = match keys {
            KeyMatch::All => format!(
                "SELECT {data_column}, c FROM {} ORDER BY {}",
                self.table,
                order_by.join(", ")
            ),
            KeyMatch::Keys(keys) => {
                if keys.is_empty() {
                    return Ok(Vec::new());
                }
                // queried keys form a set: sorted for determinism, deduped
                // so the join cannot fan out
                let mut keys = keys.clone();
                keys.sort_by(|a, b| index.compare_keys(a, b));
                keys.dedup();
                let json = keys_to_json(dialect, &keys);
                dialect.key_join_query(
                    &self.table,
                    data_column,
                    &format!("ix__{}__{}", self.table, index.name()),
                    &components,
                    &json,
                    &order_by.join(", "),
                )
            }
        };

        let rows = self.conn.query_rows(&qry)?;
        rows.into_iter()
            .map(|(bytes, count)| {
                let value = codec::decode(&self.t, &bytes)?;
                let key = index.key_of(&value)?;
                Ok((key, value, count))
            })
            .collect()
    }

    /// Enumerate entries: on-disk rows merged with buffered counts so
    /// net-zero effects disappear, then buffered-only rows.
    pub fn iter_match(&self, m: &Match) -> Result<Vec<(Value, i64)>> {
        if let Match::Values(values) = m {
            if values.is_empty() {
                return Ok(Vec::new());
            }
        }
        let neg = if self.negative { -1 } else { 1 };
        let changes = self.consolidate_changes()?;

        let mut out = Vec::new();
        let mut seen_from_changes: HashSet<Value> = HashSet::new();
        for (value, count) in self.get_all(m)? {
            let change_count = changes.get_count(&value);
            if change_count != 0 {
                seen_from_changes.insert(value.clone());
            }
            let count = count + change_count;
            if count != 0 {
                out.push((value, count * neg));
            }
        }
        for (value, count) in changes.iter_match(m) {
            if !seen_from_changes.contains(&value) {
                out.push((value, count * neg));
            }
        }
        Ok(out)
    }

    /// Indexed enumeration in ascending composite-key order across the
    /// on-disk and buffered portions.
    pub fn iter_by_index(&self, index: &Index, keys: &KeyMatch) -> Result<Vec<(Key, Value, i64)>> {
        if !self.indexes.contains(index) {
            return Err(Error::runtime(format!("ZSet does not have index: {index}")));
        }
        if let KeyMatch::Keys(keys) = keys {
            if keys.is_empty() {
                return Ok(Vec::new());
            }
        }
        let neg = if self.negative { -1 } else { 1 };
        let disk = self.get_by_key(index, keys)?;
        let changes = self.consolidate_changes()?;
        let changes = match keys {
            KeyMatch::All => changes,
            KeyMatch::Keys(keys) => {
                let wanted: HashSet<&Key> = keys.iter().collect();
                let mut restricted = ZSetMemory::new(self.t.clone(), Vec::new());
                for (value, count) in changes.iter() {
                    if wanted.contains(&index.key_of(value)?) {
                        restricted.update(value.clone(), count)?;
                    }
                }
                restricted
            }
        };
        let merged = interleave_changes(disk, &changes, index)?;
        Ok(merged
            .into_iter()
            .map(|(k, v, c)| (k, v, c * neg))
            .collect())
    }

    pub fn to_memory(&self) -> Result<ZSetMemory> {
        ZSetMemory::from_pairs(self.t.clone(), Vec::new(), self.iter_match(&Match::All)?)
    }

    // --- writes -----------------------------------------------------------

    /// Upsert one consolidated delta: batched inserts summing counts on
    /// identity conflict, then delete rows whose count reached zero.
    pub fn upsert(&self, delta: &ZSetMemory, batch: usize) -> Result<()> {
        let dialect = self.conn.dialect();
        let mut rows = Vec::new();
        let mut identities = Vec::new();
        for (value, count) in delta.iter() {
            let mut row = Vec::new();
            let identity = dialect.blob_literal(&self.identity_bytes(value));
            row.push(identity.clone());
            identities.push(identity);
            if !self.identity_is_data() {
                row.push(dialect.blob_literal(&codec::encode(value)));
            }
            for index in &self.indexes {
                let key = index.key_of(value)?;
                for atom in key.components() {
                    row.push(dialect.atom_literal(atom));
                }
            }
            row.push(count.to_string());
            rows.push(format!("({})", row.join(", ")));
        }
        if rows.is_empty() {
            return Ok(());
        }

        debug!(table = %self.table, rows = rows.len(), "flushing zset changes");
        for (chunk, ids) in rows.chunks(batch).zip(identities.chunks(batch)) {
            self.conn.execute(&format!(
                "INSERT INTO {} VALUES {} \
                 ON CONFLICT (identity) DO UPDATE SET c = {}.c + excluded.c",
                self.table,
                chunk.join(", "),
                self.table
            ))?;
            self.conn.execute(&format!(
                "DELETE FROM {} WHERE identity IN ({}) AND c = 0",
                self.table,
                ids.join(", ")
            ))?;
        }
        Ok(())
    }

    /// Flush buffered changes and advance this table's frontier.
    pub fn flush(&mut self, batch: usize) -> Result<()> {
        let delta = self.consolidate_changes()?;
        if delta.is_empty() {
            self.changes.clear();
            return Ok(());
        }
        self.upsert(&delta, batch)?;
        self.changes.clear();
        self.advance_frontier()
    }

    // --- frontier ---------------------------------------------------------

    pub fn advance_frontier(&self) -> Result<()> {
        self.conn.execute(&format!(
            "UPDATE last_update SET t = t + 1 WHERE table_name = '{}'",
            self.table
        ))
    }

    pub fn last_update_time(&self) -> Result<i64> {
        self.conn
            .query_i64(&format!(
                "SELECT t FROM last_update WHERE table_name = '{}'",
                self.table
            ))?
            .ok_or_else(|| {
                Error::runtime(format!("no last_update row for table '{}'", self.table))
            })
    }

    /// Busy-poll the frontier until it reaches `frontier`, with exponential
    /// back-off. Individual sleeps are capped by `max_secs`; when the
    /// schedule is exhausted the caller gets a distinct timeout error.
    pub fn wait_til_time(&self, frontier: i64, max_secs: f64) -> Result<()> {
        let mut sleep_secs = 0.000_01;
        while sleep_secs <= max_secs {
            if self.last_update_time()? >= frontier {
                return Ok(());
            }
            warn!(table = %self.table, frontier, sleep_secs, "frontier not reached, backing off");
            std::thread::sleep(Duration::from_secs_f64(sleep_secs));
            sleep_secs *= 1.3;
        }
        Err(Error::FrontierTimeout {
            table: self.table.clone(),
            frontier,
        })
    }
}

impl<C: SqlConn> fmt::Debug for ZSetSql<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZSetSql")
            .field("table", &self.table)
            .field("indexes", &self.indexes.len())
            .field("changes", &self.changes.len())
            .field("negative", &self.negative)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Index columns
// ---------------------------------------------------------------------------

/// One typed SQL column per index key component.
pub struct IndexComponent {
    pub column: String,
    pub ty: DataType,
    pub ascending: bool,
}

impl IndexComponent {
    fn ordered_column(&self) -> String {
        if self.ascending {
            format!("{} ASC", self.column)
        } else {
            format!("{} DESC", self.column)
        }
    }
}

/// Column layout for one index: `ixd__<index>__<field>` per component.
pub fn index_components(index: &Index) -> Vec<IndexComponent> {
    let name = index.name();
    let types = index.component_types();
    index
        .fields
        .iter()
        .zip(types.iter())
        .zip(index.ascending.iter())
        .map(|((field, ty), ascending)| {
            let field_name = if field.is_empty() {
                "value".to_string()
            } else {
                field.replace('.', "_")
            };
            IndexComponent {
                column: format!("ixd__{name}__{field_name}"),
                ty: ty.clone(),
                ascending: *ascending,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Dialect
// ---------------------------------------------------------------------------

impl Dialect {
    pub fn type_name(self, ty: &DataType) -> &'static str {
        match (self, ty) {
            (Dialect::Sqlite, DataType::Int) => "INTEGER",
            (Dialect::Sqlite, DataType::Bool) => "INTEGER",
            (Dialect::Sqlite, DataType::Float) => "REAL",
            (Dialect::Sqlite, _) => "TEXT",
            (Dialect::Postgres, DataType::Int) => "BIGINT",
            (Dialect::Postgres, DataType::Bool) => "BOOLEAN",
            (Dialect::Postgres, DataType::Float) => "DOUBLE PRECISION",
            (Dialect::Postgres, _) => "TEXT",
        }
    }

    pub fn blob_type_name(self) -> &'static str {
        match self {
            Dialect::Sqlite => "BLOB",
            Dialect::Postgres => "BYTEA",
        }
    }

    pub fn blob_literal(self, bytes: &[u8]) -> String {
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        match self {
            Dialect::Sqlite => format!("x'{hex}'"),
            Dialect::Postgres => format!("'\\x{hex}'::bytea"),
        }
    }

    /// Render an atom as a SQL literal for an index column.
    pub fn atom_literal(self, atom: &Atom) -> String {
        match atom {
            Atom::None => "NULL".to_string(),
            Atom::Bool(b) => match self {
                Dialect::Sqlite => i64::from(*b).to_string(),
                Dialect::Postgres => {
                    if *b {
                        "TRUE".to_string()
                    } else {
                        "FALSE".to_string()
                    }
                }
            },
            Atom::Int(i) => i.to_string(),
            Atom::Float(x) => format!("{x:?}"),
            Atom::Str(s) => quote_str(s),
            Atom::Date(d) => quote_str(&d.format("%Y-%m-%d").to_string()),
            Atom::Timestamp(t) => quote_str(&t.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()),
            Atom::Uuid(u) => quote_str(&u.to_string()),
        }
    }

    /// JSON form of an atom inside the literal key array.
    fn atom_json(self, atom: &Atom) -> serde_json::Value {
        use serde_json::json;
        match atom {
            Atom::None => json!(null),
            Atom::Bool(b) => match self {
                // SQLite's ->> surfaces JSON booleans as integers, so the
                // join column must be an integer too.
                Dialect::Sqlite => json!(i64::from(*b)),
                Dialect::Postgres => json!(b),
            },
            Atom::Int(i) => json!(i),
            Atom::Float(x) => json!(x),
            Atom::Str(s) => json!(s.as_ref()),
            Atom::Date(d) => json!(d.format("%Y-%m-%d").to_string()),
            Atom::Timestamp(t) => json!(t.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()),
            Atom::Uuid(u) => json!(u.to_string()),
        }
    }

    /// The cast expression extracting component `i` of a JSON key element.
    fn json_component_cast(self, i: usize, ty: &DataType) -> String {
        match self {
            Dialect::Sqlite => {
                format!(
                    "CAST(value ->> '$[{i}]' AS {}) AS __{i}",
                    self.type_name(ty)
                )
            }
            Dialect::Postgres => {
                let pg_type = match ty {
                    DataType::Int => "bigint",
                    DataType::Bool => "boolean",
                    DataType::Float => "double precision",
                    _ => "text",
                };
                format!("(elem ->> {i})::{pg_type} AS __{i}")
            }
        }
    }

    /// The full indexed-scan query joined against a literal JSON array of
    /// key tuples. Sequential scans are suppressed so the secondary index
    /// drives row order.
    #[allow(clippy::too_many_arguments)]
    fn key_join_query(
        self,
        table: &str,
        data_column: &str,
        index_name: &str,
        components: &[IndexComponent],
        json: &str,
        order_by: &str,
    ) -> String {
        let casts: Vec<String> = components
            .iter()
            .enumerate()
            .map(|(i, c)| self.json_component_cast(i, &c.ty))
            .collect();
        let on: Vec<String> = components
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{}.{} = matched.__{i}", table, c.column))
            .collect();
        match self {
            Dialect::Sqlite => format!(
                "SELECT {data_column}, c FROM {table} INDEXED BY {index_name} \
                 JOIN (SELECT {} FROM json_each({})) AS matched ON {} \
                 ORDER BY {order_by}",
                casts.join(", "),
                quote_str(json),
                on.join(" AND "),
            ),
            Dialect::Postgres => format!(
                "SELECT {data_column}, c FROM {table} \
                 JOIN (SELECT {} FROM jsonb_array_elements({}::jsonb) AS elem) AS matched ON {} \
                 ORDER BY {order_by}",
                casts.join(", "),
                quote_str(json),
                on.join(" AND "),
            ),
        }
    }
}

fn quote_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn keys_to_json(dialect: Dialect, keys: &[Key]) -> String {
    let array: Vec<serde_json::Value> = keys
        .iter()
        .map(|key| {
            serde_json::Value::Array(
                key.components()
                    .iter()
                    .map(|a| dialect.atom_json(a))
                    .collect(),
            )
        })
        .collect();
    serde_json::Value::Array(array).to_string()
}

// ---------------------------------------------------------------------------
// Change interleaving
// ---------------------------------------------------------------------------

/// Merge index-ordered on-disk rows with buffered changes so the output is
/// globally ordered by key. A disk row whose buffered count cancels it is
/// suppressed; buffered-only rows slot into key order.
pub fn interleave_changes(
    disk: Vec<(Key, Value, i64)>,
    changes: &ZSetMemory,
    index: &Index,
) -> Result<Vec<(Key, Value, i64)>> {
    let mut change_counts: BTreeMap<Key, BTreeMap<Value, i64>> = BTreeMap::new();
    let mut change_rows: Vec<(Key, Value, i64)> = Vec::new();
    for (value, count) in changes.iter() {
        let key = index.key_of(value)?;
        change_counts
            .entry(key.clone())
            .or_default()
            .insert(value.clone(), count);
        change_rows.push((key, value.clone(), count));
    }
    change_rows.sort_by(|a, b| index.compare_keys(&a.0, &b.0));

    let mut out = Vec::new();
    let mut disk_iter = disk.into_iter().peekable();
    let mut change_iter = change_rows.into_iter().peekable();

    loop {
        let take_disk = match (disk_iter.peek(), change_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(b)) => index.compare_keys(&a.0, &b.0) != Ordering::Greater,
        };

        if take_disk {
            let (key, value, mut count) = disk_iter.next().unwrap_or_else(|| unreachable!());
            if let Some(per_key) = change_counts.get_mut(&key) {
                if let Some(change) = per_key.remove(&value) {
                    count += change;
                }
            }
            if count != 0 {
                out.push((key, value, count));
            }
        } else {
            let (key, value, count) = change_iter.next().unwrap_or_else(|| unreachable!());
            // Still present means no disk row consumed this change.
            let live = change_counts
                .get(&key)
                .is_some_and(|per_key| per_key.contains_key(&value));
            if live {
                out.push((key, value, count));
            }
        }
    }
    Ok(out)
}
