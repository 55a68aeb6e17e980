//! Delay-State Stores
//!
//! A store holds two cells per delay vertex: `current` (the value most
//! recently committed) and `pending` (written during the step). The
//! lifecycle is fixed: created from a graph (one empty Z-set per delay
//! vertex, carrying the vertex's declared indexes), mutated only through
//! [`Store::set`], promoted to `current` only in [`Store::inc`].
//!
//! [`StoreMemory`] keeps plain in-memory Z-sets. The SQL stores allocate
//! one table per delay vertex (named from the vertex path), route `set`
//! through buffered handles, and on `inc` flush every dirty cell (batched
//! upserts plus delete-on-zero), advance each table's `last_update`
//! frontier, and commit the transaction. No output is user-visible before
//! `inc` completes.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::ir::{Graph, Path};
use crate::value::DataType;
use crate::zset::memory::ZSetMemory;
use crate::zset::sql::{PgConn, SqlConn, SqliteConn, ZSetSql, UPSERT_BATCH};
use crate::zset::{Datum, ZSet};

/// The store interface consumed by the scheduler.
pub trait Store {
    /// The current value of a delay cell (the declared zero if never
    /// committed).
    fn get(&self, path: &Path) -> Result<Datum>;
    /// Stage a value for the next commit.
    fn set(&mut self, path: &Path, value: Datum) -> Result<()>;
    /// Promote every pending cell to current.
    fn inc(&mut self) -> Result<()>;
}

fn delay_element(path: &Path, t: &DataType) -> Result<DataType> {
    match t {
        DataType::ZSet(inner) => Ok((**inner).clone()),
        other => Err(Error::runtime(format!(
            "delay state at {path} is not a Z-set after rewriting: {other}"
        ))),
    }
}

fn expect_zset(path: &Path, value: Datum) -> Result<ZSet> {
    match value {
        Datum::ZSet(z) => Ok(z),
        other => Err(Error::runtime(format!(
            "store cells only hold Z-sets; {path} was set to {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local store of in-memory Z-sets.
#[derive(Debug, Default)]
pub struct StoreMemory {
    current: BTreeMap<Path, ZSetMemory>,
    pending: Vec<(Path, ZSetMemory)>,
}

impl StoreMemory {
    /// Allocate one empty, indexed Z-set per delay vertex (including those
    /// inside recursive sub-graphs).
    pub fn from_graph(graph: &Graph) -> Result<StoreMemory> {
        let mut current = BTreeMap::new();
        for (path, t, indexes) in graph.delay_vertices() {
            let element = delay_element(&path, &t)?;
            current.insert(path, ZSetMemory::new(element, indexes));
        }
        Ok(StoreMemory {
            current,
            pending: Vec::new(),
        })
    }
}

impl Store for StoreMemory {
    fn get(&self, path: &Path) -> Result<Datum> {
        self.current
            .get(path)
            .map(|z| Datum::mem(z.clone()))
            .ok_or_else(|| Error::runtime(format!("there is nowhere to put data for key: {path}")))
    }

    fn set(&mut self, path: &Path, value: Datum) -> Result<()> {
        if !self.current.contains_key(path) {
            return Err(Error::runtime(format!(
                "there is nowhere to put data for key: {path}"
            )));
        }
        let z = expect_zset(path, value)?.to_memory()?;
        // keep the declared indexes of the cell
        let declared = self.current[path].indexes().to_vec();
        self.pending.push((path.clone(), z.with_indexes(declared)?));
        Ok(())
    }

    fn inc(&mut self) -> Result<()> {
        for (path, z) in self.pending.drain(..) {
            self.current.insert(path, z);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SQL stores
// ---------------------------------------------------------------------------

/// Wraps a backend-specific handle into the shared [`ZSet`] enum.
pub trait SqlCell: SqlConn + Sized {
    fn wrap(handle: ZSetSql<Self>) -> ZSet;
    fn unwrap(z: ZSet) -> Option<ZSetSql<Self>>;
}

impl SqlCell for SqliteConn {
    fn wrap(handle: ZSetSql<Self>) -> ZSet {
        ZSet::Sqlite(handle)
    }
    fn unwrap(z: ZSet) -> Option<ZSetSql<Self>> {
        match z {
            ZSet::Sqlite(handle) => Some(handle),
            _ => None,
        }
    }
}

impl SqlCell for PgConn {
    fn wrap(handle: ZSetSql<Self>) -> ZSet {
        ZSet::Postgres(handle)
    }
    fn unwrap(z: ZSet) -> Option<ZSetSql<Self>> {
        match z {
            ZSet::Postgres(handle) => Some(handle),
            _ => None,
        }
    }
}

/// SQL-backed store: one table per delay vertex.
pub struct StoreSql<C: SqlCell> {
    conn: C,
    current: BTreeMap<Path, ZSetSql<C>>,
    pending: Vec<(Path, ZSetSql<C>)>,
    batch: usize,
}

/// SQLite-backed store.
pub type StoreSqlite = StoreSql<SqliteConn>;
/// PostgreSQL-backed store.
pub type StorePostgres = StoreSql<PgConn>;

impl<C: SqlCell> StoreSql<C> {
    /// Allocate one handle (and, when `create_tables`, one table) per
    /// delay vertex.
    pub fn from_graph(
        conn: C,
        graph: &Graph,
        table_prefix: &str,
        create_tables: bool,
    ) -> Result<StoreSql<C>> {
        let mut current = BTreeMap::new();
        for (path, t, indexes) in graph.delay_vertices() {
            let element = delay_element(&path, &t)?;
            let table = format!("{table_prefix}__{}", path.table_name());
            let handle = ZSetSql::new(conn.clone(), element, table, indexes);
            if create_tables {
                handle.create_data_table()?;
            }
            current.insert(path, handle);
        }
        Ok(StoreSql {
            conn,
            current,
            pending: Vec::new(),
            batch: UPSERT_BATCH,
        })
    }

    pub fn with_batch(mut self, batch: usize) -> StoreSql<C> {
        self.batch = batch;
        self
    }
}

impl<C: SqlCell> Store for StoreSql<C> {
    fn get(&self, path: &Path) -> Result<Datum> {
        self.current
            .get(path)
            .map(|handle| Datum::ZSet(C::wrap(handle.clone())))
            .ok_or_else(|| Error::runtime(format!("there is nowhere to put data for key: {path}")))
    }

    fn set(&mut self, path: &Path, value: Datum) -> Result<()> {
        let cell = self
            .current
            .get(path)
            .ok_or_else(|| Error::runtime(format!("there is nowhere to put data for key: {path}")))?
            .clone();
        let z = expect_zset(path, value)?;
        let handle = match C::unwrap(z.clone()) {
            Some(handle) => handle,
            // A plain in-memory value replaces the cell wholesale: clear
            // the stored content and write the new entries.
            None => {
                let replacement = z.to_memory()?;
                let clear = cell.to_memory()?.neg();
                cell.add(&clear).add(&replacement)
            }
        };
        self.pending.push((path.clone(), handle));
        Ok(())
    }

    fn inc(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        debug!(cells = self.pending.len(), "committing step");
        self.conn.execute("BEGIN")?;
        let mut flushed = Vec::with_capacity(self.pending.len());
        let mut failure = None;
        for (path, handle) in &mut self.pending {
            match handle.flush(self.batch) {
                Ok(()) => flushed.push((path.clone(), handle.clone())),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        self.pending.clear();
        if let Some(e) = failure {
            // abort the step: current stays as committed, pending drops
            let _ = self.conn.execute("ROLLBACK");
            return Err(e);
        }
        self.conn.execute("COMMIT")?;
        for (path, handle) in flushed {
            self.current.insert(path, handle);
        }
        Ok(())
    }
}
