//! SQLite connection wrapper
//!
//! One `rusqlite::Connection` shared by every Z-set handle in a store.
//! Steps are single-threaded, so the handle is a plain `Rc`.

use std::path::Path;
use std::rc::Rc;

use crate::error::Result;
use crate::zset::sql::{Dialect, SqlConn};

#[derive(Debug, Clone)]
pub struct SqliteConn {
    conn: Rc<rusqlite::Connection>,
}

impl SqliteConn {
    pub fn open(path: impl AsRef<Path>) -> Result<SqliteConn> {
        Ok(SqliteConn {
            conn: Rc::new(rusqlite::Connection::open(path)?),
        })
    }

    pub fn open_in_memory() -> Result<SqliteConn> {
        Ok(SqliteConn {
            conn: Rc::new(rusqlite::Connection::open_in_memory()?),
        })
    }

    pub fn begin(&self) -> Result<()> {
        self.execute("BEGIN")
    }

    pub fn commit(&self) -> Result<()> {
        self.execute("COMMIT")
    }
}

impl SqlConn for SqliteConn {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn query_rows(&self, sql: &str) -> Result<Vec<(Vec<u8>, i64)>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| {
            let bytes: Vec<u8> = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((bytes, count))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn query_i64(&self, sql: &str) -> Result<Option<i64>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}
