//! PostgreSQL connection wrapper
//!
//! A synchronous `postgres::Client` shared by every Z-set handle in a
//! store. Sequential scans are disabled per session so indexed reads
//! drive row order through the secondary indexes.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use postgres::NoTls;

use crate::error::Result;
use crate::zset::sql::{Dialect, SqlConn};

#[derive(Clone)]
pub struct PgConn {
    client: Rc<RefCell<postgres::Client>>,
}

impl PgConn {
    pub fn connect(url: &str) -> Result<PgConn> {
        let client = postgres::Client::connect(url, NoTls)?;
        Ok(PgConn {
            client: Rc::new(RefCell::new(client)),
        })
    }

    pub fn begin(&self) -> Result<()> {
        self.execute("BEGIN")
    }

    pub fn commit(&self) -> Result<()> {
        self.execute("COMMIT")
    }

    /// Prefer the secondary indexes for ordered reads.
    pub fn disable_seqscan(&self) -> Result<()> {
        self.execute("SET enable_seqscan = off")
    }
}

impl SqlConn for PgConn {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn execute(&self, sql: &str) -> Result<()> {
        self.client.borrow_mut().batch_execute(sql)?;
        Ok(())
    }

    fn query_rows(&self, sql: &str) -> Result<Vec<(Vec<u8>, i64)>> {
        let mut client = self.client.borrow_mut();
        let rows = client.query(sql, &[])?;
        Ok(rows
            .iter()
            .map(|row| {
                let bytes: Vec<u8> = row.get(0);
                let count: i64 = row.get(1);
                (bytes, count)
            })
            .collect())
    }

    fn query_i64(&self, sql: &str) -> Result<Option<i64>> {
        let mut client = self.client.borrow_mut();
        let rows = client.query(sql, &[])?;
        Ok(rows.first().map(|row| row.get(0)))
    }
}

impl fmt::Debug for PgConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PgConn")
    }
}
