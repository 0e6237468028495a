//! One-shot query helpers.
//!
//! Each call checks a connection out, runs one statement and gives the
//! connection back. The [`PooledConnection`](crate::PooledConnection) guard
//! returns it on every exit path, including driver errors. Nothing is
//! retried.

use crate::driver::{Row, Rows};
use crate::error::{PoolError, Result};
use crate::pool::Pool;

impl Pool {
    /// Run an INSERT, UPDATE or DELETE and commit it.
    ///
    /// Returns the number of rows affected. Fails with
    /// [`PoolError::ReadOnly`] on a read-only pool.
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        if self.is_read_only() {
            return Err(PoolError::ReadOnly);
        }

        let mut conn = self.checkout().await?;
        let affected = conn.execute(sql).await?;
        conn.commit().await?;
        conn.release();
        Ok(affected)
    }

    /// Run a SELECT and buffer every row.
    pub async fn query(&self, sql: &str) -> Result<Rows> {
        let mut conn = self.checkout().await?;
        let rows = conn.query(sql).await?;
        conn.release();
        Ok(rows)
    }

    /// Run a SELECT and return its first row.
    ///
    /// An empty result is `Ok(None)`, distinct from a failed query.
    pub async fn query_first(&self, sql: &str) -> Result<Option<Row>> {
        Ok(self.query(sql).await?.into_first())
    }
}
