pub mod schema;

use std::str::FromStr;

use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::query::Query;
use sqlx::Postgres;

use crate::{Result, UdavError};

/// Thin gateway around a pooled SQL connection in autocommit mode. Every
/// statement commits independently; no transaction abstraction is offered
/// and none is relied upon.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to the server named by a Postgres connection string,
    /// forcing `sslmode=require`.
    pub async fn connect(url: &str) -> Result<Self> {
        let opts = PgConnectOptions::from_str(url)?.ssl_mode(PgSslMode::Require);
        Self::with_options(opts).await
    }

    /// Connect with caller-prepared options. Used by tests that talk to a
    /// server without TLS.
    pub async fn with_options(opts: PgConnectOptions) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await?;
        Ok(Self { pool })
    }

    /// Execute a uniquely-keyed query and return its single row.
    /// Fails with `NoSuchRow` when nothing matches and `NotUnique` when
    /// more than one row does; the latter is an invariant violation.
    pub async fn one_row(&self, query: Query<'_, Postgres, PgArguments>) -> Result<PgRow> {
        let mut rows = query.fetch_all(&self.pool).await?;
        match rows.len() {
            0 => Err(UdavError::NoSuchRow),
            1 => Ok(rows.pop().expect("len checked")),
            _ => Err(UdavError::NotUnique),
        }
    }

    /// Execute a query and return every matching row.
    pub async fn all_rows(&self, query: Query<'_, Postgres, PgArguments>) -> Result<Vec<PgRow>> {
        Ok(query.fetch_all(&self.pool).await?)
    }

    /// Execute a statement, returning the number of rows affected.
    pub async fn execute(&self, query: Query<'_, Postgres, PgArguments>) -> Result<u64> {
        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    /// Run a multi-statement SQL batch. Bootstrap DDL only.
    pub async fn batch(&self, sql: &str) -> Result<()> {
        sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(())
    }
}

/// True when the error is a unique-constraint violation, which the store
/// maps to EEXIST on (parent, name) collisions.
pub fn is_unique_violation(err: &UdavError) -> bool {
    match err {
        UdavError::Db(e) => e
            .as_database_error()
            .is_some_and(|d| d.is_unique_violation()),
        _ => false,
    }
}

/// True when the error reports a missing table (SQLSTATE 42P01), which
/// bootstrap treats as "schema not created yet".
pub fn is_undefined_table(err: &UdavError) -> bool {
    match err {
        UdavError::Db(e) => e
            .as_database_error()
            .and_then(|d| d.code())
            .is_some_and(|c| c == "42P01"),
        _ => false,
    }
}
