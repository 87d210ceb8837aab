//! PostgresSink - idempotent inserts keyed by the item's message id.
//!
//! # Error mapping
//!
//! | sqlx error | Outcome |
//! |---|---|
//! | none, 1 row affected | `Inserted` |
//! | none, 0 rows affected (`ON CONFLICT DO NOTHING`) | `AlreadyPresent` |
//! | database `23505` (unique violation) | `AlreadyPresent` |
//! | io, tls, pool timeout or closed | `SinkError::Connection` |
//! | anything else | `SinkError::Write` |

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tracing::{debug, instrument};

use tributary_core::domain::{Item, StoredRecord};
use tributary_core::ports::{InsertOutcome, Sink, SinkError};

const DEFAULT_TABLE: &str = "entries";

#[derive(Debug, Error)]
pub enum PgSinkError {
    #[error("invalid table name {0:?}")]
    InvalidTableName(String),

    #[error("connect failed: {0}")]
    Connect(#[source] sqlx::Error),
}

/// Appends one row per item. Safe to share across consumer workers: the pool
/// hands each insert its own connection.
#[derive(Clone)]
pub struct PostgresSink {
    pool: PgPool,
    table: String,
    insert_sql: String,
}

impl PostgresSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: DEFAULT_TABLE.to_string(),
            insert_sql: insert_sql(DEFAULT_TABLE),
        }
    }

    /// Connect with a small pool. Fails if the database cannot be reached.
    pub async fn connect(database_url: &str) -> Result<Self, PgSinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(PgSinkError::Connect)?;
        Ok(Self::new(pool))
    }

    /// Write into `table` instead of `entries`. Accepts `name` or `schema.name`.
    pub fn with_table(mut self, table: &str) -> Result<Self, PgSinkError> {
        if !is_valid_table_name(table) {
            return Err(PgSinkError::InvalidTableName(table.to_string()));
        }
        self.table = table.to_string();
        self.insert_sql = insert_sql(table);
        Ok(self)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Sink for PostgresSink {
    #[instrument(skip(self, item), fields(table = %self.table, message_id = %item.id()), err)]
    async fn insert(&self, item: &Item) -> Result<InsertOutcome, SinkError> {
        let record = StoredRecord::from_item(item);

        let result = sqlx::query(&self.insert_sql)
            .bind(record.key.as_str())
            .bind(record.subject.as_str())
            .bind(&record.payload)
            .bind(record.timestamp)
            .execute(&self.pool)
            .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => {
                debug!("row already present");
                Ok(InsertOutcome::AlreadyPresent)
            }
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::AlreadyPresent),
            Err(e) => Err(map_sqlx_error("insert", e)),
        }
    }

    #[instrument(skip(self), err)]
    async fn ping(&self) -> Result<(), SinkError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ping", e))?;
        Ok(())
    }
}

fn insert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} (idempotency_key, subject, payload, timestamp) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (idempotency_key) DO NOTHING"
    )
}

fn is_valid_table_name(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SinkError {
    let transport = matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    );
    if transport {
        return SinkError::Connection(format!("{operation}: {err}"));
    }

    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            SinkError::Write(format!(
                "database error in {operation} (code {code}): {}",
                db_err.message()
            ))
        }
        other => SinkError::Write(format!("sqlx error in {operation}: {other}")),
    }
}

/// Unique violation on the key: a concurrent insert of the same item won.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_connection_errors() {
        for err in [
            sqlx::Error::PoolTimedOut,
            sqlx::Error::PoolClosed,
            sqlx::Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused")),
        ] {
            assert!(matches!(map_sqlx_error("insert", err), SinkError::Connection(_)));
        }
    }

    #[test]
    fn other_errors_are_write_errors() {
        let err = map_sqlx_error("insert", sqlx::Error::RowNotFound);
        assert!(matches!(err, SinkError::Write(msg) if msg.contains("insert")));
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn table_names_are_plain_identifiers() {
        for ok in ["entries", "ingest.entries", "_t1"] {
            assert!(is_valid_table_name(ok), "{ok}");
        }
        for bad in ["", "1entries", "entries; DROP TABLE x", "a.b.c", "en-tries", "a."] {
            assert!(!is_valid_table_name(bad), "{bad}");
        }
    }

    #[test]
    fn insert_targets_configured_table() {
        let sql = insert_sql("ingest.entries");
        assert!(sql.starts_with("INSERT INTO ingest.entries "));
        assert!(sql.contains("ON CONFLICT (idempotency_key) DO NOTHING"));
    }
}
