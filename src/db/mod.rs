// src/db/mod.rs

//! Registry persistence
//!
//! SQLite is the single durable source of truth for versions, packages,
//! snapshots and cleanup audits. Every mutation that touches more than one
//! row goes through [`transaction`] so readers never see a half-applied
//! state transition.

mod migrations;
pub mod models;
pub mod paths;
pub mod schema;

use crate::error::Result;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// How long a writer waits for a competing lock before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Create the database (and parent directories) and run migrations
pub fn init(db_path: &Path) -> Result<()> {
    info!("Initializing registry database at: {}", db_path.display());

    std::fs::create_dir_all(paths::db_dir(db_path))?;

    let conn = open(db_path)?;
    schema::migrate(&conn)?;
    Ok(())
}

/// Open an existing database with foreign keys and a busy timeout
pub fn open(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Open an in-memory database with the schema applied
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    schema::migrate(&conn)?;
    Ok(conn)
}

/// Run a closure inside an immediate transaction
///
/// Commits when the closure returns `Ok`, rolls back otherwise. Immediate
/// mode takes the write lock up front, which serializes concurrent
/// aggregate updates.
pub fn transaction<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&Transaction) -> Result<T>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Current UTC time as stored in the database
///
/// Fixed-width RFC 3339 so timestamps order correctly as text.
pub fn now() -> String {
    format_timestamp(chrono::Utc::now())
}

pub fn format_timestamp(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_creates_parent_dirs() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("metadata/deltaship.db");
        init(&path).unwrap();
        assert!(path.exists());

        let conn = open(&path).unwrap();
        assert_eq!(schema::get_schema_version(&conn).unwrap(), schema::SCHEMA_VERSION);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("test.db");
        init(&path).unwrap();
        let mut conn = open(&path).unwrap();

        let result: Result<()> = transaction(&mut conn, |tx| {
            tx.execute(
                "INSERT INTO retention_policies (kind, max_versions, updated_at) VALUES ('full', 9, ?1)",
                [now()],
            )?;
            Err(crate::error::Error::Internal("boom".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM retention_policies", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
