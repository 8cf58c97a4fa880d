//! SQLite persistence for descriptors, crates and ships.
//!
//! [`Database`] is a cloneable handle around one connection guarded by a
//! `parking_lot::Mutex`. Every store method takes the lock for the whole
//! read-modify-write, which makes the database the single writer for ship
//! status transitions within a process; conditional `UPDATE`s extend that
//! across processes.

mod crates;
mod descriptors;
mod schema;
mod ships;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, params};
use shipyard_shared::errors::{ShipyardError, ShipyardResult};

pub use crates::{CrateRecord, CrateStore, NewCrate};
pub use descriptors::{DescriptorRecord, DescriptorStore, checksum_of};
pub use ships::{ShipRecord, ShipStore};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Map a rusqlite error into the shared taxonomy.
pub(crate) fn db_err(e: rusqlite::Error) -> ShipyardError {
    match e {
        rusqlite::Error::SqliteFailure(ref inner, _)
            if inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            ShipyardError::AlreadyExists(e.to_string())
        }
        other => ShipyardError::Database(other.to_string()),
    }
}

pub(crate) fn to_sql_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn from_sql_time(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn from_sql_time_opt(
    idx: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|r| from_sql_time(idx, r)).transpose()
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: &Path) -> ShipyardResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| {
            ShipyardError::Database(format!("failed to open {}: {}", path.display(), e))
        })?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        Self::init(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> ShipyardResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> ShipyardResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON").map_err(db_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;

        for ddl in schema::all_schemas() {
            conn.execute_batch(ddl).map_err(db_err)?;
        }
        Self::ensure_version(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn ensure_version(conn: &Connection) -> ShipyardResult<()> {
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)",
            params![schema::SCHEMA_VERSION, to_sql_time(&Utc::now())],
        )
        .map_err(db_err)?;

        let version: i32 = conn
            .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
                row.get(0)
            })
            .map_err(db_err)?;

        if version > schema::SCHEMA_VERSION {
            return Err(ShipyardError::Database(format!(
                "database schema version {} is newer than supported version {}",
                version,
                schema::SCHEMA_VERSION
            )));
        }
        Ok(())
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    pub fn descriptors(&self) -> DescriptorStore {
        DescriptorStore::new(self.clone())
    }

    pub fn crates(&self) -> CrateStore {
        CrateStore::new(self.clone())
    }

    pub fn ships(&self) -> ShipStore {
        ShipStore::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_file_and_is_reopenable() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("db").join("shipyard.db");

        let db = Database::open(&path).unwrap();
        drop(db);
        assert!(path.exists());

        // schema application is idempotent
        Database::open(&path).unwrap();
    }

    #[test]
    fn test_newer_schema_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("shipyard.db");
        Database::open(&path).unwrap();

        let conn = Connection::open(&path).unwrap();
        conn.execute("UPDATE schema_version SET version = 99 WHERE id = 1", [])
            .unwrap();
        drop(conn);

        assert!(matches!(
            Database::open(&path),
            Err(ShipyardError::Database(_))
        ));
    }

    #[test]
    fn test_timestamps_round_trip() {
        let now = Utc::now();
        let parsed = from_sql_time(0, to_sql_time(&now)).unwrap();
        assert_eq!(parsed, now);
        assert!(from_sql_time(0, "yesterday".into()).is_err());
    }
}
