use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use shipyard_shared::constants::layers::DEFAULT_TAG;
use shipyard_shared::errors::{ShipyardError, ShipyardResult};

use super::{Database, db_err, from_sql_time, to_sql_time};
use crate::layers::LayerLookup;

/// A built, immutable crate.
#[derive(Debug, Clone, PartialEq)]
pub struct CrateRecord {
    pub id: i64,
    pub name: String,
    pub tag: String,
    pub base_image: String,
    /// Upper directory holding this layer's content.
    pub layer_path: PathBuf,
    /// Hex SHA-256 of the compressed archive.
    pub digest: String,
    pub size_bytes: u64,
    pub descriptor_id: i64,
    pub created_at: DateTime<Utc>,
}

impl CrateRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let layer_path: String = row.get(4)?;
        let size_bytes: i64 = row.get(6)?;
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            tag: row.get(2)?,
            base_image: row.get(3)?,
            layer_path: PathBuf::from(layer_path),
            digest: row.get(5)?,
            size_bytes: u64::try_from(size_bytes).unwrap_or(0),
            descriptor_id: row.get(7)?,
            created_at: from_sql_time(8, row.get(8)?)?,
        })
    }
}

/// Fields of a crate about to be inserted.
#[derive(Debug, Clone)]
pub struct NewCrate {
    pub name: String,
    pub base_image: String,
    pub layer_path: PathBuf,
    pub digest: String,
    pub size_bytes: u64,
    pub descriptor_id: i64,
}

const COLUMNS: &str =
    "id, name, tag, base_image, layer_path, digest, size_bytes, descriptor_id, created_at";

#[derive(Clone)]
pub struct CrateStore {
    db: Database,
}

impl CrateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a crate under the default tag.
    ///
    /// Fails with `AlreadyExists` when the name or the digest is taken.
    pub fn insert(&self, new: &NewCrate) -> ShipyardResult<CrateRecord> {
        let size = i64::try_from(new.size_bytes)
            .map_err(|_| ShipyardError::Internal(format!("size {} overflows", new.size_bytes)))?;
        let conn = self.db.conn();

        conn.execute(
            "INSERT INTO crates (name, tag, base_image, layer_path, digest, size_bytes, descriptor_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new.name,
                DEFAULT_TAG,
                new.base_image,
                new.layer_path.to_string_lossy(),
                new.digest,
                size,
                new.descriptor_id,
                to_sql_time(&Utc::now()),
            ],
        )
        .map_err(db_err)?;

        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM crates WHERE id = ?1"),
            params![id],
            CrateRecord::from_row,
        )
        .map_err(db_err)
    }

    pub fn get_by_name(&self, name: &str) -> ShipyardResult<Option<CrateRecord>> {
        self.db
            .conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM crates WHERE name = ?1 AND tag = ?2"),
                params![name, DEFAULT_TAG],
                CrateRecord::from_row,
            )
            .optional()
            .map_err(db_err)
    }

    pub fn get_by_id(&self, id: i64) -> ShipyardResult<Option<CrateRecord>> {
        self.db
            .conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM crates WHERE id = ?1"),
                params![id],
                CrateRecord::from_row,
            )
            .optional()
            .map_err(db_err)
    }

    pub fn exists(&self, name: &str) -> ShipyardResult<bool> {
        Ok(self.get_by_name(name)?.is_some())
    }

    pub fn list(&self) -> ShipyardResult<Vec<CrateRecord>> {
        let conn = self.db.conn();
        let mut stmt = conn
            .prepare(&format!("SELECT {COLUMNS} FROM crates ORDER BY created_at, id"))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], CrateRecord::from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// Names of ships whose image is this crate.
    pub fn ships_referencing(&self, crate_id: i64) -> ShipyardResult<Vec<String>> {
        let conn = self.db.conn();
        let mut stmt = conn
            .prepare("SELECT name FROM ships WHERE image_id = ?1 ORDER BY name")
            .map_err(db_err)?;
        let names = stmt
            .query_map(params![crate_id], |row| row.get(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(db_err)?;
        Ok(names)
    }

    /// Names of crates built directly on top of `name`.
    pub fn children_of(&self, name: &str) -> ShipyardResult<Vec<String>> {
        let conn = self.db.conn();
        let mut stmt = conn
            .prepare("SELECT name FROM crates WHERE base_image = ?1 ORDER BY name")
            .map_err(db_err)?;
        let names = stmt
            .query_map(params![name], |row| row.get(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(db_err)?;
        Ok(names)
    }

    pub fn delete(&self, id: i64) -> ShipyardResult<bool> {
        let removed = self
            .db
            .conn()
            .execute("DELETE FROM crates WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(removed > 0)
    }
}

impl LayerLookup for CrateStore {
    fn parent_of(&self, name: &str) -> ShipyardResult<Option<String>> {
        Ok(self.get_by_name(name)?.map(|record| record.base_image))
    }
}
