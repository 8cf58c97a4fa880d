use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use sha2::{Digest, Sha256};
use shipyard_shared::errors::ShipyardResult;

use super::{Database, db_err, from_sql_time, to_sql_time};

/// Hex SHA-256 of build file content.
pub fn checksum_of(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorRecord {
    pub id: i64,
    /// Name of the first crate built from this content.
    pub name: String,
    pub content: String,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

impl DescriptorRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            content: row.get(2)?,
            checksum: row.get(3)?,
            created_at: from_sql_time(4, row.get(4)?)?,
        })
    }
}

const COLUMNS: &str = "id, name, content, checksum, created_at";

#[derive(Clone)]
pub struct DescriptorStore {
    db: Database,
}

impl DescriptorStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist `content`, or return the existing record with the same checksum.
    pub fn insert_or_get(&self, name: &str, content: &str) -> ShipyardResult<DescriptorRecord> {
        let checksum = checksum_of(content);
        let conn = self.db.conn();

        conn.execute(
            "INSERT OR IGNORE INTO build_descriptors (name, content, checksum, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![name, content, checksum, to_sql_time(&Utc::now())],
        )
        .map_err(db_err)?;

        conn.query_row(
            &format!("SELECT {COLUMNS} FROM build_descriptors WHERE checksum = ?1"),
            params![checksum],
            DescriptorRecord::from_row,
        )
        .map_err(db_err)
    }

    pub fn get(&self, id: i64) -> ShipyardResult<Option<DescriptorRecord>> {
        self.db
            .conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM build_descriptors WHERE id = ?1"),
                params![id],
                DescriptorRecord::from_row,
            )
            .optional()
            .map_err(db_err)
    }

    pub fn get_by_name(&self, name: &str) -> ShipyardResult<Option<DescriptorRecord>> {
        self.db
            .conn()
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM build_descriptors WHERE name = ?1 ORDER BY id LIMIT 1"
                ),
                params![name],
                DescriptorRecord::from_row,
            )
            .optional()
            .map_err(db_err)
    }

    /// Delete the descriptor unless a crate still references it.
    /// Returns whether a row was removed.
    pub fn delete_if_unreferenced(&self, id: i64) -> ShipyardResult<bool> {
        let removed = self
            .db
            .conn()
            .execute(
                "DELETE FROM build_descriptors WHERE id = ?1
                 AND NOT EXISTS (SELECT 1 FROM crates WHERE descriptor_id = ?1)",
                params![id],
            )
            .map_err(db_err)?;
        Ok(removed > 0)
    }
}
