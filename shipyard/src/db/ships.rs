use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use shipyard_shared::errors::{ShipyardError, ShipyardResult};

use super::{Database, db_err, from_sql_time, from_sql_time_opt, to_sql_time};
use crate::ship::{ShipState, ShipStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct ShipRecord {
    pub id: i64,
    pub name: String,
    /// Id of the crate this ship runs.
    pub image_id: i64,
    pub created_at: DateTime<Utc>,
    pub state: ShipState,
}

impl ShipRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(3)?;
        let status = status.parse::<ShipStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let pid: Option<i64> = row.get(4)?;

        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            image_id: row.get(2)?,
            created_at: from_sql_time(5, row.get(5)?)?,
            state: ShipState {
                status,
                pid: pid.and_then(|p| u32::try_from(p).ok()),
                started_at: from_sql_time_opt(6, row.get(6)?)?,
                stopped_at: from_sql_time_opt(7, row.get(7)?)?,
                exit_code: row.get(8)?,
            },
        })
    }

    pub fn status(&self) -> ShipStatus {
        self.state.status
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.pid
    }
}

const COLUMNS: &str =
    "id, name, image_id, status, process_id, created_at, started_at, stopped_at, exit_code";

#[derive(Clone)]
pub struct ShipStore {
    db: Database,
}

impl ShipStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn load(conn: &Connection, name: &str) -> ShipyardResult<Option<ShipRecord>> {
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM ships WHERE name = ?1"),
            params![name],
            ShipRecord::from_row,
        )
        .optional()
        .map_err(db_err)
    }

    /// Write `next` over the row, but only if it still holds `prev`.
    fn compare_and_set(
        conn: &Connection,
        record: &ShipRecord,
        prev: &ShipState,
        next: &ShipState,
        image_id: i64,
    ) -> ShipyardResult<bool> {
        let updated = conn
            .execute(
                "UPDATE ships SET status = ?1, process_id = ?2, started_at = ?3, stopped_at = ?4,
                     exit_code = ?5, image_id = ?6
                 WHERE id = ?7 AND status = ?8 AND process_id IS ?9",
                params![
                    next.status.as_str(),
                    next.pid,
                    next.started_at.as_ref().map(to_sql_time),
                    next.stopped_at.as_ref().map(to_sql_time),
                    next.exit_code,
                    image_id,
                    record.id,
                    prev.status.as_str(),
                    prev.pid,
                ],
            )
            .map_err(db_err)?;
        Ok(updated == 1)
    }

    /// Insert a new ship that was just spawned as `pid`.
    pub fn insert_running(&self, name: &str, image_id: i64, pid: u32) -> ShipyardResult<ShipRecord> {
        let state = ShipState::running(pid);
        let conn = self.db.conn();

        conn.execute(
            "INSERT INTO ships (name, image_id, status, process_id, created_at, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                name,
                image_id,
                state.status.as_str(),
                pid,
                to_sql_time(&Utc::now()),
                state.started_at.as_ref().map(to_sql_time),
            ],
        )
        .map_err(db_err)?;

        Self::load(&conn, name)?
            .ok_or_else(|| ShipyardError::Database(format!("ship '{}' vanished after insert", name)))
    }

    /// Move an existing stopped or errored ship to running as `pid`.
    pub fn update_running(&self, name: &str, image_id: i64, pid: u32) -> ShipyardResult<ShipRecord> {
        let conn = self.db.conn();
        let record = Self::load(&conn, name)?
            .ok_or_else(|| ShipyardError::NotFound(format!("ship '{}'", name)))?;

        let mut next = record.state.clone();
        next.mark_running(pid)?;

        if !Self::compare_and_set(&conn, &record, &record.state, &next, image_id)? {
            return Err(ShipyardError::InvalidState(format!(
                "ship '{}' changed while starting",
                name
            )));
        }

        Self::load(&conn, name)?
            .ok_or_else(|| ShipyardError::NotFound(format!("ship '{}'", name)))
    }

    /// Record a deploy or start whose process never spawned.
    ///
    /// Creates the ship in `error` if it does not exist yet, otherwise moves
    /// the stopped or errored row to `error`.
    pub fn record_spawn_failure(&self, name: &str, image_id: i64) -> ShipyardResult<ShipRecord> {
        let conn = self.db.conn();

        match Self::load(&conn, name)? {
            None => {
                let state = ShipState::spawn_failed();
                conn.execute(
                    "INSERT INTO ships (name, image_id, status, created_at, stopped_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        name,
                        image_id,
                        state.status.as_str(),
                        to_sql_time(&Utc::now()),
                        state.stopped_at.as_ref().map(to_sql_time),
                    ],
                )
                .map_err(db_err)?;
            }
            Some(record) if record.status().is_running() => {
                return Err(ShipyardError::InvalidState(format!(
                    "ship '{}' is already running",
                    name
                )));
            }
            Some(record) => {
                let mut next = record.state.clone();
                next.mark_error()?;
                next.exit_code = None;
                if !Self::compare_and_set(&conn, &record, &record.state, &next, image_id)? {
                    return Err(ShipyardError::InvalidState(format!(
                        "ship '{}' changed while starting",
                        name
                    )));
                }
            }
        }

        Self::load(&conn, name)?
            .ok_or_else(|| ShipyardError::NotFound(format!("ship '{}'", name)))
    }

    /// Record that the process `expected_pid` of ship `name` is gone.
    ///
    /// Applies only while the row is still `running` with that pid, so the
    /// exit waiter, the health probe, reconciliation and `stop` can all race
    /// on one death and exactly one of them wins. Returns whether this call
    /// applied the transition.
    pub fn mark_stopped(
        &self,
        name: &str,
        expected_pid: u32,
        exit_code: Option<i32>,
    ) -> ShipyardResult<bool> {
        self.transition(name, expected_pid, |state| state.mark_stopped(exit_code))
    }

    /// Record a supervision failure for `expected_pid`. Same guard as [`Self::mark_stopped`].
    pub fn mark_error(&self, name: &str, expected_pid: u32) -> ShipyardResult<bool> {
        self.transition(name, expected_pid, ShipState::mark_error)
    }

    fn transition<F>(&self, name: &str, expected_pid: u32, apply: F) -> ShipyardResult<bool>
    where
        F: FnOnce(&mut ShipState) -> ShipyardResult<()>,
    {
        let conn = self.db.conn();
        let Some(record) = Self::load(&conn, name)? else {
            return Ok(false);
        };
        if !record.state.status.is_running() || record.state.pid != Some(expected_pid) {
            return Ok(false);
        }

        let mut next = record.state.clone();
        apply(&mut next)?;
        Self::compare_and_set(&conn, &record, &record.state, &next, record.image_id)
    }

    pub fn get(&self, name: &str) -> ShipyardResult<Option<ShipRecord>> {
        Self::load(&self.db.conn(), name)
    }

    pub fn list(&self) -> ShipyardResult<Vec<ShipRecord>> {
        self.query(&format!("SELECT {COLUMNS} FROM ships ORDER BY name"))
    }

    pub fn list_running(&self) -> ShipyardResult<Vec<ShipRecord>> {
        self.query(&format!(
            "SELECT {COLUMNS} FROM ships WHERE status = 'running' ORDER BY name"
        ))
    }

    fn query(&self, sql: &str) -> ShipyardResult<Vec<ShipRecord>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map([], ShipRecord::from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// Delete a ship that is not running.
    pub fn delete(&self, name: &str) -> ShipyardResult<bool> {
        let conn = self.db.conn();
        let Some(record) = Self::load(&conn, name)? else {
            return Ok(false);
        };
        if !record.status().can_remove() {
            return Err(ShipyardError::InvalidState(format!(
                "ship '{}' is {}; stop it first",
                name,
                record.status()
            )));
        }

        let removed = conn
            .execute(
                "DELETE FROM ships WHERE id = ?1 AND status != 'running'",
                params![record.id],
            )
            .map_err(db_err)?;
        Ok(removed > 0)
    }
}
