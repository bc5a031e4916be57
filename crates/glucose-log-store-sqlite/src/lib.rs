#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use glucose_log_core::{RecordSlot, TrackerError};
use rusqlite::{params, Connection, OptionalExtension};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const SLOT_MIGRATION_VERSION: i64 = 1;

const SCHEMA_SLOTS_V1: &str = r"
CREATE TABLE IF NOT EXISTS record_slots (
  slot_name TEXT PRIMARY KEY,
  payload_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// A named slot in a sqlite file. Each slot row holds one serialized
/// collection and is replaced wholesale on every write.
pub struct SqliteRecordSlot {
    conn: Connection,
    slot_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSummary {
    pub slot_name: String,
    pub payload_bytes: usize,
    pub updated_at: String,
}

impl SqliteRecordSlot {
    pub fn open(path: &Path, slot_name: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        if slot_name.trim().is_empty() {
            return Err(anyhow!("slot name MUST be non-empty"));
        }

        Ok(Self {
            conn,
            slot_name: slot_name.to_string(),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_SLOTS_V1)
            .context("failed to apply record slot schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SLOT_MIGRATION_VERSION, now_rfc3339()?],
            )
            .context("failed to register record slot migration")?;

        Ok(())
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub fn slot_name(&self) -> &str {
        &self.slot_name
    }

    pub fn read_payload(&self) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT payload_json FROM record_slots WHERE slot_name = ?1",
                params![self.slot_name],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to read record slot {}", self.slot_name))
    }

    pub fn write_payload(&self, payload: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO record_slots(slot_name, payload_json, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(slot_name) DO UPDATE SET
                   payload_json = excluded.payload_json,
                   updated_at = excluded.updated_at",
                params![self.slot_name, payload, now_rfc3339()?],
            )
            .with_context(|| format!("failed to write record slot {}", self.slot_name))?;

        tracing::debug!(slot = %self.slot_name, bytes = payload.len(), "record slot written");
        Ok(())
    }

    /// Deletes the slot row. Returns whether a row existed.
    pub fn clear(&self) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM record_slots WHERE slot_name = ?1",
                params![self.slot_name],
            )
            .with_context(|| format!("failed to clear record slot {}", self.slot_name))?;
        Ok(removed > 0)
    }

    pub fn list_slots(&self) -> Result<Vec<SlotSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT slot_name, LENGTH(CAST(payload_json AS BLOB)), updated_at
                 FROM record_slots
                 ORDER BY slot_name ASC",
            )
            .context("failed to prepare slot listing")?;

        let rows = stmt
            .query_map([], |row| {
                let bytes: i64 = row.get(1)?;
                Ok(SlotSummary {
                    slot_name: row.get(0)?,
                    payload_bytes: usize::try_from(bytes).unwrap_or_default(),
                    updated_at: row.get(2)?,
                })
            })
            .context("failed to list record slots")?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to decode record slot row")
    }
}

impl RecordSlot for SqliteRecordSlot {
    fn read(&self) -> Result<Option<String>, TrackerError> {
        self.read_payload()
            .map_err(|err| TrackerError::Storage(format!("{err:#}")))
    }

    fn write(&mut self, payload: &str) -> Result<(), TrackerError> {
        self.write_payload(payload)
            .map_err(|err| TrackerError::Storage(format!("{err:#}")))
    }
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|err| anyhow!("failed to format timestamp: {err}"))
}
