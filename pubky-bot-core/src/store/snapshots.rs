//! Persistent snapshot cache, keyed by config hash.
//!
//! The store treats snapshot JSON as opaque text; structure and integrity
//! verification belong to the snapshot builder.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::{Store, parse_datetime};

/// A persisted routing snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSnapshot {
    pub config_hash: String,
    pub snapshot_json: String,
    pub built_at: DateTime<Utc>,
    pub integrity_hash: String,
}

impl Store {
    /// Put-or-replace a snapshot under its config hash. Concurrent builders
    /// may race here; both write content-equivalent rows for the same hash,
    /// so last-writer-wins is safe.
    pub fn put_snapshot(
        &self,
        config_hash: &str,
        snapshot_json: &str,
        integrity_hash: &str,
    ) -> Result<(), String> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO snapshots_by_config
                 (config_hash, snapshot_json, built_at, integrity_hash)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                config_hash,
                snapshot_json,
                Utc::now().to_rfc3339(),
                integrity_hash,
            ],
        )
        .map_err(|e| format!("failed to store snapshot for {config_hash}: {e}"))?;
        Ok(())
    }

    pub fn get_snapshot(&self, config_hash: &str) -> Result<Option<StoredSnapshot>, String> {
        let conn = self.lock();
        conn.query_row(
            "SELECT config_hash, snapshot_json, built_at, integrity_hash
             FROM snapshots_by_config WHERE config_hash = ?1",
            params![config_hash],
            |row| {
                let built_str: String = row.get(2)?;
                Ok(StoredSnapshot {
                    config_hash: row.get(0)?,
                    snapshot_json: row.get(1)?,
                    built_at: parse_datetime(&built_str),
                    integrity_hash: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(|e| format!("failed to load snapshot for {config_hash}: {e}"))
    }

    /// All persisted snapshots. Used by the orphan GC to compute the set of
    /// referenced bundle hashes.
    pub fn list_snapshots(&self) -> Result<Vec<StoredSnapshot>, String> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT config_hash, snapshot_json, built_at, integrity_hash
                 FROM snapshots_by_config ORDER BY config_hash",
            )
            .map_err(|e| format!("failed to prepare snapshot list query: {e}"))?;
        let rows = stmt
            .query_map([], |row| {
                let built_str: String = row.get(2)?;
                Ok(StoredSnapshot {
                    config_hash: row.get(0)?,
                    snapshot_json: row.get(1)?,
                    built_at: parse_datetime(&built_str),
                    integrity_hash: row.get(3)?,
                })
            })
            .map_err(|e| format!("failed to list snapshots: {e}"))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| format!("failed to read snapshot row: {e}"))?);
        }
        Ok(out)
    }

    /// Delete the snapshot for a config hash. Returns `true` if one existed.
    pub fn delete_snapshot(&self, config_hash: &str) -> Result<bool, String> {
        let conn = self.lock();
        let rows = conn
            .execute(
                "DELETE FROM snapshots_by_config WHERE config_hash = ?1",
                params![config_hash],
            )
            .map_err(|e| format!("failed to delete snapshot for {config_hash}: {e}"))?;
        Ok(rows > 0)
    }
}
