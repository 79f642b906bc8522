//! SQLite-backed durable storage.
//!
//! One [`Store`] owns the connection; the per-table APIs live in the
//! submodules as `impl Store` blocks. Schema evolution runs through a
//! monotonic migration ledger at open time: ascending order, idempotent,
//! and fatal on the first failure.

mod bundles;
mod configs;
mod snapshots;
mod writes;

pub use bundles::ServiceBundle;
pub use configs::ChatConfigBinding;
pub use snapshots::StoredSnapshot;
pub use writes::{PendingWrite, WriteStatus};

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

struct Migration {
    id: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        name: "create_chat_configs",
        sql: "CREATE TABLE IF NOT EXISTS chat_configs (
                  chat_id TEXT PRIMARY KEY,
                  config_id TEXT NOT NULL,
                  config_json TEXT NOT NULL,
                  config_hash TEXT NOT NULL,
                  updated_at TEXT NOT NULL
              );",
    },
    Migration {
        id: 2,
        name: "create_snapshots_by_config",
        sql: "CREATE TABLE IF NOT EXISTS snapshots_by_config (
                  config_hash TEXT PRIMARY KEY,
                  snapshot_json TEXT NOT NULL,
                  built_at TEXT NOT NULL,
                  integrity_hash TEXT NOT NULL
              );",
    },
    Migration {
        id: 3,
        name: "create_service_bundles",
        sql: "CREATE TABLE IF NOT EXISTS service_bundles (
                  bundle_hash TEXT PRIMARY KEY,
                  data_url TEXT NOT NULL,
                  code TEXT NOT NULL,
                  created_at TEXT NOT NULL,
                  has_npm INTEGER NOT NULL DEFAULT 0
              );",
    },
    Migration {
        id: 4,
        name: "create_pending_writes",
        sql: "CREATE TABLE IF NOT EXISTS pending_writes (
                  id TEXT PRIMARY KEY,
                  path TEXT NOT NULL,
                  data TEXT NOT NULL,
                  preview TEXT,
                  service_id TEXT NOT NULL,
                  user_id TEXT NOT NULL,
                  chat_id TEXT NOT NULL,
                  created_at TEXT NOT NULL,
                  expires_at TEXT NOT NULL,
                  status TEXT NOT NULL,
                  on_approval TEXT,
                  admin_message_id TEXT,
                  approved_by TEXT,
                  approved_at TEXT,
                  error TEXT
              );",
    },
    Migration {
        id: 5,
        name: "index_pending_writes_status",
        sql: "CREATE INDEX IF NOT EXISTS idx_pending_writes_status
                  ON pending_writes(status, expires_at);",
    },
];

/// SQLite store behind a connection mutex.
///
/// The mutex makes the store `Send + Sync` and doubles as the single-writer
/// lock required by the migration ledger. Readers share the same connection;
/// WAL keeps them from blocking each other at the file level.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self, String> {
        let conn = Connection::open(path)
            .map_err(|e| format!("failed to open database '{}': {e}", path.display()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory()
            .map_err(|e| format!("failed to open in-memory database: {e}"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Run the migration ledger: every entry not yet recorded is applied in
    /// ascending id order inside one transaction. The first failure aborts
    /// the whole run and bubbles up; the runtime must refuse to serve.
    fn migrate(&self) -> Result<(), String> {
        let mut conn = self.lock();
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS migrations (
                 id INTEGER PRIMARY KEY,
                 name TEXT NOT NULL,
                 applied_at TEXT NOT NULL
             );",
        )
        .map_err(|e| format!("migration bootstrap failed: {e}"))?;

        let tx = conn
            .transaction()
            .map_err(|e| format!("failed to begin migration transaction: {e}"))?;

        let mut last_id = 0;
        for migration in MIGRATIONS {
            debug_assert!(migration.id > last_id, "migration ids must ascend");
            last_id = migration.id;

            let already: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM migrations WHERE id = ?1",
                    [migration.id],
                    |row| row.get(0),
                )
                .map_err(|e| format!("failed to read migration ledger: {e}"))?;
            if already > 0 {
                continue;
            }

            tx.execute_batch(migration.sql).map_err(|e| {
                format!("migration {} ({}) failed: {e}", migration.id, migration.name)
            })?;
            tx.execute(
                "INSERT INTO migrations (id, name, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![migration.id, migration.name, Utc::now().to_rfc3339()],
            )
            .map_err(|e| format!("failed to record migration {}: {e}", migration.id))?;
            log::info!("applied migration {} ({})", migration.id, migration.name);
        }

        tx.commit()
            .map_err(|e| format!("failed to commit migrations: {e}"))
    }

    /// Applied migration ids, ascending.
    pub fn applied_migrations(&self) -> Result<Vec<i64>, String> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT id FROM migrations ORDER BY id ASC")
            .map_err(|e| format!("failed to prepare migrations query: {e}"))?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| format!("failed to list migrations: {e}"))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| format!("failed to read migration row: {e}"))?);
        }
        Ok(out)
    }
}

/// Parse an RFC 3339 datetime string, falling back to epoch on failure.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}
