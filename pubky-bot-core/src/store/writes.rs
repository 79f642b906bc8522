//! Durable pending-write records for the approval queue.
//!
//! Status transitions are guarded at the SQL level: every transition names
//! the status it expects to leave, so concurrent deciders and the expiry
//! sweep serialize per id without any in-process locking.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde_json::Value;

use super::{Store, parse_datetime};

/// Lifecycle of a pending write. `Approved` is a transient intermediate
/// written by the approver before execution; live records always advance
/// from it to `Written` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Pending,
    Approved,
    Rejected,
    Written,
    Failed,
    Expired,
}

impl WriteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Written => "written",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "written" => Some(Self::Written),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// One record in the approval queue.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub id: String,
    pub path: String,
    pub data: Value,
    pub preview: Option<String>,
    pub service_id: String,
    pub user_id: String,
    pub chat_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: WriteStatus,
    /// Opaque hook replayed to the service after a successful write.
    pub on_approval: Option<Value>,
    /// Reference to the reviewer-facing notification message, if any.
    pub admin_message_id: Option<String>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

fn row_to_write(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingWrite> {
    let data_str: String = row.get(2)?;
    let status_str: String = row.get(9)?;
    let on_approval_str: Option<String> = row.get(10)?;
    let created_str: String = row.get(7)?;
    let expires_str: String = row.get(8)?;
    let approved_at_str: Option<String> = row.get(13)?;
    Ok(PendingWrite {
        id: row.get(0)?,
        path: row.get(1)?,
        data: serde_json::from_str(&data_str).unwrap_or(Value::Null),
        preview: row.get(3)?,
        service_id: row.get(4)?,
        user_id: row.get(5)?,
        chat_id: row.get(6)?,
        created_at: parse_datetime(&created_str),
        expires_at: parse_datetime(&expires_str),
        status: WriteStatus::parse(&status_str).unwrap_or(WriteStatus::Failed),
        on_approval: on_approval_str.and_then(|s| serde_json::from_str(&s).ok()),
        admin_message_id: row.get(11)?,
        approved_by: row.get(12)?,
        approved_at: approved_at_str.map(|s| parse_datetime(&s)),
        error: row.get(14)?,
    })
}

const WRITE_COLUMNS: &str = "id, path, data, preview, service_id, user_id, chat_id, \
     created_at, expires_at, status, on_approval, admin_message_id, \
     approved_by, approved_at, error";

impl Store {
    /// Persist a new record. The caller sets `status = Pending`; this is the
    /// only admissible starting state.
    pub fn insert_pending_write(&self, write: &PendingWrite) -> Result<(), String> {
        let conn = self.lock();
        conn.execute(
            &format!(
                "INSERT INTO pending_writes ({WRITE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                write.id,
                write.path,
                write.data.to_string(),
                write.preview,
                write.service_id,
                write.user_id,
                write.chat_id,
                write.created_at.to_rfc3339(),
                write.expires_at.to_rfc3339(),
                write.status.as_str(),
                write.on_approval.as_ref().map(|v| v.to_string()),
                write.admin_message_id,
                write.approved_by,
                write.approved_at.map(|t| t.to_rfc3339()),
                write.error,
            ],
        )
        .map_err(|e| format!("failed to insert pending write {}: {e}", write.id))?;
        Ok(())
    }

    pub fn get_pending_write(&self, id: &str) -> Result<Option<PendingWrite>, String> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {WRITE_COLUMNS} FROM pending_writes WHERE id = ?1"),
            params![id],
            row_to_write,
        )
        .optional()
        .map_err(|e| format!("failed to load pending write {id}: {e}"))
    }

    /// Records still awaiting a decision, oldest first, optionally scoped to
    /// one chat.
    pub fn list_pending_writes(&self, chat_id: Option<&str>) -> Result<Vec<PendingWrite>, String> {
        let conn = self.lock();
        let sql = match chat_id {
            Some(_) => format!(
                "SELECT {WRITE_COLUMNS} FROM pending_writes
                 WHERE status = 'pending' AND chat_id = ?1 ORDER BY created_at ASC"
            ),
            None => format!(
                "SELECT {WRITE_COLUMNS} FROM pending_writes
                 WHERE status = 'pending' ORDER BY created_at ASC"
            ),
        };
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| format!("failed to prepare pending writes query: {e}"))?;
        let rows: Vec<rusqlite::Result<PendingWrite>> = match chat_id {
            Some(chat) => stmt
                .query_map(params![chat], row_to_write)
                .map_err(|e| format!("failed to list pending writes: {e}"))?
                .collect(),
            None => stmt
                .query_map([], row_to_write)
                .map_err(|e| format!("failed to list pending writes: {e}"))?
                .collect(),
        };
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| format!("failed to read pending write row: {e}"))?);
        }
        Ok(out)
    }

    /// Atomically move a record from `from` to `to`. Returns `false` without
    /// effect when the record is no longer in `from` (or does not exist);
    /// this is the per-id transition guard.
    pub fn transition_write(
        &self,
        id: &str,
        from: WriteStatus,
        to: WriteStatus,
        decided_by: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, String> {
        let conn = self.lock();
        let decided_at = decided_by.map(|_| Utc::now().to_rfc3339());
        let rows = conn
            .execute(
                "UPDATE pending_writes
                 SET status = ?3,
                     approved_by = COALESCE(?4, approved_by),
                     approved_at = COALESCE(?5, approved_at),
                     error = COALESCE(?6, error)
                 WHERE id = ?1 AND status = ?2",
                params![
                    id,
                    from.as_str(),
                    to.as_str(),
                    decided_by,
                    decided_at,
                    error
                ],
            )
            .map_err(|e| format!("failed to transition write {id}: {e}"))?;
        Ok(rows > 0)
    }

    /// Record the reviewer-facing message reference for a pending write.
    pub fn set_write_admin_message(&self, id: &str, admin_message_id: &str) -> Result<(), String> {
        let conn = self.lock();
        conn.execute(
            "UPDATE pending_writes SET admin_message_id = ?2 WHERE id = ?1",
            params![id, admin_message_id],
        )
        .map_err(|e| format!("failed to set admin message for write {id}: {e}"))?;
        Ok(())
    }

    /// Promote every pending record whose deadline has passed to `expired`.
    /// Returns the number of promoted records. Safe to run concurrently with
    /// decisions: only `pending` rows are touched.
    pub fn expire_pending_writes(&self, now: DateTime<Utc>) -> Result<usize, String> {
        let conn = self.lock();
        let rows = conn
            .execute(
                "UPDATE pending_writes SET status = 'expired'
                 WHERE status = 'pending' AND expires_at <= ?1",
                params![now.to_rfc3339()],
            )
            .map_err(|e| format!("failed to expire pending writes: {e}"))?;
        Ok(rows)
    }
}
