//! Per-chat config bindings.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde_json::Value;

use super::{Store, parse_datetime};

/// Binds a chat to a config template, caching the template JSON and its
/// content hash. The hash is the snapshot-cache key: re-binding to an
/// unchanged config reuses the same snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfigBinding {
    pub chat_id: String,
    pub config_id: String,
    pub config_json: Value,
    pub config_hash: String,
    pub updated_at: DateTime<Utc>,
}

impl Store {
    /// Create or update the binding for a chat.
    pub fn bind_chat(
        &self,
        chat_id: &str,
        config_id: &str,
        config_json: &Value,
        config_hash: &str,
    ) -> Result<(), String> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO chat_configs
                 (chat_id, config_id, config_json, config_hash, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                chat_id,
                config_id,
                config_json.to_string(),
                config_hash,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| format!("failed to bind chat {chat_id}: {e}"))?;
        Ok(())
    }

    /// The binding for a chat, or `None` when the chat uses the default.
    pub fn get_binding(&self, chat_id: &str) -> Result<Option<ChatConfigBinding>, String> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT chat_id, config_id, config_json, config_hash, updated_at
                 FROM chat_configs WHERE chat_id = ?1",
                params![chat_id],
                |row| {
                    let json_str: String = row.get(2)?;
                    let updated_str: String = row.get(4)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        json_str,
                        row.get::<_, String>(3)?,
                        updated_str,
                    ))
                },
            )
            .optional()
            .map_err(|e| format!("failed to load binding for chat {chat_id}: {e}"))?;

        let Some((chat_id, config_id, json_str, config_hash, updated_str)) = row else {
            return Ok(None);
        };
        let config_json: Value = serde_json::from_str(&json_str)
            .map_err(|e| format!("corrupt config_json for chat {chat_id}: {e}"))?;
        Ok(Some(ChatConfigBinding {
            chat_id,
            config_id,
            config_json,
            config_hash,
            updated_at: parse_datetime(&updated_str),
        }))
    }

    /// Remove a chat's binding. Returns `true` if one existed.
    pub fn unbind_chat(&self, chat_id: &str) -> Result<bool, String> {
        let conn = self.lock();
        let rows = conn
            .execute("DELETE FROM chat_configs WHERE chat_id = ?1", params![chat_id])
            .map_err(|e| format!("failed to unbind chat {chat_id}: {e}"))?;
        Ok(rows > 0)
    }
}
