//! Content-addressed service bundle storage.
//!
//! A pure leaf: bundles reference nothing, snapshots reference bundles by
//! hash only. `put` is idempotent because the hash uniquely determines the
//! code; conflicting inserts of the same hash are ignored.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::{Store, parse_datetime};

/// An immutable service artifact keyed by the content hash of its code.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceBundle {
    pub bundle_hash: String,
    /// Entry descriptor usable by the sandbox host (a data: URL of the
    /// bundled code).
    pub entry: String,
    pub code: String,
    /// Whether the service imports third-party packages; widens the sandbox
    /// read capability to the interpreter's package cache.
    pub has_npm: bool,
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Persist a bundle. Idempotent: a bundle with the same hash is already
    /// byte-identical, so conflicts are ignored. Durable once this returns.
    pub fn put_bundle(&self, bundle: &ServiceBundle) -> Result<(), String> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO service_bundles
                 (bundle_hash, data_url, code, created_at, has_npm)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                bundle.bundle_hash,
                bundle.entry,
                bundle.code,
                bundle.created_at.to_rfc3339(),
                bundle.has_npm as i64,
            ],
        )
        .map_err(|e| format!("failed to store bundle {}: {e}", bundle.bundle_hash))?;
        Ok(())
    }

    /// Fetch a bundle by hash. A never-put hash is `None`, not a fault.
    pub fn get_bundle(&self, bundle_hash: &str) -> Result<Option<ServiceBundle>, String> {
        let conn = self.lock();
        conn.query_row(
            "SELECT bundle_hash, data_url, code, created_at, has_npm
             FROM service_bundles WHERE bundle_hash = ?1",
            params![bundle_hash],
            |row| {
                let created_str: String = row.get(3)?;
                Ok(ServiceBundle {
                    bundle_hash: row.get(0)?,
                    entry: row.get(1)?,
                    code: row.get(2)?,
                    created_at: parse_datetime(&created_str),
                    has_npm: row.get::<_, i64>(4)? != 0,
                })
            },
        )
        .optional()
        .map_err(|e| format!("failed to load bundle {bundle_hash}: {e}"))
    }

    /// All stored bundle hashes.
    pub fn list_bundle_hashes(&self) -> Result<Vec<String>, String> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT bundle_hash FROM service_bundles ORDER BY bundle_hash")
            .map_err(|e| format!("failed to prepare bundle list query: {e}"))?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| format!("failed to list bundles: {e}"))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| format!("failed to read bundle row: {e}"))?);
        }
        Ok(out)
    }

    /// Delete a bundle. Returns `true` if a row was removed. The caller is
    /// responsible for not deleting referenced hashes; the snapshot builder
    /// recreates missing bundles on the next rebuild regardless.
    pub fn delete_bundle(&self, bundle_hash: &str) -> Result<bool, String> {
        let conn = self.lock();
        let rows = conn
            .execute(
                "DELETE FROM service_bundles WHERE bundle_hash = ?1",
                params![bundle_hash],
            )
            .map_err(|e| format!("failed to delete bundle {bundle_hash}: {e}"))?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(hash: &str, code: &str) -> ServiceBundle {
        ServiceBundle {
            bundle_hash: hash.to_string(),
            entry: format!("data:application/typescript;base64,{code}"),
            code: code.to_string(),
            has_npm: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let b = bundle("sha256:aaaa", "console.log(1)");
        store.put_bundle(&b).unwrap();

        let loaded = store.get_bundle("sha256:aaaa").unwrap().unwrap();
        assert_eq!(loaded.code, b.code);
        assert_eq!(loaded.entry, b.entry);
        assert!(!loaded.has_npm);
    }

    #[test]
    fn get_of_never_put_hash_is_none() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_bundle("sha256:missing").unwrap().is_none());
    }

    #[test]
    fn put_is_idempotent_on_same_hash() {
        let store = Store::open_in_memory().unwrap();
        let b = bundle("sha256:bbbb", "x");
        store.put_bundle(&b).unwrap();
        // Second put with the same hash is a no-op, not an error.
        store.put_bundle(&b).unwrap();
        assert_eq!(store.list_bundle_hashes().unwrap().len(), 1);
    }

    #[test]
    fn delete_reports_whether_a_row_existed() {
        let store = Store::open_in_memory().unwrap();
        store.put_bundle(&bundle("sha256:cccc", "x")).unwrap();
        assert!(store.delete_bundle("sha256:cccc").unwrap());
        assert!(!store.delete_bundle("sha256:cccc").unwrap());
        assert!(store.get_bundle("sha256:cccc").unwrap().is_none());
    }

    #[test]
    fn has_npm_survives_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let mut b = bundle("sha256:dddd", "import chalk from \"npm:chalk\"");
        b.has_npm = true;
        store.put_bundle(&b).unwrap();
        assert!(store.get_bundle("sha256:dddd").unwrap().unwrap().has_npm);
    }
}
