//! Runtime configuration and the declarative service template model.
//!
//! All environment reads happen once, in [`RuntimeConfig::from_env`], at
//! startup. Components receive the record as a dependency; nothing re-reads
//! the environment inside a request path.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ServiceKind;

const DEFAULT_TEMPLATE_ID: &str = "default";
const DEFAULT_DB_PATH: &str = "pubky_bot.db";
const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 86_400;
const DEFAULT_DENO_BIN: &str = "deno";

/// Process-wide configuration assembled from the environment at startup.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Template id used for chats with no explicit config binding.
    pub default_template_id: String,
    /// SQLite database location.
    pub db_path: PathBuf,
    /// How long a pending write waits for a human decision before expiring.
    pub approval_timeout: Duration,
    /// Base URL the approved writes are executed against.
    pub homeserver: Option<String>,
    /// Interpreter binary for the sandbox host.
    pub deno_bin: PathBuf,
    /// Package cache location hint passed through to sandboxed children.
    pub deno_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_template_id: DEFAULT_TEMPLATE_ID.to_string(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            approval_timeout: Duration::from_secs(DEFAULT_APPROVAL_TIMEOUT_SECS),
            homeserver: None,
            deno_bin: PathBuf::from(DEFAULT_DENO_BIN),
            deno_dir: None,
        }
    }
}

impl RuntimeConfig {
    /// Build the configuration from the process environment.
    ///
    /// Malformed numeric values fall back to their defaults with a warning
    /// rather than refusing to start.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let approval_timeout = match std::env::var("PUBKY_APPROVAL_TIMEOUT") {
            Ok(raw) => match raw.parse::<u64>() {
                Ok(secs) => Duration::from_secs(secs),
                Err(_) => {
                    log::warn!(
                        "PUBKY_APPROVAL_TIMEOUT='{raw}' is not a number of seconds, using default"
                    );
                    defaults.approval_timeout
                }
            },
            Err(_) => defaults.approval_timeout,
        };

        Self {
            default_template_id: std::env::var("DEFAULT_TEMPLATE_ID")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.default_template_id),
            db_path: std::env::var("LOCAL_DB_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .map(|raw| PathBuf::from(raw.strip_prefix("sqlite:").unwrap_or(&raw).to_string()))
                .unwrap_or(defaults.db_path),
            approval_timeout,
            homeserver: std::env::var("PUBKY_HOMESERVER")
                .ok()
                .filter(|s| !s.is_empty())
                .map(|s| s.trim_end_matches('/').to_string()),
            deno_bin: std::env::var("DENO_BIN")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.deno_bin),
            deno_dir: std::env::var("DENO_DIR").ok().map(PathBuf::from),
        }
    }
}

// ── Config templates ────────────────────────────────────────────────────

/// Where a service's source code comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceSource {
    /// A file path, resolved relative to the template's base directory.
    Path { path: String },
    /// Source embedded directly in the template.
    Inline { code: String },
}

/// One declared service inside a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDecl {
    /// Stable service id; derived from the manifest (or command) if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Command token; required unless `kind` is `listener`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub kind: ServiceKind,
    pub source: ServiceSource,
    /// Opaque per-service configuration passed through in the payload ctx.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    /// Hosts the service may reach from inside the sandbox.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub net: Vec<String>,
    /// External dataset references, keyed by dataset name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub datasets: BTreeMap<String, String>,
    /// Human-readable description for command lists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A parsed configuration template: the declarative input the snapshot
/// builder turns into a routing table. Declared order is significant for
/// listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigTemplate {
    pub id: String,
    #[serde(default)]
    pub services: Vec<ServiceDecl>,
}

impl ConfigTemplate {
    /// Canonical JSON of the effective template. This is what gets hashed
    /// into `config_hash`, so editing any service content changes the hash
    /// even when the template id stays the same.
    pub fn canonical_json(&self) -> Value {
        serde_json::to_value(self).expect("template serialization cannot fail")
    }
}
