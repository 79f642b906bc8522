//! Config template sources.
//!
//! The real template fetcher is an external collaborator; [`ConfigSource`]
//! is its seam. The runtime ships a directory-backed source for local
//! templates and a built-in default template used as the fallback when a
//! fetch fails.

use std::path::{Path, PathBuf};

use pubky_bot_core::config::ConfigTemplate;

/// Fetches already-parsed config templates by id.
pub trait ConfigSource: Send + Sync {
    fn fetch(&self, id: &str) -> Result<ConfigTemplate, String>;

    /// Base directory for resolving relative service source paths declared
    /// in templates from this source.
    fn base_dir(&self) -> Option<&Path> {
        None
    }
}

/// Reads templates from `<dir>/<id>.json`.
pub struct DirConfigSource {
    dir: PathBuf,
}

impl DirConfigSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ConfigSource for DirConfigSource {
    fn fetch(&self, id: &str) -> Result<ConfigTemplate, String> {
        if id.contains(['/', '\\']) || id.contains("..") {
            return Err(format!("invalid template id '{id}'"));
        }
        let path = self.dir.join(format!("{id}.json"));
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| format!("failed to read template '{}': {e}", path.display()))?;
        serde_json::from_str(&raw)
            .map_err(|e| format!("failed to parse template '{}': {e}", path.display()))
    }

    fn base_dir(&self) -> Option<&Path> {
        Some(&self.dir)
    }
}

const DEFAULT_PING_SERVICE: &str = r#"export const manifest = { "id": "__runtime__", "command": "ping", "description": "Liveness check" };
const event = globalThis.PUBKY_BOT_EVENT;
respond({ kind: "reply", text: "pong" });
"#;

const DEFAULT_HELP_LISTENER: &str = r#"export const manifest = { "id": "help_listener", "description": "Points lost users at the command list" };
const event = globalThis.PUBKY_BOT_EVENT;
const text = event?.event?.message?.text ?? "";
if (text.toLowerCase().includes("help")) {
  respond({ kind: "reply", text: "Try /ping to check I'm alive." });
} else {
  respond({ kind: "none" });
}
"#;

/// The built-in template: enough to answer `/ping` and point users asking
/// for help at the command list. Used when the configured source cannot
/// deliver a template.
pub fn default_template() -> ConfigTemplate {
    serde_json::from_value(serde_json::json!({
        "id": "default",
        "services": [
            {
                "command": "ping",
                "kind": "single_shot",
                "source": { "code": DEFAULT_PING_SERVICE },
                "description": "Liveness check"
            },
            {
                "id": "help_listener",
                "kind": "listener",
                "source": { "code": DEFAULT_HELP_LISTENER }
            }
        ]
    }))
    .expect("built-in default template must parse")
}
