//! Routing snapshots and the three-tier snapshot cache.
//!
//! A snapshot is the immutable routing table for one chat: command routes,
//! ordered listeners, and enough hashes to be fully self-describing. Builds
//! go memory cache → persistent cache → full rebuild, with integrity
//! verification on every persistent hit.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use pubky_bot_core::config::ConfigTemplate;
use pubky_bot_core::hash::{canonical_json_hash, content_hash};
use pubky_bot_core::store::Store;
use pubky_bot_core::types::{RouteMeta, SDK_SCHEMA_VERSION, ServiceKind};

use crate::bundler::{BundledService, bundle_service};
use crate::dispatch::normalize_token;
use crate::source::{ConfigSource, default_template};

/// Bumped whenever the persisted snapshot layout changes; cached snapshots
/// with another version are rebuilt.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

const MEMORY_TTL: Duration = Duration::from_secs(10);

/// A command token bound to a service bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRoute {
    pub token: String,
    pub service_id: String,
    pub kind: ServiceKind,
    pub bundle_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    pub meta: RouteMeta,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub datasets: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub net: Vec<String>,
}

/// A listener consulted for uncommanded messages, in declared order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerRoute {
    pub service_id: String,
    pub bundle_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    pub meta: RouteMeta,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub datasets: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub net: Vec<String>,
}

/// An entry in the per-chat command list handed to the adapter for
/// republication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The immutable routing table for a chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub schema_version: u32,
    pub sdk_schema_version: u32,
    pub built_at: String,
    pub config_hash: String,
    /// Hash over all referenced bundle hashes in sorted order.
    pub source_sig: String,
    pub commands: BTreeMap<String, CommandRoute>,
    pub listeners: Vec<ListenerRoute>,
    /// Content hash of this snapshot with `integrity` itself blanked.
    pub integrity: String,
}

impl Snapshot {
    /// Recompute the integrity hash: the canonical serialization with the
    /// `integrity` field emptied.
    pub fn compute_integrity(&self) -> String {
        let mut body = self.clone();
        body.integrity = String::new();
        canonical_json_hash(&serde_json::to_value(&body).expect("snapshot serialization"))
    }

    pub fn verify_integrity(&self) -> bool {
        self.compute_integrity() == self.integrity
    }

    /// Every bundle hash this snapshot references.
    pub fn bundle_hashes(&self) -> BTreeSet<String> {
        self.commands
            .values()
            .map(|r| r.bundle_hash.clone())
            .chain(self.listeners.iter().map(|r| r.bundle_hash.clone()))
            .collect()
    }

    /// Command tokens with descriptions, in token order.
    pub fn command_list(&self) -> Vec<CommandInfo> {
        self.commands
            .values()
            .map(|r| CommandInfo {
                token: r.token.clone(),
                description: r.meta.description.clone(),
            })
            .collect()
    }

    /// The command route owned by a service, if any.
    pub fn command_for_service(&self, service_id: &str) -> Option<&CommandRoute> {
        self.commands.values().find(|r| r.service_id == service_id)
    }
}

/// Result of an orphan-bundle sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcReport {
    pub deleted: usize,
    pub kept: usize,
}

struct MemoryEntry {
    snapshot: Arc<Snapshot>,
    inserted_at: Instant,
}

/// Builds and caches routing snapshots.
pub struct SnapshotBuilder {
    store: Arc<Store>,
    source: Box<dyn ConfigSource>,
    default_template_id: String,
    memory: Mutex<HashMap<String, MemoryEntry>>,
    memory_ttl: Duration,
}

impl SnapshotBuilder {
    pub fn new(store: Arc<Store>, source: Box<dyn ConfigSource>, default_template_id: impl Into<String>) -> Self {
        Self {
            store,
            source,
            default_template_id: default_template_id.into(),
            memory: Mutex::new(HashMap::new()),
            memory_ttl: MEMORY_TTL,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_memory_ttl(mut self, ttl: Duration) -> Self {
        self.memory_ttl = ttl;
        self
    }

    /// Fetch a template through the configured source. Exposed for the admin
    /// rebind path, which must fail (not fall back) on a bad reference.
    pub fn fetch_template(&self, id: &str) -> Result<ConfigTemplate, String> {
        self.source.fetch(id)
    }

    /// The current routing snapshot for a chat.
    ///
    /// Tier 1: per-chat memory cache (TTL 10 s, invalidated when the chat's
    /// bound config hash moved). Tier 2: persistent cache keyed by config
    /// hash, verified before use. Tier 3: full rebuild. `force` skips both
    /// caches.
    pub fn build(&self, chat_id: &str, force: bool) -> Result<Arc<Snapshot>, String> {
        if !force {
            if let Some(snapshot) = self.memory_lookup(chat_id)? {
                return Ok(snapshot);
            }
        }

        let (template, config_hash) = self.effective_template(chat_id)?;

        if !force {
            if let Some(stored) = self.store.get_snapshot(&config_hash)? {
                match verify_stored(&stored.snapshot_json, &config_hash) {
                    Ok(snapshot) => {
                        log::debug!("snapshot cache hit for chat {chat_id} ({config_hash})");
                        let snapshot = Arc::new(snapshot);
                        self.memory_insert(chat_id, &snapshot);
                        return Ok(snapshot);
                    }
                    Err(e) => {
                        log::warn!("cached snapshot for {config_hash} rejected: {e}; rebuilding");
                    }
                }
            }
        }

        let snapshot = Arc::new(self.rebuild(&template, &config_hash)?);
        self.memory_insert(chat_id, &snapshot);
        Ok(snapshot)
    }

    /// Bundle hashes referenced by at least one persisted snapshot.
    ///
    /// An unparsable persisted snapshot is an error rather than an empty
    /// contribution, so callers deleting against this set never delete a
    /// bundle a corrupt snapshot might still reference.
    pub fn referenced_bundle_hashes(&self) -> Result<BTreeSet<String>, String> {
        let mut referenced = BTreeSet::new();
        for stored in self.store.list_snapshots()? {
            let snapshot: Snapshot = serde_json::from_str(&stored.snapshot_json)
                .map_err(|e| format!("unparsable snapshot for {}: {e}", stored.config_hash))?;
            referenced.extend(snapshot.bundle_hashes());
        }
        Ok(referenced)
    }

    /// Delete every bundle no persisted snapshot references.
    pub fn gc_orphans(&self) -> Result<GcReport, String> {
        let referenced = self.referenced_bundle_hashes()?;

        let mut deleted = 0;
        let mut kept = 0;
        for hash in self.store.list_bundle_hashes()? {
            if referenced.contains(&hash) {
                kept += 1;
            } else if self.store.delete_bundle(&hash)? {
                deleted += 1;
            }
        }
        log::info!("bundle gc: deleted {deleted}, kept {kept}");
        Ok(GcReport { deleted, kept })
    }

    // ── Cache tiers ─────────────────────────────────────────────────────

    fn memory_lookup(&self, chat_id: &str) -> Result<Option<Arc<Snapshot>>, String> {
        let snapshot = {
            let memory = self.memory.lock().unwrap();
            match memory.get(chat_id) {
                Some(entry) if entry.inserted_at.elapsed() < self.memory_ttl => {
                    Some(Arc::clone(&entry.snapshot))
                }
                _ => None,
            }
        };
        let Some(snapshot) = snapshot else {
            return Ok(None);
        };

        // A hit is only valid while the chat's bound config hash matches.
        // Unbound chats carry no cheap current hash; the TTL covers them.
        if let Some(binding) = self.store.get_binding(chat_id)? {
            if binding.config_hash != snapshot.config_hash {
                log::debug!("memory cache for chat {chat_id} is stale; discarding");
                self.memory.lock().unwrap().remove(chat_id);
                return Ok(None);
            }
        }
        Ok(Some(snapshot))
    }

    fn memory_insert(&self, chat_id: &str, snapshot: &Arc<Snapshot>) {
        self.memory.lock().unwrap().insert(
            chat_id.to_string(),
            MemoryEntry {
                snapshot: Arc::clone(snapshot),
                inserted_at: Instant::now(),
            },
        );
    }

    /// Resolve the effective template and its content hash for a chat.
    ///
    /// Bound chats re-fetch by their bound config id, falling back to the
    /// JSON cached in the binding. Unbound chats fetch the default template
    /// id, falling back to the built-in template. The hash always covers the
    /// template actually used, so content edits invalidate caches even when
    /// the id is unchanged.
    fn effective_template(&self, chat_id: &str) -> Result<(ConfigTemplate, String), String> {
        let template = match self.store.get_binding(chat_id)? {
            Some(binding) => match self.source.fetch(&binding.config_id) {
                Ok(template) => template,
                Err(e) => {
                    log::warn!(
                        "fetch of bound config '{}' for chat {chat_id} failed: {e}; using bound copy",
                        binding.config_id
                    );
                    serde_json::from_value(binding.config_json.clone())
                        .map_err(|e| format!("bound config for chat {chat_id} is corrupt: {e}"))?
                }
            },
            None => match self.source.fetch(&self.default_template_id) {
                Ok(template) => template,
                Err(e) => {
                    log::warn!(
                        "fetch of default template '{}' failed: {e}; using built-in",
                        self.default_template_id
                    );
                    default_template()
                }
            },
        };
        let config_hash = canonical_json_hash(&template.canonical_json());
        Ok((template, config_hash))
    }

    // ── Rebuild ─────────────────────────────────────────────────────────

    /// Turn a template into a snapshot: bundle every service, split into
    /// command and listener routes, hash, persist. All-or-nothing: one
    /// failed service fails the build so routing is never partial.
    fn rebuild(&self, template: &ConfigTemplate, config_hash: &str) -> Result<Snapshot, String> {
        let base_dir = self.source.base_dir();
        let mut commands: BTreeMap<String, CommandRoute> = BTreeMap::new();
        let mut listeners = Vec::new();

        for (index, decl) in template.services.iter().enumerate() {
            let bundled = bundle_service(&self.store, decl, base_dir, index)?;
            match bundled.kind {
                ServiceKind::Listener => listeners.push(listener_route(bundled)),
                ServiceKind::SingleShot | ServiceKind::MultiStep => {
                    let route = command_route(bundled)?;
                    if let Some(previous) = commands.insert(route.token.clone(), route) {
                        log::warn!(
                            "duplicate command token '{}' in template '{}': '{}' is shadowed",
                            previous.token,
                            template.id,
                            previous.service_id
                        );
                    }
                }
            }
        }

        let bundle_hashes: BTreeSet<String> = commands
            .values()
            .map(|r| r.bundle_hash.clone())
            .chain(listeners.iter().map(|r: &ListenerRoute| r.bundle_hash.clone()))
            .collect();
        let joined: Vec<&str> = bundle_hashes.iter().map(String::as_str).collect();
        let source_sig = content_hash(joined.join("|").as_bytes());

        let mut snapshot = Snapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            sdk_schema_version: SDK_SCHEMA_VERSION,
            built_at: Utc::now().to_rfc3339(),
            config_hash: config_hash.to_string(),
            source_sig,
            commands,
            listeners,
            integrity: String::new(),
        };
        snapshot.integrity = snapshot.compute_integrity();

        let json = serde_json::to_string(&snapshot)
            .map_err(|e| format!("snapshot serialization failed: {e}"))?;
        self.store.put_snapshot(config_hash, &json, &snapshot.integrity)?;
        log::info!(
            "built snapshot for config {config_hash}: {} command(s), {} listener(s)",
            snapshot.commands.len(),
            snapshot.listeners.len()
        );
        Ok(snapshot)
    }
}

fn command_route(bundled: BundledService) -> Result<CommandRoute, String> {
    let command = bundled
        .command
        .ok_or_else(|| format!("service '{}' resolved without a command", bundled.service_id))?;
    let token = normalize_token(&command);
    Ok(CommandRoute {
        token: token.clone(),
        meta: RouteMeta {
            id: bundled.service_id.clone(),
            command: token,
            description: bundled.description,
        },
        service_id: bundled.service_id,
        kind: bundled.kind,
        bundle_hash: bundled.bundle_hash,
        config: bundled.config,
        datasets: bundled.datasets,
        net: bundled.net,
    })
}

fn listener_route(bundled: BundledService) -> ListenerRoute {
    ListenerRoute {
        meta: RouteMeta {
            id: bundled.service_id.clone(),
            command: String::new(),
            description: bundled.description,
        },
        service_id: bundled.service_id,
        bundle_hash: bundled.bundle_hash,
        config: bundled.config,
        datasets: bundled.datasets,
        net: bundled.net,
    }
}

/// Parse and verify a persisted snapshot: schema version, integrity hash,
/// and config-hash binding must all check out.
fn verify_stored(snapshot_json: &str, expected_config_hash: &str) -> Result<Snapshot, String> {
    let snapshot: Snapshot =
        serde_json::from_str(snapshot_json).map_err(|e| format!("parse failed: {e}"))?;
    if snapshot.schema_version != SNAPSHOT_SCHEMA_VERSION {
        return Err(format!(
            "schema version {} != {SNAPSHOT_SCHEMA_VERSION}",
            snapshot.schema_version
        ));
    }
    if !snapshot.verify_integrity() {
        return Err("integrity hash mismatch".to_string());
    }
    if snapshot.config_hash != expected_config_hash {
        return Err(format!(
            "config hash {} != {expected_config_hash}",
            snapshot.config_hash
        ));
    }
    Ok(snapshot)
}
