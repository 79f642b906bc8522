//! Service bundling: source → content-addressed artifact.
//!
//! Bundling resolves a declared service's source, inlines the SDK shim,
//! detects third-party package usage, extracts the static manifest, and
//! discovers datasets. The resulting bundle is persisted by content hash;
//! identical source always lands on the same hash.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use pubky_bot_core::config::{ServiceDecl, ServiceSource};
use pubky_bot_core::hash::content_hash;
use pubky_bot_core::store::{ServiceBundle, Store};
use pubky_bot_core::types::ServiceKind;

/// Manifest id sentinel meaning "derive my id at build time".
const RUNTIME_ID_SENTINEL: &str = "__runtime__";

/// Datasets larger than this are skipped so one runaway file cannot bloat
/// every snapshot referencing it.
const MAX_DATASET_BYTES: u64 = 1024 * 1024;

/// Runtime shim inlined ahead of every service. Reads the payload from
/// stdin and exposes `respond()` for writing the single response document.
const SDK_PRELUDE: &str = r#"// pubky-bot sdk shim
const __payload = JSON.parse(await new Response(Deno.stdin.readable).text());
globalThis.PUBKY_BOT_EVENT = __payload;
globalThis.respond = (response) => console.log(JSON.stringify(response));
"#;

/// Static manifest extracted from a service source.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServiceManifest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A service after bundling: everything the snapshot builder needs to emit
/// a route.
#[derive(Debug, Clone, PartialEq)]
pub struct BundledService {
    pub service_id: String,
    pub command: Option<String>,
    pub kind: ServiceKind,
    pub bundle_hash: String,
    pub has_npm: bool,
    pub description: Option<String>,
    pub config: Option<Value>,
    pub net: Vec<String>,
    pub datasets: BTreeMap<String, Value>,
}

/// Bundle one declared service and persist the artifact if it is new.
///
/// `index` is the service's position in the template, used only for
/// fallback ids of listeners that declare neither an id nor a manifest.
/// Any failure here fails the whole snapshot rebuild; routing is
/// all-or-nothing.
pub fn bundle_service(
    store: &Store,
    decl: &ServiceDecl,
    base_dir: Option<&Path>,
    index: usize,
) -> Result<BundledService, String> {
    let (code, source_path) = resolve_source(&decl.source, base_dir)?;

    if decl.kind != ServiceKind::Listener && decl.command.is_none() {
        return Err(format!("service #{index} has kind {:?} but no command", decl.kind));
    }

    let bundled = format!("{SDK_PRELUDE}\n{code}");
    let has_npm = detect_npm(&code);
    let bundle_hash = content_hash(bundled.as_bytes());

    let manifest = extract_manifest(&code).unwrap_or_else(|| {
        log::warn!("service #{index}: no parseable manifest, using declared metadata");
        ServiceManifest::default()
    });

    let command = manifest
        .command
        .clone()
        .or_else(|| decl.command.clone());
    let service_id = resolve_service_id(&manifest, decl, command.as_deref(), index);
    let description = manifest.description.clone().or_else(|| decl.description.clone());

    let bundle = ServiceBundle {
        bundle_hash: bundle_hash.clone(),
        entry: format!(
            "data:application/typescript;base64,{}",
            BASE64.encode(bundled.as_bytes())
        ),
        code: bundled,
        has_npm,
        created_at: Utc::now(),
    };
    store.put_bundle(&bundle)?;

    let datasets = discover_datasets(decl, source_path.as_deref());

    Ok(BundledService {
        service_id,
        command,
        kind: decl.kind,
        bundle_hash,
        has_npm,
        description,
        config: decl.config.clone(),
        net: decl.net.clone(),
        datasets,
    })
}

fn resolve_source(
    source: &ServiceSource,
    base_dir: Option<&Path>,
) -> Result<(String, Option<PathBuf>), String> {
    match source {
        ServiceSource::Inline { code } => Ok((code.clone(), None)),
        ServiceSource::Path { path } => {
            let raw = Path::new(path);
            let resolved = if raw.is_absolute() {
                raw.to_path_buf()
            } else {
                base_dir.unwrap_or(Path::new(".")).join(raw)
            };
            let code = std::fs::read_to_string(&resolved)
                .map_err(|e| format!("failed to read service source '{}': {e}", resolved.display()))?;
            Ok((code, Some(resolved)))
        }
    }
}

/// Manifest id wins unless it is the runtime sentinel, which always derives
/// the id from the command: `mock_<command>`. With no manifest id at all,
/// the declared id applies before the `mock_` derivation.
fn resolve_service_id(
    manifest: &ServiceManifest,
    decl: &ServiceDecl,
    command: Option<&str>,
    index: usize,
) -> String {
    let derived = || {
        command
            .map(|c| format!("mock_{c}"))
            .unwrap_or_else(|| format!("listener_{index}"))
    };
    match manifest.id.as_deref() {
        Some(RUNTIME_ID_SENTINEL) => derived(),
        Some(id) => id.to_string(),
        None => decl.id.clone().unwrap_or_else(derived),
    }
}

/// Detect `npm:` import specifiers in static or dynamic imports.
pub(crate) fn detect_npm(code: &str) -> bool {
    for line in code.lines() {
        let trimmed = line.trim_start();
        let is_import = trimmed.starts_with("import") || trimmed.starts_with("export");
        if is_import && (line.contains("\"npm:") || line.contains("'npm:")) {
            return true;
        }
        if line.contains("import(\"npm:") || line.contains("import('npm:") {
            return true;
        }
    }
    false
}

/// Extract the `export const manifest = {...};` literal, if present.
///
/// The literal must be JSON (double-quoted keys); brace matching is textual,
/// which is enough for the flat manifests services declare. Anything that
/// fails to parse is treated as absent.
pub(crate) fn extract_manifest(code: &str) -> Option<ServiceManifest> {
    let marker = code.find("export const manifest")?;
    let after = &code[marker..];
    let open = after.find('{')?;
    let body = &after[open..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in body.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let literal = &body[..=i];
                    return match serde_json::from_str::<ServiceManifest>(literal) {
                        Ok(manifest) => Some(manifest),
                        Err(e) => {
                            log::warn!("manifest literal is not valid JSON: {e}");
                            None
                        }
                    };
                }
            }
            _ => {}
        }
    }
    None
}

/// Datasets attached to a route: JSON files from the sibling `datasets/`
/// directory plus `{"ref": locator}` placeholders for declared external
/// references. Read errors never fail the build; they are logged and the
/// dataset is skipped.
fn discover_datasets(decl: &ServiceDecl, source_path: Option<&Path>) -> BTreeMap<String, Value> {
    let mut datasets = BTreeMap::new();

    if let Some(dir) = source_path.and_then(Path::parent).map(|p| p.join("datasets")) {
        match std::fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                        continue;
                    };
                    match read_dataset(&path) {
                        Ok(value) => {
                            datasets.insert(name.to_string(), value);
                        }
                        Err(e) => log::warn!("skipping dataset '{}': {e}", path.display()),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("cannot read dataset directory '{}': {e}", dir.display()),
        }
    }

    for (name, locator) in &decl.datasets {
        if datasets.contains_key(name) {
            log::warn!("dataset '{name}' declared both as file and reference; reference wins");
        }
        datasets.insert(name.clone(), serde_json::json!({ "ref": locator }));
    }

    datasets
}

fn read_dataset(path: &Path) -> Result<Value, String> {
    let meta = std::fs::metadata(path).map_err(|e| format!("stat failed: {e}"))?;
    if meta.len() > MAX_DATASET_BYTES {
        return Err(format!("{} bytes exceeds the {MAX_DATASET_BYTES} byte cap", meta.len()));
    }
    let raw = std::fs::read_to_string(path).map_err(|e| format!("read failed: {e}"))?;
    serde_json::from_str(&raw).map_err(|e| format!("not valid JSON: {e}"))
}
