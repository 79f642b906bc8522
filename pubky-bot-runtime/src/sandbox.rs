//! Sandbox host: one fresh interpreter child per invocation.
//!
//! The child runs under a strict capability profile: no remote code, reads
//! limited to the materialized bundle directory (plus the package cache for
//! npm-using services), no writes, a hard-coded environment whitelist, and
//! network access only to an explicit host list. Stdio is the only channel:
//! one JSON payload in, one JSON response out, under a hard deadline.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use pubky_bot_core::config::RuntimeConfig;
use pubky_bot_core::store::ServiceBundle;
use pubky_bot_core::types::ExecPayload;

const DEFAULT_TIMEOUT_MS: u64 = 3000;
const MIN_TIMEOUT_MS: u64 = 100;
const MAX_TIMEOUT_MS: u64 = 20_000;

/// At most this many hosts make it into the network allowlist.
const MAX_NET_HOSTS: usize = 5;

const MAX_STDOUT_BYTES: usize = 1024 * 1024;
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Environment variables a child may inherit. Everything else is dropped.
const ENV_WHITELIST: &[&str] = &["HOME", "PATH", "DENO_DIR", "XDG_CACHE_HOME"];

/// Per-invocation capability grant.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SandboxCaps {
    /// Requested deadline; clamped to [100, 20000] ms, default 3000.
    pub timeout_ms: Option<u64>,
    /// Hosts the child may reach. Wildcards are filtered out, the list is
    /// capped; empty means no network at all.
    pub net: Vec<String>,
    /// Widens read access to the interpreter's package cache.
    pub has_npm: bool,
}

/// Why a sandbox run produced no usable value.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxError {
    Spawn(String),
    Io(String),
    Timeout { timeout_ms: u64 },
    Exit { code: i32, stderr: String },
    InvalidJson(String),
    OutputOverflow { limit: usize },
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "sandbox spawn failed: {e}"),
            Self::Io(e) => write!(f, "sandbox io error: {e}"),
            Self::Timeout { timeout_ms } => {
                write!(f, "sandbox exit -1: timed out after {timeout_ms}ms")
            }
            Self::Exit { code, stderr } => write!(f, "sandbox exit {code}: {stderr}"),
            Self::InvalidJson(reason) => write!(f, "invalid JSON: {reason}"),
            Self::OutputOverflow { limit } => {
                write!(f, "sandbox output exceeded {limit} bytes")
            }
        }
    }
}

impl std::error::Error for SandboxError {}

/// Outcome of a run: `None` for empty stdout ("no response"), `Some` for a
/// parsed JSON document.
pub type SandboxResult = Result<Option<Value>, SandboxError>;

/// The dispatcher's seam onto subprocess execution. Runs are independent;
/// implementations hold no per-run mutable state beyond launch book-keeping.
pub trait Sandbox: Send + Sync {
    fn run<'a>(
        &'a self,
        bundle: &'a ServiceBundle,
        payload: &'a ExecPayload,
        caps: &'a SandboxCaps,
    ) -> Pin<Box<dyn Future<Output = SandboxResult> + Send + 'a>>;
}

/// Effective deadline for a requested timeout.
pub fn effective_timeout_ms(requested: Option<u64>) -> u64 {
    requested
        .unwrap_or(DEFAULT_TIMEOUT_MS)
        .clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS)
}

/// Hosts that survive allowlist filtering: non-empty, no wildcards, capped.
pub(crate) fn filter_net_hosts(hosts: &[String]) -> Vec<String> {
    hosts
        .iter()
        .map(|h| h.trim())
        .filter(|h| !h.is_empty() && !h.contains('*'))
        .take(MAX_NET_HOSTS)
        .map(str::to_string)
        .collect()
}

/// Deno-backed sandbox host.
///
/// Bundles are materialized once into a per-process temp directory and
/// reused for subsequent invocations of the same hash; the directory lives
/// for the process lifetime.
pub struct DenoSandbox {
    deno_bin: PathBuf,
    deno_dir: Option<PathBuf>,
    bundle_dir: PathBuf,
    materialized: Mutex<HashSet<String>>,
}

impl DenoSandbox {
    pub fn new(config: &RuntimeConfig) -> Result<Self, String> {
        let bundle_dir = std::env::temp_dir().join(format!("pubky-bot-bundles-{}", std::process::id()));
        std::fs::create_dir_all(&bundle_dir)
            .map_err(|e| format!("failed to create bundle directory '{}': {e}", bundle_dir.display()))?;
        Ok(Self {
            deno_bin: config.deno_bin.clone(),
            deno_dir: config.deno_dir.clone(),
            bundle_dir,
            materialized: Mutex::new(HashSet::new()),
        })
    }

    /// Write the bundle's code to its per-hash file, once per process.
    fn materialize(&self, bundle: &ServiceBundle) -> Result<PathBuf, String> {
        let file_name = format!("{}.ts", bundle.bundle_hash.replace(':', "-"));
        let path = self.bundle_dir.join(file_name);
        let mut materialized = self.materialized.lock().unwrap();
        if !materialized.contains(&bundle.bundle_hash) {
            std::fs::write(&path, &bundle.code)
                .map_err(|e| format!("failed to materialize bundle '{}': {e}", path.display()))?;
            materialized.insert(bundle.bundle_hash.clone());
        }
        Ok(path)
    }

    /// The full argument vector for one invocation. Pure so the capability
    /// profile is testable without spawning anything.
    pub(crate) fn build_args(
        entry: &Path,
        caps: &SandboxCaps,
        bundle_dir: &Path,
        deno_dir: Option<&Path>,
    ) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--quiet".to_string(),
            "--no-remote".to_string(),
            "--no-prompt".to_string(),
        ];

        let mut readable = vec![bundle_dir.display().to_string()];
        if caps.has_npm {
            if let Some(dir) = deno_dir {
                readable.push(dir.display().to_string());
            }
        }
        args.push(format!("--allow-read={}", readable.join(",")));

        args.push(format!("--allow-env={}", ENV_WHITELIST.join(",")));

        let hosts = filter_net_hosts(&caps.net);
        if !hosts.is_empty() {
            args.push(format!("--allow-net={}", hosts.join(",")));
        }

        args.push(entry.display().to_string());
        args
    }
}

impl Sandbox for DenoSandbox {
    fn run<'a>(
        &'a self,
        bundle: &'a ServiceBundle,
        payload: &'a ExecPayload,
        caps: &'a SandboxCaps,
    ) -> Pin<Box<dyn Future<Output = SandboxResult> + Send + 'a>> {
        Box::pin(async move {
            let entry = self.materialize(bundle).map_err(SandboxError::Io)?;
            let args = Self::build_args(&entry, caps, &self.bundle_dir, self.deno_dir.as_deref());

            let mut command = Command::new(&self.deno_bin);
            command
                .args(&args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .env_clear();
            for key in ENV_WHITELIST {
                if let Ok(value) = std::env::var(key) {
                    command.env(key, value);
                }
            }
            if let Some(dir) = &self.deno_dir {
                command.env("DENO_DIR", dir);
            }

            let timeout_ms = effective_timeout_ms(caps.timeout_ms);
            let deadline = Duration::from_millis(timeout_ms);

            let mut child = command
                .spawn()
                .map_err(|e| SandboxError::Spawn(e.to_string()))?;

            // One JSON document plus newline, then close stdin. A child that
            // exits without reading is classified by its exit status, so
            // write errors are not themselves fatal.
            let payload_json =
                serde_json::to_string(payload).map_err(|e| SandboxError::Io(e.to_string()))?;
            if let Some(mut stdin) = child.stdin.take() {
                let write = async {
                    stdin.write_all(payload_json.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.shutdown().await
                };
                if let Err(e) = write.await {
                    log::debug!("sandbox stdin write aborted early: {e}");
                }
            }

            let stdout_pipe = child
                .stdout
                .take()
                .ok_or_else(|| SandboxError::Io("child stdout not captured".into()))?;
            let stderr_pipe = child
                .stderr
                .take()
                .ok_or_else(|| SandboxError::Io("child stderr not captured".into()))?;

            let exchange = async {
                let (stdout, stderr) = tokio::join!(
                    read_capped(stdout_pipe, MAX_STDOUT_BYTES),
                    read_capped(stderr_pipe, MAX_STDERR_BYTES),
                );
                let status = child.wait().await;
                (stdout, stderr, status)
            };

            let exchanged = tokio::time::timeout(deadline, exchange).await;
            let (stdout, stderr, status) = match exchanged {
                Ok(result) => result,
                Err(_) => {
                    // Deadline expired: kill and report. kill_on_drop backs
                    // this up if the explicit kill races the child's exit.
                    let _ = child.start_kill();
                    return Err(SandboxError::Timeout { timeout_ms });
                }
            };

            let (stdout, stdout_overflow) = stdout.map_err(|e| SandboxError::Io(e.to_string()))?;
            let (stderr, _) = stderr.map_err(|e| SandboxError::Io(e.to_string()))?;
            let status = status.map_err(|e| SandboxError::Io(e.to_string()))?;

            let stderr_text = String::from_utf8_lossy(&stderr).trim().to_string();
            if !status.success() {
                return Err(SandboxError::Exit {
                    code: status.code().unwrap_or(-1),
                    stderr: stderr_text,
                });
            }
            if stdout_overflow {
                return Err(SandboxError::OutputOverflow { limit: MAX_STDOUT_BYTES });
            }
            if !stderr_text.is_empty() {
                log::debug!("sandbox stderr: {stderr_text}");
            }

            let stdout_text = String::from_utf8_lossy(&stdout);
            let trimmed = stdout_text.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            serde_json::from_str(trimmed)
                .map(Some)
                .map_err(|e| SandboxError::InvalidJson(e.to_string()))
        })
    }
}

/// Read a stream to EOF, up to `cap` bytes. Returns the bytes and whether
/// the stream kept going past the cap.
async fn read_capped<R: AsyncRead + Unpin>(reader: R, cap: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    let mut limited = reader.take(cap as u64 + 1);
    limited.read_to_end(&mut buf).await?;
    let overflow = buf.len() > cap;
    if overflow {
        buf.truncate(cap);
    }
    Ok((buf, overflow))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pubky_bot_core::types::{PayloadCtx, PayloadEvent, PayloadManifest};
    use std::time::Instant;

    fn payload() -> ExecPayload {
        ExecPayload {
            event: PayloadEvent::Command {
                token: "hello".into(),
                state: None,
                state_version: None,
            },
            ctx: PayloadCtx {
                chat_id: "c1".into(),
                user_id: "u1".into(),
                service_config: None,
                route_meta: None,
                datasets: None,
            },
            manifest: PayloadManifest::default(),
        }
    }

    fn bundle() -> ServiceBundle {
        // Unique hash per call: tests share one bundle directory, so a
        // fixed hash would let concurrent tests race on the same file.
        ServiceBundle {
            bundle_hash: format!("sha256:{}", uuid::Uuid::new_v4().simple()),
            entry: "data:application/typescript;base64,".into(),
            code: "// test bundle".into(),
            has_npm: false,
            created_at: Utc::now(),
        }
    }

    /// A sandbox whose "interpreter" is a shell script, so the stdio
    /// protocol and deadline enforcement run against a real child process.
    fn script_sandbox(script_body: &str) -> DenoSandbox {
        use std::os::unix::fs::PermissionsExt;
        let dir = std::env::temp_dir().join(format!("pubky-bot-sbx-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("fake-interpreter.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{script_body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = RuntimeConfig {
            deno_bin: script,
            deno_dir: None,
            ..RuntimeConfig::default()
        };
        DenoSandbox::new(&config).unwrap()
    }

    #[test]
    fn timeout_clamps_to_documented_bounds() {
        assert_eq!(effective_timeout_ms(None), 3000);
        assert_eq!(effective_timeout_ms(Some(1)), 100);
        assert_eq!(effective_timeout_ms(Some(500)), 500);
        assert_eq!(effective_timeout_ms(Some(999_999)), 20_000);
    }

    #[test]
    fn net_filtering_drops_wildcards_and_caps_at_five() {
        let hosts: Vec<String> = ["a.com", "*", "b.com", "", "*.evil.com", "c.com", "d.com", "e.com", "f.com"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let filtered = filter_net_hosts(&hosts);
        assert_eq!(filtered, ["a.com", "b.com", "c.com", "d.com", "e.com"]);
    }

    #[test]
    fn args_encode_the_capability_profile() {
        let entry = PathBuf::from("/tmp/bundles/x.ts");
        let bundle_dir = PathBuf::from("/tmp/bundles");
        let deno_dir = PathBuf::from("/home/bot/.cache/deno");

        let caps = SandboxCaps {
            timeout_ms: None,
            net: vec!["api.pubky.app".into()],
            has_npm: true,
        };
        let args = DenoSandbox::build_args(&entry, &caps, &bundle_dir, Some(&deno_dir));
        assert_eq!(args[0], "run");
        assert!(args.contains(&"--no-remote".to_string()));
        assert!(args.contains(&"--no-prompt".to_string()));
        assert!(args.contains(&"--allow-read=/tmp/bundles,/home/bot/.cache/deno".to_string()));
        assert!(args.contains(&"--allow-net=api.pubky.app".to_string()));
        assert_eq!(args.last().unwrap(), "/tmp/bundles/x.ts");
        // No write capability, ever.
        assert!(!args.iter().any(|a| a.contains("allow-write")));
        assert!(!args.iter().any(|a| a == "--allow-all" || a == "-A"));

        // Without npm the package cache stays unreadable; without hosts no
        // net flag is passed at all.
        let caps = SandboxCaps::default();
        let args = DenoSandbox::build_args(&entry, &caps, &bundle_dir, Some(&deno_dir));
        assert!(args.contains(&"--allow-read=/tmp/bundles".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--allow-net")));
    }

    #[tokio::test]
    async fn valid_json_stdout_is_returned() {
        let sandbox = script_sandbox(r#"cat > /dev/null; echo '{"kind":"reply","text":"hi"}'"#);
        let value = sandbox.run(&bundle(), &payload(), &SandboxCaps::default()).await.unwrap();
        assert_eq!(value.unwrap()["text"], "hi");
    }

    #[tokio::test]
    async fn child_receives_the_payload_on_stdin() {
        // The child echoes its stdin back; the payload must round-trip.
        let sandbox = script_sandbox("cat");
        let value = sandbox
            .run(&bundle(), &payload(), &SandboxCaps::default())
            .await
            .unwrap()
            .unwrap();
        let back: ExecPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload());
    }

    #[tokio::test]
    async fn empty_stdout_means_no_response() {
        let sandbox = script_sandbox("cat > /dev/null");
        let value = sandbox.run(&bundle(), &payload(), &SandboxCaps::default()).await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn garbage_stdout_is_invalid_json() {
        let sandbox = script_sandbox(r#"cat > /dev/null; echo 'not json'"#);
        let err = sandbox
            .run(&bundle(), &payload(), &SandboxCaps::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidJson(_)), "{err}");
        assert!(err.to_string().starts_with("invalid JSON:"));
    }

    #[tokio::test]
    async fn nonzero_exit_carries_code_and_stderr() {
        let sandbox = script_sandbox(r#"cat > /dev/null; echo 'boom' >&2; exit 3"#);
        let err = sandbox
            .run(&bundle(), &payload(), &SandboxCaps::default())
            .await
            .unwrap_err();
        match err {
            SandboxError::Exit { code, ref stderr } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected Exit, got {other}"),
        }
        assert_eq!(err.to_string(), "sandbox exit 3: boom");
    }

    #[tokio::test]
    async fn deadline_kills_a_stuck_child() {
        let sandbox = script_sandbox("sleep 30");
        let start = Instant::now();
        let err = sandbox
            .run(
                &bundle(),
                &payload(),
                &SandboxCaps {
                    timeout_ms: Some(200),
                    ..SandboxCaps::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { timeout_ms: 200 }), "{err}");
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "kill took too long: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_spawn_error() {
        let config = RuntimeConfig {
            deno_bin: PathBuf::from("/nonexistent/deno-binary"),
            ..RuntimeConfig::default()
        };
        let sandbox = DenoSandbox::new(&config).unwrap();
        let err = sandbox
            .run(&bundle(), &payload(), &SandboxCaps::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Spawn(_)), "{err}");
    }

    #[tokio::test]
    async fn bundle_file_is_materialized_once_and_reused() {
        let sandbox = script_sandbox("cat > /dev/null");
        let b = bundle();
        let path = sandbox.materialize(&b).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), b.code);

        // Rewrites are skipped: clobber the file and materialize again.
        std::fs::write(&path, "clobbered").unwrap();
        sandbox.materialize(&b).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "clobbered");

        sandbox.run(&b, &payload(), &SandboxCaps::default()).await.unwrap();
    }
}
