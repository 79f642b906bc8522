//! Test doubles and fixtures for runtime tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use pubky_bot_core::approval::{ApprovalQueue, WriteExecutor};
use pubky_bot_core::config::{ConfigTemplate, ServiceDecl, ServiceSource};
use pubky_bot_core::state::StateStore;
use pubky_bot_core::store::{PendingWrite, ServiceBundle, Store};
use pubky_bot_core::types::{ExecPayload, ServiceKind};

use crate::dispatch::Dispatcher;
use crate::sandbox::{Sandbox, SandboxCaps, SandboxResult};
use crate::snapshot::SnapshotBuilder;
use crate::source::ConfigSource;

/// A template with the given id and services.
pub fn template(id: &str, services: Vec<ServiceDecl>) -> ConfigTemplate {
    ConfigTemplate {
        id: id.to_string(),
        services,
    }
}

/// An inline-source service declaration. An empty command means "none"
/// (for listeners).
pub fn inline_service(command: &str, kind: ServiceKind, code: &str) -> ServiceDecl {
    ServiceDecl {
        id: None,
        command: (!command.is_empty()).then(|| command.to_string()),
        kind,
        source: ServiceSource::Inline {
            code: code.to_string(),
        },
        config: None,
        net: Vec::new(),
        datasets: BTreeMap::new(),
        description: None,
    }
}

/// In-memory config source over a fixed template set.
pub struct TestConfigSource {
    templates: HashMap<String, ConfigTemplate>,
}

impl TestConfigSource {
    pub fn new(templates: Vec<ConfigTemplate>) -> Self {
        Self {
            templates: templates.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }
}

impl ConfigSource for TestConfigSource {
    fn fetch(&self, id: &str) -> Result<ConfigTemplate, String> {
        self.templates
            .get(id)
            .cloned()
            .ok_or_else(|| format!("no template '{id}'"))
    }
}

/// One recorded sandbox invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub bundle_hash: String,
    pub payload: ExecPayload,
    pub caps: SandboxCaps,
}

/// Sandbox double: answers from a queued result list (empty queue means "no
/// response") and records every invocation. Clones share their queues.
#[derive(Clone, Default)]
pub struct MockSandbox {
    results: Arc<Mutex<VecDeque<SandboxResult>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl MockSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: SandboxResult) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn push_json(&self, value: Value) {
        self.push(Ok(Some(value)));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl Sandbox for MockSandbox {
    fn run<'a>(
        &'a self,
        bundle: &'a ServiceBundle,
        payload: &'a ExecPayload,
        caps: &'a SandboxCaps,
    ) -> Pin<Box<dyn Future<Output = SandboxResult> + Send + 'a>> {
        self.calls.lock().unwrap().push(RecordedCall {
            bundle_hash: bundle.bundle_hash.clone(),
            payload: payload.clone(),
            caps: caps.clone(),
        });
        let result = self
            .results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(None));
        Box::pin(async move { result })
    }
}

/// Executor that accepts every write without touching the network.
pub struct NoopExecutor;

impl WriteExecutor for NoopExecutor {
    fn execute<'a>(
        &'a self,
        _write: &'a PendingWrite,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}

/// A fully wired dispatcher over in-memory storage and the mock sandbox.
pub struct TestEnv {
    pub store: Arc<Store>,
    pub state: Arc<StateStore>,
    pub approvals: Arc<ApprovalQueue>,
    pub snapshots: Arc<SnapshotBuilder>,
    pub sandbox: MockSandbox,
    pub dispatcher: Dispatcher<MockSandbox>,
}

impl TestEnv {
    pub fn new(templates: Vec<ConfigTemplate>) -> Self {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let state = Arc::new(StateStore::new());
        let approvals = Arc::new(ApprovalQueue::new(
            Arc::clone(&store),
            Box::new(NoopExecutor),
            Duration::from_secs(3600),
        ));
        let snapshots = Arc::new(SnapshotBuilder::new(
            Arc::clone(&store),
            Box::new(TestConfigSource::new(templates)),
            "default",
        ));
        let sandbox = MockSandbox::new();
        let dispatcher = Dispatcher::new(
            Arc::clone(&snapshots),
            Arc::clone(&store),
            Arc::clone(&state),
            Arc::clone(&approvals),
            sandbox.clone(),
        );
        Self {
            store,
            state,
            approvals,
            snapshots,
            sandbox,
            dispatcher,
        }
    }
}
