//! Event dispatch: route selection, payload assembly, sandbox invocation,
//! and state-directive application.
//!
//! The dispatcher is pure data-flow. It never calls service code directly;
//! polymorphism lives entirely behind the subprocess boundary. A sandbox
//! failure never mutates state, state writes land before the response is
//! returned, and approval-typed responses are diverted into the queue
//! instead of acting immediately.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use pubky_bot_core::approval::{ApprovalQueue, WriteRequest};
use pubky_bot_core::state::{ServiceKey, StateRecord, StateStore};
use pubky_bot_core::store::Store;
use pubky_bot_core::types::{
    ExecPayload, IncomingEvent, PayloadCtx, PayloadEvent, PayloadManifest, ResponseKind,
    RouteMeta, ServiceKind, ServiceResponse, StateDirective,
};

use crate::sandbox::{Sandbox, SandboxCaps};
use crate::snapshot::{CommandRoute, ListenerRoute, SnapshotBuilder};

/// Deadline for command and callback invocations, and for messages routed
/// into an active flow.
pub const COMMAND_TIMEOUT_MS: u64 = 2000;

/// Deadline for each listener probe.
pub const LISTENER_TIMEOUT_MS: u64 = 1000;

const CALLBACK_PREFIX: &str = "svc:";

/// Normalize a raw command token: drop the leading slash and any
/// `@botname` suffix, lowercase the rest.
pub fn normalize_token(raw: &str) -> String {
    let token = raw.trim();
    let token = token.strip_prefix('/').unwrap_or(token);
    let token = token.split('@').next().unwrap_or(token);
    token.to_lowercase()
}

/// Route fields the invocation path needs, borrowed from either route shape.
struct RouteRef<'a> {
    service_id: &'a str,
    kind: ServiceKind,
    bundle_hash: &'a str,
    config: Option<&'a Value>,
    meta: &'a RouteMeta,
    datasets: &'a BTreeMap<String, Value>,
    net: &'a [String],
}

impl<'a> RouteRef<'a> {
    fn command(route: &'a CommandRoute) -> Self {
        Self {
            service_id: &route.service_id,
            kind: route.kind,
            bundle_hash: &route.bundle_hash,
            config: route.config.as_ref(),
            meta: &route.meta,
            datasets: &route.datasets,
            net: &route.net,
        }
    }

    fn listener(route: &'a ListenerRoute) -> Self {
        Self {
            service_id: &route.service_id,
            kind: ServiceKind::Listener,
            bundle_hash: &route.bundle_hash,
            config: route.config.as_ref(),
            meta: &route.meta,
            datasets: &route.datasets,
            net: &route.net,
        }
    }
}

/// Routes incoming events into sandboxed service invocations.
pub struct Dispatcher<S> {
    snapshots: Arc<SnapshotBuilder>,
    store: Arc<Store>,
    state: Arc<StateStore>,
    approvals: Arc<ApprovalQueue>,
    sandbox: S,
}

impl<S: Sandbox> Dispatcher<S> {
    pub fn new(
        snapshots: Arc<SnapshotBuilder>,
        store: Arc<Store>,
        state: Arc<StateStore>,
        approvals: Arc<ApprovalQueue>,
        sandbox: S,
    ) -> Self {
        Self {
            snapshots,
            store,
            state,
            approvals,
            sandbox,
        }
    }

    /// Dispatch one event. `None` is a routing miss (nothing to render);
    /// infrastructure faults surface as error responses, never as panics.
    pub async fn dispatch(&self, event: &IncomingEvent) -> Option<ServiceResponse> {
        let result = match event {
            IncomingEvent::Command {
                chat_id,
                user_id,
                token,
            } => self.dispatch_command(chat_id, user_id, token).await,
            IncomingEvent::Callback {
                chat_id,
                user_id,
                data,
            } => self.dispatch_callback(chat_id, user_id, data).await,
            IncomingEvent::Message {
                chat_id,
                user_id,
                message,
            } => self.dispatch_message(chat_id, user_id, message).await,
        };
        match result {
            Ok(response) => response,
            Err(e) => {
                log::error!("dispatch failed for chat {}: {e}", event.chat_id());
                Some(ServiceResponse::error(format!("internal error: {e}")))
            }
        }
    }

    // ── Command path ────────────────────────────────────────────────────

    async fn dispatch_command(
        &self,
        chat_id: &str,
        user_id: &str,
        raw_token: &str,
    ) -> Result<Option<ServiceResponse>, String> {
        let snapshot = self.snapshots.build(chat_id, false)?;
        let token = normalize_token(raw_token);
        let Some(route) = snapshot.commands.get(&token) else {
            log::debug!("unknown command '{token}' in chat {chat_id}");
            return Ok(None);
        };
        let response = self
            .invoke(chat_id, user_id, &RouteRef::command(route), COMMAND_TIMEOUT_MS, {
                let token = token.clone();
                move |state| PayloadEvent::Command {
                    token,
                    state: state.map(|r| r.value.clone()),
                    state_version: state.map(|r| r.version),
                }
            })
            .await?;
        Ok(Some(response))
    }

    // ── Callback path ───────────────────────────────────────────────────

    /// Callback data carries `svc:<identifier>|<payload>`. The identifier
    /// resolves as a command token first (tokens are stable across
    /// redeploys), then as a service id.
    async fn dispatch_callback(
        &self,
        chat_id: &str,
        user_id: &str,
        data: &str,
    ) -> Result<Option<ServiceResponse>, String> {
        let Some(rest) = data.strip_prefix(CALLBACK_PREFIX) else {
            log::warn!("callback without '{CALLBACK_PREFIX}' prefix in chat {chat_id}");
            return Ok(None);
        };
        let Some((identifier, tail)) = rest.split_once('|') else {
            log::warn!("callback without payload separator in chat {chat_id}");
            return Ok(None);
        };

        let snapshot = self.snapshots.build(chat_id, false)?;
        let route = snapshot
            .commands
            .get(&normalize_token(identifier))
            .or_else(|| snapshot.commands.values().find(|r| r.service_id == identifier));
        let Some(route) = route else {
            log::debug!("callback identifier '{identifier}' resolved nothing in chat {chat_id}");
            return Ok(None);
        };

        let tail = tail.to_string();
        let response = self
            .invoke(chat_id, user_id, &RouteRef::command(route), COMMAND_TIMEOUT_MS, move |state| {
                PayloadEvent::Callback {
                    data: tail,
                    state: state.map(|r| r.value.clone()),
                    state_version: state.map(|r| r.version),
                }
            })
            .await?;
        Ok(Some(response))
    }

    // ── Message path ────────────────────────────────────────────────────

    async fn dispatch_message(
        &self,
        chat_id: &str,
        user_id: &str,
        message: &Value,
    ) -> Result<Option<ServiceResponse>, String> {
        let snapshot = self.snapshots.build(chat_id, false)?;

        // An active multi-step flow owns every uncommanded message.
        if let Some(service_id) = self.state.active_flow(chat_id, user_id) {
            if let Some(route) = snapshot
                .commands
                .values()
                .find(|r| r.service_id == service_id && r.kind == ServiceKind::MultiStep)
            {
                let message = message.clone();
                let response = self
                    .invoke(chat_id, user_id, &RouteRef::command(route), COMMAND_TIMEOUT_MS, move |state| {
                        PayloadEvent::Message {
                            message,
                            state: state.map(|r| r.value.clone()),
                            state_version: state.map(|r| r.version),
                        }
                    })
                    .await?;
                return Ok(Some(response));
            }
            log::debug!(
                "active flow '{service_id}' no longer resolves in chat {chat_id}; trying listeners"
            );
        }

        // Listener probing: in declared order, first non-empty response
        // wins. Failures are logged and skipped, never aborting the chain.
        for route in &snapshot.listeners {
            let message = message.clone();
            let result = self
                .invoke(chat_id, user_id, &RouteRef::listener(route), LISTENER_TIMEOUT_MS, move |state| {
                    PayloadEvent::Message {
                        message,
                        state: state.map(|r| r.value.clone()),
                        state_version: state.map(|r| r.version),
                    }
                })
                .await;
            match result {
                Ok(response) if response.is_none() => continue,
                Ok(response) if response.kind == ResponseKind::Error => {
                    log::warn!(
                        "listener '{}' failed in chat {chat_id}: {}",
                        route.service_id,
                        response.text().unwrap_or("unknown error")
                    );
                    continue;
                }
                Ok(response) => return Ok(Some(response)),
                Err(e) => {
                    log::warn!("listener '{}' faulted in chat {chat_id}: {e}", route.service_id);
                    continue;
                }
            }
        }
        Ok(None)
    }

    // ── Shared invocation path ──────────────────────────────────────────

    /// Load state, assemble the payload, run the sandbox, apply any state
    /// directive, update the active-flow pointer, divert approval-typed
    /// responses. Returns the response to render; sandbox and service
    /// faults come back as error responses with no state mutation.
    async fn invoke(
        &self,
        chat_id: &str,
        user_id: &str,
        route: &RouteRef<'_>,
        timeout_ms: u64,
        make_event: impl FnOnce(Option<&StateRecord>) -> PayloadEvent,
    ) -> Result<ServiceResponse, String> {
        let key = ServiceKey::new(chat_id, user_id, route.service_id);
        let prior = self.state.get(&key);

        let payload = ExecPayload {
            event: make_event(prior.as_ref()),
            ctx: PayloadCtx {
                chat_id: chat_id.to_string(),
                user_id: user_id.to_string(),
                service_config: route.config.cloned(),
                route_meta: Some(route.meta.clone()),
                datasets: if route.datasets.is_empty() {
                    None
                } else {
                    Some(
                        serde_json::to_value(route.datasets)
                            .map_err(|e| format!("dataset serialization failed: {e}"))?,
                    )
                },
            },
            manifest: PayloadManifest::default(),
        };

        let Some(bundle) = self.store.get_bundle(route.bundle_hash)? else {
            log::error!(
                "snapshot references missing bundle {} (service '{}')",
                route.bundle_hash,
                route.service_id
            );
            return Ok(ServiceResponse::error(
                "service bundle is missing; it will be rebuilt shortly",
            ));
        };

        let caps = SandboxCaps {
            timeout_ms: Some(timeout_ms),
            net: route.net.to_vec(),
            has_npm: bundle.has_npm,
        };

        let value = match self.sandbox.run(&bundle, &payload, &caps).await {
            Ok(value) => value,
            Err(e) => {
                log::warn!("sandbox failure for service '{}': {e}", route.service_id);
                return Ok(ServiceResponse::error(e.to_string()));
            }
        };

        let response = match value {
            None => None,
            Some(raw) => match ServiceResponse::from_value(raw) {
                Ok(response) => Some(response),
                Err(e) => {
                    log::warn!("unusable response from service '{}': {e}", route.service_id);
                    return Ok(ServiceResponse::error(format!("invalid service response: {e}")));
                }
            },
        };

        self.apply_state(&key, route.kind, prior.as_ref(), response.as_ref());

        if let Some(response) = &response {
            if response.kind == ResponseKind::PubkyWrite {
                return self.queue_write(response, route.service_id, chat_id, user_id);
            }
        }
        Ok(response.unwrap_or_else(ServiceResponse::none))
    }

    /// Apply the response's state directive, then maintain the active-flow
    /// pointer for multi-step routes: `clear` drops it, any other directive
    /// sets it, and no directive atop pre-existing state re-asserts it.
    fn apply_state(
        &self,
        key: &ServiceKey,
        kind: ServiceKind,
        prior: Option<&StateRecord>,
        response: Option<&ServiceResponse>,
    ) {
        let directive = response.and_then(|r| r.state.as_ref());
        if let Some(directive) = directive {
            self.state.apply(key, directive);
        }
        if kind == ServiceKind::MultiStep {
            match directive {
                Some(StateDirective::Clear) => {
                    self.state.clear_active_flow(&key.chat_id, &key.user_id);
                }
                Some(_) => {
                    self.state
                        .set_active_flow(&key.chat_id, &key.user_id, &key.service_id);
                }
                None => {
                    if prior.is_some() {
                        self.state
                            .set_active_flow(&key.chat_id, &key.user_id, &key.service_id);
                    }
                }
            }
        }
    }

    /// Park a `pubky_write` response in the approval queue and acknowledge
    /// with the pending id instead of acting on it.
    fn queue_write(
        &self,
        response: &ServiceResponse,
        service_id: &str,
        chat_id: &str,
        user_id: &str,
    ) -> Result<ServiceResponse, String> {
        let write = match response.as_pubky_write() {
            Ok(Some(write)) => write,
            Ok(None) => return Ok(ServiceResponse::error("not a pubky_write response")),
            Err(e) => {
                log::warn!("service '{service_id}' emitted a malformed write: {e}");
                return Ok(ServiceResponse::error(format!("malformed pubky_write: {e}")));
            }
        };
        let record = self
            .approvals
            .enqueue(WriteRequest::from_response(write, service_id, chat_id, user_id))?;
        Ok(ServiceResponse::reply(format!(
            "Write to {} is awaiting approval (request {}).",
            record.path, record.id
        )))
    }
}
