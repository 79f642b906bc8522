//! Wire types shared between the dispatcher and the sandboxed services.
//!
//! Everything the sandbox sees on stdin is an [`ExecPayload`]; everything it
//! may print on stdout is a [`ServiceResponse`]. Services are untrusted, so
//! responses are parsed defensively: an unknown `kind` is an error, never a
//! panic, and all fields beyond `kind` and `state` are carried opaquely for
//! the chat adapter to render.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version of the stdin payload envelope.
pub const PAYLOAD_SCHEMA_VERSION: u32 = 1;

/// Version of the SDK surface inlined into bundles.
pub const SDK_SCHEMA_VERSION: u32 = 1;

// ── Incoming events ─────────────────────────────────────────────────────

/// An event handed to the dispatcher by the chat adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingEvent {
    /// A slash command, e.g. `/hello`. `token` is the raw token as typed
    /// (normalization happens in the dispatcher).
    Command {
        chat_id: String,
        user_id: String,
        token: String,
    },
    /// An inline-button callback. `data` carries `svc:<identifier>|<payload>`.
    Callback {
        chat_id: String,
        user_id: String,
        data: String,
    },
    /// A free-form message with no command prefix.
    Message {
        chat_id: String,
        user_id: String,
        message: Value,
    },
}

impl IncomingEvent {
    pub fn chat_id(&self) -> &str {
        match self {
            Self::Command { chat_id, .. }
            | Self::Callback { chat_id, .. }
            | Self::Message { chat_id, .. } => chat_id,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Self::Command { user_id, .. }
            | Self::Callback { user_id, .. }
            | Self::Message { user_id, .. } => user_id,
        }
    }
}

// ── Service kinds ───────────────────────────────────────────────────────

/// How a service participates in routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Responds to its command and is done.
    SingleShot,
    /// Owns a multi-step conversation: receives both its command and any
    /// uncommanded messages while its flow is active.
    MultiStep,
    /// Consulted for uncommanded messages when no flow is active.
    Listener,
}

// ── State directives ────────────────────────────────────────────────────

/// A state mutation requested by a service response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StateDirective {
    /// Drop the state record entirely.
    Clear,
    /// Replace the whole value.
    Replace { value: Value },
    /// Shallow top-level key override onto the existing value.
    Merge { value: Value },
}

// ── Execution payload (core → sandbox stdin) ────────────────────────────

/// The event half of the payload, mirroring the incoming event plus the
/// service's current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayloadEvent {
    #[serde(rename_all = "camelCase")]
    Command {
        token: String,
        state: Option<Value>,
        state_version: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Callback {
        data: String,
        state: Option<Value>,
        state_version: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Message {
        message: Value,
        state: Option<Value>,
        state_version: Option<u64>,
    },
}

/// Route and chat context handed to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadCtx {
    pub chat_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_meta: Option<RouteMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datasets: Option<Value>,
}

/// Display metadata for a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteMeta {
    pub id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A capability advertised to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub capability: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Value>,
}

/// Schema envelope so services can reject payloads they don't understand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<Capability>>,
}

impl Default for PayloadManifest {
    fn default() -> Self {
        Self {
            schema_version: PAYLOAD_SCHEMA_VERSION,
            capabilities: None,
        }
    }
}

/// The full stdin document: one of these per invocation, then EOF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecPayload {
    pub event: PayloadEvent,
    pub ctx: PayloadCtx,
    pub manifest: PayloadManifest,
}

// ── Service responses (sandbox stdout → core) ───────────────────────────

/// Discriminant of a service response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Reply,
    Edit,
    None,
    Error,
    Photo,
    Delete,
    Audio,
    Video,
    Document,
    Location,
    Contact,
    Ui,
    PubkyWrite,
}

impl ResponseKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reply" => Some(Self::Reply),
            "edit" => Some(Self::Edit),
            "none" => Some(Self::None),
            "error" => Some(Self::Error),
            "photo" => Some(Self::Photo),
            "delete" => Some(Self::Delete),
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            "document" => Some(Self::Document),
            "location" => Some(Self::Location),
            "contact" => Some(Self::Contact),
            "ui" => Some(Self::Ui),
            "pubky_write" => Some(Self::PubkyWrite),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reply => "reply",
            Self::Edit => "edit",
            Self::None => "none",
            Self::Error => "error",
            Self::Photo => "photo",
            Self::Delete => "delete",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Document => "document",
            Self::Location => "location",
            Self::Contact => "contact",
            Self::Ui => "ui",
            Self::PubkyWrite => "pubky_write",
        }
    }
}

/// A side-effecting write extracted from a `pubky_write` response, destined
/// for the approval queue rather than immediate execution.
#[derive(Debug, Clone, PartialEq)]
pub struct PubkyWriteRequest {
    pub path: String,
    pub data: Value,
    pub preview: Option<String>,
    pub on_approval: Option<Value>,
}

/// A parsed service response.
///
/// The dispatcher branches only on [`ResponseKind`] and the optional
/// [`StateDirective`]; `body` keeps the full original JSON document so all
/// other kinds travel to the chat adapter verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResponse {
    pub kind: ResponseKind,
    pub state: Option<StateDirective>,
    body: Value,
}

impl ServiceResponse {
    /// Parse a raw stdout document into a response.
    ///
    /// Fails on a missing or unknown `kind` and on a malformed `state`
    /// directive; untrusted output never gets the benefit of the doubt.
    pub fn from_value(value: Value) -> Result<Self, String> {
        let kind_str = value
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| "response is missing a string 'kind' field".to_string())?;
        let kind = ResponseKind::parse(kind_str)
            .ok_or_else(|| format!("unknown response kind '{kind_str}'"))?;
        let state = match value.get("state") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                serde_json::from_value::<StateDirective>(raw.clone())
                    .map_err(|e| format!("invalid state directive: {e}"))?,
            ),
        };
        Ok(Self {
            kind,
            state,
            body: value,
        })
    }

    /// Build a plain text reply.
    pub fn reply(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            kind: ResponseKind::Reply,
            state: None,
            body: serde_json::json!({ "kind": "reply", "text": text }),
        }
    }

    /// The empty response: the adapter renders nothing.
    pub fn none() -> Self {
        Self {
            kind: ResponseKind::None,
            state: None,
            body: serde_json::json!({ "kind": "none" }),
        }
    }

    /// Build an error response carrying a user-visible message.
    pub fn error(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            kind: ResponseKind::Error,
            state: None,
            body: serde_json::json!({ "kind": "error", "text": text }),
        }
    }

    pub fn is_none(&self) -> bool {
        self.kind == ResponseKind::None
    }

    /// The full response document, as the service emitted it.
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// A convenience accessor for the `text` field, where present.
    pub fn text(&self) -> Option<&str> {
        self.body.get("text").and_then(Value::as_str)
    }

    /// Extract the write request from a `pubky_write` response.
    ///
    /// Returns an error for a `pubky_write` body without a string `path` or
    /// without `data`; returns `Ok(None)` for any other kind.
    pub fn as_pubky_write(&self) -> Result<Option<PubkyWriteRequest>, String> {
        if self.kind != ResponseKind::PubkyWrite {
            return Ok(None);
        }
        let path = self
            .body
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| "pubky_write response is missing a string 'path'".to_string())?;
        let data = self
            .body
            .get("data")
            .cloned()
            .ok_or_else(|| "pubky_write response is missing 'data'".to_string())?;
        Ok(Some(PubkyWriteRequest {
            path: path.to_string(),
            data,
            preview: self
                .body
                .get("preview")
                .and_then(Value::as_str)
                .map(str::to_string),
            on_approval: self.body.get("onApproval").cloned(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_event_serializes_with_wire_field_names() {
        let event = PayloadEvent::Command {
            token: "hello".into(),
            state: Some(json!({"step": 1})),
            state_version: Some(3),
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "command");
        assert_eq!(v["token"], "hello");
        assert_eq!(v["stateVersion"], 3);
    }

    #[test]
    fn exec_payload_round_trips() {
        let payload = ExecPayload {
            event: PayloadEvent::Message {
                message: json!({"text": "hi"}),
                state: None,
                state_version: None,
            },
            ctx: PayloadCtx {
                chat_id: "c1".into(),
                user_id: "u1".into(),
                service_config: Some(json!({"greeting": "yo"})),
                route_meta: Some(RouteMeta {
                    id: "mock_hello".into(),
                    command: "hello".into(),
                    description: None,
                }),
                datasets: None,
            },
            manifest: PayloadManifest::default(),
        };
        let text = serde_json::to_string(&payload).unwrap();
        let back: ExecPayload = serde_json::from_str(&text).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn response_parses_kind_and_state() {
        let resp = ServiceResponse::from_value(json!({
            "kind": "reply",
            "text": "step1",
            "state": {"op": "replace", "value": {"step": 1}}
        }))
        .unwrap();
        assert_eq!(resp.kind, ResponseKind::Reply);
        assert_eq!(
            resp.state,
            Some(StateDirective::Replace {
                value: json!({"step": 1})
            })
        );
        assert_eq!(resp.text(), Some("step1"));
    }

    #[test]
    fn response_rejects_unknown_kind() {
        let err = ServiceResponse::from_value(json!({"kind": "launch_missiles"})).unwrap_err();
        assert!(err.contains("unknown response kind"), "{err}");
    }

    #[test]
    fn response_rejects_missing_kind() {
        assert!(ServiceResponse::from_value(json!({"text": "hi"})).is_err());
    }

    #[test]
    fn response_rejects_malformed_state_directive() {
        let err = ServiceResponse::from_value(json!({
            "kind": "reply",
            "text": "x",
            "state": {"op": "explode"}
        }))
        .unwrap_err();
        assert!(err.contains("invalid state directive"), "{err}");
    }

    #[test]
    fn null_state_is_treated_as_absent() {
        let resp =
            ServiceResponse::from_value(json!({"kind": "reply", "text": "x", "state": null}))
                .unwrap();
        assert!(resp.state.is_none());
    }

    #[test]
    fn pubky_write_extraction() {
        let resp = ServiceResponse::from_value(json!({
            "kind": "pubky_write",
            "path": "/pub/x",
            "data": {"a": 1},
            "preview": "write a=1"
        }))
        .unwrap();
        let write = resp.as_pubky_write().unwrap().unwrap();
        assert_eq!(write.path, "/pub/x");
        assert_eq!(write.data, json!({"a": 1}));
        assert_eq!(write.preview.as_deref(), Some("write a=1"));

        // Non-write kinds extract to None.
        let reply = ServiceResponse::reply("hi");
        assert_eq!(reply.as_pubky_write().unwrap(), None);

        // A write without a path is malformed.
        let bad = ServiceResponse::from_value(json!({"kind": "pubky_write", "data": 1})).unwrap();
        assert!(bad.as_pubky_write().is_err());
    }

    #[test]
    fn every_documented_kind_parses() {
        for kind in [
            "reply", "edit", "none", "error", "photo", "delete", "audio", "video", "document",
            "location", "contact", "ui", "pubky_write",
        ] {
            let parsed = ResponseKind::parse(kind).unwrap();
            assert_eq!(parsed.as_str(), kind);
        }
    }
}
