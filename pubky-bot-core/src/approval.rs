//! Human-approval workflow for side-effecting homeserver writes.
//!
//! Services never write directly: a `pubky_write` response is parked here as
//! a durable [`PendingWrite`] until an admin approves or rejects it, or it
//! expires. The execute step runs inline with the approval, through the
//! [`WriteExecutor`] seam, and the record always lands in a terminal state
//! (`written`, `failed`, `rejected` or `expired`) before anyone is notified.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use crate::store::{PendingWrite, Store, WriteStatus};
use crate::types::PubkyWriteRequest;

/// What a service asks to write, before it becomes a durable record.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub path: String,
    pub data: Value,
    pub preview: Option<String>,
    pub service_id: String,
    pub chat_id: String,
    pub user_id: String,
    pub on_approval: Option<Value>,
    /// Time until the request expires undecided; the queue default applies
    /// when absent.
    pub ttl: Option<Duration>,
}

impl WriteRequest {
    /// Build a request from a `pubky_write` response plus its dispatch
    /// context.
    pub fn from_response(
        write: PubkyWriteRequest,
        service_id: &str,
        chat_id: &str,
        user_id: &str,
    ) -> Self {
        Self {
            path: write.path,
            data: write.data,
            preview: write.preview,
            service_id: service_id.to_string(),
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            on_approval: write.on_approval,
            ttl: None,
        }
    }
}

/// Outcome reported back to the deciding admin.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub success: bool,
    pub message: String,
}

impl Decision {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Executes an approved write against the external storage network.
pub trait WriteExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        write: &'a PendingWrite,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;
}

/// Default executor: HTTP PUT of the payload to `<base><path>`.
pub struct HomeserverExecutor {
    base: String,
    client: reqwest::Client,
}

impl HomeserverExecutor {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

impl WriteExecutor for HomeserverExecutor {
    fn execute<'a>(
        &'a self,
        write: &'a PendingWrite,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!("{}{}", self.base, write.path);
            let response = self
                .client
                .put(&url)
                .json(&write.data)
                .send()
                .await
                .map_err(|e| format!("homeserver request failed: {e}"))?;
            if !response.status().is_success() {
                return Err(format!("homeserver returned {}", response.status()));
            }
            Ok(())
        })
    }
}

/// The durable approve/reject/expire queue.
pub struct ApprovalQueue {
    store: Arc<Store>,
    executor: Box<dyn WriteExecutor>,
    default_ttl: Duration,
}

impl ApprovalQueue {
    pub fn new(store: Arc<Store>, executor: Box<dyn WriteExecutor>, default_ttl: Duration) -> Self {
        Self {
            store,
            executor,
            default_ttl,
        }
    }

    /// Persist a new pending record and return it. The returned id is the
    /// only token admins can act on; handing the preview to the
    /// admin-notification collaborator is the caller's concern.
    pub fn enqueue(&self, request: WriteRequest) -> Result<PendingWrite, String> {
        let now = Utc::now();
        let ttl = request.ttl.unwrap_or(self.default_ttl);
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| format!("approval ttl out of range: {e}"))?;
        let write = PendingWrite {
            id: uuid::Uuid::new_v4().to_string(),
            path: request.path,
            data: request.data,
            preview: request.preview,
            service_id: request.service_id,
            user_id: request.user_id,
            chat_id: request.chat_id,
            created_at: now,
            expires_at: now + ttl,
            status: WriteStatus::Pending,
            on_approval: request.on_approval,
            admin_message_id: None,
            approved_by: None,
            approved_at: None,
            error: None,
        };
        self.store.insert_pending_write(&write)?;
        log::info!(
            "queued write {} to {} from service {} (chat {})",
            write.id,
            write.path,
            write.service_id,
            write.chat_id
        );
        Ok(write)
    }

    /// Approve a pending write and execute it inline. The record advances to
    /// `written` or `failed` before this returns; `approved` is never left
    /// behind as a resting state.
    pub async fn approve(&self, id: &str, approver: &str) -> Decision {
        let moved = match self.store.transition_write(
            id,
            WriteStatus::Pending,
            WriteStatus::Approved,
            Some(approver),
            None,
        ) {
            Ok(moved) => moved,
            Err(e) => {
                log::error!("approve {id}: storage fault: {e}");
                return Decision::fail(format!("storage error: {e}"));
            }
        };
        if !moved {
            return self.already(id);
        }

        let write = match self.store.get_pending_write(id) {
            Ok(Some(write)) => write,
            Ok(None) => return Decision::fail(format!("unknown write {id}")),
            Err(e) => return Decision::fail(format!("storage error: {e}")),
        };

        match self.executor.execute(&write).await {
            Ok(()) => {
                if let Err(e) = self.store.transition_write(
                    id,
                    WriteStatus::Approved,
                    WriteStatus::Written,
                    None,
                    None,
                ) {
                    log::error!("approve {id}: executed but could not persist 'written': {e}");
                    return Decision::fail(format!("storage error: {e}"));
                }
                log::info!("write {id} approved by {approver} and executed");
                Decision::ok("written")
            }
            Err(err) => {
                if let Err(e) = self.store.transition_write(
                    id,
                    WriteStatus::Approved,
                    WriteStatus::Failed,
                    None,
                    Some(&err),
                ) {
                    log::error!("approve {id}: execute failed and so did persistence: {e}");
                }
                log::warn!("write {id} approved by {approver} but execution failed: {err}");
                Decision::fail(format!("write failed: {err}"))
            }
        }
    }

    /// Reject a pending write.
    pub fn reject(&self, id: &str, approver: &str) -> Decision {
        match self.store.transition_write(
            id,
            WriteStatus::Pending,
            WriteStatus::Rejected,
            Some(approver),
            None,
        ) {
            Ok(true) => {
                log::info!("write {id} rejected by {approver}");
                Decision::ok("rejected")
            }
            Ok(false) => self.already(id),
            Err(e) => Decision::fail(format!("storage error: {e}")),
        }
    }

    /// Promote overdue pending records to `expired`. Returns how many moved.
    pub fn expired_sweep(&self) -> Result<usize, String> {
        let expired = self.store.expire_pending_writes(Utc::now())?;
        if expired > 0 {
            log::info!("expired {expired} undecided write(s)");
        }
        Ok(expired)
    }

    pub fn get(&self, id: &str) -> Result<Option<PendingWrite>, String> {
        self.store.get_pending_write(id)
    }

    pub fn list_pending(&self, chat_id: Option<&str>) -> Result<Vec<PendingWrite>, String> {
        self.store.list_pending_writes(chat_id)
    }

    /// The "already <status>" refusal for a record no longer pending.
    fn already(&self, id: &str) -> Decision {
        match self.store.get_pending_write(id) {
            Ok(Some(write)) => Decision::fail(format!("already {}", write.status.as_str())),
            Ok(None) => Decision::fail(format!("unknown write {id}")),
            Err(e) => Decision::fail(format!("storage error: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Executor that records what it was asked to write.
    struct RecordingExecutor {
        executed: Arc<Mutex<Vec<String>>>,
        fail_with: Option<String>,
    }

    impl RecordingExecutor {
        fn ok() -> Self {
            Self {
                executed: Arc::new(Mutex::new(Vec::new())),
                fail_with: None,
            }
        }

        fn failing(msg: &str) -> Self {
            Self {
                executed: Arc::new(Mutex::new(Vec::new())),
                fail_with: Some(msg.to_string()),
            }
        }
    }

    impl WriteExecutor for RecordingExecutor {
        fn execute<'a>(
            &'a self,
            write: &'a PendingWrite,
        ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>> {
            Box::pin(async move {
                self.executed.lock().unwrap().push(write.path.clone());
                match &self.fail_with {
                    Some(msg) => Err(msg.clone()),
                    None => Ok(()),
                }
            })
        }
    }

    fn request(ttl: Option<Duration>) -> WriteRequest {
        WriteRequest {
            path: "/pub/x".into(),
            data: json!({"a": 1}),
            preview: Some("write a=1".into()),
            service_id: "svc".into(),
            chat_id: "c1".into(),
            user_id: "u1".into(),
            on_approval: None,
            ttl,
        }
    }

    fn queue(executor: Box<dyn WriteExecutor>) -> ApprovalQueue {
        let store = Arc::new(Store::open_in_memory().unwrap());
        ApprovalQueue::new(store, executor, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn approve_executes_and_lands_on_written() {
        let q = queue(Box::new(RecordingExecutor::ok()));
        let write = q.enqueue(request(None)).unwrap();

        let decision = q.approve(&write.id, "adminA").await;
        assert!(decision.success, "{}", decision.message);

        let record = q.get(&write.id).unwrap().unwrap();
        assert_eq!(record.status, WriteStatus::Written);
        assert_eq!(record.approved_by.as_deref(), Some("adminA"));
    }

    #[tokio::test]
    async fn approve_with_failing_executor_lands_on_failed() {
        let q = queue(Box::new(RecordingExecutor::failing("homeserver down")));
        let write = q.enqueue(request(None)).unwrap();

        let decision = q.approve(&write.id, "adminA").await;
        assert!(!decision.success);
        assert!(decision.message.contains("homeserver down"), "{}", decision.message);

        let record = q.get(&write.id).unwrap().unwrap();
        assert_eq!(record.status, WriteStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("homeserver down"));
    }

    #[tokio::test]
    async fn double_decision_is_refused_with_current_status() {
        let q = queue(Box::new(RecordingExecutor::ok()));
        let write = q.enqueue(request(None)).unwrap();

        assert!(q.approve(&write.id, "adminA").await.success);
        let second = q.approve(&write.id, "adminB").await;
        assert!(!second.success);
        assert_eq!(second.message, "already written");

        let rejected = q.reject(&write.id, "adminB");
        assert!(!rejected.success);
        assert_eq!(rejected.message, "already written");
    }

    #[tokio::test]
    async fn reject_is_terminal() {
        let q = queue(Box::new(RecordingExecutor::ok()));
        let write = q.enqueue(request(None)).unwrap();

        assert!(q.reject(&write.id, "adminA").success);
        let record = q.get(&write.id).unwrap().unwrap();
        assert_eq!(record.status, WriteStatus::Rejected);

        let late = q.approve(&write.id, "adminB").await;
        assert!(!late.success);
        assert_eq!(late.message, "already rejected");
    }

    #[tokio::test]
    async fn expiry_then_approve_reports_already_expired() {
        let q = queue(Box::new(RecordingExecutor::ok()));
        let write = q.enqueue(request(Some(Duration::ZERO))).unwrap();

        assert_eq!(q.expired_sweep().unwrap(), 1);
        let decision = q.approve(&write.id, "adminA").await;
        assert!(!decision.success);
        assert_eq!(decision.message, "already expired");
    }

    #[tokio::test]
    async fn unknown_id_is_reported_as_unknown() {
        let q = queue(Box::new(RecordingExecutor::ok()));
        let decision = q.approve("nope", "adminA").await;
        assert!(!decision.success);
        assert!(decision.message.contains("unknown write"), "{}", decision.message);
    }

    #[tokio::test]
    async fn executor_runs_exactly_once_per_record() {
        let executor = RecordingExecutor::ok();
        let executed = Arc::clone(&executor.executed);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let q = ApprovalQueue::new(store, Box::new(executor), Duration::from_secs(10));

        let write = q.enqueue(request(None)).unwrap();
        assert!(q.approve(&write.id, "a").await.success);
        // Re-approval does not re-execute: the guard refuses first.
        assert!(!q.approve(&write.id, "a").await.success);

        assert_eq!(executed.lock().unwrap().as_slice(), ["/pub/x"]);
    }
}
