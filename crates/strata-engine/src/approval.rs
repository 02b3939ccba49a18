use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use strata_core::error::{Result, StrataError};
use strata_core::tenant::tenant_scope;
use strata_core::traits::ExecutionStore;
use strata_core::types::*;

use crate::stream::StreamManager;

/// Decided requests kept in memory when no store is attached.
const DEFAULT_DECIDED_LIMIT: usize = 1000;

/// `(tenant scope, request id)`
type RequestKey = (String, String);

#[derive(Default)]
struct Requests {
    entries: HashMap<RequestKey, ApprovalRequest>,
    decided: VecDeque<RequestKey>,
}

/// Tracks approval requests and resolves each exactly once.
///
/// Requests are partitioned by the current tenant. When a store is attached
/// they are written through to the tenant's `approval_requests` table and
/// only pending ones stay in memory; without a store the most recent
/// decisions are retained up to a bound.
pub struct ApprovalBroker {
    requests: Mutex<Requests>,
    store: Option<Arc<dyn ExecutionStore>>,
    streams: Arc<StreamManager>,
    decided_limit: usize,
}

impl ApprovalBroker {
    pub fn new(streams: Arc<StreamManager>) -> Self {
        Self {
            requests: Mutex::new(Requests::default()),
            store: None,
            streams,
            decided_limit: DEFAULT_DECIDED_LIMIT,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_decided_limit(mut self, limit: usize) -> Self {
        self.decided_limit = limit;
        self
    }

    async fn persist(&self, request: &ApprovalRequest) -> Result<()> {
        if let Some(store) = &self.store {
            store.save_approval(request.clone()).await?;
        }
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<ApprovalRequest>> {
        match &self.store {
            Some(store) => store.load_approval(id.to_string()).await,
            None => Ok(None),
        }
    }

    /// Store a request under its key. Decided requests leave memory once the
    /// store holds them, or age out past `decided_limit` without one.
    fn retain(&self, requests: &mut Requests, key: RequestKey, request: ApprovalRequest) {
        if request.status == ApprovalStatus::Pending {
            requests.entries.insert(key, request);
            return;
        }
        if self.store.is_some() {
            requests.entries.remove(&key);
            return;
        }
        requests.entries.insert(key.clone(), request);
        requests.decided.retain(|k| *k != key);
        requests.decided.push_back(key);
        while requests.decided.len() > self.decided_limit {
            if let Some(old) = requests.decided.pop_front() {
                requests.entries.remove(&old);
            }
        }
    }

    async fn find_for_step(&self, execution_id: &str, step_id: &str) -> Result<Option<ApprovalRequest>> {
        let scope = tenant_scope();
        let found = self
            .requests
            .lock()
            .await
            .entries
            .iter()
            .find(|((s, _), r)| {
                *s == scope && r.execution_id == execution_id && r.step_id == step_id
            })
            .map(|(_, r)| r.clone());
        if found.is_some() {
            return Ok(found);
        }
        if let Some(store) = &self.store {
            let stored = store.list_approvals(None).await?;
            return Ok(stored
                .into_iter()
                .find(|r| r.execution_id == execution_id && r.step_id == step_id));
        }
        Ok(None)
    }

    /// Create the request for a step, or return the one that already exists.
    pub async fn open(
        &self,
        workflow_id: &str,
        execution_id: &str,
        step_id: &str,
        prompt: &str,
        backend: ApprovalBackend,
        metadata: Value,
    ) -> Result<ApprovalRequest> {
        if let Some(existing) = self.find_for_step(execution_id, step_id).await? {
            let mut requests = self.requests.lock().await;
            self.retain(&mut requests, (tenant_scope(), existing.id.clone()), existing.clone());
            return Ok(existing);
        }

        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            execution_id: execution_id.to_string(),
            step_id: step_id.to_string(),
            status: ApprovalStatus::Pending,
            prompt: prompt.to_string(),
            backend,
            metadata,
            response_payload: None,
            comment: None,
            requested_at: Utc::now(),
            decided_at: None,
            decided_by: None,
        };
        self.persist(&request).await?;
        self.requests
            .lock()
            .await
            .entries
            .insert((tenant_scope(), request.id.clone()), request.clone());

        info!(
            approval_id = %request.id,
            execution_id,
            step_id,
            backend = %backend,
            "Approval requested"
        );
        self.streams.publish(StreamEvent::new(
            StreamEventType::Step,
            execution_id,
            Some(workflow_id.to_string()),
            json!({
                "step_id": step_id,
                "status": "waiting",
                "approval_request_id": request.id,
                "prompt": prompt,
            }),
        ));
        Ok(request)
    }

    /// Look up a request of the current tenant in memory, then in the store.
    pub async fn get(&self, id: &str) -> Result<Option<ApprovalRequest>> {
        let key = (tenant_scope(), id.to_string());
        if let Some(request) = self.requests.lock().await.entries.get(&key).cloned() {
            return Ok(Some(request));
        }
        self.load(id).await
    }

    /// Record a decision. Fails if the request is unknown or already decided.
    ///
    /// The broker lock is held through the store write, so two racing
    /// deciders cannot both win.
    pub async fn resolve(
        &self,
        id: &str,
        decision: ApprovalDecision,
        approved: bool,
    ) -> Result<ApprovalRequest> {
        let key = (tenant_scope(), id.to_string());
        let mut requests = self.requests.lock().await;
        let mut request = match requests.entries.get(&key).cloned() {
            Some(request) => request,
            None => self
                .load(id)
                .await?
                .ok_or_else(|| StrataError::ApprovalNotFound(id.to_string()))?,
        };
        if request.status != ApprovalStatus::Pending {
            return Err(StrataError::ApprovalAlreadyDecided {
                id: id.to_string(),
                status: request.status.to_string(),
            });
        }

        request.status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };
        request.decided_by = Some(decision.decided_by);
        request.decided_at = Some(Utc::now());
        request.response_payload = decision.payload;
        request.comment = decision.comment;

        self.persist(&request).await?;
        self.retain(&mut requests, key, request.clone());
        drop(requests);

        info!(
            approval_id = %id,
            execution_id = %request.execution_id,
            step_id = %request.step_id,
            status = %request.status,
            decided_by = request.decided_by.as_deref().unwrap_or(""),
            "Approval decided"
        );
        Ok(request)
    }

    /// Put a decided request back to pending after its decision could not be
    /// delivered, so it can be decided again.
    pub async fn revert(&self, id: &str) -> Result<ApprovalRequest> {
        let key = (tenant_scope(), id.to_string());
        let mut requests = self.requests.lock().await;
        let mut request = match requests.entries.get(&key).cloned() {
            Some(request) => request,
            None => self
                .load(id)
                .await?
                .ok_or_else(|| StrataError::ApprovalNotFound(id.to_string()))?,
        };
        request.status = ApprovalStatus::Pending;
        request.decided_by = None;
        request.decided_at = None;
        request.response_payload = None;
        request.comment = None;

        self.persist(&request).await?;
        requests.decided.retain(|k| *k != key);
        self.retain(&mut requests, key, request.clone());
        drop(requests);

        warn!(
            approval_id = %id,
            execution_id = %request.execution_id,
            step_id = %request.step_id,
            "Approval decision reverted to pending"
        );
        Ok(request)
    }

    /// List the current tenant's pending approvals.
    pub async fn pending_requests(&self) -> Result<Vec<ApprovalRequest>> {
        let scope = tenant_scope();
        let mut by_id: HashMap<String, ApprovalRequest> = HashMap::new();
        if let Some(store) = &self.store {
            for r in store.list_approvals(Some(ApprovalStatus::Pending)).await? {
                by_id.insert(r.id.clone(), r);
            }
        }
        for ((s, id), r) in self.requests.lock().await.entries.iter() {
            if *s == scope {
                by_id.insert(id.clone(), r.clone());
            }
        }
        let mut pending: Vec<ApprovalRequest> = by_id
            .into_values()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .collect();
        pending.sort_by_key(|r| r.requested_at);
        Ok(pending)
    }

    /// Find a pending request by prefix match on the ID.
    pub async fn find_by_prefix(&self, prefix: &str) -> Result<Option<String>> {
        Ok(self
            .pending_requests()
            .await?
            .into_iter()
            .map(|r| r.id)
            .find(|id| id.starts_with(prefix)))
    }

    /// The data written back into the step when a decision resumes it.
    pub fn decision_output(request: &ApprovalRequest) -> Value {
        json!({
            "approval_request_id": request.id,
            "approval_status": request.status.as_str(),
            "decided_by": request.decided_by,
            "decided_at": request.decided_at.map(|t| t.to_rfc3339()),
            "payload": request.response_payload,
            "comment": request.comment,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> ApprovalBroker {
        ApprovalBroker::new(Arc::new(StreamManager::default()))
    }

    async fn open(broker: &ApprovalBroker, exec: &str, step: &str) -> ApprovalRequest {
        broker
            .open("wf", exec, step, "Ship it?", ApprovalBackend::Local, json!({}))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn open_is_idempotent_per_step() {
        let b = broker();
        let first = open(&b, "e1", "review").await;
        let again = open(&b, "e1", "review").await;
        assert_eq!(first.id, again.id);
        let other = open(&b, "e1", "second_review").await;
        assert_ne!(first.id, other.id);
        assert_eq!(b.pending_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn resolve_approve() {
        let b = broker();
        let req = open(&b, "e1", "review").await;
        let decided = b
            .resolve(
                &req.id,
                ApprovalDecision {
                    decided_by: "ops@example.com".into(),
                    payload: Some(json!({"ticket": 42})),
                    comment: Some("lgtm".into()),
                },
                true,
            )
            .await
            .unwrap();
        assert_eq!(decided.status, ApprovalStatus::Approved);
        assert!(decided.decided_at.is_some());

        let output = ApprovalBroker::decision_output(&decided);
        assert_eq!(output["approval_status"], json!("approved"));
        assert_eq!(output["payload"]["ticket"], json!(42));
        assert!(b.pending_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolves_exactly_once() {
        let b = broker();
        let req = open(&b, "e1", "review").await;
        b.resolve(&req.id, ApprovalDecision::default(), false)
            .await
            .unwrap();
        let err = b
            .resolve(&req.id, ApprovalDecision::default(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::ApprovalAlreadyDecided { .. }));
        assert_eq!(
            b.get(&req.id).await.unwrap().unwrap().status,
            ApprovalStatus::Denied
        );
    }

    #[tokio::test]
    async fn resolve_unknown_id() {
        let b = broker();
        let err = b
            .resolve("nonexistent", ApprovalDecision::default(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::ApprovalNotFound(_)));
    }

    #[tokio::test]
    async fn requests_are_partitioned_by_tenant() {
        use strata_core::tenant::with_tenant;

        let b = broker();
        let req = with_tenant("acme", async { open(&b, "e1", "review").await }).await;

        let other = with_tenant("globex", async {
            (
                b.pending_requests().await.unwrap(),
                b.get(&req.id).await.unwrap(),
                b.find_by_prefix(&req.id[..8]).await.unwrap(),
                b.resolve(&req.id, ApprovalDecision::default(), true).await,
            )
        })
        .await;
        assert!(other.0.is_empty());
        assert!(other.1.is_none());
        assert!(other.2.is_none());
        assert!(matches!(other.3, Err(StrataError::ApprovalNotFound(_))));

        let still = with_tenant("acme", b.pending_requests()).await.unwrap();
        assert_eq!(still.len(), 1);
    }

    #[tokio::test]
    async fn decided_requests_leave_memory_once_stored() {
        let store = Arc::new(strata_test_utils::InMemoryExecutionStore::new());
        let b = broker().with_store(store.clone());
        let req = open(&b, "e1", "review").await;
        b.resolve(&req.id, ApprovalDecision::default(), true)
            .await
            .unwrap();

        assert!(b.requests.lock().await.entries.is_empty());
        let stored = b.get(&req.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ApprovalStatus::Approved);
        let err = b
            .resolve(&req.id, ApprovalDecision::default(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::ApprovalAlreadyDecided { .. }));
    }

    #[tokio::test]
    async fn decided_history_is_bounded_without_store() {
        let b = broker().with_decided_limit(2);
        let mut ids = Vec::new();
        for step in ["a", "b", "c"] {
            let req = open(&b, "e1", step).await;
            b.resolve(&req.id, ApprovalDecision::default(), true)
                .await
                .unwrap();
            ids.push(req.id);
        }
        let pending = open(&b, "e1", "d").await;

        assert!(b.get(&ids[0]).await.unwrap().is_none());
        assert!(b.get(&ids[2]).await.unwrap().is_some());
        assert_eq!(b.requests.lock().await.entries.len(), 3);
        assert_eq!(b.pending_requests().await.unwrap()[0].id, pending.id);
    }

    #[tokio::test]
    async fn revert_makes_request_decidable_again() {
        let store = Arc::new(strata_test_utils::InMemoryExecutionStore::new());
        let b = broker().with_store(store);
        let req = open(&b, "e1", "review").await;
        b.resolve(&req.id, ApprovalDecision::default(), true)
            .await
            .unwrap();

        let reverted = b.revert(&req.id).await.unwrap();
        assert_eq!(reverted.status, ApprovalStatus::Pending);
        assert!(reverted.decided_at.is_none());
        assert_eq!(b.pending_requests().await.unwrap().len(), 1);

        let decided = b
            .resolve(&req.id, ApprovalDecision::default(), false)
            .await
            .unwrap();
        assert_eq!(decided.status, ApprovalStatus::Denied);
    }

    #[tokio::test]
    async fn find_pending_by_prefix() {
        let b = broker();
        let req = open(&b, "e1", "review").await;
        let found = b.find_by_prefix(&req.id[..8]).await.unwrap();
        assert_eq!(found, Some(req.id));
        assert_eq!(b.find_by_prefix("zzzz-not-there").await.unwrap(), None);
    }
}
