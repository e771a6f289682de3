//! Approval resync service — §4.9. Periodically reconciles the on-disk
//! approval set against what a provider currently considers pending, so an
//! approval raised while the daemon was disconnected is never lost.

use crate::error::ArchonError;
use crate::model::{Approval, Session, SessionMeta};
use crate::store::{ApprovalStore, ItemStore};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Provider-specific pending-approval lookup.
#[async_trait]
pub trait ApprovalExtractor: Send + Sync {
    /// `true` if the provider's response is the full current pending set
    /// (opencode/kilocode — dispatched via `ApprovalStore::replace_for_session`);
    /// `false` if it only ever discovers approvals additively (codex —
    /// dispatched via `ApprovalStore::merge_additive`).
    fn authoritative(&self) -> bool;

    async fn list_pending(&self, session: &Session, meta: &SessionMeta) -> Result<Vec<Approval>, ArchonError>;
}

/// Used by providers (`exec`, `claude`) with no approval concept at all —
/// kept so the service can still be registered uniformly across providers.
pub struct NoopExtractor;

#[async_trait]
impl ApprovalExtractor for NoopExtractor {
    fn authoritative(&self) -> bool {
        false
    }

    async fn list_pending(&self, _session: &Session, _meta: &SessionMeta) -> Result<Vec<Approval>, ArchonError> {
        Ok(Vec::new())
    }
}

/// Codex's app-server has no "list pending approvals" RPC; the steady-state
/// path already captures each approval the moment it arrives via
/// `live::codex::CodexLiveSession::handle_request`. This extractor instead
/// reconstructs the pending set from the durable per-session item log
/// (§4.9): `CodexLiveSession` appends a `Log` item with `rpc_method`/`rpc_id`
/// for every `item/*requestApproval` it receives and every
/// `turn/respondToRequest` it sends, so scanning the log and subtracting
/// responded ids from requested ids recovers what is still outstanding even
/// when no live connection to the app-server process survived a daemon
/// restart.
pub struct CodexLogScanExtractor {
    pub items: Arc<ItemStore>,
}

#[async_trait]
impl ApprovalExtractor for CodexLogScanExtractor {
    fn authoritative(&self) -> bool {
        false
    }

    async fn list_pending(&self, session: &Session, _meta: &SessionMeta) -> Result<Vec<Approval>, ArchonError> {
        let log = self.items.read_all(&session.id).await.map_err(ArchonError::Internal)?;
        let mut requested: HashMap<i64, (String, serde_json::Value)> = HashMap::new();
        let mut responded: HashSet<i64> = HashSet::new();
        for item in log {
            let Some(method) = item.fields.get("rpc_method").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(id) = item.fields.get("rpc_id").and_then(|v| v.as_i64()) else {
                continue;
            };
            if method.starts_with("item/") && method.ends_with("requestApproval") {
                let params = item.fields.get("rpc_params").cloned().unwrap_or(serde_json::Value::Null);
                requested.insert(id, (method.to_string(), params));
            } else if method == "turn/respondToRequest" {
                responded.insert(id);
            }
        }
        Ok(requested
            .into_iter()
            .filter(|(id, _)| !responded.contains(id))
            .map(|(id, (method, params))| Approval {
                session_id: session.id.clone(),
                request_id: id,
                method,
                params,
                created_at: crate::model::now_rfc3339(),
            })
            .collect())
    }
}

/// Polls `GET /permission?status=pending`, filtered to this session's
/// `provider_session_id`. Opencode/kilocode's permission list is the
/// provider's authoritative record of what is still awaiting a decision.
pub struct OpencodePendingExtractor {
    pub client: reqwest::Client,
}

#[async_trait]
impl ApprovalExtractor for OpencodePendingExtractor {
    fn authoritative(&self) -> bool {
        true
    }

    async fn list_pending(&self, session: &Session, meta: &SessionMeta) -> Result<Vec<Approval>, ArchonError> {
        let base_url = meta
            .runtime_options
            .get("base_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ArchonError::invalid("opencode session missing base_url"))?;
        let provider_session_id = meta
            .provider_session_id
            .as_deref()
            .ok_or_else(|| ArchonError::invalid("opencode session missing provider_session_id"))?;
        let token = meta.runtime_options.get("token").and_then(|v| v.as_str());

        let mut req = self.client.get(format!("{base_url}/permission?status=pending"));
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ArchonError::unavailable(format!("opencode permission poll failed: {e}")))?;
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ArchonError::unavailable(format!("opencode permission poll decode failed: {e}")))?;

        let mut out = Vec::new();
        for entry in body.as_array().cloned().unwrap_or_default() {
            if entry.get("sessionID").and_then(|v| v.as_str()) != Some(provider_session_id) {
                continue;
            }
            let Some(permission_id) = entry.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            out.push(Approval {
                session_id: session.id.clone(),
                request_id: crate::live::opencode::fnv1a32(permission_id) as i64,
                method: "tool/requestUserInput".to_string(),
                params: entry,
                created_at: crate::model::now_rfc3339(),
            });
        }
        Ok(out)
    }
}

pub struct ApprovalResyncService {
    approvals: Arc<ApprovalStore>,
}

impl ApprovalResyncService {
    pub fn new(approvals: Arc<ApprovalStore>) -> Self {
        Self { approvals }
    }

    /// `SyncSession`: fetch the provider's pending set and dispatch to the
    /// store under the extractor's authoritativeness policy.
    pub async fn sync_session(
        &self,
        session: &Session,
        meta: &SessionMeta,
        extractor: &dyn ApprovalExtractor,
    ) -> Result<(), ArchonError> {
        let pending = extractor.list_pending(session, meta).await?;
        if extractor.authoritative() {
            self.approvals
                .replace_for_session(&session.id, pending)
                .await
                .map_err(ArchonError::Internal)?;
        } else {
            self.approvals
                .merge_additive(&session.id, pending)
                .await
                .map_err(ArchonError::Internal)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionStatus;

    fn session() -> Session {
        Session {
            id: "s1".into(),
            provider: "opencode".into(),
            cwd: "/tmp".into(),
            env: vec![],
            title: String::new(),
            status: SessionStatus::Running,
            created_at: crate::model::now_rfc3339(),
            pid: None,
            exit_code: None,
            exited_at: None,
        }
    }

    struct FixedExtractor {
        authoritative: bool,
        approvals: Vec<Approval>,
    }

    #[async_trait]
    impl ApprovalExtractor for FixedExtractor {
        fn authoritative(&self) -> bool {
            self.authoritative
        }
        async fn list_pending(&self, _session: &Session, _meta: &SessionMeta) -> Result<Vec<Approval>, ArchonError> {
            Ok(self.approvals.clone())
        }
    }

    fn approval(request_id: i64) -> Approval {
        Approval {
            session_id: "s1".into(),
            request_id,
            method: "tool/requestUserInput".into(),
            params: serde_json::json!({}),
            created_at: crate::model::now_rfc3339(),
        }
    }

    #[tokio::test]
    async fn authoritative_extractor_replaces_the_local_set() {
        let dir = tempfile::tempdir().unwrap();
        let approvals = Arc::new(ApprovalStore::open(dir.path()).await.unwrap());
        approvals.store(approval(1)).await.unwrap();
        let service = ApprovalResyncService::new(approvals.clone());
        let extractor = FixedExtractor { authoritative: true, approvals: vec![approval(2)] };
        service
            .sync_session(&session(), &SessionMeta::default(), &extractor)
            .await
            .unwrap();
        let remaining = approvals.list_for_session("s1").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].request_id, 2);
    }

    #[tokio::test]
    async fn additive_extractor_keeps_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let approvals = Arc::new(ApprovalStore::open(dir.path()).await.unwrap());
        approvals.store(approval(1)).await.unwrap();
        let service = ApprovalResyncService::new(approvals.clone());
        let extractor = FixedExtractor { authoritative: false, approvals: vec![approval(2)] };
        service
            .sync_session(&session(), &SessionMeta::default(), &extractor)
            .await
            .unwrap();
        assert_eq!(approvals.list_for_session("s1").await.len(), 2);
    }

    fn rpc_log_item(method: &str, id: i64, params: Option<serde_json::Value>) -> crate::model::Item {
        let mut item = crate::model::Item::new(crate::model::ItemType::Log, crate::model::now_rfc3339());
        item.fields.insert("rpc_method".to_string(), serde_json::json!(method));
        item.fields.insert("rpc_id".to_string(), serde_json::json!(id));
        if let Some(params) = params {
            item.fields.insert("rpc_params".to_string(), params);
        }
        item
    }

    #[tokio::test]
    async fn log_scan_extractor_subtracts_responded_ids() {
        let dir = tempfile::tempdir().unwrap();
        let items = Arc::new(ItemStore::new(dir.path()));
        items
            .append(
                "s1",
                &rpc_log_item("item/commandExecution/requestApproval", 1, Some(serde_json::json!({"command": "ls"}))),
            )
            .await
            .unwrap();
        items
            .append(
                "s1",
                &rpc_log_item("item/fileChange/requestApproval", 2, Some(serde_json::json!({"path": "a.rs"}))),
            )
            .await
            .unwrap();
        items.append("s1", &rpc_log_item("turn/respondToRequest", 1, None)).await.unwrap();

        let extractor = CodexLogScanExtractor { items };
        let mut session = session();
        session.id = "s1".into();
        session.provider = "codex".into();
        let pending = extractor.list_pending(&session, &SessionMeta::default()).await.unwrap();

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request_id, 2);
        assert_eq!(pending[0].method, "item/fileChange/requestApproval");
    }

    #[tokio::test]
    async fn log_scan_extractor_is_additive() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = CodexLogScanExtractor { items: Arc::new(ItemStore::new(dir.path())) };
        assert!(!extractor.authoritative());
    }
}
