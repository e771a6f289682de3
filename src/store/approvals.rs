use super::{read_json_array, write_json_array};
use crate::model::Approval;
use anyhow::Result;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// File-backed `approvals.json` — the `ApprovalStorage` interface named in
/// §4.9 (`Store`, `Get`, `Delete`), plus the set-replace / merge operations
/// `ApprovalResyncService` needs.
pub struct ApprovalStore {
    path: PathBuf,
    approvals: Mutex<Vec<Approval>>,
}

impl ApprovalStore {
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("approvals.json");
        let approvals = read_json_array(&path).await?;
        Ok(Self {
            path,
            approvals: Mutex::new(approvals),
        })
    }

    pub async fn store(&self, approval: Approval) -> Result<()> {
        let mut guard = self.approvals.lock().await;
        guard.retain(|a| !(a.session_id == approval.session_id && a.request_id == approval.request_id));
        guard.push(approval);
        write_json_array(&self.path, &guard).await
    }

    pub async fn get(&self, session_id: &str, request_id: i64) -> Option<Approval> {
        self.approvals
            .lock()
            .await
            .iter()
            .find(|a| a.session_id == session_id && a.request_id == request_id)
            .cloned()
    }

    pub async fn delete(&self, session_id: &str, request_id: i64) -> Result<()> {
        let mut guard = self.approvals.lock().await;
        guard.retain(|a| !(a.session_id == session_id && a.request_id == request_id));
        write_json_array(&self.path, &guard).await
    }

    pub async fn list_for_session(&self, session_id: &str) -> Vec<Approval> {
        self.approvals
            .lock()
            .await
            .iter()
            .filter(|a| a.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Authoritative resync: the provider's list fully replaces the local
    /// set for this session (invariant 5, opencode path).
    pub async fn replace_for_session(&self, session_id: &str, fresh: Vec<Approval>) -> Result<()> {
        let mut guard = self.approvals.lock().await;
        guard.retain(|a| a.session_id != session_id);
        guard.extend(fresh);
        write_json_array(&self.path, &guard).await
    }

    /// Additive merge: only add approvals not already present, never remove
    /// (invariant 5, claude/codex path — the store is non-authoritative).
    pub async fn merge_additive(&self, session_id: &str, discovered: Vec<Approval>) -> Result<()> {
        let mut guard = self.approvals.lock().await;
        for approval in discovered {
            let exists = guard
                .iter()
                .any(|a| a.session_id == session_id && a.request_id == approval.request_id);
            if !exists {
                guard.push(approval);
            }
        }
        write_json_array(&self.path, &guard).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approval(session_id: &str, request_id: i64) -> Approval {
        Approval {
            session_id: session_id.to_string(),
            request_id,
            method: "item/commandExecution/requestApproval".into(),
            params: serde_json::json!({}),
            created_at: crate::model::now_rfc3339(),
        }
    }

    #[tokio::test]
    async fn replace_drops_entries_not_in_the_fresh_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApprovalStore::open(dir.path()).await.unwrap();
        store.store(approval("s1", 1)).await.unwrap();
        store.store(approval("s1", 2)).await.unwrap();
        store
            .replace_for_session("s1", vec![approval("s1", 2)])
            .await
            .unwrap();
        let remaining = store.list_for_session("s1").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].request_id, 2);
    }

    #[tokio::test]
    async fn merge_additive_never_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApprovalStore::open(dir.path()).await.unwrap();
        store.store(approval("s1", 1)).await.unwrap();
        store.merge_additive("s1", vec![approval("s1", 2)]).await.unwrap();
        assert_eq!(store.list_for_session("s1").await.len(), 2);
    }
}
