//! Codex thread syncer — §4.7. Periodically lists provider-owned threads
//! per workspace/worktree, classifies each, resolves an owning session, and
//! reconciles `SessionMeta`. Never materializes a user-visible session from
//! a raw provider thread.

use crate::model::{CodexThreadSummary, SessionMeta, SessionRecord, SessionSource, SessionStatus};
use crate::store::SessionStore;
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// One-shot app-server spawn to page through `listThreads`. Short-lived —
/// unlike `live::codex::CodexLiveSession`, which keeps one app-server alive
/// per session, this spawns its own process and exits once the cursor is
/// exhausted.
pub async fn list_threads(command: &str, scan_root: &Path) -> Result<Vec<CodexThreadSummary>> {
    let mut cmd = Command::new(command);
    cmd.arg("app-server")
        .current_dir(scan_root)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true);
    let mut child = cmd.spawn().context("spawn codex app-server for thread sync")?;
    let mut stdin = child.stdin.take().context("app-server stdin unavailable")?;
    let mut stdout = BufReader::new(child.stdout.take().context("app-server stdout unavailable")?);

    let mut next_id = 1i64;

    send_rpc_line(&mut stdin, &json!({ "jsonrpc": "2.0", "id": next_id, "method": "initialize", "params": {} })).await?;
    recv_rpc_response(&mut stdout).await?;
    next_id += 1;

    let mut out = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let mut params = json!({});
        if let Some(c) = &cursor {
            params["cursor"] = json!(c);
        }
        send_rpc_line(&mut stdin, &json!({ "jsonrpc": "2.0", "id": next_id, "method": "listThreads", "params": params })).await?;
        let resp = recv_rpc_response(&mut stdout).await?;
        next_id += 1;
        let Some(result) = resp.get("result") else { break };
        for thread in result.get("threads").and_then(|v| v.as_array()).cloned().unwrap_or_default() {
            let Some(id) = thread.get("id").and_then(|v| v.as_str()) else { continue };
            out.push(CodexThreadSummary {
                id: id.to_string(),
                cwd: thread.get("cwd").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                updated_at: thread.get("updatedAt").and_then(|v| v.as_i64()).unwrap_or(0),
                preview: thread.get("preview").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            });
        }
        cursor = result.get("nextCursor").and_then(|v| v.as_str()).map(String::from);
        if cursor.is_none() {
            break;
        }
    }

    let _ = child.kill().await;
    Ok(out)
}

async fn send_rpc_line(stdin: &mut tokio::process::ChildStdin, msg: &Value) -> Result<()> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    stdin.write_all(&line).await.context("write to app-server stdin")
}

async fn recv_rpc_response(stdout: &mut BufReader<tokio::process::ChildStdout>) -> Result<Value> {
    loop {
        let mut line = String::new();
        let n = stdout.read_line(&mut line).await.context("read app-server stdout")?;
        if n == 0 {
            anyhow::bail!("app-server closed stdout before responding");
        }
        let msg: Value = serde_json::from_str(&line).context("parse app-server response")?;
        if msg.get("id").is_some() {
            return Ok(msg);
        }
    }
}

pub struct WorkspaceScanTarget {
    pub workspace_id: String,
    pub root: PathBuf,
    /// `(worktree_id, root)` pairs whose threads are counted against the
    /// worktree instead of the parent workspace.
    pub worktrees: Vec<(String, PathBuf)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    OutOfScope,
    Excluded,
    Dismissed,
    Process,
}

pub struct CodexSyncer {
    sessions: Arc<SessionStore>,
}

impl CodexSyncer {
    pub fn new(sessions: Arc<SessionStore>) -> Self {
        Self { sessions }
    }

    /// Distinct `cwd`s of internal sessions, used by the sync loop as scan
    /// roots in the absence of a dedicated workspace registry.
    pub async fn sessions_snapshot_roots(&self) -> HashSet<String> {
        self.sessions
            .list_by_source(SessionSource::Internal)
            .await
            .into_iter()
            .map(|r| r.session.cwd)
            .collect()
    }

    fn classify(&self, thread: &CodexThreadSummary, target: &WorkspaceScanTarget, dismissed: bool) -> Classification {
        let thread_path = Path::new(&thread.cwd);
        if !thread_path.starts_with(&target.root) {
            return Classification::OutOfScope;
        }
        if target
            .worktrees
            .iter()
            .any(|(_, root)| root != &target.root && thread_path.starts_with(root))
        {
            return Classification::Excluded;
        }
        if dismissed {
            return Classification::Dismissed;
        }
        Classification::Process
    }

    async fn resolve_owner(&self, thread_id: &str) -> Option<SessionRecord> {
        if let Some(rec) = self.sessions.get_session(thread_id).await {
            return Some(rec);
        }
        let metas = self.sessions.list_metas().await;
        let mut candidates = Vec::new();
        for meta in metas {
            if meta.thread_id.as_deref() == Some(thread_id) {
                if let Some(rec) = self.sessions.get_session(&meta.session_id).await {
                    candidates.push(rec);
                }
            }
        }
        candidates.sort_by_key(|r| if r.source == SessionSource::Internal { 0 } else { 1 });
        candidates.into_iter().next()
    }

    async fn skip_overwrite(&self, owner: &SessionRecord) -> bool {
        if owner.session.status == SessionStatus::Orphaned {
            return true;
        }
        if owner.source == SessionSource::Internal {
            return true;
        }
        self.sessions
            .get_meta(&owner.session.id)
            .await
            .map(|m| m.dismissed_at.is_some())
            .unwrap_or(false)
    }

    /// One sync pass over `target`'s threads. Returns the set of thread ids
    /// processed (`process` classification), used by the stale-removal pass.
    pub async fn sync_workspace(&self, target: &WorkspaceScanTarget, threads: Vec<CodexThreadSummary>) -> Result<HashSet<String>> {
        let mut seen = HashSet::new();
        let existing = self.sessions.list_metas().await;
        for thread in &threads {
            let dismissed = existing
                .iter()
                .find(|m| m.thread_id.as_deref() == Some(thread.id.as_str()))
                .map(|m| m.dismissed_at.is_some())
                .unwrap_or(false);
            if self.classify(thread, target, dismissed) != Classification::Process {
                continue;
            }
            seen.insert(thread.id.clone());

            let Some(owner) = self.resolve_owner(&thread.id).await else {
                continue;
            };
            if self.skip_overwrite(&owner).await {
                continue;
            }
            let mut meta = self.sessions.get_meta(&owner.session.id).await.unwrap_or_default();
            meta.session_id = owner.session.id.clone();
            meta.thread_id = Some(thread.id.clone());
            meta.workspace_id = Some(target.workspace_id.clone());
            meta.worktree_id = target
                .worktrees
                .iter()
                .find(|(_, root)| Path::new(&thread.cwd).starts_with(root))
                .map(|(id, _)| id.clone());
            meta.last_active_at = Some(unix_secs_to_rfc3339(thread.updated_at));
            self.sessions.upsert_meta(meta).await?;
        }
        self.remove_stale(target, &seen).await?;
        Ok(seen)
    }

    /// Any `source=codex` session, with no `workflow_run_id`, whose meta
    /// matches this pass's `(workspace_id, worktree_id)` and whose id was
    /// not seen this pass, is deleted from both stores.
    async fn remove_stale(&self, target: &WorkspaceScanTarget, seen: &HashSet<String>) -> Result<()> {
        for rec in self.sessions.list_by_source(SessionSource::Codex).await {
            let Some(meta) = self.sessions.get_meta(&rec.session.id).await else { continue };
            if meta.workflow_run_id.is_some() {
                continue;
            }
            if meta.workspace_id.as_deref() != Some(target.workspace_id.as_str()) {
                continue;
            }
            if meta.thread_id.as_ref().map(|id| seen.contains(id)).unwrap_or(false) {
                continue;
            }
            self.sessions.delete_session(&rec.session.id).await?;
            self.sessions.delete_meta(&rec.session.id).await?;
        }
        Ok(())
    }

    /// S6: collapse an internal session whose meta's `thread_id` matches a
    /// codex-synced session's id into the codex-synced record, carrying the
    /// user's title across and locking it.
    pub async fn migrate_duplicate_internal_sessions(&self) -> Result<()> {
        let sessions = self.sessions.list_sessions().await;
        let codex_ids: HashSet<String> = sessions
            .iter()
            .filter(|r| r.source == SessionSource::Codex)
            .map(|r| r.session.id.clone())
            .collect();
        for rec in sessions.iter().filter(|r| r.source == SessionSource::Internal) {
            let Some(meta) = self.sessions.get_meta(&rec.session.id).await else { continue };
            let Some(thread_id) = &meta.thread_id else { continue };
            if !codex_ids.contains(thread_id) {
                continue;
            }
            if let Some(mut codex_meta) = self.sessions.get_meta(thread_id).await {
                if !rec.session.title.is_empty() {
                    codex_meta.title = rec.session.title.clone();
                    codex_meta.title_locked = true;
                }
                self.sessions.upsert_meta(codex_meta).await?;
            }
            self.sessions.delete_session(&rec.session.id).await?;
            self.sessions.delete_meta(&rec.session.id).await?;
        }
        Ok(())
    }
}

fn unix_secs_to_rfc3339(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true))
        .unwrap_or_else(crate::model::now_rfc3339)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Session;

    fn session(id: &str, source: SessionSource, status: SessionStatus) -> SessionRecord {
        SessionRecord {
            session: Session {
                id: id.to_string(),
                provider: "codex".into(),
                cwd: "/work".into(),
                env: vec![],
                title: String::new(),
                status,
                created_at: crate::model::now_rfc3339(),
                pid: None,
                exit_code: None,
                exited_at: None,
            },
            source,
        }
    }

    #[tokio::test]
    async fn stale_codex_session_is_removed_when_thread_disappears() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::open(dir.path()).await.unwrap());
        store
            .upsert_session(session("thr-1", SessionSource::Codex, SessionStatus::Inactive))
            .await
            .unwrap();
        store
            .upsert_meta(SessionMeta {
                session_id: "thr-1".into(),
                thread_id: Some("thr-1".into()),
                workspace_id: Some("ws".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let syncer = CodexSyncer::new(store.clone());
        let target = WorkspaceScanTarget {
            workspace_id: "ws".into(),
            root: PathBuf::from("/work"),
            worktrees: vec![],
        };
        syncer.sync_workspace(&target, vec![]).await.unwrap();
        assert!(store.get_session("thr-1").await.is_none());
    }

    #[tokio::test]
    async fn dismissed_or_internal_sessions_are_never_removed_by_sync() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::open(dir.path()).await.unwrap());
        store
            .upsert_session(session("internal-1", SessionSource::Internal, SessionStatus::Inactive))
            .await
            .unwrap();
        store
            .upsert_meta(SessionMeta {
                session_id: "internal-1".into(),
                workspace_id: Some("ws".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let syncer = CodexSyncer::new(store.clone());
        let target = WorkspaceScanTarget {
            workspace_id: "ws".into(),
            root: PathBuf::from("/work"),
            worktrees: vec![],
        };
        syncer.sync_workspace(&target, vec![]).await.unwrap();
        assert!(store.get_session("internal-1").await.is_some());
    }

    #[tokio::test]
    async fn migrate_rekeys_internal_duplicate_onto_its_codex_twin() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::open(dir.path()).await.unwrap());

        let mut internal = session("random-hex", SessionSource::Internal, SessionStatus::Inactive);
        internal.session.title = "my renamed session".into();
        store.upsert_session(internal).await.unwrap();
        store
            .upsert_meta(SessionMeta {
                session_id: "random-hex".into(),
                thread_id: Some("codex-thread-uuid".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        store
            .upsert_session(session("codex-thread-uuid", SessionSource::Codex, SessionStatus::Inactive))
            .await
            .unwrap();
        store
            .upsert_meta(SessionMeta {
                session_id: "codex-thread-uuid".into(),
                workspace_id: Some("ws-1".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let syncer = CodexSyncer::new(store.clone());
        syncer.migrate_duplicate_internal_sessions().await.unwrap();

        assert!(store.get_session("random-hex").await.is_none());
        let surviving = store.get_session("codex-thread-uuid").await.unwrap();
        assert_eq!(surviving.source, SessionSource::Codex);
        let meta = store.get_meta("codex-thread-uuid").await.unwrap();
        assert_eq!(meta.title, "my renamed session");
        assert!(meta.title_locked);
        assert_eq!(meta.workspace_id.as_deref(), Some("ws-1"));
    }
}
