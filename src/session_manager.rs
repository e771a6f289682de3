//! Session manager — the façade the HTTP layer calls. Owns `Session`/
//! `SessionMeta` CRUD via `SessionStore`, wires the four provider factories
//! into one `CompositeLiveManager`, and exposes the operations spec.md §6
//! names (create/list/get/delete, send/approve/interrupt, tail).
//!
//! Grounded on the daemon's `session::SessionManager` (CRUD + status
//! broadcast shape), generalized from a single SQLite-backed CRUD+runner
//! table to the provider-polymorphic live-session core.

use crate::config::DaemonConfig;
use crate::error::ArchonError;
use crate::hub::Subscription;
use crate::live::{CompositeLiveManager, TurnInput, TurnOptions};
use crate::model::{CodexEvent, Item, Session, SessionMeta, SessionRecord, SessionSource, SessionStatus};
use crate::store::{ApprovalStore, ItemStore, SessionStore};
use crate::worktree;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

pub struct SessionManager {
    config: Arc<DaemonConfig>,
    sessions: Arc<SessionStore>,
    items: Arc<ItemStore>,
    approvals: Arc<ApprovalStore>,
    live: Arc<CompositeLiveManager>,
}

impl SessionManager {
    pub fn new(
        config: Arc<DaemonConfig>,
        sessions: Arc<SessionStore>,
        items: Arc<ItemStore>,
        approvals: Arc<ApprovalStore>,
        live: Arc<CompositeLiveManager>,
    ) -> Self {
        Self {
            config,
            sessions,
            items,
            approvals,
            live,
        }
    }

    pub async fn create(&self, provider: &str, cwd: &str, title: &str) -> Result<Session, ArchonError> {
        let provider = crate::live::normalize_provider(provider);
        let title = crate::util::sanitize_title(title);
        let id = crate::util::new_session_id();
        let session = Session {
            id: id.clone(),
            provider: provider.clone(),
            cwd: cwd.to_string(),
            env: Vec::new(),
            title: title.clone(),
            status: SessionStatus::Inactive,
            created_at: crate::model::now_rfc3339(),
            pid: None,
            exit_code: None,
            exited_at: None,
        };
        self.sessions
            .upsert_session(SessionRecord { session: session.clone(), source: SessionSource::Internal })
            .await
            .map_err(ArchonError::Internal)?;
        self.sessions
            .upsert_meta(SessionMeta { session_id: id.clone(), title: title.to_string(), ..Default::default() })
            .await
            .map_err(ArchonError::Internal)?;

        if let Some(worktree_root) = worktree::ensure_worktree(&self.config.data_dir, std::path::Path::new(cwd), &id).await {
            if let Some(mut meta) = self.sessions.get_meta(&id).await {
                meta.worktree_id = Some(id.clone());
                meta.runtime_options = serde_json::json!({ "worktree_path": worktree_root.display().to_string() });
                self.sessions.upsert_meta(meta).await.map_err(ArchonError::Internal)?;
            }
        }

        info!(id = %id, provider, "session created");
        Ok(session)
    }

    pub async fn list(&self) -> Vec<SessionRecord> {
        self.sessions.list_sessions().await
    }

    pub async fn get(&self, session_id: &str) -> Result<(Session, SessionMeta), ArchonError> {
        let record = self
            .sessions
            .get_session(session_id)
            .await
            .ok_or_else(|| ArchonError::not_found(format!("session {session_id} not found")))?;
        let meta = self.sessions.get_meta(session_id).await.unwrap_or_default();
        Ok((record.session, meta))
    }

    pub async fn rename(&self, session_id: &str, title: &str) -> Result<(), ArchonError> {
        let (mut session, mut meta) = self.get(session_id).await?;
        if meta.title_locked {
            return Err(ArchonError::conflict("session title is locked by the codex syncer"));
        }
        session.title = title.to_string();
        meta.title = title.to_string();
        self.sessions
            .upsert_session(SessionRecord { session, source: SessionSource::Internal })
            .await
            .map_err(ArchonError::Internal)?;
        self.sessions.upsert_meta(meta).await.map_err(ArchonError::Internal)?;
        Ok(())
    }

    pub async fn delete(&self, session_id: &str) -> Result<(), ArchonError> {
        let (session, _) = self.get(session_id).await?;
        self.live.drop_session(session_id).await;
        worktree::remove_worktree(&self.config.data_dir, std::path::Path::new(&session.cwd), session_id).await;
        self.sessions.delete_session(session_id).await.map_err(ArchonError::Internal)?;
        self.sessions.delete_meta(session_id).await.map_err(ArchonError::Internal)?;
        info!(id = session_id, "session deleted");
        Ok(())
    }

    pub async fn send(&self, session_id: &str, text: &str, model: Option<String>) -> Result<String, ArchonError> {
        let (session, meta) = self.get(session_id).await?;
        let input = TurnInput { text: text.to_string() };
        let opts = TurnOptions { model, additional_directories: Vec::new() };
        let turn_id = self.live.start_turn(&session, &meta, input, opts).await?;
        let mut meta = meta;
        meta.last_turn_id = Some(turn_id.clone());
        meta.last_active_at = Some(crate::model::now_rfc3339());
        self.sessions.upsert_meta(meta).await.map_err(ArchonError::Internal)?;

        let mut session = session;
        session.status = SessionStatus::Running;
        self.sessions
            .upsert_session(SessionRecord { session, source: SessionSource::Internal })
            .await
            .map_err(ArchonError::Internal)?;
        Ok(turn_id)
    }

    pub async fn interrupt(&self, session_id: &str) -> Result<(), ArchonError> {
        let (session, meta) = self.get(session_id).await?;
        self.live.interrupt(&session, &meta).await
    }

    pub async fn approve(&self, session_id: &str, request_id: i64, decision: Value) -> Result<(), ArchonError> {
        let (session, meta) = self.get(session_id).await?;
        self.live.respond(&session, &meta, request_id, decision).await?;
        self.approvals.delete(session_id, request_id).await.map_err(ArchonError::Internal)?;
        Ok(())
    }

    pub async fn pending_approvals(&self, session_id: &str) -> Vec<crate::model::Approval> {
        self.approvals.list_for_session(session_id).await
    }

    pub async fn subscribe(&self, session_id: &str) -> Result<Subscription<CodexEvent>, ArchonError> {
        let (session, meta) = self.get(session_id).await?;
        self.live.subscribe(&session, &meta).await
    }

    pub async fn tail(&self, session_id: &str, lines: Option<usize>) -> Result<Vec<Item>, ArchonError> {
        self.get(session_id).await?;
        match lines {
            Some(n) => self.items.read_tail(session_id, n).await.map_err(ArchonError::Internal),
            None => self.items.read_all(session_id).await.map_err(ArchonError::Internal),
        }
    }
}
