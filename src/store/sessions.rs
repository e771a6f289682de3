use super::{read_json_array, write_json_array};
use crate::model::{Session, SessionMeta, SessionRecord, SessionSource};
use anyhow::Result;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// File-backed `sessions.json` + `sessions_meta.json`, consulted by the
/// live-session core and the codex syncer (§4.11). Held behind one mutex
/// per file; the two files are small enough that a full rewrite on every
/// mutation is the simplest correct implementation (grounded on the
/// teacher's `Storage` API shape, backed by JSON files instead of SQLite).
pub struct SessionStore {
    sessions_path: PathBuf,
    meta_path: PathBuf,
    sessions: Mutex<Vec<SessionRecord>>,
    metas: Mutex<Vec<SessionMeta>>,
}

impl SessionStore {
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let sessions_path = data_dir.join("sessions.json");
        let meta_path = data_dir.join("sessions_meta.json");
        let sessions = read_json_array(&sessions_path).await?;
        let metas = read_json_array(&meta_path).await?;
        Ok(Self {
            sessions_path,
            meta_path,
            sessions: Mutex::new(sessions),
            metas: Mutex::new(metas),
        })
    }

    // ─── Sessions ───────────────────────────────────────────────────────────

    pub async fn list_sessions(&self) -> Vec<SessionRecord> {
        self.sessions.lock().await.clone()
    }

    pub async fn get_session(&self, id: &str) -> Option<SessionRecord> {
        self.sessions
            .lock()
            .await
            .iter()
            .find(|r| r.session.id == id)
            .cloned()
    }

    pub async fn upsert_session(&self, record: SessionRecord) -> Result<()> {
        let mut guard = self.sessions.lock().await;
        match guard.iter_mut().find(|r| r.session.id == record.session.id) {
            Some(slot) => *slot = record,
            None => guard.push(record),
        }
        write_json_array(&self.sessions_path, &guard).await
    }

    pub async fn delete_session(&self, id: &str) -> Result<()> {
        let mut guard = self.sessions.lock().await;
        guard.retain(|r| r.session.id != id);
        write_json_array(&self.sessions_path, &guard).await
    }

    /// Sessions matching `source`, used by the codex syncer's stale-removal
    /// pass (§4.7).
    pub async fn list_by_source(&self, source: SessionSource) -> Vec<SessionRecord> {
        self.sessions
            .lock()
            .await
            .iter()
            .filter(|r| r.source == source)
            .cloned()
            .collect()
    }

    // ─── Meta ───────────────────────────────────────────────────────────────

    pub async fn get_meta(&self, session_id: &str) -> Option<SessionMeta> {
        self.metas
            .lock()
            .await
            .iter()
            .find(|m| m.session_id == session_id)
            .cloned()
    }

    pub async fn upsert_meta(&self, meta: SessionMeta) -> Result<()> {
        let mut guard = self.metas.lock().await;
        match guard.iter_mut().find(|m| m.session_id == meta.session_id) {
            Some(slot) => *slot = meta,
            None => guard.push(meta),
        }
        write_json_array(&self.meta_path, &guard).await
    }

    pub async fn delete_meta(&self, session_id: &str) -> Result<()> {
        let mut guard = self.metas.lock().await;
        guard.retain(|m| m.session_id != session_id);
        write_json_array(&self.meta_path, &guard).await
    }

    pub async fn list_metas(&self) -> Vec<SessionMeta> {
        self.metas.lock().await.clone()
    }

    pub async fn find_meta_by_thread(&self, thread_id: &str) -> Option<SessionMeta> {
        self.metas
            .lock()
            .await
            .iter()
            .find(|m| m.thread_id.as_deref() == Some(thread_id))
            .cloned()
    }

    /// Atomically revive a session for reuse: clear run-state and return the
    /// updated record.
    pub async fn revive_session(&self, id: &str) -> Result<Option<Session>> {
        let mut guard = self.sessions.lock().await;
        let Some(slot) = guard.iter_mut().find(|r| r.session.id == id) else {
            return Ok(None);
        };
        slot.session.revive();
        let out = slot.session.clone();
        write_json_array(&self.sessions_path, &guard).await?;
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionStatus;

    fn sample(id: &str) -> SessionRecord {
        SessionRecord {
            session: Session {
                id: id.to_string(),
                provider: "claude".into(),
                cwd: "/tmp".into(),
                env: vec![],
                title: "t".into(),
                status: SessionStatus::Inactive,
                created_at: crate::model::now_rfc3339(),
                pid: None,
                exit_code: None,
                exited_at: None,
            },
            source: SessionSource::Internal,
        }
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SessionStore::open(dir.path()).await.unwrap();
            store.upsert_session(sample("s1")).await.unwrap();
        }
        let reopened = SessionStore::open(dir.path()).await.unwrap();
        assert!(reopened.get_session("s1").await.is_some());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        store.upsert_session(sample("s1")).await.unwrap();
        store.delete_session("s1").await.unwrap();
        store.delete_session("s1").await.unwrap();
        assert!(store.get_session("s1").await.is_none());
    }
}
