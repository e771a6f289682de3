//! `exec` live session — §2 "generic subprocess". No structured wire
//! protocol: stdout/stderr lines are piped straight to the item log as
//! `raw` items, and the turn completes when the process exits.

use super::{NoopBusyProbe, NotificationPublisher, TurnCapableSession, TurnCapableSessionFactory, TurnInput, TurnOptions, TurnState};
use crate::config::ProviderProfile;
use crate::error::ArchonError;
use crate::hub::{Hub, Subscription};
use crate::model::{CodexEvent, Item, ItemType, NotificationEvent, NotificationTrigger, Session, SessionMeta};
use crate::store::ItemStore;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;

pub struct ExecLiveSession {
    session_id: String,
    cwd: String,
    command: String,
    turn_state: TurnState,
    closed: AtomicBool,
    last_exit_code: Mutex<Option<i32>>,
    events: Hub<CodexEvent>,
    items: Arc<ItemStore>,
    notifier: Mutex<Option<NotificationPublisher>>,
    workspace_id: Option<String>,
    worktree_id: Option<String>,
}

impl ExecLiveSession {
    pub fn new(session: &Session, meta: &SessionMeta, command: &str, items: Arc<ItemStore>) -> Arc<Self> {
        Arc::new(Self {
            session_id: session.id.clone(),
            cwd: session.cwd.clone(),
            command: command.to_string(),
            turn_state: TurnState::new(),
            closed: AtomicBool::new(false),
            last_exit_code: Mutex::new(None),
            events: Hub::default(),
            items,
            notifier: Mutex::new(None),
            workspace_id: meta.workspace_id.clone(),
            worktree_id: meta.worktree_id.clone(),
        })
    }

    async fn run_turn(&self, input: &TurnInput) -> Result<String, ArchonError> {
        let turn_id = crate::util::new_turn_id();
        let mut child = Command::new(&self.command)
            .arg(&input.text)
            .current_dir(&self.cwd)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdin(std::process::Stdio::null())
            .spawn()
            .map_err(|e| ArchonError::unavailable(format!("failed to spawn {}: {e}", self.command)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        if let Some(stdout) = stdout {
            self.pipe_stream(stdout, "stdout").await;
        }
        if let Some(stderr) = stderr {
            self.pipe_stream(stderr, "stderr").await;
        }
        let exit_code = child.wait().await.ok().and_then(|s| s.code());
        *self.last_exit_code.lock().await = exit_code;
        Ok(turn_id)
    }

    async fn pipe_stream<R: tokio::io::AsyncRead + Unpin>(&self, reader: R, stream: &str) {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut item = Item::new(ItemType::Raw, crate::model::now_rfc3339());
            item.text = Some(line);
            item.fields.insert("stream".to_string(), json!(stream));
            let _ = self.items.append(&self.session_id, &item).await;
            self.events.publish(CodexEvent {
                id: None,
                method: "item/appended".to_string(),
                params: serde_json::to_value(&item).unwrap_or(serde_json::Value::Null),
                ts: crate::model::now_rfc3339(),
            });
        }
    }
}

#[async_trait]
impl TurnCapableSession for ExecLiveSession {
    async fn start_turn(&self, input: TurnInput, _opts: TurnOptions) -> Result<String, ArchonError> {
        let probe = NoopBusyProbe;
        let turn_id = self.turn_state.reserve(&probe, None, || self.run_turn(&input)).await?;
        self.turn_state.clear().await;
        let exit_code = self.last_exit_code.lock().await.take();
        let succeeded = exit_code.unwrap_or(0) == 0;
        let status = if succeeded { "completed" } else { "failed" };
        if let Some(notifier) = self.notifier.lock().await.clone() {
            notifier.publish(NotificationEvent {
                trigger: NotificationTrigger::TurnCompleted,
                session_id: self.session_id.clone(),
                workspace_id: self.workspace_id.clone(),
                worktree_id: self.worktree_id.clone(),
                turn_id: Some(turn_id.clone()),
                status: status.to_string(),
                source: "exec_process_exit".to_string(),
                payload: json!({
                    "turn_status": status,
                    "assistant_evidence_key": format!("{}:{turn_id}", self.session_id),
                    "turn_output": status,
                }),
            });
            if !succeeded {
                notifier.publish(NotificationEvent {
                    trigger: NotificationTrigger::SessionFailed,
                    session_id: self.session_id.clone(),
                    workspace_id: self.workspace_id.clone(),
                    worktree_id: self.worktree_id.clone(),
                    turn_id: Some(turn_id.clone()),
                    status: "failed".to_string(),
                    source: "exec_process_exit".to_string(),
                    payload: json!({ "exit_code": exit_code }),
                });
            }
        }
        Ok(turn_id)
    }

    async fn interrupt(&self) -> Result<(), ArchonError> {
        Ok(())
    }

    async fn active_turn_id(&self) -> Option<String> {
        self.turn_state.active_turn_id().await
    }

    fn subscribe(&self) -> Subscription<CodexEvent> {
        self.events.subscribe()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn set_notifier(&self, notifier: NotificationPublisher) {
        if let Ok(mut guard) = self.notifier.try_lock() {
            *guard = Some(notifier);
        }
    }
}

pub struct ExecLiveSessionFactory {
    pub profile: ProviderProfile,
    pub items: Arc<ItemStore>,
}

#[async_trait]
impl TurnCapableSessionFactory for ExecLiveSessionFactory {
    async fn create(
        &self,
        session: &Session,
        meta: &SessionMeta,
        notifier: NotificationPublisher,
    ) -> Result<Arc<dyn TurnCapableSession>, ArchonError> {
        let command = self
            .profile
            .command
            .clone()
            .ok_or_else(|| ArchonError::invalid("exec provider requires a command"))?;
        let live = ExecLiveSession::new(session, meta, &command, self.items.clone());
        live.set_notifier(notifier);
        Ok(live)
    }
}
