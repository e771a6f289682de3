//! Codex live session — §4.3. One `codex app-server` subprocess per
//! session speaking line-delimited JSON-RPC 2.0 on stdio. A read-loop
//! demultiplexes each line into a response (has `id`, no `method`), a
//! request from the provider (has both), or a notification (has `method`,
//! no `id`); pending requests are tracked in `{request_id → channel}`
//! (§5 "pending-request table").

use super::{
    ApprovalCapableSession, NotificationPublisher, StatusFlagProbe, TurnCapableSession,
    TurnCapableSessionFactory, TurnInput, TurnOptions, TurnState,
};
use crate::config::ProviderProfile;
use crate::error::ArchonError;
use crate::hub::{Hub, Subscription};
use crate::model::{
    Approval, CodexEvent, Item, ItemType, NotificationEvent, NotificationTrigger, Session, SessionMeta,
};
use crate::store::{ApprovalStore, ItemStore};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};

const RPC_TIMEOUT: Duration = Duration::from_secs(5);
const MISSING_ROLLOUT_RETRIES: u32 = 3;

type PendingTable = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value, ArchonError>>>>>;

pub struct CodexLiveSession {
    session_id: String,
    cwd: String,
    model: Option<String>,
    additional_directories: Vec<String>,
    thread_id: Mutex<Option<String>>,
    turn_state: TurnState,
    busy: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    killed_explicitly: Arc<AtomicBool>,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    next_id: AtomicI64,
    pending: PendingTable,
    events: Hub<CodexEvent>,
    approvals: Arc<ApprovalStore>,
    items: Arc<ItemStore>,
    notifier: Mutex<Option<NotificationPublisher>>,
    workspace_id: Option<String>,
    worktree_id: Option<String>,
    last_assistant_text: Mutex<Option<String>>,
}

impl CodexLiveSession {
    pub async fn spawn(
        session: &Session,
        meta: &SessionMeta,
        command: &str,
        approvals: Arc<ApprovalStore>,
        items: Arc<ItemStore>,
    ) -> Result<Arc<Self>, ArchonError> {
        let mut cmd = Command::new(command);
        cmd.arg("app-server")
            .current_dir(&session.cwd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null());
        let mut child = cmd
            .spawn()
            .map_err(|e| ArchonError::unavailable(format!("failed to spawn codex app-server: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ArchonError::unavailable("codex app-server stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ArchonError::unavailable("codex app-server stdout unavailable"))?;

        let live = Arc::new(Self {
            session_id: session.id.clone(),
            cwd: session.cwd.clone(),
            model: meta.runtime_options.get("model").and_then(|v| v.as_str()).map(String::from),
            additional_directories: Vec::new(),
            thread_id: Mutex::new(meta.thread_id.clone()),
            turn_state: TurnState::new(),
            busy: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            killed_explicitly: Arc::new(AtomicBool::new(false)),
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            next_id: AtomicI64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            events: Hub::default(),
            approvals,
            items,
            notifier: Mutex::new(None),
            workspace_id: meta.workspace_id.clone(),
            worktree_id: meta.worktree_id.clone(),
            last_assistant_text: Mutex::new(None),
        });

        live.send_request("initialize", json!({})).await.ok();
        live.send_notification("initialized", json!({})).await.ok();

        let reader = live.clone();
        tokio::spawn(async move {
            reader.read_loop(stdout).await;
        });

        Ok(live)
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), ArchonError> {
        let msg = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.write_line(&msg).await
    }

    async fn write_line(&self, msg: &Value) -> Result<(), ArchonError> {
        let mut line = serde_json::to_string(msg).map_err(|e| ArchonError::Internal(e.into()))?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ArchonError::unavailable(format!("codex app-server write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| ArchonError::unavailable(format!("codex app-server flush failed: {e}")))
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value, ArchonError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        let msg = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if let Err(e) = self.write_line(&msg).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }
        match tokio::time::timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ArchonError::unavailable("codex app-server closed before responding")),
            Err(_) => Err(ArchonError::unavailable(format!("{method} timed out"))),
        }
    }

    async fn read_loop(self: Arc<Self>, stdout: tokio::process::ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(l)) => l,
                Ok(None) | Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            let msg: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let has_id = msg.get("id").is_some();
            let has_method = msg.get("method").is_some();
            if has_id && !has_method {
                if let Some(id) = msg.get("id").and_then(Value::as_i64) {
                    if let Some(tx) = self.pending.lock().await.remove(&id) {
                        let result = if let Some(err) = msg.get("error") {
                            Err(classify_rpc_error(err))
                        } else {
                            Ok(msg.get("result").cloned().unwrap_or(Value::Null))
                        };
                        let _ = tx.send(result);
                    }
                }
            } else if has_id && has_method {
                let id = msg.get("id").and_then(Value::as_i64).unwrap_or_default();
                let method = msg.get("method").and_then(Value::as_str).unwrap_or_default();
                let params = msg.get("params").cloned().unwrap_or(Value::Null);
                self.handle_request(id, method, params).await;
            } else if has_method {
                let method = msg.get("method").and_then(Value::as_str).unwrap_or_default();
                let params = msg.get("params").cloned().unwrap_or(Value::Null);
                self.handle_notification(method, params).await;
            }
        }
        self.closed.store(true, Ordering::Release);
        for (_, tx) in self.pending.lock().await.drain() {
            let _ = tx.send(Err(ArchonError::unavailable("io_closed")));
        }
        if !self.killed_explicitly.load(Ordering::Acquire) {
            self.publish_exit_status().await;
        }
    }

    /// §3/§7 terminal-state notification for the un-prompted exit path: the
    /// app-server's stdout closed without an explicit `close()` call, so the
    /// exit is either a clean shutdown or a crash, never a kill.
    async fn publish_exit_status(&self) {
        let exit_code = self.child.lock().await.wait().await.ok().and_then(|s| s.code());
        let (trigger, status) = match exit_code {
            Some(0) => (NotificationTrigger::SessionExited, "exited"),
            _ => (NotificationTrigger::SessionFailed, "failed"),
        };
        if let Some(notifier) = self.notifier.lock().await.clone() {
            notifier.publish(NotificationEvent {
                trigger,
                session_id: self.session_id.clone(),
                workspace_id: self.workspace_id.clone(),
                worktree_id: self.worktree_id.clone(),
                turn_id: None,
                status: status.to_string(),
                source: "codex_process_exit".to_string(),
                payload: json!({ "exit_code": exit_code }),
            });
        }
    }

    async fn handle_notification(&self, method: &str, params: Value) {
        self.events.publish(CodexEvent {
            id: None,
            method: method.to_string(),
            params: params.clone(),
            ts: crate::model::now_rfc3339(),
        });
        if method.starts_with("item/agentMessage") {
            if let Some(text) = params.get("item").and_then(|i| i.get("text")).and_then(Value::as_str).or_else(|| params.get("text").and_then(Value::as_str)) {
                if !text.is_empty() {
                    *self.last_assistant_text.lock().await = Some(text.to_string());
                }
            }
        }
        if method == "turn/completed" {
            self.busy.store(false, Ordering::Release);
            let status = params
                .get("turn")
                .and_then(|t| t.get("status"))
                .and_then(Value::as_str)
                .unwrap_or("completed")
                .to_string();
            let error = params
                .get("turn")
                .and_then(|t| t.get("error"))
                .cloned();
            let turn_id = params
                .get("turn")
                .and_then(|t| t.get("id"))
                .and_then(Value::as_str)
                .map(String::from);
            // Clear before publishing (§5 ordering).
            self.turn_state.clear().await;
            if let Some(notifier) = self.notifier.lock().await.clone() {
                let mut payload = json!({ "turn_status": status.clone() });
                if let Some(err) = error {
                    payload["turn_error"] = err;
                }
                if let Some(text) = self.last_assistant_text.lock().await.take() {
                    payload["turn_output"] = json!(text);
                    payload["assistant_evidence_key"] = json!(crate::util::evidence_key_for(&text));
                }
                notifier.publish(NotificationEvent {
                    trigger: NotificationTrigger::TurnCompleted,
                    session_id: self.session_id.clone(),
                    workspace_id: self.workspace_id.clone(),
                    worktree_id: self.worktree_id.clone(),
                    turn_id,
                    status,
                    source: "live_session_event".to_string(),
                    payload,
                });
            }
        } else if method == "turn/started" {
            self.busy.store(true, Ordering::Release);
        }
    }

    async fn handle_request(&self, id: i64, method: &str, params: Value) {
        if method == "item/commandExecution/requestApproval" || method == "item/fileChange/requestApproval" {
            let approval = Approval {
                session_id: self.session_id.clone(),
                request_id: id,
                method: method.to_string(),
                params: params.clone(),
                created_at: crate::model::now_rfc3339(),
            };
            let _ = self.approvals.store(approval).await;
            self.log_rpc_item(method, id, Some(params.clone())).await;
            if let Some(notifier) = self.notifier.lock().await.clone() {
                notifier.publish(NotificationEvent {
                    trigger: NotificationTrigger::TurnCompleted,
                    session_id: self.session_id.clone(),
                    workspace_id: self.workspace_id.clone(),
                    worktree_id: self.worktree_id.clone(),
                    turn_id: None,
                    status: "approval_required".to_string(),
                    source: format!("approval_request:{}:{}", self.session_id, id),
                    payload: json!({ "method": method, "request_id": id }),
                });
            }
        }
    }

    async fn start_turn_inner(&self, input: &TurnInput, opts: &TurnOptions) -> Result<String, ArchonError> {
        let mut attempts = 0;
        loop {
            let thread_id = match self.resolve_thread_id(opts).await {
                Ok(id) => id,
                Err(e) if is_missing_rollout(&e) && attempts < MISSING_ROLLOUT_RETRIES => {
                    attempts += 1;
                    *self.thread_id.lock().await = None;
                    tokio::time::sleep(Duration::from_millis(200 * attempts as u64)).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let result = self
                .send_request(
                    "turn/start",
                    json!({
                        "threadId": thread_id,
                        "input": [{ "type": "text", "text": input.text }],
                        "model": opts.model.as_ref().or(self.model.as_ref()),
                    }),
                )
                .await;
            match result {
                Ok(value) => {
                    let turn_id = value
                        .get("turn")
                        .and_then(|t| t.get("id"))
                        .and_then(Value::as_str)
                        .ok_or_else(|| ArchonError::Internal(anyhow::anyhow!("turn/start missing turn.id")))?
                        .to_string();
                    self.busy.store(true, Ordering::Release);
                    return Ok(turn_id);
                }
                Err(e) if is_missing_rollout(&e) && attempts < MISSING_ROLLOUT_RETRIES => {
                    attempts += 1;
                    *self.thread_id.lock().await = None;
                    tokio::time::sleep(Duration::from_millis(200 * attempts as u64)).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resolve the thread to run a turn against. A cached thread id is
    /// validated with `thread/resume` rather than trusted blindly — the
    /// app-server may have lost the rollout backing it (e.g. after a daemon
    /// restart against a stale `SessionMeta.thread_id`) — so a rejection here
    /// surfaces the same missing-rollout error `start_turn_inner` retries on.
    async fn resolve_thread_id(&self, opts: &TurnOptions) -> Result<String, ArchonError> {
        if let Some(id) = self.thread_id.lock().await.clone() {
            let result = self.send_request("thread/resume", json!({ "threadId": id })).await?;
            let resumed_id = result
                .get("thread")
                .and_then(|t| t.get("id"))
                .and_then(Value::as_str)
                .unwrap_or(id.as_str())
                .to_string();
            *self.thread_id.lock().await = Some(resumed_id.clone());
            return Ok(resumed_id);
        }
        let result = self
            .send_request(
                "thread/start",
                json!({
                    "model": opts.model.as_ref().or(self.model.as_ref()),
                    "cwd": self.cwd,
                    "additionalDirectories": opts.additional_directories,
                }),
            )
            .await?;
        let thread_id = result
            .get("thread")
            .and_then(|t| t.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| ArchonError::Internal(anyhow::anyhow!("thread/start missing thread.id")))?
            .to_string();
        *self.thread_id.lock().await = Some(thread_id.clone());
        Ok(thread_id)
    }

    pub async fn current_thread_id(&self) -> Option<String> {
        self.thread_id.lock().await.clone()
    }

    /// Durable record of one RPC request/response item, keyed by
    /// `rpc_method`/`rpc_id` — the transcript a restarted daemon scans (§4.9)
    /// to reconstruct still-pending approvals when no live connection to
    /// this process survives the restart.
    async fn log_rpc_item(&self, method: &str, id: i64, params: Option<Value>) {
        let mut item = Item::new(ItemType::Log, crate::model::now_rfc3339());
        item.fields.insert("rpc_method".to_string(), json!(method));
        item.fields.insert("rpc_id".to_string(), json!(id));
        if let Some(params) = params {
            item.fields.insert("rpc_params".to_string(), params);
        }
        let _ = self.items.append(&self.session_id, &item).await;
    }
}

fn is_missing_rollout(err: &ArchonError) -> bool {
    err.to_string().to_ascii_lowercase().contains("no rollout found for thread id")
}

fn classify_rpc_error(err: &Value) -> ArchonError {
    let message = err.get("message").and_then(Value::as_str).unwrap_or("codex app-server error");
    ArchonError::unavailable(message.to_string())
}

#[async_trait]
impl TurnCapableSession for CodexLiveSession {
    async fn start_turn(&self, input: TurnInput, opts: TurnOptions) -> Result<String, ArchonError> {
        let probe = StatusFlagProbe::new(self.busy.clone());
        let thread_id = self.thread_id.lock().await.clone();
        self.turn_state
            .reserve(&probe, thread_id.as_deref(), || self.start_turn_inner(&input, &opts))
            .await
    }

    async fn interrupt(&self) -> Result<(), ArchonError> {
        let thread_id = self.thread_id.lock().await.clone();
        let turn_id = self.turn_state.active_turn_id().await;
        if let (Some(thread_id), Some(turn_id)) = (thread_id, turn_id) {
            self.send_request("turn/interrupt", json!({ "threadId": thread_id, "turnId": turn_id }))
                .await?;
        }
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
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.killed_explicitly.store(true, Ordering::Release);
        let _ = self.child.lock().await.start_kill();
        if let Some(notifier) = self.notifier.lock().await.clone() {
            notifier.publish(NotificationEvent {
                trigger: NotificationTrigger::SessionKilled,
                session_id: self.session_id.clone(),
                workspace_id: self.workspace_id.clone(),
                worktree_id: self.worktree_id.clone(),
                turn_id: None,
                status: "killed".to_string(),
                source: "codex_explicit_close".to_string(),
                payload: json!({}),
            });
        }
    }

    fn set_notifier(&self, notifier: NotificationPublisher) {
        if let Ok(mut guard) = self.notifier.try_lock() {
            *guard = Some(notifier);
        }
    }

    fn as_approval_capable(&self) -> Option<&dyn ApprovalCapableSession> {
        Some(self)
    }
}

#[async_trait]
impl ApprovalCapableSession for CodexLiveSession {
    async fn respond(&self, request_id: i64, decision: Value) -> Result<(), ArchonError> {
        let msg = json!({ "jsonrpc": "2.0", "id": request_id, "result": decision });
        self.write_line(&msg).await?;
        let _ = self.approvals.delete(&self.session_id, request_id).await;
        self.log_rpc_item("turn/respondToRequest", request_id, None).await;
        Ok(())
    }
}

pub struct CodexLiveSessionFactory {
    pub profile: ProviderProfile,
    pub approvals: Arc<ApprovalStore>,
    pub items: Arc<ItemStore>,
}

#[async_trait]
impl TurnCapableSessionFactory for CodexLiveSessionFactory {
    async fn create(
        &self,
        session: &Session,
        meta: &SessionMeta,
        notifier: NotificationPublisher,
    ) -> Result<Arc<dyn TurnCapableSession>, ArchonError> {
        let command = self.profile.command.as_deref().unwrap_or("codex");
        let live = CodexLiveSession::spawn(session, meta, command, self.approvals.clone(), self.items.clone()).await?;
        live.set_notifier(notifier);
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_missing_rollout_case_insensitively() {
        let err = ArchonError::unavailable("No rollout found for thread ID thr-stale");
        assert!(is_missing_rollout(&err));
        let other = ArchonError::unavailable("some other failure");
        assert!(!is_missing_rollout(&other));
    }
}
