//! Claude live session — §4.4. Transport is a subprocess spawned fresh for
//! every turn: `claude --print --verbose --output-format stream-json
//! [--resume <id>] <text>`. Stdout is parsed line by line into canonical
//! items by the `SawDelta`/`SawMessage` state machine below.

use super::{NoopBusyProbe, NotificationPublisher, TurnCapableSession, TurnCapableSessionFactory, TurnInput, TurnOptions, TurnState};
use crate::config::ProviderProfile;
use crate::error::ArchonError;
use crate::hub::{Hub, Subscription};
use crate::model::{CodexEvent, Item, ItemType, NotificationEvent, NotificationTrigger, Session, SessionMeta};
use crate::store::ItemStore;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;

/// Item kinds whose appearance after a send marks the turn as having
/// produced visible output (§4.4 completion heuristic).
fn counts_as_output(kind: &ItemType) -> bool {
    matches!(
        kind,
        ItemType::AgentMessage
            | ItemType::AgentMessageDelta
            | ItemType::AgentMessageEnd
            | ItemType::Assistant
            | ItemType::Reasoning
            | ItemType::Result
    )
}

#[derive(Default)]
struct ParseState {
    saw_delta: bool,
    saw_message: bool,
}

pub struct ClaudeLiveSession {
    session_id: String,
    cwd: String,
    command: String,
    resume_id: Mutex<Option<String>>,
    turn_state: TurnState,
    closed: AtomicBool,
    events: Hub<CodexEvent>,
    items: Arc<ItemStore>,
    notifier: Mutex<Option<NotificationPublisher>>,
    workspace_id: Option<String>,
    worktree_id: Option<String>,
    last_source: Mutex<String>,
    last_exit_code: Mutex<Option<i32>>,
    last_assistant_text: Mutex<Option<String>>,
}

impl ClaudeLiveSession {
    pub fn new(session: &Session, meta: &SessionMeta, command: &str, items: Arc<ItemStore>) -> Arc<Self> {
        Arc::new(Self {
            session_id: session.id.clone(),
            cwd: session.cwd.clone(),
            command: command.to_string(),
            resume_id: Mutex::new(meta.provider_session_id.clone()),
            turn_state: TurnState::new(),
            closed: AtomicBool::new(false),
            events: Hub::default(),
            items,
            notifier: Mutex::new(None),
            workspace_id: meta.workspace_id.clone(),
            worktree_id: meta.worktree_id.clone(),
            last_source: Mutex::new(String::new()),
            last_exit_code: Mutex::new(None),
            last_assistant_text: Mutex::new(None),
        })
    }

    async fn run_turn(&self, input: &TurnInput) -> Result<String, ArchonError> {
        let turn_id = crate::util::new_turn_id();
        let resume = self.resume_id.lock().await.clone();
        let (saw_output, hit_session_not_found) = self.spawn_and_parse(&input.text, resume.as_deref()).await?;

        let (saw_output, hit_session_not_found) = if hit_session_not_found && resume.is_some() {
            *self.resume_id.lock().await = None;
            self.spawn_and_parse(&input.text, None).await?
        } else {
            (saw_output, hit_session_not_found)
        };
        let _ = hit_session_not_found;

        let source = if saw_output {
            "claude_items_post_send"
        } else {
            "claude_sync_send_completed"
        };
        *self.last_source.lock().await = source.to_string();
        Ok(turn_id)
    }

    /// Spawn `claude` for one turn, parse its stdout, and return
    /// `(saw_output_item, hit_session_not_found)`.
    async fn spawn_and_parse(&self, text: &str, resume: Option<&str>) -> Result<(bool, bool), ArchonError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(["--print", "--verbose", "--output-format", "stream-json"]);
        if let Some(id) = resume {
            cmd.args(["--resume", id]);
        }
        cmd.arg(text);
        let mut child = cmd
            .current_dir(&self.cwd)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdin(std::process::Stdio::null())
            .spawn()
            .map_err(|e| ArchonError::unavailable(format!("failed to spawn claude: {e}")))?;

        let stdout = child.stdout.take().ok_or_else(|| ArchonError::unavailable("no stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| ArchonError::unavailable("no stderr"))?;

        let mut stderr_lines = BufReader::new(stderr).lines();
        let stderr_task = tokio::spawn(async move {
            let mut hit = false;
            while let Ok(Some(line)) = stderr_lines.next_line().await {
                let lower = line.to_ascii_lowercase();
                if lower.contains("session_not_found") || lower.contains("no conversation found") {
                    hit = true;
                }
            }
            hit
        });

        let mut state = ParseState::default();
        let mut saw_output = false;
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(_) => continue,
            };
            for item in self.handle_line(&value, &mut state).await {
                if counts_as_output(&item.kind) {
                    saw_output = true;
                    if let Some(text) = &item.text {
                        *self.last_assistant_text.lock().await = Some(text.clone());
                    }
                }
                let _ = self.items.append(&self.session_id, &item).await;
                self.events.publish(CodexEvent {
                    id: None,
                    method: "item/appended".to_string(),
                    params: serde_json::to_value(&item).unwrap_or(Value::Null),
                    ts: crate::model::now_rfc3339(),
                });
            }
        }
        let exit_code = child.wait().await.ok().and_then(|s| s.code());
        *self.last_exit_code.lock().await = exit_code;
        let hit_session_not_found = stderr_task.await.unwrap_or(false);
        Ok((saw_output, hit_session_not_found))
    }

    async fn handle_line(&self, value: &Value, state: &mut ParseState) -> Vec<Item> {
        let mut out = Vec::new();
        let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
        let now = crate::model::now_rfc3339();
        match kind {
            "user" => {
                if let Some(text) = extract_thinking_block(value) {
                    let mut item = Item::new(ItemType::Reasoning, now);
                    item.text = Some(text);
                    out.push(item);
                }
            }
            "assistant" => {
                let text = extract_assistant_text(value);
                match text {
                    Some(text) if !text.is_empty() => {
                        if state.saw_delta {
                            out.push(Item::new(ItemType::AgentMessageEnd, now));
                            state.saw_delta = false;
                            state.saw_message = true;
                        } else {
                            let mut item = Item::new(ItemType::AgentMessage, now);
                            item.text = Some(text);
                            out.push(item);
                        }
                    }
                    _ => {
                        if state.saw_delta {
                            out.push(Item::new(ItemType::AgentMessageEnd, now));
                            state.saw_delta = false;
                        }
                    }
                }
            }
            "system" => {
                if value.get("subtype").and_then(Value::as_str) == Some("init") {
                    if let Some(sid) = value.get("session_id").and_then(Value::as_str) {
                        *self.resume_id.lock().await = Some(sid.to_string());
                    }
                }
                let mut item = Item::new(ItemType::Log, now);
                item.fields.insert("raw".to_string(), value.clone());
                out.push(item);
            }
            "stream_event" => {
                let event = value.get("event").unwrap_or(value);
                let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
                if event_type == "message_start" {
                    state.saw_delta = false;
                    state.saw_message = false;
                } else if let Some(text) = event.get("delta").and_then(|d| d.get("text")).and_then(Value::as_str) {
                    let mut item = Item::new(ItemType::AgentMessageDelta, now);
                    item.text = Some(text.to_string());
                    out.push(item);
                    state.saw_delta = true;
                }
            }
            "result" => {
                if let Some(sid) = value.get("session_id").and_then(Value::as_str) {
                    *self.resume_id.lock().await = Some(sid.to_string());
                }
                if state.saw_delta {
                    out.push(Item::new(ItemType::AgentMessageEnd, now));
                    state.saw_delta = false;
                } else if let Some(text) = value.get("result").and_then(Value::as_str) {
                    let mut item = Item::new(ItemType::AgentMessage, now);
                    item.text = Some(text.to_string());
                    out.push(item);
                }
            }
            "rate_limit_event" => {
                if value.get("status").and_then(Value::as_str) != Some("allowed") {
                    let mut item = Item::new(ItemType::RateLimit, now);
                    item.fields.insert("provider".to_string(), json!("claude"));
                    for field in ["status", "limit_type", "overage_status", "retry_unix", "retry_at"] {
                        if let Some(v) = value.get(field) {
                            item.fields.insert(field.to_string(), v.clone());
                        }
                    }
                    out.push(item);
                }
            }
            _ => {
                let mut item = Item::new(ItemType::Log, now);
                item.fields.insert("raw".to_string(), value.clone());
                out.push(item);
            }
        }
        out
    }

    async fn publish_completion(&self, turn_id: &str) {
        self.turn_state.clear().await;
        let source = self.last_source.lock().await.clone();
        let exit_code = self.last_exit_code.lock().await.take();
        let succeeded = exit_code.unwrap_or(0) == 0;
        let status = if succeeded { "completed" } else { "failed" };
        let assistant_text = self.last_assistant_text.lock().await.clone();
        if let Some(notifier) = self.notifier.lock().await.clone() {
            let mut payload = json!({ "turn_status": status });
            if let Some(text) = &assistant_text {
                payload["turn_output"] = json!(text);
                payload["assistant_evidence_key"] = json!(crate::util::evidence_key_for(text));
            }
            notifier.publish(NotificationEvent {
                trigger: NotificationTrigger::TurnCompleted,
                session_id: self.session_id.clone(),
                workspace_id: self.workspace_id.clone(),
                worktree_id: self.worktree_id.clone(),
                turn_id: Some(turn_id.to_string()),
                status: status.to_string(),
                source,
                payload,
            });
            if !succeeded {
                notifier.publish(NotificationEvent {
                    trigger: NotificationTrigger::SessionFailed,
                    session_id: self.session_id.clone(),
                    workspace_id: self.workspace_id.clone(),
                    worktree_id: self.worktree_id.clone(),
                    turn_id: Some(turn_id.to_string()),
                    status: "failed".to_string(),
                    source: "claude_process_exit".to_string(),
                    payload: json!({ "exit_code": exit_code }),
                });
            }
        }
    }
}

fn extract_thinking_block(value: &Value) -> Option<String> {
    let content = value.get("message").and_then(|m| m.get("content"))?.as_array()?;
    content.iter().find_map(|block| {
        if block.get("type").and_then(Value::as_str) == Some("thinking") {
            block.get("thinking").and_then(Value::as_str).map(String::from)
        } else {
            None
        }
    })
}

fn extract_assistant_text(value: &Value) -> Option<String> {
    let content = value.get("message").and_then(|m| m.get("content"))?.as_array()?;
    let text: String = content
        .iter()
        .filter_map(|block| {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                block.get("text").and_then(Value::as_str)
            } else {
                None
            }
        })
        .collect();
    Some(text)
}

#[async_trait]
impl TurnCapableSession for ClaudeLiveSession {
    async fn start_turn(&self, input: TurnInput, _opts: TurnOptions) -> Result<String, ArchonError> {
        let probe = NoopBusyProbe;
        let turn_id = self.turn_state.reserve(&probe, None, || self.run_turn(&input)).await?;
        self.publish_completion(&turn_id).await;
        Ok(turn_id)
    }

    async fn interrupt(&self) -> Result<(), ArchonError> {
        // Best-effort: the subprocess is short-lived and not retained across
        // turns, so there is nothing to signal between turns.
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

pub struct ClaudeLiveSessionFactory {
    pub profile: ProviderProfile,
    pub items: Arc<ItemStore>,
}

#[async_trait]
impl TurnCapableSessionFactory for ClaudeLiveSessionFactory {
    async fn create(
        &self,
        session: &Session,
        meta: &SessionMeta,
        notifier: NotificationPublisher,
    ) -> Result<Arc<dyn TurnCapableSession>, ArchonError> {
        let command = self.profile.command.as_deref().unwrap_or("claude");
        let live = ClaudeLiveSession::new(session, meta, command, self.items.clone());
        live.set_notifier(notifier);
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_text_after_delta_only_emits_end() {
        let mut state = ParseState { saw_delta: true, saw_message: false };
        assert!(state.saw_delta);
        state.saw_delta = false;
        state.saw_message = true;
        assert!(!state.saw_delta);
        assert!(state.saw_message);
    }

    #[test]
    fn rate_limit_status_allowed_is_dropped() {
        let value = json!({ "type": "rate_limit_event", "status": "allowed" });
        assert_eq!(value.get("status").and_then(Value::as_str), Some("allowed"));
    }
}
