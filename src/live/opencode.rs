//! OpenCode / Kilocode live session — §4.5. Transport is an HTTP base URL
//! with an `/event` SSE stream; both providers speak the same wire shape,
//! so one adapter serves both (`kilocode` only differs in base URL/token
//! env vars, resolved in config).

use super::{
    ApprovalCapableSession, NoopBusyProbe, NotificationPublisher, StatusFlagProbe,
    TurnCapableSession, TurnCapableSessionFactory, TurnInput, TurnOptions, TurnState,
};
use crate::config::ProviderProfile;
use crate::error::ArchonError;
use crate::hub::{Hub, Subscription};
use crate::model::{
    Approval, CodexEvent, Item, ItemType, NotificationEvent, NotificationTrigger, Session, SessionMeta,
};
use crate::reconcile::HistoryReconciler;
use crate::store::{ApprovalStore, ItemStore};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

const AUTO_START_BUDGET: Duration = Duration::from_secs(12);

pub struct OpencodeLiveSession {
    session_id: String,
    base_url: String,
    token: Option<String>,
    directory: String,
    provider_session_id: Mutex<Option<String>>,
    turn_state: TurnState,
    busy: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    events: Hub<CodexEvent>,
    items: Arc<ItemStore>,
    approvals: Arc<ApprovalStore>,
    reconciler: HistoryReconciler,
    notifier: Mutex<Option<NotificationPublisher>>,
    client: reqwest::Client,
    workspace_id: Option<String>,
    worktree_id: Option<String>,
    permission_index: Mutex<HashMap<i32, String>>,
    idle_notify: Arc<Notify>,
    turn_completed_payload: Mutex<Option<Value>>,
    self_weak: std::sync::Mutex<Option<std::sync::Weak<Self>>>,
    post_send_reconcile: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl OpencodeLiveSession {
    pub fn spawn(
        session: &Session,
        meta: &SessionMeta,
        base_url: &str,
        token: Option<String>,
        items: Arc<ItemStore>,
        approvals: Arc<ApprovalStore>,
    ) -> Arc<Self> {
        let live = Arc::new(Self {
            session_id: session.id.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            directory: session.cwd.clone(),
            provider_session_id: Mutex::new(meta.provider_session_id.clone()),
            turn_state: TurnState::new(),
            busy: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            events: Hub::default(),
            items: items.clone(),
            approvals,
            reconciler: HistoryReconciler::new(items),
            notifier: Mutex::new(None),
            client: reqwest::Client::new(),
            workspace_id: meta.workspace_id.clone(),
            worktree_id: meta.worktree_id.clone(),
            permission_index: Mutex::new(HashMap::new()),
            idle_notify: Arc::new(Notify::new()),
            turn_completed_payload: Mutex::new(None),
            self_weak: std::sync::Mutex::new(None),
            post_send_reconcile: Mutex::new(None),
        });
        *live.self_weak.lock().unwrap() = Some(Arc::downgrade(&live));
        let listener = live.clone();
        tokio::spawn(async move {
            listener.subscribe_loop().await;
        });
        live
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn ensure_provider_session(&self) -> Result<String, ArchonError> {
        if let Some(id) = self.provider_session_id.lock().await.clone() {
            return Ok(id);
        }
        let deadline = tokio::time::Instant::now() + AUTO_START_BUDGET;
        let mut backoff = Duration::from_millis(250);
        loop {
            let resp = self
                .auth(self.client.post(format!("{}/session", self.base_url)))
                .json(&json!({ "title": "archon", "directory": self.directory }))
                .send()
                .await;
            match resp {
                Ok(r) if r.status().is_success() => {
                    let body: Value = r.json().await.map_err(|e| ArchonError::unavailable(e.to_string()))?;
                    let id = body
                        .get("id")
                        .and_then(Value::as_str)
                        .ok_or_else(|| ArchonError::Internal(anyhow::anyhow!("opencode session response missing id")))?
                        .to_string();
                    *self.provider_session_id.lock().await = Some(id.clone());
                    return Ok(id);
                }
                Ok(r) if r.status().as_u16() == 503 => {}
                Err(e) if e.is_connect() => {}
                Ok(r) => {
                    return Err(ArchonError::unavailable(format!("opencode create session failed: {}", r.status())));
                }
                Err(e) => return Err(ArchonError::unavailable(e.to_string())),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ArchonError::unavailable("opencode server did not become ready"));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(2));
        }
    }

    async fn run_turn(&self, input: &TurnInput) -> Result<String, ArchonError> {
        let turn_id = crate::util::new_turn_id();
        let provider_session_id = self.ensure_provider_session().await?;
        self.busy.store(true, Ordering::Release);
        *self.turn_completed_payload.lock().await = None;

        let url = format!(
            "{}/session/{}/message?directory={}",
            self.base_url,
            provider_session_id,
            urlencode(&self.directory)
        );
        let resp = self
            .auth(self.client.post(url))
            .json(&json!({ "parts": [{ "type": "text", "text": input.text }] }))
            .send()
            .await
            .map_err(|e| ArchonError::unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            self.busy.store(false, Ordering::Release);
            return Err(ArchonError::unavailable(format!("opencode prompt failed: {}", resp.status())));
        }

        self.spawn_post_send_reconcile(provider_session_id);

        // The SSE loop signals idle_notify when it sees session.idle /
        // session.status(idle) for this session; the prompt call itself may
        // return before that happens ("pending" sentinel per §4.5).
        let _ = tokio::time::timeout(Duration::from_secs(30), self.idle_notify.notified()).await;
        Ok(turn_id)
    }

    /// §4.6 post-send background reconciler: up to 9 attempts, 2s→10s
    /// backoff, stopping at the first backfill. Runs independent of the SSE
    /// stream so a dropped event doesn't leave local history stale; attached
    /// to the session's own lifetime and aborted on `close()`/a newer turn.
    fn spawn_post_send_reconcile(&self, provider_session_id: String) {
        let Some(weak) = self.self_weak.lock().unwrap().clone() else { return };
        let handle = tokio::spawn(async move {
            let Some(live) = weak.upgrade() else { return };
            let client = live.client.clone();
            let base_url = live.base_url.clone();
            let token = live.token.clone();
            let backfilled = live
                .reconciler
                .reconcile_until_backfill(&live.session_id, move || {
                    let client = client.clone();
                    let base_url = base_url.clone();
                    let token = token.clone();
                    let provider_session_id = provider_session_id.clone();
                    async move { fetch_remote_history(&client, &base_url, &provider_session_id, token.as_deref()).await }
                })
                .await;
            if live.closed.load(Ordering::Acquire) {
                return;
            }
            for item in &backfilled {
                live.emit("item/started", json!({})).await;
                let text = item.text.clone().unwrap_or_default();
                live.emit("item/agentMessage/delta", json!({ "delta": text })).await;
                live.emit("item/completed", json!({})).await;
            }
        });
        if let Ok(mut guard) = self.post_send_reconcile.try_lock() {
            if let Some(previous) = guard.replace(handle) {
                previous.abort();
            }
        }
    }

    async fn subscribe_loop(self: Arc<Self>) {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            let saw_completed = self.run_sse_once().await;
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            if !saw_completed {
                self.recover().await;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn run_sse_once(&self) -> bool {
        let resp = match self.auth(self.client.get(format!("{}/event", self.base_url))).send().await {
            Ok(r) => r,
            Err(_) => return false,
        };
        let mut saw_completed = false;
        let mut stream = resp.bytes_stream();
        let mut buf = String::new();
        while let Some(chunk) = stream.next().await {
            let Ok(bytes) = chunk else { break };
            buf.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = buf.find("\n\n") {
                let raw_event = buf[..pos].to_string();
                buf.drain(..pos + 2);
                for line in raw_event.lines() {
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Ok(value) = serde_json::from_str::<Value>(data) {
                            if self.handle_event(&value).await {
                                saw_completed = true;
                            }
                        }
                    }
                }
            }
        }
        saw_completed
    }

    /// Map one opencode SSE event to canonical `CodexEvent`s (§4.5 table).
    /// Returns true iff this event represents a `turn/completed`.
    async fn handle_event(&self, value: &Value) -> bool {
        let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
        match kind {
            "session.status" => {
                let busy = value.get("properties").and_then(|p| p.get("busy")).and_then(Value::as_bool).unwrap_or(false);
                self.busy.store(busy, Ordering::Release);
                if busy {
                    self.emit("turn/started", json!({})).await;
                    false
                } else {
                    self.emit_turn_completed("completed").await;
                    true
                }
            }
            "session.idle" => {
                self.busy.store(false, Ordering::Release);
                self.emit_turn_completed("completed").await;
                true
            }
            "session.error" => {
                let message = value.get("properties").and_then(|p| p.get("message")).cloned().unwrap_or(Value::Null);
                self.emit("error", json!({ "message": message })).await;
                let is_abort = value
                    .get("properties")
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    == Some("MessageAbortedError");
                if is_abort {
                    self.busy.store(false, Ordering::Release);
                    self.emit_turn_completed("interrupted").await;
                    true
                } else {
                    false
                }
            }
            "message.part.updated" => {
                self.handle_message_part(value).await;
                false
            }
            "permission.updated" => {
                self.handle_permission_updated(value).await;
                false
            }
            "permission.replied" => {
                self.emit("permission/replied", value.clone()).await;
                false
            }
            _ => false,
        }
    }

    async fn handle_message_part(&self, value: &Value) {
        let Some(part) = value.get("properties").and_then(|p| p.get("part")) else { return };
        let part_type = part.get("type").and_then(Value::as_str).unwrap_or("");
        let (method, kind) = match part_type {
            "text" => ("item/agentMessage/delta", ItemType::AgentMessageDelta),
            "reasoning" => ("item/updated", ItemType::Reasoning),
            "step-start" => ("item/started", ItemType::Log),
            "step-finish" => ("item/completed", ItemType::Log),
            _ => return,
        };
        let text = part.get("text").and_then(Value::as_str).map(String::from);
        if let Some(text) = &text {
            if part_type == "text" && !text.is_empty() {
                *self.turn_completed_payload.lock().await = Some(json!({
                    "turn_output": text,
                    "assistant_evidence_key": format!("{:x}", fnv1a32(text)),
                }));
            }
        }
        let mut item = Item::new(kind, crate::model::now_rfc3339());
        item.text = text;
        item.provider_message_id = part.get("messageID").and_then(Value::as_str).map(String::from);
        let _ = self.items.append(&self.session_id, &item).await;
        self.emit(method, serde_json::to_value(&item).unwrap_or(Value::Null)).await;
    }

    async fn handle_permission_updated(&self, value: &Value) {
        let Some(props) = value.get("properties") else { return };
        let permission_id = props.get("id").and_then(Value::as_str).unwrap_or_default();
        if permission_id.is_empty() {
            return;
        }
        let request_id = self.hash_permission(permission_id).await;
        let permission_type = props.get("type").and_then(Value::as_str).unwrap_or("");
        let method = match permission_type {
            "edit" | "write" | "file" => "item/fileChange/requestApproval",
            "bash" | "command" => "item/commandExecution/requestApproval",
            _ => "tool/requestUserInput",
        };
        let approval = Approval {
            session_id: self.session_id.clone(),
            request_id: request_id as i64,
            method: method.to_string(),
            params: props.clone(),
            created_at: crate::model::now_rfc3339(),
        };
        let _ = self.approvals.store(approval).await;
        if let Some(notifier) = self.notifier.lock().await.clone() {
            notifier.publish(NotificationEvent {
                trigger: NotificationTrigger::TurnCompleted,
                session_id: self.session_id.clone(),
                workspace_id: self.workspace_id.clone(),
                worktree_id: self.worktree_id.clone(),
                turn_id: None,
                status: "approval_required".to_string(),
                source: format!("approval_request:{}:{}", self.session_id, request_id),
                payload: json!({ "method": method, "request_id": request_id }),
            });
        }
        self.emit(method, props.clone()).await;
    }

    async fn hash_permission(&self, permission_id: &str) -> i32 {
        let mut hash = fnv1a32(permission_id) & 0x7fff_ffff;
        let mut guard = self.permission_index.lock().await;
        loop {
            match guard.get(&hash) {
                Some(existing) if existing == permission_id => break,
                Some(_) => hash = (hash + 1) & 0x7fff_ffff,
                None => {
                    guard.insert(hash, permission_id.to_string());
                    break;
                }
            }
        }
        hash
    }

    async fn emit(&self, method: &str, params: Value) {
        self.events.publish(CodexEvent {
            id: None,
            method: method.to_string(),
            params,
            ts: crate::model::now_rfc3339(),
        });
    }

    async fn emit_turn_completed(&self, status: &str) {
        self.turn_state.clear().await;
        self.idle_notify.notify_waiters();
        if let Some(notifier) = self.notifier.lock().await.clone() {
            let mut payload = json!({ "turn_status": status });
            if let Some(evidence) = self.turn_completed_payload.lock().await.clone() {
                if let (Some(map), Some(extra)) = (payload.as_object_mut(), evidence.as_object()) {
                    for (k, v) in extra {
                        map.insert(k.clone(), v.clone());
                    }
                }
            }
            notifier.publish(NotificationEvent {
                trigger: NotificationTrigger::TurnCompleted,
                session_id: self.session_id.clone(),
                workspace_id: self.workspace_id.clone(),
                worktree_id: self.worktree_id.clone(),
                turn_id: None,
                status: status.to_string(),
                source: "live_session_event".to_string(),
                payload,
            });
        }
        self.emit("turn/completed", json!({ "status": status })).await;
    }

    /// SSE closed without a terminal signal: reconcile against remote
    /// history, synthesize the backfilled items as stream events, then a
    /// synthetic `turn/completed`.
    async fn recover(&self) {
        let Some(provider_session_id) = self.provider_session_id.lock().await.clone() else {
            return;
        };
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let token = self.token.clone();
        let backfilled = self
            .reconciler
            .reconcile_best_effort(&self.session_id, || async move {
                fetch_remote_history(&client, &base_url, &provider_session_id, token.as_deref()).await
            })
            .await;
        for item in &backfilled {
            self.emit("item/started", json!({})).await;
            let text = item.text.clone().unwrap_or_default();
            self.emit("item/agentMessage/delta", json!({ "delta": text.clone() })).await;
            self.emit("item/completed", json!({})).await;
            if !text.is_empty() {
                *self.turn_completed_payload.lock().await = Some(json!({
                    "turn_output": text,
                    "assistant_evidence_key": format!("{:x}", fnv1a32(&text)),
                }));
            }
        }
        self.emit_turn_completed("completed").await;
    }
}

pub(crate) fn fnv1a32(s: &str) -> i32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in s.bytes() {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash as i32
}

fn urlencode(s: &str) -> String {
    let mut out = String::new();
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

async fn fetch_remote_history(
    client: &reqwest::Client,
    base_url: &str,
    provider_session_id: &str,
    token: Option<&str>,
) -> Result<Vec<Item>, ArchonError> {
    let mut builder = client.get(format!("{base_url}/session/{provider_session_id}/message"));
    if let Some(token) = token {
        builder = builder.bearer_auth(token);
    }
    let resp = builder.send().await.map_err(|e| ArchonError::unavailable(e.to_string()))?;
    let body: Vec<Value> = resp.json().await.unwrap_or_default();
    Ok(body
        .into_iter()
        .filter_map(|msg| {
            let role = msg.get("role").and_then(Value::as_str)?;
            if role != "assistant" {
                return None;
            }
            let text = msg.get("text").and_then(Value::as_str)?.to_string();
            let mut item = Item::new(ItemType::AgentMessage, crate::model::coerce_timestamp(msg.get("created_at")));
            item.text = Some(text);
            item.provider_message_id = msg.get("id").and_then(Value::as_str).map(String::from);
            Some(item)
        })
        .collect())
}

#[async_trait]
impl TurnCapableSession for OpencodeLiveSession {
    async fn start_turn(&self, input: TurnInput, _opts: TurnOptions) -> Result<String, ArchonError> {
        let probe = StatusFlagProbe::new(self.busy.clone());
        self.turn_state.reserve(&probe, None, || self.run_turn(&input)).await
    }

    async fn interrupt(&self) -> Result<(), ArchonError> {
        let Some(id) = self.provider_session_id.lock().await.clone() else {
            return Ok(());
        };
        let _ = self
            .auth(self.client.post(format!("{}/session/{}/abort", self.base_url, id)))
            .send()
            .await;
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
        if let Some(handle) = self.post_send_reconcile.lock().await.take() {
            handle.abort();
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
impl ApprovalCapableSession for OpencodeLiveSession {
    async fn respond(&self, request_id: i64, decision: Value) -> Result<(), ArchonError> {
        let permission_id = self
            .permission_index
            .lock()
            .await
            .get(&(request_id as i32))
            .cloned()
            .ok_or_else(|| ArchonError::not_found("unknown approval request_id"))?;
        let Some(session_id) = self.provider_session_id.lock().await.clone() else {
            return Err(ArchonError::unavailable("opencode session not started"));
        };
        let word = decision.get("decision").and_then(Value::as_str).unwrap_or("");
        let translated = translate_decision(word).ok_or_else(|| ArchonError::invalid(format!("unknown approval decision: {word}")))?;
        let resp = self
            .auth(self.client.post(format!(
                "{}/session/{}/permissions/{}",
                self.base_url, session_id, permission_id
            )))
            .json(&json!({ "response": translated }))
            .send()
            .await
            .map_err(|e| ArchonError::unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ArchonError::unavailable(format!("opencode permission decision failed: {}", resp.status())));
        }
        let _ = self.approvals.delete(&self.session_id, request_id).await;
        Ok(())
    }
}

fn translate_decision(word: &str) -> Option<&'static str> {
    match word.to_ascii_lowercase().as_str() {
        "accept" | "approve" | "allow" | "yes" => Some("once"),
        "decline" | "deny" | "no" => Some("reject"),
        _ => None,
    }
}

pub struct OpencodeLiveSessionFactory {
    pub profile: ProviderProfile,
    pub items: Arc<ItemStore>,
    pub approvals: Arc<ApprovalStore>,
}

#[async_trait]
impl TurnCapableSessionFactory for OpencodeLiveSessionFactory {
    async fn create(
        &self,
        session: &Session,
        meta: &SessionMeta,
        notifier: NotificationPublisher,
    ) -> Result<Arc<dyn TurnCapableSession>, ArchonError> {
        let base_url = self
            .profile
            .base_url
            .clone()
            .ok_or_else(|| ArchonError::invalid("opencode provider requires base_url"))?;
        let live = OpencodeLiveSession::spawn(
            session,
            meta,
            &base_url,
            self.profile.token.clone(),
            self.items.clone(),
            self.approvals.clone(),
        );
        live.set_notifier(notifier);
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_words_translate_per_table() {
        assert_eq!(translate_decision("Approve"), Some("once"));
        assert_eq!(translate_decision("DENY"), Some("reject"));
        assert_eq!(translate_decision("maybe"), None);
    }

    #[test]
    fn permission_hash_is_always_non_negative() {
        for s in ["a", "permission-with-a-much-longer-id", ""] {
            assert!(fnv1a32(s) & 0x7fff_ffff >= 0);
        }
    }
}
