//! Data model — §3. Dynamic payloads (item fields, notification payloads)
//! are tagged-variant records over a closed set of known types with a
//! fall-through `raw` variant, per the "Dynamic payloads" design note: this
//! keeps reconcile-key equality deterministic regardless of map ordering,
//! which a bare `serde_json::Map` would not guarantee under re-serialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

/// Coerce a provider-supplied timestamp (RFC3339, or Unix seconds as a
/// number) into RFC3339Nano UTC. Falls back to the daemon clock when the
/// provider value is absent or unparseable.
pub fn coerce_timestamp(provider_value: Option<&Value>) -> String {
    match provider_value {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc).to_rfc3339_opts(chrono::SecondsFormat::Nanos, true))
            .unwrap_or_else(|_| now_rfc3339()),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true))
            .unwrap_or_else(now_rfc3339),
        _ => now_rfc3339(),
    }
}

// ─── Session ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Inactive,
    Exited,
    Failed,
    Killed,
    Orphaned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub provider: String,
    pub cwd: String,
    #[serde(default)]
    pub env: Vec<String>,
    pub title: String,
    pub status: SessionStatus,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<String>,
}

impl Session {
    /// Reset run-state on reuse: status goes back to inactive and the
    /// process fields are cleared, per §3 Session lifecycle.
    pub fn revive(&mut self) {
        self.status = SessionStatus::Inactive;
        self.pid = None;
        self.exit_code = None;
        self.exited_at = None;
    }
}

/// `source` discriminates a row created directly by the daemon from one
/// materialized by the codex thread syncer (invariant 7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    Internal,
    Codex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session: Session,
    pub source: SessionSource,
}

// ─── SessionMeta ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_id: Option<String>,
    #[serde(default)]
    pub runtime_options: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_turn_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dismissed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_run_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub title_locked: bool,
}

// ─── Item ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ItemType {
    UserMessage,
    Assistant,
    AgentMessage,
    AgentMessageDelta,
    AgentMessageEnd,
    Reasoning,
    Result,
    RateLimit,
    Log,
    Raw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    #[serde(rename = "type")]
    pub kind: ItemType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_created_at: Option<String>,
    /// Required on persistence (invariant 4); RFC3339Nano UTC.
    pub created_at: String,
    /// Everything else the provider sent (rate-limit fields, raw tool
    /// events, etc.) lives here so unknown shapes round-trip losslessly.
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl Item {
    pub fn new(kind: ItemType, created_at: impl Into<String>) -> Self {
        Self {
            kind,
            id: None,
            text: None,
            provider_message_id: None,
            provider_created_at: None,
            created_at: created_at.into(),
            fields: serde_json::Map::new(),
        }
    }

    /// Dedup key per §4.6: `id:{provider_message_id}` if present, else
    /// `type|created_at|text`, else `type|text`.
    pub fn dedup_key(&self) -> String {
        if let Some(pmid) = &self.provider_message_id {
            return format!("id:{pmid}");
        }
        match &self.text {
            Some(text) if !self.created_at.is_empty() => {
                format!("{:?}|{}|{}", self.kind, self.created_at, text)
            }
            Some(text) => format!("{:?}|{}", self.kind, text),
            None => format!("{:?}|{}", self.kind, self.created_at),
        }
    }
}

// ─── Approval ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub session_id: String,
    pub request_id: i64,
    pub method: String,
    pub params: Value,
    pub created_at: String,
}

// ─── CodexEvent ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodexEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub method: String,
    pub params: Value,
    pub ts: String,
}

// ─── NotificationEvent ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTrigger {
    TurnCompleted,
    SessionExited,
    SessionFailed,
    SessionKilled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub trigger: NotificationTrigger,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    pub status: String,
    pub source: String,
    #[serde(default)]
    pub payload: Value,
}

impl NotificationEvent {
    /// Dedup key for the user-visible notification sink. Per the open
    /// question in §9(c): decision-required events key on turn id, other
    /// triggers key on status — left as-is, not reconciled to one scheme.
    pub fn dedupe_key(&self) -> String {
        if self.status == "approval_required" {
            format!(
                "{:?}|{}|{}|{}",
                self.trigger,
                self.session_id,
                self.turn_id.as_deref().unwrap_or(""),
                self.source
            )
        } else {
            format!("{:?}|{}|{}|{}", self.trigger, self.session_id, self.status, self.source)
        }
    }
}

// ─── Codex thread ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodexThreadSummary {
    pub id: String,
    pub cwd: String,
    /// Unix seconds.
    pub updated_at: i64,
    #[serde(default)]
    pub preview: String,
}
