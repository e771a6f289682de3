//! Turn-completion notifier & workflow feedback — §4.8. Consumes the
//! process-wide `NotificationEvent` stream, gates repeats by dedupe key,
//! fans each event to user-visible sinks, and (if fresh evidence or a
//! terminal failure) advances the guided-workflow state machine.

use crate::hub::{Delivered, Hub, Subscription};
use crate::model::{NotificationEvent, NotificationTrigger, SessionStatus};
use crate::store::SessionStore;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Records `(session_id → last_evidence_key)`; `mark_fresh` returns true
/// iff the key changed, preventing a repeated terminal signal from
/// re-advancing the same workflow phase.
pub struct FreshnessTracker {
    last: Mutex<HashMap<String, String>>,
}

impl Default for FreshnessTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FreshnessTracker {
    pub fn new() -> Self {
        Self { last: Mutex::new(HashMap::new()) }
    }

    pub async fn mark_fresh(&self, session_id: &str, key: &str) -> bool {
        let mut guard = self.last.lock().await;
        let changed = guard.get(session_id).map(|k| k != key).unwrap_or(true);
        if changed {
            guard.insert(session_id.to_string(), key.to_string());
        }
        changed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Progress,
    Hold,
}

/// Per-provider readiness policy (§4.8). `legacy_output` is true when the
/// payload carries a `turn_output` with no evidence key at all — the
/// fallback path for older provider adapters.
pub fn evaluate_readiness(provider: &str, terminal: bool, status: &str, fresh: bool, legacy_output: bool) -> Readiness {
    if !terminal {
        return Readiness::Hold;
    }
    match provider {
        "codex" | "claude" => Readiness::Progress,
        "opencode" | "kilocode" => {
            if fresh || status == "failed" || status == "errored" || legacy_output {
                Readiness::Progress
            } else {
                Readiness::Hold
            }
        }
        _ => if legacy_output { Readiness::Progress } else { Readiness::Hold },
    }
}

#[async_trait]
pub trait TurnEventProcessor: Send + Sync {
    async fn process(&self, event: &NotificationEvent, readiness: Readiness);
}

pub struct NotificationDispatcher {
    user_sink: Hub<NotificationEvent>,
    dedupe: Mutex<HashSet<String>>,
    freshness: FreshnessTracker,
    workflow: Option<Arc<dyn TurnEventProcessor>>,
}

impl NotificationDispatcher {
    pub fn new(workflow: Option<Arc<dyn TurnEventProcessor>>) -> Self {
        Self {
            user_sink: Hub::default(),
            dedupe: Mutex::new(HashSet::new()),
            freshness: FreshnessTracker::new(),
            workflow,
        }
    }

    pub fn subscribe_user_sink(&self) -> Subscription<NotificationEvent> {
        self.user_sink.subscribe()
    }

    /// Drain `source` until it closes, dispatching every event.
    pub async fn run(self: Arc<Self>, mut source: Subscription<NotificationEvent>, sessions: Arc<SessionStore>) {
        loop {
            match source.recv().await {
                Delivered::Event(event) => self.dispatch(event, &sessions).await,
                Delivered::Gap { .. } => continue,
                Delivered::Closed => break,
            }
        }
    }

    async fn dispatch(&self, event: NotificationEvent, sessions: &SessionStore) {
        let key = event.dedupe_key();
        {
            let mut guard = self.dedupe.lock().await;
            if !guard.insert(key) {
                return;
            }
        }
        self.user_sink.publish(event.clone());

        if let Some(status) = lifecycle_status(&event.trigger) {
            self.apply_lifecycle_status(&event, status, sessions).await;
            return;
        }

        let Some(processor) = &self.workflow else { return };
        if event.trigger != NotificationTrigger::TurnCompleted || event.status == "approval_required" {
            return;
        }
        let provider = sessions
            .get_session(&event.session_id)
            .await
            .map(|r| r.session.provider)
            .unwrap_or_default();
        let evidence_key = event
            .payload
            .get("assistant_evidence_key")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let fresh = self.freshness.mark_fresh(&event.session_id, evidence_key).await;
        let legacy_output = event.payload.get("turn_output").is_some();
        let readiness = evaluate_readiness(&provider, true, &event.status, fresh, legacy_output);
        processor.process(&event, readiness).await;
    }

    /// §3 Session lifecycle / §7 terminal-state notification: stamp the
    /// matching `status`/`exit_code`/`exited_at` onto the persisted session
    /// the moment its adapter reports the subprocess exited, crashed, or was
    /// explicitly killed.
    async fn apply_lifecycle_status(&self, event: &NotificationEvent, status: SessionStatus, sessions: &SessionStore) {
        let Some(mut record) = sessions.get_session(&event.session_id).await else { return };
        record.session.status = status;
        record.session.exit_code = event.payload.get("exit_code").and_then(|v| v.as_i64()).map(|n| n as i32);
        record.session.exited_at = Some(crate::model::now_rfc3339());
        let _ = sessions.upsert_session(record).await;
    }
}

/// Map a lifecycle trigger to the `Session.status` it stamps; `None` for
/// `turn_completed`, which carries no lifecycle transition.
fn lifecycle_status(trigger: &NotificationTrigger) -> Option<SessionStatus> {
    match trigger {
        NotificationTrigger::SessionExited => Some(SessionStatus::Exited),
        NotificationTrigger::SessionFailed => Some(SessionStatus::Failed),
        NotificationTrigger::SessionKilled => Some(SessionStatus::Killed),
        NotificationTrigger::TurnCompleted => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn freshness_tracker_matches_property_7() {
        let tracker = FreshnessTracker::new();
        assert!(tracker.mark_fresh("s", "k1").await);
        assert!(!tracker.mark_fresh("s", "k1").await);
        assert!(tracker.mark_fresh("s", "k2").await);
    }

    #[test]
    fn opencode_readiness_matches_property_8() {
        assert_eq!(evaluate_readiness("opencode", true, "failed", false, false), Readiness::Progress);
        assert_eq!(evaluate_readiness("opencode", true, "completed", true, false), Readiness::Progress);
        assert_eq!(evaluate_readiness("opencode", true, "completed", false, false), Readiness::Hold);
    }

    #[test]
    fn codex_and_claude_progress_on_any_terminal_signal() {
        assert_eq!(evaluate_readiness("codex", true, "completed", false, false), Readiness::Progress);
        assert_eq!(evaluate_readiness("claude", true, "completed", false, false), Readiness::Progress);
        assert_eq!(evaluate_readiness("codex", false, "completed", false, false), Readiness::Hold);
    }
}
