//! Live-session orchestration core — §4.1/§4.2. `CompositeLiveManager`
//! dispatches to a provider-specific factory and holds exactly one live
//! session per `session_id`; every live session enforces at-most-one
//! in-flight turn via `TurnState::reserve`.

pub mod claude;
pub mod codex;
pub mod exec;
pub mod opencode;

use crate::error::ArchonError;
use crate::hub::{Hub, Subscription};
use crate::model::{CodexEvent, NotificationEvent, Session, SessionMeta};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Inputs to a turn: one or more content items (currently just text, the
/// shape the four providers all accept today).
#[derive(Debug, Clone)]
pub struct TurnInput {
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct TurnOptions {
    pub model: Option<String>,
    pub additional_directories: Vec<String>,
}

/// Fans `NotificationEvent`s out of the live-session core. A thin wrapper
/// over `Hub` so a live session can both publish and let the manager swap in
/// a fresh publisher after `ensure()` refreshes cached meta.
#[derive(Clone)]
pub struct NotificationPublisher {
    hub: Arc<Hub<NotificationEvent>>,
}

impl NotificationPublisher {
    pub fn new(hub: Arc<Hub<NotificationEvent>>) -> Self {
        Self { hub }
    }

    pub fn publish(&self, event: NotificationEvent) {
        self.hub.publish(event);
    }

    pub fn subscribe(&self) -> Subscription<NotificationEvent> {
        self.hub.subscribe()
    }
}

/// Busy-probe outcome for `TurnState::reserve` (§4.2 step 2/3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Active,
    Inactive,
    Unknown,
}

#[async_trait]
pub trait BusyProbe: Send + Sync {
    async fn probe(&self, thread_id: Option<&str>, active_turn_id: &str) -> ProbeResult;
}

/// A probe with no external signal: it always reports the reserved turn as
/// inactive, so the only protection against a concurrent `StartTurn` is the
/// reservation sentinel `TurnState::reserve` sets before releasing its
/// mutex. Used by transports with no side channel to query provider
/// activity (claude, exec).
pub struct NoopBusyProbe;

#[async_trait]
impl BusyProbe for NoopBusyProbe {
    async fn probe(&self, _thread_id: Option<&str>, _active_turn_id: &str) -> ProbeResult {
        ProbeResult::Inactive
    }
}

/// A probe backed by a shared flag the adapter flips on its own
/// `turn/started` / `turn/completed` (or `session.status`) notifications.
/// Used by codex and opencode, whose transports carry a busy/idle signal
/// independent of `active_turn_id`.
pub struct StatusFlagProbe {
    busy: Arc<std::sync::atomic::AtomicBool>,
}

impl StatusFlagProbe {
    pub fn new(busy: Arc<std::sync::atomic::AtomicBool>) -> Self {
        Self { busy }
    }
}

#[async_trait]
impl BusyProbe for StatusFlagProbe {
    async fn probe(&self, _thread_id: Option<&str>, active_turn_id: &str) -> ProbeResult {
        // The reservation sentinel is never a real turn id the adapter would
        // have set the busy flag for, so treat it as unknown (fail closed).
        if active_turn_id == PENDING_SENTINEL {
            return ProbeResult::Unknown;
        }
        if self.busy.load(std::sync::atomic::Ordering::Acquire) {
            ProbeResult::Active
        } else {
            ProbeResult::Inactive
        }
    }
}

const PENDING_SENTINEL: &str = "\u{0}pending";

/// Per-session turn reservation state (§4.2, §5 "one mutex per live
/// session"). Embedded by composition in every concrete live session.
pub struct TurnState {
    active_turn_id: Mutex<Option<String>>,
    last_active: Mutex<Option<String>>,
}

impl Default for TurnState {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnState {
    pub fn new() -> Self {
        Self {
            active_turn_id: Mutex::new(None),
            last_active: Mutex::new(None),
        }
    }

    pub async fn active_turn_id(&self) -> Option<String> {
        match self.active_turn_id.lock().await.clone() {
            Some(id) if id != PENDING_SENTINEL => Some(id),
            _ => None,
        }
    }

    pub async fn last_active(&self) -> Option<String> {
        self.last_active.lock().await.clone()
    }

    /// `reserveSessionTurn` (§4.2). `start` is invoked with the session
    /// mutex released so a concurrent caller can observe the reservation
    /// placeholder and fail fast instead of blocking on the provider call.
    pub async fn reserve<P, F, Fut>(
        &self,
        probe: &P,
        thread_id: Option<&str>,
        start: F,
    ) -> Result<String, ArchonError>
    where
        P: BusyProbe,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, ArchonError>>,
    {
        {
            let mut guard = self.active_turn_id.lock().await;
            match guard.clone() {
                None => {
                    *guard = Some(PENDING_SENTINEL.to_string());
                }
                Some(current) => {
                    drop(guard);
                    let outcome = probe.probe(thread_id, &current).await;
                    let mut guard = self.active_turn_id.lock().await;
                    match outcome {
                        ProbeResult::Active | ProbeResult::Unknown => {
                            return Err(ArchonError::conflict("turn already in progress"));
                        }
                        ProbeResult::Inactive => {
                            if guard.as_deref() != Some(current.as_str()) {
                                return Err(ArchonError::conflict("turn already in progress"));
                            }
                            *guard = Some(PENDING_SENTINEL.to_string());
                        }
                    }
                }
            }
        }

        let result = start().await;
        let mut guard = self.active_turn_id.lock().await;
        match result {
            Ok(turn_id) => {
                *guard = Some(turn_id.clone());
                drop(guard);
                *self.last_active.lock().await = Some(crate::model::now_rfc3339());
                Ok(turn_id)
            }
            Err(e) => {
                *guard = None;
                Err(e)
            }
        }
    }

    /// Clear the active turn id. Callers must do this before publishing the
    /// matching completion notification (§5 ordering).
    pub async fn clear(&self) {
        *self.active_turn_id.lock().await = None;
    }
}

/// Required contract every live session implements (§4.1).
#[async_trait]
pub trait TurnCapableSession: Send + Sync {
    async fn start_turn(&self, input: TurnInput, opts: TurnOptions) -> Result<String, ArchonError>;
    async fn interrupt(&self) -> Result<(), ArchonError>;
    async fn active_turn_id(&self) -> Option<String>;
    fn subscribe(&self) -> Subscription<CodexEvent>;
    fn is_closed(&self) -> bool;
    async fn close(&self);

    /// Propagate the current notification publisher (`NotifiableSession`).
    /// No-op default for sessions that don't emit notifications directly.
    fn set_notifier(&self, _notifier: NotificationPublisher) {}

    /// Capability object for approval-bearing providers (codex). `None` for
    /// providers with no provider-mediated approval flow.
    fn as_approval_capable(&self) -> Option<&dyn ApprovalCapableSession> {
        None
    }
}

#[async_trait]
pub trait ApprovalCapableSession: Send + Sync {
    async fn respond(&self, request_id: i64, decision: serde_json::Value) -> Result<(), ArchonError>;
}

/// Builds a live session for one provider, given the session record, its
/// meta, and the process-wide notification publisher.
#[async_trait]
pub trait TurnCapableSessionFactory: Send + Sync {
    async fn create(
        &self,
        session: &Session,
        meta: &SessionMeta,
        notifier: NotificationPublisher,
    ) -> Result<Arc<dyn TurnCapableSession>, ArchonError>;
}

struct Entry {
    session: Arc<dyn TurnCapableSession>,
}

/// Holds `{provider → factory}` and `{session_id → live_session}` under one
/// mutex (§4.1, §5 "one mutex per live-session map").
pub struct CompositeLiveManager {
    factories: HashMap<String, Arc<dyn TurnCapableSessionFactory>>,
    sessions: Mutex<HashMap<String, Entry>>,
    notifier: NotificationPublisher,
}

impl CompositeLiveManager {
    pub fn new(notifier: NotificationPublisher) -> Self {
        Self {
            factories: HashMap::new(),
            sessions: Mutex::new(HashMap::new()),
            notifier,
        }
    }

    pub fn register_factory(&mut self, provider: &str, factory: Arc<dyn TurnCapableSessionFactory>) {
        self.factories.insert(normalize_provider(provider), factory);
    }

    /// Return the live session for `session`, creating one via the
    /// provider's factory if absent or if the cached one reports closed.
    pub async fn ensure(
        &self,
        session: &Session,
        meta: &SessionMeta,
    ) -> Result<Arc<dyn TurnCapableSession>, ArchonError> {
        let mut guard = self.sessions.lock().await;
        if let Some(entry) = guard.get(&session.id) {
            if !entry.session.is_closed() {
                return Ok(entry.session.clone());
            }
            guard.remove(&session.id);
        }
        let provider = normalize_provider(&session.provider);
        let factory = self
            .factories
            .get(&provider)
            .ok_or_else(|| ArchonError::invalid(format!("unknown provider: {}", session.provider)))?;
        let live = factory.create(session, meta, self.notifier.clone()).await?;
        live.set_notifier(self.notifier.clone());
        guard.insert(session.id.clone(), Entry { session: live.clone() });
        Ok(live)
    }

    pub async fn start_turn(
        &self,
        session: &Session,
        meta: &SessionMeta,
        input: TurnInput,
        opts: TurnOptions,
    ) -> Result<String, ArchonError> {
        let live = self.ensure(session, meta).await?;
        live.start_turn(input, opts).await
    }

    pub async fn interrupt(&self, session: &Session, meta: &SessionMeta) -> Result<(), ArchonError> {
        let live = self.ensure(session, meta).await?;
        live.interrupt().await
    }

    pub async fn respond(
        &self,
        session: &Session,
        meta: &SessionMeta,
        request_id: i64,
        decision: serde_json::Value,
    ) -> Result<(), ArchonError> {
        let live = self.ensure(session, meta).await?;
        match live.as_approval_capable() {
            Some(capable) => capable.respond(request_id, decision).await,
            None => Err(ArchonError::invalid("session's provider does not support approvals")),
        }
    }

    pub async fn subscribe(
        &self,
        session: &Session,
        meta: &SessionMeta,
    ) -> Result<Subscription<CodexEvent>, ArchonError> {
        let live = self.ensure(session, meta).await?;
        Ok(live.subscribe())
    }

    /// Remove and close the live session for `session_id`, if any
    /// (invariant 2: the closed state is terminal).
    pub async fn drop_session(&self, session_id: &str) {
        let removed = self.sessions.lock().await.remove(session_id);
        if let Some(entry) = removed {
            entry.session.close().await;
        }
    }
}

pub fn normalize_provider(provider: &str) -> String {
    provider.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn exactly_one_reservation_succeeds_under_contention() {
        let state = Arc::new(TurnState::new());
        let probe = Arc::new(NoopBusyProbe);
        let start_calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(tokio::sync::Notify::new());

        let state2 = state.clone();
        let probe2 = probe.clone();
        let calls2 = start_calls.clone();
        let release2 = release.clone();
        let first = tokio::spawn(async move {
            state2
                .reserve(probe2.as_ref(), None, || async {
                    calls2.fetch_add(1, Ordering::SeqCst);
                    release2.notified().await;
                    Ok("turn-1".to_string())
                })
                .await
        });

        // Give the first call time to claim the reservation sentinel.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let second = state
            .reserve(probe.as_ref(), None, || async { Ok("turn-2".to_string()) })
            .await;
        assert!(second.is_err());

        release.notify_one();
        let first_result = first.await.unwrap();
        assert_eq!(first_result.unwrap(), "turn-1");
        assert_eq!(start_calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.active_turn_id().await.as_deref(), Some("turn-1"));
    }

    #[tokio::test]
    async fn failed_start_clears_the_reservation() {
        let state = TurnState::new();
        let probe = NoopBusyProbe;
        let result = state
            .reserve(&probe, None, || async { Err(ArchonError::unavailable("boom")) })
            .await;
        assert!(result.is_err());
        assert!(state.active_turn_id().await.is_none());
    }
}
