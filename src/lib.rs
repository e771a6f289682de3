pub mod approvals_resync;
pub mod codex_sync;
pub mod config;
pub mod error;
pub mod hub;
pub mod http;
pub mod live;
pub mod model;
pub mod notify;
pub mod reconcile;
pub mod session_manager;
pub mod store;
pub mod util;
pub mod workflows;
pub mod worktree;

use std::sync::Arc;
use std::time::Duration;

use approvals_resync::{ApprovalResyncService, CodexLogScanExtractor, NoopExtractor, OpencodePendingExtractor};
use codex_sync::{CodexSyncer, WorkspaceScanTarget};
use config::DaemonConfig;
use live::{CompositeLiveManager, NotificationPublisher};
use notify::NotificationDispatcher;
use session_manager::SessionManager;
use store::{ApprovalStore, ItemStore, SessionStore};
use workflows::processor::WorkflowEngine;

const CODEX_SYNC_INTERVAL: Duration = Duration::from_secs(20);
const APPROVAL_RESYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Everything an HTTP handler needs, wired once at startup and shared
/// behind one `Arc` per the daemon's single-`AppContext` convention.
pub struct AppState {
    pub config: Arc<DaemonConfig>,
    pub auth_token: String,
    pub sessions: Arc<SessionStore>,
    pub approvals: Arc<ApprovalStore>,
    pub session_manager: Arc<SessionManager>,
    pub workflow_engine: Arc<WorkflowEngine>,
    pub notifications: Arc<NotificationDispatcher>,
    pub codex_syncer: Arc<CodexSyncer>,
}

impl AppState {
    pub async fn build(config: DaemonConfig) -> anyhow::Result<Arc<Self>> {
        let config = Arc::new(config);
        std::fs::create_dir_all(&config.data_dir)?;
        let auth_token = http::auth::get_or_create_token(&config.data_dir)?;

        let sessions = Arc::new(SessionStore::open(&config.data_dir).await?);
        let items = Arc::new(ItemStore::new(&config.data_dir));
        let approvals = Arc::new(ApprovalStore::open(&config.data_dir).await?);

        let recipes = workflows::engine::load_recipe_set(&config.data_dir);

        let hub: Arc<hub::Hub<model::NotificationEvent>> = Arc::new(hub::Hub::default());
        let notifier = NotificationPublisher::new(hub.clone());
        let mut live = CompositeLiveManager::new(notifier);

        live.register_factory(
            "claude",
            Arc::new(live::claude::ClaudeLiveSessionFactory {
                profile: config.provider_profile("claude"),
                items: items.clone(),
            }),
        );
        live.register_factory(
            "codex",
            Arc::new(live::codex::CodexLiveSessionFactory {
                profile: config.provider_profile("codex"),
                approvals: approvals.clone(),
                items: items.clone(),
            }),
        );
        live.register_factory(
            "opencode",
            Arc::new(live::opencode::OpencodeLiveSessionFactory {
                profile: config.provider_profile("opencode"),
                items: items.clone(),
                approvals: approvals.clone(),
            }),
        );
        live.register_factory(
            "kilocode",
            Arc::new(live::opencode::OpencodeLiveSessionFactory {
                profile: config.provider_profile("kilocode"),
                items: items.clone(),
                approvals: approvals.clone(),
            }),
        );
        live.register_factory(
            "exec",
            Arc::new(live::exec::ExecLiveSessionFactory { profile: config.provider_profile("exec"), items: items.clone() }),
        );
        let live = Arc::new(live);

        let session_manager = Arc::new(SessionManager::new(config.clone(), sessions.clone(), items.clone(), approvals.clone(), live));

        let workflow_engine = Arc::new(WorkflowEngine::new(recipes, session_manager.clone()));
        let notifications = Arc::new(NotificationDispatcher::new(Some(workflow_engine.clone() as Arc<dyn notify::TurnEventProcessor>)));

        let source = hub.subscribe();
        tokio::spawn(notifications.clone().run(source, sessions.clone()));

        let codex_syncer = Arc::new(CodexSyncer::new(sessions.clone()));
        spawn_codex_sync_loop(codex_syncer.clone(), config.clone());
        spawn_approval_resync_loop(sessions.clone(), approvals.clone(), items.clone());

        Ok(Arc::new(Self {
            config,
            auth_token,
            sessions,
            approvals,
            session_manager,
            workflow_engine,
            notifications,
            codex_syncer,
        }))
    }
}

/// Every tick: treat each distinct internal-session `cwd` as a workspace
/// root, list that root's codex threads, and sync. A daemon with no
/// internal sessions yet has nothing to scan, so the first tick is a no-op.
fn spawn_codex_sync_loop(syncer: Arc<CodexSyncer>, config: Arc<DaemonConfig>) {
    tokio::spawn(async move {
        let command = config.provider_profile("codex").command.unwrap_or_else(|| "codex".to_string());
        let mut ticker = tokio::time::interval(CODEX_SYNC_INTERVAL);
        loop {
            ticker.tick().await;
            for root in syncer.sessions_snapshot_roots().await {
                let target = WorkspaceScanTarget { workspace_id: root.clone(), root: std::path::PathBuf::from(&root), worktrees: vec![] };
                let threads = match codex_sync::list_threads(&command, &target.root).await {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!(root = %root, err = %e, "codex thread listing failed, skipping this tick");
                        continue;
                    }
                };
                if let Err(e) = syncer.sync_workspace(&target, threads).await {
                    tracing::warn!(root = %root, err = %e, "codex sync pass failed");
                }
            }
            if let Err(e) = syncer.migrate_duplicate_internal_sessions().await {
                tracing::warn!(err = %e, "duplicate-session migration failed");
            }
        }
    });
}

fn spawn_approval_resync_loop(sessions: Arc<SessionStore>, approvals: Arc<ApprovalStore>, items: Arc<ItemStore>) {
    tokio::spawn(async move {
        let service = ApprovalResyncService::new(approvals);
        let client = reqwest::Client::new();
        let mut ticker = tokio::time::interval(APPROVAL_RESYNC_INTERVAL);
        loop {
            ticker.tick().await;
            for record in sessions.list_sessions().await {
                let meta = sessions.get_meta(&record.session.id).await.unwrap_or_default();
                let provider = live::normalize_provider(&record.session.provider);
                let extractor: Box<dyn approvals_resync::ApprovalExtractor> = match provider.as_str() {
                    "opencode" | "kilocode" => Box::new(OpencodePendingExtractor { client: client.clone() }),
                    "codex" => Box::new(CodexLogScanExtractor { items: items.clone() }),
                    _ => Box::new(NoopExtractor),
                };
                if let Err(e) = service.sync_session(&record.session, &meta, extractor.as_ref()).await {
                    tracing::warn!(session_id = %record.session.id, err = %e, "approval resync failed");
                }
            }
        }
    });
}
