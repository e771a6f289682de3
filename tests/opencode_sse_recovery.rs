//! S3 — opencode SSE recovery (spec.md §8 scenario S3).
//!
//! A fake opencode server closes `/event` immediately with no terminal
//! event. The live session falls back to `recover()`: it fetches
//! `/session/{id}/message`, reconciles the one new assistant message
//! against the local log, synthesizes the backfill as stream events, then
//! emits a synthetic `turn/completed`. A second recovery against the same
//! remote history must backfill nothing.

use archon::hub::Delivered;
use archon::live::opencode::OpencodeLiveSession;
use archon::model::{Item, ItemType, Session, SessionMeta, SessionStatus};
use archon::store::ItemStore;
use axum::{extract::Path, routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

async fn empty_event_stream() -> axum::response::Response {
    use axum::response::IntoResponse;
    // Close immediately: no bytes, no session.idle. Forces the recovery path.
    ([("content-type", "text/event-stream")], "").into_response()
}

async fn one_message(Path(_id): Path<String>) -> Json<Value> {
    Json(json!([
        {
            "id": "msg_1",
            "role": "assistant",
            "text": "A",
            "created_at": "2026-01-01T00:00:00Z",
        }
    ]))
}

async fn spawn_fake_opencode() -> String {
    let router = Router::new()
        .route("/event", get(empty_event_stream))
        .route("/session/{id}/message", get(one_message));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn session() -> Session {
    Session {
        id: "sess-oc".into(),
        provider: "opencode".into(),
        cwd: "/tmp".into(),
        env: vec![],
        title: String::new(),
        status: SessionStatus::Inactive,
        created_at: archon::model::now_rfc3339(),
        pid: None,
        exit_code: None,
        exited_at: None,
    }
}

fn meta() -> SessionMeta {
    SessionMeta { session_id: "sess-oc".into(), provider_session_id: Some("remote-1".into()), ..Default::default() }
}

#[tokio::test]
async fn closed_stream_without_idle_recovers_via_remote_history() {
    let base_url = spawn_fake_opencode().await;

    let items_dir = tempfile::tempdir().unwrap();
    let items = Arc::new(ItemStore::new(items_dir.path()));
    let mut local_q = Item::new(ItemType::UserMessage, archon::model::now_rfc3339());
    local_q.text = Some("Q".into());
    items.append("sess-oc", &local_q).await.unwrap();

    let approvals_dir = tempfile::tempdir().unwrap();
    let approvals = Arc::new(archon::store::ApprovalStore::open(approvals_dir.path()).await.unwrap());

    let live = OpencodeLiveSession::spawn(&session(), &meta(), &base_url, None, items.clone(), approvals);

    let mut events = live.subscribe();
    let mut seen_methods = Vec::new();
    let completed = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Delivered::Event(e) => {
                    let method = e.method.clone();
                    seen_methods.push(method.clone());
                    if method == "turn/completed" {
                        return e;
                    }
                }
                Delivered::Gap { .. } => continue,
                Delivered::Closed => panic!("event stream closed before turn/completed"),
            }
        }
    })
    .await
    .expect("turn/completed was not observed in time");

    assert_eq!(completed.params["status"], "completed");
    assert!(seen_methods.contains(&"item/started".to_string()));
    assert!(seen_methods.contains(&"item/agentMessage/delta".to_string()));
    assert!(seen_methods.contains(&"item/completed".to_string()));

    let stored = items.read_all("sess-oc").await.unwrap();
    assert!(stored.iter().any(|i| i.provider_message_id.as_deref() == Some("msg_1")));

    // A second recovery pass against the same remote history backfills nothing new.
    let before = stored.len();
    let backfilled_again = archon::reconcile::HistoryReconciler::new(items.clone())
        .reconcile(
            "sess-oc",
            vec![{
                let mut i = Item::new(ItemType::AgentMessage, "2026-01-01T00:00:00Z".into());
                i.text = Some("A".into());
                i.provider_message_id = Some("msg_1".into());
                i
            }],
        )
        .await
        .unwrap();
    assert!(backfilled_again.is_empty());
    assert_eq!(items.read_all("sess-oc").await.unwrap().len(), before);
}
