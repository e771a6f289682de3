//! S1 — codex missing-rollout recovery (spec.md §8 scenario S1).
//!
//! A fake `codex app-server` rejects `thread/resume` against a stale cached
//! thread id with "No rollout found for thread ID thr-stale", then accepts a
//! fresh `thread/start` + `turn/start` and emits `turn/completed`.

#[path = "common/mod.rs"]
mod common;

use archon::live::codex::CodexLiveSession;
use archon::live::{TurnCapableSession, TurnInput, TurnOptions};
use archon::model::{Session, SessionMeta, SessionStatus};
use archon::store::{ApprovalStore, ItemStore};
use std::sync::Arc;

const FAKE_APP_SERVER: &str = r#"#!/usr/bin/env bash
set -euo pipefail

if [[ "${1:-}" != "app-server" ]]; then
  echo "expected app-server, got: $*" >&2
  exit 1
fi

# initialize request
IFS= read -r _line
echo '{"jsonrpc":"2.0","id":1,"result":{}}'

# initialized notification
IFS= read -r _line

# thread/resume, against the stale cached thread id
IFS= read -r _line
echo '{"jsonrpc":"2.0","id":2,"error":{"code":-32600,"message":"No rollout found for thread ID thr-stale"}}'

# thread/start, issued after the stale thread id is cleared
IFS= read -r _line
echo '{"jsonrpc":"2.0","id":3,"result":{"thread":{"id":"thr-live-1"}}}'

# turn/start, against the fresh thread id
IFS= read -r _line
echo '{"jsonrpc":"2.0","id":4,"result":{"turn":{"id":"turn-live-1"}}}'
echo '{"jsonrpc":"2.0","method":"turn/completed","params":{"turn":{"id":"turn-live-1","status":"completed"}}}'

while IFS= read -r _line; do :; done
"#;

fn session() -> Session {
    Session {
        id: "sess-1".into(),
        provider: "codex".into(),
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
    SessionMeta {
        session_id: "sess-1".into(),
        thread_id: Some("thr-stale".into()),
        runtime_options: serde_json::json!({ "model": "gpt-5" }),
        ..Default::default()
    }
}

#[tokio::test]
async fn missing_rollout_triggers_fresh_thread_and_completes_the_turn() {
    let bin_dir = tempfile::tempdir().unwrap();
    let codex_bin = common::write_fake_binary(bin_dir.path(), "dummy-codex", FAKE_APP_SERVER);

    let approvals_dir = tempfile::tempdir().unwrap();
    let approvals = Arc::new(ApprovalStore::open(approvals_dir.path()).await.unwrap());

    let items_dir = tempfile::tempdir().unwrap();
    let items = Arc::new(ItemStore::new(items_dir.path()));

    let live = CodexLiveSession::spawn(&session(), &meta(), codex_bin.to_str().unwrap(), approvals, items)
        .await
        .unwrap();

    let mut events = live.subscribe();

    let turn_id = live
        .start_turn(TurnInput { text: "hello".into() }, TurnOptions::default())
        .await
        .unwrap();
    assert_eq!(turn_id, "turn-live-1");
    assert_eq!(live.current_thread_id().await.as_deref(), Some("thr-live-1"));

    // Drain until we see the turn/completed notification the read-loop
    // publishes after the second turn/start succeeds.
    let completed = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                archon::hub::Delivered::Event(e) if e.method == "turn/completed" => return e,
                archon::hub::Delivered::Event(_) => continue,
                archon::hub::Delivered::Gap { .. } => continue,
                archon::hub::Delivered::Closed => panic!("event stream closed before turn/completed"),
            }
        }
    })
    .await
    .expect("turn/completed was not observed in time");

    assert_eq!(completed.params["turn"]["id"], "turn-live-1");
    assert!(live.active_turn_id().await.is_none(), "active_turn_id must be cleared before publish");
}
