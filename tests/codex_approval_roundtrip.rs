//! S5 — codex approval round-trip (spec.md §8 scenario S5).
//!
//! A fake `codex app-server` raises an unsolicited `item/commandExecution/
//! requestApproval` request (id 42); the live session persists it as an
//! `Approval` row, and `Respond(42, {decision: accept})` both writes the
//! JSON-RPC response back to the provider and deletes the row.

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

# thread/start request (no cached thread id for this session)
IFS= read -r _line
echo '{"jsonrpc":"2.0","id":2,"result":{"thread":{"id":"thr-approval-1"}}}'

# turn/start request
IFS= read -r _line
echo '{"jsonrpc":"2.0","id":3,"result":{"turn":{"id":"turn-approval-1"}}}'

# unsolicited approval request from the provider
echo '{"jsonrpc":"2.0","id":42,"method":"item/commandExecution/requestApproval","params":{"command":"touch file.txt"}}'

# the client's response to request 42
IFS= read -r resp_line
printf '%s\n' "$resp_line" > "$FAKE_APPROVAL_MARKER"

while IFS= read -r _line; do :; done
"#;

fn session() -> Session {
    Session {
        id: "sess-approval".into(),
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

#[tokio::test]
async fn approval_request_is_persisted_then_cleared_on_respond() {
    let bin_dir = tempfile::tempdir().unwrap();
    let codex_bin = common::write_fake_binary(bin_dir.path(), "dummy-codex", FAKE_APP_SERVER);

    let marker_dir = tempfile::tempdir().unwrap();
    let marker_path = marker_dir.path().join("response.json");
    std::env::set_var("FAKE_APPROVAL_MARKER", &marker_path);

    let approvals_dir = tempfile::tempdir().unwrap();
    let approvals = Arc::new(ApprovalStore::open(approvals_dir.path()).await.unwrap());

    let items_dir = tempfile::tempdir().unwrap();
    let items = Arc::new(ItemStore::new(items_dir.path()));

    let live = CodexLiveSession::spawn(
        &session(),
        &SessionMeta::default(),
        codex_bin.to_str().unwrap(),
        approvals.clone(),
        items,
    )
    .await
    .unwrap();

    live.start_turn(TurnInput { text: "hello".into() }, TurnOptions::default())
        .await
        .unwrap();

    // Wait for the read-loop to observe and persist the unsolicited request.
    let approval = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            if let Some(a) = approvals.get("sess-approval", 42).await {
                return a;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("approval 42 was never persisted");
    assert_eq!(approval.method, "item/commandExecution/requestApproval");

    let capable = live.as_approval_capable().expect("codex sessions are approval-capable");
    capable.respond(42, serde_json::json!({ "decision": "accept" })).await.unwrap();

    assert!(approvals.get("sess-approval", 42).await.is_none());

    // Give the fake server a moment to flush the marker file, then check it
    // actually received the JSON-RPC response for request 42.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let written = std::fs::read_to_string(&marker_path).expect("marker file was not written");
    let parsed: serde_json::Value = serde_json::from_str(written.trim()).unwrap();
    assert_eq!(parsed["id"], 42);
    assert_eq!(parsed["result"]["decision"], "accept");
}
