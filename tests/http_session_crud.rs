//! HTTP surface smoke test — spec.md §6 session CRUD plus bearer-token auth,
//! exercised end to end through `http::build_router` and a real bound socket
//! (archond always serves real TCP, never an in-memory transport).

use archon::config::{ConfigArgs, DaemonConfig};
use archon::AppState;

async fn spawn_server() -> (String, String) {
    let data_dir = tempfile::tempdir().unwrap();
    // Keep the state alive for the test's duration by leaking the tempdir path's
    // owner; the directory is cleaned up when the process exits.
    let data_dir = data_dir.into_path();

    let config = DaemonConfig::load(ConfigArgs { port: Some(0), data_dir: Some(data_dir), log: None });
    let state = AppState::build(config).await.unwrap();
    let token = state.auth_token.clone();

    let router = archon::http::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (format!("http://{addr}"), token)
}

#[tokio::test]
async fn health_is_reachable_without_auth() {
    let (base, _token) = spawn_server().await;
    let resp = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn session_routes_require_bearer_auth() {
    let (base, token) = spawn_server().await;
    let client = reqwest::Client::new();

    let unauthenticated = client.get(format!("{base}/v1/sessions")).send().await.unwrap();
    assert_eq!(unauthenticated.status(), 401);

    let authenticated = client
        .get(format!("{base}/v1/sessions"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(authenticated.status(), 200);
}

#[tokio::test]
async fn create_then_list_then_delete_a_session() {
    let (base, token) = spawn_server().await;
    let client = reqwest::Client::new();

    let created: serde_json::Value = client
        .post(format!("{base}/v1/sessions"))
        .bearer_auth(&token)
        .json(&serde_json::json!({ "provider": "exec", "cwd": "/tmp" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["id"].as_str().expect("created session has an id").to_string();

    let listed: serde_json::Value = client
        .get(format!("{base}/v1/sessions"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let sessions = listed["sessions"].as_array().expect("sessions is a list");
    assert!(sessions.iter().any(|s| s["session"]["id"] == id));

    let deleted = client
        .delete(format!("{base}/v1/sessions/{id}"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert!(deleted.status().is_success());

    let listed_after: serde_json::Value = client
        .get(format!("{base}/v1/sessions"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let sessions_after = listed_after["sessions"].as_array().expect("sessions is a list");
    assert!(!sessions_after.iter().any(|s| s["session"]["id"] == id));
}
