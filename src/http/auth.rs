//! Bearer-token auth — §4.12. Ported from the daemon's `ipc::auth` module:
//! a token is generated once, written to `{data_dir}/auth_token` with
//! owner-only permissions, and checked against every request's
//! `Authorization` header via an axum middleware.

use anyhow::Result;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::AppState;

pub fn get_or_create_token(data_dir: &Path) -> Result<String> {
    let path = data_dir.join("auth_token");

    if path.exists() {
        let token = std::fs::read_to_string(&path)?.trim().to_string();
        if !token.is_empty() {
            return Ok(token);
        }
    }

    let token = Uuid::new_v4().to_string().replace('-', "");
    std::fs::create_dir_all(data_dir)?;

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        f.write_all(token.as_bytes())?;
    }
    #[cfg(not(unix))]
    std::fs::write(&path, &token)?;

    Ok(token)
}

pub fn validate_bearer(header_value: &str, expected_token: &str) -> bool {
    header_value.strip_prefix("Bearer ").map(|t| t == expected_token).unwrap_or(false)
}

pub async fn require_auth(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let header_value = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if validate_bearer(header_value, &state.auth_token) {
        Ok(next.run(req).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_match_requires_exact_token() {
        assert!(validate_bearer("Bearer abc", "abc"));
        assert!(!validate_bearer("Bearer abc", "xyz"));
        assert!(!validate_bearer("abc", "abc"));
    }

    #[test]
    fn token_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let first = get_or_create_token(dir.path()).unwrap();
        let second = get_or_create_token(dir.path()).unwrap();
        assert_eq!(first, second);
    }
}
