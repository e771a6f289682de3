//! Shared utilities — §2 "Shared utilities": id generation and workspace
//! path resolution. Timestamp coercion lives in `model`; the error taxonomy
//! lives in `error`; the subscriber hub lives in `hub`.

use crate::error::ArchonError;
use std::path::{Path, PathBuf};

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn new_turn_id() -> String {
    format!("turn-{}", uuid::Uuid::new_v4())
}

pub fn new_request_id() -> i64 {
    use std::sync::atomic::{AtomicI64, Ordering};
    static NEXT: AtomicI64 = AtomicI64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Resolve `subpath` against `workspace_root`, rejecting any path that
/// escapes the root via `..` components or an absolute override. Used to
/// validate session `cwd`/worktree requests before they touch the
/// filesystem.
pub fn resolve_workspace_subpath(workspace_root: &Path, subpath: &str) -> Result<PathBuf, ArchonError> {
    if subpath.is_empty() {
        return Ok(workspace_root.to_path_buf());
    }
    let candidate = Path::new(subpath);
    if candidate.is_absolute() {
        return Err(ArchonError::invalid("subpath must be relative to the workspace root"));
    }
    let mut resolved = workspace_root.to_path_buf();
    for component in candidate.components() {
        use std::path::Component;
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(ArchonError::invalid("subpath may not contain '..'"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ArchonError::invalid("subpath must be relative"));
            }
        }
    }
    Ok(resolved)
}

/// Sanitize a free-text session title for display/storage: trims
/// whitespace, collapses internal newlines, and truncates to a sane length.
pub fn sanitize_title(raw: &str) -> String {
    const MAX_LEN: usize = 200;
    let collapsed: String = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim();
    if trimmed.chars().count() > MAX_LEN {
        trimmed.chars().take(MAX_LEN).collect()
    } else {
        trimmed.to_string()
    }
}

/// Parse a query-string boolean per §6: truthy = `1|true|yes` (case
/// insensitive); anything else is false.
pub fn parse_truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(str::to_ascii_lowercase).as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

/// Parse the `lines` query parameter per §6: defaults to 200;
/// non-positive/invalid values also fall back to 200.
pub fn parse_lines(value: Option<&str>) -> usize {
    value
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|n| *n > 0)
        .map(|n| n as usize)
        .unwrap_or(200)
}

/// Stable fingerprint of an assistant turn's visible output text, used by
/// each adapter as the `assistant_evidence_key` in its `turn_completed`
/// payload (§4.8) — the freshness tracker treats a repeated key as no new
/// evidence.
pub fn evidence_key_for(text: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_traversal() {
        let root = Path::new("/data/workspaces/w1");
        assert!(resolve_workspace_subpath(root, "../etc/passwd").is_err());
        assert!(resolve_workspace_subpath(root, "sub/../../escape").is_err());
    }

    #[test]
    fn allows_plain_relative_subpath() {
        let root = Path::new("/data/workspaces/w1");
        let resolved = resolve_workspace_subpath(root, "src/lib.rs").unwrap();
        assert_eq!(resolved, Path::new("/data/workspaces/w1/src/lib.rs"));
    }

    #[test]
    fn truthy_values_are_case_insensitive() {
        assert!(parse_truthy(Some("TRUE")));
        assert!(parse_truthy(Some("Yes")));
        assert!(!parse_truthy(Some("0")));
        assert!(!parse_truthy(None));
    }

    #[test]
    fn lines_falls_back_to_200() {
        assert_eq!(parse_lines(None), 200);
        assert_eq!(parse_lines(Some("-5")), 200);
        assert_eq!(parse_lines(Some("garbage")), 200);
        assert_eq!(parse_lines(Some("50")), 50);
    }
}
