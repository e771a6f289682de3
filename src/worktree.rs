//! Minimal git-worktree helpers — SPEC_FULL §4.13. Resolves
//! `{data_dir}/worktrees/{session_id}` and best-effort creates/removes a
//! `git2` worktree there; failures are logged and never propagated; a
//! session always stays usable with its plain `cwd` if the worktree can't be
//! materialized.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::warn;

pub fn worktree_path(data_dir: &Path, session_id: &str) -> PathBuf {
    data_dir.join("worktrees").join(session_id)
}

/// Create a worktree for `session_id` off `repo_path`'s current HEAD, named
/// after the session. Returns `None` (logging the cause) on any failure —
/// `repo_path` not being a git repo is the common case and is not an error.
pub async fn ensure_worktree(data_dir: &Path, repo_path: &Path, session_id: &str) -> Option<PathBuf> {
    let target = worktree_path(data_dir, session_id);
    if target.exists() {
        return Some(target);
    }
    let repo_path = repo_path.to_path_buf();
    let session_id = session_id.to_string();
    let target_for_task = target.clone();
    let result = tokio::task::spawn_blocking(move || create_worktree(&repo_path, &target_for_task, &session_id)).await;
    match result {
        Ok(Ok(())) => Some(target),
        Ok(Err(e)) => {
            warn!(session_id = %session_id_for_log(&target), err = %e, "worktree create failed, falling back to plain cwd");
            None
        }
        Err(e) => {
            warn!(err = %e, "worktree create task panicked");
            None
        }
    }
}

/// Remove a session's worktree, if any. Best-effort: errors are logged, not
/// propagated, so session teardown always succeeds.
pub async fn remove_worktree(data_dir: &Path, repo_path: &Path, session_id: &str) {
    let target = worktree_path(data_dir, session_id);
    if !target.exists() {
        return;
    }
    let repo_path = repo_path.to_path_buf();
    let session_id_owned = session_id.to_string();
    let result = tokio::task::spawn_blocking(move || prune_worktree(&repo_path, &session_id_owned)).await;
    if let Ok(Err(e)) = result {
        warn!(session_id, err = %e, "worktree removal failed, leaving directory in place");
    }
    let _ = tokio::fs::remove_dir_all(&target).await;
}

fn session_id_for_log(target: &Path) -> String {
    target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn create_worktree(repo_path: &Path, target: &Path, session_id: &str) -> Result<()> {
    let repo = git2::Repository::open(repo_path).context("open repository")?;
    let head = repo.head().context("repository has no HEAD")?;
    let head_commit = head.peel_to_commit().context("HEAD does not point to a commit")?;
    let branch_name = format!("archon/{session_id}");
    if repo.find_branch(&branch_name, git2::BranchType::Local).is_err() {
        repo.branch(&branch_name, &head_commit, false).context("create branch")?;
    }
    let mut opts = git2::WorktreeAddOptions::new();
    let reference = repo
        .find_reference(&format!("refs/heads/{branch_name}"))
        .context("find branch reference")?;
    opts.reference(Some(&reference));
    repo.worktree(session_id, target, Some(&opts)).context("create worktree")?;
    Ok(())
}

fn prune_worktree(repo_path: &Path, session_id: &str) -> Result<()> {
    let repo = git2::Repository::open(repo_path).context("open repository")?;
    let worktree = repo.find_worktree(session_id).context("find worktree")?;
    let mut opts = git2::WorktreePruneOptions::new();
    opts.working_tree(true);
    worktree.prune(Some(&mut opts)).context("prune worktree")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worktree_path_is_scoped_under_data_dir() {
        let p = worktree_path(Path::new("/data"), "sess-1");
        assert_eq!(p, Path::new("/data/worktrees/sess-1"));
    }
}
