//! File-backed JSON stores — SPEC_FULL §4.11.
//!
//! `sessions.json` / `sessions_meta.json` / `approvals.json` are each a
//! single JSON array rewritten atomically on every mutation; the caller
//! (this module) serializes writers with one `tokio::sync::Mutex` per file,
//! matching the "single-writer-per-file" resource model in §5. Reads are
//! served from an in-memory cache kept in lock-step with the file so the
//! live-session core never waits on disk I/O for a lookup.

pub mod approvals;
pub mod items;
pub mod sessions;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

pub use approvals::ApprovalStore;
pub use items::ItemStore;
pub use sessions::SessionStore;

/// Read a JSON array file, returning an empty `Vec` if it does not exist yet.
pub(crate) async fn read_json_array<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
        Ok(bytes) => serde_json::from_slice(&bytes)
            .with_context(|| format!("parse {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

/// Write a JSON array atomically: serialize to a sibling temp file, then
/// rename over the destination so readers never observe a partial write.
pub(crate) async fn write_json_array<T: Serialize + Sync>(path: &Path, items: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(items)?;
    let tmp: PathBuf = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
