use crate::model::Item;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{
    fs::OpenOptions,
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::Mutex,
};

/// Append-only JSONL item log, one file per session (§4.10/§6:
/// `items/{session_id}.jsonl`). Each session's file handle is opened lazily
/// on first append and cached for the daemon's lifetime; writes append with
/// a trailing newline and never edit in place, grounded on the teacher's
/// `session::events::EventLog`.
pub struct ItemStore {
    dir: PathBuf,
    handles: Mutex<HashMap<String, Arc<Mutex<Option<tokio::fs::File>>>>>,
}

impl ItemStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("items"),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.jsonl"))
    }

    async fn handle_for(&self, session_id: &str) -> Arc<Mutex<Option<tokio::fs::File>>> {
        let mut guard = self.handles.lock().await;
        guard
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    pub async fn append(&self, session_id: &str, item: &Item) -> Result<()> {
        let handle = self.handle_for(session_id).await;
        let mut file_guard = handle.lock().await;
        if file_guard.is_none() {
            tokio::fs::create_dir_all(&self.dir).await?;
            let f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path_for(session_id))
                .await?;
            *file_guard = Some(f);
        }
        let file = file_guard.as_mut().unwrap();
        let line = serde_json::to_string(item)? + "\n";
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read every item ever appended for a session, in append order. Used by
    /// the history reconciler (§4.6) to compute dedup keys against what is
    /// already on disk.
    pub async fn read_all(&self, session_id: &str) -> Result<Vec<Item>> {
        self.read_lines(session_id, None).await
    }

    /// Read at most the last `n` items, for the `GET /v1/sessions/{id}/tail`
    /// surface (§6's `lines` query parameter).
    pub async fn read_tail(&self, session_id: &str, n: usize) -> Result<Vec<Item>> {
        let mut items = self.read_lines(session_id, None).await?;
        if items.len() > n {
            items = items.split_off(items.len() - n);
        }
        Ok(items)
    }

    async fn read_lines(&self, session_id: &str, _limit: Option<usize>) -> Result<Vec<Item>> {
        let path = self.path_for(session_id);
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("open {}", path.display())),
        };
        let mut reader = BufReader::new(file).lines();
        let mut out = Vec::new();
        while let Some(line) = reader.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let item: Item = serde_json::from_str(&line)
                .with_context(|| format!("parse item line in {}", path.display()))?;
            out.push(item);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ItemType;

    fn item(text: &str) -> Item {
        let mut it = Item::new(ItemType::UserMessage, crate::model::now_rfc3339());
        it.text = Some(text.to_string());
        it
    }

    #[tokio::test]
    async fn appends_are_durable_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let store = ItemStore::new(dir.path());
        store.append("s1", &item("hello")).await.unwrap();
        store.append("s1", &item("world")).await.unwrap();
        let all = store.read_all("s1").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].text.as_deref(), Some("hello"));
        assert_eq!(all[1].text.as_deref(), Some("world"));
    }

    #[tokio::test]
    async fn tail_returns_only_the_last_n() {
        let dir = tempfile::tempdir().unwrap();
        let store = ItemStore::new(dir.path());
        for i in 0..5 {
            store.append("s1", &item(&i.to_string())).await.unwrap();
        }
        let tail = store.read_tail("s1", 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].text.as_deref(), Some("3"));
        assert_eq!(tail[1].text.as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn missing_session_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ItemStore::new(dir.path());
        assert!(store.read_all("nope").await.unwrap().is_empty());
    }
}
