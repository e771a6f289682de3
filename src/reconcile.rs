//! History reconciler — §4.6. Computes which remote messages are missing
//! from the local item log and appends only those, using `Item::dedup_key`
//! so a message that reappears with the same `provider_message_id` (or the
//! same `type|created_at|text`/`type|text` shadow) is never duplicated.

use crate::error::ArchonError;
use crate::model::Item;
use crate::store::ItemStore;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const BEST_EFFORT_BUDGET: Duration = Duration::from_secs(5);
const BACKGROUND_RETRIES: u32 = 9;
const BACKGROUND_MIN_BACKOFF: Duration = Duration::from_secs(2);
const BACKGROUND_MAX_BACKOFF: Duration = Duration::from_secs(10);

pub struct HistoryReconciler {
    items: Arc<ItemStore>,
}

impl HistoryReconciler {
    pub fn new(items: Arc<ItemStore>) -> Self {
        Self { items }
    }

    /// Append any `remote_items` whose dedup key is not already present in
    /// the local log, in order. Returns the items actually appended.
    pub async fn reconcile(&self, session_id: &str, remote_items: Vec<Item>) -> Result<Vec<Item>, ArchonError> {
        let local = self
            .items
            .read_all(session_id)
            .await
            .map_err(ArchonError::Internal)?;
        let mut seen: HashSet<String> = local.iter().map(Item::dedup_key).collect();
        let mut appended = Vec::new();
        for item in remote_items {
            let key = item.dedup_key();
            if seen.insert(key) {
                self.items
                    .append(session_id, &item)
                    .await
                    .map_err(ArchonError::Internal)?;
                appended.push(item);
            }
        }
        Ok(appended)
    }

    /// `ReconcileBestEffort(reason)`: one sync attempt with a 5s budget. On
    /// timeout or fetch failure, returns an empty backfill rather than
    /// propagating the error — reconciliation is inherently best-effort.
    pub async fn reconcile_best_effort<F, Fut>(&self, session_id: &str, fetch_remote: F) -> Vec<Item>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Item>, ArchonError>>,
    {
        match tokio::time::timeout(BEST_EFFORT_BUDGET, fetch_remote()).await {
            Ok(Ok(remote)) => self.reconcile(session_id, remote).await.unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Post-send background reconciler: retries up to 9 times with
    /// exponential backoff from 2s to 10s, stopping at the first backfill.
    pub async fn reconcile_until_backfill<F, Fut>(&self, session_id: &str, mut fetch_remote: F) -> Vec<Item>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Vec<Item>, ArchonError>>,
    {
        let mut backoff = BACKGROUND_MIN_BACKOFF;
        for attempt in 0..BACKGROUND_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKGROUND_MAX_BACKOFF);
            }
            let remote = match fetch_remote().await {
                Ok(r) => r,
                Err(_) => continue,
            };
            let appended = self.reconcile(session_id, remote).await.unwrap_or_default();
            if !appended.is_empty() {
                return appended;
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ItemType;

    fn item(text: &str, provider_message_id: Option<&str>) -> Item {
        let mut it = Item::new(ItemType::AgentMessage, crate::model::now_rfc3339());
        it.text = Some(text.to_string());
        it.provider_message_id = provider_message_id.map(String::from);
        it
    }

    #[tokio::test]
    async fn second_reconcile_of_unchanged_remote_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let items = Arc::new(ItemStore::new(dir.path()));
        let reconciler = HistoryReconciler::new(items);
        let remote = vec![item("A", Some("msg_1"))];
        let first = reconciler.reconcile("s1", remote.clone()).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = reconciler.reconcile("s1", remote).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn messages_without_provider_id_are_shadowed_by_text_match() {
        let dir = tempfile::tempdir().unwrap();
        let items = Arc::new(ItemStore::new(dir.path()));
        let reconciler = HistoryReconciler::new(items);
        reconciler
            .reconcile("s1", vec![item("hello", None)])
            .await
            .unwrap();
        let appended = reconciler
            .reconcile("s1", vec![item("hello", None)])
            .await
            .unwrap();
        assert!(appended.is_empty());
    }
}
