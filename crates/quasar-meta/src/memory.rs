use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::types::{KeyValueStore, KvEntry, KvEvent, KvStream};

/// In-process backend used by tests and single-binary setups.
#[derive(Debug, Clone)]
pub struct MemoryKvStore {
    inner: Arc<RwLock<Inner>>,
    tx: broadcast::Sender<KvEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, Vec<u8>>,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.revision = self.revision.saturating_add(1);
        self.revision
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            tx,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.kv.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let event = {
            let mut inner = self.inner.write().await;
            let revision = inner.bump();
            inner.kv.insert(key.to_string(), value.clone());
            KvEvent {
                key: key.to_string(),
                value: Some(value),
                revision,
            }
        };
        let revision = event.revision;
        // no subscribers is fine
        let _ = self.tx.send(event);
        Ok(revision)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().await.kv.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let event = {
            let mut inner = self.inner.write().await;
            if inner.kv.remove(key).is_none() {
                return Ok(false);
            }
            KvEvent {
                key: key.to_string(),
                value: None,
                revision: inner.bump(),
            }
        };
        let _ = self.tx.send(event);
        Ok(true)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KvEntry {
                key: k.clone(),
                value: v.clone(),
            })
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<KvStream> {
        let prefix = prefix.to_string();
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(move |msg| match msg {
            Ok(ev) if ev.key.starts_with(&prefix) => Some(ev),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error=%e, "memory watch lagged, events dropped");
                None
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_prefix_is_scoped() {
        let store = MemoryKvStore::new();
        store.put("/a/1", b"x".to_vec()).await.unwrap();
        store.put("/a/2", b"y".to_vec()).await.unwrap();
        store.put("/ab/1", b"z".to_vec()).await.unwrap();
        store.put("/b/1", b"w".to_vec()).await.unwrap();

        let keys: Vec<String> = store
            .list_prefix("/a/")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["/a/1", "/a/2"]);
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let store = MemoryKvStore::new();
        store.put("/k", b"v".to_vec()).await.unwrap();
        assert!(store.delete("/k").await.unwrap());
        assert!(!store.delete("/k").await.unwrap());
        assert!(store.get("/k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watch_sees_puts_and_deletes_under_prefix() {
        let store = MemoryKvStore::new();
        let mut stream = store.watch_prefix("/w/").await.unwrap();

        store.put("/other", b"1".to_vec()).await.unwrap();
        store.put("/w/a", b"2".to_vec()).await.unwrap();
        store.delete("/w/a").await.unwrap();

        let first = stream.next().await.unwrap();
        assert_eq!(first.key, "/w/a");
        assert_eq!(first.value.as_deref(), Some(b"2".as_slice()));

        let second = stream.next().await.unwrap();
        assert_eq!(second.key, "/w/a");
        assert!(second.value.is_none());
        assert!(second.revision > first.revision);
    }
}
