use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};

/// A change observed under a watched prefix. `value` is `None` for deletes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvEvent {
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
}

pub type KvStream = Pin<Box<dyn Stream<Item = KvEvent> + Send>>;

/// Raw key/value backend. Single-key operations are linearizable; there
/// are no multi-key transactions.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;
    /// Entries under `prefix`, ordered by key.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>>;
    async fn watch_prefix(&self, prefix: &str) -> Result<KvStream>;
}
