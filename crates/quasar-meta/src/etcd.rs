use anyhow::{Context, Result};
use etcd_client::{Client, EventType, GetOptions, WatchOptions};
use tokio_stream::wrappers::ReceiverStream;

use crate::types::{KeyValueStore, KvEntry, KvEvent, KvStream};

/// etcd backend. Every key is stored under `namespace` so several clusters
/// can share one etcd; callers never see the namespace.
#[derive(Clone)]
pub struct EtcdKvStore {
    client: Client,
    namespace: String,
}

impl EtcdKvStore {
    pub async fn connect(endpoints: &[String], namespace: &str) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .with_context(|| format!("connecting to etcd at {endpoints:?}"))?;
        Ok(Self {
            client,
            namespace: namespace.trim_end_matches('/').to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    fn strip(&self, raw: &[u8]) -> String {
        let key = String::from_utf8_lossy(raw);
        key.strip_prefix(self.namespace.as_str())
            .unwrap_or(&key)
            .to_string()
    }
}

#[async_trait::async_trait]
impl KeyValueStore for EtcdKvStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let mut cli = self.client.clone();
        let resp = cli.put(self.full_key(key), value, None).await?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or_default() as u64)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut cli = self.client.clone();
        let resp = cli.get(self.full_key(key), None).await?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut cli = self.client.clone();
        let resp = cli.delete(self.full_key(key), None).await?;
        Ok(resp.deleted() > 0)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        let mut cli = self.client.clone();
        let opts = GetOptions::new().with_prefix();
        let resp = cli.get(self.full_key(prefix), Some(opts)).await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| KvEntry {
                key: self.strip(kv.key()),
                value: kv.value().to_vec(),
            })
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<KvStream> {
        let mut cli = self.client.clone();
        let opts = WatchOptions::new().with_prefix();
        let (watcher, mut stream) = cli.watch(self.full_key(prefix), Some(opts)).await?;

        let (tx, rx) = tokio::sync::mpsc::channel::<KvEvent>(1024);
        let this = self.clone();
        tokio::spawn(async move {
            // dropping the watcher cancels the etcd watch
            let _watcher = watcher;
            loop {
                let resp = match stream.message().await {
                    Ok(Some(r)) => r,
                    Ok(None) => return,
                    Err(e) => {
                        tracing::warn!(error=%e, "etcd watch stream failed");
                        return;
                    }
                };
                for ev in resp.events() {
                    let Some(kv) = ev.kv() else { continue };
                    let value = match ev.event_type() {
                        EventType::Put => Some(kv.value().to_vec()),
                        EventType::Delete => None,
                    };
                    let event = KvEvent {
                        key: this.strip(kv.key()),
                        value,
                        revision: kv.mod_revision() as u64,
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
