use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use quasar_common::{
    DeviceId, EndpointId, EndpointIdentity, GpuId, InferenceMetricSample, ReplicaRecord,
};

use crate::keys;
use crate::types::KeyValueStore;

/// Any model version.
pub const ANY_VERSION: &str = "*";
/// The greatest version among ready replicas.
pub const LATEST_VERSION: &str = "latest";

/// Typed view of the shared state consumed by the reconciliation and
/// routing core.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_available_gpu_ids(&self, device: &DeviceId) -> Result<BTreeSet<GpuId>>;

    async fn get_deployment_results(
        &self,
        endpoint: &EndpointId,
        endpoint_name: &str,
        model_name: &str,
    ) -> Result<Vec<ReplicaRecord>>;

    /// A ready replica for the given identity, or `None` when nothing is
    /// idle. The hosting device is `record.device_id`.
    async fn get_idle_device(
        &self,
        endpoint: &EndpointId,
        endpoint_name: &str,
        model_name: &str,
        model_version: &str,
    ) -> Result<Option<ReplicaRecord>>;

    async fn get_endpoint_token(
        &self,
        endpoint: &EndpointId,
        endpoint_name: &str,
        model_name: &str,
    ) -> Result<Option<String>>;

    /// Unknown endpoints are inactive.
    async fn get_endpoint_activation(&self, endpoint: &EndpointId) -> Result<bool>;

    async fn resolve_endpoint_by_id(&self, endpoint: &EndpointId)
        -> Result<Option<EndpointIdentity>>;

    async fn record_inference_metric(&self, sample: &InferenceMetricSample) -> Result<()>;
}

/// `StateStore` over any [`KeyValueStore`] backend, plus the writes that
/// workers and operators perform.
pub struct MetaStateStore {
    kv: Arc<dyn KeyValueStore>,
    cursor: AtomicUsize,
}

impl MetaStateStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key).await? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).with_context(|| format!("decoding {key}"))?,
            )),
            None => Ok(None),
        }
    }

    async fn put_json<T: Serialize + Sync + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.kv.put(key, serde_json::to_vec(value)?).await?;
        Ok(())
    }

    pub async fn set_available_gpu_ids(
        &self,
        device: &DeviceId,
        gpus: &BTreeSet<GpuId>,
    ) -> Result<()> {
        self.put_json(&keys::available_gpus(device), gpus).await
    }

    pub async fn put_deployment_result(&self, record: &ReplicaRecord) -> Result<()> {
        let key = keys::deployment_result(
            &record.end_point_id,
            &record.end_point_name,
            &record.model_name,
            &record.device_id,
            record.replica_no,
        );
        self.put_json(&key, record).await
    }

    pub async fn delete_deployment_result(
        &self,
        endpoint: &EndpointId,
        endpoint_name: &str,
        model_name: &str,
        device: &DeviceId,
        replica_no: u32,
    ) -> Result<bool> {
        let key = keys::deployment_result(endpoint, endpoint_name, model_name, device, replica_no);
        self.kv.delete(&key).await
    }

    pub async fn set_endpoint_activation(&self, endpoint: &EndpointId, active: bool) -> Result<()> {
        self.put_json(&keys::activation(endpoint), &active).await
    }

    pub async fn set_endpoint_token(
        &self,
        endpoint: &EndpointId,
        endpoint_name: &str,
        model_name: &str,
        token: &str,
    ) -> Result<()> {
        self.put_json(&keys::token(endpoint, endpoint_name, model_name), token)
            .await
    }

    pub async fn register_endpoint(
        &self,
        endpoint: &EndpointId,
        identity: &EndpointIdentity,
    ) -> Result<()> {
        self.put_json(&keys::endpoint_index(endpoint), identity).await
    }

    fn next_index(&self, len: usize) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % len
    }
}

#[async_trait]
impl StateStore for MetaStateStore {
    async fn get_available_gpu_ids(&self, device: &DeviceId) -> Result<BTreeSet<GpuId>> {
        Ok(self
            .get_json(&keys::available_gpus(device))
            .await?
            .unwrap_or_default())
    }

    async fn get_deployment_results(
        &self,
        endpoint: &EndpointId,
        endpoint_name: &str,
        model_name: &str,
    ) -> Result<Vec<ReplicaRecord>> {
        let prefix = keys::deployments_prefix(endpoint, endpoint_name, model_name);
        let mut out = Vec::new();
        for entry in self.kv.list_prefix(&prefix).await? {
            match serde_json::from_slice::<ReplicaRecord>(&entry.value) {
                Ok(record) => out.push(record),
                Err(e) => {
                    tracing::warn!(key=%entry.key, error=%e, "skipping undecodable replica record")
                }
            }
        }
        Ok(out)
    }

    async fn get_idle_device(
        &self,
        endpoint: &EndpointId,
        endpoint_name: &str,
        model_name: &str,
        model_version: &str,
    ) -> Result<Option<ReplicaRecord>> {
        let ready: Vec<ReplicaRecord> = self
            .get_deployment_results(endpoint, endpoint_name, model_name)
            .await?
            .into_iter()
            .filter(ReplicaRecord::is_ready)
            .collect();

        let mut candidates = select_version(ready, model_version);
        if candidates.is_empty() {
            return Ok(None);
        }
        let idx = self.next_index(candidates.len());
        Ok(Some(candidates.swap_remove(idx)))
    }

    async fn get_endpoint_token(
        &self,
        endpoint: &EndpointId,
        endpoint_name: &str,
        model_name: &str,
    ) -> Result<Option<String>> {
        self.get_json(&keys::token(endpoint, endpoint_name, model_name))
            .await
    }

    async fn get_endpoint_activation(&self, endpoint: &EndpointId) -> Result<bool> {
        Ok(self
            .get_json(&keys::activation(endpoint))
            .await?
            .unwrap_or(false))
    }

    async fn resolve_endpoint_by_id(
        &self,
        endpoint: &EndpointId,
    ) -> Result<Option<EndpointIdentity>> {
        self.get_json(&keys::endpoint_index(endpoint)).await
    }

    async fn record_inference_metric(&self, sample: &InferenceMetricSample) -> Result<()> {
        self.put_json(
            &keys::inference_metric(&sample.end_point_id, &sample.device_id),
            sample,
        )
        .await
    }
}

fn select_version(records: Vec<ReplicaRecord>, model_version: &str) -> Vec<ReplicaRecord> {
    match model_version {
        "" | ANY_VERSION => records,
        LATEST_VERSION => {
            let Some(latest) = records
                .iter()
                .map(|r| r.model_version.clone())
                .max_by(|a, b| compare_versions(a, b))
            else {
                return Vec::new();
            };
            records
                .into_iter()
                .filter(|r| r.model_version == latest)
                .collect()
        }
        exact => records
            .into_iter()
            .filter(|r| r.model_version == exact)
            .collect(),
    }
}

/// Orders `v2 < v10` and `1.2 < 1.10`: digit runs compare numerically,
/// everything else lexically.
pub fn compare_versions(a: &str, b: &str) -> CmpOrdering {
    let sa = version_segments(a);
    let sb = version_segments(b);
    for (x, y) in sa.iter().zip(sb.iter()) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(nx), Ok(ny)) => nx.cmp(&ny),
            _ => x.cmp(y),
        };
        if ord != CmpOrdering::Equal {
            return ord;
        }
    }
    sa.len().cmp(&sb.len())
}

fn version_segments(v: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_digits = false;
    for c in v.chars() {
        if c == '.' || c == '-' || c == '_' {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            continue;
        }
        let digit = c.is_ascii_digit();
        if !current.is_empty() && digit != in_digits {
            out.push(std::mem::take(&mut current));
        }
        in_digits = digit;
        current.push(c);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKvStore;
    use quasar_common::ReplicaStatus;

    fn record(device: &str, replica_no: u32, version: &str, status: ReplicaStatus) -> ReplicaRecord {
        ReplicaRecord {
            end_point_id: EndpointId::from("7"),
            end_point_name: "ep".into(),
            model_name: "m".into(),
            model_version: version.into(),
            device_id: DeviceId::from(device),
            replica_no,
            serving_url: format!("http://{device}:8000/predict"),
            status,
            has_public_ip: true,
            gpu_ids: vec![],
        }
    }

    fn store() -> MetaStateStore {
        MetaStateStore::new(Arc::new(MemoryKvStore::new()))
    }

    #[tokio::test]
    async fn test_gpu_budget_roundtrip_and_default() {
        let st = store();
        let dev = DeviceId::from("devA");
        assert!(st.get_available_gpu_ids(&dev).await.unwrap().is_empty());

        let gpus: BTreeSet<GpuId> = [0, 1, 3].into_iter().collect();
        st.set_available_gpu_ids(&dev, &gpus).await.unwrap();
        assert_eq!(st.get_available_gpu_ids(&dev).await.unwrap(), gpus);
    }

    #[tokio::test]
    async fn test_results_scoped_to_identity() {
        let st = store();
        st.put_deployment_result(&record("devA", 1, "v1", ReplicaStatus::Ready))
            .await
            .unwrap();
        let mut other = record("devA", 1, "v1", ReplicaStatus::Ready);
        other.model_name = "m2".into();
        st.put_deployment_result(&other).await.unwrap();

        let ep = EndpointId::from("7");
        let results = st.get_deployment_results(&ep, "ep", "m").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].model_name, "m");
    }

    #[tokio::test]
    async fn test_idle_device_skips_non_ready_and_round_robins() {
        let st = store();
        st.put_deployment_result(&record("devA", 1, "v1", ReplicaStatus::Ready))
            .await
            .unwrap();
        st.put_deployment_result(&record("devB", 1, "v1", ReplicaStatus::Ready))
            .await
            .unwrap();
        st.put_deployment_result(&record("devC", 1, "v1", ReplicaStatus::Deploying))
            .await
            .unwrap();

        let ep = EndpointId::from("7");
        let mut seen = BTreeSet::new();
        for _ in 0..4 {
            let rec = st.get_idle_device(&ep, "ep", "m", "*").await.unwrap().unwrap();
            seen.insert(rec.device_id.to_string());
        }
        assert_eq!(seen, ["devA".to_string(), "devB".to_string()].into_iter().collect());
    }

    #[tokio::test]
    async fn test_idle_device_version_selection() {
        let st = store();
        st.put_deployment_result(&record("devA", 1, "v2", ReplicaStatus::Ready))
            .await
            .unwrap();
        st.put_deployment_result(&record("devB", 1, "v10", ReplicaStatus::Ready))
            .await
            .unwrap();

        let ep = EndpointId::from("7");
        let latest = st.get_idle_device(&ep, "ep", "m", "latest").await.unwrap().unwrap();
        assert_eq!(latest.model_version, "v10");

        let exact = st.get_idle_device(&ep, "ep", "m", "v2").await.unwrap().unwrap();
        assert_eq!(exact.device_id.as_str(), "devA");

        assert!(st.get_idle_device(&ep, "ep", "m", "v3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_activation_and_token_defaults() {
        let st = store();
        let ep = EndpointId::from("7");
        assert!(!st.get_endpoint_activation(&ep).await.unwrap());
        assert!(st.get_endpoint_token(&ep, "ep", "m").await.unwrap().is_none());
        assert!(st.resolve_endpoint_by_id(&ep).await.unwrap().is_none());

        st.set_endpoint_activation(&ep, true).await.unwrap();
        st.set_endpoint_token(&ep, "ep", "m", "secret").await.unwrap();
        st.register_endpoint(
            &ep,
            &EndpointIdentity {
                end_point_name: "ep".into(),
                model_name: "m".into(),
            },
        )
        .await
        .unwrap();

        assert!(st.get_endpoint_activation(&ep).await.unwrap());
        assert_eq!(
            st.get_endpoint_token(&ep, "ep", "m").await.unwrap().as_deref(),
            Some("secret")
        );
        assert_eq!(
            st.resolve_endpoint_by_id(&ep).await.unwrap().unwrap().model_name,
            "m"
        );
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("v2", "v10"), CmpOrdering::Less);
        assert_eq!(compare_versions("1.2", "1.10"), CmpOrdering::Less);
        assert_eq!(compare_versions("1.0", "1.0"), CmpOrdering::Equal);
        assert_eq!(compare_versions("1.0.1", "1.0"), CmpOrdering::Greater);
    }
}
