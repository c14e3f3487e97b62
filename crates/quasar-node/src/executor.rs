use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use quasar_common::{
    now_ms, DeploymentConfig, DeviceId, GpuId, ReplicaEvent, ReplicaOp, ReplicaRecord,
    ReplicaStatus,
};
use quasar_meta::keys::{self, DEPLOYMENTS_PREFIX};
use quasar_meta::{MetaStateStore, StateStore};

use crate::planner::ReplicaPlanner;

/// Version recorded when the request does not name one.
const DEFAULT_MODEL_VERSION: &str = "v1";

/// Where this worker's replicas are reachable. Replica `n` listens on
/// `base_port + n`.
#[derive(Debug, Clone)]
pub struct ServingEndpoint {
    pub host: String,
    pub base_port: u16,
    pub path: String,
    pub has_public_ip: bool,
}

impl ServingEndpoint {
    pub fn url_for(&self, replica_no: u32) -> String {
        let port = u32::from(self.base_port).saturating_add(replica_no);
        format!("http://{}:{}{}", self.host, port, self.path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Replica numbers changed by this run.
    pub applied: Vec<u32>,
    /// Replica numbers already in the requested state.
    pub skipped: Vec<u32>,
    /// Adds that did not fit into the GPU budget.
    pub shortfall: u32,
}

/// Applies a planned operation replica by replica.
///
/// Replica numbers are dense: adds create `curr+1..=target`, removes delete
/// `target+1..=curr` from the top. Running the same payload twice leaves the
/// store unchanged and republishes the same completion ids.
pub struct ReplicaExecutor {
    state: Arc<MetaStateStore>,
    serving: ServingEndpoint,
}

impl ReplicaExecutor {
    pub fn new(state: Arc<MetaStateStore>, serving: ServingEndpoint) -> Self {
        Self { state, serving }
    }

    pub async fn execute(&self, planner: &ReplicaPlanner) -> anyhow::Result<ExecutionReport> {
        let config = DeploymentConfig::from_payload(planner.payload())?;
        let entry = planner.checked_diff()?;
        let device = planner.device_id();

        let existing: BTreeMap<u32, ReplicaRecord> = self
            .state
            .get_deployment_results(&config.endpoint_id, &config.endpoint_name, &config.model_name)
            .await?
            .into_iter()
            .filter(|r| r.device_id == *device)
            .map(|r| (r.replica_no, r))
            .collect();
        let mut budget = planner.available_gpu_budget(self.state.as_ref()).await?;

        let mut report = ExecutionReport::default();
        match entry.op() {
            ReplicaOp::Add => {
                let per_replica = planner.gpu_per_replica() as usize;
                let (_, fits) = planner.plan_within_budget(&budget)?;

                let mut missing = Vec::new();
                for replica_no in entry.curr() + 1..=entry.target() {
                    if existing.contains_key(&replica_no) {
                        report.skipped.push(replica_no);
                        self.publish(&config, device, ReplicaOp::Add, replica_no).await?;
                    } else {
                        missing.push(replica_no);
                    }
                }

                // replicas already present hold their GPUs, so `fits` bounds the new ones
                let creatable = missing.len().min(fits as usize);
                report.shortfall = (missing.len() - creatable) as u32;
                if report.shortfall > 0 {
                    warn!(
                        endpoint_id=%config.endpoint_id,
                        device_id=%device,
                        free_gpus = budget.len(),
                        shortfall = report.shortfall,
                        "not enough free GPUs for remaining replicas"
                    );
                }

                for replica_no in missing.into_iter().take(creatable) {
                    let gpus: Vec<GpuId> = budget.iter().copied().take(per_replica).collect();
                    for gpu in &gpus {
                        budget.remove(gpu);
                    }

                    let record = ReplicaRecord {
                        end_point_id: config.endpoint_id.clone(),
                        end_point_name: config.endpoint_name.clone(),
                        model_name: config.model_name.clone(),
                        model_version: config
                            .model_version
                            .clone()
                            .unwrap_or_else(|| DEFAULT_MODEL_VERSION.to_string()),
                        device_id: device.clone(),
                        replica_no,
                        serving_url: self.serving.url_for(replica_no),
                        status: ReplicaStatus::Ready,
                        has_public_ip: self.serving.has_public_ip,
                        gpu_ids: gpus,
                    };
                    self.state.set_available_gpu_ids(device, &budget).await?;
                    self.state.put_deployment_result(&record).await?;
                    self.publish(&config, device, ReplicaOp::Add, replica_no).await?;
                    report.applied.push(replica_no);
                }
            }
            ReplicaOp::Remove => {
                for replica_no in (entry.target() + 1..=entry.curr()).rev() {
                    match existing.get(&replica_no) {
                        Some(record) => {
                            self.state
                                .delete_deployment_result(
                                    &config.endpoint_id,
                                    &config.endpoint_name,
                                    &config.model_name,
                                    device,
                                    replica_no,
                                )
                                .await?;
                            budget.extend(record.gpu_ids.iter().copied());
                            self.state.set_available_gpu_ids(device, &budget).await?;
                            report.applied.push(replica_no);
                        }
                        None => report.skipped.push(replica_no),
                    }
                    self.publish(&config, device, ReplicaOp::Remove, replica_no).await?;
                }
            }
        }

        info!(
            endpoint_id=%config.endpoint_id,
            device_id=%device,
            op=%entry.op(),
            applied=?report.applied,
            skipped=?report.skipped,
            "replica operation executed"
        );
        Ok(report)
    }

    async fn publish(
        &self,
        config: &DeploymentConfig,
        device: &DeviceId,
        op: ReplicaOp,
        replica_no: u32,
    ) -> anyhow::Result<()> {
        let event = ReplicaEvent::new(config.endpoint_id.clone(), device.clone(), op, replica_no, now_ms());
        self.state
            .kv()
            .put(
                &keys::replica_event(&config.endpoint_id, &event.op_id),
                serde_json::to_vec(&event)?,
            )
            .await
            .with_context(|| format!("publishing completion {}", event.op_id))?;
        Ok(())
    }
}

/// Publishes `all_gpus` minus the GPUs held by replicas already recorded on
/// this device, and returns the advertised set.
pub async fn advertise_gpus(
    state: &MetaStateStore,
    device: &DeviceId,
    all_gpus: &BTreeSet<GpuId>,
) -> anyhow::Result<BTreeSet<GpuId>> {
    let mut free = all_gpus.clone();
    for entry in state.kv().list_prefix(DEPLOYMENTS_PREFIX).await? {
        let Ok(record) = serde_json::from_slice::<ReplicaRecord>(&entry.value) else {
            continue;
        };
        if record.device_id == *device {
            for gpu in &record.gpu_ids {
                free.remove(gpu);
            }
        }
    }
    state.set_available_gpu_ids(device, &free).await?;
    Ok(free)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quasar_meta::MemoryKvStore;
    use serde_json::{json, Value};

    fn serving() -> ServingEndpoint {
        ServingEndpoint {
            host: "10.0.0.5".into(),
            base_port: 9000,
            path: "/predict".into(),
            has_public_ip: true,
        }
    }

    fn payload(op: &str, curr: u32, target: u32) -> Value {
        json!({
            "end_point_id": 3,
            "end_point_name": "ep",
            "model_config": {"model_name": "m", "model_version": "v2"},
            "parameters": {"gpu_per_replica": 2},
            "gpu_topology": {"devA": 4},
            "replica_num_diff": {"devA": {"op": op, "curr_num": curr, "target_num": target}},
            "gpus_per_replica": 2,
        })
    }

    async fn setup(gpus: &[GpuId]) -> (Arc<MetaStateStore>, ReplicaExecutor) {
        let state = Arc::new(MetaStateStore::new(Arc::new(MemoryKvStore::new())));
        let budget: BTreeSet<GpuId> = gpus.iter().copied().collect();
        state.set_available_gpu_ids(&"devA".into(), &budget).await.unwrap();
        let exec = ReplicaExecutor::new(state.clone(), serving());
        (state, exec)
    }

    async fn records(state: &MetaStateStore) -> Vec<ReplicaRecord> {
        state
            .get_deployment_results(&"3".into(), "ep", "m")
            .await
            .unwrap()
    }

    async fn event_count(state: &MetaStateStore) -> usize {
        state
            .kv()
            .list_prefix(&keys::replica_events_prefix(&"3".into()))
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_add_creates_records_and_reserves_gpus() {
        let (state, exec) = setup(&[0, 1, 2, 3]).await;
        let planner = ReplicaPlanner::new("devA".into(), payload("add", 0, 2));

        let report = exec.execute(&planner).await.unwrap();
        assert_eq!(report.applied, vec![1, 2]);
        assert_eq!(report.shortfall, 0);

        let recs = records(&state).await;
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].gpu_ids, vec![0, 1]);
        assert_eq!(recs[1].gpu_ids, vec![2, 3]);
        assert_eq!(recs[0].serving_url, "http://10.0.0.5:9001/predict");
        assert_eq!(recs[0].model_version, "v2");
        assert!(state.get_available_gpu_ids(&"devA".into()).await.unwrap().is_empty());
        assert_eq!(event_count(&state).await, 2);
    }

    #[tokio::test]
    async fn test_rerunning_same_payload_is_idempotent() {
        let (state, exec) = setup(&[0, 1, 2, 3]).await;
        let planner = ReplicaPlanner::new("devA".into(), payload("add", 0, 2));
        exec.execute(&planner).await.unwrap();

        let again = exec.execute(&planner).await.unwrap();
        assert!(again.applied.is_empty());
        assert_eq!(again.skipped, vec![1, 2]);
        assert_eq!(records(&state).await.len(), 2);
        assert_eq!(event_count(&state).await, 2);
    }

    #[tokio::test]
    async fn test_remove_releases_gpus_from_the_top() {
        let (state, exec) = setup(&[0, 1, 2, 3]).await;
        exec.execute(&ReplicaPlanner::new("devA".into(), payload("add", 0, 2)))
            .await
            .unwrap();

        let report = exec
            .execute(&ReplicaPlanner::new("devA".into(), payload("remove", 2, 1)))
            .await
            .unwrap();
        assert_eq!(report.applied, vec![2]);

        let recs = records(&state).await;
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].replica_no, 1);
        let free = state.get_available_gpu_ids(&"devA".into()).await.unwrap();
        assert_eq!(free, [2, 3].into_iter().collect());
    }

    #[tokio::test]
    async fn test_add_stops_at_budget() {
        let (state, exec) = setup(&[0, 1, 2]).await;
        let report = exec
            .execute(&ReplicaPlanner::new("devA".into(), payload("add", 0, 2)))
            .await
            .unwrap();
        assert_eq!(report.applied, vec![1]);
        assert_eq!(report.shortfall, 1);
        assert_eq!(records(&state).await.len(), 1);
    }

    #[tokio::test]
    async fn test_resumed_add_only_budgets_missing_replicas() {
        let (state, exec) = setup(&[0, 1]).await;
        exec.execute(&ReplicaPlanner::new("devA".into(), payload("add", 0, 1)))
            .await
            .unwrap();
        state
            .set_available_gpu_ids(&"devA".into(), &[4, 5].into_iter().collect())
            .await
            .unwrap();

        let report = exec
            .execute(&ReplicaPlanner::new("devA".into(), payload("add", 0, 2)))
            .await
            .unwrap();
        assert_eq!(report.skipped, vec![1]);
        assert_eq!(report.applied, vec![2]);
        assert_eq!(report.shortfall, 0);
        assert_eq!(records(&state).await[1].gpu_ids, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_missing_diff_fails_without_side_effects() {
        let (state, exec) = setup(&[0, 1]).await;
        let result = exec
            .execute(&ReplicaPlanner::new("devB".into(), payload("add", 0, 1)))
            .await;
        assert!(result.is_err());
        assert!(records(&state).await.is_empty());
        assert_eq!(event_count(&state).await, 0);
    }

    #[tokio::test]
    async fn test_advertise_excludes_reserved_gpus() {
        let (state, exec) = setup(&[0, 1, 2, 3]).await;
        exec.execute(&ReplicaPlanner::new("devA".into(), payload("add", 0, 1)))
            .await
            .unwrap();

        let all: BTreeSet<GpuId> = [0, 1, 2, 3].into_iter().collect();
        let free = advertise_gpus(&state, &"devA".into(), &all).await.unwrap();
        assert_eq!(free, [2, 3].into_iter().collect());
    }
}
