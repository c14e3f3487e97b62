use std::collections::BTreeSet;

use serde_json::Value;

use quasar_common::deployment::DEFAULT_GPU_PER_REPLICA;
use quasar_common::{
    DeviceId, DiffEntry, GpuId, ReconciliationError, ReplicaOp, GPUS_PER_REPLICA_KEY,
    REPLICA_DIFF_KEY,
};
use quasar_meta::StateStore;

/// Worker-side view of one payload: turns this device's slice of the diff
/// into a single operation.
///
/// Planning is a pure function of the payload, so a restarted worker that
/// re-reads the same payload plans the same operation.
#[derive(Debug, Clone)]
pub struct ReplicaPlanner {
    device_id: DeviceId,
    payload: Value,
}

impl ReplicaPlanner {
    pub fn new(device_id: DeviceId, payload: Value) -> Self {
        Self { device_id, payload }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn gpu_per_replica(&self) -> u32 {
        self.payload
            .get(GPUS_PER_REPLICA_KEY)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_GPU_PER_REPLICA)
    }

    /// This device's diff entry. Absent or undecodable entries yield `None`.
    pub fn my_diff(&self) -> Option<DiffEntry> {
        match self.checked_diff() {
            Ok(entry) => Some(entry),
            Err(ReconciliationError::MissingDiff(_)) => None,
            Err(e) => {
                tracing::warn!(device_id=%self.device_id, error=%e, "ignoring malformed diff entry");
                None
            }
        }
    }

    /// The diff entry, validated against its own op.
    pub fn checked_diff(&self) -> Result<DiffEntry, ReconciliationError> {
        let raw = self
            .payload
            .get(REPLICA_DIFF_KEY)
            .and_then(|d| d.get(self.device_id.as_str()))
            .ok_or_else(|| ReconciliationError::MissingDiff(self.device_id.clone()))?;

        let entry: DiffEntry =
            serde_json::from_value(raw.clone()).map_err(|e| ReconciliationError::MalformedDiff {
                device: self.device_id.clone(),
                reason: e.to_string(),
            })?;

        if entry.op_count().is_none() {
            return Err(ReconciliationError::MalformedDiff {
                device: self.device_id.clone(),
                reason: format!(
                    "{} cannot go from {} to {}",
                    entry.op(),
                    entry.curr(),
                    entry.target()
                ),
            });
        }
        Ok(entry)
    }

    pub fn plan(&self) -> Result<(ReplicaOp, u32), ReconciliationError> {
        let entry = self.checked_diff()?;
        let count = entry.op_count().unwrap_or_default();
        Ok((entry.op(), count))
    }

    pub async fn available_gpu_budget(
        &self,
        store: &dyn StateStore,
    ) -> anyhow::Result<BTreeSet<GpuId>> {
        store.get_available_gpu_ids(&self.device_id).await
    }

    /// Like [`plan`](Self::plan), with adds capped at what the free GPUs
    /// can host. Removes are never capped.
    pub fn plan_within_budget(
        &self,
        budget: &BTreeSet<GpuId>,
    ) -> Result<(ReplicaOp, u32), ReconciliationError> {
        let (op, count) = self.plan()?;
        match op {
            ReplicaOp::Add => {
                let hostable = (budget.len() as u32) / self.gpu_per_replica();
                Ok((op, count.min(hostable)))
            }
            ReplicaOp::Remove => Ok((op, count)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn planner(diff: Value) -> ReplicaPlanner {
        ReplicaPlanner::new(
            "devA".into(),
            json!({"replica_num_diff": diff, "gpus_per_replica": 2}),
        )
    }

    #[test]
    fn test_plan_add() {
        let p = planner(json!({"devA": {"op": "add", "curr_num": 1, "target_num": 3}}));
        assert_eq!(p.plan().unwrap(), (ReplicaOp::Add, 2));
    }

    #[test]
    fn test_plan_remove() {
        let p = planner(json!({"devA": {"op": "remove", "curr_num": 3, "target_num": 1}}));
        assert_eq!(p.plan().unwrap(), (ReplicaOp::Remove, 2));
    }

    #[test]
    fn test_missing_diff_is_not_an_error_for_my_diff() {
        let p = planner(json!({"devB": {"op": "add", "curr_num": 0, "target_num": 1}}));
        assert!(p.my_diff().is_none());
        assert_eq!(
            p.plan().unwrap_err(),
            ReconciliationError::MissingDiff("devA".into())
        );

        let empty = ReplicaPlanner::new("devA".into(), json!({}));
        assert!(empty.my_diff().is_none());
    }

    #[test]
    fn test_malformed_entries() {
        let unknown_op = planner(json!({"devA": {"op": "resize", "curr_num": 1, "target_num": 2}}));
        assert!(matches!(
            unknown_op.plan(),
            Err(ReconciliationError::MalformedDiff { .. })
        ));
        assert!(unknown_op.my_diff().is_none());

        let wrong_direction = planner(json!({"devA": {"op": "add", "curr_num": 3, "target_num": 1}}));
        assert!(matches!(
            wrong_direction.plan(),
            Err(ReconciliationError::MalformedDiff { reason, .. }) if reason.contains("add cannot go from 3 to 1")
        ));
    }

    #[test]
    fn test_plan_is_repeatable() {
        let p = planner(json!({"devA": {"op": "add", "curr_num": 0, "target_num": 2}}));
        assert_eq!(p.plan().unwrap(), p.plan().unwrap());
    }

    #[test]
    fn test_plan_within_budget_caps_adds_only() {
        let add = planner(json!({"devA": {"op": "add", "curr_num": 0, "target_num": 3}}));
        let budget: BTreeSet<GpuId> = [0, 1, 2].into_iter().collect();
        assert_eq!(add.plan_within_budget(&budget).unwrap(), (ReplicaOp::Add, 1));

        let remove = planner(json!({"devA": {"op": "remove", "curr_num": 3, "target_num": 0}}));
        assert_eq!(
            remove.plan_within_budget(&BTreeSet::new()).unwrap(),
            (ReplicaOp::Remove, 3)
        );
    }

    #[test]
    fn test_gpu_per_replica_defaults_to_one() {
        let p = ReplicaPlanner::new("devA".into(), json!({}));
        assert_eq!(p.gpu_per_replica(), 1);
    }
}
