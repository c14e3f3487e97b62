use std::collections::BTreeSet;

use serde_json::Value;
use tracing::{debug, warn};

use quasar_common::{
    attach_replica_diff, ConfigurationError, ControllerError, DeploymentConfig, DeviceId,
    DiffEntry, ReplicaDelta, ReplicaDiff, ReplicaPlacement,
};
use quasar_meta::StateStore;

/// Master-side reconciliation for one endpoint.
///
/// Holds the validated request, the target placement derived from it and an
/// intermediate placement that starts from the observed state and moves only
/// through [`ReplicaController::record_completion`].
#[derive(Debug, Clone)]
pub struct ReplicaController {
    master_id: DeviceId,
    request: Value,
    config: DeploymentConfig,
    target: ReplicaPlacement,
    intermediate: ReplicaPlacement,
}

impl ReplicaController {
    pub fn new(master_id: DeviceId, request: Value) -> Result<Self, ConfigurationError> {
        let config = DeploymentConfig::from_payload(&request)?;
        let target = target_placement(&config)?;
        let total = target.total();
        if total < config.min_replica_num || total > config.max_replica_num {
            warn!(
                endpoint_id=%config.endpoint_id,
                total,
                min=config.min_replica_num,
                max=config.max_replica_num,
                "target replica count outside configured scale bounds"
            );
        }
        Ok(Self {
            master_id,
            request,
            config,
            target,
            intermediate: ReplicaPlacement::new(),
        })
    }

    pub fn master_id(&self) -> &DeviceId {
        &self.master_id
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    pub fn request(&self) -> &Value {
        &self.request
    }

    pub fn target(&self) -> &ReplicaPlacement {
        &self.target
    }

    pub fn intermediate(&self) -> &ReplicaPlacement {
        &self.intermediate
    }

    pub fn compute_target_placement(&self) -> Result<ReplicaPlacement, ConfigurationError> {
        target_placement(&self.config)
    }

    /// Counts the endpoint's deployment records per device and resets the
    /// intermediate placement to that snapshot.
    pub async fn load_observed_placement(
        &mut self,
        store: &dyn StateStore,
    ) -> Result<ReplicaPlacement, ControllerError> {
        let records = store
            .get_deployment_results(
                &self.config.endpoint_id,
                &self.config.endpoint_name,
                &self.config.model_name,
            )
            .await
            .map_err(|e| ControllerError::Store(format!("{e:#}")))?;

        let mut observed = ReplicaPlacement::new();
        for record in records {
            let count = observed.get(&record.device_id) + 1;
            observed.set(record.device_id, count);
        }
        debug!(
            endpoint_id=%self.config.endpoint_id,
            replicas = observed.total(),
            devices = observed.len(),
            "loaded observed placement"
        );

        self.intermediate = observed.clone();
        Ok(observed)
    }

    /// One entry per device whose target and observed counts differ.
    pub fn diff(target: &ReplicaPlacement, observed: &ReplicaPlacement) -> ReplicaDiff {
        let devices: BTreeSet<&DeviceId> = target.devices().chain(observed.devices()).collect();

        let mut diff = ReplicaDiff::new();
        for device in devices {
            let curr = observed.get(device);
            let want = target.get(device);
            let entry = if want > curr {
                DiffEntry::Add { curr, target: want }
            } else if want < curr {
                DiffEntry::Remove { curr, target: want }
            } else {
                continue;
            };
            diff.insert(device.clone(), entry);
        }
        diff
    }

    pub fn attach_diff_to_request(&mut self, diff: &ReplicaDiff) -> &Value {
        attach_replica_diff(&mut self.request, diff, self.config.gpu_per_replica);
        &self.request
    }

    pub fn record_completion(
        &mut self,
        device: &DeviceId,
        delta: ReplicaDelta,
    ) -> Result<(), ControllerError> {
        if !self.target.contains(device) {
            return Err(ControllerError::UnknownDevice(device.clone()));
        }
        let current = self.intermediate.get(device);
        let next = match delta {
            ReplicaDelta::Added => current.saturating_add(1),
            ReplicaDelta::Removed => current.saturating_sub(1),
        };
        self.intermediate.set(device.clone(), next);
        Ok(())
    }

    pub fn has_converged(&self) -> bool {
        self.target
            .iter()
            .all(|(device, want)| self.intermediate.get(device) == want)
    }

    /// Unit operations still outstanding on target devices.
    pub fn pending_ops(&self) -> u32 {
        self.target
            .iter()
            .map(|(device, want)| self.intermediate.get(device).abs_diff(want))
            .sum()
    }
}

fn target_placement(config: &DeploymentConfig) -> Result<ReplicaPlacement, ConfigurationError> {
    let mut placement = ReplicaPlacement::new();
    for (device, &gpus) in &config.gpu_topology {
        if gpus % config.gpu_per_replica != 0 {
            return Err(ConfigurationError::IndivisibleGpuCount {
                device: device.clone(),
                gpus,
                gpu_per_replica: config.gpu_per_replica,
            });
        }
        placement.set(device.clone(), gpus / config.gpu_per_replica);
    }
    Ok(placement)
}
