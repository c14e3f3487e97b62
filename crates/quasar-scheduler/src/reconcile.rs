use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use quasar_common::{
    ControllerError, DeploymentStatus, DeviceId, EndpointId, ReplicaEvent,
};
use quasar_meta::keys::{
    self, DEPLOYMENT_REQUESTS_PREFIX, REPLICA_EVENTS_PREFIX, WORKER_REQUESTS_PREFIX,
};
use quasar_meta::{KvEvent, MetaStateStore};

use crate::completion::{Completion, CompletionLedger};
use crate::controller::ReplicaController;
use crate::metrics::SchedulerMetrics;

struct Tracked {
    controller: ReplicaController,
    ledger: CompletionLedger,
    converged: bool,
}

/// Master daemon state: one controller per deployment request.
pub struct Reconciler {
    master_id: DeviceId,
    state: Arc<MetaStateStore>,
    metrics: Arc<SchedulerMetrics>,
    deployments: HashMap<EndpointId, Tracked>,
}

impl Reconciler {
    pub fn new(master_id: DeviceId, state: Arc<MetaStateStore>, metrics: Arc<SchedulerMetrics>) -> Self {
        Self {
            master_id,
            state,
            metrics,
            deployments: HashMap::new(),
        }
    }

    pub fn is_tracking(&self, endpoint: &EndpointId) -> bool {
        self.deployments.contains_key(endpoint)
    }

    /// Accepts (or replaces) the request stored under `endpoint` and runs a
    /// pass for it. Invalid requests are marked rejected, not returned as
    /// errors.
    pub async fn submit(&mut self, endpoint: &EndpointId, request: Value) -> anyhow::Result<()> {
        let controller = match ReplicaController::new(self.master_id.clone(), request) {
            Ok(c) if c.config().endpoint_id == *endpoint => c,
            Ok(c) => {
                let reason = format!(
                    "end_point_id {} does not match request key {endpoint}",
                    c.config().endpoint_id
                );
                return self.reject(endpoint, reason).await;
            }
            Err(e) => return self.reject(endpoint, e.to_string()).await,
        };

        info!(
            endpoint_id=%endpoint,
            target=?controller.target(),
            "deployment request accepted"
        );
        self.deployments.insert(
            endpoint.clone(),
            Tracked {
                controller,
                ledger: CompletionLedger::new(),
                converged: false,
            },
        );
        self.metrics
            .deployments
            .store(self.deployments.len() as u64, Ordering::Relaxed);
        self.run_pass(endpoint).await
    }

    async fn reject(&mut self, endpoint: &EndpointId, reason: String) -> anyhow::Result<()> {
        warn!(endpoint_id=%endpoint, %reason, "deployment request rejected");
        self.metrics.rejected_total.fetch_add(1, Ordering::Relaxed);
        self.deployments.remove(endpoint);
        self.metrics
            .deployments
            .store(self.deployments.len() as u64, Ordering::Relaxed);
        self.clear_worker_requests(endpoint, &BTreeSet::new()).await?;
        write_status(&self.state, endpoint, &DeploymentStatus::Rejected { reason }).await
    }

    /// Stops tracking a deployment whose request was deleted.
    pub async fn withdraw(&mut self, endpoint: &EndpointId) -> anyhow::Result<()> {
        if self.deployments.remove(endpoint).is_some() {
            info!(endpoint_id=%endpoint, "deployment request withdrawn");
        }
        self.metrics
            .deployments
            .store(self.deployments.len() as u64, Ordering::Relaxed);
        self.clear_worker_requests(endpoint, &BTreeSet::new()).await?;
        self.state.kv().delete(&keys::deployment_status(endpoint)).await?;
        Ok(())
    }

    /// Deletes the endpoint's payload on every device outside `keep`.
    async fn clear_worker_requests(
        &self,
        endpoint: &EndpointId,
        keep: &BTreeSet<DeviceId>,
    ) -> anyhow::Result<()> {
        let kv = self.state.kv();
        for entry in kv.list_prefix(WORKER_REQUESTS_PREFIX).await? {
            match keys::worker_request_device(&entry.key, endpoint) {
                Some(device) if !keep.contains(&device) => {
                    debug!(endpoint_id=%endpoint, device_id=%device, "clearing worker payload");
                    kv.delete(&entry.key).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Re-reads observed state, recomputes the diff and publishes one
    /// payload per device that has work. Any other payload for the endpoint,
    /// including one on a device that left the topology, is removed.
    pub async fn run_pass(&mut self, endpoint: &EndpointId) -> anyhow::Result<()> {
        let Some(tracked) = self.deployments.get_mut(endpoint) else {
            return Ok(());
        };
        self.metrics.passes_total.fetch_add(1, Ordering::Relaxed);

        let observed = tracked
            .controller
            .load_observed_placement(self.state.as_ref())
            .await?;

        let kv = self.state.kv();
        for entry in kv.list_prefix(&keys::replica_events_prefix(endpoint)).await? {
            kv.delete(&entry.key).await?;
        }

        let diff = ReplicaController::diff(tracked.controller.target(), &observed);
        let payload = serde_json::to_vec(tracked.controller.attach_diff_to_request(&diff))?;
        tracked.ledger.reset(observed);

        let with_work: BTreeSet<DeviceId> = diff.devices().cloned().collect();
        for device in &with_work {
            kv.put(&keys::worker_request(device, endpoint), payload.clone())
                .await?;
            self.metrics
                .worker_requests_total
                .fetch_add(1, Ordering::Relaxed);
        }

        tracked.converged = tracked.controller.has_converged();
        let converged = tracked.converged;
        let status = if converged {
            DeploymentStatus::Converged
        } else {
            DeploymentStatus::Reconciling {
                pending_ops: tracked.controller.pending_ops(),
            }
        };

        self.clear_worker_requests(endpoint, &with_work).await?;
        info!(
            endpoint_id=%endpoint,
            devices_with_work = with_work.len(),
            converged,
            "reconciliation pass complete"
        );
        write_status(&self.state, endpoint, &status).await
    }

    /// Applies one worker completion. Duplicates and completions already
    /// folded into a newer pass are ignored.
    pub async fn handle_event(&mut self, event: ReplicaEvent) -> anyhow::Result<()> {
        let endpoint = event.end_point_id.clone();
        let Some(tracked) = self.deployments.get_mut(&endpoint) else {
            debug!(endpoint_id=%endpoint, op_id=%event.op_id, "completion for untracked deployment");
            return Ok(());
        };

        let key = keys::replica_event(&endpoint, &event.op_id);
        if self.state.kv().get(&key).await?.is_none() {
            debug!(endpoint_id=%endpoint, op_id=%event.op_id, "stale completion ignored");
            return Ok(());
        }

        match tracked.ledger.apply(&mut tracked.controller, &event) {
            Ok(Completion::Applied) => {
                self.metrics.completions_total.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Completion::Duplicate) => {
                self.metrics
                    .duplicate_completions_total
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Ok(Completion::Observed) => {
                debug!(endpoint_id=%endpoint, op_id=%event.op_id, "completion already in observed placement");
                return Ok(());
            }
            Err(ControllerError::UnknownDevice(device)) => {
                debug!(endpoint_id=%endpoint, device_id=%device, "completion on device outside target placement");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let status = if tracked.controller.has_converged() {
            if !tracked.converged {
                tracked.converged = true;
                self.metrics.converged_total.fetch_add(1, Ordering::Relaxed);
                info!(endpoint_id=%endpoint, "deployment converged");
            }
            DeploymentStatus::Converged
        } else {
            DeploymentStatus::Reconciling {
                pending_ops: tracked.controller.pending_ops(),
            }
        };
        write_status(&self.state, &endpoint, &status).await
    }

    /// Periodic pass over every tracked deployment. Failures are counted and
    /// retried on the next tick.
    pub async fn tick(&mut self) {
        let endpoints: Vec<EndpointId> = self.deployments.keys().cloned().collect();
        for endpoint in endpoints {
            if let Err(e) = self.run_pass(&endpoint).await {
                self.metrics.pass_errors_total.fetch_add(1, Ordering::Relaxed);
                warn!(endpoint_id=%endpoint, error=%e, "reconciliation pass failed");
            }
        }
    }

    async fn on_request_event(&mut self, ev: KvEvent) -> anyhow::Result<()> {
        let Some(endpoint) = ev.key.strip_prefix(DEPLOYMENT_REQUESTS_PREFIX) else {
            return Ok(());
        };
        let endpoint = EndpointId::from(endpoint);
        match ev.value {
            Some(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(request) => self.submit(&endpoint, request).await,
                Err(e) => self.reject(&endpoint, format!("request is not JSON: {e}")).await,
            },
            None => self.withdraw(&endpoint).await,
        }
    }

    async fn on_replica_event(&mut self, ev: KvEvent) -> anyhow::Result<()> {
        let Some(bytes) = ev.value else {
            return Ok(());
        };
        match serde_json::from_slice::<ReplicaEvent>(&bytes) {
            Ok(event) => self.handle_event(event).await,
            Err(e) => {
                warn!(key=%ev.key, error=%e, "failed to decode replica event");
                Ok(())
            }
        }
    }
}

async fn write_status(
    state: &MetaStateStore,
    endpoint: &EndpointId,
    status: &DeploymentStatus,
) -> anyhow::Result<()> {
    state
        .kv()
        .put(&keys::deployment_status(endpoint), serde_json::to_vec(status)?)
        .await?;
    Ok(())
}

/// Watches deployment requests and completion events, and re-runs every
/// pass on `interval`. Reconnects when a watch stream ends.
pub async fn run(mut reconciler: Reconciler, interval: Duration) -> anyhow::Result<()> {
    let kv = reconciler.state.kv().clone();
    info!(interval_secs = interval.as_secs(), "reconcile loop started");

    loop {
        let mut requests = match kv.watch_prefix(DEPLOYMENT_REQUESTS_PREFIX).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error=%e, "failed to watch deployment requests, will retry");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        let mut events = match kv.watch_prefix(REPLICA_EVENTS_PREFIX).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error=%e, "failed to watch replica events, will retry");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        match kv.list_prefix(DEPLOYMENT_REQUESTS_PREFIX).await {
            Ok(entries) => {
                for entry in entries {
                    let ev = KvEvent {
                        key: entry.key,
                        value: Some(entry.value),
                        revision: 0,
                    };
                    if let Err(e) = reconciler.on_request_event(ev).await {
                        warn!(error=%e, "failed to load deployment request");
                    }
                }
            }
            Err(e) => {
                warn!(error=%e, "failed to list deployment requests, will retry");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                ev = requests.next() => {
                    let Some(ev) = ev else { break };
                    if let Err(e) = reconciler.on_request_event(ev).await {
                        reconciler.metrics.pass_errors_total.fetch_add(1, Ordering::Relaxed);
                        warn!(error=%e, "failed to handle deployment request");
                    }
                }
                ev = events.next() => {
                    let Some(ev) = ev else { break };
                    if let Err(e) = reconciler.on_replica_event(ev).await {
                        warn!(error=%e, "failed to handle replica event");
                    }
                }
                _ = ticker.tick() => reconciler.tick().await,
            }
        }

        warn!("watch stream ended, reconnecting");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
