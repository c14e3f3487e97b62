//! Fakes shared by the router's unit tests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use quasar_common::{
    DeviceId, EndpointId, EndpointIdentity, GpuId, InferenceMetricSample, ReplicaRecord,
    ReplicaStatus,
};
use quasar_meta::StateStore;

use crate::error::TransportError;
use crate::transport::{DispatchPayload, DispatchTarget, InferenceReply, Transport};

pub fn target(has_public_ip: bool) -> DispatchTarget {
    DispatchTarget {
        endpoint_id: "7".into(),
        device_id: "devA".into(),
        inference_url: "http://10.0.0.1:9001/predict".into(),
        has_public_ip,
    }
}

pub fn payload() -> DispatchPayload {
    DispatchPayload {
        inputs: json!({"text": "hi", "stream": false}),
        outputs: json!([]),
        inference_type: "default".into(),
        stream: false,
    }
}

pub fn record(device: &str, has_public_ip: bool) -> ReplicaRecord {
    ReplicaRecord {
        end_point_id: "7".into(),
        end_point_name: "ep".into(),
        model_name: "m".into(),
        model_version: "v1".into(),
        device_id: device.into(),
        replica_no: 1,
        serving_url: "http://10.0.0.1:9001/predict".into(),
        status: ReplicaStatus::Ready,
        has_public_ip,
        gpu_ids: vec![0],
    }
}

enum Probe {
    Ready,
    NotReady,
    Slow(Duration),
}

/// Transport that answers from a script and counts calls.
pub struct FakeTransport {
    name: &'static str,
    probe: Probe,
    private_only: bool,
    fail: bool,
    pub probes: AtomicUsize,
    pub dispatches: AtomicUsize,
}

impl FakeTransport {
    fn new(name: &'static str, probe: Probe) -> Self {
        Self {
            name,
            probe,
            private_only: false,
            fail: false,
            probes: AtomicUsize::new(0),
            dispatches: AtomicUsize::new(0),
        }
    }

    pub fn ready(name: &'static str) -> Self {
        Self::new(name, Probe::Ready)
    }

    pub fn not_ready(name: &'static str) -> Self {
        Self::new(name, Probe::NotReady)
    }

    pub fn slow(name: &'static str, delay: Duration) -> Self {
        Self::new(name, Probe::Slow(delay))
    }

    pub fn private_only(mut self) -> Self {
        self.private_only = true;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    fn applies(&self, target: &DispatchTarget) -> bool {
        !self.private_only || !target.has_public_ip
    }

    async fn is_ready(&self, _target: &DispatchTarget, _timeout: Duration) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        match self.probe {
            Probe::Ready => true,
            Probe::NotReady => false,
            Probe::Slow(delay) => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }

    async fn dispatch(
        &self,
        _target: &DispatchTarget,
        payload: &DispatchPayload,
    ) -> Result<InferenceReply, TransportError> {
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(TransportError::Broker("scripted failure".into()));
        }
        Ok(InferenceReply::Json(json!({"via": self.name, "inputs": payload.inputs})))
    }
}

/// In-process [`StateStore`] for a single endpoint `7` named `ep` serving
/// model `m`, counting the lookups the pipeline makes.
pub struct CountingStore {
    pub token: Option<String>,
    pub active: bool,
    pub registered: bool,
    pub idle: Option<ReplicaRecord>,
    pub fail_metrics: bool,
    pub token_lookups: AtomicUsize,
    pub activation_lookups: AtomicUsize,
    pub idle_lookups: AtomicUsize,
    pub samples: Mutex<Vec<InferenceMetricSample>>,
}

impl Default for CountingStore {
    fn default() -> Self {
        Self {
            token: Some("secret".into()),
            active: true,
            registered: true,
            idle: Some(record("devA", true)),
            fail_metrics: false,
            token_lookups: AtomicUsize::new(0),
            activation_lookups: AtomicUsize::new(0),
            idle_lookups: AtomicUsize::new(0),
            samples: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl StateStore for CountingStore {
    async fn get_available_gpu_ids(&self, _device: &DeviceId) -> anyhow::Result<BTreeSet<GpuId>> {
        Ok(BTreeSet::new())
    }

    async fn get_deployment_results(
        &self,
        _endpoint: &EndpointId,
        _endpoint_name: &str,
        _model_name: &str,
    ) -> anyhow::Result<Vec<ReplicaRecord>> {
        Ok(self.idle.iter().cloned().collect())
    }

    async fn get_idle_device(
        &self,
        _endpoint: &EndpointId,
        _endpoint_name: &str,
        _model_name: &str,
        _model_version: &str,
    ) -> anyhow::Result<Option<ReplicaRecord>> {
        self.idle_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.idle.clone())
    }

    async fn get_endpoint_token(
        &self,
        _endpoint: &EndpointId,
        _endpoint_name: &str,
        _model_name: &str,
    ) -> anyhow::Result<Option<String>> {
        self.token_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.token.clone())
    }

    async fn get_endpoint_activation(&self, _endpoint: &EndpointId) -> anyhow::Result<bool> {
        self.activation_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.active)
    }

    async fn resolve_endpoint_by_id(
        &self,
        endpoint: &EndpointId,
    ) -> anyhow::Result<Option<EndpointIdentity>> {
        if !self.registered || endpoint.as_str() != "7" {
            return Ok(None);
        }
        Ok(Some(EndpointIdentity {
            end_point_name: "ep".into(),
            model_name: "m".into(),
        }))
    }

    async fn record_inference_metric(&self, sample: &InferenceMetricSample) -> anyhow::Result<()> {
        if self.fail_metrics {
            anyhow::bail!("metrics backend down");
        }
        if let Ok(mut samples) = self.samples.lock() {
            samples.push(sample.clone());
        }
        Ok(())
    }
}
