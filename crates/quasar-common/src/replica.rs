use serde::{Deserialize, Serialize};

use crate::ids::{DeviceId, EndpointId, GpuId};
use crate::placement::ReplicaOp;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaStatus {
    Deploying,
    Ready,
    Failed,
}

fn default_true() -> bool {
    true
}

/// Deployment result for one replica, written by the worker that hosts it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaRecord {
    pub end_point_id: EndpointId,
    pub end_point_name: String,
    pub model_name: String,
    pub model_version: String,
    pub device_id: DeviceId,
    pub replica_no: u32,
    pub serving_url: String,
    pub status: ReplicaStatus,
    #[serde(default = "default_true")]
    pub has_public_ip: bool,
    #[serde(default)]
    pub gpu_ids: Vec<GpuId>,
}

impl ReplicaRecord {
    pub fn is_ready(&self) -> bool {
        self.status == ReplicaStatus::Ready
    }
}

/// Direction of one completed replica operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaDelta {
    Added,
    Removed,
}

impl From<ReplicaOp> for ReplicaDelta {
    fn from(op: ReplicaOp) -> Self {
        match op {
            ReplicaOp::Add => ReplicaDelta::Added,
            ReplicaOp::Remove => ReplicaDelta::Removed,
        }
    }
}

/// Completion report a worker publishes after applying one unit operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaEvent {
    pub op_id: String,
    pub end_point_id: EndpointId,
    pub device_id: DeviceId,
    pub op: ReplicaOp,
    pub replica_no: u32,
    pub timestamp_ms: u64,
}

impl ReplicaEvent {
    pub fn new(
        end_point_id: EndpointId,
        device_id: DeviceId,
        op: ReplicaOp,
        replica_no: u32,
        timestamp_ms: u64,
    ) -> Self {
        let op_id = Self::op_id_for(&end_point_id, &device_id, op, replica_no);
        Self {
            op_id,
            end_point_id,
            device_id,
            op,
            replica_no,
            timestamp_ms,
        }
    }

    /// Stable per-operation id. Redelivery of the same operation yields the
    /// same id.
    pub fn op_id_for(
        end_point_id: &EndpointId,
        device_id: &DeviceId,
        op: ReplicaOp,
        replica_no: u32,
    ) -> String {
        format!("{end_point_id}:{device_id}:{op}:{replica_no}")
    }

    pub fn delta(&self) -> ReplicaDelta {
        self.op.into()
    }
}

/// `(endpoint_name, model_name)` an endpoint id resolves to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointIdentity {
    pub end_point_name: String,
    pub model_name: String,
}

/// Latest latency sample for one replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InferenceMetricSample {
    pub end_point_id: EndpointId,
    pub end_point_name: String,
    pub model_name: String,
    pub model_version: String,
    pub device_id: DeviceId,
    pub latency_ms: u64,
    /// Requests per second implied by this single call.
    pub throughput: f64,
    pub success: bool,
    pub timestamp_ms: u64,
}
