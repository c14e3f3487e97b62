pub mod deployment;
pub mod error;
pub mod ids;
pub mod placement;
pub mod replica;
pub mod telemetry;

pub use deployment::{
    attach_replica_diff, DeploymentConfig, DeploymentStatus, GPUS_PER_REPLICA_KEY,
    REPLICA_DIFF_KEY,
};
pub use error::{ConfigurationError, ControllerError, ReconciliationError};
pub use ids::{DeviceId, EndpointId, GpuId};
pub use placement::{DiffEntry, ReplicaDiff, ReplicaOp, ReplicaPlacement};
pub use replica::{
    EndpointIdentity, InferenceMetricSample, ReplicaDelta, ReplicaEvent, ReplicaRecord,
    ReplicaStatus,
};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
