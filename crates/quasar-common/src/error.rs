//! Error taxonomy shared by the controller and the workers.

use thiserror::Error;

use crate::ids::DeviceId;

/// A deployment request that cannot be placed. Fatal for that deployment:
/// it is rejected before any placement is computed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Every missing or invalid field found while validating the request.
    #[error("invalid deployment request: {}", .problems.join("; "))]
    InvalidRequest { problems: Vec<String> },

    #[error(
        "device {device} contributes {gpus} GPUs which is not divisible by gpu_per_replica={gpu_per_replica}"
    )]
    IndivisibleGpuCount {
        device: DeviceId,
        gpus: u32,
        gpu_per_replica: u32,
    },
}

/// Protocol mismatch between master and worker. Surfaced and retried on the
/// next reconciliation tick; never fatal for the worker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconciliationError {
    #[error("no replica diff addressed to device {0}")]
    MissingDiff(DeviceId),

    #[error("malformed replica diff for device {device}: {reason}")]
    MalformedDiff { device: DeviceId, reason: String },
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("device {0} is not part of the target placement")]
    UnknownDevice(DeviceId),

    #[error("state store error: {0}")]
    Store(String),
}
