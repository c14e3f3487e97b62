use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigurationError;
use crate::ids::{DeviceId, EndpointId};
use crate::placement::ReplicaDiff;

/// Payload key carrying the per-device diff to workers.
pub const REPLICA_DIFF_KEY: &str = "replica_num_diff";
/// Payload key carrying the GPU quota per replica to workers.
pub const GPUS_PER_REPLICA_KEY: &str = "gpus_per_replica";

pub const DEFAULT_GPU_PER_REPLICA: u32 = 1;

/// Validated view of a deployment request payload.
///
/// Built once from the raw JSON the control plane sends; every missing or
/// invalid field is reported together instead of failing on first access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentConfig {
    pub endpoint_id: EndpointId,
    pub endpoint_name: String,
    pub model_name: String,
    pub model_version: Option<String>,
    pub gpu_topology: BTreeMap<DeviceId, u32>,
    pub gpu_per_replica: u32,
    pub min_replica_num: u32,
    pub max_replica_num: u32,
}

impl DeploymentConfig {
    pub fn from_payload(payload: &Value) -> Result<Self, ConfigurationError> {
        let mut problems = Vec::new();

        if !payload.is_object() {
            return Err(ConfigurationError::InvalidRequest {
                problems: vec!["request payload must be a JSON object".to_string()],
            });
        }

        let endpoint_id = match payload.get("end_point_id") {
            None | Some(Value::Null) => {
                problems.push("end_point_id is missing".to_string());
                None
            }
            Some(v) => match serde_json::from_value::<EndpointId>(v.clone()) {
                Ok(id) => Some(id),
                Err(_) => {
                    problems.push(format!("end_point_id has invalid value {v}"));
                    None
                }
            },
        };

        let endpoint_name = required_str(payload.get("end_point_name"), "end_point_name", &mut problems);

        let model_config = payload.get("model_config");
        if model_config.map(|v| !v.is_object()).unwrap_or(true) {
            problems.push("model_config is missing".to_string());
        }
        let model_name = required_str(
            model_config.and_then(|c| c.get("model_name")),
            "model_config.model_name",
            &mut problems,
        );
        let model_version = model_config
            .and_then(|c| c.get("model_version"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let gpu_topology = match payload.get("gpu_topology") {
            None | Some(Value::Null) => {
                problems.push("gpu_topology is missing".to_string());
                BTreeMap::new()
            }
            Some(Value::Object(map)) => {
                let mut topology = BTreeMap::new();
                for (device, gpus) in map {
                    match gpus.as_u64().and_then(|n| u32::try_from(n).ok()) {
                        Some(n) => {
                            topology.insert(DeviceId::from(device.as_str()), n);
                        }
                        None => problems.push(format!(
                            "gpu_topology.{device} must be a non-negative integer, got {gpus}"
                        )),
                    }
                }
                topology
            }
            Some(other) => {
                problems.push(format!("gpu_topology must be an object, got {other}"));
                BTreeMap::new()
            }
        };

        let gpu_per_replica = optional_u32(
            payload.get("parameters").and_then(|p| p.get("gpu_per_replica")),
            "parameters.gpu_per_replica",
            &mut problems,
        )
        .unwrap_or(DEFAULT_GPU_PER_REPLICA);
        if gpu_per_replica == 0 {
            problems.push("parameters.gpu_per_replica must be at least 1".to_string());
        }

        let total_gpus: u32 = gpu_topology.values().sum();
        let min_replica_num = optional_u32(
            model_config.and_then(|c| c.get("instance_scale_min")),
            "model_config.instance_scale_min",
            &mut problems,
        )
        .unwrap_or(0);
        let max_replica_num = optional_u32(
            model_config.and_then(|c| c.get("instance_scale_max")),
            "model_config.instance_scale_max",
            &mut problems,
        )
        .unwrap_or(total_gpus);
        if min_replica_num > max_replica_num {
            problems.push(format!(
                "instance_scale_min ({min_replica_num}) exceeds instance_scale_max ({max_replica_num})"
            ));
        }

        match (endpoint_id, endpoint_name, model_name) {
            (Some(endpoint_id), Some(endpoint_name), Some(model_name)) if problems.is_empty() => {
                Ok(Self {
                    endpoint_id,
                    endpoint_name,
                    model_name,
                    model_version,
                    gpu_topology,
                    gpu_per_replica,
                    min_replica_num,
                    max_replica_num,
                })
            }
            _ => Err(ConfigurationError::InvalidRequest { problems }),
        }
    }

    pub fn total_gpus(&self) -> u32 {
        self.gpu_topology.values().sum()
    }
}

fn required_str(v: Option<&Value>, field: &str, problems: &mut Vec<String>) -> Option<String> {
    match v {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::String(_)) => {
            problems.push(format!("{field} is empty"));
            None
        }
        None | Some(Value::Null) => {
            problems.push(format!("{field} is missing"));
            None
        }
        Some(other) => {
            problems.push(format!("{field} must be a string, got {other}"));
            None
        }
    }
}

fn optional_u32(v: Option<&Value>, field: &str, problems: &mut Vec<String>) -> Option<u32> {
    match v {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_u64().and_then(|n| u32::try_from(n).ok()) {
            Some(n) => Some(n),
            None => {
                problems.push(format!("{field} must be a non-negative integer, got {v}"));
                None
            }
        },
    }
}

/// Writes the diff and the GPU quota into an outbound payload.
pub fn attach_replica_diff(payload: &mut Value, diff: &ReplicaDiff, gpu_per_replica: u32) {
    if let Value::Object(map) = payload {
        map.insert(
            REPLICA_DIFF_KEY.to_string(),
            serde_json::to_value(diff).unwrap_or(Value::Null),
        );
        map.insert(GPUS_PER_REPLICA_KEY.to_string(), Value::from(gpu_per_replica));
    }
}

/// Lifecycle of a deployment as seen by the master.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeploymentStatus {
    Reconciling { pending_ops: u32 },
    Converged,
    Rejected { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "end_point_id": 1234,
            "end_point_name": "ep",
            "model_config": {"model_name": "llama", "instance_scale_max": 3},
            "parameters": {"gpu_per_replica": 2},
            "gpu_topology": {"devA": 2, "devB": 4}
        })
    }

    #[test]
    fn test_parse_full_request() {
        let cfg = DeploymentConfig::from_payload(&sample()).unwrap();
        assert_eq!(cfg.endpoint_id.as_str(), "1234");
        assert_eq!(cfg.gpu_per_replica, 2);
        assert_eq!(cfg.min_replica_num, 0);
        assert_eq!(cfg.max_replica_num, 3);
        assert_eq!(cfg.total_gpus(), 6);
    }

    #[test]
    fn test_defaults() {
        let mut v = sample();
        v["parameters"] = json!({});
        v["model_config"] = json!({"model_name": "llama"});
        let cfg = DeploymentConfig::from_payload(&v).unwrap();
        assert_eq!(cfg.gpu_per_replica, 1);
        assert_eq!(cfg.max_replica_num, 6);
    }

    #[test]
    fn test_reports_every_problem() {
        let v = json!({"parameters": {"gpu_per_replica": "two"}});
        let err = DeploymentConfig::from_payload(&v).unwrap_err();
        let ConfigurationError::InvalidRequest { problems } = err else {
            panic!("expected InvalidRequest");
        };
        assert!(problems.iter().any(|p| p.contains("end_point_id")));
        assert!(problems.iter().any(|p| p.contains("end_point_name")));
        assert!(problems.iter().any(|p| p.contains("model_config.model_name")));
        assert!(problems.iter().any(|p| p.contains("gpu_topology")));
        assert!(problems.iter().any(|p| p.contains("gpu_per_replica")));
    }

    #[test]
    fn test_attach_keeps_unrelated_fields() {
        let mut v = sample();
        let mut diff = ReplicaDiff::new();
        diff.insert(
            DeviceId::from("devA"),
            crate::placement::DiffEntry::Add { curr: 0, target: 1 },
        );
        attach_replica_diff(&mut v, &diff, 2);
        assert_eq!(v["gpus_per_replica"], json!(2));
        assert_eq!(v["replica_num_diff"]["devA"], json!({"op": "add", "curr_num": 0, "target_num": 1}));
        assert_eq!(v["end_point_name"], json!("ep"));
    }
}
