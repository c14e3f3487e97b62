//! Key layout of the shared state.

use quasar_common::{DeviceId, EndpointId};

pub const DEPLOYMENTS_PREFIX: &str = "/deployments/";
pub const DEPLOYMENT_REQUESTS_PREFIX: &str = "/deployment_requests/";
pub const REPLICA_EVENTS_PREFIX: &str = "/replica_events/";
pub const WORKER_REQUESTS_PREFIX: &str = "/worker_requests/";

pub fn available_gpus(device: &DeviceId) -> String {
    format!("/gpus/{device}/available")
}

pub fn deployments_prefix(endpoint: &EndpointId, name: &str, model: &str) -> String {
    format!("{DEPLOYMENTS_PREFIX}{endpoint}/{name}/{model}/")
}

pub fn deployment_result(
    endpoint: &EndpointId,
    name: &str,
    model: &str,
    device: &DeviceId,
    replica_no: u32,
) -> String {
    format!("{DEPLOYMENTS_PREFIX}{endpoint}/{name}/{model}/{device}/{replica_no}")
}

pub fn endpoint_index(endpoint: &EndpointId) -> String {
    format!("/endpoint_index/{endpoint}")
}

pub fn activation(endpoint: &EndpointId) -> String {
    format!("/activation/{endpoint}")
}

pub fn token(endpoint: &EndpointId, name: &str, model: &str) -> String {
    format!("/tokens/{endpoint}/{name}/{model}")
}

pub fn inference_metric(endpoint: &EndpointId, device: &DeviceId) -> String {
    format!("/metrics/{endpoint}/{device}")
}

pub fn deployment_request(endpoint: &EndpointId) -> String {
    format!("{DEPLOYMENT_REQUESTS_PREFIX}{endpoint}")
}

pub fn worker_requests_prefix(device: &DeviceId) -> String {
    format!("{WORKER_REQUESTS_PREFIX}{device}/")
}

pub fn worker_request(device: &DeviceId, endpoint: &EndpointId) -> String {
    format!("{WORKER_REQUESTS_PREFIX}{device}/{endpoint}")
}

/// Device of a `/worker_requests/{device}/{endpoint}` key, if it addresses
/// `endpoint`.
pub fn worker_request_device(key: &str, endpoint: &EndpointId) -> Option<DeviceId> {
    let (device, ep) = key.strip_prefix(WORKER_REQUESTS_PREFIX)?.split_once('/')?;
    (ep == endpoint.as_str()).then(|| DeviceId::from(device))
}

pub fn replica_events_prefix(endpoint: &EndpointId) -> String {
    format!("{REPLICA_EVENTS_PREFIX}{endpoint}/")
}

pub fn replica_event(endpoint: &EndpointId, op_id: &str) -> String {
    format!("{REPLICA_EVENTS_PREFIX}{endpoint}/{op_id}")
}

pub fn deployment_status(endpoint: &EndpointId) -> String {
    format!("/deployment_status/{endpoint}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_request_device_matches_endpoint_only() {
        let ep: EndpointId = "5".into();
        let key = worker_request(&"devA".into(), &ep);
        assert_eq!(worker_request_device(&key, &ep), Some("devA".into()));
        assert_eq!(worker_request_device(&key, &"50".into()), None);
        assert_eq!(worker_request_device("/worker_requests/devA/55", &ep), None);
        assert_eq!(worker_request_device("/deployment_status/5", &ep), None);
    }
}
