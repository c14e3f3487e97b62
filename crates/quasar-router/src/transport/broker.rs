use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};

use quasar_common::DeviceId;

use crate::error::TransportError;

use super::{DispatchPayload, DispatchTarget, InferenceReply, Transport};

pub const DEFAULT_SUBJECT_PREFIX: &str = "quasar.inference";

/// Request/reply over NATS to the agent on the replica's worker.
///
/// Only used for workers without a public address: the agent keeps an
/// outbound broker connection, so nothing has to be reachable from the
/// gateway.
pub struct BrokerTransport {
    client: async_nats::Client,
    subject_prefix: String,
    request_timeout: Duration,
}

impl BrokerTransport {
    pub fn new(client: async_nats::Client, subject_prefix: impl Into<String>) -> Self {
        Self {
            client,
            subject_prefix: subject_prefix.into(),
            request_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn request(
        &self,
        subject: String,
        body: &Value,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        let payload = Bytes::from(
            serde_json::to_vec(body).map_err(|e| TransportError::Decode(e.to_string()))?,
        );
        match tokio::time::timeout(timeout, self.client.request(subject.clone(), payload)).await {
            Ok(Ok(msg)) => Ok(msg.payload),
            Ok(Err(e)) => Err(TransportError::Broker(format!("{subject}: {e}"))),
            Err(_) => Err(TransportError::Broker(format!("{subject}: timed out"))),
        }
    }
}

/// Subject tokens cannot contain `.`, whitespace or wildcards.
fn subject_token(device: &DeviceId) -> String {
    device
        .as_str()
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

pub fn health_subject(prefix: &str, device: &DeviceId) -> String {
    format!("{prefix}.{}.health", subject_token(device))
}

pub fn predict_subject(prefix: &str, device: &DeviceId) -> String {
    format!("{prefix}.{}.predict", subject_token(device))
}

#[async_trait]
impl Transport for BrokerTransport {
    fn name(&self) -> &'static str {
        "broker"
    }

    fn applies(&self, target: &DispatchTarget) -> bool {
        !target.has_public_ip
    }

    async fn is_ready(&self, target: &DispatchTarget, timeout: Duration) -> bool {
        let body = json!({
            "end_point_id": target.endpoint_id,
            "inference_url": target.inference_url,
        });
        let subject = health_subject(&self.subject_prefix, &target.device_id);
        match self.request(subject, &body, timeout).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error=%e, device_id=%target.device_id, "broker health check failed");
                false
            }
        }
    }

    async fn dispatch(
        &self,
        target: &DispatchTarget,
        payload: &DispatchPayload,
    ) -> Result<InferenceReply, TransportError> {
        let body = json!({
            "end_point_id": target.endpoint_id,
            "inference_url": target.inference_url,
            "inputs": payload.inputs,
            "outputs": payload.outputs,
            "inference_type": payload.inference_type,
        });
        let subject = predict_subject(&self.subject_prefix, &target.device_id);
        let reply = self.request(subject, &body, self.request_timeout).await?;
        serde_json::from_slice(&reply)
            .map(InferenceReply::Json)
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subjects_are_scoped_per_device() {
        assert_eq!(
            health_subject(DEFAULT_SUBJECT_PREFIX, &"devA".into()),
            "quasar.inference.devA.health"
        );
        assert_eq!(
            predict_subject("q", &"10.0.0.1 gpu*".into()),
            "q.10_0_0_1_gpu_.predict"
        );
    }
}
