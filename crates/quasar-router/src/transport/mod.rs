use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use quasar_common::{DeviceId, EndpointId, ReplicaRecord};

use crate::error::{RouteError, TransportError};

pub mod broker;
pub mod http;
pub mod proxy;

pub use broker::BrokerTransport;
pub use http::DirectHttpTransport;
pub use proxy::ProxyHttpTransport;

/// Default readiness timeout for the direct and proxied HTTP tiers.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(20);

pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// What a replica answered.
pub enum InferenceReply {
    Json(Value),
    /// Chunked reply forwarded to the caller as it arrives.
    Stream {
        content_type: String,
        body: ReplyStream,
    },
}

impl InferenceReply {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            InferenceReply::Json(v) => Some(v),
            InferenceReply::Stream { .. } => None,
        }
    }
}

impl fmt::Debug for InferenceReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferenceReply::Json(v) => f.debug_tuple("Json").field(v).finish(),
            InferenceReply::Stream { content_type, .. } => f
                .debug_struct("Stream")
                .field("content_type", content_type)
                .finish_non_exhaustive(),
        }
    }
}

/// The replica a call is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTarget {
    pub endpoint_id: EndpointId,
    pub device_id: DeviceId,
    pub inference_url: String,
    pub has_public_ip: bool,
}

impl From<&ReplicaRecord> for DispatchTarget {
    fn from(record: &ReplicaRecord) -> Self {
        Self {
            endpoint_id: record.end_point_id.clone(),
            device_id: record.device_id.clone(),
            inference_url: record.serving_url.clone(),
            has_public_ip: record.has_public_ip,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPayload {
    pub inputs: Value,
    pub outputs: Value,
    /// Caller's `Accept` value.
    pub inference_type: String,
    pub stream: bool,
}

/// One way of reaching a replica.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this tier may be used for `target` at all.
    fn applies(&self, _target: &DispatchTarget) -> bool {
        true
    }

    /// Readiness probe. Must give up after `timeout`.
    async fn is_ready(&self, target: &DispatchTarget, timeout: Duration) -> bool;

    async fn dispatch(
        &self,
        target: &DispatchTarget,
        payload: &DispatchPayload,
    ) -> Result<InferenceReply, TransportError>;
}

struct Tier {
    transport: Arc<dyn Transport>,
    ready_timeout: Duration,
}

/// Successful dispatch and the tier that carried it.
#[derive(Debug)]
pub struct Dispatched {
    pub tier: &'static str,
    pub reply: InferenceReply,
}

/// Ordered fallback over transport tiers.
///
/// Tiers are probed in insertion order. The first ready tier carries the
/// call and its outcome is final: a failed dispatch is not retried on a
/// later tier.
#[derive(Default)]
pub struct TransportChain {
    tiers: Vec<Tier>,
}

impl TransportChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tier(mut self, transport: Arc<dyn Transport>, ready_timeout: Duration) -> Self {
        self.tiers.push(Tier {
            transport,
            ready_timeout,
        });
        self
    }

    pub fn tier_names(&self) -> Vec<&'static str> {
        self.tiers.iter().map(|t| t.transport.name()).collect()
    }

    pub async fn dispatch(
        &self,
        target: &DispatchTarget,
        payload: &DispatchPayload,
    ) -> Result<Dispatched, RouteError> {
        let mut tried = Vec::new();
        for tier in &self.tiers {
            let transport = &tier.transport;
            if !transport.applies(target) {
                continue;
            }
            tried.push(transport.name());

            let ready = tokio::time::timeout(
                tier.ready_timeout,
                transport.is_ready(target, tier.ready_timeout),
            )
            .await
            .unwrap_or(false);
            if !ready {
                debug!(
                    tier = transport.name(),
                    device_id=%target.device_id,
                    url=%target.inference_url,
                    "transport not ready, falling through"
                );
                continue;
            }

            return match transport.dispatch(target, payload).await {
                Ok(reply) => {
                    info!(tier = transport.name(), device_id=%target.device_id, "inference dispatched");
                    Ok(Dispatched {
                        tier: transport.name(),
                        reply,
                    })
                }
                Err(source) => {
                    warn!(tier = transport.name(), device_id=%target.device_id, error=%source, "inference dispatch failed");
                    Err(RouteError::Transport {
                        tier: transport.name(),
                        source,
                    })
                }
            };
        }

        let tried = if tried.is_empty() {
            "none configured".to_string()
        } else {
            tried.join(", ")
        };
        Err(RouteError::Unreachable { tried })
    }
}

/// Turns an HTTP reply into an [`InferenceReply`]; event streams are passed
/// through unbuffered.
pub(crate) async fn read_http_reply(resp: reqwest::Response) -> Result<InferenceReply, TransportError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(TransportError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if content_type.contains(crate::request::EVENT_STREAM) {
        let body = resp.bytes_stream().map(|chunk| chunk.map_err(TransportError::from));
        return Ok(InferenceReply::Stream {
            content_type,
            body: Box::pin(body),
        });
    }

    let bytes = resp.bytes().await?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(v) => Ok(InferenceReply::Json(v)),
        Err(_) => Ok(InferenceReply::Json(Value::String(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))),
    }
}
