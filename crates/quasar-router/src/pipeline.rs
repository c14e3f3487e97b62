use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{info, info_span, warn, Instrument};

use quasar_common::{now_ms, EndpointIdentity, InferenceMetricSample, ReplicaRecord};
use quasar_meta::StateStore;

use crate::auth::authorize;
use crate::error::RouteError;
use crate::metrics::{throughput, InferenceKey, RouterMetrics};
use crate::request::InferenceRequest;
use crate::request_log::RequestLog;
use crate::transport::{DispatchPayload, DispatchTarget, InferenceReply, TransportChain};

/// The inference pipeline shared by every HTTP entry point.
///
/// Steps run in a fixed order and stop at the first rejection: identity
/// resolution, token check, activation check, idle replica lookup, then
/// dispatch through the transport chain.
pub struct InferenceRouter {
    store: Arc<dyn StateStore>,
    chain: TransportChain,
    metrics: Arc<RouterMetrics>,
    request_log: Option<RequestLog>,
}

impl InferenceRouter {
    pub fn new(
        store: Arc<dyn StateStore>,
        chain: TransportChain,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        Self {
            store,
            chain,
            metrics,
            request_log: None,
        }
    }

    pub fn with_request_log(mut self, log: RequestLog) -> Self {
        self.request_log = Some(log);
        self
    }

    pub fn metrics(&self) -> &Arc<RouterMetrics> {
        &self.metrics
    }

    pub async fn predict(&self, req: InferenceRequest) -> Result<InferenceReply, RouteError> {
        let span = info_span!(
            "inference",
            request_id = %format!("req_{}", uuid::Uuid::new_v4()),
            endpoint_id = %req.endpoint_id,
        );
        let result = self.route(&req).instrument(span).await;
        self.metrics.record_outcome(result.as_ref().err());

        if let Some(log) = &self.request_log {
            let logged = match &result {
                Ok(InferenceReply::Json(v)) => v.clone(),
                Ok(InferenceReply::Stream { content_type, .. }) => {
                    json!({"stream": true, "content_type": content_type})
                }
                Err(e) => e.to_json(),
            };
            log.append(&req.raw, &logged).await;
        }
        result
    }

    async fn route(&self, req: &InferenceRequest) -> Result<InferenceReply, RouteError> {
        let identity = self.resolve_identity(req).await?;

        authorize(
            self.store.as_ref(),
            &req.endpoint_id,
            &identity.end_point_name,
            &identity.model_name,
            req.token.as_deref(),
        )
        .await?;

        let active = self
            .store
            .get_endpoint_activation(&req.endpoint_id)
            .await
            .map_err(RouteError::store)?;
        if !active {
            return Err(RouteError::Inactive);
        }

        let record = self
            .store
            .get_idle_device(
                &req.endpoint_id,
                &identity.end_point_name,
                &identity.model_name,
                &req.model_version,
            )
            .await
            .map_err(RouteError::store)?
            .ok_or(RouteError::NoIdleReplica)?;

        let target = DispatchTarget::from(&record);
        let payload = DispatchPayload {
            inputs: req.inputs.clone(),
            outputs: req.outputs.clone(),
            inference_type: req.return_type.clone(),
            stream: req.wants_stream(),
        };

        let started = Instant::now();
        let dispatched = self.chain.dispatch(&target, &payload).await;
        let latency = started.elapsed();
        self.observe(&record, latency, dispatched.is_ok()).await;

        let dispatched = dispatched?;
        self.metrics.record_tier(dispatched.tier);
        info!(
            endpoint_id=%req.endpoint_id,
            device_id=%record.device_id,
            replica_no = record.replica_no,
            tier = dispatched.tier,
            latency_ms = latency.as_millis() as u64,
            "inference served"
        );
        Ok(dispatched.reply)
    }

    /// Fills in a missing endpoint or model name from the endpoint index.
    async fn resolve_identity(
        &self,
        req: &InferenceRequest,
    ) -> Result<EndpointIdentity, RouteError> {
        if let (Some(name), Some(model)) = (&req.endpoint_name, &req.model_name) {
            return Ok(EndpointIdentity {
                end_point_name: name.clone(),
                model_name: model.clone(),
            });
        }

        let registered = self
            .store
            .resolve_endpoint_by_id(&req.endpoint_id)
            .await
            .map_err(RouteError::store)?
            .ok_or_else(|| RouteError::NotFound(req.endpoint_id.clone()))?;
        if let Some(name) = &req.endpoint_name {
            if *name != registered.end_point_name {
                return Err(RouteError::NotFound(req.endpoint_id.clone()));
            }
        }
        Ok(EndpointIdentity {
            end_point_name: registered.end_point_name,
            model_name: req.model_name.clone().unwrap_or(registered.model_name),
        })
    }

    async fn observe(&self, record: &ReplicaRecord, latency: std::time::Duration, success: bool) {
        self.metrics.observe_inference(
            InferenceKey {
                endpoint_id: record.end_point_id.clone(),
                model_name: record.model_name.clone(),
                model_version: record.model_version.clone(),
                device_id: record.device_id.clone(),
            },
            latency,
            success,
        );

        let latency_ms = latency.as_millis() as u64;
        let sample = InferenceMetricSample {
            end_point_id: record.end_point_id.clone(),
            end_point_name: record.end_point_name.clone(),
            model_name: record.model_name.clone(),
            model_version: record.model_version.clone(),
            device_id: record.device_id.clone(),
            latency_ms,
            throughput: throughput(latency_ms),
            success,
            timestamp_ms: now_ms(),
        };
        if let Err(e) = self.store.record_inference_metric(&sample).await {
            warn!(
                endpoint_id=%record.end_point_id,
                device_id=%record.device_id,
                error=%e,
                "failed to record inference metric"
            );
        }
    }
}
