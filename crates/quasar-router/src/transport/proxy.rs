use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::json;

use crate::error::TransportError;

use super::{read_http_reply, DispatchPayload, DispatchTarget, InferenceReply, Transport};

/// Default port of the inference proxy that runs next to every worker.
pub const DEFAULT_PROXY_PORT: u16 = 2204;

/// Reaches a replica through the inference proxy on its worker, for
/// replicas whose serving port is not reachable from the gateway.
pub struct ProxyHttpTransport {
    http: reqwest::Client,
    proxy_port: u16,
}

impl ProxyHttpTransport {
    pub fn new(http: reqwest::Client, proxy_port: u16) -> Self {
        Self { http, proxy_port }
    }

    /// Proxy base URL on the replica's host.
    pub fn proxy_url(&self, inference_url: &str, path: &str) -> Result<Url, TransportError> {
        let mut url = Url::parse(inference_url)
            .map_err(|_| TransportError::InvalidUrl(inference_url.into()))?;
        url.set_port(Some(self.proxy_port))
            .map_err(|_| TransportError::InvalidUrl(inference_url.into()))?;
        url.set_path(path);
        url.set_query(None);
        Ok(url)
    }
}

#[async_trait]
impl Transport for ProxyHttpTransport {
    fn name(&self) -> &'static str {
        "http_proxy"
    }

    async fn is_ready(&self, target: &DispatchTarget, timeout: Duration) -> bool {
        let Ok(url) = self.proxy_url(&target.inference_url, "/ready") else {
            return false;
        };
        matches!(
            self.http.get(url).timeout(timeout).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }

    async fn dispatch(
        &self,
        target: &DispatchTarget,
        payload: &DispatchPayload,
    ) -> Result<InferenceReply, TransportError> {
        let url = self.proxy_url(&target.inference_url, "/api/v1/customized_inference")?;
        let body = json!({
            "end_point_id": target.endpoint_id,
            "inference_url": target.inference_url,
            "inputs": payload.inputs,
            "outputs": payload.outputs,
            "inference_type": payload.inference_type,
        });
        read_http_reply(self.http.post(url).json(&body).send().await?).await
    }
}
