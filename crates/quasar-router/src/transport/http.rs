use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::Url;

use crate::error::TransportError;
use crate::request::EVENT_STREAM;

use super::{read_http_reply, DispatchPayload, DispatchTarget, InferenceReply, Transport};

/// Calls the replica's serving URL directly.
pub struct DirectHttpTransport {
    http: reqwest::Client,
}

impl DirectHttpTransport {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

/// `/ready` on the same host and port as the serving URL.
pub fn ready_url(inference_url: &str) -> Result<Url, TransportError> {
    let mut url =
        Url::parse(inference_url).map_err(|_| TransportError::InvalidUrl(inference_url.into()))?;
    url.set_path("/ready");
    url.set_query(None);
    Ok(url)
}

#[async_trait]
impl Transport for DirectHttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn is_ready(&self, target: &DispatchTarget, timeout: Duration) -> bool {
        let Ok(url) = ready_url(&target.inference_url) else {
            return false;
        };
        match self.http.get(url).timeout(timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(error=%e, device_id=%target.device_id, "direct readiness probe failed");
                false
            }
        }
    }

    async fn dispatch(
        &self,
        target: &DispatchTarget,
        payload: &DispatchPayload,
    ) -> Result<InferenceReply, TransportError> {
        let mut req = self.http.post(&target.inference_url).json(&payload.inputs);
        if payload.stream {
            req = req.header(ACCEPT, EVENT_STREAM);
        }
        read_http_reply(req.send().await?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::payload;
    use axum::{
        http::header::CONTENT_TYPE,
        response::IntoResponse,
        routing::{get, post},
        Json, Router,
    };
    use futures_util::StreamExt;
    use serde_json::{json, Value};

    async fn serve(app: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        port
    }

    fn target_on(port: u16) -> DispatchTarget {
        DispatchTarget {
            endpoint_id: "7".into(),
            device_id: "devA".into(),
            inference_url: format!("http://127.0.0.1:{port}/predict"),
            has_public_ip: true,
        }
    }

    fn replica_app() -> Router {
        Router::new()
            .route("/ready", get(|| async { "ok" }))
            .route(
                "/predict",
                post(|Json(body): Json<Value>| async move {
                    if body["stream"] == true {
                        ([(CONTENT_TYPE, "text/event-stream")], "data: a\n\ndata: b\n\n")
                            .into_response()
                    } else {
                        Json(json!({"echo": body})).into_response()
                    }
                }),
            )
    }

    #[test]
    fn test_ready_url_keeps_host_and_port() {
        let url = ready_url("http://10.0.0.1:9001/predict?x=1").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.1:9001/ready");
        assert!(ready_url("not a url").is_err());
    }

    #[tokio::test]
    async fn test_probe_and_json_dispatch() {
        let port = serve(replica_app()).await;
        let transport = DirectHttpTransport::new(reqwest::Client::new());
        let target = target_on(port);

        assert!(transport.is_ready(&target, Duration::from_secs(2)).await);
        let reply = transport.dispatch(&target, &payload()).await.unwrap();
        match reply {
            InferenceReply::Json(v) => assert_eq!(v["echo"]["text"], "hi"),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_event_stream_is_passed_through() {
        let port = serve(replica_app()).await;
        let transport = DirectHttpTransport::new(reqwest::Client::new());
        let mut p = payload();
        p.inputs["stream"] = json!(true);
        p.stream = true;

        let reply = transport.dispatch(&target_on(port), &p).await.unwrap();
        let InferenceReply::Stream { content_type, mut body } = reply else {
            panic!("expected a stream");
        };
        assert!(content_type.starts_with("text/event-stream"));
        let mut collected = Vec::new();
        while let Some(chunk) = body.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"data: a\n\ndata: b\n\n");
    }

    #[tokio::test]
    async fn test_closed_port_is_not_ready() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = DirectHttpTransport::new(reqwest::Client::new());
        assert!(!transport.is_ready(&target_on(port), Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_error_status_is_a_transport_error() {
        let app = Router::new().route(
            "/predict",
            post(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let port = serve(app).await;
        let transport = DirectHttpTransport::new(reqwest::Client::new());

        let err = transport.dispatch(&target_on(port), &payload()).await.unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 500, .. }));
    }
}
