use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;

use quasar_common::EndpointId;

use crate::error::RouteError;
use crate::metrics::{metrics_handler, track_requests, RouterMetrics};
use crate::request::InferenceRequest;
use crate::state::AppState;
use crate::transport::{InferenceReply, ReplyStream};

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/ready", get(ready))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/predict", post(predict))
        .route("/inference/:end_point_id", post(predict_by_endpoint))
        .route("/inference/:end_point_id/completions", post(openai_completions))
        .route("/inference/:end_point_id/chat/completions", post(openai_completions))
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .with_state(state)
}

pub async fn root() -> impl IntoResponse {
    Json(json!({"message": "Quasar inference gateway"}))
}

pub async fn ready() -> impl IntoResponse {
    Json(json!({"message": "Quasar inference gateway is ready"}))
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// POST /api/v1/predict
pub async fn predict(State(st): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let req = parse_body(&body).and_then(|b| InferenceRequest::from_predict(b, &headers));
    respond(&st, req, false).await
}

/// POST /inference/:id/completions and /inference/:id/chat/completions
pub async fn openai_completions(
    State(st): State<AppState>,
    Path(end_point_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req = parse_body(&body)
        .and_then(|b| InferenceRequest::from_openai(EndpointId::from(end_point_id), b, &headers));
    respond(&st, req, false).await
}

/// POST /inference/:id. Unlike the other entry points, a missing replica or
/// endpoint is also reflected in the HTTP status.
pub async fn predict_by_endpoint(
    State(st): State<AppState>,
    Path(end_point_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req = parse_body(&body)
        .and_then(|b| InferenceRequest::from_path(EndpointId::from(end_point_id), b, &headers));
    respond(&st, req, true).await
}

fn parse_body(body: &[u8]) -> Result<Value, RouteError> {
    serde_json::from_slice(body)
        .map_err(|e| RouteError::BadRequest(format!("body is not JSON: {e}")))
}

async fn respond(
    st: &AppState,
    req: Result<InferenceRequest, RouteError>,
    surface_not_found: bool,
) -> Response {
    let result = match req {
        Ok(req) => st.router.predict(req).await,
        Err(e) => {
            st.metrics.record_outcome(Some(&e));
            Err(e)
        }
    };

    match result {
        Ok(InferenceReply::Json(v)) => (StatusCode::OK, Json(v)).into_response(),
        Ok(InferenceReply::Stream { content_type, body }) => {
            stream_response(content_type, body, st.metrics.clone())
        }
        Err(e) => {
            let status = if surface_not_found && e.error_code() == 404 {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::OK
            };
            (status, Json(e.to_json())).into_response()
        }
    }
}

/// Forwards a replica's chunked reply without buffering it.
fn stream_response(
    content_type: String,
    mut upstream: ReplyStream,
    metrics: Arc<RouterMetrics>,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, Infallible>>(64);
    tokio::spawn(async move {
        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    metrics.stream_errors_total.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error=%e, "replica stream ended early");
                    break;
                }
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type)
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
