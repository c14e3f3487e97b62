use axum::http::{header, HeaderMap};
use serde_json::Value;

use quasar_common::EndpointId;
use quasar_meta::state::ANY_VERSION;

use crate::error::RouteError;

/// Accept value that asks for a streamed reply.
pub const EVENT_STREAM: &str = "text/event-stream";
/// Return type used when the caller sends no `Accept` header.
pub const DEFAULT_RETURN_TYPE: &str = "default";

/// One inference call after entry-point specific translation.
///
/// All three HTTP entry points build one of these and hand it to the same
/// pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub endpoint_id: EndpointId,
    pub endpoint_name: Option<String>,
    pub model_name: Option<String>,
    pub model_version: String,
    pub token: Option<String>,
    /// Raw `Accept` header, forwarded to the replica as the inference type.
    pub return_type: String,
    pub inputs: Value,
    pub outputs: Value,
    /// Body as received, kept for the request log.
    pub raw: Value,
}

impl InferenceRequest {
    /// `POST /api/v1/predict`: everything, including `end_point_id`, comes
    /// from the body.
    pub fn from_predict(body: Value, headers: &HeaderMap) -> Result<Self, RouteError> {
        let id = body
            .get("end_point_id")
            .filter(|v| !v.is_null())
            .ok_or_else(|| RouteError::BadRequest("end_point_id is required".into()))?;
        let endpoint_id = parse_endpoint_id(id)?;
        Self::build(endpoint_id, body, headers)
    }

    /// `POST /inference/:id/{chat/}completions`: `model` names the endpoint
    /// and the token travels as `Authorization: Bearer`.
    pub fn from_openai(
        endpoint_id: EndpointId,
        mut body: Value,
        headers: &HeaderMap,
    ) -> Result<Self, RouteError> {
        if let Some(obj) = body.as_object_mut() {
            let model = obj.get("model").cloned().unwrap_or(Value::Null);
            obj.insert("end_point_name".into(), model);
            if let Some(token) = bearer_token(headers) {
                obj.insert("token".into(), Value::String(token));
            }
        }
        Self::build(endpoint_id, body, headers)
    }

    /// `POST /inference/:id`.
    pub fn from_path(
        endpoint_id: EndpointId,
        body: Value,
        headers: &HeaderMap,
    ) -> Result<Self, RouteError> {
        Self::build(endpoint_id, body, headers)
    }

    fn build(endpoint_id: EndpointId, body: Value, headers: &HeaderMap) -> Result<Self, RouteError> {
        if !body.is_object() {
            return Err(RouteError::BadRequest("body must be a JSON object".into()));
        }

        let model_version = str_field(&body, "model_version")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| ANY_VERSION.to_string());
        let return_type = headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_RETURN_TYPE.to_string());

        let stream_flag = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let mut inputs = match body.get("inputs") {
            Some(v) if !v.is_null() => v.clone(),
            _ => body.clone(),
        };
        if let Some(obj) = inputs.as_object_mut() {
            obj.entry("stream").or_insert(Value::Bool(stream_flag));
        }
        let outputs = match body.get("outputs") {
            Some(v) if !v.is_null() => v.clone(),
            _ => Value::Array(Vec::new()),
        };

        Ok(Self {
            endpoint_id,
            endpoint_name: str_field(&body, "end_point_name"),
            model_name: str_field(&body, "model_name"),
            model_version,
            token: token_field(&body),
            return_type,
            inputs,
            outputs,
            raw: body,
        })
    }

    /// True when the caller wants a streamed reply, either through `Accept`
    /// or through the `stream` flag in the inputs.
    pub fn wants_stream(&self) -> bool {
        self.return_type.contains(EVENT_STREAM)
            || self
                .inputs
                .get("stream")
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }
}

pub fn parse_endpoint_id(v: &Value) -> Result<EndpointId, RouteError> {
    serde_json::from_value(v.clone())
        .map_err(|_| RouteError::BadRequest(format!("invalid end_point_id {v}")))
}

/// `Authorization: Bearer <token>`, falling back to `x-api-key`.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .or_else(|| {
            headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

fn str_field(body: &Value, key: &str) -> Option<String> {
    body.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Tokens are compared by their string form, so numeric tokens are accepted.
fn token_field(body: &Value) -> Option<String> {
    match body.get("token")? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
