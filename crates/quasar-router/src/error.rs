use serde_json::{json, Value};
use thiserror::Error;

use quasar_common::EndpointId;

/// Failure of one transport tier.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("replica answered with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("broker request failed: {0}")]
    Broker(String),
    #[error("invalid inference url {0}")]
    InvalidUrl(String),
    #[error("undecodable reply: {0}")]
    Decode(String),
}

/// Everything the inference pipeline reports back to a caller.
///
/// None of these are raised past the HTTP layer: each one is rendered as
/// `{"error": true, "message": ..., "error_code": ...}`.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("endpoint {0} is not registered")]
    NotFound(EndpointId),
    #[error("token is not valid")]
    Unauthorized,
    #[error("endpoint is not activated")]
    Inactive,
    #[error("no active inference worker for this endpoint")]
    NoIdleReplica,
    #[error("{tier} inference failed: {source}")]
    Transport {
        tier: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("no transport could reach the replica ({tried})")]
    Unreachable { tried: String },
    #[error("state store error: {0}")]
    Store(String),
}

impl RouteError {
    pub fn store(e: anyhow::Error) -> Self {
        RouteError::Store(format!("{e:#}"))
    }

    pub fn error_code(&self) -> u16 {
        match self {
            RouteError::BadRequest(_) => 400,
            RouteError::Unauthorized => 401,
            RouteError::Inactive => 403,
            RouteError::NotFound(_) | RouteError::NoIdleReplica => 404,
            RouteError::Transport { .. } | RouteError::Unreachable { .. } => 502,
            RouteError::Store(_) => 500,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "error": true,
            "message": self.to_string(),
            "error_code": self.error_code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_shape() {
        let body = RouteError::NoIdleReplica.to_json();
        assert_eq!(body["error"], true);
        assert_eq!(body["error_code"], 404);
        assert_eq!(body["message"], "no active inference worker for this endpoint");

        let body = RouteError::Unreachable {
            tried: "direct, proxy".into(),
        }
        .to_json();
        assert_eq!(body["error_code"], 502);
    }
}
