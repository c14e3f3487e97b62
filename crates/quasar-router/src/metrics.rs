use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{header::CONTENT_TYPE, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;

use quasar_common::{DeviceId, EndpointId};

use crate::error::RouteError;
use crate::state::AppState;

/// Labels of one replica's inference series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InferenceKey {
    pub endpoint_id: EndpointId,
    pub model_name: String,
    pub model_version: String,
    pub device_id: DeviceId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InferenceStats {
    pub calls: u64,
    pub failures: u64,
    pub latency_ms_sum: u64,
    pub last_latency_ms: u64,
}

impl InferenceStats {
    /// Requests per second implied by the most recent call.
    pub fn throughput(&self) -> f64 {
        throughput(self.last_latency_ms)
    }
}

pub fn throughput(latency_ms: u64) -> f64 {
    1000.0 / latency_ms.max(1) as f64
}

#[derive(Debug, Default)]
pub struct RouterMetrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
    /// Calls that reached the inference pipeline.
    pub predictions_total: AtomicU64,
    pub bad_request_total: AtomicU64,
    pub not_found_total: AtomicU64,
    pub unauthorized_total: AtomicU64,
    pub inactive_total: AtomicU64,
    pub no_idle_replica_total: AtomicU64,
    pub unreachable_total: AtomicU64,
    pub transport_errors_total: AtomicU64,
    pub store_errors_total: AtomicU64,
    pub stream_errors_total: AtomicU64,
    tiers: DashMap<&'static str, u64>,
    inference: DashMap<InferenceKey, InferenceStats>,
}

impl RouterMetrics {
    /// Counts one pipeline outcome. Callers see a 200 with an error body for
    /// most rejections, so status counters alone do not show them.
    pub fn record_outcome(&self, error: Option<&RouteError>) {
        self.predictions_total.fetch_add(1, Ordering::Relaxed);
        let Some(error) = error else {
            return;
        };
        let counter = match error {
            RouteError::BadRequest(_) => &self.bad_request_total,
            RouteError::NotFound(_) => &self.not_found_total,
            RouteError::Unauthorized => &self.unauthorized_total,
            RouteError::Inactive => &self.inactive_total,
            RouteError::NoIdleReplica => &self.no_idle_replica_total,
            RouteError::Transport { .. } => &self.transport_errors_total,
            RouteError::Unreachable { .. } => &self.unreachable_total,
            RouteError::Store(_) => &self.store_errors_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Buckets one HTTP response. Informational and redirect statuses are
    /// only counted in the total.
    pub fn record_http_status(&self, status: StatusCode) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        let bucket = if status.is_server_error() {
            &self.status_5xx
        } else if status.is_client_error() {
            &self.status_4xx
        } else if status.is_success() {
            &self.status_2xx
        } else {
            return;
        };
        bucket.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tier(&self, tier: &'static str) {
        *self.tiers.entry(tier).or_insert(0) += 1;
    }

    pub fn tier_count(&self, tier: &str) -> u64 {
        self.tiers.get(tier).map(|v| *v).unwrap_or(0)
    }

    pub fn observe_inference(&self, key: InferenceKey, latency: Duration, success: bool) {
        let latency_ms = latency.as_millis() as u64;
        let mut stats = self.inference.entry(key).or_default();
        stats.calls += 1;
        if !success {
            stats.failures += 1;
        }
        stats.latency_ms_sum += latency_ms;
        stats.last_latency_ms = latency_ms;
    }

    pub fn inference_stats(&self, key: &InferenceKey) -> Option<InferenceStats> {
        self.inference.get(key).map(|s| *s)
    }

    pub fn render(&self) -> String {
        let counters: [(&str, &str, &str, &AtomicU64); 15] = [
            ("quasar_router_requests_total", "counter", "Total requests handled by the router.", &self.requests_total),
            ("quasar_router_requests_inflight", "gauge", "Currently in-flight requests.", &self.requests_inflight),
            ("quasar_router_responses_2xx", "counter", "Total 2xx responses.", &self.status_2xx),
            ("quasar_router_responses_4xx", "counter", "Total 4xx responses.", &self.status_4xx),
            ("quasar_router_responses_5xx", "counter", "Total 5xx responses.", &self.status_5xx),
            ("quasar_router_predictions_total", "counter", "Inference calls that entered the pipeline.", &self.predictions_total),
            ("quasar_router_bad_request_total", "counter", "Inference calls with an unusable body.", &self.bad_request_total),
            ("quasar_router_endpoint_not_found_total", "counter", "Inference calls for unknown endpoints.", &self.not_found_total),
            ("quasar_router_unauthorized_total", "counter", "Inference calls with a missing or wrong token.", &self.unauthorized_total),
            ("quasar_router_inactive_total", "counter", "Inference calls for deactivated endpoints.", &self.inactive_total),
            ("quasar_router_no_idle_replica_total", "counter", "Inference calls with no ready replica.", &self.no_idle_replica_total),
            ("quasar_router_unreachable_total", "counter", "Inference calls where no transport was ready.", &self.unreachable_total),
            ("quasar_router_transport_errors_total", "counter", "Inference calls whose ready transport failed.", &self.transport_errors_total),
            ("quasar_router_store_errors_total", "counter", "Inference calls aborted by state store errors.", &self.store_errors_total),
            ("quasar_router_stream_errors_total", "counter", "Streamed replies cut short by the replica.", &self.stream_errors_total),
        ];

        let mut out = String::new();
        for (name, kind, help, value) in counters {
            let _ = write!(
                out,
                "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {}\n",
                value.load(Ordering::Relaxed)
            );
        }

        let mut tiers: Vec<(&'static str, u64)> =
            self.tiers.iter().map(|e| (*e.key(), *e.value())).collect();
        tiers.sort();
        out.push_str("# HELP quasar_router_dispatch_total Inference calls carried per transport tier.\n# TYPE quasar_router_dispatch_total counter\n");
        for (tier, count) in tiers {
            let _ = writeln!(out, "quasar_router_dispatch_total{{tier=\"{tier}\"}} {count}");
        }

        let mut series: Vec<(InferenceKey, InferenceStats)> = self
            .inference
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        series.sort_by(|a, b| a.0.cmp(&b.0));
        out.push_str("# HELP quasar_router_inference_calls_total Inference calls per replica.\n# TYPE quasar_router_inference_calls_total counter\n");
        for (key, stats) in &series {
            let _ = writeln!(out, "quasar_router_inference_calls_total{{{}}} {}", labels(key), stats.calls);
        }
        out.push_str("# HELP quasar_router_inference_failures_total Failed inference calls per replica.\n# TYPE quasar_router_inference_failures_total counter\n");
        for (key, stats) in &series {
            let _ = writeln!(out, "quasar_router_inference_failures_total{{{}}} {}", labels(key), stats.failures);
        }
        out.push_str("# HELP quasar_router_inference_latency_ms_sum Summed inference latency per replica.\n# TYPE quasar_router_inference_latency_ms_sum counter\n");
        for (key, stats) in &series {
            let _ = writeln!(out, "quasar_router_inference_latency_ms_sum{{{}}} {}", labels(key), stats.latency_ms_sum);
        }
        out.push_str("# HELP quasar_router_inference_throughput Requests per second implied by the last call.\n# TYPE quasar_router_inference_throughput gauge\n");
        for (key, stats) in &series {
            let _ = writeln!(out, "quasar_router_inference_throughput{{{}}} {:.3}", labels(key), stats.throughput());
        }
        out
    }
}

fn labels(key: &InferenceKey) -> String {
    format!(
        "endpoint_id=\"{}\",model=\"{}\",version=\"{}\",device=\"{}\"",
        escape(key.endpoint_id.as_str()),
        escape(&key.model_name),
        escape(&key.model_version),
        escape(key.device_id.as_str()),
    )
}

fn escape(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        st.metrics.render(),
    )
}

/// Counts gateway responses. A streamed reply is counted once its headers
/// are sent, not when the stream ends.
pub async fn track_requests(State(st): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let metrics = &st.metrics;
    metrics.requests_inflight.fetch_add(1, Ordering::Relaxed);
    let resp = next.run(req).await;
    metrics.requests_inflight.fetch_sub(1, Ordering::Relaxed);
    metrics.record_http_status(resp.status());
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> InferenceKey {
        InferenceKey {
            endpoint_id: "7".into(),
            model_name: "m".into(),
            model_version: "v1".into(),
            device_id: "devA".into(),
        }
    }

    #[test]
    fn test_observe_accumulates_per_replica() {
        let m = RouterMetrics::default();
        m.observe_inference(key(), Duration::from_millis(200), true);
        m.observe_inference(key(), Duration::from_millis(100), false);

        let stats = m.inference_stats(&key()).unwrap();
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.latency_ms_sum, 300);
        assert_eq!(stats.throughput(), 10.0);
    }

    #[test]
    fn test_http_status_buckets() {
        let m = RouterMetrics::default();
        for status in [StatusCode::OK, StatusCode::NOT_FOUND, StatusCode::BAD_GATEWAY, StatusCode::SWITCHING_PROTOCOLS] {
            m.record_http_status(status);
        }
        assert_eq!(m.requests_total.load(Ordering::Relaxed), 4);
        assert_eq!(m.status_2xx.load(Ordering::Relaxed), 1);
        assert_eq!(m.status_4xx.load(Ordering::Relaxed), 1);
        assert_eq!(m.status_5xx.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_render_includes_labelled_series() {
        let m = RouterMetrics::default();
        m.observe_inference(key(), Duration::from_millis(50), true);
        m.record_tier("http_proxy");
        m.record_outcome(Some(&RouteError::Unauthorized));

        let body = m.render();
        assert!(body.contains("quasar_router_unauthorized_total 1\n"));
        assert!(body.contains("quasar_router_predictions_total 1\n"));
        assert!(body.contains("quasar_router_dispatch_total{tier=\"http_proxy\"} 1\n"));
        assert!(body.contains(
            "quasar_router_inference_calls_total{endpoint_id=\"7\",model=\"m\",version=\"v1\",device=\"devA\"} 1\n"
        ));
    }
}
