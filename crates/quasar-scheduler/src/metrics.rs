use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;

/// Counters for the master daemon, safe for concurrent access.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    /// Reconciliation passes run.
    pub passes_total: AtomicU64,
    pub pass_errors_total: AtomicU64,
    /// Deployment requests rejected as invalid.
    pub rejected_total: AtomicU64,
    /// Worker payloads published.
    pub worker_requests_total: AtomicU64,
    pub completions_total: AtomicU64,
    pub duplicate_completions_total: AtomicU64,
    pub converged_total: AtomicU64,
    /// Deployments currently tracked (gauge).
    pub deployments: AtomicU64,
}

impl SchedulerMetrics {
    pub fn render(&self) -> String {
        let counters: [(&str, &str, &str, &AtomicU64); 8] = [
            ("quasar_scheduler_passes_total", "counter", "Reconciliation passes run.", &self.passes_total),
            ("quasar_scheduler_pass_errors_total", "counter", "Reconciliation passes that failed.", &self.pass_errors_total),
            ("quasar_scheduler_rejected_total", "counter", "Deployment requests rejected as invalid.", &self.rejected_total),
            ("quasar_scheduler_worker_requests_total", "counter", "Worker payloads published.", &self.worker_requests_total),
            ("quasar_scheduler_completions_total", "counter", "Replica completions applied.", &self.completions_total),
            ("quasar_scheduler_duplicate_completions_total", "counter", "Replica completions ignored as duplicates.", &self.duplicate_completions_total),
            ("quasar_scheduler_converged_total", "counter", "Deployments that reached their target placement.", &self.converged_total),
            ("quasar_scheduler_deployments", "gauge", "Deployments currently tracked.", &self.deployments),
        ];

        let mut out = String::new();
        for (name, kind, help, value) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        out
    }
}

/// GET /metrics in Prometheus text format.
pub async fn metrics_handler(State(metrics): State<Arc<SchedulerMetrics>>) -> impl IntoResponse {
    (axum::http::StatusCode::OK, metrics.render())
}

/// GET /healthz
pub async fn healthz_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        let m = SchedulerMetrics::default();
        m.passes_total.fetch_add(3, Ordering::Relaxed);
        let body = m.render();
        assert!(body.contains("# TYPE quasar_scheduler_passes_total counter\nquasar_scheduler_passes_total 3\n"));
        assert!(body.contains("# TYPE quasar_scheduler_deployments gauge"));
    }
}
