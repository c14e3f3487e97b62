mod args;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{routing::get, Router};
use clap::Parser;
use tracing::{error, info};

use quasar_meta::{EtcdKvStore, MetaStateStore};
use quasar_scheduler::metrics::{healthz_handler, metrics_handler, SchedulerMetrics};
use quasar_scheduler::{reconcile, Reconciler};

use crate::args::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let otel_provider = quasar_common::telemetry::init_tracing(
        "quasar-scheduler",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
        args.log_format,
    );

    let kv = EtcdKvStore::connect(std::slice::from_ref(&args.etcd_endpoint), &args.etcd_namespace)
        .await?;
    info!(etcd=%args.etcd_endpoint, namespace=%args.etcd_namespace, "connected to etcd");

    let state = Arc::new(MetaStateStore::new(Arc::new(kv)));
    let metrics = Arc::new(SchedulerMetrics::default());
    let reconciler = Reconciler::new(args.master_id.clone().into(), state, metrics.clone());

    let interval = Duration::from_secs(args.reconcile_interval_secs.max(1));
    tokio::spawn(async move {
        if let Err(e) = reconcile::run(reconciler, interval).await {
            error!(error=%e, "reconcile loop exited");
        }
    });

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    info!(addr=%args.listen_addr, master_id=%args.master_id, "quasar-scheduler listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Some(provider) = otel_provider {
        let _ = provider.shutdown();
    }
    Ok(())
}
