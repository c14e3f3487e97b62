mod args;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use quasar_meta::{EtcdKvStore, MetaStateStore};
use quasar_router::request_log::env_flag_enabled;
use quasar_router::transport::{BrokerTransport, DirectHttpTransport, ProxyHttpTransport};
use quasar_router::{AppState, InferenceRouter, RequestLog, RouterMetrics, TransportChain};

use crate::args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let otel_provider = quasar_common::telemetry::init_tracing(
        "quasar-router",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
        args.log_format,
    );

    let kv = EtcdKvStore::connect(std::slice::from_ref(&args.etcd_endpoint), &args.etcd_namespace)
        .await?;
    info!(etcd=%args.etcd_endpoint, namespace=%args.etcd_namespace, "connected to etcd");
    let store = Arc::new(MetaStateStore::new(Arc::new(kv)));

    let request_timeout = Duration::from_secs(args.request_timeout_secs.max(1));
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .timeout(request_timeout)
        .build()?;

    let mut chain = TransportChain::new();
    if args.http_available {
        chain = chain.with_tier(
            Arc::new(DirectHttpTransport::new(http.clone())),
            Duration::from_secs(args.http_ready_timeout_secs),
        );
    } else {
        info!("direct HTTP inference disabled");
    }
    chain = chain.with_tier(
        Arc::new(ProxyHttpTransport::new(http, args.proxy_port)),
        Duration::from_secs(args.proxy_ready_timeout_secs),
    );
    match args.nats_url.as_deref() {
        Some(url) => match async_nats::connect(url).await {
            Ok(client) => {
                let broker = BrokerTransport::new(client, args.nats_subject_prefix.clone())
                    .with_request_timeout(request_timeout);
                chain = chain.with_tier(
                    Arc::new(broker),
                    Duration::from_secs(args.broker_ready_timeout_secs),
                );
            }
            Err(e) => {
                warn!(error=%e, %url, "failed to connect to NATS, broker inference disabled")
            }
        },
        None => warn!("nats_url not set, broker inference disabled"),
    }
    info!(tiers=?chain.tier_names(), "transport chain ready");

    let mut router = InferenceRouter::new(store, chain, Arc::new(RouterMetrics::default()));
    if env_flag_enabled(args.enable_inference_log.as_deref()) {
        let log = RequestLog::in_dir(&args.log_dir);
        info!(path=%log.path().display(), "inference request log enabled");
        router = router.with_request_log(log);
    }

    let app = quasar_router::app(AppState::new(router));
    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    info!(addr=%args.listen_addr, "quasar-router listening");
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
