mod args;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::StreamExt;
use serde_json::Value;

use quasar_common::{DeviceId, ReconciliationError};
use quasar_meta::{keys, EtcdKvStore, MetaStateStore};
use quasar_node::executor::advertise_gpus;
use quasar_node::{ReplicaExecutor, ReplicaPlanner, ServingEndpoint};

use crate::args::Args;

async fn handle_payload(executor: &ReplicaExecutor, device: &DeviceId, key: &str, bytes: &[u8]) {
    let payload: Value = match serde_json::from_slice(bytes) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(%key, error=%e, "worker payload is not JSON");
            return;
        }
    };

    let planner = ReplicaPlanner::new(device.clone(), payload);
    match planner.plan() {
        Ok((op, count)) => tracing::info!(%key, %op, count, "planned replica operation"),
        Err(ReconciliationError::MissingDiff(_)) => {
            tracing::debug!(%key, "no work for this device");
            return;
        }
        Err(e) => {
            // retried when the master republishes on its next pass
            tracing::warn!(%key, error=%e, "cannot plan payload");
            return;
        }
    }

    if let Err(e) = executor.execute(&planner).await {
        tracing::warn!(%key, error=%e, "replica execution failed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _otel_provider = quasar_common::telemetry::init_tracing(
        "quasar-node",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
        args.log_format,
    );
    tracing::info!(device_id=%args.device_id, "quasar-node starting");

    let kv = EtcdKvStore::connect(std::slice::from_ref(&args.etcd_endpoint), &args.etcd_namespace)
        .await?;
    let state = Arc::new(MetaStateStore::new(Arc::new(kv)));
    let device = DeviceId::from(args.device_id.clone());

    let all_gpus: BTreeSet<u32> = args.gpu_ids.iter().copied().collect();
    let free = advertise_gpus(&state, &device, &all_gpus).await?;
    tracing::info!(total = all_gpus.len(), free = free.len(), "advertised GPU budget");

    let executor = ReplicaExecutor::new(
        state.clone(),
        ServingEndpoint {
            host: args.serving_host.clone(),
            base_port: args.serving_base_port,
            path: args.serving_path.clone(),
            has_public_ip: args.has_public_ip,
        },
    );

    let prefix = keys::worker_requests_prefix(&device);
    loop {
        let mut watch = match state.kv().watch_prefix(&prefix).await {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(error=%e, "failed to watch worker requests, will retry");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        // payloads published while this worker was down
        match state.kv().list_prefix(&prefix).await {
            Ok(entries) => {
                for entry in entries {
                    handle_payload(&executor, &device, &entry.key, &entry.value).await;
                }
            }
            Err(e) => tracing::warn!(error=%e, "failed to list worker requests"),
        }

        while let Some(ev) = watch.next().await {
            let Some(bytes) = ev.value else { continue };
            handle_payload(&executor, &device, &ev.key, &bytes).await;
        }

        tracing::warn!("watch stream ended, reconnecting");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
