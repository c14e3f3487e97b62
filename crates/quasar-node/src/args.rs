use clap::Parser;
use quasar_common::telemetry::LogFormat;

#[derive(Debug, Parser)]
pub struct Args {
    #[arg(long, env = "QUASAR_DEVICE_ID")]
    pub device_id: String,

    #[arg(long, env = "QUASAR_ETCD_ENDPOINT", default_value = "http://127.0.0.1:2379")]
    pub etcd_endpoint: String,

    #[arg(long, env = "QUASAR_ETCD_NAMESPACE", default_value = "/quasar")]
    pub etcd_namespace: String,

    /// GPU ids this worker contributes, e.g. `--gpu-ids 0,1,2,3`.
    #[arg(long, env = "QUASAR_GPU_IDS", value_delimiter = ',', required = true)]
    pub gpu_ids: Vec<u32>,

    /// Address replicas are reachable on from the gateway.
    #[arg(long, env = "QUASAR_SERVING_HOST", default_value = "127.0.0.1")]
    pub serving_host: String,

    /// Replica `n` serves on `serving_base_port + n`.
    #[arg(long, default_value_t = 10_000)]
    pub serving_base_port: u16,

    #[arg(long, default_value = "/predict")]
    pub serving_path: String,

    /// Set to false for workers behind NAT; the gateway then falls back to
    /// the broker.
    #[arg(long, env = "QUASAR_HAS_PUBLIC_IP", default_value_t = true, action = clap::ArgAction::Set)]
    pub has_public_ip: bool,

    #[arg(long, env = "QUASAR_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "QUASAR_OTLP_TOKEN")]
    pub otlp_token: Option<String>,

    #[arg(long, env = "QUASAR_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,
}
