use clap::Parser;
use quasar_common::telemetry::LogFormat;

#[derive(Debug, Parser)]
pub struct Args {
    #[arg(long, env = "QUASAR_ETCD_ENDPOINT", default_value = "http://127.0.0.1:2379")]
    pub etcd_endpoint: String,

    /// Key prefix shared by every component of one cluster.
    #[arg(long, env = "QUASAR_ETCD_NAMESPACE", default_value = "/quasar")]
    pub etcd_namespace: String,

    /// Device id of the master.
    #[arg(long, env = "QUASAR_MASTER_ID", default_value = "master")]
    pub master_id: String,

    #[arg(long, default_value = "0.0.0.0:18090")]
    pub listen_addr: String,

    #[arg(long, env = "QUASAR_RECONCILE_INTERVAL_SECS", default_value_t = 30)]
    pub reconcile_interval_secs: u64,

    /// OTLP/HTTP base URL for span export.
    #[arg(long, env = "QUASAR_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "QUASAR_OTLP_TOKEN")]
    pub otlp_token: Option<String>,

    #[arg(long, env = "QUASAR_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,
}
