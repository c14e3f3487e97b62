use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use quasar_common::telemetry::LogFormat;
use quasar_router::transport::broker::DEFAULT_SUBJECT_PREFIX;
use quasar_router::transport::proxy::DEFAULT_PROXY_PORT;

#[derive(Debug, Parser)]
pub struct Args {
    #[arg(long, env = "QUASAR_GATEWAY_LISTEN_ADDR", default_value = "0.0.0.0:2203")]
    pub listen_addr: String,

    #[arg(long, env = "QUASAR_ETCD_ENDPOINT", default_value = "http://127.0.0.1:2379")]
    pub etcd_endpoint: String,

    #[arg(long, env = "QUASAR_ETCD_NAMESPACE", default_value = "/quasar")]
    pub etcd_namespace: String,

    /// Try the replica's serving URL before the proxy.
    #[arg(
        long,
        env = "QUASAR_INFERENCE_HTTP_AVAILABLE",
        default_value_t = true,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub http_available: bool,

    /// Readiness timeout of the direct HTTP tier, in seconds.
    #[arg(long, env = "QUASAR_GATEWAY_HTTP_READY_TIMEOUT", default_value_t = 20)]
    pub http_ready_timeout_secs: u64,

    /// Readiness timeout of the proxied HTTP tier, in seconds.
    #[arg(long, env = "QUASAR_GATEWAY_HTTP_PROXY_READY_TIMEOUT", default_value_t = 20)]
    pub proxy_ready_timeout_secs: u64,

    /// Broker readiness timeout, in seconds.
    #[arg(long, env = "QUASAR_GATEWAY_BROKER_READY_TIMEOUT", default_value_t = 10)]
    pub broker_ready_timeout_secs: u64,

    #[arg(long, env = "QUASAR_INFERENCE_PROXY_PORT", default_value_t = DEFAULT_PROXY_PORT)]
    pub proxy_port: u16,

    /// NATS server used to reach workers without a public address.
    #[arg(long, env = "QUASAR_NATS_URL")]
    pub nats_url: Option<String>,

    #[arg(long, env = "QUASAR_NATS_SUBJECT_PREFIX", default_value = DEFAULT_SUBJECT_PREFIX)]
    pub nats_subject_prefix: String,

    /// Upper bound for one dispatched inference call, in seconds.
    #[arg(long, env = "QUASAR_GATEWAY_REQUEST_TIMEOUT", default_value_t = 300)]
    pub request_timeout_secs: u64,

    /// Append every request and response to `<log dir>/inference.log`.
    #[arg(long, env = "QUASAR_ENABLE_INFERENCE_LOG")]
    pub enable_inference_log: Option<String>,

    #[arg(long, env = "QUASAR_LOG_DIR", default_value = "./logs")]
    pub log_dir: String,

    /// OTLP/HTTP base URL for span export.
    #[arg(long, env = "QUASAR_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "QUASAR_OTLP_TOKEN")]
    pub otlp_token: Option<String>,

    #[arg(long, env = "QUASAR_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,
}
