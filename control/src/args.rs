use clap::{Parser, Subcommand};
use ferry_common::args::{PostgresArgs, RateLimiterArgs, RedisArgs};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the control plane (gRPC relayer endpoint + internal HTTP).
    Server(ServerArgs),
    /// Create an organization and its first API key.
    CreateOrg(CreateOrgArgs),
    /// Issue an additional API key for an organization.
    CreateApiKey(CreateApiKeyArgs),
    /// Submit an execution through the HTTP surface.
    Submit(SubmitArgs),
    /// Fetch one execution row.
    GetExecution(GetExecutionArgs),
    /// Probe the HTTP surface.
    Health(HealthArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    /// Internal HTTP listen address
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Relayer stream listen address
    #[arg(long, env = "GRPC_HOST", default_value = "0.0.0.0")]
    pub grpc_host: String,

    #[arg(long, env = "GRPC_PORT", default_value_t = 50051)]
    pub grpc_port: u16,

    #[arg(long, env = "GRPC_TLS_ENABLED", default_value_t = false)]
    pub grpc_tls_enabled: bool,

    /// PEM certificate chain for the stream endpoint
    #[arg(long, env = "GRPC_TLS_CERT_FILE")]
    pub grpc_tls_cert_file: Option<String>,

    /// PEM private key for the stream endpoint
    #[arg(long, env = "GRPC_TLS_KEY_FILE")]
    pub grpc_tls_key_file: Option<String>,

    /// Force-reconnect interval for relayer connections
    #[arg(long, env = "GRPC_MAX_CONNECTION_AGE_MS")]
    pub grpc_max_connection_age_ms: Option<u64>,

    #[arg(long, env = "GRPC_KEEPALIVE_TIME_MS", default_value_t = 30_000)]
    pub grpc_keepalive_time_ms: u64,

    #[arg(long, env = "GRPC_KEEPALIVE_TIMEOUT_MS", default_value_t = 10_000)]
    pub grpc_keepalive_timeout_ms: u64,

    /// Max concurrent relayer streams per process
    #[arg(long, env = "GRPC_MAX_CONCURRENT_STREAMS", default_value_t = 100)]
    pub grpc_max_concurrent_streams: u32,

    /// Heartbeat age past which a cluster is considered stale
    #[arg(long, env = "HEARTBEAT_TIMEOUT_MS", default_value_t = 120_000)]
    pub heartbeat_timeout_ms: u64,

    /// Heartbeat cadence pushed to relayers at registration
    #[arg(long, env = "HEARTBEAT_INTERVAL_MS", default_value_t = 30_000)]
    pub heartbeat_interval_ms: i64,

    /// Health monitor period
    #[arg(long, env = "SWEEP_INTERVAL_MS", default_value_t = 30_000)]
    pub sweep_interval_ms: u64,

    /// Session no-progress bound before force-detach
    #[arg(long, env = "IDLE_TIMEOUT_MS", default_value_t = 300_000)]
    pub idle_timeout_ms: u64,

    /// Outbound channel depth per cluster
    #[arg(long, env = "SEND_CHANNEL_CAPACITY", default_value_t = 64)]
    pub send_channel_capacity: usize,

    /// Per-cluster queue depth cap; 0 = unbounded
    #[arg(long, env = "QUEUE_DEPTH_LIMIT", default_value_t = 0)]
    pub queue_depth_limit: usize,

    /// Bound on one credential verification
    #[arg(long, env = "AUTH_TIMEOUT_MS", default_value_t = 500)]
    pub auth_timeout_ms: u64,

    /// Queue backing: "redis" (durable) or "memory" (lost on restart)
    #[arg(long, env = "QUEUE_BACKEND", default_value = "redis")]
    pub queue_backend: String,

    /// Rate-limit the HTTP surface per API key
    #[arg(long, env = "RATE_LIMIT_ENABLED", default_value_t = false)]
    pub rate_limit_enabled: bool,

    #[clap(flatten)]
    pub postgres: PostgresArgs,

    #[clap(flatten)]
    pub redis: RedisArgs,

    #[clap(flatten)]
    pub rate_limiter: RateLimiterArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct CreateOrgArgs {
    /// Organization name (unique)
    #[arg(long)]
    pub name: String,

    #[clap(flatten)]
    pub postgres: PostgresArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct CreateApiKeyArgs {
    /// Organization id the key belongs to
    #[arg(long)]
    pub organization_id: uuid::Uuid,

    /// Expiry in days from now; omit for a non-expiring key
    #[arg(long)]
    pub expires_in_days: Option<i64>,

    #[clap(flatten)]
    pub postgres: PostgresArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct SubmitArgs {
    /// Control-plane HTTP endpoint
    #[arg(long, env = "FERRY_ENDPOINT", default_value = "http://127.0.0.1:8080")]
    pub endpoint: String,

    #[arg(long, env = "FERRY_API_KEY")]
    pub api_key: String,

    /// Agent name to execute
    #[arg(long)]
    pub agent: String,

    /// Input JSON
    #[arg(long, default_value = "{}")]
    pub input: String,

    /// high | normal | low
    #[arg(long, default_value = "normal")]
    pub priority: String,
}

#[derive(Parser, Debug, Clone)]
pub struct GetExecutionArgs {
    #[arg(long, env = "FERRY_ENDPOINT", default_value = "http://127.0.0.1:8080")]
    pub endpoint: String,

    #[arg(long, env = "FERRY_API_KEY")]
    pub api_key: String,

    pub id: uuid::Uuid,
}

#[derive(Parser, Debug, Clone)]
pub struct HealthArgs {
    #[arg(long, env = "FERRY_ENDPOINT", default_value = "http://127.0.0.1:8080")]
    pub endpoint: String,
}
