use std::path::PathBuf;

use clap::Parser;

/// Gateway configuration.
///
/// Parsed once at startup and passed by reference. Defaults match the
/// single-node deployment the gateway ships in: the engine store on 3306,
/// the broker on 8080, and staging paths under `/home/user`.
#[derive(Parser, Clone)]
pub struct GatewayConfig {
    /// HTTP bind address for the submission API.
    #[arg(long, env = "GATEWAY_BIND", default_value = "0.0.0.0:8000")]
    pub bind: String,

    /// MySQL engine store connection string.
    #[arg(
        long,
        env = "ENGINE_DATABASE_URL",
        default_value = "mysql://root:@127.0.0.1:3306/engine"
    )]
    pub engine_database_url: String,

    /// Broker intra API base URL.
    #[arg(long, env = "BROKER_URL", default_value = "http://127.0.0.1:8080")]
    pub broker_url: String,

    /// Remote file-store base URL.
    #[arg(long, env = "FILESTORE_URL", default_value = "http://localhost:9000")]
    pub filestore_url: String,

    /// Remote file-store bearer token.
    #[arg(long, env = "FILESTORE_API_KEY", default_value = "")]
    pub filestore_api_key: String,

    /// Local path fetched datasets are staged to.
    #[arg(long, env = "DATASET_PATH", default_value = "/home/user/data.csv")]
    pub dataset_path: PathBuf,

    /// Local path query results are written to before upload.
    #[arg(long, env = "RESULT_PATH", default_value = "/home/user/result.csv")]
    pub result_path: PathBuf,

    /// Engine config template rewritten with session parameters.
    #[arg(
        long,
        env = "ENGINE_CONFIG_PATH",
        default_value = "/home/user/config/config.yml"
    )]
    pub engine_config_path: PathBuf,

    /// Party roster template rewritten with session parameters.
    #[arg(
        long,
        env = "PARTY_INFO_PATH",
        default_value = "/home/user/config/party_info.json"
    )]
    pub party_info_path: PathBuf,

    /// Command that restarts the local compute engine process group.
    #[arg(
        long,
        env = "ENGINE_RESTART_CMD",
        default_value = "supervisorctl restart broker"
    )]
    pub engine_restart_cmd: String,

    /// Engine store readiness probe address.
    #[arg(long, env = "ENGINE_DB_ADDR", default_value = "127.0.0.1:3306")]
    pub engine_db_addr: String,

    /// Broker/engine ports probed before session setup.
    #[arg(
        long,
        env = "SERVICE_PORTS",
        default_value = "8080,8081,8003",
        value_delimiter = ','
    )]
    pub service_ports: Vec<u16>,

    /// Wait budget for each readiness gate, in seconds.
    #[arg(long, env = "READINESS_WAIT_SECS", default_value_t = 60)]
    pub readiness_wait_secs: u64,

    /// Prefix for per-task broker project ids (also the fallback scope for
    /// joiners that find no invitation record).
    #[arg(long, env = "PROJECT_PREFIX", default_value = "tsql")]
    pub project_prefix: String,

    /// Attempt cap for the bounded query stage.
    #[arg(long, env = "QUERY_MAX_ATTEMPTS", default_value_t = 30)]
    pub query_max_attempts: u32,

    /// Fixed delay between stage retries, in milliseconds.
    #[arg(long, env = "RETRY_DELAY_MS", default_value_t = 1_000)]
    pub retry_delay_ms: u64,

    /// Request timeout for broker and file-store calls, in seconds.
    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value_t = 10)]
    pub http_timeout_secs: u64,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("bind", &self.bind)
            .field("engine_database_url", &"<redacted>")
            .field("broker_url", &self.broker_url)
            .field("filestore_url", &self.filestore_url)
            .field("filestore_api_key", &"<redacted>")
            .field("dataset_path", &self.dataset_path)
            .field("result_path", &self.result_path)
            .field("engine_config_path", &self.engine_config_path)
            .field("party_info_path", &self.party_info_path)
            .field("engine_restart_cmd", &self.engine_restart_cmd)
            .field("engine_db_addr", &self.engine_db_addr)
            .field("service_ports", &self.service_ports)
            .field("readiness_wait_secs", &self.readiness_wait_secs)
            .field("project_prefix", &self.project_prefix)
            .field("query_max_attempts", &self.query_max_attempts)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .finish()
    }
}

impl GatewayConfig {
    /// Parse config from environment only (no CLI parsing).
    ///
    /// Parses from a single fake argv element so clap doesn't try to
    /// interpret real process arguments here.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::parse_from(["parley-gateway"]))
    }
}
