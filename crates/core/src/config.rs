use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `CLINICFLOW__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

// ─── Engine Config ──────────────────────────────────────────────────────
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_sweep_batch_size")]
    pub sweep_batch_size: usize,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,
    #[serde(default = "default_max_zero_delay_chain")]
    pub max_zero_delay_chain: usize,
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,
    /// IANA zone used for day-granular delays and `send_time`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_sweep_interval_secs() -> u64 { 60 }
fn default_worker_concurrency() -> usize { 16 }
fn default_sweep_batch_size() -> usize { 500 }
fn default_lease_secs() -> u64 { 300 }
fn default_action_timeout_ms() -> u64 { 10_000 }
fn default_max_zero_delay_chain() -> usize { 50 }
fn default_stuck_threshold_secs() -> u64 { 900 }
fn default_timezone() -> String { "UTC".to_string() }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            worker_concurrency: default_worker_concurrency(),
            sweep_batch_size: default_sweep_batch_size(),
            lease_secs: default_lease_secs(),
            action_timeout_ms: default_action_timeout_ms(),
            max_zero_delay_chain: default_max_zero_delay_chain(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
            timezone: default_timezone(),
            retry: RetryConfig::default(),
        }
    }
}

// ─── Retry Config ───────────────────────────────────────────────────────
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Attempts per step, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_max_attempts() -> u32 { 5 }
fn default_base_delay_secs() -> u64 { 60 }
fn default_max_delay_secs() -> u64 { 3600 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("CLINICFLOW")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
