use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `FLOWLINE__` and TOML config files.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub send_time: SendTimeConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Tuning knobs for the step scheduler and its retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,
    #[serde(default = "default_max_steps_per_tick")]
    pub max_steps_per_tick: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendTimeConfig {
    #[serde(default = "default_search_horizon_days")]
    pub search_horizon_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_workers() -> usize {
    4
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_batch_size() -> usize {
    100
}
fn default_retry_ceiling() -> u32 {
    5
}
fn default_backoff_base_secs() -> u64 {
    60
}
fn default_backoff_cap_secs() -> u64 {
    21_600
}
fn default_action_timeout_ms() -> u64 {
    10_000
}
fn default_max_steps_per_tick() -> u32 {
    25
}
fn default_search_horizon_days() -> u32 {
    7
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            retry_ceiling: default_retry_ceiling(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
            action_timeout_ms: default_action_timeout_ms(),
            max_steps_per_tick: default_max_steps_per_tick(),
        }
    }
}

impl Default for SendTimeConfig {
    fn default() -> Self {
        Self {
            search_horizon_days: default_search_horizon_days(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            engine: EngineConfig::default(),
            send_time: SendTimeConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and optional config file.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("FLOWLINE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
