use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Test => write!(f, "test"),
            Environment::Production => write!(f, "production"),
        }
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub env: Environment,
    pub log_level: String,
    pub sources_path: PathBuf,
    pub data_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub source_api_url: Option<String>,
    pub source_api_token: Option<String>,
    pub detector_url: Option<String>,
    pub db_max_connections: u32,
    pub db_min_connections: u32,
    pub db_acquire_timeout_secs: u64,
    pub collector_request_timeout_secs: u64,
    pub collector_user_agent: String,
    pub collector_page_size: u32,
    pub collector_max_retries: u32,
    pub collector_retry_backoff_base_ms: u64,
    pub collector_inter_request_delay_ms: u64,
    pub collector_max_concurrent_sources: usize,
    pub collector_max_rate_limit_waits: u32,
    pub collector_max_rate_limit_wait_secs: u64,
    pub loader_batch_size: usize,
    pub enrich_request_timeout_secs: u64,
    pub enrich_max_retries: u32,
    pub enrich_max_concurrency: usize,
    pub transform_command: String,
    pub transform_dir: PathBuf,
    pub transform_timeout_secs: u64,
    pub schedule_cron: String,
    pub scheduled_lookback_days: u32,
    pub sensor_interval_secs: u64,
}

impl AppConfig {
    /// Directory holding the date-partitioned staged message files.
    #[must_use]
    pub fn messages_dir(&self) -> PathBuf {
        self.data_dir.join("raw").join("telegram_messages")
    }

    /// Root of the source-scoped, content-named media store.
    #[must_use]
    pub fn media_dir(&self) -> PathBuf {
        self.data_dir.join("raw").join("images")
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("env", &self.env)
            .field("log_level", &self.log_level)
            .field("sources_path", &self.sources_path)
            .field("data_dir", &self.data_dir)
            .field("reports_dir", &self.reports_dir)
            .field("database_url", &"[redacted]")
            .field("source_api_url", &self.source_api_url)
            .field(
                "source_api_token",
                &self.source_api_token.as_ref().map(|_| "[redacted]"),
            )
            .field("detector_url", &self.detector_url)
            .field("db_max_connections", &self.db_max_connections)
            .field("db_min_connections", &self.db_min_connections)
            .field("db_acquire_timeout_secs", &self.db_acquire_timeout_secs)
            .field(
                "collector_request_timeout_secs",
                &self.collector_request_timeout_secs,
            )
            .field("collector_user_agent", &self.collector_user_agent)
            .field("collector_page_size", &self.collector_page_size)
            .field("collector_max_retries", &self.collector_max_retries)
            .field(
                "collector_retry_backoff_base_ms",
                &self.collector_retry_backoff_base_ms,
            )
            .field(
                "collector_inter_request_delay_ms",
                &self.collector_inter_request_delay_ms,
            )
            .field(
                "collector_max_concurrent_sources",
                &self.collector_max_concurrent_sources,
            )
            .field(
                "collector_max_rate_limit_waits",
                &self.collector_max_rate_limit_waits,
            )
            .field(
                "collector_max_rate_limit_wait_secs",
                &self.collector_max_rate_limit_wait_secs,
            )
            .field("loader_batch_size", &self.loader_batch_size)
            .field(
                "enrich_request_timeout_secs",
                &self.enrich_request_timeout_secs,
            )
            .field("enrich_max_retries", &self.enrich_max_retries)
            .field("enrich_max_concurrency", &self.enrich_max_concurrency)
            .field("transform_command", &self.transform_command)
            .field("transform_dir", &self.transform_dir)
            .field("transform_timeout_secs", &self.transform_timeout_secs)
            .field("schedule_cron", &self.schedule_cron)
            .field("scheduled_lookback_days", &self.scheduled_lookback_days)
            .field("sensor_interval_secs", &self.sensor_interval_secs)
            .finish()
    }
}
