use crate::app_config::{AppConfig, Environment};
use crate::ConfigError;

/// Load application configuration from environment variables.
///
/// Calls `dotenvy::dotenv().ok()` to load `.env` files before reading env vars.
///
/// # Errors
///
/// Returns `ConfigError` if required env vars are missing or values are invalid.
pub fn load_app_config() -> Result<AppConfig, ConfigError> {
    dotenvy::dotenv().ok();
    load_app_config_from_env()
}

/// Load application configuration from environment variables already in the process.
///
/// Unlike [`load_app_config`], this does NOT load `.env` files.
///
/// # Errors
///
/// Returns `ConfigError` if required env vars are missing or values are invalid.
pub fn load_app_config_from_env() -> Result<AppConfig, ConfigError> {
    build_app_config(|key| std::env::var(key))
}

/// Build application configuration using the provided env-var lookup function.
///
/// Decoupled from the process environment so it can be driven by a plain
/// `HashMap` in tests, including tests in downstream crates.
///
/// # Errors
///
/// Returns `ConfigError` if required env vars are missing or values are invalid.
pub fn build_app_config<F>(lookup: F) -> Result<AppConfig, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    use std::path::PathBuf;

    let require = |var: &str| -> Result<String, ConfigError> {
        lookup(var).map_err(|_| ConfigError::MissingEnvVar(var.to_string()))
    };

    let or_default = |var: &str, default: &str| -> String {
        lookup(var).unwrap_or_else(|_| default.to_string())
    };

    let optional = |var: &str| -> Option<String> {
        lookup(var).ok().filter(|v| !v.trim().is_empty())
    };

    let invalid = |var: &str, reason: String| ConfigError::InvalidEnvVar {
        var: var.to_string(),
        reason,
    };

    let parse_u32 = |var: &str, default: &str| -> Result<u32, ConfigError> {
        or_default(var, default)
            .parse::<u32>()
            .map_err(|e| invalid(var, e.to_string()))
    };

    let parse_u64 = |var: &str, default: &str| -> Result<u64, ConfigError> {
        or_default(var, default)
            .parse::<u64>()
            .map_err(|e| invalid(var, e.to_string()))
    };

    let parse_usize = |var: &str, default: &str| -> Result<usize, ConfigError> {
        or_default(var, default)
            .parse::<usize>()
            .map_err(|e| invalid(var, e.to_string()))
    };

    let database_url = require("DATABASE_URL")?;

    let env = parse_environment(&or_default("MEDWH_ENV", "development"));
    let log_level = or_default("MEDWH_LOG_LEVEL", "info");
    let sources_path = PathBuf::from(or_default("MEDWH_SOURCES_PATH", "./config/sources.yaml"));
    let data_dir = PathBuf::from(or_default("MEDWH_DATA_DIR", "./data"));
    let reports_dir = PathBuf::from(or_default("MEDWH_REPORTS_DIR", "./reports/pipeline"));

    let source_api_url = optional("MEDWH_SOURCE_API_URL");
    let source_api_token = optional("MEDWH_SOURCE_API_TOKEN");
    let detector_url = optional("MEDWH_DETECTOR_URL");

    let db_max_connections = parse_u32("MEDWH_DB_MAX_CONNECTIONS", "10")?;
    let db_min_connections = parse_u32("MEDWH_DB_MIN_CONNECTIONS", "1")?;
    let db_acquire_timeout_secs = parse_u64("MEDWH_DB_ACQUIRE_TIMEOUT_SECS", "10")?;

    let collector_request_timeout_secs = parse_u64("MEDWH_COLLECTOR_REQUEST_TIMEOUT_SECS", "30")?;
    let collector_user_agent = or_default("MEDWH_COLLECTOR_USER_AGENT", "medwh/0.1 (collector)");
    let collector_page_size = parse_u32("MEDWH_COLLECTOR_PAGE_SIZE", "100")?;
    let collector_max_retries = parse_u32("MEDWH_COLLECTOR_MAX_RETRIES", "3")?;
    let collector_retry_backoff_base_ms = parse_u64("MEDWH_COLLECTOR_RETRY_BACKOFF_BASE_MS", "1000")?;
    let collector_inter_request_delay_ms =
        parse_u64("MEDWH_COLLECTOR_INTER_REQUEST_DELAY_MS", "100")?;
    let collector_max_concurrent_sources =
        parse_usize("MEDWH_COLLECTOR_MAX_CONCURRENT_SOURCES", "2")?;
    let collector_max_rate_limit_waits = parse_u32("MEDWH_COLLECTOR_MAX_RATE_LIMIT_WAITS", "5")?;
    let collector_max_rate_limit_wait_secs =
        parse_u64("MEDWH_COLLECTOR_MAX_RATE_LIMIT_WAIT_SECS", "900")?;

    let loader_batch_size = parse_usize("MEDWH_LOADER_BATCH_SIZE", "100")?;
    if loader_batch_size == 0 {
        return Err(invalid(
            "MEDWH_LOADER_BATCH_SIZE",
            "must be at least 1".to_string(),
        ));
    }

    let enrich_request_timeout_secs = parse_u64("MEDWH_ENRICH_REQUEST_TIMEOUT_SECS", "60")?;
    let enrich_max_retries = parse_u32("MEDWH_ENRICH_MAX_RETRIES", "2")?;
    let enrich_max_concurrency = parse_usize("MEDWH_ENRICH_MAX_CONCURRENCY", "2")?;

    let transform_command = or_default("MEDWH_TRANSFORM_COMMAND", "dbt run");
    if transform_command.split_whitespace().next().is_none() {
        return Err(invalid(
            "MEDWH_TRANSFORM_COMMAND",
            "must name a program".to_string(),
        ));
    }
    let transform_dir = PathBuf::from(or_default("MEDWH_TRANSFORM_DIR", "./medical_warehouse"));
    let transform_timeout_secs = parse_u64("MEDWH_TRANSFORM_TIMEOUT_SECS", "1800")?;

    let schedule_cron = or_default("MEDWH_SCHEDULE_CRON", "0 0 2 * * *");
    let scheduled_lookback_days = parse_u32("MEDWH_SCHEDULED_LOOKBACK_DAYS", "1")?;
    let sensor_interval_secs = parse_u64("MEDWH_SENSOR_INTERVAL_SECS", "30")?;

    Ok(AppConfig {
        database_url,
        env,
        log_level,
        sources_path,
        data_dir,
        reports_dir,
        source_api_url,
        source_api_token,
        detector_url,
        db_max_connections,
        db_min_connections,
        db_acquire_timeout_secs,
        collector_request_timeout_secs,
        collector_user_agent,
        collector_page_size,
        collector_max_retries,
        collector_retry_backoff_base_ms,
        collector_inter_request_delay_ms,
        collector_max_concurrent_sources,
        collector_max_rate_limit_waits,
        collector_max_rate_limit_wait_secs,
        loader_batch_size,
        enrich_request_timeout_secs,
        enrich_max_retries,
        enrich_max_concurrency,
        transform_command,
        transform_dir,
        transform_timeout_secs,
        schedule_cron,
        scheduled_lookback_days,
        sensor_interval_secs,
    })
}

/// Parse a string into an `Environment` variant.
///
/// Unrecognized values default to `Environment::Development`.
fn parse_environment(s: &str) -> Environment {
    match s {
        "production" => Environment::Production,
        "test" => Environment::Test,
        _ => Environment::Development,
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
