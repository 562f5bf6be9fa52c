//! Offline unit tests for medwh-db pool configuration and row types.
//! These tests do not require a live database connection.

use std::collections::HashMap;

use medwh_core::config::build_app_config;
use medwh_db::{PipelineRunRow, PoolConfig, SourceCursorRow};

#[test]
fn pool_config_from_app_config_uses_core_values() {
    let env: HashMap<&str, &str> = HashMap::from([
        ("DATABASE_URL", "postgres://example"),
        ("MEDWH_DB_MAX_CONNECTIONS", "42"),
        ("MEDWH_DB_MIN_CONNECTIONS", "7"),
        ("MEDWH_DB_ACQUIRE_TIMEOUT_SECS", "9"),
    ]);
    let app_config = build_app_config(|key| {
        env.get(key)
            .map(|v| (*v).to_string())
            .ok_or(std::env::VarError::NotPresent)
    })
    .expect("valid config");

    let pool_config = PoolConfig::from_app_config(&app_config);
    assert_eq!(pool_config.max_connections, 42);
    assert_eq!(pool_config.min_connections, 7);
    assert_eq!(pool_config.acquire_timeout_secs, 9);
}

/// Compile-time smoke test: confirm that [`PipelineRunRow`] has all expected
/// fields with the correct types. No database required.
#[test]
fn pipeline_run_row_has_expected_fields() {
    use chrono::Utc;
    use uuid::Uuid;

    let row = PipelineRunRow {
        id: 1_i64,
        run_id: Uuid::new_v4(),
        trigger_source: "schedule".to_string(),
        status: "pending".to_string(),
        started_at: None,
        completed_at: None,
        overall_success: None,
        report: None,
        error_message: None,
        created_at: Utc::now(),
    };

    assert_eq!(row.id, 1);
    assert_eq!(row.trigger_source, "schedule");
    assert_eq!(row.status, "pending");
    assert!(row.started_at.is_none());
    assert!(row.overall_success.is_none());
    assert!(row.report.is_none());
    assert!(row.error_message.is_none());
}

#[test]
fn source_cursor_row_has_expected_fields() {
    use chrono::Utc;

    let now = Utc::now();
    let row = SourceCursorRow {
        source_id: "chemed".to_string(),
        last_synced_at: now,
        last_message_id: Some(991),
        updated_at: now,
    };

    assert_eq!(row.source_id, "chemed");
    assert_eq!(row.last_message_id, Some(991));
}
