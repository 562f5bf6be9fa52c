//! Live integration tests for medwh-db using `#[sqlx::test]`.
//!
//! Each test gets a fresh, fully-migrated Postgres database spun up by the
//! sqlx test harness. The `migrations` path is relative to the crate root
//! (`crates/medwh-db/`), so `"../../migrations"` resolves to the workspace
//! migration directory.

use chrono::{DateTime, Duration, TimeZone, Utc};
use medwh_core::{
    BoundingBox, Detection, DetectionRecord, ImageCategory, MediaAsset, RawRecord, RecordKey,
    StagedRecord,
};
use medwh_db::{
    advance_source_cursor, advance_watermark, complete_pipeline_run, count_image_skips,
    count_raw_records, create_pipeline_run, fail_pipeline_run, get_detection, get_pipeline_run,
    get_raw_record, get_source_cursor, get_watermark, list_pending_media,
    list_pipeline_run_steps, list_pipeline_runs, record_image_skip, start_pipeline_run,
    try_acquire_run_lock, upsert_detection, upsert_pipeline_run_step, upsert_staged_batch,
    DbError,
};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ts(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 15, hour, 0, 0)
        .single()
        .expect("valid timestamp")
}

fn staged(source_id: &str, message_id: i64, text: &str, views: i64) -> StagedRecord {
    StagedRecord {
        record: RawRecord {
            message_id,
            source_id: source_id.to_string(),
            timestamp: ts(10),
            text: text.to_string(),
            has_media: false,
            media_reference: None,
            view_count: views,
            forward_count: 0,
            collected_at: ts(12),
            raw_payload: serde_json::json!({ "id": message_id }),
        },
        media: None,
    }
}

fn staged_with_media(source_id: &str, message_id: i64, reference: &str) -> StagedRecord {
    let mut s = staged(source_id, message_id, "photo", 1);
    s.record.has_media = true;
    s.record.media_reference = Some(reference.to_string());
    s.media = Some(MediaAsset {
        message_id,
        source_id: source_id.to_string(),
        media_reference: reference.to_string(),
        content_sha256: "ab".repeat(32),
        byte_size: 2048,
    });
    s
}

// ---------------------------------------------------------------------------
// Section 1: raw record upserts
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../migrations")]
async fn upserting_same_key_twice_keeps_one_row_with_latest_values(pool: sqlx::PgPool) {
    upsert_staged_batch(&pool, &[staged("chemed", 1, "first", 10)])
        .await
        .expect("first upsert failed");
    upsert_staged_batch(&pool, &[staged("chemed", 1, "edited", 25)])
        .await
        .expect("second upsert failed");

    assert_eq!(count_raw_records(&pool, Some("chemed")).await.unwrap(), 1);

    let key = RecordKey {
        message_id: 1,
        source_id: "chemed".to_string(),
    };
    let row = get_raw_record(&pool, &key).await.expect("row should exist");
    assert_eq!(row.message_text, "edited");
    assert_eq!(row.view_count, 25);
    assert_eq!(row.message_ts, ts(10));
}

#[sqlx::test(migrations = "../../migrations")]
async fn same_message_id_in_different_sources_is_two_rows(pool: sqlx::PgPool) {
    upsert_staged_batch(
        &pool,
        &[staged("chemed", 5, "a", 1), staged("tikvahpharma", 5, "b", 1)],
    )
    .await
    .expect("upsert failed");

    assert_eq!(count_raw_records(&pool, None).await.unwrap(), 2);
}

#[sqlx::test(migrations = "../../migrations")]
async fn constraint_violation_rolls_back_whole_batch_and_is_data_error(pool: sqlx::PgPool) {
    let batch = vec![staged("chemed", 1, "ok", 3), staged("chemed", 2, "bad", -1)];

    let err = upsert_staged_batch(&pool, &batch)
        .await
        .expect_err("negative view count must be rejected");

    assert!(err.is_data_error(), "expected data error, got {err:?}");
    assert_eq!(count_raw_records(&pool, None).await.unwrap(), 0);
}

#[sqlx::test(migrations = "../../migrations")]
async fn media_asset_is_stored_with_its_record(pool: sqlx::PgPool) {
    upsert_staged_batch(
        &pool,
        &[staged_with_media("chemed", 9, "data/raw/images/chemed/ab.jpg")],
    )
    .await
    .expect("upsert failed");
    upsert_staged_batch(
        &pool,
        &[staged_with_media("chemed", 9, "data/raw/images/chemed/ab.jpg")],
    )
    .await
    .expect("repeat upsert failed");

    let assets: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM media_assets")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(assets, 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn get_raw_record_unknown_key_is_not_found(pool: sqlx::PgPool) {
    let key = RecordKey {
        message_id: 404,
        source_id: "chemed".to_string(),
    };
    assert!(matches!(
        get_raw_record(&pool, &key).await,
        Err(DbError::NotFound)
    ));
}

// ---------------------------------------------------------------------------
// Section 2: cursors and watermarks
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../migrations")]
async fn cursor_never_moves_backwards(pool: sqlx::PgPool) {
    assert!(get_source_cursor(&pool, "chemed").await.unwrap().is_none());

    let first = advance_source_cursor(&pool, "chemed", ts(10), Some(100))
        .await
        .unwrap();
    assert_eq!(first, ts(10));

    let after_regress = advance_source_cursor(&pool, "chemed", ts(8), Some(50))
        .await
        .unwrap();
    assert_eq!(after_regress, ts(10));

    let cursor = get_source_cursor(&pool, "chemed").await.unwrap().unwrap();
    assert_eq!(cursor.last_synced_at, ts(10));
    assert_eq!(cursor.last_message_id, Some(100));

    let forward = advance_source_cursor(&pool, "chemed", ts(11), None)
        .await
        .unwrap();
    assert_eq!(forward, ts(11));
    let cursor = get_source_cursor(&pool, "chemed").await.unwrap().unwrap();
    assert_eq!(cursor.last_message_id, Some(100));
}

#[sqlx::test(migrations = "../../migrations")]
async fn watermark_is_monotonic(pool: sqlx::PgPool) {
    assert!(get_watermark(&pool, "new_data").await.unwrap().is_none());

    advance_watermark(&pool, "new_data", ts(9)).await.unwrap();
    let stored = advance_watermark(&pool, "new_data", ts(7)).await.unwrap();
    assert_eq!(stored, ts(9));

    advance_watermark(&pool, "new_data", ts(9) + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(
        get_watermark(&pool, "new_data").await.unwrap(),
        Some(ts(9) + Duration::minutes(5))
    );
}

// ---------------------------------------------------------------------------
// Section 3: detections
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../migrations")]
async fn classified_images_leave_the_pending_queue(pool: sqlx::PgPool) {
    upsert_staged_batch(
        &pool,
        &[
            staged_with_media("chemed", 1, "img/a.jpg"),
            staged_with_media("chemed", 2, "img/b.jpg"),
            staged("chemed", 3, "text only", 0),
        ],
    )
    .await
    .unwrap();

    let pending = list_pending_media(&pool, false).await.unwrap();
    assert_eq!(pending.len(), 2);

    let key = RecordKey {
        message_id: 1,
        source_id: "chemed".to_string(),
    };
    let record = DetectionRecord::new(
        &key,
        "img/a.jpg",
        vec![Detection {
            label: "bottle".to_string(),
            confidence: 0.9,
            bbox: BoundingBox([1.0, 2.0, 3.0, 4.0]),
        }],
        ImageCategory::ProductDisplay,
        ts(13),
    );
    upsert_detection(&pool, &record).await.unwrap();
    upsert_detection(&pool, &record).await.unwrap();

    let pending = list_pending_media(&pool, false).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].media_reference, "img/b.jpg");

    let everything = list_pending_media(&pool, true).await.unwrap();
    assert_eq!(everything.len(), 2);

    let stored = get_detection(&pool, 1, "chemed", "img/a.jpg").await.unwrap();
    assert_eq!(stored.image_category, "product_display");
    assert_eq!(stored.detection_count, 1);
    assert_eq!(stored.detected_objects[0]["label"], "bottle");
}

#[sqlx::test(migrations = "../../migrations")]
async fn skipped_images_leave_the_pending_queue_until_reprocess(pool: sqlx::PgPool) {
    upsert_staged_batch(
        &pool,
        &[
            staged_with_media("chemed", 1, "img/broken.jpg"),
            staged_with_media("chemed", 2, "img/fine.jpg"),
        ],
    )
    .await
    .unwrap();

    record_image_skip(&pool, 1, "chemed", "img/broken.jpg", "undecodable")
        .await
        .unwrap();
    record_image_skip(&pool, 1, "chemed", "img/broken.jpg", "still undecodable")
        .await
        .unwrap();

    let pending = list_pending_media(&pool, false).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].media_reference, "img/fine.jpg");
    assert_eq!(count_image_skips(&pool).await.unwrap(), 1);

    let everything = list_pending_media(&pool, true).await.unwrap();
    assert_eq!(everything.len(), 2);
}

// ---------------------------------------------------------------------------
// Section 4: pipeline run lifecycle
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../migrations")]
async fn pipeline_run_lifecycle_pending_to_partially_completed(pool: sqlx::PgPool) {
    let run_id = Uuid::new_v4();
    let run = create_pipeline_run(&pool, run_id, "manual")
        .await
        .expect("create_pipeline_run failed");
    assert_eq!(run.status, "pending");

    start_pipeline_run(&pool, run_id)
        .await
        .expect("start_pipeline_run failed");

    upsert_pipeline_run_step(
        &pool,
        run.id,
        "init_database",
        "success",
        &serde_json::json!({}),
        ts(1),
    )
    .await
    .unwrap();
    upsert_pipeline_run_step(
        &pool,
        run.id,
        "enrich",
        "skipped",
        &serde_json::json!({ "reason": "no new images" }),
        ts(2),
    )
    .await
    .unwrap();

    complete_pipeline_run(&pool, run_id, false, &serde_json::json!({ "steps": 2 }))
        .await
        .expect("complete_pipeline_run failed");

    let fetched = get_pipeline_run(&pool, run_id).await.unwrap();
    assert_eq!(fetched.status, "partially_completed");
    assert_eq!(fetched.overall_success, Some(false));
    assert!(fetched.completed_at.is_some());

    let steps = list_pipeline_run_steps(&pool, run.id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[1].status, "skipped");

    let recent = list_pipeline_runs(&pool, 5).await.unwrap();
    assert_eq!(recent.len(), 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn pipeline_run_cannot_complete_directly_from_pending(pool: sqlx::PgPool) {
    let run_id = Uuid::new_v4();
    create_pipeline_run(&pool, run_id, "manual").await.unwrap();

    let err = complete_pipeline_run(&pool, run_id, true, &serde_json::json!({}))
        .await
        .expect_err("completing a pending run should fail");

    assert!(matches!(
        err,
        DbError::InvalidPipelineRunTransition {
            expected_status: "running",
            ..
        }
    ));
}

#[sqlx::test(migrations = "../../migrations")]
async fn aborted_run_ends_failed_with_its_error(pool: sqlx::PgPool) {
    let run_id = Uuid::new_v4();
    create_pipeline_run(&pool, run_id, "manual").await.unwrap();
    start_pipeline_run(&pool, run_id).await.unwrap();

    fail_pipeline_run(&pool, run_id, "I/O error at /reports: permission denied")
        .await
        .expect("fail_pipeline_run failed");

    let fetched = get_pipeline_run(&pool, run_id).await.unwrap();
    assert_eq!(fetched.status, "failed");
    assert_eq!(fetched.overall_success, Some(false));
    assert!(fetched.completed_at.is_some());
    assert_eq!(
        fetched.error_message.as_deref(),
        Some("I/O error at /reports: permission denied")
    );

    let err = fail_pipeline_run(&pool, run_id, "again")
        .await
        .expect_err("a finished run cannot fail twice");
    assert!(matches!(err, DbError::InvalidPipelineRunTransition { .. }));
}

#[sqlx::test(migrations = "../../migrations")]
async fn completed_run_cannot_be_marked_failed(pool: sqlx::PgPool) {
    let run_id = Uuid::new_v4();
    create_pipeline_run(&pool, run_id, "manual").await.unwrap();
    start_pipeline_run(&pool, run_id).await.unwrap();
    complete_pipeline_run(&pool, run_id, true, &serde_json::json!({}))
        .await
        .unwrap();

    let err = fail_pipeline_run(&pool, run_id, "late").await.unwrap_err();
    assert!(matches!(
        err,
        DbError::InvalidPipelineRunTransition {
            expected_status: "pending or running",
            ..
        }
    ));
    let fetched = get_pipeline_run(&pool, run_id).await.unwrap();
    assert_eq!(fetched.status, "completed");
    assert!(fetched.error_message.is_none());
}

// ---------------------------------------------------------------------------
// Section 5: run lock
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../migrations")]
async fn run_lock_is_exclusive_until_released(pool: sqlx::PgPool) {
    let first = try_acquire_run_lock(&pool)
        .await
        .unwrap()
        .expect("first acquire should succeed");

    let second = try_acquire_run_lock(&pool).await.unwrap();
    assert!(second.is_none(), "lock must not be granted twice");

    first.release().await.unwrap();

    let third = try_acquire_run_lock(&pool).await.unwrap();
    assert!(third.is_some(), "lock should be free after release");
    third.unwrap().release().await.unwrap();
}
