use std::collections::{BTreeSet, HashSet};
use std::sync::Mutex;

use chrono::TimeZone;
use medwh_core::RawRecord;

use super::*;

/// In-memory warehouse: upserts by `message_id`, rejects configured ids as
/// data errors, and can fail fatally on the Nth commit call.
#[derive(Default)]
struct FakeSink {
    bad_ids: HashSet<i64>,
    fatal_on_call: Option<usize>,
    calls: Mutex<usize>,
    stored: Mutex<BTreeSet<i64>>,
}

#[async_trait]
impl RecordSink for FakeSink {
    async fn commit(&self, batch: &[StagedRecord]) -> Result<u64, DbError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        if self.fatal_on_call == Some(call) {
            return Err(DbError::Sqlx(sqlx::Error::PoolTimedOut));
        }
        if batch
            .iter()
            .any(|s| self.bad_ids.contains(&s.record.message_id))
        {
            return Err(DbError::Sqlx(sqlx::Error::Encode(
                "value out of range".into(),
            )));
        }
        let mut stored = self.stored.lock().unwrap();
        for s in batch {
            stored.insert(s.record.message_id);
        }
        Ok(batch.len() as u64)
    }
}

impl FakeSink {
    fn stored(&self) -> Vec<i64> {
        self.stored.lock().unwrap().iter().copied().collect()
    }
}

fn ts(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 10, minute, 0).unwrap()
}

fn records(ids: std::ops::RangeInclusive<i64>) -> Vec<StagedRecord> {
    ids.map(|id| StagedRecord {
        record: RawRecord {
            message_id: id,
            source_id: "chemed".to_owned(),
            timestamp: ts(u32::try_from(id).unwrap()),
            text: format!("message {id}"),
            has_media: false,
            media_reference: None,
            view_count: 0,
            forward_count: 0,
            collected_at: ts(59),
            raw_payload: serde_json::json!({ "id": id }),
        },
        media: None,
    })
    .collect()
}

fn window_end() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
}

#[tokio::test]
async fn clean_load_commits_every_batch_and_targets_window_end() {
    let sink = FakeSink::default();
    let input = records(1..=10);

    let report = load(&input, 4, &sink, &CancellationToken::new()).await;

    assert_eq!(report.total_batches, 3);
    assert_eq!(report.committed_batches, 3);
    assert_eq!(report.committed_records, 10);
    assert!(report.is_complete());
    assert_eq!(report.cursor_target(window_end()), Some(window_end()));
    assert_eq!(report.prefix_end, Some(ts(10)));
    assert_eq!(report.prefix_last_message_id, Some(10));
    assert_eq!(sink.stored(), (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn data_errors_are_bisected_down_to_single_records() {
    let sink = FakeSink {
        bad_ids: HashSet::from([3, 6]),
        ..FakeSink::default()
    };
    let input = records(1..=8);

    let report = load(&input, 4, &sink, &CancellationToken::new()).await;

    assert!(report.is_complete());
    assert_eq!(report.committed_batches, 2);
    assert_eq!(report.committed_records, 6);
    let rejected: Vec<i64> = report.rejected.iter().map(|r| r.key.message_id).collect();
    assert_eq!(rejected, vec![3, 6]);
    assert_eq!(sink.stored(), vec![1, 2, 4, 5, 7, 8]);
    // Rejected records do not hold the cursor back.
    assert_eq!(report.cursor_target(window_end()), Some(window_end()));
}

#[tokio::test]
async fn fatal_error_stops_load_at_committed_prefix() {
    // Batches of 3: calls 1 and 2 commit records 1..=6, call 3 fails fatally.
    let sink = FakeSink {
        fatal_on_call: Some(3),
        ..FakeSink::default()
    };
    let input = records(1..=10);

    let report = load(&input, 3, &sink, &CancellationToken::new()).await;

    assert!(!report.is_complete());
    assert!(report.fatal.is_some());
    assert_eq!(report.committed_batches, 2);
    assert_eq!(report.committed_records, 6);
    assert_eq!(report.cursor_target(window_end()), Some(ts(6)));
    assert_eq!(report.prefix_last_message_id, Some(6));
    assert_eq!(*sink.calls.lock().unwrap(), 3);
}

#[tokio::test]
async fn fatal_error_during_bisection_keeps_committed_left_half() {
    // Call 1: batch 1..=4 fails on record 4. Call 2: 1..=2 commits.
    // Call 3: 3..=4 fails again. Call 4: record 3 hits the fatal error.
    let sink = FakeSink {
        bad_ids: HashSet::from([4]),
        fatal_on_call: Some(4),
        ..FakeSink::default()
    };
    let input = records(1..=4);

    let report = load(&input, 4, &sink, &CancellationToken::new()).await;

    assert_eq!(report.committed_batches, 0);
    assert_eq!(report.committed_records, 2);
    assert_eq!(report.cursor_target(window_end()), Some(ts(2)));
}

#[tokio::test]
async fn fatal_on_first_batch_leaves_cursor_alone() {
    let sink = FakeSink {
        fatal_on_call: Some(1),
        ..FakeSink::default()
    };
    let report = load(&records(1..=3), 10, &sink, &CancellationToken::new()).await;

    assert_eq!(report.cursor_target(window_end()), None);
    assert!(sink.stored().is_empty());
}

#[tokio::test]
async fn rerun_after_fatal_yields_full_set_without_duplicates() {
    let input = records(1..=10);
    let failing = FakeSink {
        fatal_on_call: Some(2),
        ..FakeSink::default()
    };
    let first = load(&input, 4, &failing, &CancellationToken::new()).await;
    let resume_from = first.cursor_target(window_end()).unwrap();

    // Re-fetch from the cursor inclusive, as the next collection window does.
    let retry: Vec<StagedRecord> = input
        .iter()
        .filter(|s| s.record.timestamp >= resume_from)
        .cloned()
        .collect();
    let healthy = FakeSink::default();
    for id in failing.stored() {
        healthy.stored.lock().unwrap().insert(id);
    }
    let second = load(&retry, 4, &healthy, &CancellationToken::new()).await;

    assert!(second.is_complete());
    assert_eq!(healthy.stored(), (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn cancellation_is_checked_between_batches() {
    let sink = FakeSink::default();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = load(&records(1..=5), 2, &sink, &cancel).await;

    assert!(report.cancelled);
    assert_eq!(report.committed_batches, 0);
    assert_eq!(report.cursor_target(window_end()), None);
    assert_eq!(*sink.calls.lock().unwrap(), 0);
}

#[tokio::test]
async fn empty_input_is_a_complete_load() {
    let sink = FakeSink::default();
    let report = load(&[], 100, &sink, &CancellationToken::new()).await;

    assert_eq!(report.total_batches, 0);
    assert!(report.is_complete());
    assert_eq!(report.cursor_target(window_end()), Some(window_end()));
}
