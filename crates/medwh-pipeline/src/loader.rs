//! Batched, idempotent loading of staged records into the warehouse.
//!
//! Records are committed in fixed-size batches, one transaction each. A
//! batch rejected for its data is split in halves until the offending
//! records are isolated; everything else in it still commits. Any other
//! storage error stops the load, and the report says how far it got.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use medwh_core::{RecordKey, StagedRecord};
use medwh_db::DbError;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

/// Destination for one atomic batch of records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Commits `batch` in a single transaction, returning the rows written.
    async fn commit(&self, batch: &[StagedRecord]) -> Result<u64, DbError>;
}

#[async_trait]
impl RecordSink for PgPool {
    async fn commit(&self, batch: &[StagedRecord]) -> Result<u64, DbError> {
        medwh_db::upsert_staged_batch(self, batch).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub key: RecordKey,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    pub total_records: usize,
    pub total_batches: usize,
    /// Leading batches that were fully handled (committed or rejected).
    pub committed_batches: usize,
    pub committed_records: u64,
    pub rejected: Vec<RejectedRecord>,
    /// Storage error that stopped the load.
    pub fatal: Option<String>,
    pub cancelled: bool,
    /// Timestamp of the last record in the longest fully handled prefix.
    pub prefix_end: Option<DateTime<Utc>>,
    /// Message id of that same record.
    pub prefix_last_message_id: Option<i64>,
}

impl LoadReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.fatal.is_none() && !self.cancelled
    }

    /// Where the source cursor may move after this load.
    ///
    /// A complete load covers the whole window, so the cursor goes to
    /// `window_end`. Otherwise only the committed prefix is safe.
    #[must_use]
    pub fn cursor_target(&self, window_end: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.is_complete() {
            Some(window_end)
        } else {
            self.prefix_end
        }
    }
}

/// Loads `records` (sorted by timestamp) through `sink` in batches of
/// `batch_size`.
///
/// Cancellation is honoured between batches only; a started batch always
/// commits or rolls back as a unit.
pub async fn load(
    records: &[StagedRecord],
    batch_size: usize,
    sink: &dyn RecordSink,
    cancel: &CancellationToken,
) -> LoadReport {
    let batch_size = batch_size.max(1);
    let mut report = LoadReport {
        total_records: records.len(),
        total_batches: records.len().div_ceil(batch_size),
        ..LoadReport::default()
    };

    let mut handled = 0usize;
    for (batch_index, start) in (0..records.len()).step_by(batch_size).enumerate() {
        if cancel.is_cancelled() {
            tracing::info!(batch = batch_index, "load cancelled between batches");
            report.cancelled = true;
            break;
        }

        let end = (start + batch_size).min(records.len());
        match commit_with_bisection(records, start, end, sink, &mut report).await {
            Ok(()) => {
                handled = end;
                report.committed_batches += 1;
                tracing::debug!(
                    batch = batch_index,
                    records = end - start,
                    "batch committed"
                );
            }
            Err((failed_at, e)) => {
                handled = failed_at;
                tracing::error!(
                    batch = batch_index,
                    committed_batches = report.committed_batches,
                    error = %e,
                    "fatal storage error; stopping load"
                );
                report.fatal = Some(e.to_string());
                break;
            }
        }
    }

    if let Some(last) = handled.checked_sub(1).map(|i| &records[i].record) {
        report.prefix_end = Some(last.timestamp);
        report.prefix_last_message_id = Some(last.message_id);
    }
    report
}

/// Commits `records[start..end]`, splitting on data errors.
///
/// On a fatal error returns the index of the first record that was not
/// handled.
async fn commit_with_bisection(
    records: &[StagedRecord],
    start: usize,
    end: usize,
    sink: &dyn RecordSink,
    report: &mut LoadReport,
) -> Result<(), (usize, DbError)> {
    // Left halves are pushed last so ranges are handled in record order.
    let mut stack = vec![(start, end)];
    while let Some((lo, hi)) = stack.pop() {
        match sink.commit(&records[lo..hi]).await {
            Ok(written) => report.committed_records += written,
            Err(e) if e.is_data_error() => {
                if hi - lo == 1 {
                    let record = &records[lo].record;
                    tracing::warn!(
                        source = %record.source_id,
                        message_id = record.message_id,
                        error = %e,
                        "record rejected"
                    );
                    report.rejected.push(RejectedRecord {
                        key: record.key(),
                        reason: e.to_string(),
                    });
                } else {
                    let mid = lo + (hi - lo) / 2;
                    tracing::debug!(from = lo, to = hi, error = %e, "data error; bisecting batch");
                    stack.push((mid, hi));
                    stack.push((lo, mid));
                }
            }
            Err(e) => return Err((lo, e)),
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "loader_test.rs"]
mod tests;
