//! Date-partitioned JSON staging area between collection and loading.
//!
//! Layout: `<messages_dir>/<YYYY-MM-DD>/<source_id>.json`, one array of
//! [`StagedRecord`] per file, partitioned by the record's UTC date and sorted
//! by `(timestamp, message_id)`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use medwh_core::StagedRecord;

use crate::error::CollectorError;

#[must_use]
pub fn staged_path(messages_dir: &Path, date: NaiveDate, source_id: &str) -> PathBuf {
    messages_dir
        .join(date.format("%Y-%m-%d").to_string())
        .join(format!("{source_id}.json"))
}

/// Writes a pass's records into the staging area and returns the files
/// touched, oldest partition first.
///
/// Records already staged for the same day are merged; on a repeated
/// `message_id` the newer copy wins. Each file is replaced atomically.
///
/// # Errors
///
/// Returns [`CollectorError::Io`] on filesystem failures and
/// [`CollectorError::Deserialize`] if an existing file is corrupt.
pub async fn stage_pass(
    messages_dir: &Path,
    source_id: &str,
    records: &[StagedRecord],
) -> Result<Vec<PathBuf>, CollectorError> {
    let mut by_date: BTreeMap<NaiveDate, Vec<&StagedRecord>> = BTreeMap::new();
    for staged in records {
        by_date
            .entry(staged.record.timestamp.date_naive())
            .or_default()
            .push(staged);
    }

    let mut written = Vec::with_capacity(by_date.len());
    for (date, day_records) in by_date {
        let path = staged_path(messages_dir, date, source_id);

        let mut merged: HashMap<i64, StagedRecord> = HashMap::new();
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| CollectorError::io(&path, e))?
        {
            for existing in read_staged_file(&path).await? {
                merged.insert(existing.record.message_id, existing);
            }
        }
        for staged in day_records {
            merged.insert(staged.record.message_id, staged.clone());
        }

        let mut merged: Vec<StagedRecord> = merged.into_values().collect();
        merged.sort_by(|a, b| {
            (a.record.timestamp, a.record.message_id)
                .cmp(&(b.record.timestamp, b.record.message_id))
        });

        write_atomically(&path, &merged).await?;
        tracing::debug!(
            source = source_id,
            path = %path.display(),
            records = merged.len(),
            "staged partition written"
        );
        written.push(path);
    }

    Ok(written)
}

/// Reads one staged partition file.
///
/// # Errors
///
/// Returns [`CollectorError::Io`] if the file cannot be read, or
/// [`CollectorError::Deserialize`] if it is not a valid record array.
pub async fn read_staged_file(path: &Path) -> Result<Vec<StagedRecord>, CollectorError> {
    let content = tokio::fs::read(path)
        .await
        .map_err(|e| CollectorError::io(path, e))?;
    serde_json::from_slice(&content).map_err(|e| CollectorError::Deserialize {
        context: format!("staged file {}", path.display()),
        source: e,
    })
}

/// Lists the partition files of `source_id` modified strictly after
/// `since` (all of them when `since` is `None`), oldest partition first.
///
/// Files can land in the staging area from outside a collection pass, so
/// loaders use this to pick up everything not yet loaded. A missing
/// `messages_dir` yields an empty list.
///
/// # Errors
///
/// Returns [`CollectorError::Io`] if the directory or a file's metadata
/// cannot be read.
pub async fn partitions_modified_since(
    messages_dir: &Path,
    source_id: &str,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<PathBuf>, CollectorError> {
    if !tokio::fs::try_exists(messages_dir)
        .await
        .map_err(|e| CollectorError::io(messages_dir, e))?
    {
        return Ok(Vec::new());
    }

    let file_name = format!("{source_id}.json");
    let mut found = Vec::new();
    let mut days = tokio::fs::read_dir(messages_dir)
        .await
        .map_err(|e| CollectorError::io(messages_dir, e))?;
    while let Some(day) = days
        .next_entry()
        .await
        .map_err(|e| CollectorError::io(messages_dir, e))?
    {
        let path = day.path().join(&file_name);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(CollectorError::io(&path, e)),
        };
        let modified = metadata
            .modified()
            .map_err(|e| CollectorError::io(&path, e))?;
        // Watermarks are stored with microsecond precision.
        let modified = DateTime::<Utc>::from(modified).trunc_subsecs(6);
        if since.is_none_or(|s| modified > s) {
            found.push(path);
        }
    }

    found.sort();
    Ok(found)
}

async fn write_atomically(path: &Path, records: &[StagedRecord]) -> Result<(), CollectorError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CollectorError::io(parent, e))?;
    }

    let body = serde_json::to_vec_pretty(records).map_err(|e| CollectorError::Deserialize {
        context: format!("serializing {}", path.display()),
        source: e,
    })?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body)
        .await
        .map_err(|e| CollectorError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| CollectorError::io(path, e))
}
