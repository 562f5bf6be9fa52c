//! Aggregate statistics over one enrichment run.

use std::collections::{BTreeMap, HashMap};

use medwh_core::DetectionRecord;
use serde::{Deserialize, Serialize};

const TOP_LABELS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelCount {
    pub label: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceStats {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichSummary {
    pub images_pending: usize,
    pub images_processed: usize,
    /// Missing, unreadable or undecodable images.
    pub images_skipped: usize,
    /// Images whose detector call failed after retries.
    pub images_failed: usize,
    pub total_detections: usize,
    pub category_distribution: BTreeMap<String, usize>,
    /// Most frequent labels, highest count first (ties by label).
    pub top_labels: Vec<LabelCount>,
    pub confidence: Option<ConfidenceStats>,
}

/// Accumulates classified records into an [`EnrichSummary`].
#[derive(Debug, Default)]
pub struct SummaryBuilder {
    summary: EnrichSummary,
    label_counts: HashMap<String, usize>,
    confidences: Vec<f64>,
}

impl SummaryBuilder {
    #[must_use]
    pub fn new(images_pending: usize) -> Self {
        Self {
            summary: EnrichSummary {
                images_pending,
                ..EnrichSummary::default()
            },
            ..Self::default()
        }
    }

    pub fn record(&mut self, record: &DetectionRecord) {
        self.summary.images_processed += 1;
        *self
            .summary
            .category_distribution
            .entry(record.category.as_str().to_owned())
            .or_insert(0) += 1;
        for detection in &record.detected_objects {
            self.summary.total_detections += 1;
            *self.label_counts.entry(detection.label.clone()).or_insert(0) += 1;
            self.confidences.push(detection.confidence);
        }
    }

    pub fn skipped(&mut self) {
        self.summary.images_skipped += 1;
    }

    pub fn failed(&mut self) {
        self.summary.images_failed += 1;
    }

    #[must_use]
    pub fn finish(mut self) -> EnrichSummary {
        let mut labels: Vec<LabelCount> = self
            .label_counts
            .into_iter()
            .map(|(label, count)| LabelCount { label, count })
            .collect();
        labels.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
        labels.truncate(TOP_LABELS);
        self.summary.top_labels = labels;
        self.summary.confidence = confidence_stats(&self.confidences);
        self.summary
    }
}

#[allow(clippy::cast_precision_loss)]
fn confidence_stats(values: &[f64]) -> Option<ConfidenceStats> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(ConfidenceStats {
        mean,
        std: variance.sqrt(),
        min,
        max,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use medwh_core::{BoundingBox, Detection, ImageCategory, RecordKey};

    fn record(labels: &[(&str, f64)], category: ImageCategory) -> DetectionRecord {
        let key = RecordKey {
            message_id: 1,
            source_id: "chemed".to_string(),
        };
        let detections = labels
            .iter()
            .map(|(label, confidence)| Detection {
                label: (*label).to_string(),
                confidence: *confidence,
                bbox: BoundingBox([0.0, 0.0, 1.0, 1.0]),
            })
            .collect();
        DetectionRecord::new(&key, "img.jpg", detections, category, Utc::now())
    }

    #[test]
    fn summary_aggregates_categories_labels_and_confidence() {
        let mut builder = SummaryBuilder::new(4);
        builder.record(&record(
            &[("bottle", 0.5), ("person", 0.9)],
            ImageCategory::Promotional,
        ));
        builder.record(&record(&[("bottle", 0.7)], ImageCategory::ProductDisplay));
        builder.skipped();
        builder.failed();

        let summary = builder.finish();

        assert_eq!(summary.images_pending, 4);
        assert_eq!(summary.images_processed, 2);
        assert_eq!(summary.images_skipped, 1);
        assert_eq!(summary.images_failed, 1);
        assert_eq!(summary.total_detections, 3);
        assert_eq!(summary.category_distribution["promotional"], 1);
        assert_eq!(summary.category_distribution["product_display"], 1);
        assert_eq!(
            summary.top_labels[0],
            LabelCount {
                label: "bottle".to_string(),
                count: 2
            }
        );

        let confidence = summary.confidence.expect("has detections");
        assert!((confidence.mean - 0.7).abs() < 1e-9);
        assert!((confidence.min - 0.5).abs() < f64::EPSILON);
        assert!((confidence.max - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn top_labels_are_capped_at_ten() {
        let mut builder = SummaryBuilder::new(1);
        let labels: Vec<(String, f64)> = (0..15).map(|i| (format!("l{i:02}"), 0.5)).collect();
        let borrowed: Vec<(&str, f64)> = labels.iter().map(|(l, c)| (l.as_str(), *c)).collect();
        builder.record(&record(&borrowed, ImageCategory::Other));

        let summary = builder.finish();
        assert_eq!(summary.top_labels.len(), 10);
        assert_eq!(summary.top_labels[0].label, "l00");
    }

    #[test]
    fn empty_run_has_no_confidence_stats() {
        let summary = SummaryBuilder::new(0).finish();
        assert!(summary.confidence.is_none());
        assert!(summary.top_labels.is_empty());
    }
}
