//! Typed records exchanged between the collector, loader and classifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Composite identity of a message: `(message_id, source_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub message_id: i64,
    pub source_id: String,
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.source_id, self.message_id)
    }
}

/// A normalized message as collected from a source.
///
/// `text`, `has_media`, `media_reference`, the counters, `collected_at` and
/// `raw_payload` are mutable on re-collection; the key and `timestamp` are not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub message_id: i64,
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub has_media: bool,
    pub media_reference: Option<String>,
    pub view_count: i64,
    pub forward_count: i64,
    pub collected_at: DateTime<Utc>,
    pub raw_payload: serde_json::Value,
}

impl RawRecord {
    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey {
            message_id: self.message_id,
            source_id: self.source_id.clone(),
        }
    }
}

/// A downloaded photo owned by a [`RawRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAsset {
    pub message_id: i64,
    pub source_id: String,
    pub media_reference: String,
    pub content_sha256: String,
    pub byte_size: i64,
}

/// A record as written to the staging area: the message plus its media asset, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedRecord {
    #[serde(flatten)]
    pub record: RawRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaAsset>,
}

/// Axis-aligned box in pixel coordinates, serialized as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoundingBox(pub [f64; 4]);

impl BoundingBox {
    #[must_use]
    pub fn width(&self) -> f64 {
        (self.0[2] - self.0[0]).max(0.0)
    }

    #[must_use]
    pub fn height(&self) -> f64 {
        (self.0[3] - self.0[1]).max(0.0)
    }
}

/// One labeled object returned by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f64,
    pub bbox: BoundingBox,
}

/// Category derived from the set of detected labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageCategory {
    Promotional,
    ProductDisplay,
    Lifestyle,
    MedicalTools,
    Other,
}

impl ImageCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ImageCategory::Promotional => "promotional",
            ImageCategory::ProductDisplay => "product_display",
            ImageCategory::Lifestyle => "lifestyle",
            ImageCategory::MedicalTools => "medical_tools",
            ImageCategory::Other => "other",
        }
    }
}

impl std::fmt::Display for ImageCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ImageCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "promotional" => Ok(ImageCategory::Promotional),
            "product_display" => Ok(ImageCategory::ProductDisplay),
            "lifestyle" => Ok(ImageCategory::Lifestyle),
            "medical_tools" => Ok(ImageCategory::MedicalTools),
            "other" => Ok(ImageCategory::Other),
            other => Err(format!("unknown image category: {other}")),
        }
    }
}

/// Detection output for one image, keyed by `(message_id, source_id, media_reference)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub message_id: i64,
    pub source_id: String,
    pub media_reference: String,
    pub detected_objects: Vec<Detection>,
    pub detection_count: i32,
    pub category: ImageCategory,
    pub processed_at: DateTime<Utc>,
}

impl DetectionRecord {
    #[must_use]
    pub fn new(
        key: &RecordKey,
        media_reference: &str,
        detected_objects: Vec<Detection>,
        category: ImageCategory,
        processed_at: DateTime<Utc>,
    ) -> Self {
        let detection_count = i32::try_from(detected_objects.len()).unwrap_or(i32::MAX);
        Self {
            message_id: key.message_id,
            source_id: key.source_id.clone(),
            media_reference: media_reference.to_string(),
            detected_objects,
            detection_count,
            category,
            processed_at,
        }
    }
}
