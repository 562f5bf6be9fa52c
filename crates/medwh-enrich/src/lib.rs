pub mod classify;
pub mod detector;
pub mod error;
pub(crate) mod retry;
pub mod rules;
pub mod summary;

pub use classify::{
    classify, run_enrichment, DetectionStore, EnrichSettings, PendingImage,
};
pub use detector::{Detector, HttpDetector};
pub use error::EnrichError;
pub use rules::{categorize, LabelGroup, Rule, RULES};
pub use summary::{ConfidenceStats, EnrichSummary, LabelCount};
