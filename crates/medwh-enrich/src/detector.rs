//! Object-detection capability consumed over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use medwh_core::{BoundingBox, Detection};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::error::EnrichError;

/// Image in, labeled boxes out.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Verifies the detector is reachable and ready.
    async fn health(&self) -> Result<(), EnrichError>;

    /// Runs detection on encoded image bytes.
    ///
    /// `media_reference` is only used for error reporting.
    async fn detect(&self, media_reference: &str, image: Vec<u8>)
        -> Result<Vec<Detection>, EnrichError>;
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<WireDetection>,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    #[serde(alias = "class_name")]
    label: String,
    confidence: f64,
    bbox: [f64; 4],
}

impl From<WireDetection> for Detection {
    fn from(wire: WireDetection) -> Self {
        Detection {
            label: wire.label,
            confidence: wire.confidence,
            bbox: BoundingBox(wire.bbox),
        }
    }
}

/// Client for an inference service exposing `GET /health` and
/// `POST /detect` (raw image body).
pub struct HttpDetector {
    client: Client,
    base_url: String,
}

impl HttpDetector {
    /// # Errors
    ///
    /// Returns [`EnrichError::Http`] if the client cannot be constructed.
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, EnrichError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn health(&self) -> Result<(), EnrichError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EnrichError::DetectorUnavailable(format!("{url}: {e}")))?;

        if !response.status().is_success() {
            return Err(EnrichError::DetectorUnavailable(format!(
                "{url} returned status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn detect(
        &self,
        media_reference: &str,
        image: Vec<u8>,
    ) -> Result<Vec<Detection>, EnrichError> {
        let url = format!("{}/detect", self.base_url);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            return Err(EnrichError::UndecodableImage {
                media_reference: media_reference.to_owned(),
            });
        }
        if !status.is_success() {
            return Err(EnrichError::UnexpectedStatus {
                status: status.as_u16(),
                url,
            });
        }

        let body = response.text().await?;
        let parsed: DetectResponse =
            serde_json::from_str(&body).map_err(|e| EnrichError::Deserialize {
                context: format!("detections for {media_reference}"),
                source: e,
            })?;

        Ok(parsed.detections.into_iter().map(Detection::from).collect())
    }
}
