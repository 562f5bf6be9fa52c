//! [`MessageSource`] backed by a JSON message gateway.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Response, StatusCode};

use crate::error::CollectorError;
use crate::source::MessageSource;
use crate::types::{MediaPayload, MessagePage};

/// Fallback when a 429 carries no usable `Retry-After` header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// HTTP client for the message gateway.
///
/// Endpoints:
/// - `GET {base}/channels/{source}/messages?since=&until=&limit=[&offset=]`
/// - `GET {base}/channels/{source}/messages/{id}/media`
pub struct HttpMessageSource {
    client: Client,
    base_url: reqwest::Url,
    token: Option<String>,
}

impl HttpMessageSource {
    /// # Errors
    ///
    /// Returns [`CollectorError::InvalidBaseUrl`] if `base_url` does not parse,
    /// or [`CollectorError::Http`] if the client cannot be constructed.
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout_secs: u64,
        user_agent: &str,
    ) -> Result<Self, CollectorError> {
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url =
            reqwest::Url::parse(&normalized).map_err(|e| CollectorError::InvalidBaseUrl {
                url: base_url.to_owned(),
                reason: e.to_string(),
            })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(user_agent)
            .build()?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn endpoint(&self, path: &str) -> Result<reqwest::Url, CollectorError> {
        self.base_url
            .join(path)
            .map_err(|e| CollectorError::InvalidBaseUrl {
                url: self.base_url.to_string(),
                reason: e.to_string(),
            })
    }

    async fn send(&self, url: reqwest::Url) -> Result<Response, CollectorError> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?)
    }
}

/// Maps non-success statuses onto typed errors.
fn check_status(response: Response, source_id: &str) -> Result<Response, CollectorError> {
    let status = response.status();
    let url = response.url().to_string();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);

        return Err(CollectorError::RateLimited {
            source_id: source_id.to_owned(),
            retry_after_secs,
        });
    }

    if status == StatusCode::NOT_FOUND {
        return Err(CollectorError::NotFound { url });
    }

    if !status.is_success() {
        return Err(CollectorError::UnexpectedStatus {
            status: status.as_u16(),
            url,
        });
    }

    Ok(response)
}

#[async_trait]
impl MessageSource for HttpMessageSource {
    async fn list_messages(
        &self,
        source_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        offset: Option<&str>,
        limit: u32,
    ) -> Result<MessagePage, CollectorError> {
        let mut url = self.endpoint(&format!("channels/{source_id}/messages"))?;
        url.query_pairs_mut()
            .append_pair("since", &since.to_rfc3339_opts(SecondsFormat::Secs, true))
            .append_pair("until", &until.to_rfc3339_opts(SecondsFormat::Secs, true))
            .append_pair("limit", &limit.to_string());
        if let Some(offset) = offset {
            url.query_pairs_mut().append_pair("offset", offset);
        }

        let response = check_status(self.send(url).await?, source_id)?;
        let body = response.text().await?;
        serde_json::from_str::<MessagePage>(&body).map_err(|e| CollectorError::Deserialize {
            context: format!("message page for {source_id}"),
            source: e,
        })
    }

    async fn fetch_media(
        &self,
        source_id: &str,
        message_id: i64,
    ) -> Result<MediaPayload, CollectorError> {
        let url = self.endpoint(&format!(
            "channels/{source_id}/messages/{message_id}/media"
        ))?;

        let response = check_status(self.send(url).await?, source_id)?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let bytes = response.bytes().await?.to_vec();

        Ok(MediaPayload {
            bytes,
            content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gains_trailing_slash_so_paths_join_under_it() {
        let source =
            HttpMessageSource::new("http://gateway.local/api", None, 5, "medwh-test").unwrap();
        let url = source.endpoint("channels/chemed/messages").unwrap();
        assert_eq!(url.as_str(), "http://gateway.local/api/channels/chemed/messages");
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let result = HttpMessageSource::new("not a url", None, 5, "medwh-test");
        assert!(matches!(result, Err(CollectorError::InvalidBaseUrl { .. })));
    }
}
