use common::model::config::UpstreamConfig;
use errors::{Result, UpstreamError};
use log::{debug, warn};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Thin client over the upstream video platform's REST API. Transports are
/// supplied per call because every account rides its own proxy-bound
/// `reqwest::Client`.
pub struct PlatformClient {
    config: UpstreamConfig,
}

#[derive(Debug, Deserialize)]
struct InsertResponse {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<ListItem>,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    id: Option<String>,
    snippet: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

impl PlatformClient {
    pub fn new(config: UpstreamConfig) -> Self {
        Self { config }
    }

    fn classify_error(status: u16, body: String) -> UpstreamError {
        if body.contains("quotaExceeded") || body.contains("dailyLimitExceeded") {
            return UpstreamError::QuotaExceeded;
        }
        let lowered = body.to_lowercase();
        if lowered.contains("duplicate") || lowered.contains("processingfailure") {
            return UpstreamError::DuplicateContent;
        }
        UpstreamError::InvalidStatus { status, body }
    }

    /// `commentThreads.insert` (or `comments.insert` for replies). Returns
    /// the upstream comment id.
    pub async fn insert_comment(
        &self,
        transport: &reqwest::Client,
        access_token: &str,
        video_id: &str,
        text: &str,
        parent_id: Option<&str>,
    ) -> Result<String> {
        let (url, body) = match parent_id {
            Some(parent) => (
                format!("{}/comments?part=snippet", self.config.api_base_url),
                json!({
                    "snippet": {
                        "parentId": parent,
                        "textOriginal": text,
                    }
                }),
            ),
            None => (
                format!("{}/commentThreads?part=snippet", self.config.api_base_url),
                json!({
                    "snippet": {
                        "videoId": video_id,
                        "topLevelComment": {
                            "snippet": { "textOriginal": text }
                        }
                    }
                }),
            ),
        };

        let response = transport
            .post(&url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| UpstreamError::RequestFailed(Box::new(e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_error(status.as_u16(), body).into());
        }

        let parsed: InsertResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::RequestFailed(Box::new(e)))?;
        parsed
            .id
            .ok_or_else(|| UpstreamError::EmptyResponse.into())
    }

    /// `videos.rate(id, like)` for auto-like on views.
    pub async fn rate_video_like(
        &self,
        transport: &reqwest::Client,
        access_token: &str,
        video_id: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/videos/rate?id={}&rating=like",
            self.config.api_base_url, video_id
        );
        let response = transport
            .post(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| UpstreamError::RequestFailed(Box::new(e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_error(status.as_u16(), body).into());
        }
        Ok(())
    }

    /// `videos.list(part=snippet)` title lookup with bounded retries; the
    /// AI generator tolerates failure, so three attempts with 1/2/4s
    /// backoff is the whole budget.
    pub async fn video_title(
        &self,
        transport: &reqwest::Client,
        api_key: &str,
        video_id: &str,
    ) -> Result<String> {
        let url = format!(
            "{}/videos?part=snippet&id={}&key={}",
            self.config.api_base_url, video_id, api_key
        );

        let mut last_err: Option<errors::Error> = None;
        for attempt in 0..3u32 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
            }
            match self.try_video_title(transport, &url).await {
                Ok(title) => return Ok(title),
                Err(e) => {
                    warn!(
                        "Title lookup for {} failed (attempt {}): {}",
                        video_id,
                        attempt + 1,
                        e
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| UpstreamError::VideoNotFound(video_id.to_string()).into()))
    }

    async fn try_video_title(&self, transport: &reqwest::Client, url: &str) -> Result<String> {
        let response = transport
            .get(url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| UpstreamError::RequestFailed(Box::new(e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_error(status.as_u16(), body).into());
        }

        let parsed: ListResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::RequestFailed(Box::new(e)))?;
        parsed
            .items
            .into_iter()
            .next()
            .and_then(|item| item.snippet)
            .and_then(|snippet| {
                snippet
                    .get("title")
                    .and_then(|t| t.as_str())
                    .map(String::from)
            })
            .ok_or_else(|| UpstreamError::EmptyResponse.into())
    }

    /// `channels.list(mine=true)`; fills channel id/title during account
    /// verification.
    pub async fn verify_channel(
        &self,
        transport: &reqwest::Client,
        access_token: &str,
    ) -> Result<(String, String)> {
        let url = format!("{}/channels?part=snippet&mine=true", self.config.api_base_url);
        let response = transport
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| UpstreamError::RequestFailed(Box::new(e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_error(status.as_u16(), body).into());
        }

        let parsed: ListResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::RequestFailed(Box::new(e)))?;
        let item = parsed
            .items
            .into_iter()
            .next()
            .ok_or(UpstreamError::EmptyResponse)?;
        let channel_id = item.id.unwrap_or_default();
        let title = item
            .snippet
            .as_ref()
            .and_then(|s| s.get("title"))
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        debug!("Verified channel {} ({})", channel_id, title);
        Ok((channel_id, title))
    }

    /// OAuth refresh-token grant. Returns `(access_token, expires_in_secs)`.
    pub async fn refresh_access_token(
        &self,
        transport: &reqwest::Client,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<(String, Option<i64>)> {
        let response = transport
            .post(&self.config.oauth_token_url)
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| errors::TokenError::RefreshFailed(Box::new(e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(errors::TokenError::RefreshRejected(format!("{status}: {body}")).into());
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| errors::TokenError::RefreshFailed(Box::new(e)))?;
        Ok((parsed.access_token, parsed.expires_in))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_errors_classify_from_body() {
        let err = PlatformClient::classify_error(
            403,
            r#"{"error":{"errors":[{"reason":"quotaExceeded"}]}}"#.to_string(),
        );
        assert!(matches!(err, UpstreamError::QuotaExceeded));

        let err = PlatformClient::classify_error(403, "dailyLimitExceeded".to_string());
        assert!(matches!(err, UpstreamError::QuotaExceeded));
    }

    #[test]
    fn duplicate_errors_classify_from_body() {
        let err = PlatformClient::classify_error(
            400,
            r#"{"error":{"errors":[{"reason":"processingFailure"}]}}"#.to_string(),
        );
        assert!(matches!(err, UpstreamError::DuplicateContent));
    }

    #[test]
    fn other_errors_keep_status_and_body() {
        let err = PlatformClient::classify_error(500, "boom".to_string());
        match err {
            UpstreamError::InvalidStatus { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
