//! Thin adapter over the Mastodon-compatible REST surface.
//!
//! Presents the handful of operations the bot needs behind one trait so
//! the publisher and the Mastodon parser never care which server dialect
//! (Mastodon, Pleroma, Firefish) is on the other end. The differences are
//! small and absorbed here: Pleroma and Firefish accept a `content_type`
//! on status creation, Firefish rejects the `language` field.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::config::AppConfig;
use crate::error::{ApiError, ConfigError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceType {
    Mastodon,
    Pleroma,
    Firefish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Unlisted,
    Private,
    Direct,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Unlisted => "unlisted",
            Visibility::Private => "private",
            Visibility::Direct => "direct",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ContentType {
    #[serde(rename = "text/plain")]
    Plain,
    #[serde(rename = "text/markdown")]
    Markdown,
    #[serde(rename = "text/html")]
    Html,
    #[serde(rename = "text/bbcode")]
    Bbcode,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Plain => "text/plain",
            ContentType::Markdown => "text/markdown",
            ContentType::Html => "text/html",
            ContentType::Bbcode => "text/bbcode",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub acct: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Status {
    pub id: String,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub visibility: String,
    #[serde(default)]
    pub in_reply_to_id: Option<String>,
    #[serde(default)]
    pub in_reply_to_account_id: Option<String>,
    #[serde(default)]
    pub reblog: Option<Box<Status>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaAttachment {
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct StatusParams {
    pub status: String,
    pub language: Option<String>,
    pub in_reply_to_id: Option<String>,
    pub media_ids: Vec<String>,
    pub visibility: Visibility,
    pub content_type: ContentType,
    /// Stable key so a crash between posting and saving the queue cannot
    /// double-publish on the next run; the server dedups on it.
    pub idempotency_key: Option<String>,
}

#[derive(Debug)]
pub struct MediaUpload {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub mime_type: Option<String>,
    pub description: Option<String>,
    pub focus: Option<(f32, f32)>,
}

/// The minimum remote surface the bot uses.
#[async_trait]
pub trait FediverseApi: Send + Sync {
    async fn verify_credentials(&self) -> Result<Account, ApiError>;
    async fn account_search(&self, query: &str) -> Result<Vec<Account>, ApiError>;
    async fn account_statuses(
        &self,
        account_id: &str,
        since_id: Option<&str>,
    ) -> Result<Vec<Status>, ApiError>;
    async fn account_following(&self, account_id: &str) -> Result<Vec<Account>, ApiError>;
    async fn account_follow(&self, account_id: &str) -> Result<(), ApiError>;
    async fn status_post(&self, params: StatusParams) -> Result<Status, ApiError>;
    async fn status_reblog(&self, status_id: &str) -> Result<Status, ApiError>;
    async fn media_post(&self, upload: MediaUpload) -> Result<MediaAttachment, ApiError>;
}

pub struct MastodonClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    instance_type: InstanceType,
}

impl MastodonClient {
    pub fn new(app: &AppConfig) -> Result<Self, ConfigError> {
        if app.api_base_url.is_empty() {
            return Err(ConfigError::Invalid(
                "app.api_base_url is required".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(app.name.clone())
            .build()
            .map_err(|e| ConfigError::Invalid(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: app.api_base_url.trim_end_matches('/').to_string(),
            token: app.access_token.clone(),
            instance_type: app.instance_type,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        endpoint: &str,
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl FediverseApi for MastodonClient {
    async fn verify_credentials(&self) -> Result<Account, ApiError> {
        let endpoint = self.endpoint("/api/v1/accounts/verify_credentials");
        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::parse_response(&endpoint, response).await
    }

    async fn account_search(&self, query: &str) -> Result<Vec<Account>, ApiError> {
        let endpoint = self.endpoint("/api/v1/accounts/search");
        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(&self.token)
            .query(&[("q", query)])
            .send()
            .await?;
        Self::parse_response(&endpoint, response).await
    }

    async fn account_statuses(
        &self,
        account_id: &str,
        since_id: Option<&str>,
    ) -> Result<Vec<Status>, ApiError> {
        let endpoint = self.endpoint(&format!("/api/v1/accounts/{account_id}/statuses"));
        let mut request = self.http.get(&endpoint).bearer_auth(&self.token);
        if let Some(since) = since_id {
            request = request.query(&[("since_id", since)]);
        }
        let response = request.send().await?;
        Self::parse_response(&endpoint, response).await
    }

    async fn account_following(&self, account_id: &str) -> Result<Vec<Account>, ApiError> {
        let endpoint = self.endpoint(&format!("/api/v1/accounts/{account_id}/following"));
        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::parse_response(&endpoint, response).await
    }

    async fn account_follow(&self, account_id: &str) -> Result<(), ApiError> {
        let endpoint = self.endpoint(&format!("/api/v1/accounts/{account_id}/follow"));
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "reblogs": true }))
            .send()
            .await?;
        // The response is the relationship document; only success matters.
        let _: serde_json::Value = Self::parse_response(&endpoint, response).await?;
        Ok(())
    }

    async fn status_post(&self, params: StatusParams) -> Result<Status, ApiError> {
        let endpoint = self.endpoint("/api/v1/statuses");

        let mut body = serde_json::json!({
            "status": params.status,
            "visibility": params.visibility.as_str(),
        });
        if let Some(reply_to) = &params.in_reply_to_id {
            body["in_reply_to_id"] = serde_json::json!(reply_to);
        }
        if !params.media_ids.is_empty() {
            body["media_ids"] = serde_json::json!(params.media_ids);
        }
        match self.instance_type {
            InstanceType::Mastodon => {
                if let Some(language) = &params.language {
                    body["language"] = serde_json::json!(language);
                }
            }
            InstanceType::Pleroma => {
                if let Some(language) = &params.language {
                    body["language"] = serde_json::json!(language);
                }
                body["content_type"] = serde_json::json!(params.content_type.as_str());
            }
            InstanceType::Firefish => {
                body["content_type"] = serde_json::json!(params.content_type.as_str());
            }
        }

        let mut request = self.http.post(&endpoint).bearer_auth(&self.token).json(&body);
        if let Some(key) = &params.idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        let response = request.send().await?;
        Self::parse_response(&endpoint, response).await
    }

    async fn status_reblog(&self, status_id: &str) -> Result<Status, ApiError> {
        let endpoint = self.endpoint(&format!("/api/v1/statuses/{status_id}/reblog"));
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::parse_response(&endpoint, response).await
    }

    async fn media_post(&self, upload: MediaUpload) -> Result<MediaAttachment, ApiError> {
        let endpoint = self.endpoint("/api/v2/media");

        let mut part = reqwest::multipart::Part::bytes(upload.bytes).file_name(upload.file_name);
        if let Some(mime) = &upload.mime_type {
            part = part.mime_str(mime)?;
        }

        let mut form = reqwest::multipart::Form::new().part("file", part);
        if let Some(description) = upload.description {
            form = form.text("description", description);
        }
        if let Some((x, y)) = upload.focus {
            form = form.text("focus", format!("{x},{y}"));
        }

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?;
        Self::parse_response(&endpoint, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_type_parses_lowercase() {
        let t: InstanceType = serde_yaml::from_str("pleroma").expect("parse");
        assert_eq!(t, InstanceType::Pleroma);
        assert!(serde_yaml::from_str::<InstanceType>("akkoma").is_err());
    }

    #[test]
    fn content_type_uses_mime_like_names() {
        let t: ContentType = serde_yaml::from_str("text/markdown").expect("parse");
        assert_eq!(t, ContentType::Markdown);
        assert_eq!(t.as_str(), "text/markdown");
    }

    #[test]
    fn client_requires_a_base_url() {
        let app = AppConfig::default();
        assert!(MastodonClient::new(&app).is_err());
    }
}
