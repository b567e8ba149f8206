//! HTTP client for the meal server.
//!
//! `PUT /meals/{id}` upserts, `DELETE /meals/{id}` removes and `GET /health`
//! answers reachability probes. Every request carries the API key as a bearer
//! token.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use mealsync_core::{MealPayload, RemoteError, RemoteWritePort};

use crate::config::SyncConfig;

/// Errors building an [`HttpRemote`].
#[derive(Debug)]
pub enum HttpRemoteError {
    /// Sync is not configured
    NotConfigured,
    /// The HTTP client could not be built
    Client(reqwest::Error),
}

impl std::fmt::Display for HttpRemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpRemoteError::NotConfigured => write!(
                f,
                "Sync not configured. Add server_url and api_key to config."
            ),
            HttpRemoteError::Client(e) => write!(f, "HTTP client error: {}", e),
        }
    }
}

impl std::error::Error for HttpRemoteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HttpRemoteError::NotConfigured => None,
            HttpRemoteError::Client(e) => Some(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    server_url: String,
    api_key: String,
}

impl HttpRemote {
    pub fn new(
        server_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, HttpRemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(HttpRemoteError::Client)?;

        Ok(Self {
            client,
            server_url: server_url.into(),
            api_key: api_key.into(),
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, HttpRemoteError> {
        let server_url = config
            .server_url
            .clone()
            .ok_or(HttpRemoteError::NotConfigured)?;
        let api_key = config
            .api_key
            .clone()
            .ok_or(HttpRemoteError::NotConfigured)?;

        Self::new(server_url, api_key, config.request_timeout())
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// True if the server answers its health check with a success status.
    pub async fn check_health(&self) -> bool {
        let result = self
            .client
            .get(self.build_url("/health"))
            .bearer_auth(&self.api_key)
            .send()
            .await;

        match result {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "Health check failed");
                false
            }
        }
    }

    /// Builds an HTTP URL for a given path.
    fn build_url(&self, path: &str) -> String {
        let base_url = if !self.server_url.starts_with("http://")
            && !self.server_url.starts_with("https://")
        {
            format!("http://{}", self.server_url)
        } else {
            self.server_url.clone()
        };

        format!("{}{}", base_url.trim_end_matches('/'), path)
    }

    fn meal_url(&self, id: Uuid) -> String {
        self.build_url(&format!("/meals/{}", id))
    }
}

#[async_trait]
impl RemoteWritePort for HttpRemote {
    async fn upsert_meal(&self, id: Uuid, payload: &MealPayload) -> Result<(), RemoteError> {
        let response = self
            .client
            .put(self.meal_url(id))
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }

    async fn delete_meal(&self, id: Uuid) -> Result<(), RemoteError> {
        let response = self
            .client
            .delete(self.meal_url(id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        // Already gone is as good as deleted.
        if status.is_success() || status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }
}

fn unavailable(e: reqwest::Error) -> RemoteError {
    let reason = if e.is_timeout() {
        "request timed out".to_string()
    } else {
        e.to_string()
    };
    RemoteError::Unavailable(reason)
}

/// Maps a non-success response to a transient or permanent failure.
fn classify(status: StatusCode, body: &str) -> RemoteError {
    let transient = !status.is_client_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;

    if transient {
        return RemoteError::Unavailable(format!("server returned {}", status));
    }
    RemoteError::Rejected {
        status: status.as_u16(),
        reason: rejection_reason(status, body),
    }
}

/// Prefers a JSON `message` or `error` field, then the raw body, then the
/// canonical reason phrase.
fn rejection_reason(status: StatusCode, body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["message", "error"] {
            if let Some(text) = json[key].as_str() {
                return text.to_string();
            }
        }
    }

    let body = body.trim();
    if !body.is_empty() {
        return body.to_string();
    }
    status
        .canonical_reason()
        .unwrap_or("request refused")
        .to_string()
}
