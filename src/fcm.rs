//! FCM push delivery client.
//!
//! Speaks the legacy `fcm/send` HTTP endpoint with server-key auth. The
//! `PushSender` trait is the seam the relay handlers are written against, so
//! tests can substitute a recording sender.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;

/// Default timeout for push sends (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Web-push payload: title/body plus optional icon, click-through link, and
/// string data map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl PushMessage {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        PushMessage {
            title: title.into(),
            body: body.into(),
            icon: None,
            link: None,
            data: BTreeMap::new(),
        }
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

#[derive(Error, Debug)]
pub enum SendError {
    /// The provider no longer recognises the token; the caller must clear
    /// the user's registration.
    #[error("registration token not registered")]
    NotRegistered,

    #[error("push delivery failed: {0}")]
    Upstream(String),
}

/// Delivery seam between the relay handlers and FCM.
pub trait PushSender {
    /// Send one message to one token. Returns the provider message id.
    fn send(
        &self,
        token: &str,
        message: &PushMessage,
    ) -> impl std::future::Future<Output = Result<String, SendError>> + Send;
}

// ---------------------------------------------------------------------------
// Production client
// ---------------------------------------------------------------------------

pub struct FcmClient {
    http: Client,
    endpoint: String,
    server_key: String,
}

impl FcmClient {
    pub fn new(config: &Config) -> Result<Self, String> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;
        Ok(FcmClient {
            http,
            endpoint: config.fcm_endpoint.clone(),
            server_key: config.fcm_server_key.clone(),
        })
    }
}

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(err: &reqwest::Error) -> String {
    if err.is_connect() {
        return "Cannot reach FCM".to_string();
    }
    if err.is_timeout() {
        return "Connection to FCM timed out".to_string();
    }
    format!("Network error communicating with FCM: {err}")
}

impl PushSender for FcmClient {
    async fn send(&self, token: &str, message: &PushMessage) -> Result<String, SendError> {
        if self.server_key.is_empty() {
            return Err(SendError::Upstream("FCM server key not configured".into()));
        }

        let body = json!({
            "to": token,
            "notification": {
                "title": message.title,
                "body": message.body,
                "icon": message.icon.as_deref().unwrap_or("/vite.svg"),
            },
            "data": message.data,
            "webpush": {
                "fcm_options": {
                    "link": message.link.as_deref().unwrap_or("/"),
                }
            }
        });

        let resp = self
            .http
            .post(&self.endpoint)
            .header("Authorization", format!("key={}", self.server_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::Upstream(friendly_error(&e)))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SendError::NotRegistered);
        }
        if !status.is_success() {
            return Err(SendError::Upstream(format!(
                "FCM responded with HTTP {status}"
            )));
        }

        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SendError::Upstream(format!("invalid FCM response: {e}")))?;

        // Legacy API reports per-token results inline with HTTP 200.
        if let Some(result) = payload
            .get("results")
            .and_then(|r| r.as_array())
            .and_then(|r| r.first())
        {
            if let Some(error) = result.get("error").and_then(|e| e.as_str()) {
                return match error {
                    "NotRegistered" | "InvalidRegistration" => Err(SendError::NotRegistered),
                    other => Err(SendError::Upstream(format!("FCM error: {other}"))),
                };
            }
            if let Some(id) = result.get("message_id") {
                debug!(%id, "push sent");
                return Ok(id.to_string().trim_matches('"').to_string());
            }
        }

        // multicast_id is present even when results are not
        Ok(payload
            .get("multicast_id")
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unknown".to_string()))
    }
}
