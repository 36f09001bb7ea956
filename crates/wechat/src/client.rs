//! HTTP client for the template message endpoint.
//!
//! Access tokens are fetched with the app credentials and cached in memory
//! per `app_id` until shortly before they expire. A send that reports an
//! invalid or expired token drops the cached entry so the next send fetches
//! a fresh one.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use relay_common::types::{SendResponse, TemplateMessage, WechatApp};

use crate::TemplateMessenger;
use crate::error::WechatError;

/// Tokens are refreshed this many seconds before the server-side expiry.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

/// Error codes meaning the access token is invalid or expired.
const TOKEN_INVALID_CODES: &[i64] = &[40001, 40014, 42001];

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn new(value: String, expires_in: i64, now: DateTime<Utc>) -> Self {
        let lifetime = (expires_in - TOKEN_EXPIRY_MARGIN_SECS).max(0);
        Self {
            value,
            expires_at: now + chrono::Duration::seconds(lifetime),
        }
    }

    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Official Account API client.
pub struct WechatClient {
    http: reqwest::Client,
    api_base: String,
    tokens: Mutex<HashMap<String, CachedToken>>,
}

impl WechatClient {
    pub fn new(api_base: impl Into<String>) -> Result<Self, WechatError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Return a cached access token for `app`, fetching one if needed.
    async fn access_token(&self, app: &WechatApp) -> Result<String, WechatError> {
        let now = Utc::now();
        if let Some(token) = self.tokens.lock().await.get(&app.app_id)
            && token.is_fresh(now)
        {
            return Ok(token.value.clone());
        }

        let response: TokenResponse = self
            .http
            .get(format!("{}/cgi-bin/token", self.api_base))
            .query(&[
                ("grant_type", "client_credential"),
                ("appid", app.app_id.as_str()),
                ("secret", app.secret.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let Some(value) = response.access_token else {
            return Err(WechatError::AccessToken {
                errcode: response.errcode,
                errmsg: response.errmsg,
            });
        };

        let token = CachedToken::new(value, response.expires_in.unwrap_or(7200), now);
        tracing::debug!(app_id = %app.app_id, expires_at = %token.expires_at, "Fetched access token");

        let value = token.value.clone();
        self.tokens.lock().await.insert(app.app_id.clone(), token);
        Ok(value)
    }

    async fn invalidate_token(&self, app_id: &str) {
        self.tokens.lock().await.remove(app_id);
    }
}

#[async_trait]
impl TemplateMessenger for WechatClient {
    async fn send_template(
        &self,
        app: &WechatApp,
        message: &TemplateMessage,
    ) -> Result<SendResponse, WechatError> {
        let token = self.access_token(app).await?;

        let response: SendResponse = self
            .http
            .post(format!("{}/cgi-bin/message/template/send", self.api_base))
            .query(&[("access_token", token.as_str())])
            .json(message)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if TOKEN_INVALID_CODES.contains(&response.errcode) {
            tracing::warn!(
                app_id = %app.app_id,
                errcode = response.errcode,
                "Access token rejected, dropping cached token"
            );
            self.invalidate_token(&app.app_id).await;
        }

        Ok(response)
    }
}
