// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP client for the transfer service's OAuth-protected API.
//!
//! Uses the password grant. The access token is cached and refreshed when
//! it is within [`REFRESH_MARGIN`] of expiring.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

use super::{is_capacity_text, OAuthApi, RemoteMap};
use crate::config::OAuthConfig;
use crate::error::{EngineError, EngineResult};

/// Default timeout for API requests (in seconds).
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Maximum retry attempts for transient errors.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Maximum delay for exponential backoff (milliseconds).
const RETRY_MAX_DELAY_MS: u64 = 10000;

/// Refresh a token this close to expiry.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
struct AccessToken {
    token: String,
    expires_at: Instant,
}

impl AccessToken {
    fn from_response(response: &RemoteMap, now: Instant) -> EngineResult<Self> {
        check_error(response)?;
        let token = response
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::TransientRemote("token response has no access_token".to_string()))?
            .to_string();
        let expires_in = response
            .get("expires_in")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .max(0.0);
        Ok(Self {
            token,
            expires_at: now + Duration::from_secs_f64(expires_in),
        })
    }

    fn needs_refresh(&self, now: Instant) -> bool {
        self.expires_at.saturating_duration_since(now) < REFRESH_MARGIN
    }
}

/// Exponential backoff before retry `attempt` (1-based): 500ms, 1000ms,
/// 2000ms, ... capped at 10s.
fn retry_delay_ms(attempt: u32) -> u64 {
    let shift = attempt.saturating_sub(1).min(16);
    std::cmp::min(RETRY_BASE_DELAY_MS << shift, RETRY_MAX_DELAY_MS)
}

/// A response carrying `"error"` is a failure. Capacity markers are
/// reported as `CapacityExhausted`.
fn check_error(response: &RemoteMap) -> EngineResult<()> {
    match response.get("error") {
        None | Some(Value::Null) => Ok(()),
        Some(err) => {
            let message = response
                .get("error_description")
                .and_then(Value::as_str)
                .or_else(|| err.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            if is_capacity_text(&message) {
                return Err(EngineError::CapacityExhausted(message));
            }
            Err(EngineError::TransientRemote(message))
        }
    }
}

/// Production [`OAuthApi`].
pub struct HttpOAuthClient {
    config: OAuthConfig,
    client: reqwest::Client,
    token: Mutex<Option<AccessToken>>,
}

impl HttpOAuthClient {
    pub fn new(config: OAuthConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| EngineError::Unrecoverable(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            config,
            client,
            token: Mutex::new(None),
        })
    }

    /// Current access token, fetching a new one when missing or expiring.
    async fn access_token(&self) -> EngineResult<String> {
        let mut guard = self.token.lock().await;
        let now = Instant::now();
        if let Some(token) = guard.as_ref() {
            if !token.needs_refresh(now) {
                return Ok(token.token.clone());
            }
            tracing::info!("Refreshing access token");
        }

        let form = [
            ("type", "login"),
            ("grant_type", self.config.grant_type.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("username", self.config.username.as_str()),
            ("password", self.config.password.as_str()),
        ];
        let response = self
            .send_with_retry(|| self.client.post(&self.config.access_token_url).form(&form))
            .await?;
        let token = AccessToken::from_response(&response, now)?;
        let value = token.token.clone();
        *guard = Some(token);
        Ok(value)
    }

    /// Send a request, retrying network failures and 5xx/429 with
    /// exponential backoff. Returns the decoded JSON object.
    async fn send_with_retry<F>(&self, build: F) -> EngineResult<RemoteMap>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = retry_delay_ms(attempt);
                tracing::debug!("Retry attempt {} after {}ms delay", attempt + 1, delay);
                sleep(Duration::from_millis(delay)).await;
            }

            let response = match build().send().await {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = Some(EngineError::from(e));
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 || status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                last_error = Some(EngineError::TransientRemote(format!("HTTP {} - {}", status, body)));
                continue;
            }

            let body = response.text().await?;
            return match serde_json::from_str::<Value>(&body) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(_) | Err(_) if !status.is_success() => {
                    Err(EngineError::TransientRemote(format!("HTTP {} - {}", status, body)))
                }
                Ok(other) => Err(EngineError::TransientRemote(format!(
                    "expected a JSON object, got {}",
                    other
                ))),
                Err(e) => Err(EngineError::TransientRemote(format!("invalid JSON response: {}", e))),
            };
        }

        Err(last_error.unwrap_or_else(|| EngineError::TransientRemote("max retries exceeded".to_string())))
    }
}

#[async_trait]
impl OAuthApi for HttpOAuthClient {
    async fn query(&self, function: &str, params: &BTreeMap<String, String>) -> EngineResult<RemoteMap> {
        let token = self.access_token().await?;
        let mut form: Vec<(&str, &str)> = vec![("func", function), ("access_token", token.as_str())];
        form.extend(params.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let response = self
            .send_with_retry(|| self.client.post(&self.config.api_url).form(&form))
            .await?;
        check_error(&response)?;
        Ok(response)
    }

    async fn api_call(
        &self,
        path: &str,
        method: &str,
        params: &BTreeMap<String, String>,
    ) -> EngineResult<RemoteMap> {
        let token = self.access_token().await?;
        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| EngineError::PreconditionFailed(format!("invalid HTTP method {}", method)))?;
        let url = format!("{}{}", self.config.rest_api_url, path);

        let response = self
            .send_with_retry(|| {
                let request = self.client.request(method.clone(), &url).bearer_auth(&token);
                if method == reqwest::Method::POST {
                    request.form(params)
                } else {
                    request
                }
            })
            .await?;
        check_error(&response)?;
        Ok(response)
    }
}
