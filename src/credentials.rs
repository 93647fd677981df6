//! Access-token provider for the vendor API.
//!
//! Exchanges a long-lived refresh secret for a short-lived access token and
//! caches one token per [`Region`]. Each region's cache slot sits behind its
//! own async mutex, so the read-check-refresh-write sequence is a single
//! critical section and concurrent callers for the same region share one
//! exchange.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{ApiConfig, Secrets};
use crate::error::{PipelineError, PipelineResult};
use crate::http_client::{HttpClient, HttpMethod, HttpRequest};
use crate::region::Region;
use crate::signer::uri_encode;

/// Tokens with less validity than this are refreshed before use.
pub const REFRESH_MARGIN_SECS: i64 = 60;

/// Lifetime assumed when the exchange response omits `expires_in`.
pub const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

const MAX_ERROR_BODY_CHARS: usize = 2000;

#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub token_type: String,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token_len", &self.access_token.len())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    pub fn seconds_left(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds()
    }

    /// Usable iff more than [`REFRESH_MARGIN_SECS`] of validity remain.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.seconds_left(now) > REFRESH_MARGIN_SECS
    }
}

/// Exchange diagnostics attached to every API call's debug map.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TokenDebug {
    pub cached: bool,
    pub expires_in: i64,
    pub status_code: u16,
    pub token_type: String,
    pub token_url: String,
    pub access_token_len: usize,
}

pub struct CredentialProvider {
    http: Arc<dyn HttpClient>,
    secrets: Secrets,
    token_url: String,
    timeout: Duration,
    slots: BTreeMap<Region, Mutex<Option<AccessToken>>>,
}

impl CredentialProvider {
    pub fn new(http: Arc<dyn HttpClient>, secrets: Secrets, api: &ApiConfig) -> Self {
        Self {
            http,
            secrets,
            token_url: api.token_url.clone(),
            timeout: Duration::from_secs(api.token_timeout_secs),
            slots: Region::ALL.iter().map(|r| (*r, Mutex::new(None))).collect(),
        }
    }

    pub fn secrets(&self) -> &Secrets {
        &self.secrets
    }

    /// A valid access token for `region`, exchanging the refresh secret when
    /// the cached one is missing or inside the refresh margin.
    pub async fn access_token(&self, region: Region) -> PipelineResult<(String, TokenDebug)> {
        let slot = self
            .slots
            .get(&region)
            .ok_or_else(|| PipelineError::Config(format!("no token slot for {}", region)))?;
        let mut cached = slot.lock().await;

        let now = Utc::now();
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(now)) {
            debug!(region = %region, "using cached access token");
            return Ok((
                token.access_token.clone(),
                TokenDebug {
                    cached: true,
                    expires_in: token.seconds_left(now),
                    status_code: 200,
                    token_type: token.token_type.clone(),
                    token_url: self.token_url.clone(),
                    access_token_len: token.access_token.len(),
                },
            ));
        }

        let (client_id, client_secret) = self.secrets.client_credentials(region)?;
        let (slot_name, refresh_token) = self.secrets.refresh_token_for(region)?;

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ]
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&");

        let request = HttpRequest::new(HttpMethod::Post, self.token_url.as_str())
            .with_header("content-type", "application/x-www-form-urlencoded")
            .with_header("accept", "application/json")
            .with_body(form)
            .with_timeout(self.timeout);

        let response = self
            .http
            .execute(request)
            .await
            .map_err(|e| PipelineError::AuthExchange {
                status: 0,
                message: e.message,
            })?;

        if response.status != 200 {
            return Err(PipelineError::AuthExchange {
                status: response.status,
                message: response.body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let data: Value =
            serde_json::from_str(&response.body).map_err(|e| PipelineError::AuthExchange {
                status: response.status,
                message: format!("invalid token response: {}", e),
            })?;

        let access_token = data
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| PipelineError::AuthExchange {
                status: response.status,
                message: "token response missing access_token".to_string(),
            })?
            .to_string();
        let expires_in = data
            .get("expires_in")
            .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let token_type = data
            .get("token_type")
            .and_then(Value::as_str)
            .unwrap_or("bearer")
            .to_string();

        info!(
            region = %region,
            slot = slot_name,
            expires_in,
            "exchanged refresh token for access token"
        );

        let token_debug = TokenDebug {
            cached: false,
            expires_in,
            status_code: response.status,
            token_type: token_type.clone(),
            token_url: self.token_url.clone(),
            access_token_len: access_token.len(),
        };
        *cached = Some(AccessToken {
            access_token: access_token.clone(),
            expires_at: now + chrono::Duration::seconds(expires_in),
            token_type,
        });

        Ok((access_token, token_debug))
    }
}
