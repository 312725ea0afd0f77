//! Generic JSON-over-HTTP adapter
//!
//! Speaks a small bearer-token protocol so any platform bridge can be plugged
//! in from config:
//!
//! - `POST publish_url` with `Authorization: Bearer <access>` and the payload
//!   as JSON; a 2xx reply carries `{"id": "...", "url": "..."}`
//! - `POST refresh_url` with `{"grant_type": "refresh_token", "refresh_token": "..."}`
//! - `POST exchange_url` with `{"grant_type": "authorization_code", "code": "..."}`
//!
//! Token replies carry `access_token`, and optionally `refresh_token` and
//! `expires_in` (seconds).

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::WebhookConfig;
use crate::error::{AdapterError, ConfigError, Result};
use crate::platforms::{IssuedCredential, PlatformAdapter, Published};
use crate::types::Payload;

pub struct WebhookAdapter {
    name: String,
    http: Client,
    publish_url: String,
    refresh_url: String,
    exchange_url: Option<String>,
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "no_media")]
    media: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    link: Option<&'a str>,
}

fn no_media(media: &&[String]) -> bool {
    media.is_empty()
}

#[derive(Deserialize)]
struct PublishResponse {
    id: String,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    grant_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default, alias = "error_description")]
    message: Option<String>,
}

impl WebhookAdapter {
    pub fn from_config(config: &WebhookConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout.clamp(1, 10)))
            .timeout(Duration::from_secs(config.timeout.max(1)))
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: format!("webhook.{}", config.name),
                reason: e.to_string(),
            })?;

        Ok(Self {
            name: config.name.clone(),
            http,
            publish_url: config.publish_url.clone(),
            refresh_url: config.refresh_url.clone(),
            exchange_url: config.exchange_url.clone(),
        })
    }

    async fn token_call(
        &self,
        url: &str,
        request: &TokenRequest<'_>,
    ) -> std::result::Result<IssuedCredential, AdapterError> {
        let response = self
            .http
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status.is_success() {
            let body: TokenResponse = response.json().await.map_err(transport)?;
            return Ok(IssuedCredential {
                access_token: SecretString::from(body.access_token),
                refresh_token: body.refresh_token.map(SecretString::from),
                expires_at: body
                    .expires_in
                    .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            });
        }

        let retry_after = retry_after_secs(&response);
        let body = error_body(response).await;
        let grant_rejected = body.error.as_deref() == Some("invalid_grant")
            || matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN);

        if grant_rejected && status.is_client_error() {
            return Err(AdapterError::InvalidGrant {
                message: body
                    .message
                    .or(body.error)
                    .unwrap_or_else(|| status.to_string()),
            });
        }
        Err(classify(status, retry_after, body))
    }
}

fn transport(e: reqwest::Error) -> AdapterError {
    AdapterError::Transport(e.to_string())
}

fn retry_after_secs(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

async fn error_body(response: reqwest::Response) -> ErrorBody {
    match response.text().await {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|_| ErrorBody {
            error: None,
            message: (!text.trim().is_empty()).then(|| text.trim().to_string()),
        }),
        Err(_) => ErrorBody::default(),
    }
}

fn classify(status: StatusCode, retry_after: Option<u64>, body: ErrorBody) -> AdapterError {
    let message = body
        .message
        .clone()
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string());

    if status == StatusCode::TOO_MANY_REQUESTS {
        AdapterError::RateLimited {
            retry_after_secs: retry_after,
        }
    } else if status.is_server_error() {
        AdapterError::Server {
            status: status.as_u16(),
            message,
        }
    } else {
        AdapterError::Client {
            code: body
                .error
                .unwrap_or_else(|| format!("Http{}", status.as_u16())),
            message,
        }
    }
}

#[async_trait]
impl PlatformAdapter for WebhookAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exchange_for_credential(
        &self,
        code: &str,
    ) -> std::result::Result<IssuedCredential, AdapterError> {
        let url = self.exchange_url.as_deref().ok_or_else(|| AdapterError::Client {
            code: "ExchangeUnsupported".to_string(),
            message: format!("platform '{}' has no exchange_url", self.name),
        })?;

        self.token_call(
            url,
            &TokenRequest {
                grant_type: "authorization_code",
                refresh_token: None,
                code: Some(code),
            },
        )
        .await
    }

    async fn refresh(
        &self,
        refresh_secret: &SecretString,
    ) -> std::result::Result<IssuedCredential, AdapterError> {
        debug!(platform = %self.name, "refreshing credential");
        self.token_call(
            &self.refresh_url,
            &TokenRequest {
                grant_type: "refresh_token",
                refresh_token: Some(refresh_secret.expose_secret()),
                code: None,
            },
        )
        .await
    }

    async fn publish(
        &self,
        credential: &SecretString,
        payload: &Payload,
    ) -> std::result::Result<Published, AdapterError> {
        let response = self
            .http
            .post(&self.publish_url)
            .bearer_auth(credential.expose_secret())
            .json(&PublishRequest {
                text: &payload.text,
                media: &payload.media,
                link: payload.link.as_deref(),
            })
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status.is_success() {
            let body: PublishResponse = response.json().await.map_err(transport)?;
            debug!(platform = %self.name, platform_id = %body.id, "published");
            return Ok(Published {
                platform_id: body.id,
                platform_url: body.url,
            });
        }

        let retry_after = retry_after_secs(&response);
        let body = error_body(response).await;
        Err(classify(status, retry_after, body))
    }
}
