//! Telegram Bot API client with bounded retry and structured transport errors.
//!
//! Two operations are exposed: `getUpdates` long polling and `sendMessage`
//! posting. Every failure maps into a `TelegramApiError` so the adapter and
//! service layers classify outcomes instead of parsing strings.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const RATE_LIMIT_ERROR_CODE: i64 = 429;

/// Enumerates supported `TelegramApiErrorKind` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TelegramApiErrorKind {
    Timeout,
    NetworkError,
    HttpError,
    ApiError,
    InvalidResponse,
}

impl TelegramApiErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::NetworkError => "network-error",
            Self::HttpError => "http-error",
            Self::ApiError => "api-error",
            Self::InvalidResponse => "invalid-response",
        }
    }
}

/// Structured transport error produced by `TelegramApiClient`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramApiError {
    pub operation: &'static str,
    pub kind: TelegramApiErrorKind,
    pub retryable: bool,
    pub description: String,
    pub status_code: Option<u16>,
    pub error_code: Option<i64>,
}

impl TelegramApiError {
    fn new(
        operation: &'static str,
        kind: TelegramApiErrorKind,
        retryable: bool,
        description: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            retryable,
            description: description.into(),
            status_code: None,
            error_code: None,
        }
    }
}

impl std::fmt::Display for TelegramApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "telegram api {} failed: kind={} retryable={}",
            self.operation,
            self.kind.as_str(),
            self.retryable
        )?;
        if let Some(status_code) = self.status_code {
            write!(f, " status_code={status_code}")?;
        }
        if let Some(error_code) = self.error_code {
            write!(f, " error_code={error_code}")?;
        }
        write!(f, " description={}", self.description)
    }
}

impl std::error::Error for TelegramApiError {}

/// Tunables for the API client; defaults match live polling use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramApiClientConfig {
    pub api_base: String,
    pub request_timeout_ms: u64,
    pub long_poll_timeout_s: u64,
    pub batch_limit: u32,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub retry_after_cap_ms: u64,
}

impl Default for TelegramApiClientConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.telegram.org".to_string(),
            request_timeout_ms: 10_000,
            long_poll_timeout_s: 0,
            batch_limit: 100,
            retry_max_attempts: 3,
            retry_base_delay_ms: 250,
            retry_after_cap_ms: 5_000,
        }
    }
}

/// Minimal Telegram Bot API wrapper with bounded retry/backoff.
#[derive(Debug, Clone)]
pub struct TelegramApiClient {
    http: reqwest::Client,
    config: TelegramApiClientConfig,
    token: String,
}

impl TelegramApiClient {
    pub fn new(token: &str, config: TelegramApiClientConfig) -> Result<Self> {
        let token = token.trim().to_string();
        if token.is_empty() {
            bail!("telegram bot token must be a non-empty string");
        }
        if config.api_base.trim().trim_end_matches('/').is_empty() {
            bail!("telegram api base cannot be empty");
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .context("failed to create telegram api client")?;
        Ok(Self {
            http,
            config,
            token,
        })
    }

    /// Long-polls `getUpdates`; returns the raw update objects in batch order.
    pub async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Value>, TelegramApiError> {
        let mut payload = json!({
            "timeout": self.config.long_poll_timeout_s,
            "limit": self.config.batch_limit,
        });
        if let Some(offset) = offset {
            payload["offset"] = Value::from(offset);
        }

        let result = self.request("fetch_updates", "getUpdates", payload).await?;
        let Some(updates) = result.as_array() else {
            return Err(TelegramApiError::new(
                "fetch_updates",
                TelegramApiErrorKind::InvalidResponse,
                false,
                "getUpdates result must be an array",
            ));
        };
        Ok(updates
            .iter()
            .filter(|update| update.is_object())
            .cloned()
            .collect())
    }

    /// Posts one `sendMessage`; returns the message object on success.
    pub async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_to_message_id: Option<&str>,
    ) -> Result<Value, TelegramApiError> {
        let mut payload = json!({
            "chat_id": chat_id,
            "text": text,
        });
        if let Some(reply_to) = reply_to_message_id {
            payload["reply_to_message_id"] = Value::from(reply_to);
        }

        let result = self.request("send_message", "sendMessage", payload).await?;
        if !result.is_object() {
            return Err(TelegramApiError::new(
                "send_message",
                TelegramApiErrorKind::InvalidResponse,
                false,
                "sendMessage result must be an object",
            ));
        }
        Ok(result)
    }

    async fn request(
        &self,
        operation: &'static str,
        method: &str,
        payload: Value,
    ) -> Result<Value, TelegramApiError> {
        let base = self.config.api_base.trim().trim_end_matches('/');
        let url = format!("{base}/bot{}/{method}", self.token);
        let max_attempts = self.config.retry_max_attempts.max(1);
        let mut attempt = 0_usize;

        loop {
            attempt = attempt.saturating_add(1);
            let (error, retry_after) = match self.attempt(operation, &url, &payload).await {
                Ok(result) => return Ok(result),
                Err(outcome) => outcome,
            };
            if !error.retryable || attempt >= max_attempts {
                return Err(error);
            }
            tokio::time::sleep(self.retry_delay(attempt, retry_after)).await;
        }
    }

    async fn attempt(
        &self,
        operation: &'static str,
        url: &str,
        payload: &Value,
    ) -> Result<Value, (TelegramApiError, Option<Duration>)> {
        let response = match self.http.post(url).json(payload).send().await {
            Ok(response) => response,
            Err(error) => return Err((classify_transport_error(operation, &error), None)),
        };

        let status = response.status();
        let header_retry_after = parse_retry_after_header(response.headers());
        let raw_body = match response.text().await {
            Ok(raw_body) => raw_body,
            Err(error) => {
                return Err((
                    TelegramApiError::new(
                        operation,
                        TelegramApiErrorKind::NetworkError,
                        true,
                        format!("failed to read response body: {error}"),
                    ),
                    None,
                ));
            }
        };
        let parsed = serde_json::from_str::<Value>(&raw_body).ok();

        if !status.is_success() {
            let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
            let mut error = TelegramApiError::new(
                operation,
                TelegramApiErrorKind::HttpError,
                retryable,
                extract_description(parsed.as_ref())
                    .unwrap_or_else(|| format!("http status {}", status.as_u16())),
            );
            error.status_code = Some(status.as_u16());
            error.error_code = extract_error_code(parsed.as_ref());
            let retry_after = extract_retry_after(parsed.as_ref()).or(header_retry_after);
            return Err((error, retry_after));
        }

        let Some(parsed) = parsed else {
            return Err((
                TelegramApiError::new(
                    operation,
                    TelegramApiErrorKind::InvalidResponse,
                    false,
                    "response body is not valid JSON",
                ),
                None,
            ));
        };
        if !parsed.is_object() {
            return Err((
                TelegramApiError::new(
                    operation,
                    TelegramApiErrorKind::InvalidResponse,
                    false,
                    "response body must be an object",
                ),
                None,
            ));
        }

        if parsed.get("ok").and_then(Value::as_bool) != Some(true) {
            let error_code = extract_error_code(Some(&parsed));
            let retryable = matches!(
                error_code,
                Some(code) if code == RATE_LIMIT_ERROR_CODE || code >= 500
            );
            let mut error = TelegramApiError::new(
                operation,
                TelegramApiErrorKind::ApiError,
                retryable,
                extract_description(Some(&parsed))
                    .unwrap_or_else(|| "telegram api returned ok=false".to_string()),
            );
            error.error_code = error_code;
            let retry_after = extract_retry_after(Some(&parsed)).or(header_retry_after);
            return Err((error, retry_after));
        }

        Ok(parsed.get("result").cloned().unwrap_or(Value::Null))
    }

    fn retry_delay(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        if let Some(retry_after) = retry_after {
            let cap = Duration::from_millis(self.config.retry_after_cap_ms.max(1));
            return retry_after.min(cap);
        }
        let delay_ms = self
            .config
            .retry_base_delay_ms
            .saturating_mul(u64::try_from(attempt).unwrap_or(1));
        Duration::from_millis(delay_ms)
    }
}

fn classify_transport_error(operation: &'static str, error: &reqwest::Error) -> TelegramApiError {
    let kind = if error.is_timeout() {
        TelegramApiErrorKind::Timeout
    } else {
        TelegramApiErrorKind::NetworkError
    };
    TelegramApiError::new(operation, kind, true, error.to_string())
}

fn parse_retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    let seconds = raw.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(seconds))
}

fn extract_retry_after(payload: Option<&Value>) -> Option<Duration> {
    let seconds = payload?
        .get("parameters")?
        .get("retry_after")?
        .as_u64()?;
    Some(Duration::from_secs(seconds))
}

fn extract_description(payload: Option<&Value>) -> Option<String> {
    payload?
        .get("description")
        .and_then(Value::as_str)
        .map(|description| description.to_string())
}

fn extract_error_code(payload: Option<&Value>) -> Option<i64> {
    payload?.get("error_code").and_then(Value::as_i64)
}
