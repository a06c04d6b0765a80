use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Bytes, BytesMut};
use common::{error::AppError, utils::config::DownloadConfig};
use reqwest::header::{ACCEPT, REFERER};
use thiserror::Error;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::{debug, warn};

use crate::utils::url_guard::ensure_download_url_allowed;

const IMAGE_ACCEPT: &str = "image/webp,image/apng,image/svg+xml,image/*,*/*;q=0.8";
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Incomplete body: expected {expected} bytes, received {received}")]
    Incomplete { expected: u64, received: u64 },
    #[error("Body exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("URL not allowed: {0}")]
    Disallowed(String),
    #[error("Malformed data URL: {0}")]
    InvalidDataUrl(String),
}

impl FetchError {
    /// Server errors, rate limiting and broken transfers are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Status(code) => *code >= 500 || *code == 429,
            FetchError::Transport(_) | FetchError::Timeout | FetchError::Incomplete { .. } => true,
            FetchError::TooLarge { .. }
            | FetchError::Disallowed(_)
            | FetchError::InvalidDataUrl(_) => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

/// Downloads raw image bytes for a candidate URL.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

pub struct HttpImageFetcher {
    client: reqwest::Client,
    config: DownloadConfig,
    allow_private_hosts: bool,
}

impl HttpImageFetcher {
    pub fn new(config: DownloadConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            config,
            allow_private_hosts: false,
        })
    }

    #[cfg(test)]
    fn allowing_private_hosts(mut self) -> Self {
        self.allow_private_hosts = true;
        self
    }

    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        // Delays of base, 2*base, 4*base, ...
        let factor = (self.config.retry_base_delay_ms / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(MAX_RETRY_DELAY)
            .map(jitter)
            .take(self.config.attempts.saturating_sub(1))
    }

    async fn fetch_once(&self, url: &url::Url) -> Result<Bytes, FetchError> {
        let mut response = self
            .client
            .get(url.clone())
            .header(REFERER, &self.config.referer)
            .header(ACCEPT, IMAGE_ACCEPT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let limit = self.config.max_input_bytes;
        let expected = response.content_length();
        if let Some(expected) = expected {
            if usize::try_from(expected).map_or(true, |len| len > limit) {
                return Err(FetchError::TooLarge { limit });
            }
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len().saturating_add(chunk.len()) > limit {
                return Err(FetchError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        let received = body.len() as u64;
        if let Some(expected) = expected {
            if received < expected {
                return Err(FetchError::Incomplete { expected, received });
            }
        }

        Ok(body.freeze())
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    #[tracing::instrument(level = "debug", skip_all, fields(url = %url))]
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let url = url.trim();
        if url.starts_with("data:") {
            return decode_data_url(url, self.config.max_input_bytes);
        }

        let parsed = url::Url::parse(url).map_err(|err| FetchError::Disallowed(err.to_string()))?;
        if !self.allow_private_hosts {
            ensure_download_url_allowed(&parsed).map_err(FetchError::Disallowed)?;
        }

        let parsed = &parsed;
        RetryIf::spawn(
            self.retry_strategy(),
            move || async move {
                self.fetch_once(parsed).await.inspect_err(|err| {
                    if err.is_retryable() {
                        debug!(error = %err, "image download attempt failed");
                    }
                })
            },
            |err: &FetchError| err.is_retryable(),
        )
        .await
        .inspect_err(|err| warn!(error = %err, "image download failed"))
    }
}

/// Decodes an inline `data:<mime>;base64,<payload>` URL.
pub fn decode_data_url(url: &str, limit: usize) -> Result<Bytes, FetchError> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| FetchError::InvalidDataUrl("missing data: prefix".into()))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| FetchError::InvalidDataUrl("missing payload separator".into()))?;

    if !meta.to_ascii_lowercase().ends_with(";base64") {
        return Err(FetchError::InvalidDataUrl(
            "only base64 payloads are supported".into(),
        ));
    }

    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let decoded = STANDARD
        .decode(compact.as_bytes())
        .map_err(|err| FetchError::InvalidDataUrl(err.to_string()))?;

    if decoded.is_empty() {
        return Err(FetchError::InvalidDataUrl("empty payload".into()));
    }
    if decoded.len() > limit {
        return Err(FetchError::TooLarge { limit });
    }

    Ok(Bytes::from(decoded))
}
