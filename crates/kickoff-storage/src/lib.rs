//! HTTP fetch utilities, the snapshot-backed data store, and checkpoint persistence for Kickoff.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use kickoff_core::CancelToken;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

mod checkpoint;
mod store;

pub use checkpoint::{CheckpointStore, Checkpoints};
pub use store::{default_stale_threshold_hours, DataStore, HealthRecorder, Tables};

pub const CRATE_NAME: &str = "kickoff-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

pub fn classify_status(status: StatusCode) -> ErrorClass {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> ErrorClass {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 4,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("no data at {url}")]
    NotFound { url: String },
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(err) => classify_reqwest_error(err) == ErrorClass::Transient,
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == ErrorClass::Transient)
                .unwrap_or(false),
            Self::NotFound { .. } | Self::Cancelled => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Shared outbound client. Each request races the caller's cancel token.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    pub async fn fetch_bytes(
        &self,
        source_id: &str,
        url: &str,
        headers: &[(&str, &str)],
        cancel: &CancelToken,
    ) -> Result<FetchedResponse, FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            permit = self.global_limit.acquire() => permit.map_err(|_| FetchError::Cancelled)?,
        };

        let span = info_span!("http_fetch", source_id, url);
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let exchange = async {
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            debug!(status = status.as_u16(), "response received");

            if status == StatusCode::NOT_FOUND {
                return Err(FetchError::NotFound { url: final_url });
            }
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            Ok::<_, FetchError>(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span);

        tokio::select! {
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = exchange => result,
        }
    }

    pub async fn fetch_text(
        &self,
        source_id: &str,
        url: &str,
        headers: &[(&str, &str)],
        cancel: &CancelToken,
    ) -> Result<String, FetchError> {
        Ok(self.fetch_bytes(source_id, url, headers, cancel).await?.text())
    }
}
