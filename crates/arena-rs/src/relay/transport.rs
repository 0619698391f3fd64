//! HTTP transport to LLM providers.

use super::template::ProviderRequest;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

/// Boxed future returned by [`Transport::send`].
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + 'a>>;

/// Sends one rendered request and returns the status and full body. Any
/// status is a response; only failing to get one is an error.
pub trait Transport: Send + Sync {
    fn send(&self, request: &ProviderRequest) -> TransportFuture<'_>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to read response: {0}")]
    Body(String),
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent("arena-relay/0.1")
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self { client })
    }

    async fn execute(&self, request: &ProviderRequest) -> Result<TransportResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| TransportError::Invalid(format!("method '{}': {e}", request.method)))?;
        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_null() {
            builder = builder.json(&request.body);
        }
        trace!(
            "Provider payload size: {} bytes",
            serde_json::to_string(&request.body).map_or(0, |s| s.len())
        );

        let start = Instant::now();
        let mut resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(request.timeout)
            } else {
                TransportError::Request(e.to_string())
            }
        })?;
        let status = resp.status().as_u16();

        // Read incrementally so long streamed answers are not cut by a
        // single-body read.
        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(request.timeout)
            } else {
                TransportError::Body(e.to_string())
            }
        })? {
            body.extend_from_slice(&chunk);
        }

        debug!(
            "Provider response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            body.len()
        );
        Ok(TransportResponse {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: &ProviderRequest) -> TransportFuture<'_> {
        let request = request.clone();
        Box::pin(async move { self.execute(&request).await })
    }
}
