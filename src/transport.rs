//! HTTP seam used by the replay engine and the connectivity probe.
//!
//! `Transport` issues one mutating request and reports the status code.
//! `HttpTransport` is the reqwest implementation; tests substitute a
//! scripted fake.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::connectivity::NetworkProbe;
use crate::error::{SyncError, SyncResult};
use crate::models::HttpMethod;

/// Timeout used for the lightweight health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One outbound call. `bearer` is resolved by the caller right before sending.
#[derive(Debug, Clone, Copy)]
pub struct OutboundRequest<'a> {
    pub method: HttpMethod,
    pub endpoint: &'a str,
    pub body: Option<&'a Value>,
    pub bearer: Option<&'a str>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send the request and return the HTTP status code. `Err` means no
    /// response was received (connect failure, timeout, ...).
    async fn send(&self, request: OutboundRequest<'_>) -> SyncResult<u16>;
}

pub fn is_success_status(status: u16) -> bool {
    (200..300).contains(&status)
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the API base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Absolute endpoints pass through; paths are joined onto `base`.
pub fn resolve_endpoint(base: Option<&str>, endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    match base {
        Some(base) => {
            let base = normalize_base_url(base);
            if endpoint.starts_with('/') {
                format!("{base}{endpoint}")
            } else {
                format!("{base}/{endpoint}")
            }
        }
        None => endpoint.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a readable message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach API at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid API URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Short description of a non-2xx status for logs.
pub fn status_error(status: u16) -> String {
    match status {
        401 => "Session token is invalid or expired".to_string(),
        403 => "Not authorized for this resource".to_string(),
        404 => "API endpoint not found".to_string(),
        s if s >= 500 => format!("API server error (HTTP {s})"),
        s => format!("Unexpected response from API (HTTP {s})"),
    }
}

fn to_reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Delete => Method::DELETE,
    }
}

// ---------------------------------------------------------------------------
// reqwest transport
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Option<String>,
}

impl HttpTransport {
    /// `timeout` of `None` keeps the client default (no per-request limit).
    pub fn new(base_url: Option<&str>, timeout: Option<Duration>) -> SyncResult<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| SyncError::Transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.map(normalize_base_url),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: OutboundRequest<'_>) -> SyncResult<u16> {
        let url = resolve_endpoint(self.base_url.as_deref(), request.endpoint);

        let mut req = self
            .client
            .request(to_reqwest_method(request.method), &url)
            .header("Content-Type", "application/json");
        if let Some(token) = request.bearer {
            req = req.bearer_auth(token);
        }
        if let Some(body) = request.body {
            req = req.json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| SyncError::Transport(friendly_error(&url, &e)))?;
        let status = resp.status().as_u16();
        debug!(method = %request.method, url = %url, status, "request replayed");
        Ok(status)
    }
}

// ---------------------------------------------------------------------------
// Health probe
// ---------------------------------------------------------------------------

/// HEAD request against `{base}{health_path}`; online means any 2xx.
pub struct HealthProbe {
    client: Client,
    health_url: String,
}

impl HealthProbe {
    pub fn new(base_url: &str, health_path: &str) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            health_url: resolve_endpoint(Some(base_url), health_path),
        })
    }
}

#[async_trait]
impl NetworkProbe for HealthProbe {
    async fn is_online(&self) -> bool {
        match self.client.head(&self.health_url).send().await {
            Ok(resp) => resp.status().is_success() || resp.status() == StatusCode::METHOD_NOT_ALLOWED,
            Err(e) => {
                debug!(error = %friendly_error(&self.health_url, &e), "health probe failed");
                false
            }
        }
    }
}
