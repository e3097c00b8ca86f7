//! Transport adapter: executes a composed request and returns status + JSON.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::request::Method;

/// Input to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    /// Path relative to the API root, without a leading slash.
    pub path: String,
    pub params: BTreeMap<String, String>,
    pub method: Method,
    pub body: Option<Value>,
}

/// Raw outcome of a request.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    /// Parsed body; `null` when the body was empty.
    pub json: Value,
}

/// Performs the network call for a request.
///
/// Implementations return every HTTP status as a [`TransportResponse`] and
/// only fail for transport-level problems (unreachable host, broken
/// connection, undecodable body).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: &TransportRequest) -> Result<TransportResponse, ApiError>;
}

/// JSON-over-HTTP transport backed by `reqwest`.
pub struct HttpTransport {
    http: Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a transport for the API rooted at `config.base_url`.
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self::with_client(http, &config.base_url))
    }

    /// Create a transport with a custom reqwest client.
    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// The API root this transport talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: &TransportRequest) -> Result<TransportResponse, ApiError> {
        let url = self.url(&request.path);
        debug!(method = %request.method, url = %url, "sending request");

        let builder = match request.method {
            Method::Get => self.http.get(&url),
            Method::Post => self.http.post(&url),
            Method::Put => self.http.put(&url),
            Method::Delete => self.http.delete(&url),
        };
        let mut builder = builder.query(&request.params);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;

        let json = if bytes.iter().all(u8::is_ascii_whitespace) {
            Value::Null
        } else {
            match serde_json::from_slice(&bytes) {
                Ok(json) => json,
                // Error pages from proxies are rarely JSON; keep the status meaningful.
                Err(e) if status >= 400 => {
                    trace!(status, error = %e, "non-JSON error body");
                    Value::String(String::from_utf8_lossy(&bytes).into_owned())
                }
                Err(e) if status == 202 || status == 204 => {
                    trace!(status, error = %e, "ignoring non-JSON body");
                    Value::Null
                }
                Err(e) => return Err(e.into()),
            }
        };

        trace!(status, "received response");
        Ok(TransportResponse { status, json })
    }
}
