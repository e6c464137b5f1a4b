//! HTTP request execution.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use polar_core::{Error, Result};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// DELETE
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        })
    }
}

/// Request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// No body.
    Empty,
    /// `application/json` body.
    Json(Value),
    /// `application/x-www-form-urlencoded` body.
    Form(Vec<(String, String)>),
}

/// A request addressed to one daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Headers, auth material included.
    pub headers: BTreeMap<String, String>,
    /// Payload.
    pub body: RequestBody,
    /// Overrides the transport's default timeout (long polls).
    pub timeout: Option<Duration>,
    /// Read only the first newline-delimited message of a streaming reply.
    pub first_message_only: bool,
}

/// A daemon response.
///
/// Bodies that are not JSON are kept as a JSON string so callers can still
/// report them.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Parsed body, `Null` when empty.
    pub body: Value,
}

/// Executes HTTP requests against daemons.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send `request` and return the daemon's response.
    ///
    /// Fails with [`Error::Transport`] only when no response was received.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// [`HttpTransport`] backed by `reqwest`.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Create a transport whose requests give up after `timeout`.
    ///
    /// Regtest daemons serve self-signed certificates, so certificate
    /// validation is disabled.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::Transport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
            timeout,
            first_message_only,
        } = request;

        let mut builder = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Delete => self.client.delete(&url),
        };
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match body {
            RequestBody::Empty => builder,
            RequestBody::Json(json) => builder.json(&json),
            RequestBody::Form(fields) => builder.form(&fields),
        };
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let mut response = builder
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{method} {url}: {e}")))?;
        let status = response.status().as_u16();
        let read_error =
            |e: reqwest::Error| Error::Transport(format!("{method} {url}: failed to read body: {e}"));

        let text = if first_message_only {
            let mut buf = Vec::new();
            while let Some(chunk) = response.chunk().await.map_err(read_error)? {
                buf.extend_from_slice(&chunk);
                if let Some(end) = buf.iter().position(|b| *b == b'\n') {
                    buf.truncate(end);
                    break;
                }
            }
            String::from_utf8_lossy(&buf).into_owned()
        } else {
            response.text().await.map_err(read_error)?
        };
        debug!(%method, %url, status, bytes = text.len(), "daemon response");

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(HttpResponse { status, body })
    }
}
