//! Plain-HTTP transport used by both wire protocols.
//!
//! The [`Transport`] trait is the seam between protocol sessions and the
//! network; tests substitute in-memory implementations. The production
//! [`HttpTransport`] wraps a `reqwest` client pointed at `http://<ip>/app`
//! and reports network failures as [`TransportErrorKind`] variants.

use std::error::Error as _;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::config::TapoConfig;
use crate::error::{TapoError, TransportErrorKind};

/// A raw HTTP exchange result. Statuses below 500 are passed through for
/// the protocol layer to inspect; 5xx never reaches this type.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// First `Set-Cookie` value, truncated at the first `;`.
    pub cookie: Option<String>,
}

impl HttpResponse {
    /// Parses the body as JSON.
    pub fn json(&self) -> Result<Value, TapoError> {
        serde_json::from_slice(&self.body).map_err(|_| {
            TapoError::InvalidRequest(format!(
                "device answered with a non-JSON body ({} bytes, status {})",
                self.body.len(),
                self.status
            ))
        })
    }
}

/// Device-facing HTTP operations.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// POSTs a JSON body to `<base>/<path>` with an optional raw query
    /// string and session cookie.
    async fn post_json(
        &self,
        path: &str,
        query: Option<&str>,
        body: &Value,
        cookie: Option<&str>,
        timeout: Duration,
    ) -> Result<HttpResponse, TapoError>;

    /// POSTs an `application/octet-stream` body (KLAP framing).
    async fn post_raw(
        &self,
        path: &str,
        query: Option<&str>,
        body: Vec<u8>,
        cookie: Option<&str>,
        timeout: Duration,
    ) -> Result<HttpResponse, TapoError>;
}

/// `reqwest`-backed transport bound to one device address.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(ip: &str, config: &TapoConfig) -> Result<Self, TapoError> {
        let client = reqwest::Client::builder()
            .timeout(config.connection_timeout)
            .build()
            .map_err(|err| TapoError::Transport {
                kind: TransportErrorKind::Unreachable,
                message: format!("http client construction failed: {err}"),
            })?;
        Ok(Self {
            client,
            base_url: format!("http://{}/app", ip),
        })
    }

    fn url(&self, path: &str, query: Option<&str>) -> String {
        let mut url = self.base_url.clone();
        if !path.is_empty() {
            url.push('/');
            url.push_str(path);
        }
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    async fn dispatch(
        &self,
        builder: reqwest::RequestBuilder,
        cookie: Option<&str>,
        timeout: Duration,
    ) -> Result<HttpResponse, TapoError> {
        let mut builder = builder.timeout(timeout);
        if let Some(cookie) = cookie {
            builder = builder.header(reqwest::header::COOKIE, cookie);
        }
        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        if status >= 500 {
            return Err(TapoError::Transport {
                kind: TransportErrorKind::Status(status),
                message: format!("server error status {status}"),
            });
        }
        let cookie = response
            .headers()
            .get(reqwest::header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .map(trim_cookie);
        let body = response.bytes().await.map_err(classify)?.to_vec();
        debug!(status, body_len = body.len(), "http exchange complete");
        Ok(HttpResponse {
            status,
            body,
            cookie,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_json(
        &self,
        path: &str,
        query: Option<&str>,
        body: &Value,
        cookie: Option<&str>,
        timeout: Duration,
    ) -> Result<HttpResponse, TapoError> {
        let builder = self.client.post(self.url(path, query)).json(body);
        self.dispatch(builder, cookie, timeout).await
    }

    async fn post_raw(
        &self,
        path: &str,
        query: Option<&str>,
        body: Vec<u8>,
        cookie: Option<&str>,
        timeout: Duration,
    ) -> Result<HttpResponse, TapoError> {
        let builder = self
            .client
            .post(self.url(path, query))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body);
        self.dispatch(builder, cookie, timeout).await
    }
}

fn trim_cookie(raw: &str) -> String {
    raw.split(';').next().unwrap_or(raw).trim().to_string()
}

fn classify(err: reqwest::Error) -> TapoError {
    let kind = if err.is_timeout() {
        TransportErrorKind::Timeout
    } else {
        io_error_kind(&err)
    };
    TapoError::Transport {
        kind,
        message: err.to_string(),
    }
}

fn io_error_kind(err: &reqwest::Error) -> TransportErrorKind {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return match io_err.kind() {
                io::ErrorKind::ConnectionRefused => TransportErrorKind::Refused,
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe => TransportErrorKind::Reset,
                io::ErrorKind::TimedOut => TransportErrorKind::Timeout,
                _ => TransportErrorKind::Unreachable,
            };
        }
        source = cause.source();
    }
    TransportErrorKind::Unreachable
}
