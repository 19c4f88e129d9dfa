//! HTTP transport used by virtual users.
//!
//! [`HttpClient`] wraps a shared `reqwest::Client` configured once per run with the base
//! URL and the authentication headers. Sending a [`Request`] never fails: transport errors
//! come back inside the [`OperationResult`] so the caller can record them and move on.

use std::{collections::BTreeMap, time::Duration};

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION},
    Method, Url,
};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Header carrying the organization (tenant) identifier.
pub const ORGANIZATION_HEADER: &str = "x-organization-id";

/// Connection settings shared by every virtual user of a run.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub organization: Option<String>,
    pub timeout: Duration,
    pub headers: BTreeMap<String, String>,
}

impl HttpConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: None,
            organization: None,
            timeout: Duration::from_secs(60),
            headers: BTreeMap::new(),
        }
    }
}

/// Cheap to clone; all clones share one connection pool.
#[derive(Clone, Debug)]
pub struct HttpClient {
    inner: reqwest::Client,
    base_url: Url,
}

impl HttpClient {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("invalid base URL `{}`: {e}", config.base_url)))?;

        let mut headers = HeaderMap::new();
        if let Some(token) = &config.auth_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::Config(format!("invalid auth token: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(org) = &config.organization {
            headers.insert(ORGANIZATION_HEADER, header_value(org)?);
        }
        for (name, value) in &config.headers {
            headers.insert(header_name(name)?, header_value(value)?);
        }

        let inner = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        Ok(Self { inner, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Absolute URL for `path`. Absolute URLs are passed through untouched.
    pub fn url(&self, path: &str) -> Result<Url> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Url::parse(path)
                .map_err(|e| Error::Config(format!("invalid URL `{path}`: {e}")));
        }
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Url::parse(&format!("{base}/{path}"))
            .map_err(|e| Error::Config(format!("invalid path `{path}`: {e}")))
    }

    /// Issues `request` and waits for the whole response body.
    ///
    /// `duration` covers sending the request and receiving the full body.
    pub async fn send(&self, request: &Request) -> OperationResult {
        let url = match self.url(&request.path) {
            Ok(url) => url,
            Err(e) => return OperationResult::failed(request, Duration::ZERO, e.to_string()),
        };

        let mut builder = self.inner.request(request.method.clone(), url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let start = Instant::now();
        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => return OperationResult::failed(request, start.elapsed(), e.to_string()),
        };
        let status = response.status().as_u16();
        let bytes = response.bytes().await;
        let duration = start.elapsed();

        match bytes {
            Ok(bytes) => OperationResult {
                name: request.name.clone(),
                status: Some(status),
                duration,
                body: Body::parse(&bytes),
                error: None,
                expected: request.expect_status.clone(),
            },
            Err(e) => OperationResult {
                name: request.name.clone(),
                status: Some(status),
                duration,
                body: Body::Empty,
                error: Some(e.to_string()),
                expected: request.expect_status.clone(),
            },
        }
    }
}

fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::Config(format!("invalid header name `{name}`: {e}")))
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::Config(format!("invalid header value: {e}")))
}

/// One HTTP operation of a scenario.
///
/// `name` identifies the operation: its latency is recorded into a trend of that name.
#[derive(Clone, Debug)]
pub struct Request {
    pub name: String,
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Statuses counted as success. `None` means any 2xx or 3xx.
    pub expect_status: Option<Vec<u16>>,
}

impl Request {
    pub fn new(method: Method, name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method,
            path: path.into(),
            headers: Vec::new(),
            body: None,
            expect_status: None,
        }
    }

    pub fn get(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::GET, name, path)
    }

    pub fn post(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::POST, name, path)
    }

    pub fn put(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::PUT, name, path)
    }

    pub fn patch(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, name, path)
    }

    pub fn delete(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, name, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn expect(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.expect_status = Some(statuses.into_iter().collect());
        self
    }
}

/// Response body, decoded as JSON when possible.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Empty,
    Json(Value),
    Text(String),
}

impl Body {
    fn parse(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Body::Empty;
        }
        match serde_json::from_slice(bytes) {
            Ok(value) => Body::Json(value),
            Err(_) => Body::Text(String::from_utf8_lossy(bytes).into_owned()),
        }
    }
}

/// Outcome of one HTTP operation. Consumed by checks and metric writes, never retained.
#[derive(Clone, Debug)]
pub struct OperationResult {
    pub name: String,
    /// `None` when no response was received.
    pub status: Option<u16>,
    pub duration: Duration,
    pub body: Body,
    /// Transport error, if any.
    pub error: Option<String>,
    expected: Option<Vec<u16>>,
}

impl OperationResult {
    fn failed(request: &Request, duration: Duration, error: String) -> Self {
        Self {
            name: request.name.clone(),
            status: None,
            duration,
            body: Body::Empty,
            error: Some(error),
            expected: request.expect_status.clone(),
        }
    }

    /// A failed result for an operation that could not be attempted.
    pub(crate) fn synthetic_failure(request: &Request, error: &str) -> Self {
        Self::failed(request, Duration::ZERO, error.to_owned())
    }

    /// A result built without any I/O, for scripted responses and tests.
    pub fn synthetic(name: impl Into<String>, status: u16, duration: Duration, body: Body) -> Self {
        Self {
            name: name.into(),
            status: Some(status),
            duration,
            body,
            error: None,
            expected: None,
        }
    }

    /// Whether a response arrived at all, whatever its status.
    pub fn responded(&self) -> bool {
        self.status.is_some()
    }

    /// Response received, complete, and with an expected status.
    pub fn is_success(&self) -> bool {
        match (self.status, &self.error) {
            (Some(status), None) => match &self.expected {
                Some(expected) => expected.contains(&status),
                None => (200..400).contains(&status),
            },
            _ => false,
        }
    }

    /// Value at a dotted path of the JSON body, `None` if the body is not JSON or the
    /// path does not exist.
    pub fn json(&self, path: &str) -> Option<&Value> {
        match &self.body {
            Body::Json(value) => lookup(value, path),
            _ => None,
        }
    }
}

/// Looks up a dotted path (`data.items.0.id`) in a JSON value. Numeric segments index
/// arrays. An empty path, `$` or `.` return the value itself.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim_start_matches('$').trim_start_matches('.');
    if path.is_empty() {
        return Some(value);
    }
    let pointer: String = path
        .split('.')
        .map(|segment| format!("/{}", segment.replace('~', "~0").replace('/', "~1")))
        .collect();
    value.pointer(&pointer)
}
