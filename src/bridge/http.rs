//! Request/response types exchanged between work units and the HTTP transport.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use hyper::body::Bytes;

use crate::error::TransportError;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    /// Value of the `name` tag; defaults to the URL.
    pub name: Option<String>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            name: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn tag_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }

    /// Approximate bytes on the wire: request line, headers, body.
    pub fn wire_size(&self) -> usize {
        let mut size = self.method.as_str().len() + 1 + self.url.len() + 11;
        for (k, v) in &self.headers {
            size += k.len() + 2 + v.len() + 2;
        }
        size + 2 + self.body.as_ref().map_or(0, String::len)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    /// `0` when the request never produced a response.
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    /// Time from sending the request to reading the last body byte.
    pub duration: Duration,
    pub request_size: usize,
    pub response_size: usize,
    /// Transport error message, set together with `status == 0`.
    pub error: Option<String>,
}

impl HttpResponse {
    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }
}

/// Issues single HTTP requests. Implemented by the hyper client and by test doubles.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Status ranges classified as `expected_response:true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedStatuses {
    ranges: Vec<(u16, u16)>,
}

impl ExpectedStatuses {
    pub fn new(ranges: Vec<(u16, u16)>) -> Self {
        Self { ranges }
    }

    pub fn contains(&self, status: u16) -> bool {
        status != 0
            && self
                .ranges
                .iter()
                .any(|(lo, hi)| (*lo..=*hi).contains(&status))
    }
}

impl Default for ExpectedStatuses {
    fn default() -> Self {
        Self::new(vec![(200, 399)])
    }
}
