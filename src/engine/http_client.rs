use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::{Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::warn;

use crate::bridge::http::{HttpRequest, HttpResponse, Transport};
use crate::error::TransportError;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Pooled HTTP/1.1 + HTTP/2 client over rustls, shared by all VUs.
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Duration,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    pub fn new() -> Self {
        Self::with_pool_and_workers(2000, 1000)
    }

    /// `pool_size` is the idle connection limit per host. HTTP/2 windows shrink
    /// as `total_workers` grows to bound memory.
    pub fn with_pool_and_workers(pool_size: usize, total_workers: usize) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);

        let tls = match HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(e) => {
                warn!("Could not load native TLS roots, HTTPS targets will fail verification: {}", e);
                let config = rustls::ClientConfig::builder()
                    .with_root_certificates(rustls::RootCertStore::empty())
                    .with_no_client_auth();
                HttpsConnectorBuilder::new().with_tls_config(config)
            }
        };
        let https = tls
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let (conn_window, stream_window) = if total_workers > 5000 {
            (128 * 1024, 64 * 1024)
        } else if total_workers > 2000 {
            (256 * 1024, 128 * 1024)
        } else {
            (512 * 1024, 256 * 1024)
        };

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(pool_size)
            .http2_initial_connection_window_size(conn_window)
            .http2_initial_stream_window_size(stream_window)
            .build(https);

        Self {
            client,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// HTTP/1.1 client over a caller-built rustls config, for outputs with their own trust settings.
    pub(crate) fn with_tls_config(tls: rustls::ClientConfig, pool_size: usize) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(pool_size)
            .build(https);

        Self {
            client,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let uri: Uri = request
            .url
            .parse()
            .map_err(|e| TransportError::InvalidRequest(format!("{}: {}", request.url, e)))?;

        let mut builder = Request::builder().uri(uri).method(request.method.clone());
        for (k, v) in &request.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        let body = Bytes::from(request.body.clone().unwrap_or_default());
        let req = builder
            .body(Full::new(body))
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        let start = Instant::now();
        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let (parts, body_stream) = response.into_parts();
        // Always drain the body so the connection can return to the pool.
        let body = body_stream
            .collect()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?
            .to_bytes();
        let duration = start.elapsed();

        let mut headers = HashMap::with_capacity(parts.headers.len());
        // Status line: HTTP/1.1 STATUS REASON\r\n
        let mut response_size = body.len() + 15 + 2;
        for (k, v) in parts.headers.iter() {
            response_size += k.as_str().len() + 2 + v.len() + 2;
            headers.insert(
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            );
        }

        Ok(HttpResponse {
            status: parts.status.as_u16(),
            headers,
            body,
            duration,
            request_size: request.wire_size(),
            response_size,
            error: None,
        })
    }
}

#[async_trait]
impl Transport for HttpClient {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        match tokio::time::timeout(self.timeout, self.execute(request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_client_builds() {
        let client = HttpClient::with_pool_and_workers(50, 100)
            .with_timeout(Duration::from_secs(5));
        assert_eq!(client.timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let client = HttpClient::new();
        let err = client
            .send(&HttpRequest::get("not a url"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_request_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpClient::new().with_timeout(Duration::from_secs(5));
        let err = client
            .send(&HttpRequest::get(format!("http://{}/", addr)))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Request(_)), "Error was {:?}", err);
    }
}
