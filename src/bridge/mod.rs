//! Work-unit adapter.
//!
//! A [`WorkUnit`] is the per-iteration callback supplied by a test definition.
//! It performs requests and checks through a [`VuContext`], which turns every
//! observable side effect into metric records on the stream.

mod check;
pub mod http;
mod metrics;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::debug;

use crate::stats::metric::{
    MetricKey, MetricSink, DATA_RECEIVED, DATA_SENT, HTTP_REQS, HTTP_REQ_DURATION,
    HTTP_REQ_FAILED, ITERATIONS, ITERATION_DURATION, TAG_EXPECTED_RESPONSE, TAG_METHOD,
    TAG_NAME, TAG_STATUS,
};
pub use http::{ExpectedStatuses, HttpRequest, HttpResponse, Transport};

/// The unit of work a VU repeats. One call is one iteration.
///
/// Returning an error (or panicking) marks the iteration failed; it never
/// stops the VU.
#[async_trait]
pub trait WorkUnit: Send + Sync {
    async fn run(&self, vu: &mut VuContext) -> anyhow::Result<()>;
}

/// Everything a work unit may touch during an iteration. One per VU.
pub struct VuContext {
    vu_id: u64,
    iteration: u64,
    sink: MetricSink,
    transport: Arc<dyn Transport>,
    expected: Arc<ExpectedStatuses>,
}

impl VuContext {
    pub fn new(
        vu_id: u64,
        sink: MetricSink,
        transport: Arc<dyn Transport>,
        expected: Arc<ExpectedStatuses>,
    ) -> Self {
        Self {
            vu_id,
            iteration: 0,
            sink,
            transport,
            expected,
        }
    }

    pub fn vu_id(&self) -> u64 {
        self.vu_id
    }

    /// Zero-based index of the iteration in progress.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub(crate) fn sink(&self) -> &MetricSink {
        &self.sink
    }

    /// Send `request` and record the HTTP metrics for it.
    ///
    /// Transport failures do not surface as errors: the response comes back
    /// with status `0` and `error` set, and counts as an unexpected response.
    pub async fn request(&mut self, request: HttpRequest) -> HttpResponse {
        let start = Instant::now();
        let response = match self.transport.send(&request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(vu = self.vu_id, url = %request.url, "Request failed: {}", e);
                HttpResponse {
                    status: 0,
                    duration: start.elapsed(),
                    request_size: request.wire_size(),
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };
        self.record_request(&request, &response);
        response
    }

    pub async fn get(&mut self, url: impl Into<String>) -> HttpResponse {
        self.request(HttpRequest::get(url)).await
    }

    fn record_request(&self, request: &HttpRequest, response: &HttpResponse) {
        let expected = self.expected.contains(response.status);
        let key = |name: &str| {
            MetricKey::new(name)
                .with_tag(TAG_METHOD, request.method.as_str())
                .with_tag(TAG_STATUS, response.status.to_string())
                .with_tag(TAG_NAME, request.tag_name())
                .with_tag(TAG_EXPECTED_RESPONSE, expected.to_string())
        };

        self.sink.counter(key(HTTP_REQS), 1.0);
        self.sink.trend(key(HTTP_REQ_DURATION), response.duration_ms());
        self.sink.rate(key(HTTP_REQ_FAILED), !expected);
        self.sink.counter(key(DATA_SENT), response.request_size as f64);
        self.sink.counter(key(DATA_RECEIVED), response.response_size as f64);
    }
}

#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub duration: Duration,
    /// Error raised by the work unit, if the iteration failed.
    pub error: Option<String>,
}

impl IterationOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run the work unit once and record `iterations` and `iteration_duration`.
pub async fn run_iteration(work: &dyn WorkUnit, vu: &mut VuContext) -> IterationOutcome {
    let start = Instant::now();
    let result = AssertUnwindSafe(work.run(vu)).catch_unwind().await;
    let duration = start.elapsed();

    let error = match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(format!("{:#}", e)),
        Err(payload) => Some(format!("work unit panicked: {}", panic_message(payload.as_ref()))),
    };
    if let Some(e) = &error {
        debug!(vu = vu.vu_id, iteration = vu.iteration, "Iteration failed: {}", e);
    }

    let tag = error.is_none().to_string();
    vu.sink
        .counter(MetricKey::new(ITERATIONS).with_tag(TAG_EXPECTED_RESPONSE, tag.clone()), 1.0);
    vu.sink.trend(
        MetricKey::new(ITERATION_DURATION).with_tag(TAG_EXPECTED_RESPONSE, tag),
        duration.as_secs_f64() * 1000.0,
    );
    vu.iteration += 1;

    IterationOutcome { duration, error }
}
