//! Error taxonomy for the engine.
//!
//! Iteration failures and threshold breaches are not errors: they travel as
//! metric records and threshold outcomes. Only configuration problems (caught
//! before any VU starts) and engine-internal faults surface through these types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::stats::metric::MetricKind;

/// Invalid test profile or test definition. Always raised before a run starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `vus` must be a positive integer.
    #[error("vus must be greater than zero")]
    ZeroVus,

    /// A duration field could not be parsed.
    #[error("invalid duration `{value}` for {field}")]
    InvalidDuration {
        /// Option the value belongs to (e.g. `"duration"`).
        field: &'static str,
        /// Raw value as written in the test definition.
        value: String,
    },

    /// The test duration parsed to zero.
    #[error("duration must be greater than zero")]
    ZeroDuration,

    #[error("invalid metric key `{key}`: {reason}")]
    InvalidMetricKey { key: String, reason: String },

    #[error("invalid threshold `{expr}`: {reason}")]
    InvalidThreshold { expr: String, reason: String },

    /// A threshold asks a built-in metric for a statistic its kind cannot answer.
    #[error("threshold `{expr}` on `{metric}` uses `{statistic}`, which a {kind} metric does not provide")]
    IncompatibleStatistic {
        metric: String,
        expr: String,
        statistic: String,
        kind: MetricKind,
    },

    #[error("invalid check `{expr}`: {reason}")]
    InvalidCheck { expr: String, reason: String },

    #[error("invalid request `{request}`: {reason}")]
    InvalidRequest { request: String, reason: String },

    #[error("invalid option {field}: {reason}")]
    InvalidOption { field: &'static str, reason: String },

    #[error("invalid output `{arg}`: {reason}")]
    InvalidOutput { arg: String, reason: String },

    #[error("failed to read test definition {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse test definition {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
}

/// A metric record the aggregator refused. Treated as an engine bug: the run is aborted.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IngestError {
    #[error("metric `{metric}` received non-finite value {value}")]
    NonFinite { metric: String, value: f64 },

    #[error("trend `{metric}` received negative value {value}")]
    NegativeTrend { metric: String, value: f64 },

    /// The same metric key was first seen with one kind and later with another.
    #[error("metric `{metric}` is a {expected} but received a {found} record")]
    KindMismatch {
        metric: String,
        expected: MetricKind,
        found: MetricKind,
    },

    #[error("trend histogram error for `{metric}`: {message}")]
    Histogram { metric: String, message: String },
}

/// Failure of the run as a whole.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Metric ingestion failed; threshold results would be unreliable.
    #[error("metric ingestion failed: {0}")]
    Ingest(#[from] IngestError),

    #[error("engine runtime error: {0}")]
    Runtime(String),
}

/// Error returned by an HTTP transport for a single request.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

/// Error raised by a metric output. Outputs never abort a run once it started; these are logged.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("output I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode metric record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Certificates or keys for an output's TLS client could not be loaded.
    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("elasticsearch: {0}")]
    Elasticsearch(String),
}
