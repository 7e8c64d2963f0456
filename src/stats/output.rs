//! Metric outputs: sinks that receive every raw record during the run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::warn;

use super::elasticsearch::{ElasticsearchConfig, ElasticsearchOutput, ElasticsearchSettings};
use super::json::JsonOutput;
use super::metric::MetricRecord;
use crate::error::{ConfigError, OutputError};
use crate::utils::parse_duration;

pub const DEFAULT_FLUSH_PERIOD: Duration = Duration::from_secs(1);

/// Records an output keeps for retry after a failed write; older ones are dropped first.
pub const MAX_PENDING_RECORDS: usize = 1_000_000;

/// A destination for raw metric records.
///
/// `add_records` is called from the ingestion threads and must not block on
/// I/O; outputs buffer and write from their own flusher.
pub trait Output: Send + Sync {
    fn description(&self) -> String;
    fn start(&mut self) -> Result<(), OutputError>;
    fn add_records(&self, records: &[MetricRecord]);
    /// Flush what is buffered and release resources.
    fn stop(&mut self) -> Result<(), OutputError>;
}

/// Records an output has received but not yet written.
pub(crate) struct RecordBuffer {
    records: Mutex<Vec<MetricRecord>>,
    /// Bound applied when unwritten records are put back.
    capacity: usize,
}

impl Default for RecordBuffer {
    fn default() -> Self {
        Self::with_capacity(MAX_PENDING_RECORDS)
    }
}

impl RecordBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub(crate) fn extend(&self, records: &[MetricRecord]) {
        self.records.lock().extend_from_slice(records);
    }

    pub(crate) fn take(&self) -> Vec<MetricRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    pub(crate) fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Put unwritten records back ahead of those buffered since.
    pub(crate) fn requeue(&self, mut unwritten: Vec<MetricRecord>, output: &str) {
        let mut records = self.records.lock();
        unwritten.append(&mut records);
        if unwritten.len() > self.capacity {
            let dropped = unwritten.len() - self.capacity;
            unwritten.drain(..dropped);
            warn!("{} output backlog full, dropped {} metric records", output, dropped);
        }
        *records = unwritten;
    }
}

/// Maps monotonic record timestamps to wall-clock time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    instant: Instant,
    wall: DateTime<Utc>,
}

impl Clock {
    pub(crate) fn now() -> Self {
        Self {
            instant: Instant::now(),
            wall: Utc::now(),
        }
    }

    pub(crate) fn wall_time(&self, at: Instant) -> DateTime<Utc> {
        let offset = |d: Duration| chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero());
        if at >= self.instant {
            self.wall + offset(at - self.instant)
        } else {
            self.wall - offset(self.instant - at)
        }
    }
}

/// Background thread calling `flush` every `period`, and once more on stop.
pub struct PeriodicFlusher {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicFlusher {
    pub fn start<F>(period: Duration, mut flush: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("output-flusher".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => flush(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        flush();
                        break;
                    }
                }
            })?;
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Final flush, then join. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Output flusher thread panicked");
            }
        }
    }
}

impl Drop for PeriodicFlusher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// What an output may read besides its `--out` argument.
#[derive(Debug, Clone, Default)]
pub struct OutputParams {
    /// `options.elasticsearch` from the test definition.
    pub elasticsearch: Option<ElasticsearchSettings>,
    /// Process environment, for `BARRAGE_ELASTICSEARCH_*`.
    pub env: HashMap<String, String>,
}

/// Parsed `--out` argument.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputConfig {
    Json { path: PathBuf, flush_period: Duration },
    /// Settings from the argument only; merged with file and environment on build.
    Elasticsearch(ElasticsearchSettings),
}

impl OutputConfig {
    /// Parse `json=<path>[,flushPeriod=<duration>]` or `elasticsearch[=<key>=<value>,...]`.
    pub fn parse(arg: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidOutput {
            arg: arg.to_string(),
            reason: reason.to_string(),
        };

        let (kind, rest) = arg.split_once('=').unwrap_or((arg, ""));

        match kind.trim() {
            "json" => {
                let mut parts = rest.split(',');
                let path = parts.next().map(str::trim).unwrap_or_default();
                if path.is_empty() {
                    return Err(invalid("missing file path"));
                }
                let mut flush_period = DEFAULT_FLUSH_PERIOD;
                for opt in parts {
                    let (k, v) = opt
                        .split_once('=')
                        .ok_or_else(|| invalid("options must be `key=value`"))?;
                    match k.trim() {
                        "flushPeriod" | "flush_period" => {
                            flush_period = parse_duration("flushPeriod", v)?;
                            if flush_period.is_zero() {
                                return Err(invalid("flushPeriod must be greater than zero"));
                            }
                        }
                        other => return Err(invalid(&format!("unknown option `{}`", other))),
                    }
                }
                Ok(OutputConfig::Json {
                    path: PathBuf::from(path),
                    flush_period,
                })
            }
            "elasticsearch" => ElasticsearchSettings::from_arg(rest)
                .map(OutputConfig::Elasticsearch)
                .map_err(|e| invalid(&e.to_string())),
            other => Err(invalid(&format!("unknown output type `{}`", other))),
        }
    }

    pub fn build(&self, params: &OutputParams) -> Result<Box<dyn Output>, OutputError> {
        match self {
            OutputConfig::Json { path, flush_period } => {
                Ok(Box::new(JsonOutput::new(path.clone(), *flush_period)))
            }
            OutputConfig::Elasticsearch(arg) => {
                let config = ElasticsearchConfig::consolidate(params.elasticsearch.as_ref(), &params.env, arg)?;
                Ok(Box::new(ElasticsearchOutput::new(config)?))
            }
        }
    }
}
