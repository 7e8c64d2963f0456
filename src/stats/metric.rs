//! Metric stream records and the producer handle VUs emit them through.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

pub const HTTP_REQS: &str = "http_reqs";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const DATA_SENT: &str = "data_sent";
pub const DATA_RECEIVED: &str = "data_received";
pub const CHECKS: &str = "checks";
pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const VUS: &str = "vus";
pub const VUS_MAX: &str = "vus_max";

pub const TAG_EXPECTED_RESPONSE: &str = "expected_response";
pub const TAG_CHECK: &str = "check";
pub const TAG_METHOD: &str = "method";
pub const TAG_STATUS: &str = "status";
pub const TAG_NAME: &str = "name";

/// Kind of a metric, decided by the first record seen for its key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    #[default]
    Counter,
    Gauge,
    Rate,
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
        };
        f.write_str(s)
    }
}

/// Kind of the metrics the engine emits on its own.
pub fn builtin_kind(name: &str) -> Option<MetricKind> {
    match name {
        HTTP_REQS | DATA_SENT | DATA_RECEIVED | ITERATIONS => Some(MetricKind::Counter),
        HTTP_REQ_DURATION | ITERATION_DURATION => Some(MetricKind::Trend),
        HTTP_REQ_FAILED | CHECKS => Some(MetricKind::Rate),
        VUS | VUS_MAX => Some(MetricKind::Gauge),
        _ => None,
    }
}

/// Metric name plus tag set. Records with equal keys feed the same aggregate.
///
/// Written as `name` or `name{tag:value,other:value}`; this form is used both
/// in threshold definitions and when a key is serialized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    pub name: String,
    pub tags: BTreeMap<String, String>,
}

impl MetricKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Parse `name{tag:value,...}`.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidMetricKey {
            key: s.to_string(),
            reason: reason.to_string(),
        };

        let s_trim = s.trim();
        let (name, tag_part) = match s_trim.find('{') {
            Some(open) => {
                let rest = &s_trim[open + 1..];
                let inner = rest
                    .strip_suffix('}')
                    .ok_or_else(|| invalid("missing closing `}`"))?;
                (&s_trim[..open], Some(inner))
            }
            None => (s_trim, None),
        };

        let name = name.trim();
        if name.is_empty() {
            return Err(invalid("empty metric name"));
        }
        if name.contains('}') {
            return Err(invalid("unexpected `}`"));
        }

        let mut key = MetricKey::new(name);
        if let Some(inner) = tag_part {
            if inner.contains('{') || inner.contains('}') {
                return Err(invalid("nested braces in tag filter"));
            }
            for pair in inner.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let (k, v) = pair
                    .split_once(':')
                    .ok_or_else(|| invalid("tag filter entries must be `tag:value`"))?;
                let (k, v) = (k.trim(), v.trim());
                if k.is_empty() {
                    return Err(invalid("empty tag name"));
                }
                key.tags.insert(k.to_string(), v.to_string());
            }
        }
        Ok(key)
    }

    /// True if `self` has the filter's name and carries every tag of the filter.
    pub fn matches(&self, filter: &MetricKey) -> bool {
        self.name == filter.name
            && filter
                .tags
                .iter()
                .all(|(k, v)| self.tags.get(k).is_some_and(|own| own == v))
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.tags.is_empty() {
            f.write_str("{")?;
            for (i, (k, v)) in self.tags.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{}:{}", k, v)?;
            }
            f.write_str("}")?;
        }
        Ok(())
    }
}

impl FromStr for MetricKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricKey::parse(s)
    }
}

impl Serialize for MetricKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MetricKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        MetricKey::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// One immutable measurement. Rate records use `1.0` for success and `0.0` for failure.
#[derive(Debug, Clone)]
pub struct MetricRecord {
    pub key: MetricKey,
    pub kind: MetricKind,
    pub value: f64,
    pub timestamp: Instant,
}

impl MetricRecord {
    pub fn new(key: MetricKey, kind: MetricKind, value: f64) -> Self {
        Self {
            key,
            kind,
            value,
            timestamp: Instant::now(),
        }
    }
}

/// Producer side of the metric stream. Cheap to clone; one per VU.
///
/// Run-wide tags are merged into every record; a record's own tags win on conflict.
#[derive(Clone)]
pub struct MetricSink {
    tx: Sender<MetricRecord>,
    run_tags: Arc<BTreeMap<String, String>>,
    /// Kind each custom metric name was first emitted with, shared by every clone.
    custom_kinds: Arc<RwLock<HashMap<String, MetricKind>>>,
}

impl MetricSink {
    pub fn new(tx: Sender<MetricRecord>, run_tags: BTreeMap<String, String>) -> Self {
        Self {
            tx,
            run_tags: Arc::new(run_tags),
            custom_kinds: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Binds `name` to `kind` on first use. Returns the bound kind when it differs.
    pub(crate) fn claim_kind(&self, name: &str, kind: MetricKind) -> Result<(), MetricKind> {
        if let Some(&bound) = self.custom_kinds.read().get(name) {
            return if bound == kind { Ok(()) } else { Err(bound) };
        }
        let mut kinds = self.custom_kinds.write();
        let bound = *kinds.entry(name.to_string()).or_insert(kind);
        if bound == kind {
            Ok(())
        } else {
            Err(bound)
        }
    }

    pub fn emit(&self, mut key: MetricKey, kind: MetricKind, value: f64) {
        for (k, v) in self.run_tags.iter() {
            key.tags.entry(k.clone()).or_insert_with(|| v.clone());
        }
        // Blocks when the stream is full; ingestion threads drain it independently of the VUs.
        // A send error means ingestion has shut down, after which records are dropped.
        let _ = self.tx.send(MetricRecord::new(key, kind, value));
    }

    pub fn counter(&self, key: MetricKey, value: f64) {
        self.emit(key, MetricKind::Counter, value);
    }

    pub fn gauge(&self, key: MetricKey, value: f64) {
        self.emit(key, MetricKind::Gauge, value);
    }

    pub fn rate(&self, key: MetricKey, success: bool) {
        self.emit(key, MetricKind::Rate, if success { 1.0 } else { 0.0 });
    }

    pub fn trend(&self, key: MetricKey, value: f64) {
        self.emit(key, MetricKind::Trend, value);
    }
}
