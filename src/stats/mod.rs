use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::IngestError;

pub mod elasticsearch;
pub mod json;
pub mod metric;
pub mod output;
pub mod summary;
pub mod thresholds;
pub mod trend;

pub use metric::{MetricKey, MetricKind, MetricRecord, MetricSink};
pub use trend::TrendSummary;

/// Fixed-point scale for counter sums (micro-units), so totals are exact and order-independent.
const COUNTER_SCALE: f64 = 1_000_000.0;

#[derive(Debug, Clone, Default)]
pub struct CounterState {
    count: u64,
    sum_micros: i128,
}

impl CounterState {
    pub fn sum(&self) -> f64 {
        self.sum_micros as f64 / COUNTER_SCALE
    }
}

/// Latest value wins by timestamp; ties keep the larger value so the result is order-free.
#[derive(Debug, Clone)]
pub struct GaugeState {
    value: f64,
    latest_at: Option<Instant>,
    min: f64,
    max: f64,
    count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RateState {
    total: u64,
    successes: u64,
}

impl RateState {
    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successes as f64 / self.total as f64
        }
    }
}

/// Running state for one metric key.
#[derive(Debug, Clone)]
pub enum Aggregate {
    Counter(CounterState),
    Gauge(GaugeState),
    Rate(RateState),
    Trend(TrendSummary),
}

impl Aggregate {
    pub fn new(kind: MetricKind, trend_digits: u8) -> Result<Self, String> {
        Ok(match kind {
            MetricKind::Counter => Aggregate::Counter(CounterState::default()),
            MetricKind::Gauge => Aggregate::Gauge(GaugeState {
                value: 0.0,
                latest_at: None,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
                count: 0,
            }),
            MetricKind::Rate => Aggregate::Rate(RateState::default()),
            MetricKind::Trend => Aggregate::Trend(TrendSummary::new(trend_digits)?),
        })
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Aggregate::Counter(_) => MetricKind::Counter,
            Aggregate::Gauge(_) => MetricKind::Gauge,
            Aggregate::Rate(_) => MetricKind::Rate,
            Aggregate::Trend(_) => MetricKind::Trend,
        }
    }

    /// Number of records folded into this aggregate.
    pub fn count(&self) -> u64 {
        match self {
            Aggregate::Counter(c) => c.count,
            Aggregate::Gauge(g) => g.count,
            Aggregate::Rate(r) => r.total,
            Aggregate::Trend(t) => t.count(),
        }
    }

    /// Fold one record in. The caller has already checked the record's kind.
    fn update(&mut self, record: &MetricRecord) -> Result<(), IngestError> {
        let value = record.value;
        match self {
            Aggregate::Counter(c) => {
                c.count += 1;
                c.sum_micros += (value * COUNTER_SCALE).round() as i128;
            }
            Aggregate::Gauge(g) => {
                let newer = match g.latest_at {
                    None => true,
                    Some(at) => record.timestamp > at || (record.timestamp == at && value > g.value),
                };
                if newer {
                    g.value = value;
                    g.latest_at = Some(record.timestamp);
                }
                g.min = g.min.min(value);
                g.max = g.max.max(value);
                g.count += 1;
            }
            Aggregate::Rate(r) => {
                r.total += 1;
                if value != 0.0 {
                    r.successes += 1;
                }
            }
            Aggregate::Trend(t) => {
                if value < 0.0 {
                    return Err(IngestError::NegativeTrend {
                        metric: record.key.to_string(),
                        value,
                    });
                }
                t.record(value).map_err(|message| IngestError::Histogram {
                    metric: record.key.to_string(),
                    message,
                })?;
            }
        }
        Ok(())
    }

    /// Combine two aggregates of the same kind.
    pub fn merge(&mut self, other: &Aggregate) -> Result<(), String> {
        match (self, other) {
            (Aggregate::Counter(a), Aggregate::Counter(b)) => {
                a.count += b.count;
                a.sum_micros += b.sum_micros;
            }
            (Aggregate::Gauge(a), Aggregate::Gauge(b)) => {
                let take_other = match (a.latest_at, b.latest_at) {
                    (_, None) => false,
                    (None, Some(_)) => true,
                    (Some(x), Some(y)) => y > x || (y == x && b.value > a.value),
                };
                if take_other {
                    a.value = b.value;
                    a.latest_at = b.latest_at;
                }
                a.min = a.min.min(b.min);
                a.max = a.max.max(b.max);
                a.count += b.count;
            }
            (Aggregate::Rate(a), Aggregate::Rate(b)) => {
                a.total += b.total;
                a.successes += b.successes;
            }
            (Aggregate::Trend(a), Aggregate::Trend(b)) => a.merge(b)?,
            (a, b) => {
                return Err(format!("cannot merge a {} into a {}", b.kind(), a.kind()));
            }
        }
        Ok(())
    }

    /// Flat view used by reports and comparisons.
    pub fn summary(&self, elapsed: Duration) -> AggregateSummary {
        let mut s = AggregateSummary {
            kind: self.kind(),
            count: self.count(),
            ..Default::default()
        };
        match self {
            Aggregate::Counter(c) => {
                s.sum = Some(c.sum());
                s.rate = Some(per_second(c.sum(), elapsed));
            }
            Aggregate::Gauge(g) => {
                if g.count > 0 {
                    s.value = Some(g.value);
                    s.min = Some(g.min);
                    s.max = Some(g.max);
                }
            }
            Aggregate::Rate(r) => {
                s.rate = Some(r.rate());
                s.passes = Some(r.successes);
                s.fails = Some(r.total - r.successes);
            }
            Aggregate::Trend(t) => {
                s.sum = Some(t.sum());
                s.avg = Some(t.avg());
                s.min = Some(t.min());
                s.max = Some(t.max());
                s.med = Some(t.median());
                s.p90 = Some(t.percentile(90.0));
                s.p95 = Some(t.percentile(95.0));
                s.p99 = Some(t.percentile(99.0));
            }
        }
        s
    }
}

fn per_second(total: f64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        total / secs
    } else {
        0.0
    }
}

/// Serializable statistics of one aggregate. Fields a kind does not provide are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateSummary {
    #[serde(rename = "type")]
    pub kind: MetricKind,
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fails: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub med: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p90: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p99: Option<f64>,
}

type Slot = Arc<Mutex<Aggregate>>;

/// Concurrent per-key aggregation.
///
/// The outer map lock is only taken for writing the first time a key is seen;
/// every later update locks just that key's slot, so producers touching
/// different keys never contend.
pub struct Aggregator {
    slots: RwLock<HashMap<MetricKey, Slot>>,
    trend_digits: u8,
}

pub type SharedAggregator = Arc<Aggregator>;

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(3)
    }
}

impl Aggregator {
    pub fn new(trend_digits: u8) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            trend_digits,
        }
    }

    pub fn ingest(&self, record: MetricRecord) -> Result<(), IngestError> {
        if !record.value.is_finite() {
            return Err(IngestError::NonFinite {
                metric: record.key.to_string(),
                value: record.value,
            });
        }

        let slot = self.slot_for(&record)?;
        let mut agg = slot.lock();
        if agg.kind() != record.kind {
            return Err(IngestError::KindMismatch {
                metric: record.key.to_string(),
                expected: agg.kind(),
                found: record.kind,
            });
        }
        agg.update(&record)
    }

    fn slot_for(&self, record: &MetricRecord) -> Result<Slot, IngestError> {
        if let Some(slot) = self.slots.read().get(&record.key) {
            return Ok(slot.clone());
        }

        let mut slots = self.slots.write();
        if let Some(slot) = slots.get(&record.key) {
            return Ok(slot.clone());
        }
        let agg = Aggregate::new(record.kind, self.trend_digits).map_err(|message| {
            IngestError::Histogram {
                metric: record.key.to_string(),
                message,
            }
        })?;
        let slot = Arc::new(Mutex::new(agg));
        slots.insert(record.key.clone(), slot.clone());
        Ok(slot)
    }

    /// Point-in-time copy. Each aggregate is cloned under its own lock, so a
    /// snapshot never holds a half-applied update.
    pub fn snapshot(&self, elapsed: Duration) -> Snapshot {
        let slots: Vec<(MetricKey, Slot)> = self
            .slots
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let aggregates = slots
            .into_iter()
            .map(|(key, slot)| {
                let agg = slot.lock().clone();
                (key, agg)
            })
            .collect();

        Snapshot {
            aggregates,
            elapsed,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only aggregates at one point of the run.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub aggregates: BTreeMap<MetricKey, Aggregate>,
    /// Run time the snapshot covers; per-second rates divide by it.
    pub elapsed: Duration,
}

impl Snapshot {
    /// Merge of every aggregate whose key matches `filter` (same name, superset of its tags).
    /// `None` if nothing matched yet or the matches cannot be combined.
    pub fn resolve(&self, filter: &MetricKey) -> Option<Aggregate> {
        let mut merged: Option<Aggregate> = None;
        for (key, agg) in self.aggregates.iter().filter(|(k, _)| k.matches(filter)) {
            match merged.as_mut() {
                None => merged = Some(agg.clone()),
                Some(acc) => {
                    if let Err(e) = acc.merge(agg) {
                        warn!(metric = %key, filter = %filter, "Cannot combine aggregates: {}", e);
                        return None;
                    }
                }
            }
        }
        merged
    }

    /// Distinct metric names, each with the merge over all its tag sets.
    pub fn by_name(&self) -> BTreeMap<String, Aggregate> {
        let mut out: BTreeMap<String, Aggregate> = BTreeMap::new();
        let names: Vec<&str> = {
            let mut names: Vec<&str> = self.aggregates.keys().map(|k| k.name.as_str()).collect();
            names.dedup();
            names
        };
        for name in names {
            if let Some(agg) = self.resolve(&MetricKey::new(name)) {
                out.insert(name.to_string(), agg);
            }
        }
        out
    }
}
