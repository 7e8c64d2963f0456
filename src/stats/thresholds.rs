//! Threshold expressions and their evaluation against aggregate snapshots.
//!
//! An expression such as `p(95) < 500` or `rate>5` is parsed once into a
//! [`ThresholdExpr`] when the profile is built. Evaluation only reads a
//! [`Snapshot`]; it never touches live aggregates.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::metric::{builtin_kind, MetricKey, MetricKind};
use super::{Aggregate, Snapshot};
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl Comparator {
    /// Longest operators first so `<=` is not read as `<`.
    const TOKENS: [(&'static str, Comparator); 5] = [
        ("<=", Comparator::Le),
        (">=", Comparator::Ge),
        ("==", Comparator::Eq),
        ("<", Comparator::Lt),
        (">", Comparator::Gt),
    ];

    /// Split `lhs <op> rhs` at the first comparator.
    pub fn split(s: &str) -> Option<(&str, Comparator, &str)> {
        let (pos, token, comparator) = Self::TOKENS
            .iter()
            .filter_map(|(tok, cmp)| s.find(tok).map(|pos| (pos, *tok, *cmp)))
            .min_by_key(|(pos, tok, _)| (*pos, std::cmp::Reverse(tok.len())))?;
        Some((&s[..pos], comparator, &s[pos + token.len()..]))
    }

    pub fn compare(self, observed: f64, literal: f64) -> bool {
        match self {
            Comparator::Lt => observed < literal,
            Comparator::Le => observed <= literal,
            Comparator::Gt => observed > literal,
            Comparator::Ge => observed >= literal,
            Comparator::Eq => (observed - literal).abs() < f64::EPSILON,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "==",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Statistic {
    Count,
    Rate,
    Value,
    Avg,
    Min,
    Max,
    Med,
    /// Percentile in `[0, 100]`.
    Percentile(f64),
}

impl Statistic {
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim().to_ascii_lowercase();
        let stat = match s.as_str() {
            "count" => Statistic::Count,
            "rate" => Statistic::Rate,
            "value" => Statistic::Value,
            "avg" => Statistic::Avg,
            "min" => Statistic::Min,
            "max" => Statistic::Max,
            "med" => Statistic::Med,
            other => {
                let inner = other
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .or_else(|| other.strip_prefix('p'))
                    .ok_or_else(|| format!("unknown statistic `{}`", other))?;
                let p: f64 = inner
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid percentile `{}`", other))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(format!("percentile {} is outside 0-100", p));
                }
                Statistic::Percentile(p)
            }
        };
        Ok(stat)
    }

    pub fn supported_by(&self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Counter => matches!(self, Statistic::Count | Statistic::Rate),
            MetricKind::Gauge => matches!(self, Statistic::Value | Statistic::Min | Statistic::Max),
            MetricKind::Rate => matches!(self, Statistic::Rate),
            MetricKind::Trend => !matches!(self, Statistic::Rate | Statistic::Value),
        }
    }

    /// Value of this statistic for `agg`, or `None` if its kind does not provide it.
    pub fn resolve(&self, agg: &Aggregate, elapsed: Duration) -> Option<f64> {
        if !self.supported_by(agg.kind()) {
            return None;
        }
        let s = agg.summary(elapsed);
        match (agg, self) {
            (Aggregate::Counter(_), Statistic::Count) => s.sum,
            (Aggregate::Counter(_), Statistic::Rate) => s.rate,
            (Aggregate::Gauge(_), Statistic::Value) => s.value,
            (Aggregate::Gauge(_), Statistic::Min) => s.min,
            (Aggregate::Gauge(_), Statistic::Max) => s.max,
            (Aggregate::Rate(_), Statistic::Rate) => s.rate,
            (Aggregate::Trend(_), Statistic::Count) => Some(s.count as f64),
            (Aggregate::Trend(_), Statistic::Avg) => s.avg,
            (Aggregate::Trend(_), Statistic::Min) => s.min,
            (Aggregate::Trend(_), Statistic::Max) => s.max,
            (Aggregate::Trend(_), Statistic::Med) => s.med,
            (Aggregate::Trend(t), Statistic::Percentile(p)) => Some(t.percentile(*p)),
            _ => None,
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statistic::Count => f.write_str("count"),
            Statistic::Rate => f.write_str("rate"),
            Statistic::Value => f.write_str("value"),
            Statistic::Avg => f.write_str("avg"),
            Statistic::Min => f.write_str("min"),
            Statistic::Max => f.write_str("max"),
            Statistic::Med => f.write_str("med"),
            Statistic::Percentile(p) => write!(f, "p({})", p),
        }
    }
}

/// One parsed threshold on one metric key.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdExpr {
    pub metric: MetricKey,
    pub statistic: Statistic,
    pub comparator: Comparator,
    pub literal: f64,
    pub abort_on_fail: bool,
    /// Minimum elapsed run time before a failure of this threshold may abort the run.
    pub delay_abort_eval: Duration,
    source: String,
}

impl ThresholdExpr {
    /// Parse `<statistic> <comparator> <number>` for `metric`.
    ///
    /// Fails if the statistic cannot apply to the kind of a built-in metric.
    /// Custom metric kinds are unknown until records arrive, so they are only
    /// checked at evaluation.
    pub fn parse(metric: MetricKey, source: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidThreshold {
            expr: source.to_string(),
            reason,
        };

        let (lhs, comparator, rhs) = Comparator::split(source)
            .ok_or_else(|| invalid("missing comparator (one of <, >, <=, >=, ==)".to_string()))?;
        let rhs = rhs.trim();
        if lhs.trim().is_empty() {
            return Err(invalid("missing statistic".to_string()));
        }
        let statistic = Statistic::parse(lhs).map_err(invalid)?;
        let literal: f64 = rhs
            .parse()
            .map_err(|_| invalid(format!("`{}` is not a number", rhs)))?;
        if !literal.is_finite() {
            return Err(invalid("threshold value must be finite".to_string()));
        }

        if let Some(kind) = builtin_kind(&metric.name) {
            if !statistic.supported_by(kind) {
                return Err(ConfigError::IncompatibleStatistic {
                    metric: metric.to_string(),
                    expr: source.to_string(),
                    statistic: statistic.to_string(),
                    kind,
                });
            }
        }

        Ok(Self {
            metric,
            statistic,
            comparator,
            literal,
            abort_on_fail: false,
            delay_abort_eval: Duration::ZERO,
            source: source.trim().to_string(),
        })
    }

    pub fn with_abort_on_fail(mut self, abort: bool) -> Self {
        self.abort_on_fail = abort;
        self
    }

    pub fn with_delay_abort_eval(mut self, delay: Duration) -> Self {
        self.delay_abort_eval = delay;
        self
    }

    /// Expression text as written, e.g. `p(95) < 500`.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Read-only check against `snapshot`. An absent metric fails.
    pub fn evaluate(&self, snapshot: &Snapshot) -> ThresholdOutcome {
        let observed = match snapshot.resolve(&self.metric) {
            None => {
                debug!(metric = %self.metric, threshold = %self.source, "No records for threshold metric yet");
                None
            }
            Some(agg) => {
                let value = self.statistic.resolve(&agg, snapshot.elapsed);
                if value.is_none() {
                    warn!(
                        metric = %self.metric,
                        threshold = %self.source,
                        "Statistic {} is not available for a {} metric",
                        self.statistic,
                        agg.kind()
                    );
                }
                value
            }
        };

        let outcome = match observed {
            Some(v) if self.comparator.compare(v, self.literal) => Outcome::Pass,
            _ => Outcome::Fail,
        };

        ThresholdOutcome {
            metric: self.metric.clone(),
            threshold: self.source.clone(),
            outcome,
            observed,
            abort_on_fail: self.abort_on_fail,
        }
    }
}

impl fmt::Display for ThresholdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.metric, self.source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdOutcome {
    pub metric: MetricKey,
    pub threshold: String,
    pub outcome: Outcome,
    /// Statistic value compared, absent when the metric had no matching records.
    pub observed: Option<f64>,
    #[serde(rename = "abortOnFail")]
    pub abort_on_fail: bool,
}

impl ThresholdOutcome {
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }
}

/// Result of one evaluation tick.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub outcomes: Vec<ThresholdOutcome>,
    /// Set if an aborting threshold failed after its abort delay.
    pub abort: bool,
}

impl Evaluation {
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(ThresholdOutcome::passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ThresholdOutcome> {
        self.outcomes.iter().filter(|o| !o.passed())
    }
}

/// Holds the run's thresholds and evaluates them all per tick.
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    thresholds: Vec<ThresholdExpr>,
}

impl Evaluator {
    pub fn new(thresholds: &BTreeMap<MetricKey, Vec<ThresholdExpr>>) -> Self {
        Self {
            thresholds: thresholds.values().flatten().cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    pub fn evaluate(&self, snapshot: &Snapshot) -> Evaluation {
        let mut abort = false;
        let outcomes = self
            .thresholds
            .iter()
            .map(|expr| {
                let outcome = expr.evaluate(snapshot);
                if !outcome.passed()
                    && expr.abort_on_fail
                    && snapshot.elapsed >= expr.delay_abort_eval
                {
                    abort = true;
                }
                outcome
            })
            .collect();
        Evaluation { outcomes, abort }
    }
}
