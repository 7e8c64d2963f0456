//! End-of-test reporting: console text and the exportable JSON summary.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use serde::Serialize;

use super::metric::{MetricKey, CHECKS, TAG_CHECK};
use super::thresholds::ThresholdOutcome;
use super::{Aggregate, AggregateSummary};
use crate::engine::{RunResult, StopReason};
use crate::error::OutputError;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub passed: bool,
    pub aborted: bool,
    pub stop_reason: StopReason,
    pub elapsed_ms: f64,
    pub iterations_per_vu: Vec<u64>,
}

/// Serializable view of a finished run.
///
/// `metrics` holds one entry per metric name (all tag sets merged) plus one
/// entry per tag-filtered threshold key, named as written in the thresholds.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub state: RunState,
    pub metrics: BTreeMap<String, AggregateSummary>,
    pub thresholds: Vec<ThresholdOutcome>,
}

impl RunSummary {
    pub fn from_result(result: &RunResult) -> Self {
        let elapsed = result.elapsed;
        let mut metrics: BTreeMap<String, AggregateSummary> = result
            .snapshot
            .by_name()
            .into_iter()
            .map(|(name, agg)| (name, agg.summary(elapsed)))
            .collect();

        for outcome in &result.thresholds {
            if outcome.metric.tags.is_empty() {
                continue;
            }
            if let Some(agg) = result.snapshot.resolve(&outcome.metric) {
                metrics.insert(outcome.metric.to_string(), agg.summary(elapsed));
            }
        }

        Self {
            state: RunState {
                passed: result.passed(),
                aborted: result.aborted,
                stop_reason: result.stop_reason,
                elapsed_ms: elapsed.as_secs_f64() * 1000.0,
                iterations_per_vu: result.vu_iterations.clone(),
            },
            metrics,
            thresholds: result.thresholds.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, OutputError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn export(&self, path: &Path) -> Result<(), OutputError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

const LABEL_WIDTH: usize = 28;

fn label(name: &str) -> String {
    let dots = LABEL_WIDTH.saturating_sub(name.len());
    format!("{}{}", name, ".".repeat(dots.max(1)))
}

fn fmt_aggregate(agg: &Aggregate, s: &AggregateSummary) -> String {
    let num = |v: Option<f64>| v.unwrap_or(0.0);
    match agg {
        Aggregate::Counter(_) => format!("{} ({:.2}/s)", trim_float(num(s.sum)), num(s.rate)),
        Aggregate::Gauge(_) => format!(
            "{} (min={}, max={})",
            trim_float(num(s.value)),
            trim_float(num(s.min)),
            trim_float(num(s.max))
        ),
        Aggregate::Rate(_) => format!(
            "{:.2}% ({}/{})",
            num(s.rate) * 100.0,
            s.passes.unwrap_or(0),
            s.count
        ),
        Aggregate::Trend(_) => format!(
            "avg={:.2} min={:.2} med={:.2} max={:.2} p(90)={:.2} p(95)={:.2}",
            num(s.avg),
            num(s.min),
            num(s.med),
            num(s.max),
            num(s.p90),
            num(s.p95)
        ),
    }
}

fn trim_float(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{:.2}", v)
    }
}

/// Console summary printed when a run ends.
pub fn render_text(result: &RunResult) -> String {
    let mut out = String::new();
    let elapsed = result.elapsed;

    let _ = writeln!(out, "\n--- Test Summary ---");
    let status = if result.aborted {
        format!("aborted ({})", result.stop_reason)
    } else if result.passed() {
        "passed".to_string()
    } else {
        "thresholds failed".to_string()
    };
    let _ = writeln!(out, "Status:         {}", status);
    let _ = writeln!(out, "Duration:       {:.2}s", elapsed.as_secs_f64());
    let total_iterations: u64 = result.vu_iterations.iter().sum();
    let _ = writeln!(
        out,
        "VUs:            {} ({} iterations)",
        result.vu_iterations.len(),
        total_iterations
    );

    let by_name = result.snapshot.by_name();
    if by_name.is_empty() {
        let _ = writeln!(out, "No metrics collected.");
    } else {
        let _ = writeln!(out, "\nMetrics:");
        for (name, agg) in &by_name {
            let s = agg.summary(elapsed);
            let _ = writeln!(out, "  {}: {}", label(name), fmt_aggregate(agg, &s));
        }
    }

    let checks: Vec<(&MetricKey, &Aggregate)> = result
        .snapshot
        .aggregates
        .iter()
        .filter(|(k, _)| k.name == CHECKS && k.tags.contains_key(TAG_CHECK))
        .collect();
    if !checks.is_empty() {
        let mut per_check: BTreeMap<&str, Aggregate> = BTreeMap::new();
        for (key, agg) in checks {
            let name = key.tags[TAG_CHECK].as_str();
            match per_check.get_mut(name) {
                Some(acc) => {
                    let _ = acc.merge(agg);
                }
                None => {
                    per_check.insert(name, agg.clone());
                }
            }
        }

        let _ = writeln!(out, "\nChecks:");
        for (name, agg) in per_check {
            let s = agg.summary(elapsed);
            let passes = s.passes.unwrap_or(0);
            let fails = s.fails.unwrap_or(0);
            if fails > 0 {
                let percent = s.rate.unwrap_or(0.0) * 100.0;
                let _ = writeln!(
                    out,
                    "  ✗ {} : {:.2}% ({} passed, {} failed)",
                    name, percent, passes, fails
                );
            } else {
                let _ = writeln!(out, "  ✓ {} : 100% ({} passed)", name, passes);
            }
        }
    }

    if !result.thresholds.is_empty() {
        let _ = writeln!(out, "\nThresholds:");
        for t in &result.thresholds {
            let mark = if t.passed() { "✓" } else { "✗" };
            let observed = t
                .observed
                .map(|v| format!("{:.2}", v))
                .unwrap_or_else(|| "no data".to_string());
            let _ = writeln!(
                out,
                "  {} {}: {} (observed: {})",
                mark, t.metric, t.threshold, observed
            );
        }
    }

    let _ = writeln!(out, "--------------------");
    out
}
