//! Custom metrics a work unit can emit alongside the built-in ones.

use tracing::warn;

use super::VuContext;
use crate::stats::metric::{builtin_kind, MetricKey, MetricKind};

fn custom_key(name: &str, tags: &[(&str, &str)]) -> MetricKey {
    tags.iter()
        .fold(MetricKey::new(name), |key, (k, v)| key.with_tag(*k, *v))
}

impl VuContext {
    fn emit_custom(&self, name: &str, kind: MetricKind, value: f64, tags: &[(&str, &str)]) {
        // A kind clash would fail ingestion and abort the run.
        if let Some(builtin) = builtin_kind(name) {
            if builtin != kind {
                warn!(
                    metric = name,
                    "Dropping {} record for built-in {} metric",
                    kind,
                    builtin
                );
                return;
            }
        }
        if !value.is_finite() {
            warn!(metric = name, "Dropping non-finite custom metric value {}", value);
            return;
        }
        if let Err(bound) = self.sink().claim_kind(name, kind) {
            warn!(
                metric = name,
                "Dropping {} record for custom metric first emitted as {}",
                kind,
                bound
            );
            return;
        }
        self.sink().emit(custom_key(name, tags), kind, value);
    }

    pub fn add_counter(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.emit_custom(name, MetricKind::Counter, value, tags);
    }

    pub fn set_gauge(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.emit_custom(name, MetricKind::Gauge, value, tags);
    }

    pub fn add_rate(&self, name: &str, success: bool, tags: &[(&str, &str)]) {
        self.emit_custom(name, MetricKind::Rate, if success { 1.0 } else { 0.0 }, tags);
    }

    /// Negative values are dropped: trends only hold non-negative samples.
    pub fn add_trend(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        if value < 0.0 {
            warn!(metric = name, "Dropping negative trend value {}", value);
            return;
        }
        self.emit_custom(name, MetricKind::Trend, value, tags);
    }
}
