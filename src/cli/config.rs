use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::bridge::ExpectedStatuses;
use crate::engine::http_client::DEFAULT_REQUEST_TIMEOUT;
use crate::engine::TestProfile;
use crate::error::ConfigError;
use crate::stats::elasticsearch::ElasticsearchSettings;
use crate::stats::metric::MetricKey;
use crate::stats::thresholds::ThresholdExpr;
use crate::utils::parse_duration;

pub const DEFAULT_VUS: usize = 1;
pub const DEFAULT_DURATION: &str = "10s";

/// A threshold written either as a bare expression or with abort settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum ThresholdSpec {
    Expr(String),
    Detailed(DetailedThreshold),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct DetailedThreshold {
    /// Expression such as `p(95) < 500`
    pub threshold: String,
    /// Stop the run as soon as this threshold fails
    #[serde(default, alias = "abortOnFail")]
    pub abort_on_fail: bool,
    /// Minimum run time before a failure may abort (e.g. "10s")
    #[serde(alias = "delayAbortEval")]
    pub delay_abort_eval: Option<String>,
}

/// An expected status code or an inclusive range of codes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum StatusRange {
    Code(u16),
    Range { min: u16, max: u16 },
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct Options {
    /// Number of concurrent virtual users
    #[serde(alias = "workers")]
    pub vus: Option<usize>,
    /// Duration of the test (e.g., "10s", "1m")
    pub duration: Option<String>,
    /// Pass/fail criteria: metric key (optionally `name{tag:value}`) to expressions
    #[serde(alias = "criteria")]
    pub thresholds: Option<BTreeMap<String, Vec<ThresholdSpec>>>,
    /// Time VUs get to finish their current iteration at the end of the run
    #[serde(alias = "gracefulStop", alias = "stop")]
    pub graceful_stop: Option<String>,
    /// How often thresholds are evaluated during the run
    #[serde(alias = "evaluationInterval")]
    pub evaluation_interval: Option<String>,
    /// Precision of trend percentiles, 1 to 5 significant digits
    #[serde(alias = "trendSignificantDigits")]
    pub trend_significant_digits: Option<u8>,
    /// Tags added to every metric record
    pub tags: Option<BTreeMap<String, String>>,
    /// Status codes counted as `expected_response:true` (default 200-399)
    #[serde(alias = "expectedStatuses")]
    pub expected_statuses: Option<Vec<StatusRange>>,
    /// Capacity of the metric channel between VUs and aggregation
    #[serde(alias = "metricBufferSize")]
    pub metric_buffer_size: Option<usize>,
    /// Per-request timeout (default 60s)
    #[serde(alias = "requestTimeout")]
    pub request_timeout: Option<String>,
    /// Settings for the `elasticsearch` output; environment and `--out` values win
    pub elasticsearch: Option<ElasticsearchSettings>,
}

impl Options {
    /// Environment and CLI values take precedence over the file.
    pub fn apply_overrides(&mut self, vus: Option<usize>, duration: Option<String>) {
        if vus.is_some() {
            self.vus = vus;
        }
        if duration.is_some() {
            self.duration = duration;
        }
    }

    pub fn request_timeout(&self) -> Result<Duration, ConfigError> {
        match &self.request_timeout {
            Some(s) => parse_duration("requestTimeout", s),
            None => Ok(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    /// Validate every option and build the run profile.
    pub fn into_profile(&self) -> Result<TestProfile, ConfigError> {
        let vus = self.vus.unwrap_or(DEFAULT_VUS);
        let duration = parse_duration("duration", self.duration.as_deref().unwrap_or(DEFAULT_DURATION))?;
        let mut profile = TestProfile::new(vus, duration);

        if let Some(thresholds) = &self.thresholds {
            for (metric, specs) in thresholds {
                let key = MetricKey::parse(metric)?;
                for spec in specs {
                    profile.add_threshold(threshold_expr(&key, spec)?);
                }
            }
        }

        if let Some(s) = &self.graceful_stop {
            profile.graceful_stop = parse_duration("gracefulStop", s)?;
        }
        if let Some(s) = &self.evaluation_interval {
            profile.evaluation_interval = parse_duration("evaluationInterval", s)?;
        }
        if let Some(digits) = self.trend_significant_digits {
            profile.trend_digits = digits;
        }
        if let Some(tags) = &self.tags {
            profile.tags = tags.clone();
        }
        if let Some(statuses) = &self.expected_statuses {
            profile.expected_statuses = expected_statuses(statuses)?;
        }
        profile.metric_buffer_size = self.metric_buffer_size;
        self.request_timeout()?;

        profile.validate()?;
        Ok(profile)
    }
}

fn threshold_expr(key: &MetricKey, spec: &ThresholdSpec) -> Result<ThresholdExpr, ConfigError> {
    match spec {
        ThresholdSpec::Expr(expr) => ThresholdExpr::parse(key.clone(), expr),
        ThresholdSpec::Detailed(d) => {
            let mut expr = ThresholdExpr::parse(key.clone(), &d.threshold)?.with_abort_on_fail(d.abort_on_fail);
            if let Some(delay) = &d.delay_abort_eval {
                expr = expr.with_delay_abort_eval(parse_duration("delayAbortEval", delay)?);
            }
            Ok(expr)
        }
    }
}

fn expected_statuses(ranges: &[StatusRange]) -> Result<ExpectedStatuses, ConfigError> {
    if ranges.is_empty() {
        return Err(ConfigError::InvalidOption {
            field: "expectedStatuses",
            reason: "at least one status or range is required".to_string(),
        });
    }
    let mut out = Vec::with_capacity(ranges.len());
    for range in ranges {
        let (min, max) = match *range {
            StatusRange::Code(code) => (code, code),
            StatusRange::Range { min, max } => (min, max),
        };
        if min > max || !(100..=599).contains(&min) || !(100..=599).contains(&max) {
            return Err(ConfigError::InvalidOption {
                field: "expectedStatuses",
                reason: format!("invalid status range {}-{}", min, max),
            });
        }
        out.push((min, max));
    }
    Ok(ExpectedStatuses::new(out))
}

/// One request of the declarative scenario.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct RequestSpec {
    /// Value of the `name` tag (defaults to the URL)
    pub name: Option<String>,
    /// HTTP method (default GET)
    pub method: Option<String>,
    pub url: String,
    pub headers: Option<BTreeMap<String, String>>,
    pub body: Option<String>,
    /// Checks run against every response, as a list or as a map of name to expression
    pub checks: Option<ChecksSpec>,
}

/// A check written as a bare expression (named after itself) or with a name.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum CheckSpec {
    /// Expression such as `status == 200` or `body contains ok`
    Expr(String),
    Named {
        /// Value of the `check` tag, e.g. `status is 200`
        name: String,
        check: String,
    },
}

/// The `checks` of a request: `[expr | {name, check}]` or `{name: expr}`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum ChecksSpec {
    List(Vec<CheckSpec>),
    /// Entries run in name order.
    Named(BTreeMap<String, String>),
}

impl ChecksSpec {
    /// `(name, expression)` pairs; the name is `None` for bare expressions.
    pub fn entries(&self) -> Vec<(Option<&str>, &str)> {
        match self {
            ChecksSpec::List(list) => list
                .iter()
                .map(|spec| match spec {
                    CheckSpec::Expr(expr) => (None, expr.as_str()),
                    CheckSpec::Named { name, check } => (Some(name.as_str()), check.as_str()),
                })
                .collect(),
            ChecksSpec::Named(map) => map
                .iter()
                .map(|(name, expr)| (Some(name.as_str()), expr.as_str()))
                .collect(),
        }
    }
}

/// Test definition file: run options plus the requests each iteration issues.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct TestDefinition {
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub requests: Vec<RequestSpec>,
}

impl TestDefinition {
    /// Load a YAML or JSON file, picked by extension (`.json` is JSON, anything else YAML).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        let parsed = if is_json {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(&content).map_err(|e| e.to_string())
        };
        parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }
}
