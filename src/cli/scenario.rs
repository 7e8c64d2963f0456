//! Declarative work unit built from the `requests` list of a test definition.

use std::sync::Arc;

use async_trait::async_trait;
use http::{Method, Uri};

use super::config::{RequestSpec, TestDefinition};
use crate::bridge::{HttpRequest, HttpResponse, VuContext, WorkUnit};
use crate::error::ConfigError;
use crate::stats::thresholds::Comparator;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Subject {
    Status,
    /// Milliseconds.
    Duration,
    BodySize,
}

#[derive(Debug, Clone, PartialEq)]
enum Assertion {
    Compare {
        subject: Subject,
        comparator: Comparator,
        literal: f64,
    },
    BodyContains(String),
}

/// A named check evaluated against every response of its request.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckExpr {
    name: String,
    assertion: Assertion,
}

impl CheckExpr {
    /// Accepts `status|duration|body_size <op> N` and `body contains TEXT`.
    pub fn parse(src: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidCheck {
            expr: src.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = src.trim();

        if let Some(needle) = trimmed.strip_prefix("body contains ") {
            let needle = needle.trim();
            if needle.is_empty() {
                return Err(invalid("missing text after `contains`"));
            }
            return Ok(Self {
                name: trimmed.to_string(),
                assertion: Assertion::BodyContains(needle.to_string()),
            });
        }

        let (lhs, comparator, rhs) =
            Comparator::split(trimmed).ok_or_else(|| invalid("expected `<subject> <op> <number>` or `body contains <text>`"))?;
        let subject = match lhs.trim() {
            "status" => Subject::Status,
            "duration" => Subject::Duration,
            "body_size" => Subject::BodySize,
            other => return Err(invalid(&format!("unknown subject `{}`", other))),
        };
        let literal: f64 = rhs
            .trim()
            .parse()
            .map_err(|_| invalid(&format!("`{}` is not a number", rhs.trim())))?;
        if !literal.is_finite() {
            return Err(invalid("literal must be finite"));
        }

        Ok(Self {
            name: trimmed.to_string(),
            assertion: Assertion::Compare {
                subject,
                comparator,
                literal,
            },
        })
    }

    /// Parse `src` but tag its results with `name` instead of the expression text.
    pub fn named(name: &str, src: &str) -> Result<Self, ConfigError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::InvalidCheck {
                expr: src.to_string(),
                reason: "check name is empty".to_string(),
            });
        }
        let mut check = Self::parse(src)?;
        check.name = name.to_string();
        Ok(check)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn eval(&self, response: &HttpResponse) -> bool {
        match &self.assertion {
            Assertion::BodyContains(needle) => response.body_text().contains(needle.as_str()),
            Assertion::Compare {
                subject,
                comparator,
                literal,
            } => {
                let observed = match subject {
                    Subject::Status => response.status as f64,
                    Subject::Duration => response.duration_ms(),
                    Subject::BodySize => response.body.len() as f64,
                };
                comparator.compare(observed, *literal)
            }
        }
    }
}

struct ScenarioRequest {
    request: HttpRequest,
    checks: Vec<CheckExpr>,
}

impl ScenarioRequest {
    fn from_spec(spec: &RequestSpec) -> Result<Self, ConfigError> {
        let label = spec.name.clone().unwrap_or_else(|| spec.url.clone());
        let invalid = |reason: String| ConfigError::InvalidRequest {
            request: label.clone(),
            reason,
        };

        let method_name = spec.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| invalid(format!("unknown method `{}`", method_name)))?;

        let uri: Uri = spec
            .url
            .parse()
            .map_err(|e| invalid(format!("bad url: {}", e)))?;
        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            _ => return Err(invalid("url must start with http:// or https://".to_string())),
        }
        if uri.host().is_none() {
            return Err(invalid("url has no host".to_string()));
        }

        let mut request = HttpRequest::new(method, spec.url.clone());
        if let Some(name) = &spec.name {
            request = request.name(name.clone());
        }
        if let Some(headers) = &spec.headers {
            for (k, v) in headers {
                request = request.header(k.clone(), v.clone());
            }
        }
        if let Some(body) = &spec.body {
            request = request.body(body.clone());
        }

        let checks = spec
            .checks
            .as_ref()
            .map(|c| c.entries())
            .unwrap_or_default()
            .into_iter()
            .map(|(name, expr)| match name {
                Some(name) => CheckExpr::named(name, expr),
                None => CheckExpr::parse(expr),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { request, checks })
    }
}

/// Issues every request of the definition in order, once per iteration.
pub struct ScenarioWorkUnit {
    requests: Vec<ScenarioRequest>,
}

impl ScenarioWorkUnit {
    pub fn from_definition(definition: &TestDefinition) -> Result<Arc<Self>, ConfigError> {
        if definition.requests.is_empty() {
            return Err(ConfigError::InvalidOption {
                field: "requests",
                reason: "at least one request is required".to_string(),
            });
        }
        let requests = definition
            .requests
            .iter()
            .map(ScenarioRequest::from_spec)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Arc::new(Self { requests }))
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[async_trait]
impl WorkUnit for ScenarioWorkUnit {
    async fn run(&self, vu: &mut VuContext) -> anyhow::Result<()> {
        for step in &self.requests {
            let response = vu.request(step.request.clone()).await;
            for check in &step.checks {
                let passed = check.eval(&response);
                vu.check(check.name(), passed);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::run_iteration;
    use crate::bridge::tests::{context, MockTransport};
    use crate::cli::config::{CheckSpec, ChecksSpec};
    use crate::stats::metric::{MetricRecord, CHECKS, HTTP_REQS};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn response(status: u16, body: &'static str, millis: u64) -> HttpResponse {
        HttpResponse {
            status,
            body: body.as_bytes().to_vec().into(),
            duration: Duration::from_millis(millis),
            ..Default::default()
        }
    }

    fn request(url: &str, checks: &[&str]) -> RequestSpec {
        RequestSpec {
            name: None,
            method: None,
            url: url.to_string(),
            headers: None,
            body: None,
            checks: Some(ChecksSpec::List(
                checks.iter().map(|c| CheckSpec::Expr(c.to_string())).collect(),
            )),
        }
    }

    #[test]
    fn test_check_expressions() {
        let ok = response(200, "hello world", 120);

        assert!(CheckExpr::parse("status == 200").unwrap().eval(&ok));
        assert!(!CheckExpr::parse("status==201").unwrap().eval(&ok));
        assert!(CheckExpr::parse("duration < 500").unwrap().eval(&ok));
        assert!(!CheckExpr::parse("duration<=100").unwrap().eval(&ok));
        assert!(CheckExpr::parse("body_size >= 11").unwrap().eval(&ok));
        assert!(CheckExpr::parse("body contains world").unwrap().eval(&ok));
        assert!(!CheckExpr::parse("body contains nope").unwrap().eval(&ok));

        let check = CheckExpr::parse("  status == 200 ").unwrap();
        assert_eq!(check.name(), "status == 200");
    }

    #[test]
    fn test_named_check_keeps_its_name() {
        let check = CheckExpr::named(" status is 200 ", "status == 200").unwrap();
        assert_eq!(check.name(), "status is 200");
        assert!(check.eval(&response(200, "", 5)));

        assert!(matches!(
            CheckExpr::named("  ", "status == 200"),
            Err(ConfigError::InvalidCheck { .. })
        ));
        assert!(matches!(
            CheckExpr::named("status is 200", "status is 200"),
            Err(ConfigError::InvalidCheck { .. })
        ));
    }

    #[tokio::test]
    async fn test_named_checks_tag_results_by_name() {
        let mut spec = request("http://test.local/", &[]);
        let mut named = BTreeMap::new();
        named.insert("status is 200".to_string(), "status == 200".to_string());
        named.insert("says ok".to_string(), "body contains ok".to_string());
        spec.checks = Some(ChecksSpec::Named(named));

        let def = TestDefinition {
            requests: vec![spec],
            ..Default::default()
        };
        let work = ScenarioWorkUnit::from_definition(&def).unwrap();
        let (mut ctx, rx) = context(MockTransport::ok(200, "ok"));
        run_iteration(work.as_ref(), &mut ctx).await;

        let tags: Vec<String> = rx
            .try_iter()
            .filter(|r| r.key.name == CHECKS)
            .map(|r| r.key.tags["check"].clone())
            .collect();
        assert_eq!(tags, vec!["says ok".to_string(), "status is 200".to_string()]);
    }

    #[test]
    fn test_malformed_checks() {
        for src in ["status", "latency < 5", "status == abc", "body contains ", "status == inf"] {
            assert!(
                matches!(CheckExpr::parse(src), Err(ConfigError::InvalidCheck { .. })),
                "{} should be rejected",
                src
            );
        }
    }

    #[test]
    fn test_request_validation() {
        let mut bad_method = request("http://localhost/", &[]);
        bad_method.method = Some("GE T".to_string());
        let def = TestDefinition {
            requests: vec![bad_method],
            ..Default::default()
        };
        assert!(matches!(
            ScenarioWorkUnit::from_definition(&def),
            Err(ConfigError::InvalidRequest { .. })
        ));

        let def = TestDefinition {
            requests: vec![request("ftp://localhost/", &[])],
            ..Default::default()
        };
        assert!(matches!(
            ScenarioWorkUnit::from_definition(&def),
            Err(ConfigError::InvalidRequest { .. })
        ));

        assert!(ScenarioWorkUnit::from_definition(&TestDefinition::default()).is_err());

        let def = TestDefinition {
            requests: vec![request("http://localhost/", &["nonsense"])],
            ..Default::default()
        };
        assert!(matches!(
            ScenarioWorkUnit::from_definition(&def),
            Err(ConfigError::InvalidCheck { .. })
        ));
    }

    #[tokio::test]
    async fn test_iteration_issues_requests_and_checks() {
        let mut post = request("http://test.local/items", &["status == 201"]);
        post.method = Some("post".to_string());
        post.name = Some("create".to_string());
        post.body = Some("{}".to_string());

        let def = TestDefinition {
            requests: vec![request("http://test.local/", &["status == 200", "body contains ok"]), post],
            ..Default::default()
        };
        let work = ScenarioWorkUnit::from_definition(&def).unwrap();
        assert_eq!(work.len(), 2);

        let (mut ctx, rx) = context(MockTransport::ok(200, "ok"));
        let outcome = run_iteration(work.as_ref(), &mut ctx).await;
        assert!(outcome.succeeded());

        let records: Vec<MetricRecord> = rx.try_iter().collect();
        let reqs: Vec<_> = records.iter().filter(|r| r.key.name == HTTP_REQS).collect();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[1].key.tags["method"], "POST");
        assert_eq!(reqs[1].key.tags["name"], "create");

        let checks: Vec<_> = records.iter().filter(|r| r.key.name == CHECKS).collect();
        assert_eq!(checks.len(), 3);
        assert_eq!(checks.iter().filter(|r| r.value == 1.0).count(), 2);
    }
}
