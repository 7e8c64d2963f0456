use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use barrage::cli::config::TestDefinition;
use barrage::cli::scenario::ScenarioWorkUnit;
use barrage::error::TransportError;
use barrage::stats::summary::RunSummary;
use barrage::stats::thresholds::Outcome;
use barrage::{HttpRequest, HttpResponse, MetricKey, Scheduler, StopReason, Transport};

/// Answers every request with `200 ok` after a short delay.
struct LocalTransport {
    calls: AtomicUsize,
}

impl LocalTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(HttpResponse {
            status: 200,
            body: "ok".into(),
            duration: Duration::from_millis(10),
            request_size: request.wire_size(),
            response_size: 19,
            ..Default::default()
        })
    }
}

const DEFINITION: &str = r#"
options:
  vus: 5
  duration: 2s
  gracefulStop: 1s
  thresholds:
    "http_reqs{expected_response:true}":
      - "rate>5"
    checks:
      - "rate == 1"
    http_req_duration:
      - "p(95) < 500"
requests:
  - url: http://service.local/health
    name: health
    checks:
      - status is 200
"#;

fn definition(yaml: &str) -> TestDefinition {
    serde_yaml::from_str(yaml).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_passes_rate_and_check_thresholds() {
    let def = definition(&DEFINITION.replace("status is 200", "status == 200"));
    let profile = def.options.into_profile().unwrap();
    let work = ScenarioWorkUnit::from_definition(&def).unwrap();
    let transport = LocalTransport::new();

    let result = Scheduler::new(profile, work, transport.clone())
        .run_to_completion()
        .await
        .unwrap();

    assert_eq!(result.stop_reason, StopReason::DurationElapsed);
    assert!(!result.aborted);
    assert!(result.passed(), "thresholds: {:?}", result.thresholds);
    assert_eq!(result.thresholds.len(), 3);
    assert!(result.thresholds.iter().all(|t| t.outcome == Outcome::Pass));

    assert_eq!(result.vu_iterations.len(), 5);
    assert!(result.vu_iterations.iter().all(|&n| n > 0));
    assert_eq!(result.total_iterations() as usize, transport.calls.load(Ordering::SeqCst));

    let summary = RunSummary::from_result(&result);
    assert_eq!(summary.metrics["checks"].rate, Some(1.0));
    let reqs = result
        .resolve(&MetricKey::parse("http_reqs{expected_response:true}").unwrap())
        .unwrap();
    assert_eq!(reqs.count() as usize, transport.calls.load(Ordering::SeqCst));
    assert!(summary.metrics.contains_key("http_reqs{expected_response:true}"));
}

#[test]
fn test_unnamed_check_must_be_an_expression() {
    let def = definition(DEFINITION);
    assert!(def.options.into_profile().is_ok());
    assert!(ScenarioWorkUnit::from_definition(&def).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_named_check_is_reported_under_its_name() {
    let yaml = DEFINITION
        .replace("      - status is 200", "      status is 200: status == 200")
        .replace(
            "    checks:\n      - \"rate == 1\"",
            "    \"checks{check:status is 200}\":\n      - \"rate == 1\"",
        );
    let def = definition(&yaml);
    let profile = def.options.into_profile().unwrap();
    let work = ScenarioWorkUnit::from_definition(&def).unwrap();

    let result = Scheduler::new(profile, work, LocalTransport::new())
        .run_to_completion()
        .await
        .unwrap();

    assert!(result.passed(), "thresholds: {:?}", result.thresholds);
    assert!(result
        .thresholds
        .iter()
        .any(|t| t.metric.to_string() == "checks{check:status is 200}"));
    let named = result
        .resolve(&MetricKey::parse("checks{check:status is 200}").unwrap())
        .unwrap();
    assert!(named.count() > 0);

    let summary = RunSummary::from_result(&result);
    assert_eq!(summary.metrics["checks{check:status is 200}"].rate, Some(1.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_from_yaml_file_with_failing_threshold() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("test.yaml");
    std::fs::write(
        &path,
        "options:\n  vus: 2\n  duration: 500ms\n  thresholds:\n    http_req_failed:\n      - \"rate > 0.5\"\nrequests:\n  - url: http://service.local/\n",
    )
    .unwrap();

    let def = TestDefinition::load(&path).unwrap();
    let profile = def.options.into_profile().unwrap();
    assert_eq!(profile.vus, 2);
    let work = ScenarioWorkUnit::from_definition(&def).unwrap();

    let result = Scheduler::new(profile, work, LocalTransport::new())
        .run_to_completion()
        .await
        .unwrap();

    assert!(!result.passed());
    let outcome = &result.thresholds[0];
    assert_eq!(outcome.outcome, Outcome::Fail);
    assert_eq!(outcome.observed, Some(0.0));
}
