//! Virtual-user scheduler.
//!
//! A run spawns one tokio task per VU. Each VU repeats the work unit until the
//! shared [`RunControl`] is stopped, by duration expiry, an aborting threshold,
//! an operator or an ingestion failure. Records flow through a bounded channel
//! to a pool of ingestion threads feeding the [`Aggregator`]; the scheduler
//! thread evaluates thresholds against snapshots on a fixed cadence.
//!
//! VUs still running after the graceful stop are aborted. A VU that blocks its
//! thread cannot be aborted; it is abandoned and the run ends without it.

pub mod control;
pub mod http_client;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle as ThreadHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::bridge::{run_iteration, ExpectedStatuses, Transport, VuContext, WorkUnit};
use crate::error::{ConfigError, EngineError, IngestError};
use crate::stats::metric::{MetricKey, MetricRecord, MetricSink, VUS, VUS_MAX};
use crate::stats::output::Output;
use crate::stats::thresholds::{Evaluator, ThresholdExpr, ThresholdOutcome};
use crate::stats::{Aggregate, Aggregator, Snapshot};

pub use control::{RunControl, StopReason, VuState, VuStatus};

pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);
pub const DEFAULT_EVALUATION_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_TREND_DIGITS: u8 = 3;

/// Upper bound on waiting for the ingestion threads to drain after the VUs stop.
const INGEST_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
/// How long aborted VU tasks get to release their resources.
const CANCEL_WAIT: Duration = Duration::from_secs(1);
const DRAIN_POLL: Duration = Duration::from_millis(5);
/// Upper bound on `vus`.
pub const MAX_VUS: usize = 1_000_000;
pub const MAX_METRIC_BUFFER: usize = 10_000_000;
/// Upper bound on the run duration and the other run-level time options.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 3600);

/// Flat execution profile: a fixed number of VUs for a fixed duration.
#[derive(Debug, Clone)]
pub struct TestProfile {
    pub vus: usize,
    pub duration: Duration,
    pub thresholds: BTreeMap<MetricKey, Vec<ThresholdExpr>>,
    /// Time VUs get to finish their in-flight iteration once the run stops.
    pub graceful_stop: Duration,
    pub evaluation_interval: Duration,
    pub trend_digits: u8,
    /// Added to every metric record.
    pub tags: BTreeMap<String, String>,
    pub expected_statuses: ExpectedStatuses,
    /// Metric channel capacity; scaled from `vus` when unset.
    pub metric_buffer_size: Option<usize>,
}

impl TestProfile {
    pub fn new(vus: usize, duration: Duration) -> Self {
        Self {
            vus,
            duration,
            thresholds: BTreeMap::new(),
            graceful_stop: DEFAULT_GRACEFUL_STOP,
            evaluation_interval: DEFAULT_EVALUATION_INTERVAL,
            trend_digits: DEFAULT_TREND_DIGITS,
            tags: BTreeMap::new(),
            expected_statuses: ExpectedStatuses::default(),
            metric_buffer_size: None,
        }
    }

    /// Parse and add `expr` for `metric` (e.g. `http_reqs{expected_response:true}`).
    pub fn with_threshold(mut self, metric: &str, expr: &str) -> Result<Self, ConfigError> {
        let key = MetricKey::parse(metric)?;
        self.add_threshold(ThresholdExpr::parse(key, expr)?);
        Ok(self)
    }

    pub fn add_threshold(&mut self, expr: ThresholdExpr) {
        self.thresholds
            .entry(expr.metric.clone())
            .or_default()
            .push(expr);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vus == 0 {
            return Err(ConfigError::ZeroVus);
        }
        if self.vus > MAX_VUS {
            return Err(ConfigError::InvalidOption {
                field: "vus",
                reason: format!("{} exceeds the maximum of {}", self.vus, MAX_VUS),
            });
        }
        if self.duration.is_zero() {
            return Err(ConfigError::ZeroDuration);
        }
        for (field, value) in [
            ("duration", self.duration),
            ("gracefulStop", self.graceful_stop),
            ("evaluationInterval", self.evaluation_interval),
        ] {
            if value > MAX_DURATION {
                return Err(ConfigError::InvalidOption {
                    field,
                    reason: format!("{:?} exceeds the maximum of {:?}", value, MAX_DURATION),
                });
            }
        }
        if self.evaluation_interval.is_zero() {
            return Err(ConfigError::InvalidOption {
                field: "evaluationInterval",
                reason: "must be greater than zero".to_string(),
            });
        }
        if !(1..=5).contains(&self.trend_digits) {
            return Err(ConfigError::InvalidOption {
                field: "trendSignificantDigits",
                reason: format!("{} is outside 1-5", self.trend_digits),
            });
        }
        match self.metric_buffer_size {
            Some(0) => {
                return Err(ConfigError::InvalidOption {
                    field: "metricBufferSize",
                    reason: "must be greater than zero".to_string(),
                })
            }
            Some(size) if size > MAX_METRIC_BUFFER => {
                return Err(ConfigError::InvalidOption {
                    field: "metricBufferSize",
                    reason: format!("{} exceeds the maximum of {}", size, MAX_METRIC_BUFFER),
                })
            }
            _ => {}
        }
        Ok(())
    }

    fn channel_size(&self) -> usize {
        self.metric_buffer_size
            .unwrap_or_else(|| self.vus.saturating_mul(10).clamp(20_000, 100_000))
    }
}

/// Terminal artifact of a run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub snapshot: Snapshot,
    /// Outcomes of the final threshold evaluation.
    pub thresholds: Vec<ThresholdOutcome>,
    /// True when the run ended before its duration elapsed.
    pub aborted: bool,
    pub stop_reason: StopReason,
    pub elapsed: Duration,
    /// Completed iterations per VU, ordered by VU id.
    pub vu_iterations: Vec<u64>,
}

impl RunResult {
    /// AND of all threshold outcomes. A run without thresholds passes.
    pub fn passed(&self) -> bool {
        self.thresholds.iter().all(ThresholdOutcome::passed)
    }

    pub fn aggregates(&self) -> &BTreeMap<MetricKey, Aggregate> {
        &self.snapshot.aggregates
    }

    /// Aggregate for a tag-filtered key, merging all matching tag sets.
    pub fn resolve(&self, filter: &MetricKey) -> Option<Aggregate> {
        self.snapshot.resolve(filter)
    }

    pub fn total_iterations(&self) -> u64 {
        self.vu_iterations.iter().sum()
    }
}

/// A started run.
pub struct RunHandle {
    control: Arc<RunControl>,
    result: oneshot::Receiver<Result<RunResult, EngineError>>,
}

impl RunHandle {
    /// Operator stop. VUs finish their current iteration; idempotent.
    pub fn stop(&self) {
        if self.control.stop(StopReason::Operator) {
            info!("Stop requested by operator");
        }
    }

    pub fn control(&self) -> Arc<RunControl> {
        self.control.clone()
    }

    /// Wait for the run to end and return its result.
    pub async fn wait(self) -> Result<RunResult, EngineError> {
        self.result
            .await
            .map_err(|_| EngineError::Runtime("scheduler thread exited without a result".to_string()))?
    }
}

pub struct Scheduler {
    profile: TestProfile,
    work: Arc<dyn WorkUnit>,
    transport: Arc<dyn Transport>,
    outputs: Vec<Box<dyn Output>>,
}

impl Scheduler {
    pub fn new(profile: TestProfile, work: Arc<dyn WorkUnit>, transport: Arc<dyn Transport>) -> Self {
        Self {
            profile,
            work,
            transport,
            outputs: Vec::new(),
        }
    }

    pub fn with_output(mut self, output: Box<dyn Output>) -> Self {
        self.outputs.push(output);
        self
    }

    /// Validate the profile and start the run. Must be called within a tokio runtime.
    ///
    /// VUs are spawned on the calling runtime. Expiry, threshold evaluation and
    /// cancellation run on a dedicated scheduler thread, so VUs that block their
    /// worker threads cannot keep the run from ending.
    ///
    /// Configuration errors are returned here, before any VU is spawned.
    pub fn start(self) -> Result<RunHandle, EngineError> {
        self.profile.validate()?;
        let vu_runtime = Handle::try_current()
            .map_err(|e| EngineError::Runtime(format!("no tokio runtime to spawn VUs on: {}", e)))?;

        let control = Arc::new(RunControl::new());
        let (result_tx, result_rx) = oneshot::channel();
        let thread_control = control.clone();
        std::thread::Builder::new()
            .name("barrage-scheduler".to_string())
            .spawn(move || {
                let _ = result_tx.send(self.supervise(thread_control, vu_runtime));
            })
            .map_err(|e| EngineError::Runtime(format!("failed to spawn scheduler thread: {}", e)))?;

        Ok(RunHandle {
            control,
            result: result_rx,
        })
    }

    /// Start and wait in one call.
    pub async fn run_to_completion(self) -> Result<RunResult, EngineError> {
        self.start()?.wait().await
    }

    /// Body of the scheduler thread. Outputs start and stop here, outside any
    /// async context, since they may drive their own runtimes.
    fn supervise(self, control: Arc<RunControl>, vu_runtime: Handle) -> Result<RunResult, EngineError> {
        let Scheduler {
            profile,
            work,
            transport,
            outputs,
        } = self;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| EngineError::Runtime(format!("failed to build scheduler runtime: {}", e)))?;

        let outputs = Arc::new(start_outputs(outputs));
        let run = Run {
            profile,
            work,
            transport,
            outputs: outputs.clone(),
            control,
            vu_runtime,
        };
        let result = runtime.block_on(run.execute());
        runtime.shutdown_background();

        match Arc::try_unwrap(outputs) {
            Ok(outputs) => stop_outputs(outputs),
            Err(_) => warn!("Metric outputs still in use by ingestion threads; not stopped"),
        }
        result
    }
}

/// Everything one run owns while the scheduler thread drives it.
struct Run {
    profile: TestProfile,
    work: Arc<dyn WorkUnit>,
    transport: Arc<dyn Transport>,
    outputs: Arc<Vec<Box<dyn Output>>>,
    control: Arc<RunControl>,
    vu_runtime: Handle,
}

impl Run {
    async fn execute(self) -> Result<RunResult, EngineError> {
        let Run {
            profile,
            work,
            transport,
            outputs,
            control,
            vu_runtime,
        } = self;

        let aggregator = Arc::new(Aggregator::new(profile.trend_digits));
        let ingest_failure: Arc<Mutex<Option<IngestError>>> = Arc::new(Mutex::new(None));

        let (tx, rx) = crossbeam_channel::bounded(profile.channel_size());
        let num_ingesters = (num_cpus::get().max(2) / 2).max(1);
        let mut ingesters = Vec::with_capacity(num_ingesters);
        for id in 0..num_ingesters {
            let handle = spawn_ingester(
                id,
                rx.clone(),
                aggregator.clone(),
                outputs.clone(),
                control.clone(),
                ingest_failure.clone(),
            )
            .map_err(|e| EngineError::Runtime(format!("failed to spawn ingestion thread: {}", e)))?;
            ingesters.push(handle);
        }
        drop(outputs);
        // Kept only to observe the backlog; never received from.
        let backlog = rx;

        let sink = MetricSink::new(tx, profile.tags.clone());
        let expected = Arc::new(profile.expected_statuses.clone());
        let evaluator = Evaluator::new(&profile.thresholds);

        info!(
            vus = profile.vus,
            duration = ?profile.duration,
            thresholds = profile.thresholds.values().map(Vec::len).sum::<usize>(),
            "Starting run"
        );

        let start = Instant::now();
        let mut vus: Vec<(Arc<VuState>, JoinHandle<()>)> = Vec::with_capacity(profile.vus);
        for id in 1..=profile.vus as u64 {
            let state = VuState::new(id);
            let ctx = VuContext::new(id, sink.clone(), transport.clone(), expected.clone());
            let handle = vu_runtime.spawn(vu_loop(work.clone(), ctx, state.clone(), control.clone()));
            vus.push((state, handle));
        }
        emit_vu_gauges(&sink, &vus, profile.vus);

        let deadline = tokio::time::Instant::from_std(start + profile.duration);
        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + profile.evaluation_interval,
            profile.evaluation_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut expiry => {
                    control.stop(StopReason::DurationElapsed);
                    break;
                }
                _ = control.stopped() => break,
                _ = ticker.tick() => {
                    emit_vu_gauges(&sink, &vus, profile.vus);
                    if evaluator.is_empty() {
                        continue;
                    }
                    let snapshot = aggregator.snapshot(start.elapsed());
                    let evaluation = evaluator.evaluate(&snapshot);
                    for failed in evaluation.failures() {
                        debug!(metric = %failed.metric, threshold = %failed.threshold, observed = ?failed.observed, "Threshold failing");
                    }
                    if evaluation.abort {
                        if control.stop(StopReason::ThresholdAbort) {
                            error!("Aborting run: a threshold with abortOnFail failed");
                        }
                        break;
                    }
                }
            }
        }

        let reason = control.reason().unwrap_or(StopReason::DurationElapsed);
        info!(reason = %reason, elapsed = ?start.elapsed(), "Run stopping, waiting for VUs");

        let (vu_iterations, stuck) = stop_vus(vus, profile.graceful_stop).await;

        let elapsed = start.elapsed();
        drop(sink);
        drain_ingesters(ingesters, &backlog, stuck > 0).await;

        if let Some(e) = ingest_failure.lock().take() {
            error!("Run aborted by metric ingestion failure: {}", e);
            return Err(EngineError::Ingest(e));
        }

        let snapshot = aggregator.snapshot(elapsed);
        let evaluation = evaluator.evaluate(&snapshot);
        for failed in evaluation.failures() {
            warn!(
                metric = %failed.metric,
                threshold = %failed.threshold,
                observed = ?failed.observed,
                "Threshold failed"
            );
        }

        info!(
            elapsed = ?elapsed,
            iterations = vu_iterations.iter().sum::<u64>(),
            passed = evaluation.passed(),
            "Run finished"
        );

        Ok(RunResult {
            snapshot,
            thresholds: evaluation.outcomes,
            aborted: reason.is_abort(),
            stop_reason: reason,
            elapsed,
            vu_iterations,
        })
    }
}

/// Give VUs `grace` to finish their iteration, then abort the rest together.
///
/// Returns per-VU iteration counts and how many VU tasks never ended, which
/// happens when a work unit blocks its thread instead of awaiting.
async fn stop_vus(vus: Vec<(Arc<VuState>, JoinHandle<()>)>, grace: Duration) -> (Vec<u64>, usize) {
    let grace_deadline = tokio::time::Instant::now() + grace;
    let mut states = Vec::with_capacity(vus.len());
    let mut overdue = Vec::new();
    for (state, mut handle) in vus {
        match tokio::time::timeout_at(grace_deadline, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(vu = state.id, "VU task ended abnormally: {}", e),
            Err(_) => {
                handle.abort();
                overdue.push((state.clone(), handle));
            }
        }
        states.push(state);
    }

    let mut stuck = 0usize;
    if !overdue.is_empty() {
        warn!(
            "{} VU(s) did not finish within the graceful stop period of {:?} and were cancelled",
            overdue.len(),
            grace
        );
        let cancel_deadline = tokio::time::Instant::now() + CANCEL_WAIT;
        for (state, handle) in overdue {
            if tokio::time::timeout_at(cancel_deadline, handle).await.is_err() {
                stuck += 1;
            }
            state.set_status(VuStatus::Stopped);
        }
    }
    if stuck > 0 {
        error!("{} VU(s) are blocking their threads and could not be cancelled; abandoning them", stuck);
    }
    (states.iter().map(|s| s.iterations()).collect(), stuck)
}

async fn vu_loop(work: Arc<dyn WorkUnit>, mut ctx: VuContext, state: Arc<VuState>, control: Arc<RunControl>) {
    state.set_status(VuStatus::Running);
    while !control.is_stopped() {
        run_iteration(work.as_ref(), &mut ctx).await;
        state.complete_iteration();
        // Work units that never await would otherwise starve the other tasks on this worker.
        tokio::task::yield_now().await;
    }
    state.set_status(VuStatus::Stopped);
    debug!(vu = state.id, iterations = state.iterations(), "VU stopped");
}

fn emit_vu_gauges(sink: &MetricSink, vus: &[(Arc<VuState>, JoinHandle<()>)], max: usize) {
    let running = vus
        .iter()
        .filter(|(state, _)| state.status() == VuStatus::Running)
        .count();
    sink.gauge(MetricKey::new(VUS), running as f64);
    sink.gauge(MetricKey::new(VUS_MAX), max as f64);
}

fn spawn_ingester(
    id: usize,
    rx: Receiver<MetricRecord>,
    aggregator: Arc<Aggregator>,
    outputs: Arc<Vec<Box<dyn Output>>>,
    control: Arc<RunControl>,
    failure: Arc<Mutex<Option<IngestError>>>,
) -> std::io::Result<ThreadHandle<()>> {
    std::thread::Builder::new()
        .name(format!("metric-ingest-{}", id))
        .spawn(move || {
            // Keep draining after a failure so producers never block on a full channel.
            while let Ok(record) = rx.recv() {
                for output in outputs.iter() {
                    output.add_records(std::slice::from_ref(&record));
                }
                if let Err(e) = aggregator.ingest(record) {
                    let mut slot = failure.lock();
                    if slot.is_none() {
                        error!("Metric ingestion failed: {}", e);
                        *slot = Some(e);
                    }
                    drop(slot);
                    control.stop(StopReason::InternalError);
                }
            }
        })
}

/// Wait for the ingestion threads to drain the stream.
///
/// With every producer gone the threads exit once the channel is empty. An
/// abandoned VU still holds a sender, so then only the queued backlog is
/// awaited and the threads are left running.
async fn drain_ingesters(ingesters: Vec<ThreadHandle<()>>, backlog: &Receiver<MetricRecord>, abandoned: bool) {
    let deadline = tokio::time::Instant::now() + INGEST_DRAIN_TIMEOUT;
    loop {
        let finished = ingesters.iter().all(ThreadHandle::is_finished);
        if finished || (abandoned && backlog.is_empty()) {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("Metric ingestion did not drain within {:?}", INGEST_DRAIN_TIMEOUT);
            break;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }

    for handle in ingesters {
        if handle.is_finished() && handle.join().is_err() {
            error!("Metric ingestion thread panicked");
        }
    }
}

fn start_outputs(outputs: Vec<Box<dyn Output>>) -> Vec<Box<dyn Output>> {
    outputs
        .into_iter()
        .filter_map(|mut output| match output.start() {
            Ok(()) => {
                info!("Output started: {}", output.description());
                Some(output)
            }
            Err(e) => {
                warn!("Output {} failed to start and is disabled: {}", output.description(), e);
                None
            }
        })
        .collect()
}

fn stop_outputs(outputs: Vec<Box<dyn Output>>) {
    for mut output in outputs {
        if let Err(e) = output.stop() {
            warn!("Output {} failed to stop cleanly: {}", output.description(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{HttpRequest, HttpResponse};
    use crate::error::TransportError;
    use crate::stats::metric::{MetricKind, CHECKS, HTTP_REQS, ITERATIONS};
    use crate::stats::thresholds::Outcome;
    use async_trait::async_trait;

    struct Ok200;

    #[async_trait]
    impl Transport for Ok200 {
        async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
            tokio::time::sleep(Duration::from_millis(2)).await;
            Ok(HttpResponse {
                status: 200,
                duration: Duration::from_millis(2),
                request_size: request.wire_size(),
                response_size: 64,
                ..Default::default()
            })
        }
    }

    struct GetOnce;

    #[async_trait]
    impl WorkUnit for GetOnce {
        async fn run(&self, vu: &mut VuContext) -> anyhow::Result<()> {
            let res = vu.get("http://test.local/").await;
            vu.check("status is 200", res.status == 200);
            Ok(())
        }
    }

    struct AlwaysFailsCheck;

    #[async_trait]
    impl WorkUnit for AlwaysFailsCheck {
        async fn run(&self, vu: &mut VuContext) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            vu.check("never passes", false);
            Ok(())
        }
    }

    struct BlocksForever;

    #[async_trait]
    impl WorkUnit for BlocksForever {
        async fn run(&self, _vu: &mut VuContext) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    /// Alternates custom metric kinds for one name through the public API.
    struct CustomKindClash;

    #[async_trait]
    impl WorkUnit for CustomKindClash {
        async fn run(&self, vu: &mut VuContext) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            if vu.iteration() % 2 == 0 {
                vu.add_counter("clash", 1.0, &[]);
            } else {
                vu.add_trend("clash", 1.0, &[]);
            }
            Ok(())
        }
    }

    /// Bypasses the custom metric guards and feeds the stream conflicting kinds.
    struct RawKindClash;

    #[async_trait]
    impl WorkUnit for RawKindClash {
        async fn run(&self, vu: &mut VuContext) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            let kind = if vu.iteration() % 2 == 0 {
                MetricKind::Counter
            } else {
                MetricKind::Trend
            };
            vu.sink().emit(MetricKey::new("clash"), kind, 1.0);
            Ok(())
        }
    }

    /// Blocks its worker thread until `gate` is closed.
    struct BlocksThread {
        gate: crossbeam_channel::Receiver<()>,
    }

    #[async_trait]
    impl WorkUnit for BlocksThread {
        async fn run(&self, _vu: &mut VuContext) -> anyhow::Result<()> {
            let _ = self.gate.recv();
            Ok(())
        }
    }

    fn scheduler(profile: TestProfile, work: impl WorkUnit + 'static) -> Scheduler {
        Scheduler::new(profile, Arc::new(work), Arc::new(Ok200))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_short_run_collects_metrics() {
        let profile = TestProfile::new(3, Duration::from_millis(300));
        let result = scheduler(profile, GetOnce).run_to_completion().await.unwrap();

        assert!(!result.aborted);
        assert_eq!(result.stop_reason, StopReason::DurationElapsed);
        assert_eq!(result.vu_iterations.len(), 3);
        assert!(result.total_iterations() > 0);
        assert!(result.elapsed >= Duration::from_millis(300));
        assert!(result.elapsed < Duration::from_secs(2), "Run took {:?}", result.elapsed);

        let reqs = result.resolve(&MetricKey::new(HTTP_REQS)).unwrap();
        let iterations = result.resolve(&MetricKey::new(ITERATIONS)).unwrap();
        assert_eq!(reqs.count(), result.total_iterations());
        assert_eq!(iterations.count(), result.total_iterations());

        let checks = result.resolve(&MetricKey::new(CHECKS)).unwrap();
        let summary = checks.summary(result.elapsed);
        assert_eq!(summary.rate, Some(1.0));
        assert!(result.passed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rate_threshold_outcome() {
        let profile = TestProfile::new(2, Duration::from_millis(500))
            .with_threshold("http_reqs{expected_response:true}", "rate>5")
            .unwrap()
            .with_threshold("http_reqs{expected_response:true}", "rate>1000000")
            .unwrap();
        let result = scheduler(profile, GetOnce).run_to_completion().await.unwrap();

        assert_eq!(result.thresholds.len(), 2);
        assert_eq!(result.thresholds[0].outcome, Outcome::Pass);
        assert_eq!(result.thresholds[1].outcome, Outcome::Fail);
        assert!(!result.passed());
        assert!(!result.aborted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failing_check_aborts_with_abort_on_fail() {
        let mut profile = TestProfile::new(2, Duration::from_secs(30));
        profile.evaluation_interval = Duration::from_millis(50);
        profile.add_threshold(
            ThresholdExpr::parse(MetricKey::new(CHECKS), "rate == 1")
                .unwrap()
                .with_abort_on_fail(true),
        );

        let started = Instant::now();
        let result = scheduler(profile, AlwaysFailsCheck).run_to_completion().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(result.aborted);
        assert_eq!(result.stop_reason, StopReason::ThresholdAbort);
        assert!(result.total_iterations() > 0);
        assert!(!result.passed());

        let checks = result.resolve(&MetricKey::new(CHECKS)).unwrap();
        assert_eq!(checks.summary(result.elapsed).rate, Some(0.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_blocked_vu_is_cancelled_after_grace_period() {
        let mut profile = TestProfile::new(2, Duration::from_millis(200));
        profile.graceful_stop = Duration::from_millis(200);

        let started = Instant::now();
        let result = scheduler(profile, BlocksForever).run_to_completion().await.unwrap();

        let wall = started.elapsed();
        assert!(wall >= Duration::from_millis(400));
        assert!(wall < Duration::from_secs(3), "Run took {:?}", wall);
        assert_eq!(result.vu_iterations, vec![0, 0]);
        assert!(!result.aborted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_operator_stop() {
        let profile = TestProfile::new(2, Duration::from_secs(60));
        let handle = scheduler(profile, GetOnce).start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop();
        handle.stop();

        let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("run should end promptly")
            .unwrap();
        assert!(result.aborted);
        assert_eq!(result.stop_reason, StopReason::Operator);
    }

    #[tokio::test]
    async fn test_invalid_profile_never_starts() {
        let err = scheduler(TestProfile::new(0, Duration::from_secs(1)), GetOnce)
            .start()
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Config(ConfigError::ZeroVus)));

        let err = scheduler(TestProfile::new(1, Duration::ZERO), GetOnce)
            .start()
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Config(ConfigError::ZeroDuration)));

        let mut profile = TestProfile::new(1, Duration::from_secs(1));
        profile.trend_digits = 9;
        assert!(scheduler(profile, GetOnce).start().is_err());
    }

    #[test]
    fn test_run_ends_when_every_worker_thread_is_blocked() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let (release, gate) = crossbeam_channel::bounded::<()>(0);

        let mut profile = TestProfile::new(2, Duration::from_millis(200));
        profile.graceful_stop = Duration::from_millis(200);
        let handle = runtime
            .block_on(async { scheduler(profile, BlocksThread { gate }).start() })
            .unwrap();

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let rt = runtime.handle().clone();
        std::thread::spawn(move || {
            let _ = done_tx.send(rt.block_on(handle.wait()));
        });

        let outcome = done_rx.recv_timeout(Duration::from_secs(20));
        drop(release);
        let result = outcome.expect("run should end despite blocked VUs").unwrap();
        assert_eq!(result.stop_reason, StopReason::DurationElapsed);
        assert_eq!(result.vu_iterations, vec![0, 0]);
        assert!(result.elapsed < Duration::from_secs(5), "Run took {:?}", result.elapsed);
        runtime.shutdown_timeout(Duration::from_secs(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ingestion_failure_aborts_run() {
        let profile = TestProfile::new(1, Duration::from_secs(30));
        let started = Instant::now();
        let err = scheduler(profile, RawKindClash).run_to_completion().await.unwrap_err();
        assert!(matches!(err, EngineError::Ingest(IngestError::KindMismatch { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_custom_kind_clash_is_dropped_not_fatal() {
        let profile = TestProfile::new(1, Duration::from_millis(200));
        let result = scheduler(profile, CustomKindClash).run_to_completion().await.unwrap();
        assert_eq!(result.stop_reason, StopReason::DurationElapsed);

        let clash = result.resolve(&MetricKey::new("clash")).unwrap();
        assert_eq!(clash.kind(), MetricKind::Counter);
        assert!(clash.count() > 0);
    }

    #[test]
    fn test_profile_upper_bounds() {
        let huge_vus = TestProfile::new(usize::MAX, Duration::from_secs(1));
        assert!(matches!(
            huge_vus.validate(),
            Err(ConfigError::InvalidOption { field: "vus", .. })
        ));

        let endless = TestProfile::new(1, MAX_DURATION + Duration::from_secs(1));
        assert!(matches!(
            endless.validate(),
            Err(ConfigError::InvalidOption { field: "duration", .. })
        ));

        let mut long_grace = TestProfile::new(1, Duration::from_secs(1));
        long_grace.graceful_stop = Duration::from_secs(u64::MAX);
        assert!(long_grace.validate().is_err());

        let mut big_buffer = TestProfile::new(1, Duration::from_secs(1));
        big_buffer.metric_buffer_size = Some(usize::MAX);
        assert!(big_buffer.validate().is_err());

        assert!(TestProfile::new(MAX_VUS, MAX_DURATION).validate().is_ok());
    }

    #[test]
    fn test_profile_threshold_parsing() {
        let profile = TestProfile::new(1, Duration::from_secs(1))
            .with_threshold("http_req_duration", "p(95) < 500")
            .unwrap();
        assert_eq!(profile.thresholds.len(), 1);

        let err = TestProfile::new(1, Duration::from_secs(1))
            .with_threshold("http_reqs", "p95 500")
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidThreshold { .. }));
    }
}
