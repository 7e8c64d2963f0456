pub mod bridge;
pub mod cli;
pub mod engine;
pub mod error;
pub mod stats;
pub mod utils;

pub use bridge::{HttpRequest, HttpResponse, Transport, VuContext, WorkUnit};
pub use engine::{RunHandle, RunResult, Scheduler, StopReason, TestProfile};
pub use error::{ConfigError, EngineError};
pub use stats::thresholds::{ThresholdExpr, ThresholdOutcome};
pub use stats::{Aggregate, Aggregator, MetricKey, MetricKind, Snapshot};
pub use utils::parse_duration;
