use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Why a run ended. The first reason recorded wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    DurationElapsed,
    ThresholdAbort,
    Operator,
    InternalError,
}

impl StopReason {
    /// True for anything but running to the configured duration.
    pub fn is_abort(self) -> bool {
        self != StopReason::DurationElapsed
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::DurationElapsed => "duration elapsed",
            StopReason::ThresholdAbort => "threshold abort",
            StopReason::Operator => "stopped by operator",
            StopReason::InternalError => "internal error",
        };
        f.write_str(s)
    }
}

/// Shared stop flag for one run.
///
/// Set once; later calls are no-ops. VUs only read it.
pub struct RunControl {
    stopped: AtomicBool,
    reason: Mutex<Option<StopReason>>,
    notify: Notify,
}

impl RunControl {
    pub fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            reason: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Request a stop. Returns true if this call was the one that stopped the run.
    pub fn stop(&self, reason: StopReason) -> bool {
        let first = {
            let mut current = self.reason.lock();
            if current.is_some() {
                false
            } else {
                *current = Some(reason);
                true
            }
        };
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        first
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<StopReason> {
        *self.reason.lock()
    }

    /// Resolves once `stop` has been called, including before this call.
    pub async fn stopped(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent stop is not missed.
        notified.as_mut().enable();
        if self.is_stopped() {
            return;
        }
        notified.await;
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VuStatus {
    Idle = 0,
    Running = 1,
    Stopped = 2,
}

impl VuStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => VuStatus::Idle,
            1 => VuStatus::Running,
            _ => VuStatus::Stopped,
        }
    }
}

/// Per-VU bookkeeping. Written only by the VU's own loop, except for the
/// final `Stopped` mark after a forced cancellation.
pub struct VuState {
    pub id: u64,
    status: AtomicU8,
    iterations: AtomicU64,
}

impl VuState {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            status: AtomicU8::new(VuStatus::Idle as u8),
            iterations: AtomicU64::new(0),
        })
    }

    pub fn status(&self) -> VuStatus {
        VuStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn set_status(&self, status: VuStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::SeqCst)
    }

    pub fn complete_iteration(&self) -> u64 {
        self.iterations.fetch_add(1, Ordering::SeqCst) + 1
    }
}
