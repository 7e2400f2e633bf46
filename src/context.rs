//! The explicit `SyncContext` value object (§9): replaces a per-request
//! database context and DI container with a small value threaded through
//! every reconciler call. Reconcilers are pure structs parameterized by
//! this context — there is no ambient service locator anywhere in the
//! crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::model::School;
use crate::protection::ProtectionTracker;
use crate::store::{OrchestrationStore, SchoolStore};
use crate::types::ProgressSnapshot;

/// Marks a failure as cancellation rather than an ordinary per-school error,
/// so callers can tell "the caller asked us to stop" apart from "this school
/// failed on its own".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    Cancelled,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Cancelled => write!(f, "sync cancelled"),
        }
    }
}

impl std::error::Error for SyncError {}

/// Cooperative cancellation, threaded top-down from the caller (§5).
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives best-effort progress snapshots; never blocks the sync (§4.7).
pub trait ProgressSink: Send + Sync {
    fn report(&self, snapshot: ProgressSnapshot);
}

/// Drops every snapshot; the default when the caller doesn't care.
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn report(&self, _snapshot: ProgressSnapshot) {}
}

/// Forwards snapshots over an unbounded channel; a full receiver or a
/// dropped one never blocks or panics the sync.
pub struct ChannelProgressSink(pub tokio::sync::mpsc::UnboundedSender<ProgressSnapshot>);

impl ProgressSink for ChannelProgressSink {
    fn report(&self, snapshot: ProgressSnapshot) {
        let _ = self.0.send(snapshot);
    }
}

/// Everything a reconciler, the event processor, or the school orchestrator
/// needs, bundled into one explicit value (§9).
pub struct SyncContext {
    pub school: School,
    pub local_store: Arc<dyn SchoolStore>,
    pub orchestration_store: Arc<dyn OrchestrationStore>,
    pub clock: Arc<dyn Clock>,
    pub progress: Arc<dyn ProgressSink>,
    pub cancellation: CancellationToken,
    pub attempt_start_time: DateTime<Utc>,
    pub cursor: Option<String>,
    pub protection: Mutex<ProtectionTracker>,
}

impl SyncContext {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn report_progress(&self, snapshot: ProgressSnapshot) {
        self.progress.report(snapshot);
    }
}
