//! Progress events, cancellation and live operation status.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{BackupError, Result};
use crate::lock::OperationKind;
use crate::session::Phase;

/// Minimum interval between two emitted progress events.
const PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_millis(100);

/// Stage an operation is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "phase")]
pub enum Stage {
    /// Reading the stores for an export.
    Snapshot,
    /// Writing the export archive.
    WriteArchive,
    /// A restore phase.
    Restore(Phase),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Snapshot => f.write_str("snapshot"),
            Self::WriteArchive => f.write_str("write archive"),
            Self::Restore(phase) => phase.fmt(f),
        }
    }
}

/// Periodic progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Stage being reported.
    pub phase: Stage,
    /// Units done (bytes or items, depending on the stage).
    pub current: u64,
    /// Units expected.
    pub total: u64,
    /// Estimated seconds remaining, once a rate is known.
    pub eta_seconds: Option<u64>,
}

impl ProgressEvent {
    /// Returns the progress as a fraction (0.0 to 1.0).
    #[must_use]
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        (self.current as f64 / self.total as f64).min(1.0) as f32
    }
}

/// Receiver of progress events.
pub trait ProgressSink: Send + Sync {
    /// Called from the worker thread for each emitted event.
    fn on_progress(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: &ProgressEvent) {
        self(event);
    }
}

/// Cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create an un-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear a previous request.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Fail with [`BackupError::Cancelled`] if cancellation was requested.
    pub fn check(&self, stage: Stage) -> Result<()> {
        if self.is_cancelled() {
            return Err(BackupError::Cancelled {
                phase: stage.to_string(),
            });
        }
        Ok(())
    }
}

/// Snapshot of the running (or last) operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatus {
    /// Running operation, `None` when idle.
    pub operation: Option<OperationKind>,
    /// Latest progress event.
    pub progress: Option<ProgressEvent>,
    /// Whether a cancel was requested.
    pub cancel_requested: bool,
    /// Whether the cancel waits for a non-cancellable phase to finish.
    pub cancel_deferred: bool,
    /// When the running operation started.
    pub started_at: Option<DateTime<Utc>>,
}

impl OperationStatus {
    /// Whether an operation is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.operation.is_some()
    }
}

/// Shared live status plus the optional progress sink.
#[derive(Default)]
pub(crate) struct StatusBoard {
    status: Mutex<OperationStatus>,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl StatusBoard {
    pub(crate) fn new(sink: Option<Arc<dyn ProgressSink>>) -> Self {
        Self {
            status: Mutex::new(OperationStatus::default()),
            sink,
        }
    }

    pub(crate) fn snapshot(&self) -> OperationStatus {
        self.status.lock().clone()
    }

    pub(crate) fn start(&self, kind: OperationKind) {
        *self.status.lock() = OperationStatus {
            operation: Some(kind),
            started_at: Some(Utc::now()),
            ..OperationStatus::default()
        };
    }

    pub(crate) fn finish(&self) {
        *self.status.lock() = OperationStatus::default();
    }

    /// Record a cancel request; returns `false` when nothing is running.
    pub(crate) fn request_cancel(&self) -> bool {
        let mut status = self.status.lock();
        if status.operation.is_none() {
            return false;
        }
        status.cancel_requested = true;
        status.cancel_deferred = matches!(
            status.progress.map(|p| p.phase),
            Some(Stage::Restore(phase)) if !phase.is_cancellable()
        );
        true
    }

    fn publish(&self, event: ProgressEvent) {
        {
            let mut status = self.status.lock();
            status.progress = Some(event);
            if let Stage::Restore(phase) = event.phase {
                status.cancel_deferred = status.cancel_requested && !phase.is_cancellable();
            }
        }
        if let Some(sink) = &self.sink {
            sink.on_progress(&event);
        }
    }
}

/// Throttled progress reporter for one stage.
pub(crate) struct ProgressTracker<'a> {
    board: &'a StatusBoard,
    stage: Stage,
    current: u64,
    total: u64,
    started: Instant,
    last_emit: Option<Instant>,
}

impl<'a> ProgressTracker<'a> {
    /// Start a stage and emit its first event.
    pub(crate) fn new(board: &'a StatusBoard, stage: Stage, total: u64) -> Self {
        let tracker = Self {
            board,
            stage,
            current: 0,
            total,
            started: Instant::now(),
            last_emit: None,
        };
        tracker.board.publish(tracker.event());
        tracker
    }

    pub(crate) fn advance(&mut self, units: u64) {
        self.current = self.current.saturating_add(units);
        let now = Instant::now();
        let due = self
            .last_emit
            .is_none_or(|last| now.duration_since(last) >= PROGRESS_UPDATE_INTERVAL);
        if due {
            self.last_emit = Some(now);
            self.board.publish(self.event());
        }
    }

    /// Emit a final event with `current == total`.
    pub(crate) fn finish(mut self) {
        self.current = self.current.max(self.total);
        self.board.publish(self.event());
    }

    fn event(&self) -> ProgressEvent {
        ProgressEvent {
            phase: self.stage,
            current: self.current,
            total: self.total,
            eta_seconds: self.eta(),
        }
    }

    fn eta(&self) -> Option<u64> {
        if self.current == 0 || self.total <= self.current {
            return None;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = self.current as f64 / elapsed.max(f64::EPSILON);
        Some(((self.total - self.current) as f64 / rate).ceil() as u64)
    }
}
