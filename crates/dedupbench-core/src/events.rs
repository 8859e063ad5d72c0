//! Run lifecycle, progress and log events published by the engine.
//!
//! Pipelines never talk to a UI directly. They publish [`EngineEvent`]s to an
//! [`EventSink`]; the host subscribes through an unbounded channel.

use crate::error::{DedupError, Result};
use crate::metrics::{EngineMetrics, RunResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Which pipeline a run belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// Source -> trail + index
    Segmentation,
    /// Trail + index -> reconstructed file
    Recovery,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::Segmentation => f.write_str("segmentation"),
            RunKind::Recovery => f.write_str("recovery"),
        }
    }
}

/// State of a single pipeline run.
///
/// `Idle -> ValidatingPreconditions -> {Failed | Running} -> Finalizing -> Done`.
/// A run that fails mid-loop also goes to `Failed`; `Done` and `Failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Not started
    Idle,
    /// Checking index reachability, namespace and files
    ValidatingPreconditions,
    /// Per-block loop
    Running,
    /// Closing files and assembling the result
    Finalizing,
    /// Finished successfully
    Done,
    /// Aborted
    Failed,
}

impl RunPhase {
    /// Whether `self -> next` is a legal move.
    pub fn can_transition_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        matches!(
            (self, next),
            (Idle, ValidatingPreconditions)
                | (ValidatingPreconditions, Running)
                | (ValidatingPreconditions, Failed)
                | (Running, Finalizing)
                | (Running, Failed)
                | (Finalizing, Done)
                | (Finalizing, Failed)
        )
    }

    /// `Done` or `Failed`
    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Failed)
    }
}

/// Bytes processed so far in one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Pipeline reporting
    pub kind: RunKind,
    /// Blocks (segmentation) or records (recovery) handled
    pub blocks_done: u64,
    /// Bytes read from the source or written to the output
    pub bytes_done: u64,
    /// Expected total bytes, when known up front
    pub bytes_total: u64,
}

impl Progress {
    /// Completion as a percentage, 100 when the total is unknown or zero.
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            100.0
        } else {
            (self.bytes_done as f64 / self.bytes_total as f64 * 100.0).min(100.0)
        }
    }
}

/// Severity of a [`LogLine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Informational
    Info,
    /// A step completed
    Success,
    /// Degraded but continuing
    Warning,
    /// A run or request failed
    Error,
}

/// A human-readable line for the host's log view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Severity
    pub level: LogLevel,
    /// Message text
    pub message: String,
}

/// Everything the engine publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A run moved between phases
    PhaseChanged {
        /// Pipeline
        kind: RunKind,
        /// Previous phase
        from: RunPhase,
        /// New phase
        to: RunPhase,
        /// Failure reason, set when `to` is `Failed`
        reason: Option<String>,
    },
    /// Throttled progress
    Progress(Progress),
    /// Log line
    Log(LogLine),
    /// Final result of one run or benchmark step
    RunResult(RunResult),
}

/// Receiver side of engine events.
pub trait EventSink: Send + Sync {
    /// Deliver one event. Must not block.
    fn emit(&self, event: EngineEvent);

    /// Publish a log line and mirror it to `tracing`.
    fn log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Info | LogLevel::Success => info!(level = ?level, "{}", message),
            LogLevel::Warning => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
        self.emit(EngineEvent::Log(LogLine { level, message }));
    }
}

impl EventSink for mpsc::UnboundedSender<EngineEvent> {
    fn emit(&self, event: EngineEvent) {
        // a dropped receiver only means nobody is watching
        let _ = self.send(event);
    }
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn emit(&self, event: EngineEvent) {
        (**self).emit(event)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// Walks a run through [`RunPhase`] and publishes each move.
pub struct RunTracker<'a> {
    kind: RunKind,
    phase: RunPhase,
    sink: &'a dyn EventSink,
}

impl<'a> RunTracker<'a> {
    /// Start in `Idle`.
    pub fn new(kind: RunKind, sink: &'a dyn EventSink) -> Self {
        Self {
            kind,
            phase: RunPhase::Idle,
            sink,
        }
    }

    /// Current phase
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Move to `next`. Illegal moves are logged and ignored.
    pub fn advance(&mut self, next: RunPhase) -> bool {
        self.transition(next, None)
    }

    /// Move to `Failed`, recording why.
    pub fn fail(&mut self, err: &DedupError) {
        self.transition(RunPhase::Failed, Some(err.to_string()));
    }

    fn transition(&mut self, next: RunPhase, reason: Option<String>) -> bool {
        if !self.phase.can_transition_to(next) {
            warn!(kind = %self.kind, from = ?self.phase, to = ?next, "ignored illegal run transition");
            return false;
        }
        let from = std::mem::replace(&mut self.phase, next);
        self.sink.emit(EngineEvent::PhaseChanged {
            kind: self.kind,
            from,
            to: next,
            reason,
        });
        true
    }
}

/// Rate-limits progress events to one per `interval` bytes.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: u64,
    next_at: u64,
}

impl ProgressThrottle {
    /// `interval` of 0 reports every call.
    pub fn new(interval: u64) -> Self {
        Self {
            interval,
            next_at: interval,
        }
    }

    /// True when `done` has crossed the next reporting mark.
    pub fn should_report(&mut self, done: u64) -> bool {
        if done < self.next_at {
            return false;
        }
        self.next_at = done.saturating_add(self.interval.max(1));
        true
    }
}

#[derive(Debug, Default)]
struct CancelState {
    /// Last ticket handed out
    issued: AtomicU64,
    /// Tickets below this are cancelled
    cancelled_below: AtomicU64,
}

/// Cooperative cancellation shared between a host and the worker.
///
/// Each request submitted to the worker takes a ticket with [`CancelFlag::issue`].
/// [`CancelFlag::cancel`] stops every ticket issued so far, queued or
/// running, and none issued afterwards. A flag without a ticket is stopped
/// by any cancel.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    state: Arc<CancelState>,
    ticket: u64,
}

impl CancelFlag {
    /// Fresh, not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticket for a newly submitted request, sharing this flag's state.
    pub fn issue(&self) -> Self {
        let ticket = self.state.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Self {
            state: Arc::clone(&self.state),
            ticket,
        }
    }

    /// Ticket number, 0 for a flag that never took one
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Ask every request submitted so far to stop at the next block boundary.
    pub fn cancel(&self) {
        let issued = self.state.issued.load(Ordering::SeqCst);
        self.state
            .cancelled_below
            .fetch_max(issued.max(self.ticket) + 1, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled_below.load(Ordering::SeqCst) > self.ticket
    }

    /// `Err(Cancelled)` if cancellation was requested after `blocks` blocks.
    pub fn check(&self, blocks: u64) -> Result<()> {
        if self.is_cancelled() {
            Err(DedupError::Cancelled { blocks })
        } else {
            Ok(())
        }
    }
}

/// Default spacing of progress events, in processed bytes
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 1 << 20;

/// What a pipeline run reports to and is steered by.
#[derive(Clone)]
pub struct RunContext {
    /// Where events go
    pub sink: Arc<dyn EventSink>,
    /// Checked between blocks
    pub cancel: CancelFlag,
    /// Process-wide counters
    pub metrics: Arc<EngineMetrics>,
    /// Bytes between progress events
    pub progress_interval_bytes: u64,
}

impl RunContext {
    /// Context publishing to `sink` with fresh metrics and no cancellation.
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            cancel: CancelFlag::new(),
            metrics: Arc::new(EngineMetrics::new()),
            progress_interval_bytes: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    /// Same context steered by `cancel`.
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the progress spacing.
    pub fn with_progress_interval(mut self, bytes: u64) -> Self {
        self.progress_interval_bytes = bytes;
        self
    }

    pub(crate) fn progress(&self, progress: Progress) {
        self.sink.emit(EngineEvent::Progress(progress));
    }

    pub(crate) fn log(&self, level: LogLevel, message: String) {
        self.sink.log(level, message);
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(Arc::new(NullSink))
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("progress_interval_bytes", &self.progress_interval_bytes)
            .finish()
    }
}
