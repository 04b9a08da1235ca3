//! Progress and live-output event types, plus the per-run cancellation token.
//!
//! Provisioning runs report a linear progress bar through [`ProgressEvent`]
//! values on an ordered channel. Command executions forward their output
//! line-by-line through an [`OutputTap`]. Both sinks are optional: with no
//! subscriber attached, emission is a no-op.
//!
//! Cancellation is cooperative. Each provisioning run owns its own
//! [`RunToken`]; the pipeline checks it at every state boundary and the
//! downloader checks it between buffer flushes. Tokens are never shared
//! across runs, so provisioning two environments concurrently is safe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

/// Sentinel fraction marking an out-of-band informational event that is not
/// part of the linear progress bar (e.g. a tool-version notice).
pub const OUT_OF_BAND: f32 = -1.0;

/// A single progress report from a provisioning run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// Human-readable description of the current step.
    pub message: String,
    /// Progress in `0.0..=1.0`, non-decreasing within one run, or
    /// [`OUT_OF_BAND`] for informational events.
    pub fraction: f32,
}

impl ProgressEvent {
    /// Creates a progress-bar event at the given fraction.
    #[must_use]
    pub fn stage(message: impl Into<String>, fraction: f32) -> Self {
        Self {
            message: message.into(),
            fraction,
        }
    }

    /// Creates an out-of-band informational event.
    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fraction: OUT_OF_BAND,
        }
    }

    /// Returns true if this event is informational rather than a bar update.
    #[must_use]
    pub fn is_out_of_band(&self) -> bool {
        self.fraction < 0.0
    }
}

/// Cooperative cancellation flag for one provisioning run.
///
/// Cloning yields a handle to the same flag. Cancellation takes effect at
/// the next checkpoint; in-progress blocking reads are not interrupted.
#[derive(Debug, Clone, Default)]
pub struct RunToken {
    flag: Arc<AtomicBool>,
}

impl RunToken {
    /// Creates a fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Progress sink for one provisioning run.
///
/// Enforces the non-decreasing fraction invariant: a stage emission with a
/// fraction lower than anything already reported (e.g. after a download
/// fallback restarts its sub-range) is clamped up to the high-water mark.
/// Out-of-band events bypass the clamp. Send failures (subscriber dropped)
/// are ignored.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    tx: Option<Sender<ProgressEvent>>,
    high_water: Arc<Mutex<f32>>,
}

impl ProgressReporter {
    /// Creates a reporter that forwards events to `tx`.
    #[must_use]
    pub fn new(tx: Sender<ProgressEvent>) -> Self {
        Self {
            tx: Some(tx),
            high_water: Arc::new(Mutex::new(0.0)),
        }
    }

    /// Creates a reporter that discards everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Emits a progress-bar event, clamped to the run's high-water mark.
    pub fn emit(&self, message: impl Into<String>, fraction: f32) {
        let fraction = {
            let mut mark = self
                .high_water
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *mark = mark.max(fraction.clamp(0.0, 1.0));
            *mark
        };
        if let Some(tx) = &self.tx {
            let _ = tx.send(ProgressEvent::stage(message, fraction));
        }
    }

    /// Emits an out-of-band informational event.
    pub fn info(&self, message: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ProgressEvent::info(message));
        }
    }
}

/// Live-output sink for sandboxed command execution.
///
/// Each captured line is forwarded as it arrives; stderr lines carry an
/// `[err] ` prefix so a single multiplexed stream stays readable.
#[derive(Debug, Clone, Default)]
pub struct OutputTap {
    tx: Option<Sender<String>>,
}

impl OutputTap {
    /// Creates a tap that forwards lines to `tx`.
    #[must_use]
    pub fn new(tx: Sender<String>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Creates a tap that discards everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Forwards one output line to the subscriber, if any.
    pub fn line(&self, line: &str, is_err: bool) {
        if let Some(tx) = &self.tx {
            let rendered = if is_err {
                format!("[err] {line}")
            } else {
                line.to_string()
            };
            let _ = tx.send(rendered);
        }
    }
}
