//! Progress reporting for reconciliation passes
//!
//! Passes can report their progress to external callers as JSON lines on
//! stderr. Every message carries a type tag (`_t`), a sequence number and a
//! timestamp relative to the start of the pass.

use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::CatalogError;
use crate::models::{PassMode, PassReport};

/// Pass phase indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PassPhase {
    /// Moving legacy flat thumbnails into shards
    #[default]
    Migrate,
    /// Checking known records against the filesystem
    Validate,
    /// Walking the tree and cataloging new content
    Ingest,
    /// Removing records whose files are gone
    Sweep,
    /// Removing orphan thumbnails
    Cleanup,
    /// Pass completed
    Done,
}

impl PassPhase {
    /// Get string representation of the phase
    pub fn as_str(&self) -> &'static str {
        match self {
            PassPhase::Migrate => "migrate",
            PassPhase::Validate => "validate",
            PassPhase::Ingest => "ingest",
            PassPhase::Sweep => "sweep",
            PassPhase::Cleanup => "cleanup",
            PassPhase::Done => "done",
        }
    }
}

/// Start message sent when a pass begins
#[derive(Debug, Clone, Serialize)]
pub struct StartMessage {
    #[serde(rename = "_t")]
    pub msg_type: &'static str,
    pub seq: u64,
    pub ts: u64,
    /// Storage root being reconciled
    pub root: String,
    pub mode: PassMode,
}

impl StartMessage {
    pub fn new(seq: u64, ts: u64, root: String, mode: PassMode) -> Self {
        Self {
            msg_type: "start",
            seq,
            ts,
            root,
            mode,
        }
    }
}

/// Progress message sent during a phase
#[derive(Debug, Clone, Serialize)]
pub struct ProgressMessage {
    /// Message type identifier ("p" for progress)
    #[serde(rename = "_t")]
    pub msg_type: &'static str,
    pub seq: u64,
    pub ts: u64,
    pub phase: PassPhase,
    /// Items handled so far in this phase
    #[serde(rename = "n")]
    pub processed: u64,
    /// Items in this phase
    #[serde(rename = "t")]
    pub total: u64,
}

impl ProgressMessage {
    pub fn new(seq: u64, ts: u64, phase: PassPhase, processed: u64, total: u64) -> Self {
        Self {
            msg_type: "p",
            seq,
            ts,
            phase,
            processed,
            total,
        }
    }
}

/// Error message sent when a file fails during a pass
#[derive(Debug, Clone, Serialize)]
pub struct ErrorProgressMessage {
    /// Message type identifier ("err" for error)
    #[serde(rename = "_t")]
    pub msg_type: &'static str,
    pub seq: u64,
    pub ts: u64,
    /// Error type/category
    pub error_type: String,
    pub message: String,
    /// Path that caused the error (if available)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ErrorProgressMessage {
    pub fn new(seq: u64, ts: u64, error_type: String, message: String, path: Option<String>) -> Self {
        Self {
            msg_type: "err",
            seq,
            ts,
            error_type,
            message,
            path,
        }
    }
}

/// Done message carrying the pass counters
#[derive(Debug, Clone, Serialize)]
pub struct DoneMessage<'a> {
    /// Message type identifier ("done" for completion)
    #[serde(rename = "_t")]
    pub msg_type: &'static str,
    pub seq: u64,
    pub ts: u64,
    #[serde(flatten)]
    pub report: &'a PassReport,
    /// Number of errors encountered
    #[serde(rename = "ec")]
    pub error_count: usize,
    /// Number of catalog writes that were not applied
    #[serde(rename = "wc")]
    pub warning_count: usize,
}

impl<'a> DoneMessage<'a> {
    pub fn new(seq: u64, ts: u64, report: &'a PassReport) -> Self {
        Self {
            msg_type: "done",
            seq,
            ts,
            report,
            error_count: report.errors.len(),
            warning_count: report.warnings.len(),
        }
    }
}

/// Progress reporter for outputting pass progress to stderr
///
/// Lives for a single pass and is only touched from the sequential parts
/// of the pass.
pub struct ProgressReporter {
    enabled: bool,
    /// Minimum interval between progress messages in milliseconds
    interval_ms: u64,
    last_report: std::cell::Cell<Instant>,
    seq: AtomicU64,
    start_time: Instant,
}

impl ProgressReporter {
    /// Create a new ProgressReporter
    ///
    /// # Arguments
    /// * `enabled` - Whether progress reporting is enabled
    /// * `interval_ms` - Minimum interval between progress messages in milliseconds
    pub fn new(enabled: bool, interval_ms: u64) -> Self {
        let now = Instant::now();
        Self {
            enabled,
            interval_ms,
            last_report: std::cell::Cell::new(now),
            seq: AtomicU64::new(0),
            start_time: now,
        }
    }

    /// Check if enough time has passed since the last report
    pub fn should_report(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let elapsed = self.last_report.get().elapsed().as_millis() as u64;
        elapsed >= self.interval_ms
    }

    /// Get the next sequence number (monotonically increasing)
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Milliseconds since reporter creation
    pub fn current_timestamp(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// Output a serializable message to stderr as JSON
    pub fn output_to_stderr<T: Serialize>(&self, msg: &T) {
        if let Ok(json) = serde_json::to_string(msg) {
            eprintln!("{}", json);
            std::io::stderr().flush().ok();
        }
    }

    /// Report pass start
    pub fn report_start(&self, root: &Path, mode: PassMode) {
        if !self.enabled {
            return;
        }
        let msg = StartMessage::new(
            self.next_seq(),
            self.current_timestamp(),
            root.to_string_lossy().to_string(),
            mode,
        );
        self.output_to_stderr(&msg);
    }

    /// Report progress within a phase
    ///
    /// Respects the reporting interval except for the final item of a phase.
    /// Returns true if a message was actually sent.
    pub fn report_progress(&self, phase: PassPhase, processed: u64, total: u64) -> bool {
        if !self.enabled {
            return false;
        }
        if processed < total && !self.should_report() {
            return false;
        }

        let msg = ProgressMessage::new(
            self.next_seq(),
            self.current_timestamp(),
            phase,
            processed,
            total,
        );
        self.output_to_stderr(&msg);
        self.last_report.set(Instant::now());
        true
    }

    /// Report an error immediately (ignores interval timing)
    pub fn report_error(&self, error: &CatalogError) {
        if !self.enabled {
            return;
        }

        let msg = ErrorProgressMessage::new(
            self.next_seq(),
            self.current_timestamp(),
            format!("{:?}", error.kind),
            error.message.clone(),
            error.path.as_ref().map(|p| p.to_string_lossy().to_string()),
        );
        self.output_to_stderr(&msg);
    }

    /// Report pass completion
    pub fn report_done(&self, report: &PassReport) {
        if !self.enabled {
            return;
        }
        let msg = DoneMessage::new(self.next_seq(), self.current_timestamp(), report);
        self.output_to_stderr(&msg);
    }

    /// Check if the reporter is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}
