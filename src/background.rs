//! Periodic and on-demand rescans on a dedicated thread

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{CatalogError, CatalogErrorKind, CatalogResult};
use crate::models::PassMode;
use crate::reconciler::Reconciler;

enum Command {
    Trigger,
    SetInterval(Duration),
    Shutdown,
}

/// Handle to the background rescan thread
///
/// Runs an incremental pass every `interval` and whenever `trigger` is
/// called. Triggers that pile up while a pass runs are coalesced into one
/// follow-up pass. An interval of zero disables the timer.
pub struct BackgroundScanner {
    tx: Sender<Command>,
    handle: Option<JoinHandle<()>>,
    passes: Arc<AtomicU64>,
}

impl BackgroundScanner {
    /// Start the rescan thread
    pub fn spawn(reconciler: Arc<Reconciler>, interval: Duration) -> CatalogResult<Self> {
        let (tx, rx) = mpsc::channel();
        let passes = Arc::new(AtomicU64::new(0));
        let counter = passes.clone();
        let handle = thread::Builder::new()
            .name("catalog-rescan".to_string())
            .spawn(move || run_loop(reconciler, rx, interval, counter))
            .map_err(|e| CatalogError::io_error(None, format!("Cannot start rescan thread: {}", e)))?;

        Ok(Self {
            tx,
            handle: Some(handle),
            passes,
        })
    }

    /// Request a pass as soon as possible
    ///
    /// Returns false if the rescan thread has stopped.
    pub fn trigger(&self) -> bool {
        self.tx.send(Command::Trigger).is_ok()
    }

    /// Change the timer interval; takes effect immediately
    pub fn set_interval(&self, interval: Duration) -> bool {
        self.tx.send(Command::SetInterval(interval)).is_ok()
    }

    /// Number of passes completed by this scanner
    pub fn passes_completed(&self) -> u64 {
        self.passes.load(Ordering::Acquire)
    }

    /// Stop the thread, waiting for a running pass to finish
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Rescan thread panicked");
            }
        }
    }
}

impl Drop for BackgroundScanner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(reconciler: Arc<Reconciler>, rx: Receiver<Command>, mut interval: Duration, passes: Arc<AtomicU64>) {
    log::info!("Background rescans started (interval: {:?})", interval);
    loop {
        let received = if interval.is_zero() {
            rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            rx.recv_timeout(interval)
        };

        let mut due = match received {
            Ok(Command::Trigger) | Err(RecvTimeoutError::Timeout) => true,
            Ok(Command::SetInterval(d)) => {
                log::info!("Rescan interval set to {:?}", d);
                interval = d;
                false
            }
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        };

        // Coalesce everything already queued
        loop {
            match rx.try_recv() {
                Ok(Command::Trigger) => due = true,
                Ok(Command::SetInterval(d)) => interval = d,
                Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => {
                    log::info!("Background rescans stopped");
                    return;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        if !due {
            continue;
        }
        match reconciler.run(PassMode::Incremental) {
            Ok(report) => {
                passes.fetch_add(1, Ordering::AcqRel);
                if !report.is_noop() {
                    log::info!(
                        "Background pass: {} created, {} renamed, {} deleted",
                        report.records_created,
                        report.records_renamed,
                        report.records_deleted
                    );
                }
            }
            Err(e) if e.kind == CatalogErrorKind::PassInProgress => {
                log::debug!("Skipping background pass: {}", e);
            }
            Err(e) => log::warn!("Background pass failed: {}", e),
        }
    }
    log::info!("Background rescans stopped");
}
