//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the loader.
//! Events implement the `InternalEvent` trait which records the
//! corresponding Prometheus metric.

use metrics::{counter, gauge, histogram};
use tracing::trace;

use super::Severity;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when a queue message is received.
pub struct MessageReceived;

impl InternalEvent for MessageReceived {
    fn emit(self) {
        trace!("Message received");
        counter!("glacier_messages_received_total").increment(1);
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone, Copy)]
pub enum LoadResult {
    Loaded,
    AlreadyLoaded,
    Failed,
}

impl LoadResult {
    fn as_str(&self) -> &'static str {
        match self {
            LoadResult::Loaded => "loaded",
            LoadResult::AlreadyLoaded => "already_loaded",
            LoadResult::Failed => "failed",
        }
    }
}

/// Event emitted when a batch finishes, one way or another.
pub struct FolderProcessed {
    pub result: LoadResult,
}

impl InternalEvent for FolderProcessed {
    fn emit(self) {
        trace!(result = self.result.as_str(), "Folder processed");
        counter!("glacier_folders_processed_total", "result" => self.result.as_str()).increment(1);
    }
}

/// Event emitted when a load is retried after a transient failure.
pub struct LoadRetried;

impl InternalEvent for LoadRetried {
    fn emit(self) {
        trace!("Load retried");
        counter!("glacier_load_retries_total").increment(1);
    }
}

/// Wall-clock duration of one successful load.
pub struct LoadCompleted {
    pub seconds: f64,
}

impl InternalEvent for LoadCompleted {
    fn emit(self) {
        trace!(seconds = self.seconds, "Load completed");
        histogram!("glacier_load_duration_seconds").record(self.seconds);
    }
}

/// Migration phase of an executed DDL statement.
#[derive(Debug, Clone, Copy)]
pub enum MigrationPhase {
    Pre,
    In,
}

impl MigrationPhase {
    fn as_str(&self) -> &'static str {
        match self {
            MigrationPhase::Pre => "pre",
            MigrationPhase::In => "in",
        }
    }
}

/// Event emitted per executed migration statement.
pub struct MigrationExecuted {
    pub phase: MigrationPhase,
}

impl InternalEvent for MigrationExecuted {
    fn emit(self) {
        trace!(phase = self.phase.as_str(), "Migration statement executed");
        counter!("glacier_migrations_total", "phase" => self.phase.as_str()).increment(1);
    }
}

/// Number of unloaded folders the monitor found in one sweep.
pub struct OrphanFolders {
    pub count: usize,
}

impl InternalEvent for OrphanFolders {
    fn emit(self) {
        trace!(count = self.count, "Orphan folders detected");
        gauge!("glacier_orphan_folders").set(self.count as f64);
    }
}

/// Event emitted when an alert payload is produced.
pub struct AlertSent {
    pub severity: Severity,
}

impl InternalEvent for AlertSent {
    fn emit(self) {
        let severity = match self.severity {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        counter!("glacier_alerts_total", "severity" => severity).increment(1);
    }
}

/// Batches waiting in the in-memory retry queue.
pub struct RetryQueueDepth {
    pub count: usize,
}

impl InternalEvent for RetryQueueDepth {
    fn emit(self) {
        gauge!("glacier_retry_queue_depth").set(self.count as f64);
    }
}
