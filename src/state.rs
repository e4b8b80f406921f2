//! Process-wide load state.
//!
//! `Control` is the single owner of the `LoadStatus`. The dispatch loop
//! and the load state machine hand the write token between themselves;
//! the folder monitor and the no-op scheduler only read. Status lives in
//! a watch channel, so every write is one atomic replacement and readers
//! can also subscribe to transitions.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::watch;
use tracing::debug;

use crate::storage::StorageFolder;

/// A named point in the load state machine, exposed for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    MigrationBuild,
    MigrationPre,
    ManifestCheck,
    MigrationIn,
    Loading { table: String },
    Committing,
    Cancelling { reason: String },
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::MigrationBuild => f.write_str("migration build"),
            Stage::MigrationPre => f.write_str("pre-transaction migrations"),
            Stage::ManifestCheck => f.write_str("manifest check"),
            Stage::MigrationIn => f.write_str("in-transaction migrations"),
            Stage::Loading { table } => write!(f, "loading {table}"),
            Stage::Committing => f.write_str("committing"),
            Stage::Cancelling { reason } => write!(f, "cancelling: {reason}"),
        }
    }
}

/// What the process is doing right now.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadStatus {
    #[default]
    Idle,
    Paused {
        owner: String,
    },
    Loading {
        folder: StorageFolder,
        stage: Stage,
    },
}

impl LoadStatus {
    pub fn is_busy(&self) -> bool {
        !matches!(self, LoadStatus::Idle)
    }
}

/// The control surface: status plus process counters.
pub struct Control {
    status: watch::Sender<LoadStatus>,
    messages: AtomicU64,
    loaded: AtomicU64,
    /// Retry attempts of the batch currently loading; reset by
    /// `make_busy`.
    attempts: AtomicUsize,
}

impl Default for Control {
    fn default() -> Self {
        Self::new()
    }
}

impl Control {
    pub fn new() -> Self {
        let (status, _) = watch::channel(LoadStatus::Idle);
        Self {
            status,
            messages: AtomicU64::new(0),
            loaded: AtomicU64::new(0),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Snapshot of the current status.
    pub fn get(&self) -> LoadStatus {
        self.status.borrow().clone()
    }

    /// Observe status transitions.
    pub fn signal(&self) -> watch::Receiver<LoadStatus> {
        self.status.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.status.borrow().is_busy()
    }

    /// Enter `Loading` for a folder, resetting the attempt counter.
    pub fn make_busy(&self, folder: StorageFolder) {
        self.attempts.store(0, Ordering::SeqCst);
        self.status.send_replace(LoadStatus::Loading {
            folder,
            stage: Stage::MigrationBuild,
        });
    }

    pub fn make_idle(&self) {
        self.status.send_replace(LoadStatus::Idle);
    }

    /// Enter `Paused` unless a load is in flight. Returns whether the
    /// pause took effect.
    pub fn make_paused(&self, owner: impl Into<String>) -> bool {
        let owner = owner.into();
        let mut paused = false;
        self.status.send_if_modified(|status| {
            if matches!(status, LoadStatus::Loading { .. }) {
                return false;
            }
            *status = LoadStatus::Paused { owner: owner.clone() };
            paused = true;
            true
        });
        paused
    }

    /// Leave `Paused`, but only when this owner holds the pause.
    pub fn resume(&self, owner: &str) {
        self.status.send_if_modified(|status| {
            if matches!(status, LoadStatus::Paused { owner: current } if current == owner) {
                *status = LoadStatus::Idle;
                return true;
            }
            false
        });
    }

    /// Advance the stage of the in-flight load. A no-op when nothing is
    /// loading.
    pub fn set_stage(&self, stage: Stage) {
        self.status.send_if_modified(|status| match status {
            LoadStatus::Loading { stage: current, .. } => {
                debug!(stage = %stage, "Stage transition");
                *current = stage.clone();
                true
            }
            _ => false,
        });
    }

    pub fn increment_messages(&self) -> u64 {
        self.messages.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn increment_loaded(&self) -> u64 {
        self.loaded.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn increment_attempt(&self) -> usize {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Retry attempts of the current batch.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::SeqCst)
    }

    pub fn loaded(&self) -> u64 {
        self.loaded.load(Ordering::SeqCst)
    }
}
