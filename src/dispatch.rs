//! Discovery and dispatch.
//!
//! One receive loop pulls queue messages and runs the load state machine
//! inline, which is what enforces single-flight: a second batch cannot
//! start before the previous one has terminated. The folder monitor and
//! the no-op scheduler run as concurrent tasks sharing only the control
//! surface. A companion task extends the in-flight message's visibility
//! for as long as its load runs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, NoOpWindow, RetryQueueConfig};
use crate::db::manifest::Manifest;
use crate::db::statement::Statement;
use crate::db::target::Target;
use crate::db::transactor::{ConnectionPool, Session, Transactor};
use crate::discovery::{DataDiscovery, ShreddingComplete};
use crate::emit;
use crate::error::LoaderError;
use crate::iglu::SchemaRegistry;
use crate::load::{self, LoadContext, LoadOutcome};
use crate::monitoring::events::{
    FolderProcessed, LoadCompleted, LoadResult, MessageReceived, RetryQueueDepth,
};
use crate::monitoring::folders::FolderMonitor;
use crate::monitoring::{AlertPayload, KVMetrics, Monitoring, SuccessPayload};
use crate::queue::MessageQueue;
use crate::retry::RetryPolicy;
use crate::state::Control;
use crate::storage::BlobStorage;

/// How long one queue receive waits before the loop re-checks state.
const RECEIVE_WAIT: Duration = Duration::from_secs(1);

/// The assembled loader: all collaborators injected, ready to run.
pub struct Loader {
    pub config: Config,
    pub queue: Arc<dyn MessageQueue>,
    pub registry: Arc<dyn SchemaRegistry>,
    pub target: Arc<dyn Target>,
    pub pool: Arc<dyn ConnectionPool>,
    /// Blob storage for the folder monitor; `None` disables it.
    pub storage: Option<Arc<dyn BlobStorage>>,
    pub monitoring: Arc<dyn Monitoring>,
    pub control: Arc<Control>,
    /// Application identifier stamped into success payloads.
    pub app: String,
}

/// One unit of work entering the dispatch loop.
enum Incoming {
    /// Fresh queue message, ack/extend through its receipt.
    Queue { body: String, receipt: String },
    /// Re-injected batch from the retry queue; nothing to ack.
    Retry { message: ShreddingComplete, attempt: usize },
}

impl Loader {
    /// Run until shutdown or a fatal error.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), LoaderError> {
        let non_loading = Transactor::new(self.pool.clone(), self.config.non_loading_timeout());
        let loading = Transactor::new(self.pool.clone(), self.config.loading_timeout());

        let manifest = Arc::new(Manifest::new(self.target.clone()));
        manifest.initialize(&non_loading).await?;
        info!("Manifest initialized");

        if self.config.feature_flags.add_load_tstamp_column {
            self.add_load_tstamp(&non_loading).await;
        }

        let context = LoadContext {
            target: self.target.clone(),
            manifest,
            loading,
            non_loading: non_loading.clone(),
            retry: RetryPolicy::from_config(&self.config.retries),
            ready_check: self.config.ready_check.clone(),
            control: self.control.clone(),
        };

        // Side streams: they communicate with the loop only through the
        // control surface.
        if !self.config.schedules.no_operation.is_empty() {
            tokio::spawn(no_op_scheduler(
                self.config.schedules.no_operation.clone(),
                self.control.clone(),
                shutdown.clone(),
            ));
        }
        if let (Some(folders), Some(storage)) = (&self.config.monitoring.folders, &self.storage) {
            let monitor = FolderMonitor::new(
                folders.clone(),
                storage.clone(),
                self.target.clone(),
                non_loading.clone(),
                self.control.clone(),
                self.monitoring.clone(),
            );
            tokio::spawn(monitor.run(shutdown.clone()));
        }

        let (retry_queue, mut retry_rx) = RetryQueue::start(
            self.config.retry_queue.clone(),
            shutdown.clone(),
        );

        info!(queue = %self.config.message_queue, "Listening for shredding-complete messages");
        loop {
            if shutdown.is_cancelled() {
                info!("Shutdown requested, stopping discovery");
                break;
            }
            if self.control.is_busy() {
                // Paused by a no-op window; discovery stays gated.
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RECEIVE_WAIT) => {}
                }
                continue;
            }

            let incoming = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(entry) = retry_rx.recv() => Incoming::Retry {
                    message: entry.message,
                    attempt: entry.attempt,
                },
                received = self.queue.receive(RECEIVE_WAIT) => {
                    match received.map_err(|source| LoaderError::LoaderQueue { source })? {
                        Some(message) => Incoming::Queue {
                            body: message.body,
                            receipt: message.receipt,
                        },
                        None => continue,
                    }
                }
            };

            self.handle(incoming, &context, &retry_queue, &shutdown).await?;
        }

        Ok(())
    }

    /// Process one message end to end. Returns `Err` only for failures
    /// that must terminate the stream.
    async fn handle(
        &self,
        incoming: Incoming,
        context: &LoadContext,
        retry_queue: &Arc<RetryQueue>,
        shutdown: &CancellationToken,
    ) -> Result<(), LoaderError> {
        let (message, receipt, attempt) = match incoming {
            Incoming::Queue { body, receipt } => {
                self.control.increment_messages();
                emit!(MessageReceived);
                match ShreddingComplete::parse(&body) {
                    Ok(message) => (message, Some(receipt), 0),
                    Err(e) => {
                        warn!("Dropping malformed message: {e}");
                        self.monitoring
                            .alert(AlertPayload::error(
                                format!("Malformed shredding-complete message: {e}"),
                                None,
                            ))
                            .await;
                        self.ack(receipt.as_str()).await;
                        return Ok(());
                    }
                }
            }
            Incoming::Retry { message, attempt } => {
                info!(base = %message.base, attempt, "Re-attempting batch from retry queue");
                (message, None, attempt)
            }
        };

        let base = message.base.clone();
        let discovery = match DataDiscovery::resolve(message.clone(), self.registry.as_ref()).await
        {
            Ok(discovery) => discovery,
            Err(e) => {
                self.monitoring
                    .alert(AlertPayload::error(
                        format!("Discovery failed: {e}"),
                        Some(base.clone()),
                    ))
                    .await;
                if let Some(receipt) = &receipt {
                    self.ack(receipt).await;
                }
                retry_queue.push(message, attempt + 1).await;
                return Ok(());
            }
        };

        self.control.make_busy(base.clone());
        let started = Utc::now();

        // Companion task: keep the message visible for as long as the
        // load runs. Its period stays under the queue visibility timeout.
        let extender = receipt.as_ref().map(|receipt| {
            let token = CancellationToken::new();
            let handle = tokio::spawn(extend_visibility(
                self.queue.clone(),
                receipt.clone(),
                self.config.visibility_timeout(),
                token.clone(),
            ));
            (token, handle)
        });

        let result = load::load(context, &discovery, shutdown).await;

        if let Some((token, handle)) = extender {
            token.cancel();
            let _ = handle.await;
        }
        self.control.make_idle();

        match result {
            Ok(LoadOutcome::Loaded { ingestion }) => {
                emit!(FolderProcessed {
                    result: LoadResult::Loaded
                });
                emit!(LoadCompleted {
                    seconds: (Utc::now() - started).num_milliseconds() as f64 / 1000.0
                });
                self.monitoring
                    .success(self.success_payload(&message, ingestion, started))
                    .await;
                if let Some(receipt) = &receipt {
                    self.ack(receipt).await;
                }
                self.control.increment_loaded();
                Ok(())
            }
            Ok(LoadOutcome::AlreadyLoaded(alert)) => {
                emit!(FolderProcessed {
                    result: LoadResult::AlreadyLoaded
                });
                self.monitoring.alert(alert).await;
                if let Some(receipt) = &receipt {
                    self.ack(receipt).await;
                }
                Ok(())
            }
            Err(error) => {
                emit!(FolderProcessed {
                    result: LoadResult::Failed
                });
                self.monitoring
                    .alert(AlertPayload::error(
                        format!("Load failed: {error}"),
                        Some(base.clone()),
                    ))
                    .await;
                // The batch stays durable in storage and the manifest is
                // untouched, so the message is ack'd either way: nacking
                // would redeliver a batch this process cannot load.
                info!(base = %base, "Acknowledging failed batch; manifest is unchanged");
                if let Some(receipt) = &receipt {
                    self.ack(receipt).await;
                }
                if error.is_fatal() {
                    Err(error)
                } else {
                    retry_queue.push(message, attempt + 1).await;
                    Ok(())
                }
            }
        }
    }

    fn success_payload(
        &self,
        message: &ShreddingComplete,
        ingestion: Option<DateTime<Utc>>,
        started: DateTime<Utc>,
    ) -> SuccessPayload {
        SuccessPayload {
            app: self.app.clone(),
            base: message.base.clone(),
            ingestion,
            started,
            attempts: self.control.attempts(),
            shredding_started: message.timestamps.job_started,
            shredding_completed: message.timestamps.job_completed,
            metrics: Some(KVMetrics::from_load(message, ingestion)),
        }
    }

    async fn ack(&self, receipt: &str) {
        if let Err(e) = self.queue.ack(receipt).await {
            warn!("Failed to acknowledge message: {e}");
        }
    }

    /// Best-effort startup widening of the events table; "column exists"
    /// is the common case after the first run.
    async fn add_load_tstamp(&self, transactor: &Transactor) {
        let target = self.target.clone();
        let result = transactor
            .run(async |session: &mut Session| {
                session
                    .execute(target.as_ref(), &Statement::AddLoadTstampColumn)
                    .await
            })
            .await;
        match result {
            Ok(_) => info!("Added load_tstamp column to the events table"),
            Err(e) => debug!("load_tstamp column not added (likely present): {e}"),
        }
    }
}

/// Periodically extend one message's visibility until cancelled.
async fn extend_visibility(
    queue: Arc<dyn MessageQueue>,
    receipt: String,
    visibility: Duration,
    token: CancellationToken,
) {
    // Renew at two-thirds of the timeout so an extension is always in
    // flight before the message becomes visible again.
    let period = visibility.mul_f64(2.0 / 3.0);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(period) => {}
        }
        if let Err(e) = queue.extend(&receipt, visibility).await {
            warn!("Failed to extend message visibility: {e}");
        }
    }
}

// ============ No-op scheduler ============

/// Toggle `Paused` across the configured daily windows.
async fn no_op_scheduler(
    windows: Vec<NoOpWindow>,
    control: Arc<Control>,
    shutdown: CancellationToken,
) {
    loop {
        let Some((window, wait)) = next_window(&windows, Utc::now()) else {
            return;
        };
        debug!(window = %window.name, wait_secs = wait.as_secs(), "Next no-op window scheduled");
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        if control.make_paused(&window.name) {
            info!(window = %window.name, "Entering no-op window");
            tokio::select! {
                _ = shutdown.cancelled() => {
                    control.resume(&window.name);
                    return;
                }
                _ = tokio::time::sleep(window.duration()) => {}
            }
            control.resume(&window.name);
            info!(window = %window.name, "Leaving no-op window");
        } else {
            debug!(window = %window.name, "Load in flight, skipping no-op window");
        }
    }
}

/// The soonest upcoming window occurrence, with the wait until it opens.
fn next_window(windows: &[NoOpWindow], now: DateTime<Utc>) -> Option<(NoOpWindow, Duration)> {
    windows
        .iter()
        .filter_map(|window| {
            let start_time = window.start_time()?;
            let today = now.date_naive().and_time(start_time).and_utc();
            let start = if today > now {
                today
            } else {
                today + chrono::Duration::days(1)
            };
            let wait = (start - now).to_std().ok()?;
            Some((window.clone(), wait))
        })
        .min_by_key(|(_, wait)| *wait)
}

// ============ Retry queue ============

struct RetryEntry {
    message: ShreddingComplete,
    attempt: usize,
}

/// Bounded in-memory queue of failed batches, periodically re-injected
/// into the dispatch loop.
pub struct RetryQueue {
    config: Option<RetryQueueConfig>,
    entries: Mutex<VecDeque<RetryEntry>>,
}

impl RetryQueue {
    /// Build the queue and spawn its flush task. The receiver feeds the
    /// dispatch loop; it stays silent forever when no queue is configured.
    fn start(
        config: Option<RetryQueueConfig>,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<RetryEntry>) {
        let (tx, rx) = mpsc::channel(1);
        let queue = Arc::new(Self {
            config,
            entries: Mutex::new(VecDeque::new()),
        });
        if queue.config.is_some() {
            tokio::spawn(queue.clone().flush_loop(tx, shutdown));
        }
        (queue, rx)
    }

    /// Remember a failed batch for another attempt.
    async fn push(&self, message: ShreddingComplete, attempt: usize) {
        let Some(config) = &self.config else {
            return;
        };
        if attempt > config.max_attempts {
            warn!(base = %message.base, "Batch exhausted its retry-queue attempts");
            return;
        }
        let mut entries = self.entries.lock().await;
        if entries.len() >= config.size {
            warn!(base = %message.base, "Retry queue full, dropping batch");
            return;
        }
        debug!(base = %message.base, attempt, "Batch queued for retry");
        entries.push_back(RetryEntry { message, attempt });
        emit!(RetryQueueDepth {
            count: entries.len()
        });
    }

    async fn flush_loop(self: Arc<Self>, tx: mpsc::Sender<RetryEntry>, shutdown: CancellationToken) {
        let config = self.config.clone().expect("flush loop requires config");
        let mut ticker = tokio::time::interval(Duration::from_secs(config.period_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            loop {
                let entry = { self.entries.lock().await.pop_front() };
                let Some(entry) = entry else { break };
                emit!(RetryQueueDepth {
                    count: self.entries.lock().await.len()
                });
                if tx.send(entry).await.is_err() {
                    return;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(config.interval_secs)) => {}
                }
            }
        }
    }
}

// ============ Signals ============

/// Resolve once the process is asked to stop.
///
/// Supervisors stop the loader with SIGTERM; SIGINT and SIGQUIT cover
/// interactive runs. A handler that cannot be installed is skipped rather
/// than fatal, and ctrl-c remains the fallback when none could be.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use futures::future::select_all;
    use tokio::signal::unix::{SignalKind, signal};

    let kinds = [
        ("SIGINT", SignalKind::interrupt()),
        ("SIGTERM", SignalKind::terminate()),
        ("SIGQUIT", SignalKind::quit()),
    ];
    let mut streams = Vec::with_capacity(kinds.len());
    for (name, kind) in kinds {
        match signal(kind) {
            Ok(stream) => streams.push((name, stream)),
            Err(e) => warn!("Could not install {name} handler: {e}"),
        }
    }
    if streams.is_empty() {
        let _ = tokio::signal::ctrl_c().await;
        info!(signal = "ctrl-c", "Stop requested");
        return;
    }

    let waiters = streams.iter_mut().map(|(name, stream)| {
        let name = *name;
        Box::pin(async move {
            stream.recv().await;
            name
        })
    });
    let (name, _, _) = select_all(waiters).await;
    info!(signal = name, "Stop requested");
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!(signal = "ctrl-c", "Stop requested");
}
