//! Folder-reconciliation monitor.
//!
//! On a fixed period, compares the shredder's output prefixes against the
//! manifest through the warehouse itself: the prefix list is staged to
//! object storage, COPYed into a temp table, and the set difference with
//! the manifest yields folders that were shredded but never loaded. Each
//! orphan raises a warning alert. Ticks are skipped outright while a load
//! is in flight.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FoldersConfig;
use crate::db::statement::Statement;
use crate::db::target::Target;
use crate::db::transactor::{Session, Transactor};
use crate::emit;
use crate::error::LoaderError;
use crate::monitoring::events::OrphanFolders;
use crate::monitoring::{AlertPayload, Monitoring};
use crate::state::Control;
use crate::storage::{BlobStorage, StorageFolder};

/// Format of the shredder's run folder names.
const RUN_FORMAT: &str = "run=%Y-%m-%d-%H-%M-%S";

pub struct FolderMonitor {
    config: FoldersConfig,
    storage: Arc<dyn BlobStorage>,
    target: Arc<dyn Target>,
    transactor: Transactor,
    control: Arc<Control>,
    monitoring: Arc<dyn Monitoring>,
}

impl FolderMonitor {
    pub fn new(
        config: FoldersConfig,
        storage: Arc<dyn BlobStorage>,
        target: Arc<dyn Target>,
        transactor: Transactor,
        control: Arc<Control>,
        monitoring: Arc<dyn Monitoring>,
    ) -> Self {
        Self {
            config,
            storage,
            target,
            transactor,
            control,
            monitoring,
        }
    }

    /// Run the monitor until shutdown. A tick that fires while the loader
    /// is busy is dropped, not queued.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.period());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The immediate first tick would race loader startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Folder monitor stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if self.control.is_busy() {
                debug!("Loader busy, skipping folder monitoring tick");
                continue;
            }

            match self.check(Utc::now()).await {
                Ok(orphans) => {
                    emit!(OrphanFolders { count: orphans });
                    if orphans > 0 {
                        info!(count = orphans, "Folder monitoring found unloaded folders");
                    }
                }
                Err(e) => warn!("Folder monitoring sweep failed: {e}"),
            }
        }
    }

    /// One reconciliation sweep. Returns the number of orphans alerted.
    pub async fn check(&self, now: DateTime<Utc>) -> Result<usize, LoaderError> {
        let folders = self
            .storage
            .list_folders(&self.config.shredder_output)
            .await
            .map_err(|source| LoaderError::LoaderStorage { source })?;
        let folders = self.within_window(folders, now);

        if folders.is_empty() {
            debug!("No shredder output folders in the monitoring window");
            return Ok(0);
        }

        let staging_key = self.config.staging.key(&format!(
            "keys-{}.csv",
            now.format("%Y%m%d%H%M%S")
        ));
        let body = folders
            .iter()
            .map(|folder| folder.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.storage
            .put(&staging_key, Bytes::from(body))
            .await
            .map_err(|source| LoaderError::LoaderStorage { source })?;

        let target = self.target.clone();
        let orphans: Vec<String> = self
            .transactor
            .run(async |session: &mut Session| {
                session
                    .execute(target.as_ref(), &Statement::CreateAlertingTempTable)
                    .await?;
                session
                    .execute(
                        target.as_ref(),
                        &Statement::FoldersCopy {
                            source: staging_key.clone(),
                        },
                    )
                    .await?;
                let rows = session
                    .query(target.as_ref(), &Statement::FoldersMinusManifest)
                    .await?;
                session
                    .execute(target.as_ref(), &Statement::DropAlertingTempTable)
                    .await?;
                Ok::<_, LoaderError>(rows.iter().filter_map(|row| row.text_at(0)).collect())
            })
            .await?;

        for orphan in &orphans {
            self.monitoring
                .alert(AlertPayload::warning(
                    "Unloaded folder found",
                    StorageFolder::coerce(orphan.clone()),
                ))
                .await;
        }

        Ok(orphans.len())
    }

    /// Keep folders whose run timestamp falls inside the lookback window.
    /// Folders that do not parse as run folders are kept: better a false
    /// alert than a silently ignored batch.
    fn within_window(&self, folders: Vec<StorageFolder>, now: DateTime<Utc>) -> Vec<StorageFolder> {
        let Some(since) = self.config.since() else {
            return folders;
        };
        let cutoff = now - chrono::Duration::from_std(since).unwrap_or_default();
        folders
            .into_iter()
            .filter(|folder| {
                match NaiveDateTime::parse_from_str(folder.folder_name(), RUN_FORMAT) {
                    Ok(run_time) => run_time.and_utc() >= cutoff,
                    Err(_) => true,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(since_secs: Option<u64>) -> FoldersConfig {
        FoldersConfig {
            period_secs: 60,
            staging: StorageFolder::parse("s3://bucket/monitoring/").unwrap(),
            since_secs,
            shredder_output: StorageFolder::parse("s3://bucket/shredded/").unwrap(),
        }
    }

    fn monitor(since_secs: Option<u64>) -> FolderMonitor {
        use crate::db::transactor::{Conn, ConnectionPool};
        use crate::error::DbError;
        use async_trait::async_trait;

        struct NoopConn;
        #[async_trait]
        impl Conn for NoopConn {
            async fn execute(&mut self, _sql: &str) -> Result<u64, DbError> {
                Ok(0)
            }
            async fn query(
                &mut self,
                _sql: &str,
            ) -> Result<Vec<crate::db::transactor::SqlRow>, DbError> {
                Ok(vec![])
            }
        }
        struct NoopPool;
        #[async_trait]
        impl ConnectionPool for NoopPool {
            async fn acquire(&self) -> Result<Box<dyn Conn>, DbError> {
                Ok(Box::new(NoopConn))
            }
        }
        struct NoopStorage;
        #[async_trait]
        impl BlobStorage for NoopStorage {
            async fn list_folders(
                &self,
                _folder: &StorageFolder,
            ) -> Result<Vec<StorageFolder>, crate::error::StorageError> {
                Ok(vec![])
            }
            async fn list_keys(
                &self,
                _folder: &StorageFolder,
            ) -> Result<Vec<crate::storage::StorageKey>, crate::error::StorageError> {
                Ok(vec![])
            }
            async fn put(
                &self,
                _key: &crate::storage::StorageKey,
                _bytes: Bytes,
            ) -> Result<(), crate::error::StorageError> {
                Ok(())
            }
        }
        struct NoopMonitoring;
        #[async_trait]
        impl Monitoring for NoopMonitoring {
            async fn success(&self, _payload: crate::monitoring::SuccessPayload) {}
            async fn alert(&self, _payload: AlertPayload) {}
        }

        FolderMonitor::new(
            config(since_secs),
            Arc::new(NoopStorage),
            crate::db::build_target(
                &crate::config::Config::from_str(
                    r#"
region: us-east-1
message_queue: q
storage:
  type: redshift
  host: h
  database: d
  username: u
  password: p
  iam_role: r
"#,
                )
                .unwrap(),
            ),
            Transactor::new(Arc::new(NoopPool), std::time::Duration::from_secs(5)),
            Arc::new(Control::new()),
            Arc::new(NoopMonitoring),
        )
    }

    #[test]
    fn test_window_filter_drops_old_runs() {
        let monitor = monitor(Some(3600));
        let now: DateTime<Utc> = "2022-01-01T12:00:00Z".parse().unwrap();
        let base = StorageFolder::parse("s3://bucket/shredded/").unwrap();

        let folders = vec![
            base.append("run=2022-01-01-11-30-00"), // inside the window
            base.append("run=2022-01-01-09-00-00"), // too old
            base.append("not-a-run-folder"),        // unparseable, kept
        ];
        let kept = monitor.within_window(folders, now);
        let names: Vec<_> = kept.iter().map(|f| f.folder_name()).collect();
        assert_eq!(names, vec!["run=2022-01-01-11-30-00", "not-a-run-folder"]);
    }

    #[test]
    fn test_no_window_keeps_everything() {
        let monitor = monitor(None);
        let now: DateTime<Utc> = "2022-01-01T12:00:00Z".parse().unwrap();
        let base = StorageFolder::parse("s3://bucket/shredded/").unwrap();
        let folders = vec![base.append("run=1970-01-01-00-00-00")];
        assert_eq!(monitor.within_window(folders.clone(), now), folders);
    }
}
