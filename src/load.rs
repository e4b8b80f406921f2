//! The per-batch load state machine.
//!
//! Stages advance strictly: migration build, pre-transaction migrations,
//! then one transaction covering manifest check, in-transaction
//! migrations, the copies and the manifest insert. Everything inside the
//! transaction is wrapped by the retry controller; the pre-transaction
//! migrations are not, because some of them are irreversible.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ReadyCheckConfig;
use crate::db::manifest::Manifest;
use crate::db::statement::Statement;
use crate::db::target::Target;
use crate::db::transactor::{Session, Transactor};
use crate::discovery::{DataDiscovery, ShreddedType};
use crate::emit;
use crate::error::{DbError, LoaderError};
use crate::migration::{self, Migration};
use crate::monitoring::AlertPayload;
use crate::monitoring::events::{LoadRetried, MigrationExecuted, MigrationPhase};
use crate::retry::{RetryPolicy, retry_on_transient};
use crate::state::{Control, Stage};

/// Atomic event columns every wide-row COPY selects, ahead of the
/// per-type columns derived from the discovery.
const ATOMIC_COLUMNS: [&str; 22] = [
    "app_id",
    "platform",
    "etl_tstamp",
    "collector_tstamp",
    "dvce_created_tstamp",
    "event",
    "event_id",
    "name_tracker",
    "v_tracker",
    "v_collector",
    "v_etl",
    "user_id",
    "user_ipaddress",
    "domain_userid",
    "domain_sessionidx",
    "network_userid",
    "geo_country",
    "geo_region",
    "page_url",
    "page_title",
    "page_referrer",
    "load_tstamp",
];

/// Terminal result of one load attempt chain.
#[derive(Debug)]
pub enum LoadOutcome {
    /// The batch went in; `ingestion` is the manifest's warehouse-clock
    /// timestamp read back after commit.
    Loaded { ingestion: Option<DateTime<Utc>> },
    /// The manifest already had the base folder; nothing was copied.
    AlreadyLoaded(AlertPayload),
}

/// Everything the state machine needs for one batch.
pub struct LoadContext {
    pub target: Arc<dyn Target>,
    pub manifest: Arc<Manifest>,
    /// Transaction boundary with the loading statement timeout.
    pub loading: Transactor,
    /// Transaction boundary with the catalog/manifest statement timeout.
    pub non_loading: Transactor,
    pub retry: RetryPolicy,
    pub ready_check: ReadyCheckConfig,
    pub control: Arc<Control>,
}

/// Run the state machine for one discovered batch.
pub async fn load(
    context: &LoadContext,
    discovery: &DataDiscovery,
    shutdown: &CancellationToken,
) -> Result<LoadOutcome, LoaderError> {
    let target = context.target.as_ref();

    ready_check(context, shutdown).await?;

    context.control.set_stage(Stage::MigrationBuild);
    let plan = migration::build(discovery, target, &context.non_loading).await?;

    context.control.set_stage(Stage::MigrationPre);
    run_pre_migrations(context, &plan).await?;

    let outcome = retry_on_transient(
        &context.retry,
        shutdown,
        |_| {
            context.control.increment_attempt();
            emit!(LoadRetried);
        },
        || Box::pin(transaction(context, discovery, &plan, shutdown)),
    )
    .await?;

    match outcome {
        LoadOutcome::AlreadyLoaded(alert) => Ok(LoadOutcome::AlreadyLoaded(alert)),
        LoadOutcome::Loaded { .. } => {
            let ingestion = read_back_ingestion(context, discovery).await?;
            congratulate(context.control.attempts());
            Ok(LoadOutcome::Loaded { ingestion })
        }
    }
}

/// The single transaction: manifest check, in-transaction migrations,
/// copies, manifest insert. Any failure rolls the whole thing back.
async fn transaction(
    context: &LoadContext,
    discovery: &DataDiscovery,
    plan: &Migration,
    shutdown: &CancellationToken,
) -> Result<LoadOutcome, LoaderError> {
    let control = context.control.clone();
    let target = context.target.clone();
    let manifest = context.manifest.clone();

    context
        .loading
        .transact(async |session: &mut Session| {
            control.set_stage(Stage::ManifestCheck);
            if let Some(entry) = manifest.get(session, &discovery.base).await? {
                control.set_stage(Stage::Cancelling {
                    reason: "Already loaded".to_string(),
                });
                debug!(base = %entry.base, ingestion = %entry.ingestion, "Batch already in manifest");
                return Ok(LoadOutcome::AlreadyLoaded(AlertPayload::info(
                    "Folder is already loaded",
                    discovery.base.clone(),
                )));
            }

            control.set_stage(Stage::MigrationIn);
            for action in &plan.in_tx {
                checkpoint(shutdown)?;
                info!("{}", action.message);
                session.execute(target.as_ref(), &action.statement).await?;
                emit!(MigrationExecuted {
                    phase: MigrationPhase::In
                });
            }

            let event_columns = event_columns(target.as_ref(), discovery);
            for statement in target.load_statements(discovery, &event_columns) {
                checkpoint(shutdown)?;
                if let Some(table) = statement.target_table() {
                    control.set_stage(Stage::Loading {
                        table: table.to_string(),
                    });
                }
                session.execute(target.as_ref(), &statement).await?;
            }

            control.set_stage(Stage::Committing);
            manifest.add(session, &discovery.origin).await?;
            Ok(LoadOutcome::Loaded { ingestion: None })
        })
        .await
}

/// Poll the warehouse until it answers, for targets that may need to be
/// resumed or are still starting up.
async fn ready_check(context: &LoadContext, shutdown: &CancellationToken) -> Result<(), LoaderError> {
    let target = context.target.clone();
    let backoff = Duration::from_secs(context.ready_check.backoff_secs);
    let mut last_error: Option<DbError> = None;

    for attempt in 1..=context.ready_check.attempts {
        let probe = context
            .non_loading
            .run(async |session: &mut Session| {
                session.execute(target.as_ref(), &Statement::ReadyCheck).await
            })
            .await;
        match probe {
            Ok(_) => return Ok(()),
            Err(e) => {
                debug!(attempt, "Warehouse not ready: {e}");
                last_error = Some(e);
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => return Err(LoaderError::runtime("shutdown")),
            _ = tokio::time::sleep(backoff) => {}
        }
    }

    Err(LoaderError::Db {
        source: last_error.unwrap_or_else(|| DbError::transient("warehouse never became ready")),
    })
}

/// Pre-transaction migrations run one statement per connection lease and
/// are never retried.
async fn run_pre_migrations(context: &LoadContext, plan: &Migration) -> Result<(), LoaderError> {
    let target = context.target.clone();
    for action in &plan.pre {
        info!("{}", action.message);
        context
            .non_loading
            .run(async |session: &mut Session| {
                session.execute(target.as_ref(), &action.statement).await
            })
            .await
            .map_err(LoaderError::from)?;
        emit!(MigrationExecuted {
            phase: MigrationPhase::Pre
        });
    }
    Ok(())
}

/// Read the committed manifest row back for its warehouse-clock ingestion
/// timestamp.
async fn read_back_ingestion(
    context: &LoadContext,
    discovery: &DataDiscovery,
) -> Result<Option<DateTime<Utc>>, LoaderError> {
    let manifest = context.manifest.clone();
    let entry = context
        .non_loading
        .run(async |session: &mut Session| manifest.get(session, &discovery.base).await)
        .await
        .map_err(LoaderError::from)?;
    Ok(entry.map(|entry| entry.ingestion))
}

/// Columns for a wide-row events COPY: the atomic set plus one column per
/// wide-row type in the batch. Derived from the discovery because the
/// warehouse's catalog cannot be read there.
fn event_columns(target: &dyn Target, discovery: &DataDiscovery) -> Vec<String> {
    if !target.requires_event_columns() {
        return Vec::new();
    }
    let mut columns: Vec<String> = ATOMIC_COLUMNS.iter().map(|c| c.to_string()).collect();
    for shredded in &discovery.shredded_types {
        if let ShreddedType::Widerow { info } = shredded {
            columns.push(info.wide_column());
        }
    }
    columns
}

fn checkpoint(shutdown: &CancellationToken) -> Result<(), LoaderError> {
    if shutdown.is_cancelled() {
        return Err(LoaderError::runtime("shutdown"));
    }
    Ok(())
}

/// Log how hard-won a load was.
fn congratulate(attempts: usize) {
    if attempts > 0 {
        info!("Folder loaded after {attempts} attempts");
    } else {
        info!("Folder loaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::ShreddingComplete;
    use crate::iglu::{IgluConfig, Resolver};

    fn wide_discovery() -> DataDiscovery {
        let message: ShreddingComplete = serde_json::from_value(serde_json::json!({
            "base": "s3://bucket/run=1/",
            "types": [
                {
                    "vendor": "com.acme",
                    "name": "context",
                    "model": 1,
                    "format": "WIDEROW",
                    "snowplowEntity": "Context"
                },
                {
                    "vendor": "com.acme",
                    "name": "click",
                    "model": 2,
                    "format": "WIDEROW",
                    "snowplowEntity": "SelfDescribing"
                }
            ],
            "timestamps": {
                "jobStarted": "2022-01-01T00:05:00Z",
                "jobCompleted": "2022-01-01T00:15:00Z"
            },
            "compression": "NONE",
            "processor": {"artifact": "shredder", "version": "4.2.1"}
        }))
        .unwrap();
        futures::executor::block_on(DataDiscovery::resolve(
            message,
            &Resolver::new(IgluConfig::default()),
        ))
        .unwrap()
    }

    #[test]
    fn test_event_columns_for_wide_row_targets() {
        let target = crate::db::databricks::Databricks::new(crate::config::DatabricksConfig {
            catalog: "hive_metastore".into(),
            schema: "atomic".into(),
            connection: None,
        });
        let columns = event_columns(&target, &wide_discovery());
        assert!(columns.contains(&"event_id".to_string()));
        assert!(columns.contains(&"contexts_com_acme_context_1".to_string()));
        assert!(columns.contains(&"unstruct_event_com_acme_click_2".to_string()));
        assert_eq!(columns.len(), ATOMIC_COLUMNS.len() + 2);
    }

    #[test]
    fn test_event_columns_empty_for_columnar_targets() {
        let target = crate::db::snowflake::Snowflake::new(crate::config::SnowflakeConfig {
            account: "a".into(),
            warehouse: "w".into(),
            database: "d".into(),
            schema: "atomic".into(),
            storage_integration: "i".into(),
            connection: None,
        });
        assert!(event_columns(&target, &wide_discovery()).is_empty());
    }
}
