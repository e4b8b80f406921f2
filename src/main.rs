//! glacier: warehouse loader daemon entrypoint.
//!
//! Wires the configured collaborators together and runs the dispatch
//! loop until a signal arrives. Exit codes: 0 on graceful shutdown, 1 on
//! runtime errors, 2 on configuration errors.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use snafu::prelude::*;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use glacier::config::{Config, StorageConfig};
use glacier::db::transactor::{PgPool, PgPoolConfig};
use glacier::dispatch::{Loader, shutdown_signal};
use glacier::error::{ConfigSnafu, LoaderError, MonitoringSnafu};
use glacier::iglu::{IgluConfig, Resolver};
use glacier::monitoring::{MonitoringHub, server};
use glacier::queue::SqsQueue;
use glacier::state::Control;
use glacier::storage::ObjectStorage;

/// Loads shredded analytics batches into a columnar warehouse.
#[derive(Parser, Debug)]
#[command(name = "glacier")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Path to the schema-registry configuration file.
    #[arg(long)]
    iglu_config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Validate configuration without subscribing to the queue.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("glacier starting");

    match run(args).await {
        Ok(()) => {
            info!("glacier stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            let code = e.exit_code();
            error!("{}", snafu::Report::from_error(e));
            ExitCode::from(code)
        }
    }
}

async fn run(args: Args) -> Result<(), LoaderError> {
    let config = Config::from_file(&args.config).context(ConfigSnafu)?;
    let iglu_config = IgluConfig::from_file(&args.iglu_config).context(ConfigSnafu)?;

    if args.dry_run {
        info!("Dry run mode - validating configuration");
        info!("Region: {}", config.region);
        info!("Queue: {}", config.message_queue);
        info!("Warehouse: {}", config.storage.kind());
        info!("Registries: {}", iglu_config.registries.len());
        info!("Embedded schemas: {}", iglu_config.schemas.len());
        info!("Configuration is valid");
        return Ok(());
    }

    if config.monitoring.metrics.enabled {
        server::start(&config.monitoring.metrics.address)
            .await
            .context(MonitoringSnafu)?;
    }

    let pool = Arc::new(PgPool::new(&pool_config(&config)?)?);
    let storage = match &config.monitoring.folders {
        Some(folders) => Some(Arc::new(
            ObjectStorage::s3(&config.region, &folders.shredder_output)
                .map_err(|source| LoaderError::LoaderStorage { source })?,
        ) as Arc<dyn glacier::storage::BlobStorage>),
        None => None,
    };
    let monitoring = Arc::new(MonitoringHub::new(&config.monitoring));
    let app = monitoring.app().to_string();

    let loader = Loader {
        queue: Arc::new(SqsQueue::new(&config.message_queue)),
        registry: Arc::new(Resolver::new(iglu_config)),
        target: glacier::db::build_target(&config),
        pool,
        storage,
        monitoring,
        control: Arc::new(Control::new()),
        app,
        config,
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    loader.run(shutdown).await
}

/// Connection settings for the bundled postgres-wire pool. Snowflake and
/// Databricks reach their SQL gateways through the same wire settings.
fn pool_config(config: &Config) -> Result<PgPoolConfig, LoaderError> {
    let missing = || {
        LoaderError::runtime(format!(
            "storage {} has no connection settings for the bundled pool",
            config.storage.kind()
        ))
    };
    match &config.storage {
        StorageConfig::Redshift(redshift) => Ok(PgPoolConfig {
            host: redshift.host.clone(),
            port: redshift.port,
            database: redshift.database.clone(),
            username: redshift.username.clone(),
            password: redshift.password.clone(),
        }),
        StorageConfig::Snowflake(snowflake) => {
            let connection = snowflake.connection.as_ref().ok_or_else(missing)?;
            Ok(PgPoolConfig {
                host: connection.host.clone(),
                port: connection.port,
                database: connection.database.clone(),
                username: connection.username.clone(),
                password: connection.password.clone(),
            })
        }
        StorageConfig::Databricks(databricks) => {
            let connection = databricks.connection.as_ref().ok_or_else(missing)?;
            Ok(PgPoolConfig {
                host: connection.host.clone(),
                port: connection.port,
                database: connection.database.clone(),
                username: connection.username.clone(),
                password: connection.password.clone(),
            })
        }
    }
}
