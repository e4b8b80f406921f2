//! Error types for the loader using snafu.
//!
//! Each module has its own error enum with context selectors; `LoaderError`
//! aggregates them at the dispatch boundary. The taxonomy matters for
//! control flow: `DbError::is_transient` decides whether the retry
//! controller re-runs a transaction, and `LoaderError::exit_code` decides
//! the process exit status.

use snafu::prelude::*;

use crate::db::statement::Statement;

// ============ Storage Errors ============

/// Errors from object-storage paths and operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// The string is not a valid storage folder or key.
    #[snafu(display("Invalid storage path: {path}: {reason}"))]
    InvalidPath { path: String, reason: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed"))]
    ObjectStore { source: object_store::Error },

    /// Storage URL could not be mapped to a backend.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },
}

// ============ Config Errors ============

/// Errors raised while loading or validating configuration.
///
/// All of these are fatal on startup and map to exit code 2.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },

    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    #[snafu(display("Unknown region: {region}"))]
    UnknownRegion { region: String },

    #[snafu(display("Message queue name cannot be empty"))]
    EmptyQueue,

    #[snafu(display("Invalid no-op window {name}: {reason}"))]
    InvalidWindow { name: String, reason: String },

    #[snafu(display("Invalid storage path in configuration"))]
    ConfigPath { source: StorageError },

    #[snafu(display("Retry configuration invalid: {reason}"))]
    InvalidRetries { reason: String },
}

// ============ Discovery Errors ============

/// Errors while turning a queue message into a `DataDiscovery`.
///
/// The message has already been received, so these are alert-and-ack:
/// nacking would redeliver a payload that can never parse.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DiscoveryError {
    #[snafu(display("Malformed shredding-complete message"))]
    MalformedMessage { source: serde_json::Error },

    #[snafu(display("Schema registry lookup failed for {vendor}/{name}/{model}"))]
    Registry {
        vendor: String,
        name: String,
        model: u32,
        source: RegistryError,
    },
}

/// Errors from the schema registry client.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RegistryError {
    #[snafu(display("Registry request failed"))]
    Http { source: reqwest::Error },

    #[snafu(display("Registry returned an invalid schema list: {reason}"))]
    InvalidList { reason: String },

    #[snafu(display("Schema {vendor}/{name}/{model} not found in any registry"))]
    NotFound {
        vendor: String,
        name: String,
        model: u32,
    },
}

// ============ Migration Errors ============

/// Errors from the migration planner.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MigrationError {
    /// The catalog's comment names a version absent from the schema list.
    #[snafu(display("Table {table} is at {current}, which is not part of the known schema list"))]
    StaleCatalog { table: String, current: String },

    /// Nothing to migrate to: the list holds a single version yet the
    /// catalog disagrees with it.
    #[snafu(display("Schema list for {table} has a single entry; cannot compute a migration"))]
    SingleEntry { table: String },

    /// The table comment could not be parsed as a schema URI.
    #[snafu(display("Table {table} has an unparseable version comment: {comment}"))]
    BadComment { table: String, comment: String },

    /// A narrowing or otherwise unsupported column change was required.
    #[snafu(display("Unsupported column change for {table}.{column}: {from} -> {to}"))]
    UnsupportedChange {
        table: String,
        column: String,
        from: String,
        to: String,
    },
}

// ============ DB Errors ============

/// Errors from SQL execution and the connection pool.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DbError {
    #[snafu(display("Failed to acquire a warehouse connection"))]
    PoolAcquire { message: String },

    #[snafu(display("Statement failed: {message}"))]
    Query { message: String, transient: bool },

    /// The target dialect cannot express this statement.
    #[snafu(display("Statement not supported by this warehouse: {statement}"))]
    Unsupported { statement: String },

    #[snafu(display("Single attempt timed out after {seconds}s"))]
    AttemptTimeout { seconds: u64 },

    #[snafu(display("Unexpected result shape for {statement}: {reason}"))]
    ResultShape { statement: String, reason: String },
}

impl DbError {
    /// Whether the retry controller should re-run after this error.
    ///
    /// Connection churn, pool exhaustion and per-attempt timeouts are
    /// transient; DDL syntax, constraint and permission failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::PoolAcquire { .. } => true,
            DbError::AttemptTimeout { .. } => true,
            DbError::Query { transient, .. } => *transient,
            DbError::Unsupported { .. } => false,
            DbError::ResultShape { .. } => false,
        }
    }

    /// Shorthand for a transient query failure.
    pub fn transient(message: impl Into<String>) -> Self {
        DbError::Query {
            message: message.into(),
            transient: true,
        }
    }

    /// Shorthand for a fatal query failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        DbError::Query {
            message: message.into(),
            transient: false,
        }
    }

    pub(crate) fn unsupported(statement: &Statement) -> Self {
        DbError::Unsupported {
            statement: statement.title().to_string(),
        }
    }
}

// ============ Queue Errors ============

/// Errors from the message-queue client.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueueError {
    #[snafu(display("Queue receive failed: {message}"))]
    Receive { message: String },

    #[snafu(display("Failed to acknowledge message: {message}"))]
    Ack { message: String },

    #[snafu(display("Failed to extend message visibility: {message}"))]
    Extend { message: String },
}

// ============ Monitoring Errors ============

/// Errors from outbound monitoring sinks.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MonitoringError {
    #[snafu(display("Failed to deliver monitoring payload"))]
    Webhook { source: reqwest::Error },

    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    #[snafu(display("Failed to parse metrics address"))]
    AddressParse { source: std::net::AddrParseError },

    #[snafu(display("Failed to bind the metrics endpoint"))]
    MetricsBind { source: std::io::Error },
}

// ============ Loader Error (top-level) ============

/// Top-level error surfaced by the dispatch loop.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LoaderError {
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    #[snafu(display("Discovery error"))]
    Discovery { source: DiscoveryError },

    #[snafu(display("Migration planning failed"))]
    Migration { source: MigrationError },

    #[snafu(display("Warehouse error"))]
    Db { source: DbError },

    #[snafu(display("Storage error"))]
    LoaderStorage { source: StorageError },

    #[snafu(display("Queue error"))]
    LoaderQueue { source: QueueError },

    #[snafu(display("Monitoring error"))]
    Monitoring { source: MonitoringError },

    #[snafu(display("Retries exhausted after {attempts} attempts"))]
    RetriesExhausted { attempts: usize, source: DbError },

    #[snafu(display("Runtime error: {message}"))]
    Runtime { message: String },
}

impl From<DbError> for LoaderError {
    fn from(source: DbError) -> Self {
        LoaderError::Db { source }
    }
}

impl LoaderError {
    /// Process exit code for this error: configuration problems exit 2,
    /// everything else exits 1.
    pub fn exit_code(&self) -> u8 {
        match self {
            LoaderError::Config { .. } => 2,
            _ => 1,
        }
    }

    /// Whether this failure terminates the dispatch stream. Planner and
    /// discovery failures are alert-and-continue; fatal DB and runtime
    /// errors propagate so the supervisor restarts the loader.
    pub fn is_fatal(&self) -> bool {
        match self {
            LoaderError::Discovery { .. } | LoaderError::Migration { .. } => false,
            LoaderError::Db { source } => !source.is_transient(),
            _ => true,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        LoaderError::Runtime {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DbError::transient("connection reset by peer").is_transient());
        assert!(DbError::AttemptTimeout { seconds: 30 }.is_transient());
        assert!(
            DbError::PoolAcquire {
                message: "timed out".into()
            }
            .is_transient()
        );
        assert!(!DbError::fatal("syntax error at or near COPY").is_transient());
    }

    #[test]
    fn test_exit_codes() {
        let config = LoaderError::Config {
            source: ConfigError::UnknownRegion {
                region: "unknown-region-1".into(),
            },
        };
        assert_eq!(config.exit_code(), 2);
        assert_eq!(LoaderError::runtime("boom").exit_code(), 1);
    }

    #[test]
    fn test_fatality() {
        let migration = LoaderError::Migration {
            source: MigrationError::SingleEntry {
                table: "atomic.com_acme_context_1".into(),
            },
        };
        assert!(!migration.is_fatal());
        assert!(LoaderError::runtime("panic").is_fatal());
    }
}
