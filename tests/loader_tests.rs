//! End-to-end loader tests against an in-memory warehouse.
//!
//! The fake warehouse interprets the Redshift dialect's SQL just enough
//! to answer catalog reads, track manifest rows transactionally and
//! record every statement in order, which lets these tests assert the
//! spec-level behavior: exactly-once loads, phased migrations, retry
//! semantics and folder reconciliation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use glacier::config::{
    Config, FoldersConfig, ReadyCheckConfig, RetriesConfig, RetryStrategy, StorageConfig,
};
use glacier::db::manifest::Manifest;
use glacier::db::transactor::{Conn, ConnectionPool, SqlRow, SqlValue, Transactor};
use glacier::db::{build_target, target::Target};
use glacier::discovery::{DataDiscovery, ShreddingComplete};
use glacier::dispatch::Loader;
use glacier::error::{DbError, LoaderError, StorageError};
use glacier::iglu::{
    ColumnDef, ColumnEncoding, IgluConfig, Resolver, SchemaKey, SchemaVer, SqlType, TableSchema,
};
use glacier::load::{self, LoadContext, LoadOutcome};
use glacier::monitoring::{AlertPayload, Monitoring, SuccessPayload};
use glacier::queue::InProcessQueue;
use glacier::retry::RetryPolicy;
use glacier::state::Control;
use glacier::storage::{BlobStorage, StorageFolder, StorageKey};

// ============ Fake warehouse ============

#[derive(Default)]
struct WarehouseState {
    /// Tables present in the catalog.
    tables: HashSet<String>,
    /// Version markers (table comments).
    versions: HashMap<String, String>,
    /// Catalog columns per table.
    columns: HashMap<String, Vec<String>>,
    /// Committed manifest rows: base -> ingestion timestamp.
    manifest: HashMap<String, DateTime<Utc>>,
    /// Committed copies, by table.
    copies: Vec<String>,
    /// Uncommitted state of the open transaction.
    pending_manifest: Vec<String>,
    pending_copies: Vec<String>,
    in_tx: bool,
    /// Every statement, in execution order.
    executed: Vec<String>,
    /// One-shot failures: (sql substring, transient).
    fail_once: Vec<(String, bool)>,
    /// Folder list staged by the folder monitor.
    staged_folders: Vec<String>,
}

#[derive(Clone, Default)]
struct FakeWarehouse(Arc<Mutex<WarehouseState>>);

impl FakeWarehouse {
    fn with_table(self, name: &str, version: &str, columns: &[&str]) -> Self {
        {
            let mut state = self.0.lock().unwrap();
            state.tables.insert(name.to_string());
            state.versions.insert(name.to_string(), version.to_string());
            state
                .columns
                .insert(name.to_string(), columns.iter().map(|c| c.to_string()).collect());
        }
        self
    }

    fn with_manifest_row(self, base: &str) -> Self {
        self.0
            .lock()
            .unwrap()
            .manifest
            .insert(base.to_string(), "2022-01-01T00:20:00Z".parse().unwrap());
        self
    }

    fn fail_once(self, marker: &str, transient: bool) -> Self {
        self.0
            .lock()
            .unwrap()
            .fail_once
            .push((marker.to_string(), transient));
        self
    }

    fn executed(&self) -> Vec<String> {
        self.0.lock().unwrap().executed.clone()
    }

    fn manifest_bases(&self) -> Vec<String> {
        self.0.lock().unwrap().manifest.keys().cloned().collect()
    }

    fn copies(&self) -> Vec<String> {
        self.0.lock().unwrap().copies.clone()
    }

    fn position(&self, marker: &str) -> Option<usize> {
        self.executed().iter().position(|sql| sql.contains(marker))
    }
}

/// Extract the text between `start` and `end`.
fn between(sql: &str, start: &str, end: &str) -> Option<String> {
    let from = sql.find(start)? + start.len();
    let to = sql[from..].find(end)? + from;
    Some(sql[from..to].to_string())
}

struct FakeConn(Arc<Mutex<WarehouseState>>);

#[async_trait]
impl Conn for FakeConn {
    async fn execute(&mut self, sql: &str) -> Result<u64, DbError> {
        let mut state = self.0.lock().unwrap();
        state.executed.push(sql.to_string());

        if let Some(index) = state
            .fail_once
            .iter()
            .position(|(marker, _)| sql.contains(marker.as_str()))
        {
            let (marker, transient) = state.fail_once.remove(index);
            return Err(DbError::Query {
                message: format!("injected failure at {marker}"),
                transient,
            });
        }

        match sql {
            "BEGIN" => {
                state.in_tx = true;
                state.pending_manifest.clear();
                state.pending_copies.clear();
            }
            "COMMIT" => {
                state.in_tx = false;
                let inserts = std::mem::take(&mut state.pending_manifest);
                for base in inserts {
                    state
                        .manifest
                        .insert(base, "2022-01-01T00:20:00Z".parse().unwrap());
                }
                let copies = std::mem::take(&mut state.pending_copies);
                state.copies.extend(copies);
            }
            "ROLLBACK" | "ABORT" => {
                state.in_tx = false;
                state.pending_manifest.clear();
                state.pending_copies.clear();
            }
            _ if sql.starts_with("CREATE TABLE IF NOT EXISTS atomic.") => {
                if let Some(name) = between(sql, "CREATE TABLE IF NOT EXISTS atomic.", " ") {
                    state.tables.insert(name);
                }
            }
            _ if sql.starts_with("COMMENT ON TABLE atomic.") => {
                if let (Some(name), Some(version)) = (
                    between(sql, "COMMENT ON TABLE atomic.", " IS"),
                    between(sql, "IS '", "'"),
                ) {
                    state.versions.insert(name, version);
                }
            }
            _ if sql.starts_with("COPY atomic.") => {
                if let Some(table) = between(sql, "COPY atomic.", " FROM") {
                    if state.in_tx {
                        state.pending_copies.push(table);
                    } else {
                        state.copies.push(table);
                    }
                }
            }
            _ if sql.starts_with("INSERT INTO atomic.manifest") => {
                if let Some(base) = between(sql, "VALUES ('", "'") {
                    state.pending_manifest.push(base);
                }
            }
            _ => {}
        }
        Ok(0)
    }

    async fn query(&mut self, sql: &str) -> Result<Vec<SqlRow>, DbError> {
        self.execute(sql).await?;
        let state = self.0.lock().unwrap();

        if sql == "SELECT 1" {
            return Ok(vec![SqlRow(vec![SqlValue::Int(1)])]);
        }
        if sql.starts_with("SELECT EXISTS") {
            let name = between(sql, "table_name = '", "'").unwrap_or_default();
            return Ok(vec![SqlRow(vec![SqlValue::Bool(
                state.tables.contains(&name),
            )])]);
        }
        if sql.starts_with("SELECT description") {
            let name = between(sql, "objoid = 'atomic.\"", "\"").unwrap_or_default();
            return Ok(state
                .versions
                .get(&name)
                .map(|version| vec![SqlRow(vec![SqlValue::Text(version.clone())])])
                .unwrap_or_default());
        }
        if sql.starts_with("SELECT column_name") {
            let name = between(sql, "table_name = '", "'").unwrap_or_default();
            return Ok(state
                .columns
                .get(&name)
                .map(|columns| {
                    columns
                        .iter()
                        .map(|c| SqlRow(vec![SqlValue::Text(c.clone())]))
                        .collect()
                })
                .unwrap_or_default());
        }
        if sql.starts_with("SELECT base, types") {
            let base = between(sql, "WHERE base = '", "'").unwrap_or_default();
            return Ok(state
                .manifest
                .get(&base)
                .map(|ingestion| {
                    vec![SqlRow(vec![
                        SqlValue::Text(base.clone()),
                        SqlValue::Text("[]".to_string()),
                        SqlValue::Timestamp("2022-01-01T00:05:00Z".parse().unwrap()),
                        SqlValue::Timestamp("2022-01-01T00:15:00Z".parse().unwrap()),
                        SqlValue::Null,
                        SqlValue::Null,
                        SqlValue::Timestamp(*ingestion),
                        SqlValue::Text("GZIP".to_string()),
                        SqlValue::Text("shredder".to_string()),
                        SqlValue::Text("4.2.1".to_string()),
                        SqlValue::Null,
                    ])]
                })
                .unwrap_or_default());
        }
        if sql.starts_with("SELECT run_id FROM rdb_folder_monitoring") {
            return Ok(state
                .staged_folders
                .iter()
                .filter(|folder| !state.manifest.contains_key(folder.as_str()))
                .map(|folder| SqlRow(vec![SqlValue::Text(folder.clone())]))
                .collect());
        }
        Ok(vec![])
    }
}

#[async_trait]
impl ConnectionPool for FakeWarehouse {
    async fn acquire(&self) -> Result<Box<dyn Conn>, DbError> {
        Ok(Box::new(FakeConn(self.0.clone())))
    }
}

/// Blob storage whose `put` stages folder lists straight into the fake
/// warehouse, mirroring what the COPY would load.
struct FakeStorage {
    warehouse: FakeWarehouse,
    folders: Vec<StorageFolder>,
}

#[async_trait]
impl BlobStorage for FakeStorage {
    async fn list_folders(&self, _folder: &StorageFolder) -> Result<Vec<StorageFolder>, StorageError> {
        Ok(self.folders.clone())
    }

    async fn list_keys(&self, _folder: &StorageFolder) -> Result<Vec<StorageKey>, StorageError> {
        Ok(vec![])
    }

    async fn put(&self, _key: &StorageKey, bytes: Bytes) -> Result<(), StorageError> {
        let body = String::from_utf8_lossy(&bytes).to_string();
        self.warehouse.0.lock().unwrap().staged_folders =
            body.lines().map(|line| line.to_string()).collect();
        Ok(())
    }
}

#[derive(Default)]
struct RecordingMonitoring {
    alerts: Mutex<Vec<AlertPayload>>,
    successes: Mutex<Vec<SuccessPayload>>,
}

#[async_trait]
impl Monitoring for RecordingMonitoring {
    async fn success(&self, payload: SuccessPayload) {
        self.successes.lock().unwrap().push(payload);
    }

    async fn alert(&self, payload: AlertPayload) {
        self.alerts.lock().unwrap().push(payload);
    }
}

// ============ Fixtures ============

const CONFIG_YAML: &str = r#"
region: us-east-1
message_queue: https://sqs.us-east-1.amazonaws.com/123456789/loader-queue
storage:
  type: redshift
  host: redshift.example.com
  database: snowplow
  username: loader
  password: secret
  iam_role: arn:aws:iam::123456789:role/loader
retries:
  strategy: constant
  attempts: 3
  backoff_secs: 0
ready_check:
  attempts: 2
  backoff_secs: 0
"#;

fn config() -> Config {
    Config::from_str(CONFIG_YAML).unwrap()
}

fn target() -> Arc<dyn Target> {
    build_target(&config())
}

fn schema(version: &str, columns: &[(&str, SqlType)]) -> TableSchema {
    TableSchema {
        key: SchemaKey::new("com.acme", "context", SchemaVer::parse(version).unwrap()),
        columns: columns
            .iter()
            .map(|(name, sql_type)| ColumnDef {
                name: name.to_string(),
                sql_type: *sql_type,
                nullable: true,
                encoding: Some(ColumnEncoding::Zstd),
            })
            .collect(),
    }
}

fn resolver(schemas: Vec<TableSchema>) -> Resolver {
    Resolver::new(IgluConfig {
        registries: vec![],
        schemas,
    })
}

fn message_json(model: u32) -> String {
    serde_json::json!({
        "base": "s3://bucket/shredded/run=2022-01-01-00-00-00/",
        "types": [{
            "vendor": "com.acme",
            "name": "context",
            "model": model,
            "format": "TSV",
            "snowplowEntity": "Context"
        }],
        "timestamps": {
            "jobStarted": "2022-01-01T00:05:00Z",
            "jobCompleted": "2022-01-01T00:15:00Z",
            "minCollector": "2021-12-31T23:00:00Z",
            "maxCollector": "2022-01-01T00:00:00Z"
        },
        "compression": "GZIP",
        "processor": {"artifact": "shredder", "version": "4.2.1"},
        "count": 9213
    })
    .to_string()
}

async fn discovery(model: u32, schemas: Vec<TableSchema>) -> DataDiscovery {
    let message = ShreddingComplete::parse(&message_json(model)).unwrap();
    DataDiscovery::resolve(message, &resolver(schemas))
        .await
        .unwrap()
}

fn context(warehouse: &FakeWarehouse, control: Arc<Control>) -> LoadContext {
    let config = config();
    let pool: Arc<dyn ConnectionPool> = Arc::new(warehouse.clone());
    let target = target();
    LoadContext {
        manifest: Arc::new(Manifest::new(target.clone())),
        target,
        loading: Transactor::new(pool.clone(), Duration::from_secs(5)),
        non_loading: Transactor::new(pool, Duration::from_secs(5)),
        retry: RetryPolicy::from_config(&config.retries),
        ready_check: config.ready_check.clone(),
        control,
    }
}

const BASE: &str = "s3://bucket/shredded/run=2022-01-01-00-00-00/";

fn busy_control() -> Arc<Control> {
    let control = Arc::new(Control::new());
    control.make_busy(StorageFolder::parse(BASE).unwrap());
    control
}

// ============ Load state machine ============

#[tokio::test]
async fn test_fresh_table_creation_loads_batch() {
    let warehouse = FakeWarehouse::default();
    let control = busy_control();
    let context = context(&warehouse, control.clone());

    let discovery = discovery(
        1,
        vec![schema("1-0-0", &[("one", SqlType::Varchar { length: 32 })])],
    )
    .await;

    let outcome = load::load(&context, &discovery, &CancellationToken::new())
        .await
        .unwrap();
    let LoadOutcome::Loaded { ingestion } = outcome else {
        panic!("expected a fresh load");
    };
    assert!(ingestion.is_some());

    // The new table was created inside the transaction, then copied into.
    let begin = warehouse.position("BEGIN").unwrap();
    let create = warehouse
        .position("CREATE TABLE IF NOT EXISTS atomic.com_acme_context_1")
        .unwrap();
    let copy_events = warehouse.position("COPY atomic.events FROM").unwrap();
    let copy_shredded = warehouse
        .position("COPY atomic.com_acme_context_1 FROM")
        .unwrap();
    let comment = warehouse
        .position("COMMENT ON TABLE atomic.com_acme_context_1")
        .unwrap();
    let insert = warehouse.position("INSERT INTO atomic.manifest").unwrap();
    let commit = warehouse.position("COMMIT").unwrap();
    assert!(begin < create && create < comment);
    assert!(comment < copy_events && copy_events < copy_shredded);
    assert!(copy_shredded < insert && insert < commit);

    assert_eq!(warehouse.manifest_bases(), vec![BASE.to_string()]);
    assert_eq!(control.attempts(), 0);
}

#[tokio::test]
async fn test_additive_migration_runs_in_transaction() {
    let warehouse =
        FakeWarehouse::default().with_table("com_acme_context_1", "iglu:com.acme/context/jsonschema/1-0-0", &["one"]);
    let context = context(&warehouse, busy_control());

    let discovery = discovery(
        1,
        vec![
            schema("1-0-0", &[("one", SqlType::Varchar { length: 32 })]),
            schema(
                "1-0-1",
                &[
                    ("one", SqlType::Varchar { length: 32 }),
                    ("three", SqlType::Varchar { length: 4096 }),
                ],
            ),
        ],
    )
    .await;

    load::load(&context, &discovery, &CancellationToken::new())
        .await
        .unwrap();

    let begin = warehouse.position("BEGIN").unwrap();
    let add = warehouse
        .position("ALTER TABLE atomic.com_acme_context_1 ADD COLUMN \"three\" VARCHAR(4096) ENCODE ZSTD")
        .unwrap();
    let commit = warehouse.position("COMMIT").unwrap();
    assert!(begin < add && add < commit);
    assert!(warehouse.position("ALTER COLUMN").is_none());

    // The marker now records 1-0-1.
    let versions = warehouse.0.lock().unwrap().versions.clone();
    assert_eq!(
        versions.get("com_acme_context_1").map(String::as_str),
        Some("iglu:com.acme/context/jsonschema/1-0-1")
    );
}

#[tokio::test]
async fn test_widening_runs_before_transaction() {
    let warehouse =
        FakeWarehouse::default().with_table("com_acme_context_2", "iglu:com.acme/context/jsonschema/2-0-0", &["one"]);
    let context = context(&warehouse, busy_control());

    let discovery = discovery(
        2,
        vec![
            schema("2-0-0", &[("one", SqlType::Varchar { length: 32 })]),
            schema("2-0-1", &[("one", SqlType::Varchar { length: 64 })]),
        ],
    )
    .await;

    load::load(&context, &discovery, &CancellationToken::new())
        .await
        .unwrap();

    let widen = warehouse
        .position("ALTER TABLE atomic.com_acme_context_2 ALTER COLUMN \"one\" TYPE VARCHAR(64)")
        .unwrap();
    let begin = warehouse.position("BEGIN").unwrap();
    assert!(widen < begin, "widening must run outside the transaction");
}

#[tokio::test]
async fn test_duplicate_delivery_is_cancelled() {
    let warehouse = FakeWarehouse::default()
        .with_table("com_acme_context_1", "iglu:com.acme/context/jsonschema/1-0-0", &["one"])
        .with_manifest_row(BASE);
    let context = context(&warehouse, busy_control());

    let discovery = discovery(
        1,
        vec![schema("1-0-0", &[("one", SqlType::Varchar { length: 32 })])],
    )
    .await;

    let outcome = load::load(&context, &discovery, &CancellationToken::new())
        .await
        .unwrap();
    let LoadOutcome::AlreadyLoaded(alert) = outcome else {
        panic!("expected the duplicate to cancel");
    };
    assert_eq!(alert.message, "Folder is already loaded");

    // No copy, no second manifest row.
    assert!(warehouse.position("COPY").is_none());
    assert!(warehouse.position("INSERT INTO atomic.manifest").is_none());
    assert_eq!(warehouse.manifest_bases(), vec![BASE.to_string()]);
}

#[tokio::test]
async fn test_idempotence_of_repeated_loads() {
    let warehouse = FakeWarehouse::default();
    let context = context(&warehouse, busy_control());
    let discovery = discovery(
        1,
        vec![schema("1-0-0", &[("one", SqlType::Varchar { length: 32 })])],
    )
    .await;

    let first = load::load(&context, &discovery, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(first, LoadOutcome::Loaded { .. }));

    let second = load::load(&context, &discovery, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(second, LoadOutcome::AlreadyLoaded(_)));

    assert_eq!(warehouse.manifest_bases(), vec![BASE.to_string()]);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let warehouse = FakeWarehouse::default().fail_once("COPY atomic.events", true);
    let control = busy_control();
    let context = context(&warehouse, control.clone());

    let discovery = discovery(
        1,
        vec![schema("1-0-0", &[("one", SqlType::Varchar { length: 32 })])],
    )
    .await;

    let outcome = load::load(&context, &discovery, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, LoadOutcome::Loaded { .. }));
    assert_eq!(control.attempts(), 1);

    // First transaction rolled back, second committed.
    let executed = warehouse.executed();
    let rollbacks = executed.iter().filter(|sql| *sql == "ROLLBACK").count();
    let commits = executed.iter().filter(|sql| *sql == "COMMIT").count();
    assert_eq!(rollbacks, 1);
    assert_eq!(commits, 1);
    assert_eq!(warehouse.manifest_bases(), vec![BASE.to_string()]);
}

#[tokio::test]
async fn test_fatal_failure_rolls_back_everything() {
    let warehouse = FakeWarehouse::default().fail_once("INSERT INTO atomic.manifest", false);
    let context = context(&warehouse, busy_control());

    let discovery = discovery(
        1,
        vec![schema("1-0-0", &[("one", SqlType::Varchar { length: 32 })])],
    )
    .await;

    let result = load::load(&context, &discovery, &CancellationToken::new()).await;
    assert!(result.is_err());

    // Nothing observable: no manifest row, no committed copies.
    assert!(warehouse.manifest_bases().is_empty());
    assert!(warehouse.copies().is_empty());
    assert!(warehouse.position("ROLLBACK").is_some());
}

#[tokio::test]
async fn test_retries_exhausted_surfaces_error() {
    let warehouse = FakeWarehouse::default()
        .fail_once("COPY atomic.events", true)
        .fail_once("COPY atomic.events", true)
        .fail_once("COPY atomic.events", true);
    let control = busy_control();
    let context = context(&warehouse, control.clone());

    let discovery = discovery(
        1,
        vec![schema("1-0-0", &[("one", SqlType::Varchar { length: 32 })])],
    )
    .await;

    let result = load::load(&context, &discovery, &CancellationToken::new()).await;
    assert!(matches!(
        result,
        Err(LoaderError::RetriesExhausted { attempts: 3, .. })
    ));
    assert_eq!(control.attempts(), 2);
    assert!(warehouse.manifest_bases().is_empty());
}

// ============ Dispatch loop ============

async fn run_dispatch(
    warehouse: &FakeWarehouse,
    queue: Arc<InProcessQueue>,
    schemas: Vec<TableSchema>,
) -> (Arc<Control>, Arc<RecordingMonitoring>, Result<(), LoaderError>) {
    let control = Arc::new(Control::new());
    let monitoring = Arc::new(RecordingMonitoring::default());
    let loader = Loader {
        config: config(),
        queue: queue.clone(),
        registry: Arc::new(resolver(schemas)),
        target: target(),
        pool: Arc::new(warehouse.clone()),
        storage: None,
        monitoring: monitoring.clone(),
        control: control.clone(),
        app: "glacier-test".to_string(),
    };

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(loader.run(shutdown.clone()));

    // Wait until the message is acknowledged or give up.
    for _ in 0..200 {
        if !queue.acked().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    let result = handle.await.unwrap();
    (control, monitoring, result)
}

#[tokio::test]
async fn test_dispatch_loads_and_acks() {
    let warehouse = FakeWarehouse::default();
    let queue = InProcessQueue::new();
    queue.push(message_json(1)).await;

    let (control, monitoring, result) = run_dispatch(
        &warehouse,
        queue.clone(),
        vec![schema("1-0-0", &[("one", SqlType::Varchar { length: 32 })])],
    )
    .await;

    result.unwrap();
    assert_eq!(queue.acked().await.len(), 1);
    assert_eq!(control.loaded(), 1);
    assert_eq!(control.messages(), 1);
    assert!(!control.is_busy());

    let successes = monitoring.successes.lock().unwrap();
    assert_eq!(successes.len(), 1);
    assert_eq!(successes[0].base.as_str(), BASE);
    assert_eq!(successes[0].attempts, 0);
    assert_eq!(
        successes[0].metrics.as_ref().unwrap().count_good,
        Some(9213)
    );
    assert_eq!(warehouse.manifest_bases(), vec![BASE.to_string()]);
}

#[tokio::test]
async fn test_dispatch_acks_duplicates_with_alert() {
    let warehouse = FakeWarehouse::default()
        .with_table("com_acme_context_1", "iglu:com.acme/context/jsonschema/1-0-0", &["one"])
        .with_manifest_row(BASE);
    let queue = InProcessQueue::new();
    queue.push(message_json(1)).await;

    let (control, monitoring, result) = run_dispatch(
        &warehouse,
        queue.clone(),
        vec![schema("1-0-0", &[("one", SqlType::Varchar { length: 32 })])],
    )
    .await;

    result.unwrap();
    assert_eq!(queue.acked().await.len(), 1);
    assert_eq!(control.loaded(), 0);

    let alerts = monitoring.alerts.lock().unwrap();
    assert!(alerts
        .iter()
        .any(|alert| alert.message == "Folder is already loaded"));
}

#[tokio::test]
async fn test_dispatch_serializes_batches() {
    let warehouse = FakeWarehouse::default();
    let queue = InProcessQueue::new();
    queue.push(message_json(1)).await;
    queue
        .push(message_json(1).replace("run=2022-01-01-00-00-00", "run=2022-01-01-01-00-00"))
        .await;

    let control = Arc::new(Control::new());
    let loader = Loader {
        config: config(),
        queue: queue.clone(),
        registry: Arc::new(resolver(vec![schema(
            "1-0-0",
            &[("one", SqlType::Varchar { length: 32 })],
        )])),
        target: target(),
        pool: Arc::new(warehouse.clone()),
        storage: None,
        monitoring: Arc::new(RecordingMonitoring::default()),
        control: control.clone(),
        app: "glacier-test".to_string(),
    };

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(loader.run(shutdown.clone()));
    for _ in 0..400 {
        if queue.acked().await.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(control.loaded(), 2);
    let mut bases = warehouse.manifest_bases();
    bases.sort();
    assert_eq!(bases.len(), 2);

    // Single-flight: transactions never interleave. Every BEGIN is closed
    // by a COMMIT or ROLLBACK before the next BEGIN opens.
    let mut open = false;
    for sql in warehouse.executed() {
        match sql.as_str() {
            "BEGIN" => {
                assert!(!open, "second transaction opened while one was in flight");
                open = true;
            }
            "COMMIT" | "ROLLBACK" => open = false,
            _ => {}
        }
    }
    assert!(!open);
}

#[tokio::test]
async fn test_dispatch_acks_malformed_messages() {
    let warehouse = FakeWarehouse::default();
    let queue = InProcessQueue::new();
    queue.push("{\"not\": \"a shredding complete\"}").await;

    let (control, monitoring, result) = run_dispatch(&warehouse, queue.clone(), vec![]).await;

    result.unwrap();
    assert_eq!(queue.acked().await.len(), 1);
    assert_eq!(control.loaded(), 0);
    assert!(warehouse.manifest_bases().is_empty());

    let alerts = monitoring.alerts.lock().unwrap();
    assert!(alerts.iter().any(|alert| alert
        .message
        .starts_with("Malformed shredding-complete message")));
}

// ============ Folder monitor ============

#[tokio::test]
async fn test_folder_monitor_alerts_on_orphans() {
    use glacier::monitoring::folders::FolderMonitor;

    let loaded = "s3://bucket/shredded/run=2022-01-01-00-00-00/";
    let orphan = "s3://bucket/shredded/run=2022-01-01-01-00-00/";
    let warehouse = FakeWarehouse::default().with_manifest_row(loaded);

    let storage = FakeStorage {
        warehouse: warehouse.clone(),
        folders: vec![
            StorageFolder::parse(loaded).unwrap(),
            StorageFolder::parse(orphan).unwrap(),
        ],
    };
    let monitoring = Arc::new(RecordingMonitoring::default());

    let monitor = FolderMonitor::new(
        FoldersConfig {
            period_secs: 60,
            staging: StorageFolder::parse("s3://bucket/monitoring/").unwrap(),
            since_secs: None,
            shredder_output: StorageFolder::parse("s3://bucket/shredded/").unwrap(),
        },
        Arc::new(storage),
        target(),
        Transactor::new(Arc::new(warehouse.clone()), Duration::from_secs(5)),
        Arc::new(Control::new()),
        monitoring.clone(),
    );

    let orphans = monitor.check(Utc::now()).await.unwrap();
    assert_eq!(orphans, 1);

    let alerts = monitoring.alerts.lock().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].message, "Unloaded folder found");
    assert_eq!(alerts[0].folder.as_ref().unwrap().as_str(), orphan);

    // The sweep cleaned up its temp table.
    assert!(warehouse.position("DROP TABLE IF EXISTS rdb_folder_monitoring").is_some());
}

// ============ Configuration ============

#[test]
fn test_unknown_region_exits_with_config_error() {
    let yaml = CONFIG_YAML.replace("us-east-1", "unknown-region-1");
    let error = Config::from_str(&yaml).unwrap_err();
    assert!(error.to_string().contains("unknown-region-1"));

    let loader_error = LoaderError::Config { source: error };
    assert_eq!(loader_error.exit_code(), 2);
}

#[test]
fn test_retry_strategy_parses() {
    let config = config();
    assert_eq!(config.retries.strategy, RetryStrategy::Constant);
    let _: &RetriesConfig = &config.retries;
    let _: &ReadyCheckConfig = &config.ready_check;
    assert!(matches!(config.storage, StorageConfig::Redshift(_)));
}
