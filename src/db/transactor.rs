//! The transaction boundary.
//!
//! `Transactor::transact` runs a composite operation inside a single
//! BEGIN/COMMIT (rolling back on any failure); `Transactor::run` executes
//! the same kind of operation without transaction control, for statements
//! the warehouse forbids inside one. Operations receive a `Session` that
//! offers only execute and query (no logging sinks, no HTTP, no queue),
//! which is what keeps transactional code free of side effects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::NoTls;
use tokio_postgres::types::Type;
use tracing::debug;

use crate::db::statement::Statement;
use crate::db::target::Target;
use crate::error::{DbError, LoaderError};

/// Connections in the pool. Loads are single-flight, so four is enough:
/// one for the load, the rest for manifest reads, folder monitoring and
/// ready checks.
pub const POOL_SIZE: usize = 4;

/// One value of a result row.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

/// One result row, positionally indexed.
#[derive(Debug, Clone, Default)]
pub struct SqlRow(pub Vec<SqlValue>);

impl SqlRow {
    pub fn bool_at(&self, index: usize) -> Option<bool> {
        match self.0.get(index)? {
            SqlValue::Bool(value) => Some(*value),
            SqlValue::Int(value) => Some(*value != 0),
            _ => None,
        }
    }

    pub fn int_at(&self, index: usize) -> Option<i64> {
        match self.0.get(index)? {
            SqlValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn text_at(&self, index: usize) -> Option<String> {
        match self.0.get(index)? {
            SqlValue::Text(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn timestamp_at(&self, index: usize) -> Option<DateTime<Utc>> {
        match self.0.get(index)? {
            SqlValue::Timestamp(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.0.get(index), Some(SqlValue::Null) | None)
    }
}

/// A single warehouse connection.
#[async_trait]
pub trait Conn: Send {
    async fn execute(&mut self, sql: &str) -> Result<u64, DbError>;
    async fn query(&mut self, sql: &str) -> Result<Vec<SqlRow>, DbError>;
}

/// Hands out connections; implemented by the bundled postgres-wire pool
/// and by recording fakes in tests.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn Conn>, DbError>;
}

/// A leased connection with per-statement timeout enforcement.
pub struct Session {
    conn: Box<dyn Conn>,
    statement_timeout: Duration,
}

impl Session {
    /// Render and execute one statement.
    pub async fn execute(
        &mut self,
        target: &dyn Target,
        statement: &Statement,
    ) -> Result<u64, DbError> {
        let sql = target.to_fragment(statement)?;
        debug!(statement = statement.title(), "Executing");
        let deadline = self.statement_timeout;
        match tokio::time::timeout(deadline, self.conn.execute(&sql)).await {
            Ok(result) => result,
            Err(_) => Err(DbError::AttemptTimeout {
                seconds: deadline.as_secs(),
            }),
        }
    }

    /// Render and run one statement, returning its rows.
    pub async fn query(
        &mut self,
        target: &dyn Target,
        statement: &Statement,
    ) -> Result<Vec<SqlRow>, DbError> {
        let sql = target.to_fragment(statement)?;
        debug!(statement = statement.title(), "Querying");
        let deadline = self.statement_timeout;
        match tokio::time::timeout(deadline, self.conn.query(&sql)).await {
            Ok(result) => result,
            Err(_) => Err(DbError::AttemptTimeout {
                seconds: deadline.as_secs(),
            }),
        }
    }

    async fn control(&mut self, sql: &str) -> Result<(), DbError> {
        self.conn.execute(sql).await.map(|_| ())
    }
}

/// Runs composite operations inside or outside a transaction.
#[derive(Clone)]
pub struct Transactor {
    pool: Arc<dyn ConnectionPool>,
    statement_timeout: Duration,
}

impl Transactor {
    pub fn new(pool: Arc<dyn ConnectionPool>, statement_timeout: Duration) -> Self {
        Self {
            pool,
            statement_timeout,
        }
    }

    async fn session(&self) -> Result<Session, DbError> {
        let conn = self.pool.acquire().await?;
        Ok(Session {
            conn,
            statement_timeout: self.statement_timeout,
        })
    }

    /// Open a connection, run `op`, release. No transaction control; used
    /// for statements the warehouse refuses inside a transaction.
    pub async fn run<T, E, F>(&self, op: F) -> Result<T, E>
    where
        E: From<DbError>,
        F: AsyncFnOnce(&mut Session) -> Result<T, E>,
    {
        let mut session = self.session().await.map_err(E::from)?;
        op(&mut session).await
    }

    /// Open a connection, BEGIN, run `op`, COMMIT on success, ROLLBACK on
    /// any failure, release.
    pub async fn transact<T, E, F>(&self, op: F) -> Result<T, E>
    where
        E: From<DbError>,
        F: AsyncFnOnce(&mut Session) -> Result<T, E>,
    {
        let mut session = self.session().await.map_err(E::from)?;
        session.control("BEGIN").await.map_err(E::from)?;
        match op(&mut session).await {
            Ok(value) => {
                session.control("COMMIT").await.map_err(E::from)?;
                Ok(value)
            }
            Err(error) => {
                // Rollback failures are secondary; the connection is
                // dropped either way and the pool recycles it.
                if let Err(rollback) = session.control("ROLLBACK").await {
                    debug!("Rollback failed: {rollback}");
                }
                Err(error)
            }
        }
    }
}

// ============ Postgres-wire pool ============

/// Connection settings for the bundled postgres-wire pool (Redshift).
#[derive(Debug, Clone)]
pub struct PgPoolConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

/// Pool over `tokio-postgres`, fixed at [`POOL_SIZE`] connections with
/// autocommit behavior driven entirely by explicit BEGIN/COMMIT.
pub struct PgPool {
    pool: Pool,
}

impl PgPool {
    pub fn new(config: &PgPoolConfig) -> Result<Self, LoaderError> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&config.host)
            .port(config.port)
            .dbname(&config.database)
            .user(&config.username)
            .password(&config.password);

        let manager = Manager::from_config(
            pg,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(POOL_SIZE)
            .build()
            .map_err(|e| LoaderError::runtime(format!("failed to build pool: {e}")))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl ConnectionPool for PgPool {
    async fn acquire(&self) -> Result<Box<dyn Conn>, DbError> {
        let client = self.pool.get().await.map_err(|e| DbError::PoolAcquire {
            message: e.to_string(),
        })?;
        Ok(Box::new(PgConn { client }))
    }
}

struct PgConn {
    client: deadpool_postgres::Object,
}

#[async_trait]
impl Conn for PgConn {
    async fn execute(&mut self, sql: &str) -> Result<u64, DbError> {
        self.client.execute(sql, &[]).await.map_err(classify)
    }

    async fn query(&mut self, sql: &str) -> Result<Vec<SqlRow>, DbError> {
        let rows = self.client.query(sql, &[]).await.map_err(classify)?;
        rows.iter().map(convert_row).collect()
    }
}

/// Map a driver error onto the transient/fatal split. Connection loss and
/// resource exhaustion retry; everything else aborts.
fn classify(error: tokio_postgres::Error) -> DbError {
    if error.is_closed() {
        return DbError::transient(error.to_string());
    }
    let transient = error
        .code()
        .map(|state| {
            let code = state.code();
            code.starts_with("08")      // connection exceptions
                || code.starts_with("53") // insufficient resources
                || code == "40001"       // serialization failure
                || code == "40P01"       // deadlock detected
                || code == "57014" // query cancelled
        })
        .unwrap_or(true); // no SQLSTATE means the failure was below SQL
    DbError::Query {
        message: error.to_string(),
        transient,
    }
}

fn convert_row(row: &tokio_postgres::Row) -> Result<SqlRow, DbError> {
    let mut values = Vec::with_capacity(row.len());
    for (index, column) in row.columns().iter().enumerate() {
        let value = match *column.type_() {
            Type::BOOL => row
                .try_get::<_, Option<bool>>(index)
                .map(|v| v.map(SqlValue::Bool)),
            Type::INT2 => row
                .try_get::<_, Option<i16>>(index)
                .map(|v| v.map(|n| SqlValue::Int(n as i64))),
            Type::INT4 => row
                .try_get::<_, Option<i32>>(index)
                .map(|v| v.map(|n| SqlValue::Int(n as i64))),
            Type::INT8 => row
                .try_get::<_, Option<i64>>(index)
                .map(|v| v.map(SqlValue::Int)),
            Type::TIMESTAMP => row
                .try_get::<_, Option<chrono::NaiveDateTime>>(index)
                .map(|v| v.map(|ts| SqlValue::Timestamp(ts.and_utc()))),
            Type::TIMESTAMPTZ => row
                .try_get::<_, Option<DateTime<Utc>>>(index)
                .map(|v| v.map(SqlValue::Timestamp)),
            _ => row
                .try_get::<_, Option<String>>(index)
                .map(|v| v.map(SqlValue::Text)),
        };
        let value = value.map_err(|e| DbError::ResultShape {
            statement: "row decode".to_string(),
            reason: e.to_string(),
        })?;
        values.push(value.unwrap_or(SqlValue::Null));
    }
    Ok(SqlRow(values))
}
