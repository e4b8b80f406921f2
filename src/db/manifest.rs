//! The load manifest.
//!
//! One row per loaded base folder; presence of a row is the idempotence
//! boundary. The queue ack is only a hint; this table is authoritative.
//! `add` must run inside the main load transaction so the row co-commits
//! with the copied data.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::db::statement::{Statement, quote_literal, timestamp_literal};
use crate::db::target::Target;
use crate::db::transactor::{Session, SqlRow, Transactor};
use crate::discovery::{Compression, ShreddedTypeInfo, ShreddingComplete};
use crate::error::{DbError, LoaderError};
use crate::storage::StorageFolder;

/// Bare name of the manifest table inside the target's schema.
pub const MANIFEST_TABLE: &str = "manifest";

/// Column order shared by the INSERT renderer and the row parser.
const COLUMNS: &str = "base, types, shredding_started, shredding_completed, \
     min_collector_tstamp, max_collector_tstamp, ingestion_tstamp, \
     compression, processor_artifact, processor_version, count_good";

/// One manifest row.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub base: StorageFolder,
    pub types: Vec<ShreddedTypeInfo>,
    pub shredding_started: DateTime<Utc>,
    pub shredding_completed: DateTime<Utc>,
    pub min_collector: Option<DateTime<Utc>>,
    pub max_collector: Option<DateTime<Utc>>,
    pub ingestion: DateTime<Utc>,
    pub compression: Compression,
    pub processor_artifact: String,
    pub processor_version: String,
    pub count_good: Option<i64>,
}

impl ManifestEntry {
    /// Decode a row returned by `ManifestGet`, in [`COLUMNS`] order.
    pub fn from_row(row: &SqlRow) -> Result<Self, DbError> {
        let shape = |reason: &str| DbError::ResultShape {
            statement: "manifest get".to_string(),
            reason: reason.to_string(),
        };

        let base = row.text_at(0).ok_or_else(|| shape("missing base"))?;
        let types_json = row.text_at(1).ok_or_else(|| shape("missing types"))?;
        let types: Vec<ShreddedTypeInfo> = serde_json::from_str(&types_json)
            .map_err(|e| shape(&format!("bad types json: {e}")))?;
        let compression = match row.text_at(7).as_deref() {
            Some("GZIP") => Compression::Gzip,
            Some("NONE") => Compression::None,
            other => return Err(shape(&format!("bad compression: {other:?}"))),
        };

        Ok(ManifestEntry {
            base: StorageFolder::coerce(base),
            types,
            shredding_started: row
                .timestamp_at(2)
                .ok_or_else(|| shape("missing shredding_started"))?,
            shredding_completed: row
                .timestamp_at(3)
                .ok_or_else(|| shape("missing shredding_completed"))?,
            min_collector: row.timestamp_at(4),
            max_collector: row.timestamp_at(5),
            ingestion: row
                .timestamp_at(6)
                .ok_or_else(|| shape("missing ingestion_tstamp"))?,
            compression,
            processor_artifact: row
                .text_at(8)
                .ok_or_else(|| shape("missing processor_artifact"))?,
            processor_version: row
                .text_at(9)
                .ok_or_else(|| shape("missing processor_version"))?,
            count_good: row.int_at(10),
        })
    }
}

/// Render the manifest INSERT for a message. `now_fn` is the warehouse's
/// clock function; ingestion time always comes from the warehouse, never
/// from this process.
pub fn render_add(db_schema: &str, message: &ShreddingComplete, now_fn: &str) -> String {
    let types = serde_json::to_string(&message.types).unwrap_or_else(|_| "[]".to_string());
    let count = message
        .count
        .map(|n| n.to_string())
        .unwrap_or_else(|| "NULL".to_string());
    format!(
        "INSERT INTO {db_schema}.{MANIFEST_TABLE} ({COLUMNS}) VALUES ({base}, {types}, {started}, {completed}, {min_collector}, {max_collector}, {now_fn}, {compression}, {artifact}, {version}, {count})",
        base = quote_literal(message.base.as_str()),
        types = quote_literal(&types),
        started = timestamp_literal(Some(message.timestamps.job_started)),
        completed = timestamp_literal(Some(message.timestamps.job_completed)),
        min_collector = timestamp_literal(message.timestamps.min_collector),
        max_collector = timestamp_literal(message.timestamps.max_collector),
        compression = quote_literal(message.compression.as_str()),
        artifact = quote_literal(&message.processor.artifact),
        version = quote_literal(&message.processor.version),
    )
}

/// Render the primary-key lookup.
pub fn render_get(db_schema: &str, base: &StorageFolder) -> String {
    format!(
        "SELECT {COLUMNS} FROM {db_schema}.{MANIFEST_TABLE} WHERE base = {}",
        quote_literal(base.as_str())
    )
}

/// Manifest operations against one target.
pub struct Manifest {
    target: Arc<dyn Target>,
}

impl Manifest {
    pub fn new(target: Arc<dyn Target>) -> Self {
        Self { target }
    }

    /// Create the manifest table if absent. Idempotent; runs outside any
    /// transaction.
    pub async fn initialize(&self, transactor: &Transactor) -> Result<(), LoaderError> {
        let target = self.target.clone();
        transactor
            .run(async |session: &mut Session| {
                session
                    .execute(target.as_ref(), &target.manifest_statement())
                    .await
            })
            .await
            .map_err(LoaderError::from)?;
        Ok(())
    }

    /// Look up a base folder. `None` means the batch has never been loaded.
    pub async fn get(
        &self,
        session: &mut Session,
        base: &StorageFolder,
    ) -> Result<Option<ManifestEntry>, DbError> {
        let statement = Statement::ManifestGet { base: base.clone() };
        let rows = session.query(self.target.as_ref(), &statement).await?;
        rows.first().map(ManifestEntry::from_row).transpose()
    }

    /// Record a load. Must execute inside the main load transaction.
    pub async fn add(
        &self,
        session: &mut Session,
        message: &ShreddingComplete,
    ) -> Result<(), DbError> {
        let statement = Statement::ManifestAdd {
            message: message.clone(),
        };
        session.execute(self.target.as_ref(), &statement).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::transactor::SqlValue;
    use crate::discovery::{Processor, SnowplowEntity, Timestamps, TypeFormat};

    fn message() -> ShreddingComplete {
        ShreddingComplete {
            base: StorageFolder::parse("s3://bucket/run=1").unwrap(),
            types: vec![ShreddedTypeInfo {
                vendor: "com.acme".into(),
                name: "context".into(),
                model: 1,
                format: TypeFormat::Tsv,
                snowplow_entity: SnowplowEntity::Context,
            }],
            timestamps: Timestamps {
                job_started: "2022-01-01T00:05:00Z".parse().unwrap(),
                job_completed: "2022-01-01T00:15:00Z".parse().unwrap(),
                min_collector: None,
                max_collector: Some("2022-01-01T00:00:00Z".parse().unwrap()),
            },
            compression: Compression::Gzip,
            processor: Processor {
                artifact: "shredder".into(),
                version: "4.2.1".into(),
            },
            count: Some(42),
        }
    }

    #[test]
    fn test_render_add_uses_warehouse_clock() {
        let sql = render_add("atomic", &message(), "GETDATE()");
        assert!(sql.starts_with("INSERT INTO atomic.manifest (base, types,"));
        assert!(sql.contains("'s3://bucket/run=1/'"));
        assert!(sql.contains("GETDATE()"));
        assert!(sql.contains("'GZIP'"));
        assert!(sql.contains("NULL")); // absent min_collector
        assert!(sql.ends_with("42)"));
    }

    #[test]
    fn test_render_get_by_primary_key() {
        let base = StorageFolder::parse("s3://bucket/run=1").unwrap();
        let sql = render_get("atomic", &base);
        assert_eq!(
            sql,
            format!("SELECT {COLUMNS} FROM atomic.manifest WHERE base = 's3://bucket/run=1/'")
        );
    }

    #[test]
    fn test_entry_round_trip_through_row() {
        let message = message();
        let types_json = serde_json::to_string(&message.types).unwrap();
        let row = SqlRow(vec![
            SqlValue::Text(message.base.as_str().to_string()),
            SqlValue::Text(types_json),
            SqlValue::Timestamp(message.timestamps.job_started),
            SqlValue::Timestamp(message.timestamps.job_completed),
            SqlValue::Null,
            SqlValue::Timestamp(message.timestamps.max_collector.unwrap()),
            SqlValue::Timestamp("2022-01-01T00:20:00Z".parse().unwrap()),
            SqlValue::Text("GZIP".into()),
            SqlValue::Text("shredder".into()),
            SqlValue::Text("4.2.1".into()),
            SqlValue::Int(42),
        ]);

        let entry = ManifestEntry::from_row(&row).unwrap();
        assert_eq!(entry.base, message.base);
        assert_eq!(entry.types, message.types);
        assert_eq!(entry.min_collector, None);
        assert_eq!(entry.count_good, Some(42));
    }

    #[test]
    fn test_entry_rejects_malformed_rows() {
        let row = SqlRow(vec![SqlValue::Text("s3://bucket/run=1/".into())]);
        assert!(ManifestEntry::from_row(&row).is_err());
    }
}
