//! Snowflake target.
//!
//! Everything lands in one wide events table: new shredded types become
//! new VARIANT columns through `extend_table`, so there is no per-type
//! table, no versioning and no version marker. `GetVersion` and
//! `CommentOn` are therefore unsupported, as is `ShreddedCopy`.

use crate::config::SnowflakeConfig;
use crate::db::manifest::{self, MANIFEST_TABLE};
use crate::db::statement::{Statement, quote_literal};
use crate::db::target::{FOLDER_MONITORING_TABLE, Target};
use crate::discovery::{Compression, DataDiscovery, ShreddedTypeInfo};
use crate::error::{DbError, MigrationError};
use crate::iglu::{SchemaKey, SchemaList, SchemaVer};
use crate::migration::{Block, BlockItem};

pub struct Snowflake {
    config: SnowflakeConfig,
}

impl Snowflake {
    pub fn new(config: SnowflakeConfig) -> Self {
        Self { config }
    }

    fn schema(&self) -> &str {
        &self.config.schema
    }

    fn compression_fragment(compression: Compression) -> &'static str {
        match compression {
            Compression::Gzip => "GZIP",
            Compression::None => "NONE",
        }
    }
}

impl Target for Snowflake {
    fn kind(&self) -> &'static str {
        "snowflake"
    }

    fn db_schema(&self) -> &str {
        self.schema()
    }

    fn supports_versioned_tables(&self) -> bool {
        false
    }

    fn update_table(
        &self,
        _current: &SchemaKey,
        _existing_columns: &[String],
        schemas: &SchemaList,
    ) -> Result<Block, MigrationError> {
        // Never reached through the planner: every type goes through
        // extend_table first. Kept total for the trait.
        let latest = &schemas.latest().key;
        Ok(Block::empty(
            self.schema(),
            "events",
            latest.clone(),
        ))
    }

    fn extend_table(&self, info: &ShreddedTypeInfo) -> Option<Block> {
        // The column name depends on whether the type arrived as a
        // self-describing event or a context, which only the discovery's
        // type entry knows.
        let column = info.wide_column();
        let mut block = Block::empty(
            self.schema(),
            "events",
            SchemaKey::new(
                info.vendor.clone(),
                info.name.clone(),
                SchemaVer::new(info.model, 0, 0),
            ),
        );
        block.in_tx.push(BlockItem::AddColumn {
            column: column.clone(),
            ddl: format!(
                "ALTER TABLE {}.events ADD COLUMN IF NOT EXISTS \"{column}\" VARIANT",
                self.schema()
            ),
        });
        Some(block)
    }

    fn load_statements(
        &self,
        discovery: &DataDiscovery,
        _event_columns: &[String],
    ) -> Vec<Statement> {
        vec![Statement::EventsCopy {
            path: discovery.events_folder(),
            compression: discovery.compression,
            columns: Vec::new(),
        }]
    }

    fn create_table(&self, schemas: &SchemaList) -> Block {
        // Shredded types never get their own table here; the events table
        // is provisioned out of band. Kept total for the trait.
        Block::empty(self.schema(), "events", schemas.latest().key.clone())
    }

    fn manifest_statement(&self) -> Statement {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {schema}.{MANIFEST_TABLE} (\n\
                base                 VARCHAR(512) NOT NULL PRIMARY KEY,\n\
                types                VARCHAR     NOT NULL,\n\
                shredding_started    TIMESTAMP_NTZ NOT NULL,\n\
                shredding_completed  TIMESTAMP_NTZ NOT NULL,\n\
                min_collector_tstamp TIMESTAMP_NTZ,\n\
                max_collector_tstamp TIMESTAMP_NTZ,\n\
                ingestion_tstamp     TIMESTAMP_NTZ NOT NULL,\n\
                compression          VARCHAR(16)  NOT NULL,\n\
                processor_artifact   VARCHAR(64)  NOT NULL,\n\
                processor_version    VARCHAR(32)  NOT NULL,\n\
                count_good           BIGINT\n\
            )",
            schema = self.schema()
        );
        Statement::DdlFile { ddl }
    }

    fn to_fragment(&self, statement: &Statement) -> Result<String, DbError> {
        let schema = self.schema();
        let sql = match statement {
            Statement::Begin => "BEGIN".to_string(),
            Statement::Commit => "COMMIT".to_string(),
            Statement::Abort => "ROLLBACK".to_string(),
            Statement::Select1 => "SELECT 1".to_string(),
            Statement::ReadyCheck => format!(
                "ALTER WAREHOUSE {} RESUME IF SUSPENDED",
                self.config.warehouse
            ),

            Statement::CreateAlertingTempTable => format!(
                "CREATE TEMPORARY TABLE IF NOT EXISTS {FOLDER_MONITORING_TABLE} (run_id VARCHAR(512))"
            ),
            Statement::DropAlertingTempTable => {
                format!("DROP TABLE IF EXISTS {FOLDER_MONITORING_TABLE}")
            }
            Statement::FoldersMinusManifest => format!(
                "SELECT run_id FROM {FOLDER_MONITORING_TABLE} MINUS SELECT base FROM {schema}.{MANIFEST_TABLE}"
            ),
            Statement::FoldersCopy { source } => format!(
                "COPY INTO {FOLDER_MONITORING_TABLE} FROM {} STORAGE_INTEGRATION = {} FILE_FORMAT = (TYPE = CSV)",
                quote_literal(source.as_str()),
                self.config.storage_integration,
            ),

            Statement::EventsCopy {
                path, compression, ..
            } => format!(
                "COPY INTO {schema}.events FROM {} STORAGE_INTEGRATION = {} MATCH_BY_COLUMN_NAME = CASE_INSENSITIVE FILE_FORMAT = (TYPE = JSON COMPRESSION = {}) ON_ERROR = ABORT_STATEMENT",
                quote_literal(path.as_str()),
                self.config.storage_integration,
                Self::compression_fragment(*compression),
            ),

            Statement::TableExists { name } => format!(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = {} AND table_name = {})",
                quote_literal(&schema.to_uppercase()),
                quote_literal(&name.to_uppercase())
            ),
            Statement::SetSchema => format!("USE SCHEMA {schema}"),
            Statement::GetColumns { name } => format!(
                "SELECT column_name FROM information_schema.columns WHERE table_schema = {} AND table_name = {} ORDER BY ordinal_position",
                quote_literal(&schema.to_uppercase()),
                quote_literal(&name.to_uppercase())
            ),
            Statement::RenameTable { from, to } => {
                format!("ALTER TABLE {schema}.\"{from}\" RENAME TO {schema}.\"{to}\"")
            }

            Statement::ManifestAdd { message } => {
                manifest::render_add(schema, message, "CURRENT_TIMESTAMP()")
            }
            Statement::ManifestGet { base } => manifest::render_get(schema, base),

            Statement::AddLoadTstampColumn => format!(
                "ALTER TABLE {schema}.events ADD COLUMN IF NOT EXISTS load_tstamp TIMESTAMP_NTZ"
            ),
            Statement::CreateTable { ddl }
            | Statement::DdlFile { ddl }
            | Statement::AlterTable { ddl } => ddl.clone(),

            Statement::ShreddedCopy { .. }
            | Statement::GetVersion { .. }
            | Statement::CommentOn { .. }
            | Statement::CreateTransient
            | Statement::DropTransient
            | Statement::AppendTransient => return Err(DbError::unsupported(statement)),
        };
        Ok(sql)
    }
}
