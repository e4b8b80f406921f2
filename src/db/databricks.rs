//! Databricks target.
//!
//! Wide-row only and entirely without migrations: the Delta table absorbs
//! new columns through the COPY's own schema merging, so `update_table`
//! records intent and nothing else. Catalog introspection is off the
//! table too: `ShreddedCopy`, `TableExists`, `GetVersion` and
//! `GetColumns` are all unsupported, which is why the events column list
//! for the COPY is derived from the discovery instead of read back.

use crate::config::DatabricksConfig;
use crate::db::manifest::{self, MANIFEST_TABLE};
use crate::db::statement::{Statement, quote_literal};
use crate::db::target::{FOLDER_MONITORING_TABLE, Target};
use crate::discovery::{DataDiscovery, ShreddedTypeInfo};
use crate::error::{DbError, MigrationError};
use crate::iglu::{SchemaKey, SchemaList};
use crate::migration::Block;

pub struct Databricks {
    config: DatabricksConfig,
}

impl Databricks {
    pub fn new(config: DatabricksConfig) -> Self {
        Self { config }
    }

    fn schema(&self) -> &str {
        &self.config.schema
    }
}

impl Target for Databricks {
    fn kind(&self) -> &'static str {
        "databricks"
    }

    fn db_schema(&self) -> &str {
        self.schema()
    }

    fn requires_event_columns(&self) -> bool {
        true
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
        // Intent only: no pre items, no in items.
        Ok(Block::empty(
            self.schema(),
            "events",
            schemas.latest().key.clone(),
        ))
    }

    fn extend_table(&self, _info: &ShreddedTypeInfo) -> Option<Block> {
        None
    }

    fn load_statements(
        &self,
        discovery: &DataDiscovery,
        event_columns: &[String],
    ) -> Vec<Statement> {
        vec![Statement::EventsCopy {
            path: discovery.events_folder(),
            compression: discovery.compression,
            columns: event_columns.to_vec(),
        }]
    }

    fn create_table(&self, schemas: &SchemaList) -> Block {
        // Per-type tables never exist here. Kept total for the trait.
        Block::empty(self.schema(), "events", schemas.latest().key.clone())
    }

    fn manifest_statement(&self) -> Statement {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {schema}.{MANIFEST_TABLE} (\n\
                base                 STRING NOT NULL,\n\
                types                STRING NOT NULL,\n\
                shredding_started    TIMESTAMP NOT NULL,\n\
                shredding_completed  TIMESTAMP NOT NULL,\n\
                min_collector_tstamp TIMESTAMP,\n\
                max_collector_tstamp TIMESTAMP,\n\
                ingestion_tstamp     TIMESTAMP NOT NULL,\n\
                compression          STRING NOT NULL,\n\
                processor_artifact   STRING NOT NULL,\n\
                processor_version    STRING NOT NULL,\n\
                count_good           BIGINT\n\
            ) USING DELTA",
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
            Statement::Select1 | Statement::ReadyCheck => "SELECT 1".to_string(),

            Statement::CreateAlertingTempTable => format!(
                "CREATE TABLE IF NOT EXISTS {schema}.{FOLDER_MONITORING_TABLE} (run_id STRING)"
            ),
            Statement::DropAlertingTempTable => {
                format!("DROP TABLE IF EXISTS {schema}.{FOLDER_MONITORING_TABLE}")
            }
            Statement::FoldersMinusManifest => format!(
                "SELECT run_id FROM {schema}.{FOLDER_MONITORING_TABLE} EXCEPT SELECT base FROM {schema}.{MANIFEST_TABLE}"
            ),
            Statement::FoldersCopy { source } => format!(
                "COPY INTO {schema}.{FOLDER_MONITORING_TABLE} FROM {} FILEFORMAT = CSV",
                quote_literal(source.as_str())
            ),

            Statement::EventsCopy { path, columns, .. } => {
                let column_list = if columns.is_empty() {
                    "*".to_string()
                } else {
                    columns
                        .iter()
                        .map(|c| format!("`{c}`"))
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                format!(
                    "COPY INTO {schema}.events FROM (SELECT {column_list} FROM {}) FILEFORMAT = PARQUET COPY_OPTIONS ('mergeSchema' = 'true')",
                    quote_literal(path.as_str())
                )
            }

            Statement::SetSchema => format!("USE SCHEMA {schema}"),
            Statement::RenameTable { from, to } => {
                format!("ALTER TABLE {schema}.`{from}` RENAME TO {schema}.`{to}`")
            }

            Statement::ManifestAdd { message } => {
                manifest::render_add(schema, message, "current_timestamp()")
            }
            Statement::ManifestGet { base } => manifest::render_get(schema, base),

            Statement::AddLoadTstampColumn => format!(
                "ALTER TABLE {schema}.events ADD COLUMN IF NOT EXISTS load_tstamp TIMESTAMP"
            ),
            Statement::CreateTable { ddl }
            | Statement::DdlFile { ddl }
            | Statement::AlterTable { ddl } => ddl.clone(),
            Statement::CommentOn { table, comment } => {
                format!("COMMENT ON TABLE {table} IS {}", quote_literal(comment))
            }

            Statement::ShreddedCopy { .. }
            | Statement::TableExists { .. }
            | Statement::GetVersion { .. }
            | Statement::GetColumns { .. }
            | Statement::CreateTransient
            | Statement::DropTransient
            | Statement::AppendTransient => return Err(DbError::unsupported(statement)),
        };
        Ok(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{ShreddingComplete, SnowplowEntity, TypeFormat};
    use crate::iglu::{IgluConfig, Resolver};

    fn databricks() -> Databricks {
        Databricks::new(DatabricksConfig {
            catalog: "hive_metastore".into(),
            schema: "atomic".into(),
            connection: None,
        })
    }

    fn discovery() -> DataDiscovery {
        let message: ShreddingComplete = serde_json::from_value(serde_json::json!({
            "base": "s3://bucket/run=1/",
            "types": [{
                "vendor": "com.acme",
                "name": "context",
                "model": 1,
                "format": "WIDEROW",
                "snowplowEntity": "Context"
            }],
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
    fn test_unsupported_statements() {
        let target = databricks();
        for statement in [
            Statement::TableExists {
                name: "events".into(),
            },
            Statement::GetVersion {
                name: "events".into(),
            },
            Statement::GetColumns {
                name: "events".into(),
            },
        ] {
            assert!(matches!(
                target.to_fragment(&statement).unwrap_err(),
                DbError::Unsupported { .. }
            ));
        }
    }

    #[test]
    fn test_events_copy_is_column_parameterized() {
        let target = databricks();
        assert!(target.requires_event_columns());

        let columns = vec![
            "event_id".to_string(),
            "collector_tstamp".to_string(),
            "contexts_com_acme_context_1".to_string(),
        ];
        let statements = target.load_statements(&discovery(), &columns);
        assert_eq!(statements.len(), 1);

        let sql = target.to_fragment(&statements[0]).unwrap();
        assert!(sql.contains("`event_id`, `collector_tstamp`, `contexts_com_acme_context_1`"));
        assert!(sql.contains("FILEFORMAT = PARQUET"));
    }

    #[test]
    fn test_update_table_records_intent_only() {
        use crate::iglu::{SchemaList, SchemaVer, TableSchema};
        let schemas = SchemaList::new(vec![TableSchema {
            key: SchemaKey::new("com.acme", "context", SchemaVer::new(1, 0, 0)),
            columns: vec![],
        }])
        .unwrap();
        let current = SchemaKey::new("com.acme", "context", SchemaVer::new(1, 0, 0));
        let block = databricks().update_table(&current, &[], &schemas).unwrap();
        assert!(block.pre.is_empty());
        assert!(block.in_tx.is_empty());
    }

    #[test]
    fn test_wide_column_derivation_matches_discovery() {
        let info = ShreddedTypeInfo {
            vendor: "com.acme".into(),
            name: "context".into(),
            model: 1,
            format: TypeFormat::Widerow,
            snowplow_entity: SnowplowEntity::Context,
        };
        assert_eq!(info.wide_column(), "contexts_com_acme_context_1");
        assert!(databricks().extend_table(&info).is_none());
    }
}
