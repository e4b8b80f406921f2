//! Redshift target.
//!
//! The only warehouse with full migration support: one versioned table per
//! shredded type, version markers in table comments, and `ALTER COLUMN
//! TYPE` widenings that Redshift refuses inside a transaction (hence the
//! pre-transaction phase). Optionally loads events through a transit table
//! appended with `ALTER TABLE APPEND`.

use std::collections::HashSet;

use crate::config::RedshiftConfig;
use crate::db::manifest::{self, MANIFEST_TABLE};
use crate::db::statement::{Statement, quote_literal};
use crate::db::target::{FOLDER_MONITORING_TABLE, Target};
use crate::discovery::{Compression, DataDiscovery, ShreddedType, ShreddedTypeInfo, TypeFormat};
use crate::storage::StorageFolder;
use crate::error::{DbError, MigrationError};
use crate::iglu::{ColumnDef, SchemaKey, SchemaList, table_name};
use crate::migration::{Block, BlockItem};
use crate::storage::StorageKey;

/// Fixed reference columns every shredded-type table starts with.
const SHRED_REF_COLUMNS: &str = "\
    \"schema_vendor\"  VARCHAR(128)  ENCODE ZSTD NOT NULL,\n\
    \"schema_name\"    VARCHAR(128)  ENCODE ZSTD NOT NULL,\n\
    \"schema_format\"  VARCHAR(128)  ENCODE ZSTD NOT NULL,\n\
    \"schema_version\" VARCHAR(128)  ENCODE ZSTD NOT NULL,\n\
    \"root_id\"        CHAR(36)      ENCODE RAW  NOT NULL,\n\
    \"root_tstamp\"    TIMESTAMP     ENCODE ZSTD NOT NULL,\n\
    \"ref_root\"       VARCHAR(255)  ENCODE ZSTD NOT NULL,\n\
    \"ref_tree\"       VARCHAR(1500) ENCODE ZSTD NOT NULL,\n\
    \"ref_parent\"     VARCHAR(255)  ENCODE ZSTD NOT NULL";

pub struct Redshift {
    config: RedshiftConfig,
    region: String,
    jsonpaths: Option<StorageFolder>,
}

impl Redshift {
    pub fn new(config: RedshiftConfig, region: String, jsonpaths: Option<StorageFolder>) -> Self {
        Self {
            config,
            region,
            jsonpaths,
        }
    }

    fn schema(&self) -> &str {
        &self.config.schema
    }

    /// COPY options shared by events and shredded copies.
    fn copy_auth(&self) -> String {
        format!(
            "IAM_ROLE {} REGION {}",
            quote_literal(&self.config.iam_role),
            quote_literal(&self.region)
        )
    }

    fn compression_fragment(compression: Compression) -> &'static str {
        match compression {
            Compression::Gzip => " GZIP",
            Compression::None => "",
        }
    }

    fn render_column(column: &ColumnDef) -> String {
        let encoding = column
            .encoding
            .map(|enc| format!(" ENCODE {}", enc.as_str()))
            .unwrap_or_default();
        let nullability = if column.nullable { "" } else { " NOT NULL" };
        format!(
            "\"{}\" {}{encoding}{nullability}",
            column.name, column.sql_type
        )
    }

    fn jsonpaths_key(&self, info: &ShreddedTypeInfo) -> Option<StorageKey> {
        self.jsonpaths.as_ref().map(|folder| {
            folder
                .append(&info.vendor)
                .key(&format!("{}_{}.json", info.name, info.model))
        })
    }
}

impl Target for Redshift {
    fn kind(&self) -> &'static str {
        "redshift"
    }

    fn db_schema(&self) -> &str {
        self.schema()
    }

    fn supports_versioned_tables(&self) -> bool {
        true
    }

    fn update_table(
        &self,
        current: &SchemaKey,
        existing_columns: &[String],
        schemas: &SchemaList,
    ) -> Result<Block, MigrationError> {
        let latest = schemas.latest();
        let table = table_name(&latest.key.vendor, &latest.key.name, latest.key.version.model);
        let qualified = format!("{}.{table}", self.schema());

        if schemas.len() == 1 {
            return Err(MigrationError::SingleEntry { table });
        }
        let position = schemas
            .position(current)
            .ok_or_else(|| MigrationError::StaleCatalog {
                table: table.clone(),
                current: current.uri(),
            })?;
        let installed = &schemas.as_slice()[position];

        let existing: HashSet<&str> = existing_columns.iter().map(String::as_str).collect();
        let mut block = Block::empty(self.schema(), table.clone(), latest.key.clone());

        for column in &latest.columns {
            match installed.columns.iter().find(|c| c.name == column.name) {
                Some(old) if old.sql_type != column.sql_type => {
                    if !old.sql_type.widens_to(&column.sql_type) {
                        return Err(MigrationError::UnsupportedChange {
                            table,
                            column: column.name.clone(),
                            from: old.sql_type.sql(),
                            to: column.sql_type.sql(),
                        });
                    }
                    block.pre.push(BlockItem::AlterColumn {
                        column: column.name.clone(),
                        ddl: format!(
                            "ALTER TABLE {qualified} ALTER COLUMN \"{}\" TYPE {}",
                            column.name, column.sql_type
                        ),
                    });
                }
                Some(_) => {}
                None => {
                    // Skip columns something else already added by hand.
                    if existing.contains(column.name.as_str()) {
                        continue;
                    }
                    block.in_tx.push(BlockItem::AddColumn {
                        column: column.name.clone(),
                        ddl: format!(
                            "ALTER TABLE {qualified} ADD COLUMN {}",
                            Self::render_column(column)
                        ),
                    });
                }
            }
        }

        Ok(block)
    }

    fn extend_table(&self, _info: &ShreddedTypeInfo) -> Option<Block> {
        None
    }

    fn load_statements(
        &self,
        discovery: &DataDiscovery,
        _event_columns: &[String],
    ) -> Vec<Statement> {
        let mut statements = Vec::new();
        let events_copy = Statement::EventsCopy {
            path: discovery.events_folder(),
            compression: discovery.compression,
            columns: Vec::new(),
        };

        if self.config.transit_copy {
            statements.push(Statement::CreateTransient);
            statements.push(events_copy);
            statements.push(Statement::AppendTransient);
            statements.push(Statement::DropTransient);
        } else {
            statements.push(events_copy);
        }

        for shredded in &discovery.shredded_types {
            let info = shredded.info();
            match shredded {
                ShreddedType::Widerow { .. } => continue,
                ShreddedType::Tabular { .. } | ShreddedType::Json { .. } => {
                    let jsonpaths = (info.format == TypeFormat::Json)
                        .then(|| self.jsonpaths_key(info))
                        .flatten();
                    statements.push(Statement::ShreddedCopy {
                        table: info.table_name(),
                        path: info.folder(&discovery.base),
                        compression: discovery.compression,
                        jsonpaths,
                    });
                }
            }
        }

        statements
    }

    fn create_table(&self, schemas: &SchemaList) -> Block {
        let latest = schemas.latest();
        let table = table_name(&latest.key.vendor, &latest.key.name, latest.key.version.model);
        let qualified = format!("{}.{table}", self.schema());

        let mut columns = vec![SHRED_REF_COLUMNS.to_string()];
        columns.extend(latest.columns.iter().map(|c| format!("    {}", Self::render_column(c))));

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {qualified} (\n{},\n    FOREIGN KEY (root_id) REFERENCES {}.events(event_id)\n) DISTSTYLE KEY DISTKEY (root_id) SORTKEY (root_tstamp)",
            columns.join(",\n"),
            self.schema()
        );

        let mut block = Block::empty(self.schema(), table, latest.key.clone());
        block.in_tx.push(BlockItem::CreateTable { ddl });
        block
    }

    fn manifest_statement(&self) -> Statement {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {schema}.{MANIFEST_TABLE} (\n\
                \"base\"                 VARCHAR(512)   ENCODE ZSTD NOT NULL PRIMARY KEY,\n\
                \"types\"                VARCHAR(65535) ENCODE ZSTD NOT NULL,\n\
                \"shredding_started\"    TIMESTAMP      ENCODE ZSTD NOT NULL,\n\
                \"shredding_completed\"  TIMESTAMP      ENCODE ZSTD NOT NULL,\n\
                \"min_collector_tstamp\" TIMESTAMP      ENCODE ZSTD NULL,\n\
                \"max_collector_tstamp\" TIMESTAMP      ENCODE ZSTD NULL,\n\
                \"ingestion_tstamp\"     TIMESTAMP      ENCODE ZSTD NOT NULL,\n\
                \"compression\"          VARCHAR(16)    ENCODE ZSTD NOT NULL,\n\
                \"processor_artifact\"   VARCHAR(64)    ENCODE ZSTD NOT NULL,\n\
                \"processor_version\"    VARCHAR(32)    ENCODE ZSTD NOT NULL,\n\
                \"count_good\"           BIGINT         ENCODE ZSTD NULL\n\
            ) DISTSTYLE KEY DISTKEY (base) SORTKEY (ingestion_tstamp)",
            schema = self.schema()
        );
        Statement::DdlFile { ddl }
    }

    fn to_fragment(&self, statement: &Statement) -> Result<String, DbError> {
        let schema = self.schema();
        let sql = match statement {
            Statement::Begin => "BEGIN".to_string(),
            Statement::Commit => "COMMIT".to_string(),
            Statement::Abort => "ABORT".to_string(),
            Statement::Select1 | Statement::ReadyCheck => "SELECT 1".to_string(),

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
                "COPY {FOLDER_MONITORING_TABLE} FROM {} {} DELIMITER {} CSV",
                quote_literal(source.as_str()),
                self.copy_auth(),
                quote_literal("|"),
            ),

            Statement::EventsCopy {
                path, compression, ..
            } => {
                let table = if self.config.transit_copy {
                    format!("{schema}.events_transit")
                } else {
                    format!("{schema}.events")
                };
                format!(
                    "COPY {table} FROM {} {} MAXERROR {} TIMEFORMAT {} DELIMITER {} TRUNCATECOLUMNS ACCEPTINVCHARS EMPTYASNULL{}",
                    quote_literal(path.as_str()),
                    self.copy_auth(),
                    self.config.max_error,
                    quote_literal("auto"),
                    quote_literal("\t"),
                    Self::compression_fragment(*compression),
                )
            }
            Statement::ShreddedCopy {
                table,
                path,
                compression,
                jsonpaths,
            } => {
                let format = match jsonpaths {
                    Some(key) => format!("JSON AS {}", quote_literal(key.as_str())),
                    None => format!("DELIMITER {}", quote_literal("\t")),
                };
                format!(
                    "COPY {schema}.{table} FROM {} {} MAXERROR {} TIMEFORMAT {} {format} TRUNCATECOLUMNS ACCEPTINVCHARS EMPTYASNULL{}",
                    quote_literal(path.as_str()),
                    self.copy_auth(),
                    self.config.max_error,
                    quote_literal("auto"),
                    Self::compression_fragment(*compression),
                )
            }

            Statement::CreateTransient => {
                format!("CREATE TABLE {schema}.events_transit (LIKE {schema}.events)")
            }
            Statement::DropTransient => format!("DROP TABLE {schema}.events_transit"),
            Statement::AppendTransient => {
                format!("ALTER TABLE {schema}.events APPEND FROM {schema}.events_transit")
            }

            Statement::TableExists { name } => format!(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = {} AND table_name = {})",
                quote_literal(schema),
                quote_literal(name)
            ),
            Statement::GetVersion { name } => format!(
                "SELECT description FROM pg_catalog.pg_description WHERE objoid = '{schema}.\"{name}\"'::regclass"
            ),
            Statement::RenameTable { from, to } => {
                format!("ALTER TABLE {schema}.\"{from}\" RENAME TO \"{to}\"")
            }
            Statement::SetSchema => format!("SET search_path TO {schema}"),
            Statement::GetColumns { name } => format!(
                "SELECT column_name FROM information_schema.columns WHERE table_schema = {} AND table_name = {} ORDER BY ordinal_position",
                quote_literal(schema),
                quote_literal(name)
            ),

            Statement::ManifestAdd { message } => manifest::render_add(schema, message, "GETDATE()"),
            Statement::ManifestGet { base } => manifest::render_get(schema, base),

            Statement::AddLoadTstampColumn => {
                format!("ALTER TABLE {schema}.events ADD COLUMN load_tstamp TIMESTAMP NULL")
            }
            Statement::CreateTable { ddl }
            | Statement::DdlFile { ddl }
            | Statement::AlterTable { ddl } => ddl.clone(),
            Statement::CommentOn { table, comment } => {
                format!("COMMENT ON TABLE {table} IS {}", quote_literal(comment))
            }
        };
        Ok(sql)
    }
}
