//! The dialect-neutral statement vocabulary.
//!
//! Every operation the loader performs against a warehouse is one of these
//! tags. Only a `Target` turns a tag into SQL text; the rest of the core
//! manipulates statements as data, which is what keeps the state machine
//! dialect-agnostic.

use crate::discovery::{Compression, ShreddingComplete};
use crate::storage::{StorageFolder, StorageKey};

/// A single warehouse operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Begin,
    Commit,
    Abort,
    /// Cheapest possible liveness probe.
    Select1,
    /// Probe used before loading; may resume a suspended warehouse.
    ReadyCheck,

    CreateAlertingTempTable,
    DropAlertingTempTable,
    /// Folders present in storage but absent from the manifest.
    FoldersMinusManifest,
    /// Copy the staged folder list into the alerting temp table.
    FoldersCopy { source: StorageKey },

    /// Copy atomic events. `columns` is non-empty only for wide-row
    /// warehouses where the column list parameterizes the COPY.
    EventsCopy {
        path: StorageFolder,
        compression: Compression,
        columns: Vec<String>,
    },
    /// Copy one shredded type into its own table.
    ShreddedCopy {
        table: String,
        path: StorageFolder,
        compression: Compression,
        jsonpaths: Option<StorageKey>,
    },

    /// Transit-table mode: sibling events table for COPY-then-append.
    CreateTransient,
    DropTransient,
    AppendTransient,

    TableExists { name: String },
    /// Read the schema-version marker committed on a table.
    GetVersion { name: String },
    RenameTable { from: String, to: String },
    SetSchema,
    GetColumns { name: String },

    ManifestAdd { message: ShreddingComplete },
    ManifestGet { base: StorageFolder },

    AddLoadTstampColumn,
    CreateTable { ddl: String },
    CommentOn { table: String, comment: String },
    DdlFile { ddl: String },
    AlterTable { ddl: String },
}

impl Statement {
    /// Short tag for logs and error messages.
    pub fn title(&self) -> &'static str {
        match self {
            Statement::Begin => "BEGIN",
            Statement::Commit => "COMMIT",
            Statement::Abort => "ABORT",
            Statement::Select1 => "SELECT 1",
            Statement::ReadyCheck => "ready check",
            Statement::CreateAlertingTempTable => "create alerting temp table",
            Statement::DropAlertingTempTable => "drop alerting temp table",
            Statement::FoldersMinusManifest => "folders minus manifest",
            Statement::FoldersCopy { .. } => "copy to folder monitoring",
            Statement::EventsCopy { .. } => "copy to events table",
            Statement::ShreddedCopy { .. } => "copy to shredded table",
            Statement::CreateTransient => "create transit table",
            Statement::DropTransient => "drop transit table",
            Statement::AppendTransient => "append transit table",
            Statement::TableExists { .. } => "table exists",
            Statement::GetVersion { .. } => "get table version",
            Statement::RenameTable { .. } => "rename table",
            Statement::SetSchema => "set schema",
            Statement::GetColumns { .. } => "get columns",
            Statement::ManifestAdd { .. } => "manifest add",
            Statement::ManifestGet { .. } => "manifest get",
            Statement::AddLoadTstampColumn => "add load_tstamp column",
            Statement::CreateTable { .. } => "create table",
            Statement::CommentOn { .. } => "comment on table",
            Statement::DdlFile { .. } => "ddl file",
            Statement::AlterTable { .. } => "alter table",
        }
    }

    /// Table a copy statement lands in, for `Stage::Loading` reporting.
    pub fn target_table(&self) -> Option<&str> {
        match self {
            Statement::EventsCopy { .. } => Some("events"),
            Statement::CreateTransient
            | Statement::AppendTransient
            | Statement::DropTransient => Some("events_transit"),
            Statement::ShreddedCopy { table, .. } => Some(table),
            _ => None,
        }
    }
}

/// Escape a string for embedding as a SQL literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render an optional timestamp as a SQL literal or NULL.
pub fn timestamp_literal(value: Option<chrono::DateTime<chrono::Utc>>) -> String {
    match value {
        Some(ts) => quote_literal(&ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
        None => "NULL".to_string(),
    }
}
