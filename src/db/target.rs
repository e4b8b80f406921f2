//! The warehouse target abstraction.
//!
//! A `Target` is a pure value: it inspects configuration and produces
//! statements or SQL text, never performing I/O itself. `to_fragment` is
//! the only place dialect SQL is spelled out; everything above it works on
//! the `Statement` vocabulary.

use crate::db::statement::Statement;
use crate::discovery::{DataDiscovery, ShreddedTypeInfo};
use crate::error::{DbError, MigrationError};
use crate::iglu::{SchemaKey, SchemaList};
use crate::migration::Block;

/// Name of the ephemeral folder-monitoring table, shared by all dialects.
pub const FOLDER_MONITORING_TABLE: &str = "rdb_folder_monitoring";

/// Dialect-specific interpreter for the statement vocabulary.
pub trait Target: Send + Sync {
    /// Dialect tag for logs and payloads ("redshift", "snowflake",
    /// "databricks").
    fn kind(&self) -> &'static str;

    /// Schema (namespace) the atomic tables live in.
    fn db_schema(&self) -> &str;

    /// Whether `EventsCopy` must be parameterized with the current event
    /// column list (wide-row warehouses).
    fn requires_event_columns(&self) -> bool {
        false
    }

    /// Whether the warehouse keeps one versioned table per shredded type.
    /// When false the planner skips the catalog dance and no version
    /// markers are emitted.
    fn supports_versioned_tables(&self) -> bool;

    /// Delta from `current` (with `existing_columns` in the catalog) to the
    /// latest entry of `schemas`.
    fn update_table(
        &self,
        current: &SchemaKey,
        existing_columns: &[String],
        schemas: &SchemaList,
    ) -> Result<Block, MigrationError>;

    /// Widen the events table with a column for one shredded type.
    /// `None` for warehouses that keep per-type tables or none at all.
    fn extend_table(&self, info: &ShreddedTypeInfo) -> Option<Block>;

    /// The non-empty statement sequence that copies one batch in.
    fn load_statements(&self, discovery: &DataDiscovery, event_columns: &[String])
    -> Vec<Statement>;

    /// Creation block for a type whose table does not exist yet.
    fn create_table(&self, schemas: &SchemaList) -> Block;

    /// DDL creating the manifest table when absent.
    fn manifest_statement(&self) -> Statement;

    /// Render a statement as dialect SQL. Statements outside the
    /// warehouse's capability return `DbError::Unsupported`.
    fn to_fragment(&self, statement: &Statement) -> Result<String, DbError>;
}
