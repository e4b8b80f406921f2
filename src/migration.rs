//! Schema-migration planning.
//!
//! The planner compares each shredded type's resolved schema chain with the
//! warehouse catalog and emits a `Migration`: two phased groups of actions.
//! `pre` holds column-type widenings the warehouse refuses inside a
//! transaction; `in_tx` holds additive operations that co-commit with the
//! load. Registry data arrives pre-resolved inside the discovery, so the
//! only I/O here is catalog reads through `Transactor::run`.

use tracing::{debug, warn};

use crate::db::statement::Statement;
use crate::db::target::Target;
use crate::db::transactor::{Session, Transactor};
use crate::discovery::{DataDiscovery, ShreddedType};
use crate::error::{DbError, LoaderError, MigrationError};
use crate::iglu::SchemaKey;

/// One table-level migration item. The kind tag is load-bearing: only
/// `AlterColumn` may appear in a block's `pre` group, only the additive
/// kinds in `in_tx`.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockItem {
    /// Type-widening alteration; runs outside the transaction.
    AlterColumn { column: String, ddl: String },
    /// Additive column; runs inside the transaction.
    AddColumn { column: String, ddl: String },
    /// Fresh table; runs inside the transaction.
    CreateTable { ddl: String },
}

/// One table's contribution to the migration.
#[derive(Debug, Clone)]
pub struct Block {
    pub db_schema: String,
    pub table: String,
    pub target: SchemaKey,
    pub pre: Vec<BlockItem>,
    pub in_tx: Vec<BlockItem>,
}

impl Block {
    pub fn empty(db_schema: impl Into<String>, table: impl Into<String>, target: SchemaKey) -> Self {
        Block {
            db_schema: db_schema.into(),
            table: table.into(),
            target,
            pre: Vec::new(),
            in_tx: Vec::new(),
        }
    }

    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.db_schema, self.table)
    }

    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.in_tx.is_empty()
    }

    /// A creation block has no `pre` items and a single `CreateTable`.
    pub fn is_creation(&self) -> bool {
        self.pre.is_empty()
            && self.in_tx.len() == 1
            && matches!(self.in_tx[0], BlockItem::CreateTable { .. })
    }

    /// The version marker committed as the table comment.
    fn comment(&self) -> Statement {
        Statement::CommentOn {
            table: self.qualified_table(),
            comment: self.target.uri(),
        }
    }
}

/// An opaque DB effect: the statement to run and what to log while at it.
#[derive(Debug, Clone)]
pub struct MigrationAction {
    pub statement: Statement,
    pub message: String,
}

impl MigrationAction {
    fn new(statement: Statement, message: impl Into<String>) -> Self {
        MigrationAction {
            statement,
            message: message.into(),
        }
    }
}

/// The composite migration for one batch.
#[derive(Debug, Clone, Default)]
pub struct Migration {
    pub pre: Vec<MigrationAction>,
    pub in_tx: Vec<MigrationAction>,
}

impl Migration {
    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.in_tx.is_empty()
    }

    /// Fold per-table blocks into the phased composite, in input order.
    /// Within a block `pre` precedes `in_tx`, and the version marker is the
    /// last statement for each table. `versioned` is false for warehouses
    /// without table versioning, which suppresses the markers entirely.
    pub fn from_blocks(blocks: Vec<Block>, versioned: bool) -> Migration {
        let mut migration = Migration::default();

        for block in blocks {
            let table = block.qualified_table();

            if block.is_empty() {
                if versioned {
                    warn!(table = %table, version = %block.target, "Table is up to date; reaffirming version marker");
                    migration.pre.push(MigrationAction::new(
                        block.comment(),
                        format!("Reaffirming {table} is at {}", block.target),
                    ));
                }
                continue;
            }

            let comment = block.comment();
            let has_in = !block.in_tx.is_empty();

            for item in &block.pre {
                let BlockItem::AlterColumn { column, ddl } = item else {
                    // Additive items never belong to the pre group.
                    debug_assert!(false, "non-widening item in pre group");
                    continue;
                };
                migration.pre.push(MigrationAction::new(
                    Statement::AlterTable { ddl: ddl.clone() },
                    format!("Widening {table}.{column}"),
                ));
            }

            for item in block.in_tx {
                let action = match item {
                    BlockItem::AddColumn { column, ddl } => MigrationAction::new(
                        Statement::AlterTable { ddl },
                        format!("Adding column {column} to {table}"),
                    ),
                    BlockItem::CreateTable { ddl } => MigrationAction::new(
                        Statement::CreateTable { ddl },
                        format!("Creating {table} for {}", block.target),
                    ),
                    BlockItem::AlterColumn { column, ddl } => MigrationAction::new(
                        Statement::AlterTable { ddl },
                        format!("Widening {table}.{column}"),
                    ),
                };
                migration.in_tx.push(action);
            }

            // Marker placement: in-transaction when anything commits there,
            // otherwise alongside the pre-transaction alterations.
            if versioned {
                let message = format!("Committing {} on {table}", block.target);
                if has_in {
                    migration.in_tx.push(MigrationAction::new(comment, message));
                } else {
                    migration.pre.push(MigrationAction::new(comment, message));
                }
            }
        }

        migration
    }
}

/// Build the migration plan for a discovered batch.
///
/// Catalog reads run outside any transaction; warehouses that cannot
/// express them (no versioned tables) skip the catalog dance and record
/// intent only.
pub async fn build(
    discovery: &DataDiscovery,
    target: &dyn Target,
    transactor: &Transactor,
) -> Result<Migration, LoaderError> {
    let mut blocks: Vec<Block> = Vec::new();

    for shredded in &discovery.shredded_types {
        match shredded {
            // Legacy JSON types load through jsonpaths; no columnar schema.
            ShreddedType::Json { .. } => continue,
            ShreddedType::Widerow { info } => {
                if let Some(block) = target.extend_table(info) {
                    blocks.push(block);
                }
            }
            ShreddedType::Tabular { info, schemas } => {
                if let Some(block) = target.extend_table(info) {
                    blocks.push(block);
                    continue;
                }
                if !target.supports_versioned_tables() {
                    debug!(
                        table = info.table_name(),
                        "Warehouse does not migrate; recording intent only"
                    );
                    blocks.push(Block::empty(
                        target.db_schema(),
                        info.table_name(),
                        schemas.latest().key.clone(),
                    ));
                    continue;
                }

                let block = transactor
                    .run(async |session: &mut Session| {
                        let table = info.table_name();
                        if !table_exists(session, target, &table).await? {
                            return Ok(target.create_table(schemas));
                        }

                        let comment = table_version(session, target, &table).await?;
                        let current = SchemaKey::parse_uri(&comment).ok_or_else(|| {
                            LoaderError::Migration {
                                source: MigrationError::BadComment {
                                    table: table.clone(),
                                    comment: comment.clone(),
                                },
                            }
                        })?;

                        if current == schemas.latest().key {
                            return Ok(Block::empty(target.db_schema(), table, current));
                        }

                        let columns = table_columns(session, target, &table).await?;
                        target
                            .update_table(&current, &columns, schemas)
                            .map_err(|source| LoaderError::Migration { source })
                    })
                    .await?;
                blocks.push(block);
            }
        }
    }

    Ok(Migration::from_blocks(
        blocks,
        target.supports_versioned_tables(),
    ))
}

async fn table_exists(
    session: &mut Session,
    target: &dyn Target,
    table: &str,
) -> Result<bool, DbError> {
    let statement = Statement::TableExists {
        name: table.to_string(),
    };
    let rows = session.query(target, &statement).await?;
    rows.first()
        .and_then(|row| row.bool_at(0))
        .ok_or_else(|| DbError::ResultShape {
            statement: statement.title().to_string(),
            reason: "expected a single boolean".to_string(),
        })
}

async fn table_version(
    session: &mut Session,
    target: &dyn Target,
    table: &str,
) -> Result<String, DbError> {
    let statement = Statement::GetVersion {
        name: table.to_string(),
    };
    let rows = session.query(target, &statement).await?;
    rows.first()
        .and_then(|row| row.text_at(0))
        .ok_or_else(|| DbError::ResultShape {
            statement: statement.title().to_string(),
            reason: "expected a single text column".to_string(),
        })
}

async fn table_columns(
    session: &mut Session,
    target: &dyn Target,
    table: &str,
) -> Result<Vec<String>, DbError> {
    let statement = Statement::GetColumns {
        name: table.to_string(),
    };
    let rows = session.query(target, &statement).await?;
    Ok(rows.iter().filter_map(|row| row.text_at(0)).collect())
}
