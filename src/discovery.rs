//! Queue payloads and batch discovery.
//!
//! The shredder announces a finished batch with a `ShreddingComplete`
//! message. Discovery resolves every non-atomic type in it against the
//! schema registry, producing a `DataDiscovery` that carries the resolved
//! migration chains as plain data. Nothing downstream performs registry
//! I/O.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::error::{DiscoveryError, MalformedMessageSnafu, RegistrySnafu};
use crate::iglu::{self, SchemaList, SchemaRegistry};
use crate::storage::StorageFolder;

/// Compression of the shredded batch files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Compression {
    Gzip,
    None,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Gzip => "GZIP",
            Compression::None => "NONE",
        }
    }
}

/// File format of one shredded type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TypeFormat {
    Tsv,
    Json,
    Widerow,
}

impl TypeFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeFormat::Tsv => "tsv",
            TypeFormat::Json => "json",
            TypeFormat::Widerow => "widerow",
        }
    }
}

/// Whether a shredded type came from a self-describing event or a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnowplowEntity {
    SelfDescribing,
    Context,
}

/// One `(vendor, name, model, format)` tuple appearing in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShreddedTypeInfo {
    pub vendor: String,
    pub name: String,
    pub model: u32,
    pub format: TypeFormat,
    pub snowplow_entity: SnowplowEntity,
}

impl ShreddedTypeInfo {
    /// Warehouse table name for this type (without the db schema).
    pub fn table_name(&self) -> String {
        iglu::table_name(&self.vendor, &self.name, self.model)
    }

    /// Wide-row events-table column for this type.
    pub fn wide_column(&self) -> String {
        let prefix = match self.snowplow_entity {
            SnowplowEntity::SelfDescribing => "unstruct_event",
            SnowplowEntity::Context => "contexts",
        };
        format!(
            "{prefix}_{}_{}_{}",
            iglu::snake_case(&self.vendor),
            iglu::snake_case(&self.name),
            self.model
        )
    }

    /// Folder the shredder wrote this type's files under.
    pub fn folder(&self, base: &StorageFolder) -> StorageFolder {
        base.append("shredded-types").append(&format!(
            "vendor={}/name={}/format={}/model={}",
            self.vendor,
            self.name,
            self.format.as_str(),
            self.model
        ))
    }
}

/// Shredder job timestamps carried into the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamps {
    pub job_started: chrono::DateTime<chrono::Utc>,
    pub job_completed: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub min_collector: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub max_collector: Option<chrono::DateTime<chrono::Utc>>,
}

/// The upstream application that produced the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Processor {
    pub artifact: String,
    pub version: String,
}

/// The queue message announcing a finished batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShreddingComplete {
    pub base: StorageFolder,
    pub types: Vec<ShreddedTypeInfo>,
    pub timestamps: Timestamps,
    pub compression: Compression,
    pub processor: Processor,
    #[serde(default)]
    pub count: Option<i64>,
}

impl ShreddingComplete {
    pub fn parse(body: &str) -> Result<Self, DiscoveryError> {
        serde_json::from_str(body).context(MalformedMessageSnafu)
    }

    /// Folder holding the atomic events files of this batch.
    pub fn events_folder(&self) -> StorageFolder {
        self.base.append("atomic-events")
    }
}

/// A shredded type with its registry resolution.
#[derive(Debug, Clone)]
pub enum ShreddedType {
    /// Columnar (TSV) type with its migration chain.
    Tabular {
        info: ShreddedTypeInfo,
        schemas: SchemaList,
    },
    /// Legacy JSON type; loads through a jsonpaths file, no columnar schema.
    Json { info: ShreddedTypeInfo },
    /// Wide-row type; lands as a column of the events table.
    Widerow { info: ShreddedTypeInfo },
}

impl ShreddedType {
    pub fn info(&self) -> &ShreddedTypeInfo {
        match self {
            ShreddedType::Tabular { info, .. } => info,
            ShreddedType::Json { info } => info,
            ShreddedType::Widerow { info } => info,
        }
    }
}

/// A batch ready for loading: registry lookups already performed.
#[derive(Debug, Clone)]
pub struct DataDiscovery {
    pub base: StorageFolder,
    pub compression: Compression,
    pub shredded_types: Vec<ShreddedType>,
    /// The original message, kept for the manifest row.
    pub origin: ShreddingComplete,
}

impl DataDiscovery {
    /// Resolve a `ShreddingComplete` against the registry.
    pub async fn resolve(
        message: ShreddingComplete,
        registry: &dyn SchemaRegistry,
    ) -> Result<Self, DiscoveryError> {
        let mut shredded_types = Vec::with_capacity(message.types.len());
        for info in &message.types {
            let resolved = match info.format {
                TypeFormat::Json => ShreddedType::Json { info: info.clone() },
                TypeFormat::Widerow => ShreddedType::Widerow { info: info.clone() },
                TypeFormat::Tsv => {
                    let schemas = registry
                        .get_schemas(&info.vendor, &info.name, info.model)
                        .await
                        .context(RegistrySnafu {
                            vendor: info.vendor.clone(),
                            name: info.name.clone(),
                            model: info.model,
                        })?;
                    ShreddedType::Tabular {
                        info: info.clone(),
                        schemas,
                    }
                }
            };
            shredded_types.push(resolved);
        }

        Ok(DataDiscovery {
            base: message.base.clone(),
            compression: message.compression,
            shredded_types,
            origin: message,
        })
    }

    pub fn events_folder(&self) -> StorageFolder {
        self.origin.events_folder()
    }
}
