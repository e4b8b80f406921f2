//! Schema registry model and clients.
//!
//! A shredded type resolves to a `SchemaList`: the ordered chain of schema
//! versions within one model, each carrying the column set the warehouse
//! table holds at that version. Lists are resolved *before* any transaction
//! is opened and travel through the loader as plain data.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::error::{HttpSnafu, RegistryError};

/// Schema version triple, ordered by (model, revision, addition).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVer {
    pub model: u32,
    pub revision: u32,
    pub addition: u32,
}

impl SchemaVer {
    pub fn new(model: u32, revision: u32, addition: u32) -> Self {
        Self {
            model,
            revision,
            addition,
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        let mut parts = input.split('-');
        let model = parts.next()?.parse().ok()?;
        let revision = parts.next()?.parse().ok()?;
        let addition = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            model,
            revision,
            addition,
        })
    }
}

impl std::fmt::Display for SchemaVer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.model, self.revision, self.addition)
    }
}

impl Serialize for SchemaVer {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SchemaVer {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        SchemaVer::parse(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid schema version: {text}")))
    }
}

/// Fully-qualified schema coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaKey {
    pub vendor: String,
    pub name: String,
    pub format: String,
    pub version: SchemaVer,
}

impl SchemaKey {
    pub fn new(vendor: impl Into<String>, name: impl Into<String>, version: SchemaVer) -> Self {
        Self {
            vendor: vendor.into(),
            name: name.into(),
            format: "jsonschema".to_string(),
            version,
        }
    }

    /// The `iglu:` URI, used as the table comment marker.
    pub fn uri(&self) -> String {
        format!(
            "iglu:{}/{}/{}/{}",
            self.vendor, self.name, self.format, self.version
        )
    }

    /// Parse an `iglu:vendor/name/format/M-R-A` URI.
    pub fn parse_uri(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix("iglu:")?;
        let mut parts = rest.split('/');
        let vendor = parts.next()?.to_string();
        let name = parts.next()?.to_string();
        let format = parts.next()?.to_string();
        let version = SchemaVer::parse(parts.next()?)?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            vendor,
            name,
            format,
            version,
        })
    }
}

impl std::fmt::Display for SchemaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.uri())
    }
}

/// Warehouse column type. Rendering is the dialect-neutral SQL spelling;
/// widening rules drive the pre-transaction migration phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum SqlType {
    Varchar { length: u32 },
    Char { length: u32 },
    SmallInt,
    Integer,
    BigInt,
    Double,
    Boolean,
    Timestamp,
    Date,
    Decimal { precision: u8, scale: u8 },
}

impl SqlType {
    /// SQL spelling shared by all three dialects.
    pub fn sql(&self) -> String {
        match self {
            SqlType::Varchar { length } => format!("VARCHAR({length})"),
            SqlType::Char { length } => format!("CHAR({length})"),
            SqlType::SmallInt => "SMALLINT".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::Double => "DOUBLE PRECISION".to_string(),
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::Timestamp => "TIMESTAMP".to_string(),
            SqlType::Date => "DATE".to_string(),
            SqlType::Decimal { precision, scale } => format!("DECIMAL({precision},{scale})"),
        }
    }

    /// Whether altering a column from `self` to `other` only widens it.
    /// Anything else is rejected by the planner.
    pub fn widens_to(&self, other: &SqlType) -> bool {
        match (self, other) {
            (SqlType::Varchar { length: from }, SqlType::Varchar { length: to }) => to > from,
            (SqlType::Char { length: from }, SqlType::Char { length: to }) => to > from,
            (SqlType::SmallInt, SqlType::Integer | SqlType::BigInt) => true,
            (SqlType::Integer, SqlType::BigInt) => true,
            (
                SqlType::Decimal {
                    precision: p1,
                    scale: s1,
                },
                SqlType::Decimal {
                    precision: p2,
                    scale: s2,
                },
            ) => p2 > p1 && s2 == s1,
            _ => false,
        }
    }
}

impl std::fmt::Display for SqlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.sql())
    }
}

/// Column compression, rendered only by warehouses that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnEncoding {
    Raw,
    Zstd,
    RunLength,
    Text255,
}

impl ColumnEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnEncoding::Raw => "RAW",
            ColumnEncoding::Zstd => "ZSTD",
            ColumnEncoding::RunLength => "RUNLENGTH",
            ColumnEncoding::Text255 => "TEXT255",
        }
    }
}

/// One column of a versioned table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(flatten)]
    pub sql_type: SqlType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<ColumnEncoding>,
}

fn default_nullable() -> bool {
    true
}

/// One version of a table schema as served by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    #[serde(rename = "self")]
    pub key: SchemaKey,
    pub columns: Vec<ColumnDef>,
}

/// Non-empty, ordered migration chain within a single model. The last
/// element is the latest known version.
#[derive(Debug, Clone)]
pub struct SchemaList(Vec<TableSchema>);

impl SchemaList {
    /// Validate ordering, model uniformity and non-emptiness.
    pub fn new(mut schemas: Vec<TableSchema>) -> Result<Self, RegistryError> {
        if schemas.is_empty() {
            return Err(RegistryError::InvalidList {
                reason: "empty schema list".to_string(),
            });
        }
        schemas.sort_by_key(|schema| schema.key.version);
        let model = schemas[0].key.version.model;
        if schemas.iter().any(|s| s.key.version.model != model) {
            return Err(RegistryError::InvalidList {
                reason: "schema list spans multiple models".to_string(),
            });
        }
        Ok(SchemaList(schemas))
    }

    pub fn latest(&self) -> &TableSchema {
        self.0.last().expect("schema list is non-empty")
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableSchema> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[TableSchema] {
        &self.0
    }

    /// Position of `key` within the chain, if known.
    pub fn position(&self, key: &SchemaKey) -> Option<usize> {
        self.0.iter().position(|schema| schema.key == *key)
    }
}

/// Derive the warehouse table name for a schema coordinate,
/// e.g. `com.acme` / `context` / 1 becomes `com_acme_context_1`.
pub fn table_name(vendor: &str, name: &str, model: u32) -> String {
    format!("{}_{}_{model}", snake_case(vendor), snake_case(name))
}

/// Snake-case an Iglu vendor or schema name: dots and dashes become
/// underscores, camelCase humps get split.
pub fn snake_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    let mut prev_lower = false;
    for ch in input.chars() {
        if ch == '.' || ch == '-' {
            out.push('_');
            prev_lower = false;
        } else if ch.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}

/// Pure lookup of the migration chain for one shredded type.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    async fn get_schemas(
        &self,
        vendor: &str,
        name: &str,
        model: u32,
    ) -> Result<SchemaList, RegistryError>;
}

/// Registry configuration loaded from `--iglu-config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IgluConfig {
    /// HTTP registry endpoints, tried in order.
    #[serde(default)]
    pub registries: Vec<RegistryEndpoint>,

    /// Schema lists embedded directly in the file. Served before any HTTP
    /// lookup; this is how tests and air-gapped deployments resolve.
    #[serde(default)]
    pub schemas: Vec<TableSchema>,
}

impl IgluConfig {
    /// Load registry configuration from a YAML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, crate::error::ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).context(crate::error::ReadFileSnafu)?;
        serde_yaml::from_str(&content).context(crate::error::YamlParseSnafu)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEndpoint {
    pub name: String,
    pub uri: String,
}

/// Resolver combining embedded schema lists with HTTP registries.
pub struct Resolver {
    embedded: HashMap<(String, String, u32), Vec<TableSchema>>,
    endpoints: Vec<RegistryEndpoint>,
    client: reqwest::Client,
}

impl Resolver {
    pub fn new(config: IgluConfig) -> Self {
        let mut embedded: HashMap<(String, String, u32), Vec<TableSchema>> = HashMap::new();
        for schema in config.schemas {
            let key = (
                schema.key.vendor.clone(),
                schema.key.name.clone(),
                schema.key.version.model,
            );
            embedded.entry(key).or_default().push(schema);
        }
        Self {
            embedded,
            endpoints: config.registries,
            client: reqwest::Client::new(),
        }
    }

    async fn fetch(
        &self,
        endpoint: &RegistryEndpoint,
        vendor: &str,
        name: &str,
        model: u32,
    ) -> Result<Option<Vec<TableSchema>>, RegistryError> {
        let url = format!(
            "{}/api/schemas/{vendor}/{name}/{model}",
            endpoint.uri.trim_end_matches('/')
        );
        let response = self.client.get(&url).send().await.context(HttpSnafu)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status().context(HttpSnafu)?;
        let schemas: Vec<TableSchema> = response.json().await.context(HttpSnafu)?;
        Ok(Some(schemas))
    }
}

#[async_trait]
impl SchemaRegistry for Resolver {
    async fn get_schemas(
        &self,
        vendor: &str,
        name: &str,
        model: u32,
    ) -> Result<SchemaList, RegistryError> {
        let key = (vendor.to_string(), name.to_string(), model);
        if let Some(schemas) = self.embedded.get(&key) {
            return SchemaList::new(schemas.clone());
        }

        for endpoint in &self.endpoints {
            if let Some(schemas) = self.fetch(endpoint, vendor, name, model).await? {
                return SchemaList::new(schemas);
            }
        }

        Err(RegistryError::NotFound {
            vendor: vendor.to_string(),
            name: name.to_string(),
            model,
        })
    }
}
