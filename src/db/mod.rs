//! Warehouse access: statement vocabulary, dialect targets, transaction
//! boundary and the load manifest.

pub mod databricks;
pub mod manifest;
pub mod redshift;
pub mod snowflake;
pub mod statement;
pub mod target;
pub mod transactor;

use std::sync::Arc;

use crate::config::{Config, StorageConfig};
use target::Target;

/// Build the dialect target selected by configuration.
pub fn build_target(config: &Config) -> Arc<dyn Target> {
    match &config.storage {
        StorageConfig::Redshift(redshift) => Arc::new(redshift::Redshift::new(
            redshift.clone(),
            config.region.clone(),
            config.jsonpaths.clone(),
        )),
        StorageConfig::Snowflake(snowflake) => {
            Arc::new(snowflake::Snowflake::new(snowflake.clone()))
        }
        StorageConfig::Databricks(databricks) => {
            Arc::new(databricks::Databricks::new(databricks.clone()))
        }
    }
}
