//! glacier: a warehouse loader daemon.
//!
//! Consumes notifications announcing shredded analytics batches in object
//! storage and loads each batch into a columnar warehouse (Redshift,
//! Snowflake or Databricks) exactly once, applying the schema migrations
//! the batch requires before its rows are copied.
//!
//! # Example
//!
//! ```ignore
//! use glacier::{Config, Loader, error::LoaderError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), LoaderError> {
//!     let config = Config::from_file("config.yaml")?;
//!     let loader = Loader { /* wire collaborators */ };
//!     loader.run(Default::default()).await
//! }
//! ```

pub mod config;
pub mod db;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod iglu;
pub mod load;
pub mod migration;
pub mod monitoring;
pub mod queue;
pub mod retry;
pub mod state;
pub mod storage;

// Re-export main types
pub use config::Config;
pub use dispatch::Loader;
pub use error::LoaderError;
pub use state::{Control, LoadStatus, Stage};
