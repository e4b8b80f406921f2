//! Object-storage access for the loader.
//!
//! The loader only needs three operations against the blob store: list the
//! immediate sub-folders of a prefix (folder monitoring), list keys under a
//! prefix, and put a small object (the staging file the folder monitor
//! COPYs from). `BlobStorage` is that seam; `ObjectStorage` is the
//! `object_store`-backed implementation.

mod path;

pub use path::{MAX_PATH_LENGTH, StorageFolder, StorageKey};

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use snafu::prelude::*;
use tracing::debug;

use crate::error::{ObjectStoreSnafu, StorageError};

/// Minimal blob-store interface consumed by the core.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Immediate sub-folders of `folder` (one level, not recursive).
    async fn list_folders(&self, folder: &StorageFolder)
    -> Result<Vec<StorageFolder>, StorageError>;

    /// All keys under `folder`.
    async fn list_keys(&self, folder: &StorageFolder) -> Result<Vec<StorageKey>, StorageError>;

    /// Write a small object.
    async fn put(&self, key: &StorageKey, bytes: Bytes) -> Result<(), StorageError>;
}

/// `object_store`-backed storage client for a single bucket.
pub struct ObjectStorage {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl ObjectStorage {
    /// Build an S3 client for the bucket `folder` lives in.
    pub fn s3(region: &str, folder: &StorageFolder) -> Result<Self, StorageError> {
        let bucket = folder.bucket().to_string();
        let store = AmazonS3Builder::from_env()
            .with_region(region)
            .with_bucket_name(&bucket)
            .build()
            .context(ObjectStoreSnafu)?;
        Ok(Self {
            store: Arc::new(store),
            bucket,
        })
    }

    /// Wrap an existing store (used by tests with a local filesystem store).
    pub fn from_store(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    fn object_path(&self, prefix: &str) -> Path {
        Path::from(prefix.trim_end_matches('/'))
    }
}

#[async_trait]
impl BlobStorage for ObjectStorage {
    async fn list_folders(
        &self,
        folder: &StorageFolder,
    ) -> Result<Vec<StorageFolder>, StorageError> {
        let path = self.object_path(folder.prefix());
        let listing = self
            .store
            .list_with_delimiter(Some(&path))
            .await
            .context(ObjectStoreSnafu)?;

        let mut folders = BTreeSet::new();
        for prefix in listing.common_prefixes {
            if let Some(name) = prefix.filename() {
                folders.insert(folder.append(name));
            }
        }
        debug!(base = %folder, count = folders.len(), "Listed sub-folders");
        Ok(folders.into_iter().collect())
    }

    async fn list_keys(&self, folder: &StorageFolder) -> Result<Vec<StorageKey>, StorageError> {
        let path = self.object_path(folder.prefix());
        let mut stream = self.store.list(Some(&path));

        let mut keys = Vec::new();
        while let Some(meta) = stream.next().await {
            let meta = meta.context(ObjectStoreSnafu)?;
            keys.push(StorageKey::coerce(format!(
                "s3://{}/{}",
                self.bucket, meta.location
            )));
        }
        keys.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(keys)
    }

    async fn put(&self, key: &StorageKey, bytes: Bytes) -> Result<(), StorageError> {
        let path = Path::from(key.object());
        self.store
            .put(&path, bytes.into())
            .await
            .context(ObjectStoreSnafu)?;
        Ok(())
    }
}
