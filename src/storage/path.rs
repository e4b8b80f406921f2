//! Validated object-storage paths.
//!
//! `StorageFolder` is a canonical `s3://` prefix with a trailing slash;
//! `StorageKey` is the same grammar without one. Both are constructed
//! through `parse` (validating) or `coerce` (trusted inputs only, e.g.
//! values read back from the manifest).

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Longest accepted path, matching the warehouse's varchar column.
pub const MAX_PATH_LENGTH: usize = 1024;

const SCHEMES: [&str; 3] = ["s3://", "s3a://", "s3n://"];

/// Normalize legacy Hadoop schemes and validate the shared grammar.
/// Returns the path with a canonical `s3://` scheme.
fn normalize(input: &str) -> Result<String, StorageError> {
    let scheme = SCHEMES
        .iter()
        .find(|scheme| input.starts_with(**scheme))
        .ok_or_else(|| StorageError::InvalidPath {
            path: input.to_string(),
            reason: "must start with s3://, s3a:// or s3n://".to_string(),
        })?;

    let rest = &input[scheme.len()..];
    let bucket = rest.split('/').next().unwrap_or("");
    if bucket.is_empty() {
        return Err(StorageError::InvalidPath {
            path: input.to_string(),
            reason: "missing bucket".to_string(),
        });
    }

    let normalized = format!("s3://{rest}");
    if normalized.len() > MAX_PATH_LENGTH {
        return Err(StorageError::InvalidPath {
            path: input.to_string(),
            reason: format!("longer than {MAX_PATH_LENGTH} characters"),
        });
    }
    Ok(normalized)
}

/// A canonical object-store prefix, always ending in `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageFolder(String);

impl StorageFolder {
    /// Parse and normalize a folder string, appending the trailing slash
    /// when absent.
    pub fn parse(input: &str) -> Result<Self, StorageError> {
        let mut normalized = normalize(input)?;
        if !normalized.ends_with('/') {
            normalized.push('/');
            if normalized.len() > MAX_PATH_LENGTH {
                return Err(StorageError::InvalidPath {
                    path: input.to_string(),
                    reason: format!("longer than {MAX_PATH_LENGTH} characters"),
                });
            }
        }
        Ok(StorageFolder(normalized))
    }

    /// Wrap an already-canonical folder string. For trusted inputs only
    /// (manifest rows, values this process produced).
    pub fn coerce(input: impl Into<String>) -> Self {
        let input = input.into();
        debug_assert!(input.starts_with("s3://") && input.ends_with('/'));
        StorageFolder(input)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bucket component, without scheme.
    pub fn bucket(&self) -> &str {
        self.0["s3://".len()..].split('/').next().unwrap_or("")
    }

    /// Prefix inside the bucket, with trailing slash; empty at bucket root.
    pub fn prefix(&self) -> &str {
        let rest = &self.0["s3://".len()..];
        match rest.find('/') {
            Some(idx) => &rest[idx + 1..],
            None => "",
        }
    }

    /// Append a sub-folder segment.
    pub fn append(&self, segment: &str) -> StorageFolder {
        let segment = segment.trim_matches('/');
        StorageFolder(format!("{}{segment}/", self.0))
    }

    /// A key directly under this folder.
    pub fn key(&self, name: &str) -> StorageKey {
        StorageKey(format!("{}{}", self.0, name.trim_start_matches('/')))
    }

    /// Last path segment, e.g. `run=2022-01-01-00-00-00` for the shredder's
    /// output folders.
    pub fn folder_name(&self) -> &str {
        self.0
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("")
    }

    /// Parent folder, or `None` at the bucket root.
    pub fn parent(&self) -> Option<StorageFolder> {
        let trimmed = self.0.trim_end_matches('/');
        let cut = trimmed.rfind('/')?;
        // Never cut into the scheme.
        if cut < "s3://".len() + self.bucket().len() {
            return None;
        }
        Some(StorageFolder(format!("{}/", &trimmed[..cut])))
    }

    /// Path of `self` relative to `parent`, or `None` when `self` does not
    /// live under it.
    pub fn diff(&self, parent: &StorageFolder) -> Option<String> {
        self.0
            .strip_prefix(parent.as_str())
            .filter(|rest| !rest.is_empty())
            .map(|rest| rest.to_string())
    }
}

impl std::fmt::Display for StorageFolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StorageFolder {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        StorageFolder::parse(&value).map_err(|e| e.to_string())
    }
}

impl From<StorageFolder> for String {
    fn from(folder: StorageFolder) -> String {
        folder.0
    }
}

/// A single object's path; same grammar as `StorageFolder` but never ends
/// in `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageKey(String);

impl StorageKey {
    pub fn parse(input: &str) -> Result<Self, StorageError> {
        let normalized = normalize(input)?;
        if normalized.ends_with('/') {
            return Err(StorageError::InvalidPath {
                path: input.to_string(),
                reason: "keys must not end with /".to_string(),
            });
        }
        Ok(StorageKey(normalized))
    }

    pub fn coerce(input: impl Into<String>) -> Self {
        let input = input.into();
        debug_assert!(input.starts_with("s3://") && !input.ends_with('/'));
        StorageKey(input)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn bucket(&self) -> &str {
        self.0["s3://".len()..].split('/').next().unwrap_or("")
    }

    /// Object path inside the bucket.
    pub fn object(&self) -> &str {
        let rest = &self.0["s3://".len()..];
        match rest.find('/') {
            Some(idx) => &rest[idx + 1..],
            None => "",
        }
    }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StorageKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        StorageKey::parse(&value).map_err(|e| e.to_string())
    }
}

impl From<StorageKey> for String {
    fn from(key: StorageKey) -> String {
        key.0
    }
}
