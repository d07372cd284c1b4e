use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};

use crate::FsResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A file held by a [`ScopedFileStore`].
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct StoredFile {
    /// The scope the file belongs to.
    scope: String,

    /// The normalized path of the file within its scope.
    path: String,

    /// The raw contents of the file.
    data: Bytes,

    /// When the file was last written.
    stored_at: DateTime<Utc>,
}

/// A listing entry describing a stored file without its contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct FileEntry {
    /// The normalized path of the file within its scope.
    path: String,

    /// The size of the file in bytes.
    size: u64,

    /// When the file was last written.
    stored_at: DateTime<Utc>,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A store of raw byte buffers keyed by `(scope, path)`.
///
/// Paths are normalized before use (see [`normalize_path`](crate::normalize_path)), so
/// `/public/index.html` and `public/index.html` address the same file. Directories are implicit:
/// a directory exists as long as some file lives underneath it.
#[async_trait]
pub trait ScopedFileStore: Send + Sync {
    /// Writes `data` to `path` in `scope`, replacing any previous contents.
    async fn write(&self, scope: &str, path: &str, data: Bytes) -> FsResult<()>;

    /// Reads the file at `path` in `scope`.
    ///
    /// ## Errors
    ///
    /// Returns [`FsError::NotFound`](crate::FsError::NotFound) if the file does not exist.
    async fn read(&self, scope: &str, path: &str) -> FsResult<StoredFile>;

    /// Checks whether a file exists at `path` in `scope`.
    async fn exists(&self, scope: &str, path: &str) -> FsResult<bool>;

    /// Lists the files in `scope` whose path lives under `prefix`, sorted by path.
    ///
    /// An empty prefix lists the whole scope.
    async fn list(&self, scope: &str, prefix: &str) -> FsResult<Vec<FileEntry>>;

    /// Deletes a single file. Returns `false` if it did not exist.
    async fn delete(&self, scope: &str, path: &str) -> FsResult<bool>;

    /// Deletes every file under `prefix` in `scope` and returns how many were removed.
    async fn delete_prefix(&self, scope: &str, prefix: &str) -> FsResult<usize>;

    /// Deletes the whole scope and returns how many files were removed.
    async fn clear_scope(&self, scope: &str) -> FsResult<usize> {
        self.delete_prefix(scope, "").await
    }

    /// Returns the scopes that currently hold at least one file, sorted.
    async fn scopes(&self) -> FsResult<Vec<String>>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl StoredFile {
    /// Creates a new stored file record.
    pub fn new(
        scope: impl Into<String>,
        path: impl Into<String>,
        data: Bytes,
        stored_at: DateTime<Utc>,
    ) -> Self {
        Self {
            scope: scope.into(),
            path: path.into(),
            data,
            stored_at,
        }
    }

    /// Returns the size of the file in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Consumes the record and returns its contents.
    pub fn into_data(self) -> Bytes {
        self.data
    }
}

impl FileEntry {
    /// Creates a new listing entry.
    pub fn new(path: impl Into<String>, size: u64, stored_at: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            size,
            stored_at,
        }
    }
}
