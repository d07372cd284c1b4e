use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs;

use crate::{
    is_under_prefix, normalize_path, normalize_prefix, validate_scope, FileEntry, FsError,
    FsResult, ScopedFileStore, StoredFile,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`ScopedFileStore`] backed by the native filesystem.
///
/// Each scope is a directory under the root and each file lives at `<root>/<scope>/<path>`.
/// The stored-at time is the file's modification time.
#[derive(Debug, Clone)]
pub struct NativeFileStore {
    /// The directory holding one sub directory per scope.
    root_path: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NativeFileStore {
    /// Creates a new store rooted at `root_path`. The directory is created lazily on first write.
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
        }
    }

    /// Returns the root directory of the store.
    pub fn get_root_path(&self) -> &Path {
        &self.root_path
    }

    fn scope_dir(&self, scope: &str) -> FsResult<PathBuf> {
        validate_scope(scope)?;
        Ok(self.root_path.join(scope))
    }

    fn to_native_path(&self, scope: &str, path: &str) -> FsResult<(PathBuf, String)> {
        let dir = self.scope_dir(scope)?;
        let path = normalize_path(path)?;
        Ok((dir.join(&path), path))
    }

    /// Walks a scope directory and returns every file as `(relative path, metadata)`.
    async fn walk(&self, scope_dir: &Path) -> FsResult<Vec<(String, std::fs::Metadata)>> {
        let mut files = Vec::new();
        let mut pending = vec![scope_dir.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut read_dir = match fs::read_dir(&dir).await {
                Ok(read_dir) => read_dir,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = read_dir.next_entry().await? {
                let metadata = entry.metadata().await?;
                let path = entry.path();
                if metadata.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(scope_dir) {
                    let relative = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    files.push((relative, metadata));
                }
            }
        }

        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ScopedFileStore for NativeFileStore {
    async fn write(&self, scope: &str, path: &str, data: Bytes) -> FsResult<()> {
        let (native_path, _) = self.to_native_path(scope, path)?;
        if let Some(parent) = native_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(&native_path, &data).await?;
        Ok(())
    }

    async fn read(&self, scope: &str, path: &str) -> FsResult<StoredFile> {
        let (native_path, path) = self.to_native_path(scope, path)?;
        let not_found = || FsError::NotFound {
            scope: scope.to_string(),
            path: path.clone(),
        };

        let metadata = match fs::metadata(&native_path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Err(not_found()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };

        let data = fs::read(&native_path).await?;
        Ok(StoredFile::new(
            scope,
            path.clone(),
            Bytes::from(data),
            stored_at(&metadata),
        ))
    }

    async fn exists(&self, scope: &str, path: &str) -> FsResult<bool> {
        let (native_path, _) = self.to_native_path(scope, path)?;
        match fs::metadata(&native_path).await {
            Ok(m) => Ok(m.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, scope: &str, prefix: &str) -> FsResult<Vec<FileEntry>> {
        let scope_dir = self.scope_dir(scope)?;
        let prefix = normalize_prefix(prefix)?;
        Ok(self
            .walk(&scope_dir)
            .await?
            .into_iter()
            .filter(|(path, _)| is_under_prefix(path, &prefix))
            .map(|(path, metadata)| FileEntry::new(path, metadata.len(), stored_at(&metadata)))
            .collect())
    }

    async fn delete(&self, scope: &str, path: &str) -> FsResult<bool> {
        let (native_path, _) = self.to_native_path(scope, path)?;
        match fs::remove_file(&native_path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_prefix(&self, scope: &str, prefix: &str) -> FsResult<usize> {
        let scope_dir = self.scope_dir(scope)?;
        let prefix = normalize_prefix(prefix)?;
        let doomed: Vec<String> = self
            .walk(&scope_dir)
            .await?
            .into_iter()
            .map(|(path, _)| path)
            .filter(|path| is_under_prefix(path, &prefix))
            .collect();

        let target = if prefix.is_empty() {
            scope_dir
        } else {
            scope_dir.join(&prefix)
        };

        match fs::metadata(&target).await {
            Ok(m) if m.is_dir() => fs::remove_dir_all(&target).await?,
            Ok(_) => fs::remove_file(&target).await?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(doomed.len())
    }

    async fn scopes(&self) -> FsResult<Vec<String>> {
        let mut scopes = Vec::new();
        let mut read_dir = match fs::read_dir(&self.root_path).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(scopes),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.metadata().await?.is_dir() {
                continue;
            }

            if self.walk(&entry.path()).await?.is_empty() {
                continue;
            }

            scopes.push(entry.file_name().to_string_lossy().into_owned());
        }

        scopes.sort();
        Ok(scopes)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn stored_at(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
