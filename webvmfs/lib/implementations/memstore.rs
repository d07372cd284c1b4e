use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    is_under_prefix, normalize_path, normalize_prefix, validate_scope, FileEntry, FsError,
    FsResult, ScopedFileStore, StoredFile,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An in-memory [`ScopedFileStore`].
///
/// Cloning the store is cheap and all clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryFileStore {
    /// Files grouped by scope, each scope ordered by path.
    scopes: Arc<RwLock<HashMap<String, BTreeMap<String, Blob>>>>,
}

#[derive(Debug, Clone)]
struct Blob {
    data: Bytes,
    stored_at: DateTime<Utc>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MemoryFileStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of files across all scopes.
    pub async fn file_count(&self) -> usize {
        self.scopes.read().await.values().map(BTreeMap::len).sum()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ScopedFileStore for MemoryFileStore {
    async fn write(&self, scope: &str, path: &str, data: Bytes) -> FsResult<()> {
        validate_scope(scope)?;
        let path = normalize_path(path)?;
        let blob = Blob {
            data,
            stored_at: Utc::now(),
        };

        self.scopes
            .write()
            .await
            .entry(scope.to_string())
            .or_default()
            .insert(path, blob);

        Ok(())
    }

    async fn read(&self, scope: &str, path: &str) -> FsResult<StoredFile> {
        validate_scope(scope)?;
        let path = normalize_path(path)?;
        let scopes = self.scopes.read().await;
        match scopes.get(scope).and_then(|files| files.get(&path)) {
            Some(blob) => Ok(StoredFile::new(
                scope,
                path,
                blob.data.clone(),
                blob.stored_at,
            )),
            None => Err(FsError::NotFound {
                scope: scope.to_string(),
                path,
            }),
        }
    }

    async fn exists(&self, scope: &str, path: &str) -> FsResult<bool> {
        validate_scope(scope)?;
        let path = normalize_path(path)?;
        let scopes = self.scopes.read().await;
        Ok(scopes
            .get(scope)
            .is_some_and(|files| files.contains_key(&path)))
    }

    async fn list(&self, scope: &str, prefix: &str) -> FsResult<Vec<FileEntry>> {
        validate_scope(scope)?;
        let prefix = normalize_prefix(prefix)?;
        let scopes = self.scopes.read().await;
        let Some(files) = scopes.get(scope) else {
            return Ok(Vec::new());
        };

        Ok(files
            .iter()
            .filter(|(path, _)| is_under_prefix(path, &prefix))
            .map(|(path, blob)| FileEntry::new(path, blob.data.len() as u64, blob.stored_at))
            .collect())
    }

    async fn delete(&self, scope: &str, path: &str) -> FsResult<bool> {
        validate_scope(scope)?;
        let path = normalize_path(path)?;
        let mut scopes = self.scopes.write().await;
        let Some(files) = scopes.get_mut(scope) else {
            return Ok(false);
        };

        let removed = files.remove(&path).is_some();
        if files.is_empty() {
            scopes.remove(scope);
        }

        Ok(removed)
    }

    async fn delete_prefix(&self, scope: &str, prefix: &str) -> FsResult<usize> {
        validate_scope(scope)?;
        let prefix = normalize_prefix(prefix)?;
        let mut scopes = self.scopes.write().await;
        let Some(files) = scopes.get_mut(scope) else {
            return Ok(0);
        };

        let before = files.len();
        files.retain(|path, _| !is_under_prefix(path, &prefix));
        let removed = before - files.len();
        if files.is_empty() {
            scopes.remove(scope);
        }

        tracing::debug!("removed {} files from {}:{}", removed, scope, prefix);
        Ok(removed)
    }

    async fn scopes(&self) -> FsResult<Vec<String>> {
        let mut scopes: Vec<String> = self.scopes.read().await.keys().cloned().collect();
        scopes.sort();
        Ok(scopes)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
