use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::WebVmResult;

use super::StatePersistence;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An in-memory [`StatePersistence`]. Clones share their contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    documents: Arc<RwLock<HashMap<String, String>>>,
    bundles: Arc<RwLock<HashMap<String, Bytes>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MemoryPersistence {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl StatePersistence for MemoryPersistence {
    async fn read_document(&self, name: &str) -> WebVmResult<Option<String>> {
        Ok(self.documents.read().await.get(name).cloned())
    }

    async fn write_document(&self, name: &str, contents: String) -> WebVmResult<()> {
        self.documents.write().await.insert(name.to_string(), contents);
        Ok(())
    }

    async fn delete_document(&self, name: &str) -> WebVmResult<()> {
        self.documents.write().await.remove(name);
        Ok(())
    }

    async fn save_bundle(&self, package_id: &str, data: Bytes) -> WebVmResult<()> {
        self.bundles
            .write()
            .await
            .insert(package_id.to_string(), data);
        Ok(())
    }

    async fn load_bundle(&self, package_id: &str) -> WebVmResult<Option<Bytes>> {
        Ok(self.bundles.read().await.get(package_id).cloned())
    }

    async fn delete_bundle(&self, package_id: &str) -> WebVmResult<bool> {
        Ok(self.bundles.write().await.remove(package_id).is_some())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::{VmState, WebVmStatus};

    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_memory_persistence_round_trips_status() -> anyhow::Result<()> {
        let persistence = MemoryPersistence::new();
        assert!(persistence.load_vm_status().await?.is_none());

        let status = WebVmStatus {
            state: VmState::Ready,
            load_progress: 100,
            boot_time: Some(chrono::Utc::now()),
            ..Default::default()
        };
        persistence.save_vm_status(&status).await?;
        assert_eq!(persistence.load_vm_status().await?, Some(status));

        persistence.clear().await?;
        assert!(persistence.load_vm_status().await?.is_none());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_memory_persistence_bundles() -> anyhow::Result<()> {
        let persistence = MemoryPersistence::new();
        persistence
            .save_bundle("nginx", Bytes::from_static(b"tar"))
            .await?;

        assert_eq!(
            persistence.load_bundle("nginx").await?,
            Some(Bytes::from_static(b"tar"))
        );
        assert!(persistence.delete_bundle("nginx").await?);
        assert!(!persistence.delete_bundle("nginx").await?);

        Ok(())
    }
}
