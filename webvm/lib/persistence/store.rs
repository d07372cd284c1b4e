use async_trait::async_trait;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::{Application, RuntimePackage, WebVmError, WebVmResult, WebVmStatus};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The document holding the virtual machine status.
pub const VM_STATUS_DOCUMENT: &str = "vm-status";

/// The document holding the runtime package catalog.
pub const PACKAGES_DOCUMENT: &str = "runtime-packages";

/// The document holding the application list.
pub const APPLICATIONS_DOCUMENT: &str = "applications";

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A key-value store for the state that survives a restart.
///
/// Snapshots are JSON documents with dates as ISO-8601 strings and `null` for absent dates.
/// Loads return `None` when nothing was saved.
#[async_trait]
pub trait StatePersistence: Send + Sync {
    /// Reads a raw document.
    async fn read_document(&self, name: &str) -> WebVmResult<Option<String>>;

    /// Writes a raw document.
    async fn write_document(&self, name: &str, contents: String) -> WebVmResult<()>;

    /// Deletes a raw document.
    async fn delete_document(&self, name: &str) -> WebVmResult<()>;

    /// Stores the raw tar bundle of a runtime package.
    async fn save_bundle(&self, package_id: &str, data: Bytes) -> WebVmResult<()>;

    /// Loads the raw tar bundle of a runtime package.
    async fn load_bundle(&self, package_id: &str) -> WebVmResult<Option<Bytes>>;

    /// Deletes the raw tar bundle of a runtime package. Returns `false` if there was none.
    async fn delete_bundle(&self, package_id: &str) -> WebVmResult<bool>;

    /// Saves the virtual machine status.
    async fn save_vm_status(&self, status: &WebVmStatus) -> WebVmResult<()> {
        self.write_document(VM_STATUS_DOCUMENT, encode(status)?)
            .await
    }

    /// Loads the virtual machine status.
    async fn load_vm_status(&self) -> WebVmResult<Option<WebVmStatus>> {
        decode(self.read_document(VM_STATUS_DOCUMENT).await?)
    }

    /// Saves the full runtime package catalog.
    async fn save_packages(&self, packages: &[RuntimePackage]) -> WebVmResult<()> {
        self.write_document(PACKAGES_DOCUMENT, encode(packages)?)
            .await
    }

    /// Loads the runtime package catalog.
    async fn load_packages(&self) -> WebVmResult<Option<Vec<RuntimePackage>>> {
        decode(self.read_document(PACKAGES_DOCUMENT).await?)
    }

    /// Saves the application list.
    async fn save_applications(&self, applications: &[Application]) -> WebVmResult<()> {
        self.write_document(APPLICATIONS_DOCUMENT, encode(applications)?)
            .await
    }

    /// Loads the application list.
    async fn load_applications(&self) -> WebVmResult<Option<Vec<Application>>> {
        decode(self.read_document(APPLICATIONS_DOCUMENT).await?)
    }

    /// Deletes every snapshot. Bundles are kept.
    async fn clear(&self) -> WebVmResult<()> {
        for name in [VM_STATUS_DOCUMENT, PACKAGES_DOCUMENT, APPLICATIONS_DOCUMENT] {
            self.delete_document(name).await?;
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn encode<T: Serialize + ?Sized>(value: &T) -> WebVmResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn decode<T: DeserializeOwned>(contents: Option<String>) -> WebVmResult<Option<T>> {
    contents
        .map(|contents| serde_json::from_str(&contents).map_err(WebVmError::from))
        .transpose()
}
