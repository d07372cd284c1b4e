use async_trait::async_trait;

use crate::{InstallOptions, InstallResult, RemoveResult, RuntimePackage, WebVmResult};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Performs the side effects of installing and removing a single runtime package.
///
/// The repository owns the catalog and status transitions and delegates the actual work here.
#[async_trait]
pub trait RuntimeInstaller: Send + Sync {
    /// Fetches, extracts and configures `package`.
    async fn install_runtime_package(
        &self,
        package: &RuntimePackage,
        options: &InstallOptions,
    ) -> WebVmResult<InstallResult>;

    /// Deletes the files of `package`.
    ///
    /// Post-install commands and service units applied during the install are not reverted.
    async fn remove_runtime_package(&self, package: &RuntimePackage) -> WebVmResult<RemoveResult>;
}
