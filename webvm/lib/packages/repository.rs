use std::{collections::VecDeque, sync::Arc};

use async_recursion::async_recursion;
use chrono::Utc;
use tokio::{
    sync::{broadcast, watch, Mutex, RwLock},
    time::Instant,
};

use crate::{
    config::WebVmConfig, persistence::StatePersistence, remote::RemoteSource, ErrorReport,
    InstallOptions, InstallResult, OperationType, PackageStatus, RemoveOptions, RemoveResult,
    RuntimeOperation, RuntimePackage, WebVmError, WebVmResult,
};

use super::{is_valid_package_id, RuntimeInstaller, RuntimeManifest};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const OPERATION_CHANNEL_CAPACITY: usize = 64;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The catalog of installable runtime packages and the install/remove workflow.
///
/// The catalog lives in a [`watch`] channel so observers see every committed change. Each
/// mutation builds the next version of a record and swaps it in whole, then persists the full
/// catalog. Installs and removals are serialized by an operation lock; dependency installs run
/// inside the lock, one after another.
pub struct RuntimeRepository {
    config: WebVmConfig,
    remote: Arc<dyn RemoteSource>,
    persistence: Arc<dyn StatePersistence>,
    installer: Arc<dyn RuntimeInstaller>,
    catalog: watch::Sender<Vec<RuntimePackage>>,
    initialized: Mutex<bool>,
    operation_lock: Mutex<()>,
    last_error: RwLock<Option<ErrorReport>>,
    operations: RwLock<VecDeque<RuntimeOperation>>,
    events: broadcast::Sender<RuntimeOperation>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RuntimeRepository {
    /// Creates an empty repository.
    pub fn new(
        config: WebVmConfig,
        remote: Arc<dyn RemoteSource>,
        persistence: Arc<dyn StatePersistence>,
        installer: Arc<dyn RuntimeInstaller>,
    ) -> Self {
        let (catalog, _) = watch::channel(Vec::new());
        let (events, _) = broadcast::channel(OPERATION_CHANNEL_CAPACITY);

        Self {
            config,
            remote,
            persistence,
            installer,
            catalog,
            initialized: Mutex::new(false),
            operation_lock: Mutex::new(()),
            last_error: RwLock::new(None),
            operations: RwLock::new(VecDeque::new()),
            events,
        }
    }

    /// Hydrates the catalog from persistence and loads the remote manifest.
    ///
    /// Only the first call does any work; concurrent callers wait for it. A failed manifest fetch
    /// is recorded in [`get_last_error`](Self::get_last_error) and leaves the hydrated catalog in
    /// place.
    pub async fn initialize(&self) -> WebVmResult<()> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return Ok(());
        }

        match self.persistence.load_packages().await {
            Ok(Some(packages)) => {
                tracing::debug!("hydrated {} packages from persistence", packages.len());
                self.catalog.send_replace(packages);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "failed to load persisted packages"),
        }

        if let Err(e) = self.refresh_manifest().await {
            tracing::warn!(error = %e, "manifest unavailable, keeping cached catalog");
        }

        *initialized = true;
        Ok(())
    }

    /// Fetches the remote manifest and merges it into the catalog.
    ///
    /// On failure the error is recorded as the last error and returned; the catalog is left as
    /// it was.
    pub async fn refresh_manifest(&self) -> WebVmResult<()> {
        match self.fetch_manifest().await {
            Ok(manifest) => {
                *self.last_error.write().await = None;
                self.merge_manifest(&manifest).await;
                Ok(())
            }
            Err(e) => {
                *self.last_error.write().await = Some(e.report());
                Err(e)
            }
        }
    }

    /// Merges `manifest` into the catalog.
    ///
    /// Catalog fields of existing packages are overwritten while their status, install date,
    /// last use, install duration and error message are kept. Entries with an invalid id are
    /// skipped. Packages missing from the manifest stay in the catalog.
    pub async fn merge_manifest(&self, manifest: &RuntimeManifest) {
        let mut next = self.catalog.borrow().clone();
        for entry in &manifest.packages {
            if !is_valid_package_id(&entry.id) {
                tracing::warn!("skipping manifest entry with invalid id {:?}", entry.id);
                continue;
            }

            match next.iter_mut().find(|p| p.id == entry.id) {
                Some(existing) => entry.apply_to(existing),
                None => next.push(entry.to_package()),
            }
        }

        tracing::info!(
            "merged manifest {} ({} packages)",
            manifest.version,
            manifest.packages.len()
        );
        self.catalog.send_replace(next);
        self.persist().await;
    }

    /// Installs `id`, installing missing dependencies first unless `skip_dependencies` is set.
    ///
    /// Installing an already installed package succeeds with a warning. A package that conflicts
    /// with an installed one is rejected before any status change. On failure the package is
    /// left in the `error` state and the error is returned.
    pub async fn install_package(
        &self,
        id: &str,
        options: InstallOptions,
    ) -> WebVmResult<InstallResult> {
        let _guard = self.operation_lock.lock().await;
        let mut chain = Vec::new();
        self.install_recursive(id, options, &mut chain).await
    }

    /// Removes `id`.
    ///
    /// Removing a package that is neither installed nor left `error` or `removing` by an earlier
    /// attempt succeeds with a warning. Installed dependents block the removal unless `force` is
    /// set.
    pub async fn remove_package(
        &self,
        id: &str,
        options: RemoveOptions,
    ) -> WebVmResult<RemoveResult> {
        let _guard = self.operation_lock.lock().await;
        let started = Instant::now();
        let package = self.require_package(id)?;

        let removable = matches!(
            package.status,
            PackageStatus::Installed | PackageStatus::Error | PackageStatus::Removing
        );
        if !removable {
            return Ok(RemoveResult {
                success: true,
                package_id: id.to_string(),
                warnings: vec![format!("package {id} is not installed")],
                elapsed_ms: started.elapsed().as_millis() as u64,
                ..Default::default()
            });
        }

        let dependents = self.installed_dependents(id);
        let mut warnings = Vec::new();
        if !dependents.is_empty() {
            if !options.force {
                return Err(WebVmError::Conflict(format!(
                    "package {id} is required by {}",
                    dependents.join(", ")
                )));
            }
            warnings.push(format!(
                "removing {id} while {} depend on it",
                dependents.join(", ")
            ));
        }

        let package = self
            .update_package(id, |p| p.transition(PackageStatus::Removing))
            .await?;
        let mut operation = RuntimeOperation::new(id, OperationType::Remove);
        operation.start();
        operation.log(format!("removing {id}"));
        self.record_operation(&operation).await;

        match self.installer.remove_runtime_package(&package).await {
            Ok(result) => {
                self.update_package(id, |p| {
                    p.transition(PackageStatus::Available)?;
                    p.install_date = None;
                    p.last_used = None;
                    p.install_duration_ms = None;
                    p.error_message = None;
                    Ok(())
                })
                .await?;

                operation.extend_logs(result.logs.iter().cloned());
                operation.succeed();
                self.record_operation(&operation).await;
                tracing::info!("removed package {id}");

                warnings.extend(result.warnings);
                Ok(RemoveResult {
                    success: true,
                    package_id: id.to_string(),
                    warnings,
                    logs: operation.logs,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
            Err(e) => {
                self.mark_failed(id, &e).await;
                operation.fail(e.to_string());
                self.record_operation(&operation).await;
                tracing::error!(error = %e, "failed to remove package {id}");
                Err(e)
            }
        }
    }

    /// Returns the declared dependencies of `id`, in install order.
    pub fn resolve_dependencies(&self, id: &str) -> WebVmResult<Vec<String>> {
        Ok(self.require_package(id)?.dependencies)
    }

    /// Returns the whole catalog.
    pub fn get_available_packages(&self) -> Vec<RuntimePackage> {
        self.catalog.borrow().clone()
    }

    /// Returns the installed packages.
    pub fn get_installed_packages(&self) -> Vec<RuntimePackage> {
        self.catalog
            .borrow()
            .iter()
            .filter(|p| p.is_installed())
            .cloned()
            .collect()
    }

    /// Returns the package `id`, if it is in the catalog.
    pub fn get_package(&self, id: &str) -> Option<RuntimePackage> {
        self.catalog.borrow().iter().find(|p| p.id == id).cloned()
    }

    /// Returns the last manifest failure, cleared by the next successful fetch.
    pub async fn get_last_error(&self) -> Option<ErrorReport> {
        self.last_error.read().await.clone()
    }

    /// Returns recent operations, oldest first.
    pub async fn get_operations(&self) -> Vec<RuntimeOperation> {
        self.operations.read().await.iter().cloned().collect()
    }

    /// Subscribes to operation updates. Every change of an operation is sent.
    pub fn subscribe_operations(&self) -> broadcast::Receiver<RuntimeOperation> {
        self.events.subscribe()
    }

    /// Subscribes to catalog changes.
    pub fn subscribe_catalog(&self) -> watch::Receiver<Vec<RuntimePackage>> {
        self.catalog.subscribe()
    }

    #[async_recursion]
    async fn install_recursive(
        &self,
        id: &str,
        options: InstallOptions,
        chain: &mut Vec<String>,
    ) -> WebVmResult<InstallResult> {
        let started = Instant::now();
        let package = self.require_package(id)?;

        if package.is_installed() {
            return Ok(InstallResult {
                success: true,
                package_id: id.to_string(),
                warnings: vec![format!("package {id} is already installed")],
                elapsed_ms: started.elapsed().as_millis() as u64,
                ..Default::default()
            });
        }

        if chain.iter().any(|c| c == id) {
            return Err(WebVmError::Conflict(format!(
                "dependency cycle: {} -> {id}",
                chain.join(" -> ")
            )));
        }

        self.check_conflicts(&package)?;

        let mut dependencies_installed = Vec::new();
        let mut warnings = Vec::new();
        let mut logs = Vec::new();

        for dependency in &package.dependencies {
            let installed = self
                .get_package(dependency)
                .is_some_and(|p| p.is_installed());
            if installed {
                continue;
            }

            if options.skip_dependencies {
                warnings.push(format!("dependency {dependency} is not installed"));
                continue;
            }

            chain.push(id.to_string());
            let result = self.install_recursive(dependency, options, chain).await;
            chain.pop();

            let result = result?;
            dependencies_installed.extend(result.installed_packages);
            warnings.extend(result.warnings);
            logs.extend(result.logs);
        }

        let package = self
            .update_package(id, |p| p.transition(PackageStatus::Installing))
            .await?;
        let mut operation = RuntimeOperation::new(id, OperationType::Install);
        operation.start();
        operation.log(format!("installing {id} {}", package.version));
        self.record_operation(&operation).await;

        let outcome = self.installer.install_runtime_package(&package, &options).await;
        let outcome = match outcome {
            Ok(result) if !result.success => Err(WebVmError::custom(anyhow::anyhow!(
                "installer reported failure for {id}"
            ))),
            other => other,
        };

        match outcome {
            Ok(result) => {
                let duration = started.elapsed().as_millis() as u64;
                self.update_package(id, |p| {
                    p.transition(PackageStatus::Installed)?;
                    p.install_date = Some(Utc::now());
                    p.install_duration_ms = Some(duration);
                    p.error_message = None;
                    Ok(())
                })
                .await?;

                operation.extend_logs(result.logs.iter().cloned());
                operation.succeed();
                self.record_operation(&operation).await;
                tracing::info!("installed package {id} in {duration}ms");

                logs.extend(operation.logs);
                warnings.extend(result.warnings);

                let mut installed_packages = vec![id.to_string()];
                installed_packages.extend(dependencies_installed);

                Ok(InstallResult {
                    success: true,
                    package_id: id.to_string(),
                    installed_packages,
                    warnings,
                    logs,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
            Err(e) => {
                self.mark_failed(id, &e).await;
                operation.fail(e.to_string());
                self.record_operation(&operation).await;
                tracing::error!(error = %e, "failed to install package {id}");
                Err(e)
            }
        }
    }

    async fn fetch_manifest(&self) -> WebVmResult<RuntimeManifest> {
        let url = self.config.manifest_url()?;
        let bytes = self.remote.fetch_bytes(&url).await?;
        RuntimeManifest::from_slice(&bytes)
    }

    fn require_package(&self, id: &str) -> WebVmResult<RuntimePackage> {
        self.get_package(id)
            .ok_or_else(|| WebVmError::package_not_found(id))
    }

    fn check_conflicts(&self, package: &RuntimePackage) -> WebVmResult<()> {
        let catalog = self.catalog.borrow();
        let conflicting = catalog.iter().filter(|p| p.is_installed()).find(|p| {
            package.conflicts.contains(&p.id) || p.conflicts.contains(&package.id)
        });

        match conflicting {
            Some(other) => Err(WebVmError::Conflict(format!(
                "package {} conflicts with installed package {}",
                package.id, other.id
            ))),
            None => Ok(()),
        }
    }

    fn installed_dependents(&self, id: &str) -> Vec<String> {
        self.catalog
            .borrow()
            .iter()
            .filter(|p| p.is_installed() && p.dependencies.iter().any(|d| d == id))
            .map(|p| p.id.clone())
            .collect()
    }

    /// Applies `change` to a copy of the package and swaps it in if the change succeeds.
    async fn update_package<F>(&self, id: &str, change: F) -> WebVmResult<RuntimePackage>
    where
        F: FnOnce(&mut RuntimePackage) -> WebVmResult<()>,
    {
        let mut outcome = Err(WebVmError::package_not_found(id));
        self.catalog.send_if_modified(|packages| {
            let Some(slot) = packages.iter_mut().find(|p| p.id == id) else {
                return false;
            };

            let mut next = slot.clone();
            match change(&mut next) {
                Ok(()) => {
                    *slot = next.clone();
                    outcome = Ok(next);
                    true
                }
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });

        let package = outcome?;
        self.persist().await;
        Ok(package)
    }

    async fn mark_failed(&self, id: &str, error: &WebVmError) {
        let message = error.to_string();
        let result = self
            .update_package(id, |p| {
                p.transition(PackageStatus::Error)?;
                p.error_message = Some(message);
                Ok(())
            })
            .await;

        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to record error state of package {id}");
        }
    }

    async fn record_operation(&self, operation: &RuntimeOperation) {
        {
            let mut operations = self.operations.write().await;
            match operations.iter_mut().find(|o| o.id == operation.id) {
                Some(existing) => *existing = operation.clone(),
                None => operations.push_back(operation.clone()),
            }

            let limit = *self.config.get_operation_history_limit();
            while operations.len() > limit {
                match operations.iter().position(|o| !o.is_open()) {
                    Some(index) => {
                        operations.remove(index);
                    }
                    None => break,
                }
            }
        }

        let _ = self.events.send(operation.clone());
    }

    async fn persist(&self) {
        let snapshot = self.catalog.borrow().clone();
        if let Err(e) = self.persistence.save_packages(&snapshot).await {
            tracing::warn!(error = %e, "failed to persist package catalog");
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use crate::{
        persistence::MemoryPersistence, remote::MemorySource, OperationStatus, PackageCategory,
    };

    use super::*;

    const MANIFEST_URL: &str = "http://127.0.0.1:5173/runtime-packages/index.json";

    #[derive(Default)]
    struct RecordingInstaller {
        installs: StdMutex<Vec<String>>,
        removals: StdMutex<Vec<String>>,
        failing: StdMutex<Vec<String>>,
        failing_removals: StdMutex<Vec<String>>,
        catalog: StdMutex<Option<watch::Receiver<Vec<RuntimePackage>>>>,
        dependency_states: StdMutex<Vec<(String, String, Option<PackageStatus>)>>,
    }

    #[async_trait]
    impl RuntimeInstaller for RecordingInstaller {
        async fn install_runtime_package(
            &self,
            package: &RuntimePackage,
            _options: &InstallOptions,
        ) -> WebVmResult<InstallResult> {
            self.installs.lock().unwrap().push(package.id.clone());
            if let Some(catalog) = self.catalog.lock().unwrap().as_ref() {
                let catalog = catalog.borrow();
                for dependency in &package.dependencies {
                    let status = catalog
                        .iter()
                        .find(|p| &p.id == dependency)
                        .map(|p| p.status);
                    self.dependency_states.lock().unwrap().push((
                        package.id.clone(),
                        dependency.clone(),
                        status,
                    ));
                }
            }
            if self.failing.lock().unwrap().contains(&package.id) {
                return Err(WebVmError::Network("bundle fetch failed".into()));
            }

            Ok(InstallResult {
                success: true,
                package_id: package.id.clone(),
                logs: vec![format!("extracted {}", package.id)],
                ..Default::default()
            })
        }

        async fn remove_runtime_package(
            &self,
            package: &RuntimePackage,
        ) -> WebVmResult<RemoveResult> {
            self.removals.lock().unwrap().push(package.id.clone());
            if self.failing_removals.lock().unwrap().contains(&package.id) {
                return Err(WebVmError::Network("virtual machine went away".into()));
            }

            Ok(RemoveResult {
                success: true,
                package_id: package.id.clone(),
                ..Default::default()
            })
        }
    }

    fn manifest_json() -> &'static str {
        r#"{
            "version": "1",
            "packages": [
                {"id": "nginx", "name": "nginx", "category": "web-server", "version": "1.25.0"},
                {"id": "nodejs", "name": "Node.js", "category": "runtime", "version": "20.0.0",
                 "dependencies": ["nginx"]},
                {"id": "apache", "name": "Apache", "category": "web-server", "version": "2.4.0",
                 "conflicts": ["nginx"]},
                {"id": "Bad Id", "name": "bad", "category": "tool", "version": "0"}
            ]
        }"#
    }

    async fn setup() -> anyhow::Result<(
        RuntimeRepository,
        Arc<RecordingInstaller>,
        Arc<MemorySource>,
        Arc<MemoryPersistence>,
    )> {
        let source = Arc::new(MemorySource::new());
        source.insert(MANIFEST_URL, manifest_json()).await;
        let persistence = Arc::new(MemoryPersistence::new());
        let installer = Arc::new(RecordingInstaller::default());

        let repository = RuntimeRepository::new(
            WebVmConfig::default(),
            source.clone(),
            persistence.clone(),
            installer.clone(),
        );
        repository.initialize().await?;
        *installer.catalog.lock().unwrap() = Some(repository.subscribe_catalog());

        Ok((repository, installer, source, persistence))
    }

    #[test_log::test(tokio::test)]
    async fn test_initialize_fetches_manifest_once() -> anyhow::Result<()> {
        let (repository, _, source, _) = setup().await?;
        repository.initialize().await?;

        assert_eq!(source.request_count(MANIFEST_URL).await, 1);
        let ids: Vec<_> = repository
            .get_available_packages()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["nginx", "nodejs", "apache"]);
        assert_eq!(
            repository.get_package("nginx").map(|p| p.category),
            Some(PackageCategory::WebServer)
        );

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_install_resolves_dependencies_in_order() -> anyhow::Result<()> {
        let (repository, installer, _, persistence) = setup().await?;

        let result = repository
            .install_package("nodejs", InstallOptions::default())
            .await?;

        assert!(result.success);
        assert_eq!(result.installed_packages, vec!["nodejs", "nginx"]);
        assert_eq!(*installer.installs.lock().unwrap(), vec!["nginx", "nodejs"]);
        assert_eq!(
            *installer.dependency_states.lock().unwrap(),
            vec![(
                "nodejs".to_string(),
                "nginx".to_string(),
                Some(PackageStatus::Installed)
            )]
        );

        let node = repository.get_package("nodejs").unwrap();
        assert_eq!(node.status, PackageStatus::Installed);
        assert!(node.install_date.is_some());
        assert!(node.install_duration_ms.is_some());

        let persisted = persistence.load_packages().await?.unwrap();
        assert!(persisted.iter().all(|p| p.id == "apache" || p.is_installed()));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_install_already_installed_is_a_warning() -> anyhow::Result<()> {
        let (repository, installer, _, _) = setup().await?;

        repository
            .install_package("nginx", InstallOptions::default())
            .await?;
        let again = repository
            .install_package("nginx", InstallOptions::default())
            .await?;

        assert!(again.success);
        assert!(again.installed_packages.is_empty());
        assert!(again.warnings[0].contains("already installed"));
        assert_eq!(installer.installs.lock().unwrap().len(), 1);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_install_skipping_dependencies_warns() -> anyhow::Result<()> {
        let (repository, installer, _, _) = setup().await?;

        let result = repository
            .install_package(
                "nodejs",
                InstallOptions {
                    skip_dependencies: true,
                },
            )
            .await?;

        assert_eq!(result.installed_packages, vec!["nodejs"]);
        assert!(result.warnings.iter().any(|w| w.contains("nginx")));
        assert_eq!(*installer.installs.lock().unwrap(), vec!["nodejs"]);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_install_failure_marks_error_and_records_operation() -> anyhow::Result<()> {
        let (repository, installer, _, _) = setup().await?;
        installer.failing.lock().unwrap().push("nginx".into());
        let mut events = repository.subscribe_operations();

        let err = repository
            .install_package("nginx", InstallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WebVmError::Network(_)));

        let nginx = repository.get_package("nginx").unwrap();
        assert_eq!(nginx.status, PackageStatus::Error);
        assert!(nginx.error_message.unwrap().contains("bundle fetch failed"));

        let running = events.recv().await?;
        assert_eq!(running.status, OperationStatus::Running);
        let failed = events.recv().await?;
        assert_eq!(failed.status, OperationStatus::Failed);
        assert_eq!(failed.id, running.id);

        let operations = repository.get_operations().await;
        assert_eq!(operations.len(), 1);
        assert_eq!(operations[0].status, OperationStatus::Failed);

        installer.failing.lock().unwrap().clear();
        repository
            .install_package("nginx", InstallOptions::default())
            .await?;
        assert!(repository.get_package("nginx").unwrap().is_installed());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_install_rejects_conflicts_before_transition() -> anyhow::Result<()> {
        let (repository, installer, _, _) = setup().await?;
        repository
            .install_package("nginx", InstallOptions::default())
            .await?;

        let err = repository
            .install_package("apache", InstallOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, WebVmError::Conflict(_)));
        assert_eq!(
            repository.get_package("apache").unwrap().status,
            PackageStatus::Available
        );
        assert_eq!(*installer.installs.lock().unwrap(), vec!["nginx"]);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_install_unknown_package_is_not_found() -> anyhow::Result<()> {
        let (repository, _, _, _) = setup().await?;

        let err = repository
            .install_package("ruby", InstallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WebVmError::NotFound { kind: "package", .. }));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_remove_respects_dependents() -> anyhow::Result<()> {
        let (repository, installer, _, _) = setup().await?;
        repository
            .install_package("nodejs", InstallOptions::default())
            .await?;

        let err = repository
            .remove_package("nginx", RemoveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WebVmError::Conflict(_)));

        let result = repository
            .remove_package("nginx", RemoveOptions { force: true })
            .await?;
        assert!(result.success);
        assert!(!result.warnings.is_empty());

        let nginx = repository.get_package("nginx").unwrap();
        assert_eq!(nginx.status, PackageStatus::Available);
        assert!(nginx.install_date.is_none());
        assert_eq!(*installer.removals.lock().unwrap(), vec!["nginx"]);

        let noop = repository
            .remove_package("nginx", RemoveOptions::default())
            .await?;
        assert!(noop.success);
        assert_eq!(installer.removals.lock().unwrap().len(), 1);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_merge_preserves_runtime_fields() -> anyhow::Result<()> {
        let (repository, _, _, _) = setup().await?;
        repository
            .install_package("nginx", InstallOptions::default())
            .await?;
        let before = repository.get_package("nginx").unwrap();

        let mut manifest = RuntimeManifest::from_slice(manifest_json().as_bytes())?;
        manifest.packages[0].version = "1.27.0".into();
        repository.merge_manifest(&manifest).await;

        let after = repository.get_package("nginx").unwrap();
        assert_eq!(after.version, "1.27.0");
        assert_eq!(after.status, PackageStatus::Installed);
        assert_eq!(after.install_date, before.install_date);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_refresh_failure_keeps_catalog() -> anyhow::Result<()> {
        let (repository, _, source, _) = setup().await?;
        let before = repository.get_available_packages();

        source.fail(MANIFEST_URL, "connection refused").await;
        assert!(repository.refresh_manifest().await.is_err());

        let report = repository.get_last_error().await.unwrap();
        assert!(report.message.contains("connection refused"));
        assert_eq!(repository.get_available_packages(), before);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_initialize_hydrates_from_persistence() -> anyhow::Result<()> {
        let persistence = Arc::new(MemoryPersistence::new());
        persistence
            .save_packages(&[RuntimePackage {
                id: "python".into(),
                name: "Python".into(),
                status: PackageStatus::Installed,
                ..Default::default()
            }])
            .await?;

        let repository = RuntimeRepository::new(
            WebVmConfig::default(),
            Arc::new(MemorySource::new()),
            persistence,
            Arc::new(RecordingInstaller::default()),
        );
        repository.initialize().await?;

        assert!(repository.get_package("python").unwrap().is_installed());
        assert!(repository.get_last_error().await.is_some());
        assert_eq!(repository.resolve_dependencies("python")?, Vec::<String>::new());

        Ok(())
    }

    async fn setup_with_persisted(
        status: PackageStatus,
    ) -> anyhow::Result<(RuntimeRepository, Arc<RecordingInstaller>)> {
        let source = Arc::new(MemorySource::new());
        source.insert(MANIFEST_URL, manifest_json()).await;
        let persistence = Arc::new(MemoryPersistence::new());
        persistence
            .save_packages(&[RuntimePackage {
                id: "nginx".into(),
                name: "nginx".into(),
                version: "1.25.0".into(),
                status,
                ..Default::default()
            }])
            .await?;

        let installer = Arc::new(RecordingInstaller::default());
        let repository = RuntimeRepository::new(
            WebVmConfig::default(),
            source,
            persistence,
            installer.clone(),
        );
        repository.initialize().await?;

        Ok((repository, installer))
    }

    #[test_log::test(tokio::test)]
    async fn test_install_resumes_interrupted_install() -> anyhow::Result<()> {
        let (repository, installer) = setup_with_persisted(PackageStatus::Installing).await?;
        assert_eq!(
            repository.get_package("nginx").map(|p| p.status),
            Some(PackageStatus::Installing)
        );

        let result = repository
            .install_package("nginx", InstallOptions::default())
            .await?;

        assert!(result.success);
        assert_eq!(result.installed_packages, vec!["nginx"]);
        assert!(repository.get_package("nginx").unwrap().is_installed());
        assert_eq!(*installer.installs.lock().unwrap(), vec!["nginx"]);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_remove_resumes_interrupted_removal() -> anyhow::Result<()> {
        let (repository, installer) = setup_with_persisted(PackageStatus::Removing).await?;

        let result = repository
            .remove_package("nginx", RemoveOptions::default())
            .await?;

        assert!(result.success);
        assert_eq!(
            repository.get_package("nginx").map(|p| p.status),
            Some(PackageStatus::Available)
        );
        assert_eq!(*installer.removals.lock().unwrap(), vec!["nginx"]);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_remove_retries_after_failure() -> anyhow::Result<()> {
        let (repository, installer, _, _) = setup().await?;
        repository
            .install_package("nginx", InstallOptions::default())
            .await?;

        installer.failing_removals.lock().unwrap().push("nginx".into());
        let err = repository
            .remove_package("nginx", RemoveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WebVmError::Network(_)));
        assert_eq!(
            repository.get_package("nginx").map(|p| p.status),
            Some(PackageStatus::Error)
        );

        installer.failing_removals.lock().unwrap().clear();
        let result = repository
            .remove_package("nginx", RemoveOptions::default())
            .await?;

        assert!(result.success);
        assert!(result.warnings.is_empty());
        let nginx = repository.get_package("nginx").unwrap();
        assert_eq!(nginx.status, PackageStatus::Available);
        assert!(nginx.error_message.is_none());
        assert_eq!(installer.removals.lock().unwrap().len(), 2);

        Ok(())
    }
}
