use std::sync::Arc;

use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use webvmfs::{MemoryFileStore, ScopedFileStore};

use crate::{
    bridge::VmBridge,
    config::WebVmConfig,
    lifecycle::WebVmManager,
    packages::RuntimeRepository,
    persistence::{MemoryPersistence, StatePersistence},
    remote::{HttpSource, RemoteSource},
    Application, RuntimePackage, WebVmResult, WebVmStatus,
};

use super::{AppServer, AppServerSnapshot};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Builder for an [`AppServer`].
///
/// Collaborators that are not set default to an empty bridge, in-memory file and state stores and
/// an HTTP remote.
#[derive(Default)]
pub struct AppServerBuilder {
    config: Option<WebVmConfig>,
    bridge: Option<Arc<VmBridge>>,
    files: Option<Arc<dyn ScopedFileStore>>,
    persistence: Option<Arc<dyn StatePersistence>>,
    remote: Option<Arc<dyn RemoteSource>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AppServerBuilder {
    /// Sets the configuration.
    pub fn config(mut self, config: WebVmConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the bridge to the virtual machine.
    pub fn bridge(mut self, bridge: Arc<VmBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Sets the file store mirroring the virtual filesystem.
    pub fn files(mut self, files: Arc<dyn ScopedFileStore>) -> Self {
        self.files = Some(files);
        self
    }

    /// Sets where state is persisted.
    pub fn persistence(mut self, persistence: Arc<dyn StatePersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Sets where manifests and bundles are fetched from.
    pub fn remote(mut self, remote: Arc<dyn RemoteSource>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Builds the server.
    ///
    /// Restores the persisted machine status and applications, initializes the package
    /// repository and starts the background tasks.
    pub async fn build(self) -> WebVmResult<AppServer> {
        let config = self.config.unwrap_or_default();
        let bridge = self.bridge.unwrap_or_default();
        let files: Arc<dyn ScopedFileStore> = match self.files {
            Some(files) => files,
            None => Arc::new(MemoryFileStore::new()),
        };
        let persistence: Arc<dyn StatePersistence> = match self.persistence {
            Some(persistence) => persistence,
            None => Arc::new(MemoryPersistence::new()),
        };
        let remote: Arc<dyn RemoteSource> = match self.remote {
            Some(remote) => remote,
            None => Arc::new(HttpSource::new()),
        };

        let manager = Arc::new(WebVmManager::new(
            config.clone(),
            bridge,
            files.clone(),
            persistence.clone(),
            remote.clone(),
        ));
        manager.restore_status().await;

        let repository = Arc::new(RuntimeRepository::new(
            config.clone(),
            remote,
            persistence.clone(),
            manager.clone(),
        ));
        repository.initialize().await?;

        let applications = match persistence.load_applications().await {
            Ok(applications) => applications.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to load persisted applications");
                Vec::new()
            }
        };
        let (applications, _) = watch::channel(applications);

        let snapshot = Arc::new(watch::channel(AppServerSnapshot::default()).0);
        let forwarder = spawn_snapshot_forwarder(
            snapshot.clone(),
            manager.subscribe(),
            repository.subscribe_catalog(),
            applications.subscribe(),
        );
        let maintenance = manager.handler().spawn_maintenance();

        Ok(AppServer {
            config,
            manager,
            repository,
            files,
            persistence,
            applications,
            snapshot,
            app_lock: Mutex::new(()),
            tasks: vec![forwarder, maintenance],
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Republishes a snapshot whenever the status, the catalog or the applications change.
///
/// Stops once any of the sources is dropped.
fn spawn_snapshot_forwarder(
    snapshot: Arc<watch::Sender<AppServerSnapshot>>,
    mut vm: watch::Receiver<WebVmStatus>,
    mut packages: watch::Receiver<Vec<RuntimePackage>>,
    mut applications: watch::Receiver<Vec<Application>>,
) -> JoinHandle<()> {
    let publish = move |vm: &watch::Receiver<WebVmStatus>,
                        packages: &watch::Receiver<Vec<RuntimePackage>>,
                        applications: &watch::Receiver<Vec<Application>>| {
        let next = AppServerSnapshot {
            vm: vm.borrow().clone(),
            packages: packages.borrow().clone(),
            applications: applications.borrow().clone(),
        };
        snapshot.send_replace(next);
    };

    publish(&vm, &packages, &applications);

    tokio::spawn(async move {
        loop {
            let changed = tokio::select! {
                r = vm.changed() => r,
                r = packages.changed() => r,
                r = applications.changed() => r,
            };

            if changed.is_err() {
                tracing::debug!("snapshot source closed, stopping forwarder");
                break;
            }

            publish(&vm, &packages, &applications);
        }
    })
}

