use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::{
    sync::{watch, Mutex},
    time::Instant,
};
use tracing::{debug, info, warn};
use webvmfs::ScopedFileStore;

use crate::{
    archive::parse_tar,
    bridge::{ExecOutput, VmBridge, VmRequest, VmResponse},
    config::WebVmConfig,
    packages::RuntimeInstaller,
    persistence::StatePersistence,
    remote::RemoteSource,
    resilience::{ErrorHandler, OperationContext},
    utils::{
        app_root, format_size, is_executable_path, runtime_bundle_path, runtime_root,
        runtime_scope, sanitize_relative_path, BUNDLE_FILENAME,
    },
    Application, InstallOptions, InstallResult, RemoveResult, RuntimePackage, VmState, WebVmError,
    WebVmResult, WebVmStatus,
};

use super::{
    shell_args, start_static_server_command, stop_static_server_command, ProxyOutcome,
    ProxyRequest,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The breaker key shared by commands executed inside the virtual machine.
pub const EXEC_BREAKER_KEY: &str = "vm.exec";

/// The breaker key shared by file writes into the virtual machine.
pub const WRITE_BREAKER_KEY: &str = "vm.write_file";

/// The breaker key shared by requests proxied into the virtual machine.
pub const FETCH_BREAKER_KEY: &str = "vm.fetch";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Drives the virtual machine lifecycle and performs runtime installs and static application
/// processes on top of the [`VmBridge`].
///
/// Every bridge call made here goes through the [`ErrorHandler`]. Only the bundle download of an
/// install is essential; the remaining install steps are advisory and degrade to a logged warning
/// when they fail or when no virtual machine is registered.
pub struct WebVmManager {
    /// The server configuration.
    config: WebVmConfig,

    /// The bridge to the virtual machine.
    bridge: Arc<VmBridge>,

    /// The browser-side mirror of the virtual filesystem.
    files: Arc<dyn ScopedFileStore>,

    /// Where status and bundles are persisted.
    persistence: Arc<dyn StatePersistence>,

    /// Where bundles are downloaded from.
    remote: Arc<dyn RemoteSource>,

    /// Retry, breaker and timeout policies for bridge calls.
    handler: Arc<ErrorHandler>,

    /// The current status.
    status: watch::Sender<WebVmStatus>,

    /// Serializes boots and wakes.
    boot_lock: Mutex<()>,
}

/// The log trail of an install or removal.
#[derive(Debug, Default)]
struct StepLog {
    logs: Vec<String>,
    warnings: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WebVmManager {
    /// Creates a manager in the `unloaded` state.
    pub fn new(
        config: WebVmConfig,
        bridge: Arc<VmBridge>,
        files: Arc<dyn ScopedFileStore>,
        persistence: Arc<dyn StatePersistence>,
        remote: Arc<dyn RemoteSource>,
    ) -> Self {
        let handler = Arc::new(ErrorHandler::new(config.get_resilience().clone()));
        let (status, _) = watch::channel(WebVmStatus::default());

        Self {
            config,
            bridge,
            files,
            persistence,
            remote,
            handler,
            status,
            boot_lock: Mutex::new(()),
        }
    }

    /// Returns the bridge.
    pub fn bridge(&self) -> &Arc<VmBridge> {
        &self.bridge
    }

    /// Returns the error handler wrapping bridge calls.
    pub fn handler(&self) -> &Arc<ErrorHandler> {
        &self.handler
    }

    /// Returns the current status.
    pub fn status(&self) -> WebVmStatus {
        self.status.borrow().clone()
    }

    /// Subscribes to status changes.
    pub fn subscribe(&self) -> watch::Receiver<WebVmStatus> {
        self.status.subscribe()
    }

    /// Returns `true` if the machine is ready.
    pub fn is_ready(&self) -> bool {
        self.status.borrow().state == VmState::Ready
    }

    /// Restores the persisted status.
    ///
    /// A boot never survives a restart, so `loading` and `booting` come back as `unloaded`.
    pub async fn restore_status(&self) {
        let mut status = match self.persistence.load_vm_status().await {
            Ok(Some(status)) => status,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "failed to load persisted virtual machine status");
                return;
            }
        };

        if status.state.is_starting() {
            debug!("persisted state {} reset to unloaded", status.state);
            status.state = VmState::Unloaded;
            status.load_progress = 0;
        }

        self.status.send_replace(status);
    }

    /// Applies `change` to the status and persists the result.
    pub async fn update_status(&self, change: impl FnOnce(&mut WebVmStatus)) -> WebVmStatus {
        self.status.send_modify(change);
        let snapshot = self.status();
        if let Err(e) = self.persistence.save_vm_status(&snapshot).await {
            warn!(error = %e, "failed to persist virtual machine status");
        }

        snapshot
    }

    /// Brings the machine to `ready`.
    ///
    /// A ready machine is left alone, a hibernating one is woken quickly and anything else runs
    /// the staged boot. Concurrent callers wait for the boot in progress.
    pub async fn initialize(&self) -> WebVmResult<()> {
        let _boot = self.boot_lock.lock().await;

        let state = self.status.borrow().state;
        match state {
            VmState::Ready | VmState::Loading | VmState::Booting => return Ok(()),
            _ => {}
        }

        if state == VmState::Hibernating {
            info!("waking virtual machine");
            self.update_status(|s| s.state = VmState::Booting).await;
            tokio::time::sleep(*self.config.get_wake_delay()).await;
            self.mark_ready().await;
            return Ok(());
        }

        info!("booting virtual machine");
        self.update_status(|s| {
            s.state = VmState::Loading;
            s.load_progress = 0;
            s.error_message = None;
        })
        .await;

        let steps = u32::from(*self.config.get_boot_steps());
        for step in 1..=steps {
            tokio::time::sleep(*self.config.get_boot_step_delay()).await;
            let progress = (step * 100 / (steps + 1)) as u8;
            self.update_status(|s| s.load_progress = progress).await;
        }

        self.update_status(|s| s.state = VmState::Booting).await;
        self.mark_ready().await;
        Ok(())
    }

    /// Moves the machine to `hibernating`, clearing running applications and resource usage.
    pub async fn stop(&self) {
        let _boot = self.boot_lock.lock().await;
        info!("hibernating virtual machine");
        self.update_status(|s| {
            s.state = VmState::Hibernating;
            s.running_apps.clear();
            s.system_resources = Default::default();
        })
        .await;
    }

    /// Re-runs the `booting -> ready` transition regardless of the current state.
    pub async fn restart(&self) {
        let _boot = self.boot_lock.lock().await;
        info!("restarting virtual machine");
        self.update_status(|s| s.state = VmState::Booting).await;
        tokio::time::sleep(*self.config.get_wake_delay()).await;
        self.mark_ready().await;
    }

    /// Starts the static file server of `app` on `port`.
    ///
    /// Without a virtual machine this only logs a warning; the application is still reported as
    /// running.
    pub async fn start_static_application(&self, app: &Application, port: u16) -> WebVmResult<()> {
        if !self.bridge.is_available() {
            warn!(
                "virtual machine unavailable, {} runs without a server process",
                app.name
            );
            self.set_app_running(&app.id, true).await;
            return Ok(());
        }

        self.initialize().await?;
        self.bridge.ensure_directory(&app_root(&app.id)).await;

        let script = start_static_server_command(port, &app.deploy_path, &app.logs_path, &app.pid_file);
        self.exec_guarded("start static server", "sh", &shell_args(script))
            .await?;

        info!("started {} on port {port}", app.name);
        self.set_app_running(&app.id, true).await;
        Ok(())
    }

    /// Stops the static file server of `app`.
    ///
    /// Without a virtual machine this only logs a warning.
    pub async fn stop_static_application(&self, app: &Application) -> WebVmResult<()> {
        if !self.bridge.is_available() {
            warn!("virtual machine unavailable, nothing to stop for {}", app.name);
            self.set_app_running(&app.id, false).await;
            return Ok(());
        }

        let script = stop_static_server_command(&app.pid_file);
        let context = OperationContext::builder()
            .operation("stop static server")
            .key(EXEC_BREAKER_KEY)
            .build();
        let bridge = &self.bridge;
        let args = &shell_args(script);
        let output = self
            .handler
            .execute(&context, move || bridge.exec("sh", args))
            .await?;

        if !output.success() {
            warn!(
                "stopping {} exited with status {}: {}",
                app.name, output.exit_code, output.stderr
            );
        }

        info!("stopped {}", app.name);
        self.set_app_running(&app.id, false).await;
        Ok(())
    }

    /// Forwards a request to the static file server of `app`.
    ///
    /// Returns [`ProxyOutcome::Unavailable`] if there is no virtual machine or the application
    /// has no port. Server errors are reported as [`ProxyOutcome::Failed`].
    pub async fn proxy_static_application(
        &self,
        app: &Application,
        relative_path: &str,
        request: ProxyRequest,
    ) -> ProxyOutcome {
        let Some(port) = app.port else {
            return ProxyOutcome::Unavailable;
        };
        if !self.bridge.is_available() {
            return ProxyOutcome::Unavailable;
        }

        let body = request.forwards_body().then(|| request.body.clone());
        let forwarded = VmRequest {
            method: request.method,
            url: format!(
                "http://127.0.0.1:{port}/{}",
                relative_path.trim_start_matches('/')
            ),
            headers: request.headers,
            body,
        };

        let context = OperationContext::builder()
            .operation(format!("proxy {}", app.name))
            .key(FETCH_BREAKER_KEY)
            .build();
        let bridge = &self.bridge;
        let forwarded = &forwarded;
        let result = self
            .handler
            .execute(&context, move || async move {
                let response = bridge.fetch(forwarded.clone()).await?;
                check_proxy_status(port, response)
            })
            .await;

        match result {
            Ok(response) => ProxyOutcome::Response(response),
            Err(e) => {
                warn!(error = %e, "proxy to {} failed", app.name);
                ProxyOutcome::Failed(e)
            }
        }
    }

    async fn mark_ready(&self) {
        self.update_status(|s| {
            s.state = VmState::Ready;
            s.load_progress = 100;
            s.boot_time = Some(Utc::now());
            s.error_message = None;
        })
        .await;
        info!("virtual machine ready");
    }

    async fn set_app_running(&self, app_id: &str, running: bool) {
        self.update_status(|s| {
            if running {
                s.running_apps.insert(app_id.to_string());
            } else {
                s.running_apps.remove(app_id);
            }
        })
        .await;
    }

    async fn exec_guarded(
        &self,
        operation: &str,
        command: &str,
        args: &[String],
    ) -> WebVmResult<ExecOutput> {
        let context = OperationContext::builder()
            .operation(operation)
            .key(EXEC_BREAKER_KEY)
            .build();
        let bridge = &self.bridge;
        self.handler
            .execute(&context, move || bridge.exec_checked(command, args))
            .await
    }

    /// Writes a file into the virtual machine, retrying transient failures.
    pub async fn write_vm_file(&self, path: &str, data: &Bytes) -> WebVmResult<()> {
        let context = OperationContext::builder()
            .operation(format!("write {path}"))
            .key(WRITE_BREAKER_KEY)
            .retry(true)
            .build();
        let bridge = &self.bridge;
        self.handler
            .execute(&context, move || bridge.write_file(path, data.clone()))
            .await
    }

    /// Mirrors the bundle into the file store and, when possible, stages and extracts it inside
    /// the virtual machine.
    async fn stage_bundle(&self, package: &RuntimePackage, bundle: Bytes, log: &mut StepLog) {
        let id = &package.id;
        let root = runtime_root(id);
        let scope = runtime_scope(id);
        let vm = self.bridge.is_available();

        if let Err(e) = self.persistence.save_bundle(id, bundle.clone()).await {
            log.warn(format!("failed to persist bundle: {e}"));
        }
        if let Err(e) = self.files.write(&scope, BUNDLE_FILENAME, bundle.clone()).await {
            log.warn(format!("failed to store bundle: {e}"));
        }

        let entries = match parse_tar(&bundle) {
            Ok(entries) => entries,
            Err(e) => {
                log.warn(format!("failed to read bundle: {e}"));
                Vec::new()
            }
        };

        // Directories first, so staged writes have somewhere to land
        let mut directories = BTreeSet::from([root.clone()]);
        let mut files = Vec::new();
        for entry in entries {
            let Some(relative) = sanitize_relative_path(&entry.name) else {
                log.warn(format!("skipped unsafe entry {}", entry.name));
                continue;
            };

            if entry.is_dir() {
                directories.insert(format!("{root}/{relative}"));
                continue;
            }

            if let Some((parent, _)) = relative.rsplit_once('/') {
                directories.insert(format!("{root}/{parent}"));
            }
            files.push((relative, entry.data));
        }

        if vm {
            for directory in &directories {
                if !self.bridge.ensure_directory(directory).await {
                    log.warn(format!("could not create {directory}"));
                }
            }
        }

        let mut executables = Vec::new();
        for (relative, data) in &files {
            if let Err(e) = self.files.write(&scope, relative, data.clone()).await {
                log.warn(format!("failed to mirror {relative}: {e}"));
            }

            let path = format!("{root}/{relative}");
            if vm {
                if let Err(e) = self.write_vm_file(&path, data).await {
                    log.warn(format!("failed to stage {path}: {e}"));
                }
            }
            if is_executable_path(relative) {
                executables.push(path);
            }
        }
        log.info(format!("extracted {} file(s) to {root}", files.len()));

        if !vm {
            log.warn("virtual machine unavailable, skipped native extraction");
            return;
        }

        let bundle_path = runtime_bundle_path(id);
        if let Err(e) = self.write_vm_file(&bundle_path, &bundle).await {
            log.warn(format!("failed to stage bundle: {e}"));
        }

        let tar_args = vec!["-xf".to_string(), bundle_path, "-C".to_string(), root];
        match self.exec_guarded("extract bundle", "tar", &tar_args).await {
            Ok(_) => log.info("native extraction complete"),
            Err(e) => log.warn(format!("native extraction failed: {e}")),
        }

        for path in executables {
            let args = vec!["+x".to_string(), path];
            if let Err(e) = self.exec_guarded("chmod", "chmod", &args).await {
                log.warn(format!("chmod failed: {e}"));
            }
        }
    }

    /// Runs post-install commands and configures service units.
    async fn configure(&self, package: &RuntimePackage, log: &mut StepLog) {
        let pending = package.post_install_commands.len() + package.service_units.len();
        if pending == 0 {
            return;
        }

        if !self.bridge.is_available() {
            log.warn(format!(
                "virtual machine unavailable, skipped {pending} configuration step(s)"
            ));
            return;
        }

        for command in &package.post_install_commands {
            match self
                .exec_guarded("post-install", "sh", &shell_args(command.as_str()))
                .await
            {
                Ok(_) => log.info(format!("ran `{command}`")),
                Err(e) => log.warn(format!("post-install command `{command}` failed: {e}")),
            }
        }

        for unit in &package.service_units {
            let actions = [("enable", unit.enable), ("start", unit.start)];
            for (action, wanted) in actions {
                if !wanted {
                    continue;
                }

                let args = vec![action.to_string(), unit.name.clone()];
                match self.exec_guarded("systemctl", "systemctl", &args).await {
                    Ok(_) => log.info(format!("systemctl {action} {}", unit.name)),
                    Err(e) => log.warn(format!("systemctl {action} {} failed: {e}", unit.name)),
                }
            }
        }
    }
}

impl StepLog {
    fn info(&mut self, line: impl Into<String>) {
        let line = line.into();
        debug!("{line}");
        self.logs.push(line);
    }

    fn warn(&mut self, line: impl Into<String>) {
        let line = line.into();
        warn!("{line}");
        self.logs.push(format!("warning: {line}"));
        self.warnings.push(line);
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl RuntimeInstaller for WebVmManager {
    async fn install_runtime_package(
        &self,
        package: &RuntimePackage,
        _options: &InstallOptions,
    ) -> WebVmResult<InstallResult> {
        let started = Instant::now();
        let mut log = StepLog::default();

        self.initialize().await?;

        match &package.source_url {
            Some(source_url) => {
                let url = self.config.resolve_url(source_url)?;
                log.info(format!("downloading {url}"));
                let bundle = self.remote.fetch_bytes(&url).await?;
                log.info(format!("downloaded {}", format_size(bundle.len() as u64)));

                self.stage_bundle(package, bundle, &mut log).await;
            }
            None => log.info("no bundle to download"),
        }

        self.configure(package, &mut log).await;

        let id = package.id.clone();
        self.update_status(|s| {
            s.installed_runtimes.insert(id);
        })
        .await;

        Ok(InstallResult {
            success: true,
            package_id: package.id.clone(),
            installed_packages: vec![package.id.clone()],
            warnings: log.warnings,
            logs: log.logs,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn remove_runtime_package(&self, package: &RuntimePackage) -> WebVmResult<RemoveResult> {
        let started = Instant::now();
        let mut log = StepLog::default();
        let id = &package.id;

        match self.persistence.delete_bundle(id).await {
            Ok(true) => log.info("deleted bundle"),
            Ok(false) => {}
            Err(e) => log.warn(format!("failed to delete bundle: {e}")),
        }

        match self.files.clear_scope(&runtime_scope(id)).await {
            Ok(count) => log.info(format!("deleted {count} file(s)")),
            Err(e) => log.warn(format!("failed to delete files: {e}")),
        }

        if self.bridge.is_available() {
            let root = runtime_root(id);
            if self.bridge.remove_directory(&root).await {
                log.info(format!("removed {root}"));
            } else {
                log.warn(format!("could not remove {root}"));
            }
        }

        self.update_status(|s| {
            s.installed_runtimes.remove(id);
        })
        .await;

        Ok(RemoveResult {
            success: true,
            package_id: id.clone(),
            warnings: log.warnings,
            logs: log.logs,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn check_proxy_status(port: u16, response: VmResponse) -> WebVmResult<VmResponse> {
    if response.status.is_server_error() {
        return Err(WebVmError::Proxy {
            port,
            status: response.status.as_u16(),
        });
    }

    Ok(response)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
