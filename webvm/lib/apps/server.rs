use std::sync::Arc;

use chrono::Utc;
use reqwest::{
    header::{HeaderValue, CONTENT_TYPE},
    Method, StatusCode,
};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use webvmfs::ScopedFileStore;

use crate::{
    bridge::VmResponse,
    config::WebVmConfig,
    lifecycle::{ProxyOutcome, ProxyRequest, WebVmManager},
    packages::RuntimeRepository,
    persistence::StatePersistence,
    utils::{
        app_log_file, app_pid_file, app_public_dir, app_scope, content_type_for,
        sanitize_relative_path, static_file_candidates, PUBLIC_SUBDIR,
    },
    AppKind, AppStatus, Application, InstallOptions, InstallResult, RemoveOptions, RemoveResult,
    RuntimePackage, WebVmError, WebVmResult, WebVmStatus,
};

use super::{allocate_port, validate_app_name, AppServerBuilder, StaticFile};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The composition root: owns the lifecycle manager, the package repository and the list of
/// deployed applications.
///
/// Every change to the machine status, the catalog or the applications is republished as one
/// [`AppServerSnapshot`].
pub struct AppServer {
    pub(super) config: WebVmConfig,
    pub(super) manager: Arc<WebVmManager>,
    pub(super) repository: Arc<RuntimeRepository>,
    pub(super) files: Arc<dyn ScopedFileStore>,
    pub(super) persistence: Arc<dyn StatePersistence>,
    pub(super) applications: watch::Sender<Vec<Application>>,
    pub(super) snapshot: Arc<watch::Sender<AppServerSnapshot>>,
    pub(super) app_lock: Mutex<()>,
    pub(super) tasks: Vec<JoinHandle<()>>,
}

/// Everything a user interface renders, in one value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppServerSnapshot {
    /// The virtual machine status.
    pub vm: WebVmStatus,

    /// The runtime package catalog.
    pub packages: Vec<RuntimePackage>,

    /// The deployed applications.
    pub applications: Vec<Application>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AppServer {
    /// Starts building a server.
    pub fn builder() -> AppServerBuilder {
        AppServerBuilder::default()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &WebVmConfig {
        &self.config
    }

    /// Returns the virtual machine lifecycle manager.
    pub fn manager(&self) -> &Arc<WebVmManager> {
        &self.manager
    }

    /// Returns the runtime package repository.
    pub fn repository(&self) -> &Arc<RuntimeRepository> {
        &self.repository
    }

    /// Returns the latest snapshot.
    pub fn snapshot(&self) -> AppServerSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Subscribes to snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<AppServerSnapshot> {
        self.snapshot.subscribe()
    }

    /// Installs a runtime package and its missing dependencies.
    pub async fn install_package(
        &self,
        id: &str,
        options: InstallOptions,
    ) -> WebVmResult<InstallResult> {
        self.repository.install_package(id, options).await
    }

    /// Removes a runtime package.
    pub async fn remove_package(&self, id: &str, options: RemoveOptions) -> WebVmResult<RemoveResult> {
        self.repository.remove_package(id, options).await
    }

    /// Returns every application.
    pub fn get_applications(&self) -> Vec<Application> {
        self.applications.borrow().clone()
    }

    /// Returns the application `id`.
    pub fn get_application(&self, id: &str) -> Option<Application> {
        self.applications
            .borrow()
            .iter()
            .find(|a| a.id == id)
            .cloned()
    }

    /// Creates a static application named `name` and stages `files` under its public directory.
    ///
    /// The application is `stopped` afterwards. If staging fails the application is kept in the
    /// `error` state and the error is returned.
    pub async fn deploy_static_application(
        &self,
        name: &str,
        files: Vec<StaticFile>,
    ) -> WebVmResult<Application> {
        validate_app_name(name)?;
        let _guard = self.app_lock.lock().await;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let app = Application {
            id: id.clone(),
            name: name.to_string(),
            kind: AppKind::Static,
            deploy_path: app_public_dir(&id),
            status: AppStatus::Deploying,
            port: None,
            pid_file: app_pid_file(&id),
            logs_path: app_log_file(&id),
            created_at: Utc::now(),
            last_deployed_at: None,
            last_started_at: None,
            error_message: None,
        };

        self.applications.send_modify(|apps| apps.push(app.clone()));
        self.persist_applications().await;
        tracing::info!("deploying {name} as {id}");

        match self.stage_static_files(&app, &files).await {
            Ok(count) => {
                tracing::info!("deployed {count} file(s) for {name}");
                self.update_application(&id, |a| {
                    a.status = AppStatus::Stopped;
                    a.last_deployed_at = Some(Utc::now());
                    a.error_message = None;
                })
                .await
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to deploy {name}");
                self.fail_application(&id, &e).await;
                Err(e)
            }
        }
    }

    /// Starts the server of application `id`, allocating a port on first start.
    ///
    /// A running application, or one mid-transition, is returned unchanged.
    pub async fn start_application(&self, id: &str) -> WebVmResult<Application> {
        let _guard = self.app_lock.lock().await;
        let app = self.require_application(id)?;

        if app.status == AppStatus::Running || app.status.is_transitional() {
            tracing::debug!("{} is already {}", app.name, app.status);
            return Ok(app);
        }

        if !app.status.can_transition_to(AppStatus::Starting) {
            return Err(WebVmError::Conflict(format!(
                "application {} cannot start while {}",
                app.name, app.status
            )));
        }

        let port = match app.port {
            Some(port) => port,
            None => allocate_port(&self.get_applications(), *self.config.get_app_port_base())?,
        };

        let app = self
            .update_application(id, |a| {
                a.status = AppStatus::Starting;
                a.port = Some(port);
            })
            .await?;

        match self.manager.start_static_application(&app, port).await {
            Ok(()) => {
                self.update_application(id, |a| {
                    a.status = AppStatus::Running;
                    a.last_started_at = Some(Utc::now());
                    a.error_message = None;
                })
                .await
            }
            Err(e) => {
                self.fail_application(id, &e).await;
                Err(e)
            }
        }
    }

    /// Stops the server of application `id`.
    ///
    /// An application that is not running is returned unchanged.
    pub async fn stop_application(&self, id: &str) -> WebVmResult<Application> {
        let _guard = self.app_lock.lock().await;
        let app = self.require_application(id)?;

        if app.status != AppStatus::Running {
            tracing::debug!("{} is {}, nothing to stop", app.name, app.status);
            return Ok(app);
        }

        let app = self
            .update_application(id, |a| a.status = AppStatus::Stopping)
            .await?;

        match self.manager.stop_static_application(&app).await {
            Ok(()) => {
                self.update_application(id, |a| {
                    a.status = AppStatus::Stopped;
                    a.error_message = None;
                })
                .await
            }
            Err(e) => {
                self.fail_application(id, &e).await;
                Err(e)
            }
        }
    }

    /// Answers a request for `relative_path` of application `id`.
    ///
    /// The request goes to the application's server when there is one. Otherwise the staged file
    /// is served straight from the file store.
    pub async fn handle_request(
        &self,
        id: &str,
        relative_path: &str,
        request: ProxyRequest,
    ) -> WebVmResult<VmResponse> {
        let app = self.require_application(id)?;
        if app.status != AppStatus::Running {
            return Err(WebVmError::Conflict(format!(
                "application {} is {}",
                app.name, app.status
            )));
        }

        let method = request.method.clone();
        match self
            .manager
            .proxy_static_application(&app, relative_path, request)
            .await
        {
            ProxyOutcome::Response(response) => Ok(response),
            ProxyOutcome::Unavailable => self.serve_from_store(&app, relative_path, &method).await,
            ProxyOutcome::Failed(e) => Err(e),
        }
    }

    /// Stages files under the public directory, replacing what was there.
    async fn stage_static_files(&self, app: &Application, files: &[StaticFile]) -> WebVmResult<usize> {
        let mut staged = Vec::with_capacity(files.len());
        for file in files {
            let relative = sanitize_relative_path(&file.path).ok_or_else(|| {
                WebVmError::Validation(format!("invalid file path {:?}", file.path))
            })?;
            staged.push((relative, file.data.clone()));
        }

        let scope = app_scope(&app.id);
        self.files.delete_prefix(&scope, PUBLIC_SUBDIR).await?;

        let vm = self.manager.bridge().is_available();
        if vm {
            self.manager.bridge().ensure_directory(&app.deploy_path).await;
        }

        for (relative, data) in &staged {
            self.files
                .write(&scope, &format!("{PUBLIC_SUBDIR}/{relative}"), data.clone())
                .await?;

            if vm {
                let path = format!("{}/{relative}", app.deploy_path);
                if let Some((parent, _)) = path.rsplit_once('/') {
                    self.manager.bridge().ensure_directory(parent).await;
                }
                if let Err(e) = self.manager.write_vm_file(&path, data).await {
                    tracing::warn!(error = %e, "failed to stage {path}");
                }
            }
        }

        Ok(staged.len())
    }

    async fn serve_from_store(
        &self,
        app: &Application,
        relative_path: &str,
        method: &Method,
    ) -> WebVmResult<VmResponse> {
        let scope = app_scope(&app.id);
        for candidate in static_file_candidates(relative_path) {
            let path = format!("{PUBLIC_SUBDIR}/{candidate}");
            match self.files.read(&scope, &path).await {
                Ok(file) => {
                    let body = if *method == Method::HEAD {
                        Default::default()
                    } else {
                        file.into_data()
                    };
                    let mut response = VmResponse::new(StatusCode::OK, body);
                    response.headers.insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static(content_type_for(&path)),
                    );
                    return Ok(response);
                }
                Err(e) if e.is_not_found() => continue,
                Err(webvmfs::FsError::InvalidPath(_)) => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(VmResponse::new(StatusCode::NOT_FOUND, "not found"))
    }

    fn require_application(&self, id: &str) -> WebVmResult<Application> {
        self.get_application(id)
            .ok_or_else(|| WebVmError::application_not_found(id))
    }

    /// Applies `change` to a copy of the application, swaps it in and persists the list.
    async fn update_application<F>(&self, id: &str, change: F) -> WebVmResult<Application>
    where
        F: FnOnce(&mut Application),
    {
        let mut updated = None;
        self.applications.send_if_modified(|apps| {
            let Some(slot) = apps.iter_mut().find(|a| a.id == id) else {
                return false;
            };

            let mut next = slot.clone();
            change(&mut next);
            *slot = next.clone();
            updated = Some(next);
            true
        });

        let app = updated.ok_or_else(|| WebVmError::application_not_found(id))?;
        self.persist_applications().await;
        Ok(app)
    }

    async fn fail_application(&self, id: &str, error: &WebVmError) {
        let message = error.to_string();
        let result = self
            .update_application(id, |a| {
                a.status = AppStatus::Error;
                a.error_message = Some(message);
            })
            .await;

        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to record error state of application {id}");
        }
    }

    async fn persist_applications(&self) {
        let snapshot = self.get_applications();
        if let Err(e) = self.persistence.save_applications(&snapshot).await {
            tracing::warn!(error = %e, "failed to persist applications");
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for AppServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
