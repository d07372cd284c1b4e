//! Data model shared by the repository, the lifecycle manager and the application server.

use std::{
    collections::BTreeSet,
    fmt::{self, Display},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{WebVmError, WebVmResult};

//--------------------------------------------------------------------------------------------------
// Types: Packages
//--------------------------------------------------------------------------------------------------

/// The category of a runtime package.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageCategory {
    /// An HTTP server such as nginx.
    WebServer,

    /// A language runtime such as Node.js or Python.
    #[default]
    Runtime,

    /// A framework layered on a runtime.
    Framework,

    /// A standalone tool.
    Tool,
}

/// The install status of a runtime package.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageStatus {
    /// Not installed.
    #[default]
    Available,

    /// The bundle is being downloaded.
    Downloading,

    /// The package is being installed.
    Installing,

    /// The package is installed.
    Installed,

    /// The package is being removed.
    Removing,

    /// The last install or remove failed.
    Error,
}

/// A service unit configured after a package is installed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUnit {
    /// The unit name passed to `systemctl`.
    pub name: String,

    /// Whether to `systemctl enable` the unit.
    #[serde(default)]
    pub enable: bool,

    /// Whether to `systemctl start` the unit.
    #[serde(default)]
    pub start: bool,
}

/// An installable runtime package in the catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimePackage {
    /// The stable, unique slug of the package.
    pub id: String,

    /// The display name.
    pub name: String,

    /// A short description.
    #[serde(default)]
    pub description: String,

    /// The package category.
    pub category: PackageCategory,

    /// The package version.
    pub version: String,

    /// The advisory size of the package in bytes.
    #[serde(default)]
    pub size: u64,

    /// Ids of packages that must be installed first, in install order.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Ids of packages that cannot be installed alongside this one.
    #[serde(default)]
    pub conflicts: Vec<String>,

    /// The install status.
    #[serde(default)]
    pub status: PackageStatus,

    /// Where the tar bundle is fetched from.
    #[serde(default)]
    pub source_url: Option<String>,

    /// Shell commands run after extraction, in order.
    #[serde(default)]
    pub post_install_commands: Vec<String>,

    /// Service units configured after extraction.
    #[serde(default)]
    pub service_units: Vec<ServiceUnit>,

    /// When the package was installed.
    #[serde(default)]
    pub install_date: Option<DateTime<Utc>>,

    /// When the package was last used.
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,

    /// How long the last install took.
    #[serde(default)]
    pub install_duration_ms: Option<u64>,

    /// The message of the last failure.
    #[serde(default)]
    pub error_message: Option<String>,
}

/// The kind of a runtime operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// A package install.
    Install,

    /// A package removal.
    Remove,
}

/// The progress of a runtime operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Created but not started.
    Pending,

    /// In progress.
    Running,

    /// Finished successfully.
    Succeeded,

    /// Finished with an error.
    Failed,
}

/// An audit record of one install or remove action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeOperation {
    /// A random identifier.
    pub id: String,

    /// The package the operation acts on.
    pub package_id: String,

    /// Install or remove.
    #[serde(rename = "type")]
    pub operation_type: OperationType,

    /// The progress of the operation.
    pub status: OperationStatus,

    /// When the operation was created.
    pub started_at: DateTime<Utc>,

    /// When the operation finished.
    pub finished_at: Option<DateTime<Utc>>,

    /// Append-only log lines.
    pub logs: Vec<String>,

    /// The failure message, if any.
    pub error_message: Option<String>,
}

/// Options of a package install.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallOptions {
    /// Install the package even if its dependencies are not installed.
    pub skip_dependencies: bool,
}

/// Options of a package removal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Remove the package even if installed packages depend on it.
    pub force: bool,
}

/// The outcome of a package install.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResult {
    /// Whether the install succeeded.
    pub success: bool,

    /// The package that was requested.
    pub package_id: String,

    /// The target followed by the dependencies installed on its behalf.
    pub installed_packages: Vec<String>,

    /// Non-fatal problems.
    pub warnings: Vec<String>,

    /// The log trail.
    pub logs: Vec<String>,

    /// Wall-clock duration in milliseconds.
    pub elapsed_ms: u64,
}

/// The outcome of a package removal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveResult {
    /// Whether the removal succeeded.
    pub success: bool,

    /// The package that was requested.
    pub package_id: String,

    /// Non-fatal problems.
    pub warnings: Vec<String>,

    /// The log trail.
    pub logs: Vec<String>,

    /// Wall-clock duration in milliseconds.
    pub elapsed_ms: u64,
}

//--------------------------------------------------------------------------------------------------
// Types: Applications
//--------------------------------------------------------------------------------------------------

/// The kind of a deployed application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    /// Static files served over HTTP.
    #[default]
    Static,
}

/// The status of a deployed application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    /// Created, nothing deployed yet.
    #[default]
    Idle,

    /// Files are being staged.
    Deploying,

    /// Deployed and not serving.
    Stopped,

    /// The server process is starting.
    Starting,

    /// Serving.
    Running,

    /// The server process is stopping.
    Stopping,

    /// The last deploy, start or stop failed.
    Error,
}

/// A deployed application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    /// A generated identifier.
    pub id: String,

    /// The display name.
    pub name: String,

    /// The application kind.
    pub kind: AppKind,

    /// The virtual directory content is staged under.
    pub deploy_path: String,

    /// The application status.
    pub status: AppStatus,

    /// The port, allocated on first start and kept afterwards.
    pub port: Option<u16>,

    /// The virtual PID file of the server process.
    pub pid_file: String,

    /// The virtual log file of the server process.
    pub logs_path: String,

    /// When the application was created.
    pub created_at: DateTime<Utc>,

    /// When files were last deployed.
    pub last_deployed_at: Option<DateTime<Utc>>,

    /// When the server was last started.
    pub last_started_at: Option<DateTime<Utc>>,

    /// The message of the last failure.
    #[serde(default)]
    pub error_message: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Types: Virtual Machine
//--------------------------------------------------------------------------------------------------

/// The coarse lifecycle state of the virtual machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// Not loaded.
    #[default]
    Unloaded,

    /// Loading.
    Loading,

    /// Booting.
    Booting,

    /// Ready for work.
    Ready,

    /// Suspended, can be woken quickly.
    Hibernating,

    /// Failed to load or boot.
    Error,
}

/// Resource usage reported by the virtual machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemResources {
    /// CPU usage in percent.
    pub cpu_usage: f64,

    /// Memory usage in bytes.
    pub memory_usage: u64,

    /// Disk usage in bytes.
    pub disk_usage: u64,
}

/// The status of the virtual machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebVmStatus {
    /// The lifecycle state.
    pub state: VmState,

    /// Load progress from 0 to 100.
    pub load_progress: u8,

    /// When the machine last became ready.
    pub boot_time: Option<DateTime<Utc>>,

    /// Ids of installed runtime packages.
    pub installed_runtimes: BTreeSet<String>,

    /// Ids of running applications.
    pub running_apps: BTreeSet<String>,

    /// Resource usage.
    pub system_resources: SystemResources,

    /// The message of the last failure.
    #[serde(default)]
    pub error_message: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PackageStatus {
    /// Returns `true` if the status may change to `next`.
    ///
    /// Install runs `available -> installing -> installed | error` and removal runs
    /// `installed -> removing -> available | error`. An errored package can retry either, and a
    /// package left `installing` or `removing` by an interrupted run can re-enter that state.
    pub fn can_transition_to(self, next: PackageStatus) -> bool {
        matches!(
            (self, next),
            (
                PackageStatus::Available
                    | PackageStatus::Error
                    | PackageStatus::Downloading
                    | PackageStatus::Installing,
                PackageStatus::Installing
            ) | (
                PackageStatus::Installing,
                PackageStatus::Installed | PackageStatus::Error
            ) | (
                PackageStatus::Installed | PackageStatus::Error | PackageStatus::Removing,
                PackageStatus::Removing
            ) | (
                PackageStatus::Removing,
                PackageStatus::Available | PackageStatus::Error
            ) | (PackageStatus::Available, PackageStatus::Downloading)
        )
    }

    /// Returns `true` while an install or removal is in progress.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            PackageStatus::Downloading | PackageStatus::Installing | PackageStatus::Removing
        )
    }
}

impl RuntimePackage {
    /// Moves the package to `next`, rejecting transitions outside the status graph.
    pub fn transition(&mut self, next: PackageStatus) -> WebVmResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(WebVmError::Conflict(format!(
                "package {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }

        self.status = next;
        Ok(())
    }

    /// Returns `true` if the package is installed.
    pub fn is_installed(&self) -> bool {
        self.status == PackageStatus::Installed
    }
}

impl RuntimeOperation {
    /// Creates a pending operation with a random id.
    pub fn new(package_id: impl Into<String>, operation_type: OperationType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            package_id: package_id.into(),
            operation_type,
            status: OperationStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            logs: Vec::new(),
            error_message: None,
        }
    }

    /// Marks the operation as running.
    pub fn start(&mut self) {
        if self.status == OperationStatus::Pending {
            self.status = OperationStatus::Running;
        }
    }

    /// Appends a log line. Lines logged after the operation finished are dropped.
    pub fn log(&mut self, line: impl Into<String>) {
        if self.is_open() {
            self.logs.push(line.into());
        }
    }

    /// Appends several log lines.
    pub fn extend_logs(&mut self, lines: impl IntoIterator<Item = String>) {
        for line in lines {
            self.log(line);
        }
    }

    /// Marks the operation as succeeded.
    pub fn succeed(&mut self) {
        if self.is_open() {
            self.status = OperationStatus::Succeeded;
            self.finished_at = Some(Utc::now());
        }
    }

    /// Marks the operation as failed with `message`.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.is_open() {
            self.status = OperationStatus::Failed;
            self.error_message = Some(message.into());
            self.finished_at = Some(Utc::now());
        }
    }

    /// Returns `true` until the operation has finished.
    pub fn is_open(&self) -> bool {
        matches!(
            self.status,
            OperationStatus::Pending | OperationStatus::Running
        )
    }
}

impl AppStatus {
    /// Returns `true` if the status may change to `next`.
    pub fn can_transition_to(self, next: AppStatus) -> bool {
        matches!(
            (self, next),
            (
                AppStatus::Idle | AppStatus::Stopped | AppStatus::Error,
                AppStatus::Deploying
            ) | (AppStatus::Deploying, AppStatus::Stopped | AppStatus::Error)
                | (AppStatus::Stopped | AppStatus::Error, AppStatus::Starting)
                | (AppStatus::Starting, AppStatus::Running | AppStatus::Error)
                | (AppStatus::Running, AppStatus::Stopping)
                | (AppStatus::Stopping, AppStatus::Stopped | AppStatus::Error)
        )
    }

    /// Returns `true` while a deploy, start or stop is in progress.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            AppStatus::Deploying | AppStatus::Starting | AppStatus::Stopping
        )
    }
}

impl VmState {
    /// Returns `true` while the machine is loading or booting.
    pub fn is_starting(self) -> bool {
        matches!(self, VmState::Loading | VmState::Booting)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for PackageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            PackageStatus::Available => "available",
            PackageStatus::Downloading => "downloading",
            PackageStatus::Installing => "installing",
            PackageStatus::Installed => "installed",
            PackageStatus::Removing => "removing",
            PackageStatus::Error => "error",
        };
        write!(f, "{status}")
    }
}

impl Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            AppStatus::Idle => "idle",
            AppStatus::Deploying => "deploying",
            AppStatus::Stopped => "stopped",
            AppStatus::Starting => "starting",
            AppStatus::Running => "running",
            AppStatus::Stopping => "stopping",
            AppStatus::Error => "error",
        };
        write!(f, "{status}")
    }
}

impl Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            VmState::Unloaded => "unloaded",
            VmState::Loading => "loading",
            VmState::Booting => "booting",
            VmState::Ready => "ready",
            VmState::Hibernating => "hibernating",
            VmState::Error => "error",
        };
        write!(f, "{state}")
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_status_transitions() {
        use PackageStatus::*;

        assert!(Available.can_transition_to(Installing));
        assert!(Installing.can_transition_to(Installed));
        assert!(Installing.can_transition_to(Error));
        assert!(Installed.can_transition_to(Removing));
        assert!(Removing.can_transition_to(Available));
        assert!(Removing.can_transition_to(Error));
        assert!(Error.can_transition_to(Installing));
        assert!(Error.can_transition_to(Removing));
        assert!(Installing.can_transition_to(Installing));
        assert!(Downloading.can_transition_to(Installing));
        assert!(Removing.can_transition_to(Removing));

        assert!(!Available.can_transition_to(Installed));
        assert!(!Available.can_transition_to(Error));
        assert!(!Installed.can_transition_to(Installing));
        assert!(!Available.can_transition_to(Removing));
        assert!(!Installed.can_transition_to(Installed));
        assert!(!Removing.can_transition_to(Installing));
    }

    #[test]
    fn test_package_transition_rejects_invalid_moves() {
        let mut package = RuntimePackage {
            id: "nginx".into(),
            ..Default::default()
        };

        assert!(package.transition(PackageStatus::Installed).is_err());
        assert_eq!(package.status, PackageStatus::Available);
        assert!(package.transition(PackageStatus::Installing).is_ok());
        assert!(package.transition(PackageStatus::Installed).is_ok());
        assert!(package.is_installed());
    }

    #[test]
    fn test_operation_logs_are_append_only_until_finished() {
        let mut operation = RuntimeOperation::new("nginx", OperationType::Install);
        operation.start();
        operation.log("downloading");
        operation.succeed();
        operation.log("late line");
        operation.fail("too late");

        assert_eq!(operation.logs, vec!["downloading"]);
        assert_eq!(operation.status, OperationStatus::Succeeded);
        assert!(operation.finished_at.is_some());
        assert!(operation.error_message.is_none());
    }

    #[test]
    fn test_app_status_transitions() {
        use AppStatus::*;

        assert!(Idle.can_transition_to(Deploying));
        assert!(Deploying.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(!Idle.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
    }

    #[test]
    fn test_package_serializes_dates_as_iso_or_null() -> anyhow::Result<()> {
        let package = RuntimePackage {
            id: "nginx".into(),
            category: PackageCategory::WebServer,
            install_date: Some("2026-01-02T03:04:05Z".parse()?),
            ..Default::default()
        };

        let json = serde_json::to_value(&package)?;
        assert_eq!(json["category"], "web-server");
        assert_eq!(json["installDate"], "2026-01-02T03:04:05Z");
        assert!(json["lastUsed"].is_null());

        let round: RuntimePackage = serde_json::from_value(json)?;
        assert_eq!(round, package);

        Ok(())
    }
}
