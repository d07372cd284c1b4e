use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;

use crate::{WebVmError, WebVmResult};

use super::{ExecOutput, VmHandle, VmRequest, VmResponse};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One stable capability surface over a virtual machine handle that may not be registered.
///
/// The bridge holds the process-wide handle slot. Absence of a handle is the normal "no virtual
/// machine" condition: directory operations report `false`, the rest fail with
/// [`WebVmError::Unavailable`].
#[derive(Default)]
pub struct VmBridge {
    handle: RwLock<Option<Arc<dyn VmHandle>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmBridge {
    /// Creates a bridge with an empty handle slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bridge with `handle` registered.
    pub fn with_handle(handle: Arc<dyn VmHandle>) -> Self {
        let bridge = Self::new();
        bridge.register(handle);
        bridge
    }

    /// Registers `handle`, replacing any previous one.
    pub fn register(&self, handle: Arc<dyn VmHandle>) {
        *self.handle.write().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Clears the handle slot, returning the handle that was registered.
    pub fn unregister(&self) -> Option<Arc<dyn VmHandle>> {
        self.handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Returns the registered handle.
    pub fn handle(&self) -> Option<Arc<dyn VmHandle>> {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns `true` if a handle is registered.
    pub fn is_available(&self) -> bool {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Creates `path` and its parents. Best effort: failures are logged and reported as `false`.
    ///
    /// Handles without a dedicated primitive get `mkdir -p`.
    pub async fn ensure_directory(&self, path: &str) -> bool {
        let Some(handle) = self.handle() else {
            tracing::debug!("no virtual machine to create directory {path}");
            return false;
        };

        if handle.capabilities().ensure_dir {
            match handle.ensure_dir(path).await {
                Ok(()) => return true,
                Err(e) if e.kind() == crate::ErrorKind::Unsupported => {}
                Err(e) => {
                    tracing::warn!("failed to create directory {path}: {e}");
                    return false;
                }
            }
        }

        self.exec_advisory(&handle, "mkdir", &["-p", path]).await
    }

    /// Removes the tree at `path`. Best effort: failures are logged and reported as `false`.
    ///
    /// Handles without a dedicated primitive get `rm -rf`.
    pub async fn remove_directory(&self, path: &str) -> bool {
        let Some(handle) = self.handle() else {
            tracing::debug!("no virtual machine to remove directory {path}");
            return false;
        };

        if handle.capabilities().remove_dir {
            match handle.remove_dir(path).await {
                Ok(()) => return true,
                Err(e) if e.kind() == crate::ErrorKind::Unsupported => {}
                Err(e) => {
                    tracing::warn!("failed to remove directory {path}: {e}");
                    return false;
                }
            }
        }

        self.exec_advisory(&handle, "rm", &["-rf", path]).await
    }

    /// Writes a file inside the virtual machine.
    pub async fn write_file(&self, path: &str, data: Bytes) -> WebVmResult<()> {
        let handle = self.require()?;
        if !handle.capabilities().write_file {
            return Err(WebVmError::Unsupported("writeFile".into()));
        }

        handle.write_file(path, data).await
    }

    /// Runs a command inside the virtual machine. A non-zero exit is not an error.
    pub async fn exec(&self, command: &str, args: &[String]) -> WebVmResult<ExecOutput> {
        let handle = self.require()?;
        if !handle.capabilities().exec {
            return Err(WebVmError::Unsupported("exec".into()));
        }

        handle.exec(command, args).await
    }

    /// Runs a command and fails with [`WebVmError::ExecFailed`] on a non-zero exit.
    pub async fn exec_checked(&self, command: &str, args: &[String]) -> WebVmResult<ExecOutput> {
        let output = self.exec(command, args).await?;
        if !output.success() {
            return Err(WebVmError::ExecFailed {
                command: command_line(command, args),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }

        Ok(output)
    }

    /// Sends an HTTP request into the virtual machine's network.
    pub async fn fetch(&self, request: VmRequest) -> WebVmResult<VmResponse> {
        let handle = self.require()?;
        if !handle.capabilities().fetch {
            return Err(WebVmError::Unsupported("fetch".into()));
        }

        handle.fetch(request).await
    }

    fn require(&self) -> WebVmResult<Arc<dyn VmHandle>> {
        self.handle().ok_or(WebVmError::Unavailable)
    }

    async fn exec_advisory(&self, handle: &Arc<dyn VmHandle>, command: &str, args: &[&str]) -> bool {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        if !handle.capabilities().exec {
            tracing::warn!(
                "virtual machine cannot run `{}`",
                command_line(command, &args)
            );
            return false;
        }

        match handle.exec(command, &args).await {
            Ok(output) if output.success() => true,
            Ok(output) => {
                tracing::warn!(
                    "`{}` exited with status {}: {}",
                    command_line(command, &args),
                    output.exit_code,
                    output.stderr
                );
                false
            }
            Err(e) => {
                tracing::warn!("`{}` failed: {e}", command_line(command, &args));
                false
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

pub(crate) fn command_line(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{command} {}", args.join(" "))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use crate::bridge::Capabilities;

    use super::*;

    #[derive(Default)]
    struct ExecOnly {
        calls: Mutex<Vec<String>>,
        exit_code: i32,
    }

    #[async_trait]
    impl VmHandle for ExecOnly {
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                exec: true,
                ..Default::default()
            }
        }

        async fn exec(&self, command: &str, args: &[String]) -> WebVmResult<ExecOutput> {
            self.calls.lock().await.push(command_line(command, args));
            Ok(ExecOutput::failed(self.exit_code, ""))
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_bridge_without_handle() {
        let bridge = VmBridge::new();
        assert!(!bridge.is_available());
        assert!(!bridge.ensure_directory("/opt/x").await);
        assert!(!bridge.remove_directory("/opt/x").await);
        assert!(matches!(
            bridge.exec("ls", &[]).await,
            Err(WebVmError::Unavailable)
        ));
        assert!(matches!(
            bridge.fetch(VmRequest::get("http://127.0.0.1:1/")).await,
            Err(WebVmError::Unavailable)
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_bridge_synthesizes_directory_operations_with_exec() -> anyhow::Result<()> {
        let handle = Arc::new(ExecOnly::default());
        let bridge = VmBridge::with_handle(handle.clone());

        assert!(bridge.ensure_directory("/opt/a").await);
        assert!(bridge.remove_directory("/opt/b").await);
        assert_eq!(
            *handle.calls.lock().await,
            vec!["mkdir -p /opt/a", "rm -rf /opt/b"]
        );

        let err = bridge
            .write_file("/opt/a/f", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WebVmError::Unsupported(op) if op == "writeFile"));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_bridge_directory_operations_report_exec_failure() -> anyhow::Result<()> {
        let handle = Arc::new(ExecOnly {
            exit_code: 1,
            ..Default::default()
        });
        let bridge = VmBridge::with_handle(handle);

        assert!(!bridge.ensure_directory("/opt/a").await);
        assert!(bridge.exec("false", &[]).await.is_ok());
        assert!(matches!(
            bridge.exec_checked("false", &[]).await,
            Err(WebVmError::ExecFailed { exit_code: 1, .. })
        ));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_bridge_register_and_unregister() {
        let bridge = VmBridge::new();
        bridge.register(Arc::new(ExecOnly::default()));
        assert!(bridge.is_available());
        assert!(bridge.unregister().is_some());
        assert!(!bridge.is_available());
    }
}
