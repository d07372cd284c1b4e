use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{WebVmError, WebVmResult};

use super::{Capabilities, ExecOutput, VmHandle};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Adapts a virtual machine that exposes its primitives through separate filesystem and process
/// namespaces instead of as top-level methods.
///
/// Handles that expose top-level primitives implement [`VmHandle`] directly.
#[derive(Clone, Default)]
pub struct NamespacedHandle {
    fs: Option<Arc<dyn VmFilesystem>>,
    runtime: Option<Arc<dyn VmProcessRuntime>>,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The filesystem namespace of a virtual machine.
#[async_trait]
pub trait VmFilesystem: Send + Sync {
    /// Writes a file.
    async fn write_file(&self, path: &str, data: Bytes) -> WebVmResult<()>;
}

/// The process namespace of a virtual machine.
#[async_trait]
pub trait VmProcessRuntime: Send + Sync {
    /// Runs a command and waits for it to exit.
    async fn exec(&self, command: &str, args: &[String]) -> WebVmResult<ExecOutput>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NamespacedHandle {
    /// Creates an adapter with no namespaces.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a filesystem namespace.
    pub fn with_fs(mut self, fs: Arc<dyn VmFilesystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    /// Attaches a process namespace.
    pub fn with_runtime(mut self, runtime: Arc<dyn VmProcessRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl VmHandle for NamespacedHandle {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            write_file: self.fs.is_some(),
            exec: self.runtime.is_some(),
            ..Default::default()
        }
    }

    async fn write_file(&self, path: &str, data: Bytes) -> WebVmResult<()> {
        match &self.fs {
            Some(fs) => fs.write_file(path, data).await,
            None => Err(WebVmError::Unsupported("writeFile".into())),
        }
    }

    async fn exec(&self, command: &str, args: &[String]) -> WebVmResult<ExecOutput> {
        match &self.runtime {
            Some(runtime) => runtime.exec(command, args).await,
            None => Err(WebVmError::Unsupported("exec".into())),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingRuntime {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VmProcessRuntime for RecordingRuntime {
        async fn exec(&self, command: &str, args: &[String]) -> WebVmResult<ExecOutput> {
            self.calls
                .lock()
                .await
                .push(format!("{command} {}", args.join(" ")));
            Ok(ExecOutput::ok())
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_namespaced_handle_routes_to_namespaces() -> anyhow::Result<()> {
        let runtime = Arc::new(RecordingRuntime::default());
        let handle = NamespacedHandle::new().with_runtime(runtime.clone());

        let caps = handle.capabilities();
        assert!(caps.exec);
        assert!(!caps.write_file);
        assert!(!caps.ensure_dir);

        handle.exec("mkdir", &["-p".into(), "/tmp/a".into()]).await?;
        assert_eq!(*runtime.calls.lock().await, vec!["mkdir -p /tmp/a"]);

        let err = handle
            .write_file("/tmp/a/b", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, WebVmError::Unsupported(op) if op == "writeFile"));

        Ok(())
    }
}
