use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header::HeaderMap, Method, StatusCode};

use crate::{WebVmError, WebVmResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The primitives a [`VmHandle`] implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Dedicated directory creation.
    pub ensure_dir: bool,

    /// Dedicated recursive directory removal.
    pub remove_dir: bool,

    /// File writes.
    pub write_file: bool,

    /// Command execution.
    pub exec: bool,

    /// HTTP requests into the machine's network.
    pub fetch: bool,
}

/// The outcome of a command executed inside the virtual machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// The exit code.
    pub exit_code: i32,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,
}

/// An HTTP request sent into the virtual machine's network.
#[derive(Debug, Clone)]
pub struct VmRequest {
    /// The request method.
    pub method: Method,

    /// The absolute target URL.
    pub url: String,

    /// The request headers.
    pub headers: HeaderMap,

    /// The request body. Never set for `GET` and `HEAD`.
    pub body: Option<Bytes>,
}

/// An HTTP response returned from the virtual machine's network.
#[derive(Debug, Clone)]
pub struct VmResponse {
    /// The response status.
    pub status: StatusCode,

    /// The response headers.
    pub headers: HeaderMap,

    /// The response body.
    pub body: Bytes,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A handle to a virtual machine, real or emulated.
///
/// Implementations override the primitives they support and report them through
/// [`capabilities`](VmHandle::capabilities). The remaining primitives fail with
/// [`WebVmError::Unsupported`].
#[async_trait]
pub trait VmHandle: Send + Sync {
    /// Reports which primitives the handle implements.
    fn capabilities(&self) -> Capabilities;

    /// Creates a directory and its parents.
    async fn ensure_dir(&self, _path: &str) -> WebVmResult<()> {
        Err(WebVmError::Unsupported("ensureDir".into()))
    }

    /// Removes a directory tree.
    async fn remove_dir(&self, _path: &str) -> WebVmResult<()> {
        Err(WebVmError::Unsupported("removeDir".into()))
    }

    /// Writes a file, replacing existing contents.
    async fn write_file(&self, _path: &str, _data: Bytes) -> WebVmResult<()> {
        Err(WebVmError::Unsupported("writeFile".into()))
    }

    /// Runs a command and waits for it to exit.
    async fn exec(&self, _command: &str, _args: &[String]) -> WebVmResult<ExecOutput> {
        Err(WebVmError::Unsupported("exec".into()))
    }

    /// Sends an HTTP request into the machine's network.
    async fn fetch(&self, _request: VmRequest) -> WebVmResult<VmResponse> {
        Err(WebVmError::Unsupported("fetch".into()))
    }
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Capabilities {
    /// Every primitive.
    pub fn all() -> Self {
        Self {
            ensure_dir: true,
            remove_dir: true,
            write_file: true,
            exec: true,
            fetch: true,
        }
    }
}

impl ExecOutput {
    /// A successful exit with no output.
    pub fn ok() -> Self {
        Self::default()
    }

    /// An exit with `exit_code` and `stderr`.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns `true` if the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl VmRequest {
    /// Creates a `GET` request.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

impl VmResponse {
    /// Creates a response with a status and body and no headers.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}
