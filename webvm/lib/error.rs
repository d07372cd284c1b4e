use std::{
    error::Error,
    fmt::{self, Display},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use webvmfs::FsError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a webvm-related operation.
pub type WebVmResult<T> = Result<T, WebVmError>;

/// An error that occurred while provisioning runtimes or managing applications.
#[derive(pretty_error_debug::Debug, Error)]
pub enum WebVmError {
    /// No virtual machine handle is registered.
    #[error("virtual machine is not available")]
    Unavailable,

    /// The registered handle does not implement the requested capability.
    #[error("virtual machine does not support operation: {0}")]
    Unsupported(String),

    /// A deferred call was replayed against a handle that lacks the method.
    #[error("method not available on the active virtual machine: {0}")]
    MethodNotAvailable(String),

    /// The virtual machine failed to load or boot.
    #[error("virtual machine initialization failed: {0}")]
    Initialization(String),

    /// A network request could not be completed.
    #[error("network request failed: {0}")]
    Network(String),

    /// A network request completed with a non-success status.
    #[error("request to {url} failed with status {status}")]
    HttpStatus {
        /// The requested URL.
        url: String,

        /// The HTTP status code.
        status: u16,
    },

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred during an HTTP middleware operation.
    #[error("http middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// The operation took longer than its allotted time.
    #[error("operation {operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// The name of the operation.
        operation: String,

        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The circuit breaker for the key is open.
    #[error("circuit breaker is open for {0}")]
    CircuitOpen(String),

    /// Too many operations are in flight.
    #[error("rate limited: {in_flight} operations in flight (limit {limit})")]
    RateLimited {
        /// The number of tracked in-flight operations.
        in_flight: usize,

        /// The configured ceiling.
        limit: usize,
    },

    /// A referenced package, application or runtime does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up.
        kind: &'static str,

        /// The identifier that was not found.
        id: String,
    },

    /// The operation is not valid for the current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The input is malformed.
    #[error("validation error: {0}")]
    Validation(String),

    /// A proxied request was answered with an error status.
    #[error("proxy request to port {port} failed with status {status}")]
    Proxy {
        /// The application port.
        port: u16,

        /// The HTTP status code.
        status: u16,
    },

    /// The tar archive could not be parsed.
    #[error("malformed tar archive: {0}")]
    MalformedArchive(String),

    /// A command executed inside the virtual machine failed.
    #[error("command `{command}` exited with status {exit_code}: {stderr}")]
    ExecFailed {
        /// The command line.
        command: String,

        /// The exit code.
        exit_code: i32,

        /// The captured standard error.
        stderr: String,
    },

    /// An error from the virtual filesystem store.
    #[error("file store error: {0}")]
    FileStore(#[from] FsError),

    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A configuration parse error.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    /// An operation routed through the error handler failed.
    #[error("{operation} failed after {attempts} attempt(s) [{key}]: {source}")]
    Operation {
        /// The name of the operation.
        operation: String,

        /// The circuit breaker key.
        key: String,

        /// How many attempts were made.
        attempts: u32,

        /// The error of the last attempt.
        #[source]
        source: Box<WebVmError>,
    },

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// The machine-checkable category of a [`WebVmError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No virtual machine handle is present.
    Unavailable,

    /// The handle lacks the requested capability.
    Unsupported,

    /// A fetch failed or returned a non-success status.
    NetworkFailure,

    /// The operation exceeded its allotted time.
    Timeout,

    /// The circuit breaker rejected the operation.
    CircuitOpen,

    /// Too many concurrent operations.
    RateLimited,

    /// The referenced entity does not exist.
    NotFound,

    /// The operation is not valid for the current state.
    Conflict,

    /// The input is malformed.
    Validation,

    /// The virtual machine failed to initialize.
    Initialization,

    /// A proxied request failed.
    Proxy,

    /// Persistence or file store failure.
    Storage,

    /// Anything else.
    Internal,
}

/// A serializable description of an error for display and programmatic branching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// The error category.
    pub kind: ErrorKind,

    /// The human-readable message.
    pub message: String,
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WebVmError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> WebVmError {
        WebVmError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Creates a [`WebVmError::NotFound`] for a package id.
    pub fn package_not_found(id: impl Into<String>) -> WebVmError {
        WebVmError::NotFound {
            kind: "package",
            id: id.into(),
        }
    }

    /// Creates a [`WebVmError::NotFound`] for an application id.
    pub fn application_not_found(id: impl Into<String>) -> WebVmError {
        WebVmError::NotFound {
            kind: "application",
            id: id.into(),
        }
    }

    /// Returns the category of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WebVmError::Unavailable => ErrorKind::Unavailable,
            WebVmError::Unsupported(_) | WebVmError::MethodNotAvailable(_) => {
                ErrorKind::Unsupported
            }
            WebVmError::Initialization(_) => ErrorKind::Initialization,
            WebVmError::Network(_)
            | WebVmError::HttpStatus { .. }
            | WebVmError::HttpRequest(_)
            | WebVmError::HttpMiddleware(_) => ErrorKind::NetworkFailure,
            WebVmError::Timeout { .. } => ErrorKind::Timeout,
            WebVmError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            WebVmError::RateLimited { .. } => ErrorKind::RateLimited,
            WebVmError::NotFound { .. } => ErrorKind::NotFound,
            WebVmError::FileStore(e) if e.is_not_found() => ErrorKind::NotFound,
            WebVmError::Conflict(_) => ErrorKind::Conflict,
            WebVmError::Validation(_)
            | WebVmError::MalformedArchive(_)
            | WebVmError::Config(_) => ErrorKind::Validation,
            WebVmError::Proxy { .. } => ErrorKind::Proxy,
            WebVmError::FileStore(_) | WebVmError::Io(_) | WebVmError::Json(_) => {
                ErrorKind::Storage
            }
            WebVmError::Operation { source, .. } => source.kind(),
            WebVmError::ExecFailed { .. } | WebVmError::Custom(_) => ErrorKind::Internal,
        }
    }

    /// Returns `false` for errors that cannot succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            WebVmError::Operation { source, .. } => source.is_retryable(),
            WebVmError::Proxy { status, .. } => !(400..500).contains(status) || *status == 429,
            _ => !matches!(
                self.kind(),
                ErrorKind::Initialization
                    | ErrorKind::NotFound
                    | ErrorKind::Validation
                    | ErrorKind::Unsupported
                    | ErrorKind::Conflict
                    | ErrorKind::CircuitOpen
                    | ErrorKind::RateLimited
            ),
        }
    }

    /// Returns a serializable report of the error.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `WebVmResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> WebVmResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::NetworkFailure => "network_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::Initialization => "initialization",
            ErrorKind::Proxy => "proxy",
            ErrorKind::Storage => "storage",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{code}")
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(WebVmError::Unavailable.kind(), ErrorKind::Unavailable);
        assert_eq!(
            WebVmError::MethodNotAvailable("exec".into()).kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(
            WebVmError::HttpStatus {
                url: "http://x".into(),
                status: 500
            }
            .kind(),
            ErrorKind::NetworkFailure
        );
        assert_eq!(
            WebVmError::FileStore(FsError::NotFound {
                scope: "s".into(),
                path: "p".into()
            })
            .kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_error_retry_classification() {
        assert!(!WebVmError::Initialization("boom".into()).is_retryable());
        assert!(!WebVmError::package_not_found("nginx").is_retryable());
        assert!(!WebVmError::Proxy {
            port: 8080,
            status: 404
        }
        .is_retryable());
        assert!(WebVmError::Proxy {
            port: 8080,
            status: 429
        }
        .is_retryable());
        assert!(WebVmError::Proxy {
            port: 8080,
            status: 502
        }
        .is_retryable());
        assert!(WebVmError::Network("reset".into()).is_retryable());
        assert!(WebVmError::Timeout {
            operation: "exec".into(),
            timeout_ms: 10
        }
        .is_retryable());
    }

    #[test]
    fn test_operation_error_delegates_kind() {
        let err = WebVmError::Operation {
            operation: "install".into(),
            key: "vm-exec".into(),
            attempts: 3,
            source: Box::new(WebVmError::Timeout {
                operation: "install".into(),
                timeout_ms: 5,
            }),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_retryable());

        let report = err.report();
        assert_eq!(report.kind, ErrorKind::Timeout);
        assert!(report.message.contains("after 3 attempt(s)"));
    }
}
