use bytes::Bytes;
use reqwest::{header::HeaderMap, Method};

use crate::{bridge::VmResponse, WebVmError};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An HTTP request addressed to a deployed application.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// The request method.
    pub method: Method,

    /// The request headers.
    pub headers: HeaderMap,

    /// The request body. Dropped for `GET` and `HEAD`.
    pub body: Bytes,
}

/// The outcome of proxying a request to an application's server.
#[derive(Debug)]
pub enum ProxyOutcome {
    /// The server answered.
    Response(VmResponse),

    /// There is nothing to proxy to: no virtual machine or no assigned port. The caller answers
    /// the request itself.
    Unavailable,

    /// The request was sent and failed.
    Failed(WebVmError),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ProxyRequest {
    /// Creates a request with no headers and an empty body.
    pub fn new(method: Method) -> Self {
        Self {
            method,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Creates a `GET` request.
    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns `true` if the method carries a body when forwarded.
    pub fn forwards_body(&self) -> bool {
        self.method != Method::GET && self.method != Method::HEAD
    }
}

impl ProxyOutcome {
    /// Returns the response, if the server answered.
    pub fn into_response(self) -> Option<VmResponse> {
        match self {
            ProxyOutcome::Response(response) => Some(response),
            _ => None,
        }
    }
}
