use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::{WebVmError, WebVmResult};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Fetches manifests and bundles.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Fetches the body at `url`.
    ///
    /// ## Errors
    ///
    /// Fails with a network error if the request fails or the status is not a success.
    async fn fetch_bytes(&self, url: &str) -> WebVmResult<Bytes>;
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`RemoteSource`] answering from a table of canned responses.
///
/// Unknown URLs answer 404. Useful offline and in tests.
#[derive(Debug, Default)]
pub struct MemorySource {
    responses: RwLock<HashMap<String, Result<Bytes, String>>>,
    requests: RwLock<Vec<String>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MemorySource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers `url` with `body`.
    pub async fn insert(&self, url: impl Into<String>, body: impl Into<Bytes>) {
        self.responses
            .write()
            .await
            .insert(url.into(), Ok(body.into()));
    }

    /// Answers `url` with a network failure carrying `message`.
    pub async fn fail(&self, url: impl Into<String>, message: impl Into<String>) {
        self.responses
            .write()
            .await
            .insert(url.into(), Err(message.into()));
    }

    /// Returns every URL requested so far, in order.
    pub async fn requests(&self) -> Vec<String> {
        self.requests.read().await.clone()
    }

    /// Returns how many times `url` was requested.
    pub async fn request_count(&self, url: &str) -> usize {
        self.requests
            .read()
            .await
            .iter()
            .filter(|u| *u == url)
            .count()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl RemoteSource for MemorySource {
    async fn fetch_bytes(&self, url: &str) -> WebVmResult<Bytes> {
        self.requests.write().await.push(url.to_string());
        match self.responses.read().await.get(url) {
            Some(Ok(body)) => Ok(body.clone()),
            Some(Err(message)) => Err(WebVmError::Network(message.clone())),
            None => Err(WebVmError::HttpStatus {
                url: url.to_string(),
                status: 404,
            }),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
