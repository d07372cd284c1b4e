use std::{
    collections::VecDeque,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::{oneshot, Mutex};

use crate::{WebVmError, WebVmResult};

use super::{Capabilities, ExecOutput, VmHandle, VmRequest, VmResponse};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

type QueuedCall = Box<dyn FnOnce(Arc<dyn VmHandle>) -> BoxFuture<'static, ()> + Send>;

/// A [`VmHandle`] that stands in for a handle that is still loading.
///
/// While pending, every call is queued. [`activate`](DeferredHandle::activate) replays the queue
/// against the real handle in arrival order, settling each caller with its own outcome. Calls made
/// after activation go straight to the real handle.
pub struct DeferredHandle {
    state: Mutex<DeferredState>,
    active: RwLock<Option<Arc<dyn VmHandle>>>,
}

enum DeferredState {
    Pending(VecDeque<QueuedCall>),
    Active(Arc<dyn VmHandle>),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DeferredHandle {
    /// Creates a pending handle.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DeferredState::Pending(VecDeque::new())),
            active: RwLock::new(None),
        }
    }

    /// Returns `true` once [`activate`](DeferredHandle::activate) has run.
    pub fn is_active(&self) -> bool {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Returns the number of queued calls.
    pub async fn pending_count(&self) -> usize {
        match &*self.state.lock().await {
            DeferredState::Pending(queue) => queue.len(),
            DeferredState::Active(_) => 0,
        }
    }

    /// Replays the queued calls against `handle` in arrival order and switches to forwarding.
    ///
    /// Each replayed call is awaited before the next starts. Returns the number of calls replayed.
    ///
    /// ## Errors
    ///
    /// Returns [`WebVmError::Conflict`] if the handle was already activated.
    pub async fn activate(&self, handle: Arc<dyn VmHandle>) -> WebVmResult<usize> {
        let mut state = self.state.lock().await;
        let queue = match &mut *state {
            DeferredState::Pending(queue) => std::mem::take(queue),
            DeferredState::Active(_) => {
                return Err(WebVmError::Conflict(
                    "deferred handle is already active".into(),
                ))
            }
        };

        let replayed = queue.len();
        tracing::debug!("replaying {replayed} deferred virtual machine call(s)");
        for call in queue {
            call(handle.clone()).await;
        }

        *state = DeferredState::Active(handle.clone());
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Ok(replayed)
    }

    /// Runs `call` on the active handle, or queues it until activation.
    ///
    /// A replayed call whose primitive the active handle lacks fails with
    /// [`WebVmError::MethodNotAvailable`].
    async fn dispatch<T, F>(
        &self,
        method: &'static str,
        supported: fn(&Capabilities) -> bool,
        call: F,
    ) -> WebVmResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn VmHandle>) -> BoxFuture<'static, WebVmResult<T>> + Send + 'static,
    {
        let receiver = {
            let mut state = self.state.lock().await;
            match &mut *state {
                DeferredState::Active(handle) => {
                    let handle = handle.clone();
                    drop(state);
                    return call(handle).await;
                }
                DeferredState::Pending(queue) => {
                    let (sender, receiver) = oneshot::channel();
                    queue.push_back(Box::new(move |handle: Arc<dyn VmHandle>| {
                        Box::pin(async move {
                            let result = if supported(&handle.capabilities()) {
                                call(handle).await
                            } else {
                                Err(WebVmError::MethodNotAvailable(method.into()))
                            };
                            let _ = sender.send(result);
                        }) as BoxFuture<'static, ()>
                    }));
                    receiver
                }
            }
        };

        receiver.await.map_err(|_| WebVmError::Unavailable)?
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for DeferredHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VmHandle for DeferredHandle {
    fn capabilities(&self) -> Capabilities {
        match &*self.active.read().unwrap_or_else(PoisonError::into_inner) {
            Some(handle) => handle.capabilities(),
            None => Capabilities::all(),
        }
    }

    async fn ensure_dir(&self, path: &str) -> WebVmResult<()> {
        let path = path.to_string();
        self.dispatch("ensureDir", |c| c.ensure_dir, move |handle| {
            Box::pin(async move { handle.ensure_dir(&path).await })
        })
        .await
    }

    async fn remove_dir(&self, path: &str) -> WebVmResult<()> {
        let path = path.to_string();
        self.dispatch("removeDir", |c| c.remove_dir, move |handle| {
            Box::pin(async move { handle.remove_dir(&path).await })
        })
        .await
    }

    async fn write_file(&self, path: &str, data: Bytes) -> WebVmResult<()> {
        let path = path.to_string();
        self.dispatch("writeFile", |c| c.write_file, move |handle| {
            Box::pin(async move { handle.write_file(&path, data).await })
        })
        .await
    }

    async fn exec(&self, command: &str, args: &[String]) -> WebVmResult<ExecOutput> {
        let command = command.to_string();
        let args = args.to_vec();
        self.dispatch("exec", |c| c.exec, move |handle| {
            Box::pin(async move { handle.exec(&command, &args).await })
        })
        .await
    }

    async fn fetch(&self, request: VmRequest) -> WebVmResult<VmResponse> {
        self.dispatch("fetch", |c| c.fetch, move |handle| {
            Box::pin(async move { handle.fetch(request).await })
        })
        .await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VmHandle for Recorder {
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                exec: true,
                write_file: true,
                ..Default::default()
            }
        }

        async fn write_file(&self, path: &str, _data: Bytes) -> WebVmResult<()> {
            self.calls.lock().await.push(format!("write {path}"));
            Ok(())
        }

        async fn exec(&self, command: &str, _args: &[String]) -> WebVmResult<ExecOutput> {
            self.calls.lock().await.push(format!("exec {command}"));
            Ok(ExecOutput::ok())
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_deferred_handle_forwards_after_activation() -> anyhow::Result<()> {
        let recorder = Arc::new(Recorder::default());
        let deferred = DeferredHandle::new();
        assert_eq!(deferred.capabilities(), Capabilities::all());

        assert_eq!(deferred.activate(recorder.clone()).await?, 0);
        assert!(deferred.is_active());
        assert!(!deferred.capabilities().fetch);

        deferred.exec("true", &[]).await?;
        assert_eq!(*recorder.calls.lock().await, vec!["exec true"]);

        assert!(matches!(
            deferred.activate(recorder).await,
            Err(WebVmError::Conflict(_))
        ));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_deferred_handle_replays_queue_in_order() -> anyhow::Result<()> {
        let recorder = Arc::new(Recorder::default());
        let deferred = Arc::new(DeferredHandle::new());

        let mut tasks = Vec::new();
        for i in 0..3 {
            let task_deferred = deferred.clone();
            tasks.push(tokio::spawn(async move {
                task_deferred.exec(&format!("cmd{i}"), &[]).await
            }));
            while deferred.pending_count().await < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        let fetch = {
            let deferred = deferred.clone();
            tokio::spawn(async move { deferred.fetch(VmRequest::get("http://x/")).await })
        };
        while deferred.pending_count().await < 4 {
            tokio::task::yield_now().await;
        }

        assert_eq!(deferred.activate(recorder.clone()).await?, 4);
        for task in tasks {
            assert!(task.await?.is_ok());
        }
        assert!(matches!(
            fetch.await?,
            Err(WebVmError::MethodNotAvailable(m)) if m == "fetch"
        ));
        assert_eq!(
            *recorder.calls.lock().await,
            vec!["exec cmd0", "exec cmd1", "exec cmd2"]
        );

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_deferred_handle_dropped_before_activation() -> anyhow::Result<()> {
        let deferred = Arc::new(DeferredHandle::new());
        let task = {
            let deferred = deferred.clone();
            tokio::spawn(async move { deferred.exec("true", &[]).await })
        };
        while deferred.pending_count().await < 1 {
            tokio::task::yield_now().await;
        }

        // Dropping the queue settles the waiting caller.
        if let DeferredState::Pending(queue) = &mut *deferred.state.lock().await {
            queue.clear();
        }
        assert!(matches!(task.await?, Err(WebVmError::Unavailable)));

        Ok(())
    }
}
