//! Lazily opened, reference-counted resources.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::{BoxFuture, JdwpError, Result, LOG_TARGET};

/// A resource with a graceful and a forced teardown.
pub trait AutoShutdown: Send + Sync + 'static {
    /// Graceful teardown; errors are logged, never propagated to users.
    fn shutdown(&self) -> impl Future<Output = Result<()>> + Send;

    /// Release everything immediately. Must be idempotent.
    fn close(&self);
}

type Factory<T> = Box<dyn Fn() -> BoxFuture<Result<T>> + Send + Sync>;

/// Opens a `T` on first [`retain`](Self::retain) and tears it down
/// (`shutdown` then `close`) when the matching last [`release`](Self::release)
/// happens. A later retain opens a fresh instance.
///
/// Cloning yields another handle to the same counter.
pub struct ReferenceCounted<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    name: String,
    factory: Factory<T>,
    state: Mutex<State<T>>,
    active: AtomicUsize,
    closed: AtomicBool,
}

struct State<T> {
    count: usize,
    value: Option<T>,
}

impl<T> Clone for ReferenceCounted<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: AutoShutdown + Clone> ReferenceCounted<T> {
    pub fn new<F, Fut>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                factory: Box::new(move || Box::pin(factory())),
                state: Mutex::new(State {
                    count: 0,
                    value: None,
                }),
                active: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Take a reference, opening the resource if nobody holds one.
    ///
    /// A failed or cancelled open leaves the counter untouched, so the next
    /// retain tries again.
    pub async fn retain(&self) -> Result<T> {
        self.check_open()?;
        let mut state = self.inner.state.lock().await;
        self.check_open()?;
        let value = match &state.value {
            Some(value) => value.clone(),
            None => {
                tracing::debug!(target: LOG_TARGET, resource = %self.inner.name, "opening shared resource");
                let value = (self.inner.factory)().await?;
                state.value = Some(value.clone());
                value
            }
        };
        state.count += 1;
        self.inner.active.store(state.count, Ordering::Release);
        Ok(value)
    }

    /// Drop a reference taken by [`retain`](Self::retain).
    pub async fn release(&self) {
        let mut state = self.inner.state.lock().await;
        if state.count == 0 {
            if !self.inner.closed.load(Ordering::Acquire) {
                tracing::warn!(target: LOG_TARGET, resource = %self.inner.name, "release without a matching retain");
            }
            return;
        }
        state.count -= 1;
        self.inner.active.store(state.count, Ordering::Release);
        if state.count > 0 {
            return;
        }
        if let Some(value) = state.value.take() {
            tracing::debug!(target: LOG_TARGET, resource = %self.inner.name, "last reference released; shutting down");
            let name = self.inner.name.clone();
            // Runs to completion even if this call is dropped mid-shutdown.
            run_detached(&self.inner.name, async move {
                if let Err(err) = value.shutdown().await {
                    tracing::debug!(target: LOG_TARGET, resource = %name, error = %err, "graceful shutdown failed");
                }
                value.close();
            })
            .await;
        }
    }

    /// Run `f` with the resource retained for its whole duration.
    ///
    /// The reference is released when `f` finishes, fails, or when the
    /// returned future is dropped.
    pub async fn with_resource<R, F, Fut>(&self, f: F) -> Result<R>
    where
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let value = self.retain().await?;
        let mut retained = Retained {
            owner: Some(self.clone()),
        };
        let result = f(value).await;
        retained.release().await;
        result
    }

    pub fn is_active(&self) -> bool {
        self.ref_count() > 0
    }

    pub fn ref_count(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Force-close the current instance, if any. Later retains fail with
    /// [`JdwpError::Closed`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.inner.state.lock().await;
        state.count = 0;
        self.inner.active.store(0, Ordering::Release);
        if let Some(value) = state.value.take() {
            tracing::debug!(target: LOG_TARGET, resource = %self.inner.name, "closing shared resource");
            value.close();
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(JdwpError::Closed("reference-counted resource"));
        }
        Ok(())
    }
}

/// Spawn `task` and wait for it, so dropping the caller does not cut it short.
/// Outside a tokio runtime it runs inline.
async fn run_detached(resource: &str, task: impl Future<Output = ()> + Send + 'static) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            if let Err(err) = handle.spawn(task).await {
                tracing::warn!(target: LOG_TARGET, resource, error = %err, "release task failed");
            }
        }
        Err(_) => task.await,
    }
}

/// Releases its reference on drop when the owning future is cancelled.
struct Retained<T: AutoShutdown + Clone> {
    owner: Option<ReferenceCounted<T>>,
}

impl<T: AutoShutdown + Clone> Retained<T> {
    async fn release(&mut self) {
        if let Some(owner) = self.owner.take() {
            let name = owner.inner.name.clone();
            run_detached(&name, async move { owner.release().await }).await;
        }
    }
}

impl<T: AutoShutdown + Clone> Drop for Retained<T> {
    fn drop(&mut self) {
        let Some(owner) = self.owner.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { owner.release().await });
            }
            Err(_) => tracing::warn!(
                target: LOG_TARGET,
                resource = %owner.inner.name,
                "no tokio runtime to release a cancelled reference"
            ),
        }
    }
}
