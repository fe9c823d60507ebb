//! Consumer-side handles: suspensions, subscriptions and dispatchers.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sharestate_engine::{Action, DocKey, Projection, ProjectionState, Projector};
use tokio::sync::mpsc;

use super::document::{DocumentSession, LoadFuture};
use crate::error::{ClientError, Result};

/// A caller waiting for a document to load.
///
/// Resolves once the load settles. On success, ask the cache again to get a
/// [`Subscription`]; on failure the error is a [`ClientError::LoadFailure`].
///
/// A loaded document nobody subscribed to is released as soon as its last
/// suspension is dropped, so keep the suspension until the next access.
/// [`SessionCache::access`](crate::SessionCache::access) does this for you.
#[must_use = "a suspension does nothing unless awaited"]
pub struct Suspension {
    session: Arc<DocumentSession>,
    load: LoadFuture,
    outcome: Option<Result<()>>,
}

impl Suspension {
    pub(crate) fn new(session: Arc<DocumentSession>, load: LoadFuture) -> Self {
        Self {
            session,
            load,
            outcome: None,
        }
    }

    /// Key of the document being loaded.
    pub fn key(&self) -> &DocKey {
        self.session.key()
    }
}

impl Future for Suspension {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = &self.outcome {
            return Poll::Ready(outcome.clone());
        }

        let settled = match Pin::new(&mut self.load).poll(cx) {
            Poll::Ready(settled) => settled,
            Poll::Pending => return Poll::Pending,
        };
        let outcome = settled.map_err(|source| ClientError::LoadFailure {
            key: self.session.key().clone(),
            source,
        });
        self.outcome = Some(outcome.clone());
        Poll::Ready(outcome)
    }
}

impl Drop for Suspension {
    fn drop(&mut self) {
        self.session.release_waiter();
    }
}

impl fmt::Debug for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspension")
            .field("key", self.key())
            .field("settled", &self.outcome.is_some())
            .finish()
    }
}

/// A consumer's live view of a loaded document.
///
/// Holds one reference on the document session; dropping the last
/// subscription of a document releases it.
pub struct Subscription {
    session: Arc<DocumentSession>,
    listener: u64,
    projection: Arc<Mutex<Projection>>,
    changes: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    pub(crate) fn new(
        session: Arc<DocumentSession>,
        listener: u64,
        projection: Arc<Mutex<Projection>>,
        changes: mpsc::UnboundedReceiver<Value>,
    ) -> Self {
        Self {
            session,
            listener,
            projection,
            changes,
        }
    }

    pub fn key(&self) -> &DocKey {
        self.session.key()
    }

    /// The current projected state.
    pub fn state(&self) -> Value {
        self.projection.lock().value().clone()
    }

    /// The current projected state, deserialized.
    pub fn state_as<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_value(self.state())
    }

    /// Projection bookkeeping: last document value seen and last slice published.
    pub fn projection_state(&self) -> ProjectionState {
        self.projection.lock().state().clone()
    }

    /// Wait for the next published change.
    ///
    /// Returns `None` once the session has been torn down.
    pub async fn changed(&mut self) -> Option<Value> {
        self.changes.recv().await
    }

    /// Take the next published change without waiting.
    pub fn try_changed(&mut self) -> Option<Value> {
        self.changes.try_recv().ok()
    }

    /// Discard queued changes and return how many there were.
    pub fn drain_changes(&mut self) -> usize {
        let mut drained = 0;
        while self.changes.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    /// Swap the projector and re-project the document.
    ///
    /// Returns the new state if it differs from the published one.
    pub fn set_projector(&self, projector: Option<Projector>) -> Option<Value> {
        let replaced = self.projection.lock().replace_projector(projector);
        if replaced.is_some() {
            tracing::debug!(key = %self.key(), "projector replaced");
        }
        replaced
    }

    /// A handle for submitting changes to the document.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            session: self.session.clone(),
        }
    }

    /// Hand the current state and a dispatcher to `f`.
    pub fn render<R>(&self, f: impl FnOnce(&Value, &Dispatcher) -> R) -> R {
        let state = self.state();
        let dispatcher = self.dispatcher();
        f(&state, &dispatcher)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.session.release(self.listener);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", self.key())
            .field("projection", &*self.projection.lock())
            .finish()
    }
}

/// Submits changes to one document.
///
/// Outlives its subscription; once the session is torn down every dispatch
/// fails with [`RemoteError::Destroyed`](crate::RemoteError::Destroyed).
#[derive(Clone)]
pub struct Dispatcher {
    session: Arc<DocumentSession>,
}

impl Dispatcher {
    pub fn key(&self) -> &DocKey {
        self.session.key()
    }

    /// Submit `action`. A derived action sees the document as it is now.
    ///
    /// The local copy changes immediately; the future resolves when the store
    /// acknowledges the operation.
    pub fn dispatch(
        &self,
        action: impl Into<Action>,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let key = self.key().clone();
        let submitted = self.session.submit(action.into());
        async move {
            submitted.await.map_err(|source| {
                tracing::debug!(key = %key, error = %source, "dispatch failed");
                ClientError::DispatchFailure { key, source }
            })
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").field("key", self.key()).finish()
    }
}
