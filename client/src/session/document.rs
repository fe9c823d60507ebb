//! Per-document session state.
//!
//! A [`DocumentSession`] is shared by every consumer of one document. It owns
//! the single remote subscription, the in-flight load, the reference count and
//! the change listeners of the subscriptions built on top of it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use sharestate_engine::{Action, DocKey, Projection, Projector};
use tokio::sync::mpsc;

use super::registry::SessionRegistry;
use super::subscription::{Subscription, Suspension};
use crate::error::{ClientError, RemoteError};
use crate::remote::{DocEvent, ListenerId, RemoteDoc};

/// Load future shared by every caller waiting on the same document.
pub(crate) type LoadFuture = Shared<BoxFuture<'static, Result<(), RemoteError>>>;

/// Called with the document value after every remote change.
type ChangeListener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Lifecycle of a document session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Created, no load started yet
    Unloaded,
    /// Load in flight
    Pending,
    /// Loaded; subscriptions can be handed out
    Resolved,
    /// Load failed; stays failed until retried
    Rejected,
}

/// Result of asking a session for a subscription.
pub enum Access {
    /// The document is loaded.
    Ready(Subscription),
    /// The document is loading; await the suspension and ask again.
    Pending(Suspension),
}

impl fmt::Debug for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Ready(sub) => f.debug_tuple("Ready").field(sub.key()).finish(),
            Access::Pending(suspension) => {
                f.debug_tuple("Pending").field(suspension.key()).finish()
            }
        }
    }
}

struct SessionState {
    status: SessionStatus,
    load: Option<LoadFuture>,
    settle: Option<oneshot::Sender<Result<(), RemoteError>>>,
    error: Option<RemoteError>,
    ref_count: usize,
    waiters: usize,
    listeners: HashMap<u64, ChangeListener>,
    next_listener: u64,
    remote_listener: Option<ListenerId>,
    /// Bumped whenever the session gains a subscriber, so a delayed release
    /// can tell it was overtaken
    epoch: u64,
    torn_down: bool,
}

impl SessionState {
    /// No subscription holds the session and nobody waits on its load.
    fn is_idle(&self) -> bool {
        self.ref_count == 0 && self.waiters == 0
    }
}

/// Shared state of one document.
pub struct DocumentSession {
    key: DocKey,
    doc: Arc<dyn RemoteDoc>,
    registry: Weak<SessionRegistry>,
    release_delay: Duration,
    state: Mutex<SessionState>,
}

impl DocumentSession {
    pub(crate) fn new(
        key: DocKey,
        doc: Arc<dyn RemoteDoc>,
        registry: Weak<SessionRegistry>,
        release_delay: Duration,
    ) -> Self {
        Self {
            key,
            doc,
            registry,
            release_delay,
            state: Mutex::new(SessionState {
                status: SessionStatus::Unloaded,
                load: None,
                settle: None,
                error: None,
                ref_count: 0,
                waiters: 0,
                listeners: HashMap::new(),
                next_listener: 0,
                remote_listener: None,
                epoch: 0,
                torn_down: false,
            }),
        }
    }

    pub fn key(&self) -> &DocKey {
        &self.key
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    /// Number of live subscriptions.
    pub fn ref_count(&self) -> usize {
        self.state.lock().ref_count
    }

    /// Number of suspended callers waiting for the load.
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters
    }

    /// The load error, if the session is rejected.
    pub fn error(&self) -> Option<RemoteError> {
        self.state.lock().error.clone()
    }

    /// Whether the session has released its remote document.
    pub fn is_torn_down(&self) -> bool {
        self.state.lock().torn_down
    }

    /// Current value of the whole document.
    pub fn data(&self) -> Value {
        self.doc.data()
    }

    /// Hand out a subscription, or a suspension while the document loads.
    ///
    /// Returns `Ok(None)` if the session was already torn down; the caller
    /// must replace it.
    pub(crate) fn access(
        self: &Arc<Self>,
        projector: Option<Projector>,
    ) -> Result<Option<Access>, ClientError> {
        let mut state = self.state.lock();
        if state.torn_down {
            return Ok(None);
        }

        match state.status {
            SessionStatus::Unloaded => {
                let load = self.start_load(&mut state);
                state.waiters += 1;
                drop(state);

                tracing::debug!(key = %self.key, "loading document");
                self.doc.subscribe();
                Ok(Some(Access::Pending(Suspension::new(self.clone(), load))))
            }
            SessionStatus::Pending => match state.load.clone() {
                Some(load) => {
                    state.waiters += 1;
                    Ok(Some(Access::Pending(Suspension::new(self.clone(), load))))
                }
                None => Ok(None),
            },
            SessionStatus::Rejected => Err(ClientError::LoadFailure {
                key: self.key.clone(),
                source: state.error.clone().unwrap_or(RemoteError::ConnectionClosed),
            }),
            SessionStatus::Resolved => {
                let subscription = self.attach(&mut state, projector);
                tracing::debug!(key = %self.key, ref_count = state.ref_count, "subscription attached");
                Ok(Some(Access::Ready(subscription)))
            }
        }
    }

    fn start_load(self: &Arc<Self>, state: &mut SessionState) -> LoadFuture {
        let (tx, rx) = oneshot::channel();
        let load = rx
            .map(|settled| settled.unwrap_or(Err(RemoteError::Destroyed)))
            .boxed()
            .shared();

        let weak = Arc::downgrade(self);
        let listener = self.doc.add_listener(Arc::new(move |event: &DocEvent| {
            if let Some(session) = weak.upgrade() {
                session.handle_event(event);
            }
        }));

        state.status = SessionStatus::Pending;
        state.load = Some(load.clone());
        state.settle = Some(tx);
        state.remote_listener = Some(listener);
        load
    }

    /// Register a subscription. Must be called with the state lock held so no
    /// change can slip between reading the data and registering the listener.
    fn attach(self: &Arc<Self>, state: &mut SessionState, projector: Option<Projector>) -> Subscription {
        let projection = Arc::new(Mutex::new(Projection::new(projector, &self.doc.data())));
        let (tx, rx) = mpsc::unbounded_channel();

        let sink = projection.clone();
        let listener: ChangeListener = Arc::new(move |data: &Value| {
            let published = sink.lock().observe(data);
            if let Some(value) = published {
                let _ = tx.send(value);
            }
        });

        let id = state.next_listener;
        state.next_listener += 1;
        state.listeners.insert(id, listener);
        state.ref_count += 1;
        state.epoch += 1;

        Subscription::new(self.clone(), id, projection, rx)
    }

    fn handle_event(self: &Arc<Self>, event: &DocEvent) {
        let status = self.state.lock().status;
        match (status, event) {
            (SessionStatus::Pending, DocEvent::Load | DocEvent::Create) => {
                // a missing document stays pending until someone creates it
                if self.doc.doc_type().is_some() {
                    self.settle(Ok(()));
                }
            }
            (SessionStatus::Pending, DocEvent::Error(error)) => self.settle(Err(error.clone())),
            (SessionStatus::Resolved, DocEvent::Error(error)) => {
                tracing::warn!(key = %self.key, error = %error, "remote error on loaded document");
            }
            (SessionStatus::Resolved, _) => self.publish(),
            _ => {}
        }
    }

    fn settle(self: &Arc<Self>, result: Result<(), RemoteError>) {
        let (settle, idle) = {
            let mut state = self.state.lock();
            if state.status != SessionStatus::Pending {
                return;
            }
            match &result {
                Ok(()) => state.status = SessionStatus::Resolved,
                Err(error) => {
                    state.status = SessionStatus::Rejected;
                    state.error = Some(error.clone());
                }
            }
            state.load = None;
            // a rejected session stays registered until it is retried
            let idle = result.is_ok() && state.is_idle();
            (state.settle.take(), idle)
        };

        match &result {
            Ok(()) => tracing::debug!(key = %self.key, "document loaded"),
            Err(error) => tracing::debug!(key = %self.key, error = %error, "document load failed"),
        }

        if let Some(settle) = settle {
            let _ = settle.send(result);
        }
        if idle {
            tracing::debug!(key = %self.key, "load settled with nobody waiting");
            self.teardown();
        }
    }

    /// Feed the current document value to every subscription.
    fn publish(&self) {
        let listeners: Vec<ChangeListener> = {
            let state = self.state.lock();
            if state.status != SessionStatus::Resolved || state.torn_down {
                return;
            }
            state.listeners.values().cloned().collect()
        };
        if listeners.is_empty() {
            return;
        }

        let data = self.doc.data();
        for listener in listeners {
            listener(&data);
        }
    }

    /// A suspended caller stopped waiting.
    pub(crate) fn release_waiter(self: &Arc<Self>) {
        let (idle, epoch) = {
            let mut state = self.state.lock();
            state.waiters = state.waiters.saturating_sub(1);
            (
                state.status == SessionStatus::Resolved && state.is_idle(),
                state.epoch,
            )
        };
        if idle {
            self.schedule_release(epoch);
        }
    }

    /// A subscription went away.
    pub(crate) fn release(self: &Arc<Self>, listener: u64) {
        let (idle, epoch) = {
            let mut state = self.state.lock();
            if state.listeners.remove(&listener).is_none() {
                return;
            }
            state.ref_count = state.ref_count.saturating_sub(1);
            tracing::debug!(key = %self.key, ref_count = state.ref_count, "subscription released");
            (state.is_idle(), state.epoch)
        };
        if idle {
            self.schedule_release(epoch);
        }
    }

    /// Tear down now, or after the release delay if nothing picked the
    /// session up again in the meantime.
    fn schedule_release(self: &Arc<Self>, epoch: u64) {
        if self.release_delay.is_zero() {
            self.teardown();
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(key = %self.key, delay = ?self.release_delay, "release scheduled");
                let session = self.clone();
                let delay = self.release_delay;
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    session.release_if_unused(epoch);
                });
            }
            Err(_) => self.teardown(),
        }
    }

    fn release_if_unused(self: &Arc<Self>, epoch: u64) {
        let idle = {
            let state = self.state.lock();
            state.epoch == epoch && state.is_idle()
        };
        if idle {
            self.teardown();
        }
    }

    /// Unsubscribe, destroy the remote document and leave the registry.
    /// Only the first call has any effect.
    pub(crate) fn teardown(self: &Arc<Self>) {
        let remote_listener = {
            let mut state = self.state.lock();
            if state.torn_down {
                return;
            }
            state.torn_down = true;
            state.listeners.clear();
            state.load = None;
            state.settle = None;
            state.remote_listener.take()
        };

        if let Some(id) = remote_listener {
            self.doc.remove_listener(id);
        }
        self.doc.unsubscribe();
        self.doc.destroy();
        if let Some(registry) = self.registry.upgrade() {
            registry.evict(self);
        }

        tracing::debug!(key = %self.key, "session torn down");
    }

    /// Resolve `action` against the current document and submit it.
    pub(crate) fn submit(&self, action: Action) -> BoxFuture<'static, Result<(), RemoteError>> {
        if self.state.lock().torn_down {
            return future::ready(Err(RemoteError::Destroyed)).boxed();
        }
        let op = action.resolve(&self.doc.data());
        if op.is_noop() {
            return future::ready(Ok(())).boxed();
        }
        self.doc.submit_op(op)
    }
}

impl fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DocumentSession")
            .field("key", &self.key)
            .field("status", &state.status)
            .field("ref_count", &state.ref_count)
            .field("waiters", &state.waiters)
            .field("torn_down", &state.torn_down)
            .finish()
    }
}
