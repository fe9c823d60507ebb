//! Connections and document handles for the in-memory store.
//!
//! A [`MemoryConnection`] owns a table of [`MemoryDoc`] handles, one per key.
//! Local writes apply to the handle's copy immediately and emit events right
//! away; everything coming from the store arrives when the backend flushes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;
use sharestate_engine::{DocKey, DocSnapshot, DocType, Op, Version, JSON0_TYPE};

use super::backend::{BackendInner, Envelope};
use super::protocol::{Request, RequestId, Response};
use super::{DocEvent, DocListener, ListenerId, ListenerSet, RemoteConnection, RemoteDoc};
use crate::error::RemoteError;

type AckSender = oneshot::Sender<Result<(), RemoteError>>;

/// Connection-side state.
pub(crate) struct ConnectionInner {
    id: String,
    backend: Arc<BackendInner>,
    docs: DashMap<DocKey, Arc<MemoryDoc>>,
    /// Submitted operations waiting for the store, by request id
    pending_acks: DashMap<RequestId, AckSender>,
    next_request: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionInner {
    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn next_request_id(&self) -> RequestId {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, request: Request) {
        self.backend.enqueue(Envelope::ToStore {
            conn_id: self.id.clone(),
            request,
        });
    }

    fn doc(&self, key: &DocKey) -> Option<Arc<MemoryDoc>> {
        self.docs.get(key).map(|doc| doc.value().clone())
    }

    /// Handle a message from the store.
    pub(crate) fn handle_response(&self, response: Response) {
        if self.is_closed() {
            // only locally generated failures reach a closed connection
            if let Response::Error { key, error, .. } = response {
                if let Some(doc) = self.doc(&key) {
                    doc.listeners.emit(&DocEvent::Error(error));
                }
            }
            return;
        }

        match response {
            Response::Snapshot { key, snapshot } => {
                if let Some(doc) = self.doc(&key) {
                    doc.load(snapshot);
                }
            }
            Response::Created { key, snapshot } => {
                if let Some(doc) = self.doc(&key) {
                    doc.remote_create(snapshot);
                }
            }
            Response::Op { key, op, version } => {
                if let Some(doc) = self.doc(&key) {
                    match doc.remote_op(op, version) {
                        RemoteOp::Applied => {}
                        RemoteOp::Deferred => {
                            tracing::debug!(key = %key, version, "remote op behind local writes, awaiting rollback");
                        }
                        RemoteOp::Resync(reason) => {
                            tracing::warn!(key = %key, version, reason = %reason, "remote op did not apply, refetching");
                            self.send(Request::Fetch { key });
                        }
                    }
                }
            }
            Response::Deleted { key, version } => {
                if let Some(doc) = self.doc(&key) {
                    doc.remote_delete(version);
                }
            }
            Response::Ack {
                key,
                request_id,
                version,
            } => {
                if let Some((_, ack)) = self.pending_acks.remove(&request_id) {
                    let _ = ack.send(Ok(()));
                }
                if let Some(doc) = self.doc(&key) {
                    if let Some(next) = doc.acknowledge(request_id, version) {
                        self.send(next);
                    }
                }
            }
            Response::Error {
                key,
                error,
                request_id: Some(request_id),
            } => {
                match self.pending_acks.remove(&request_id) {
                    Some((_, ack)) => {
                        let _ = ack.send(Err(error));
                    }
                    None => {
                        tracing::warn!(key = %key, error = %error, "request failed");
                    }
                }
                // the local copy is now ahead of the store; roll it back
                if let Some(dropped) = self.doc(&key).and_then(|doc| doc.reject(request_id)) {
                    self.fail_acks(dropped, || {
                        RemoteError::Rejected(format!("an earlier write to {} was rejected", key))
                    });
                    self.send(Request::Fetch { key });
                }
            }
            Response::Error {
                key,
                error,
                request_id: None,
            } => {
                if let Some(doc) = self.doc(&key) {
                    doc.listeners.emit(&DocEvent::Error(error));
                }
            }
            Response::Closed => {}
        }
    }

    fn fail_acks(&self, request_ids: Vec<RequestId>, error: impl Fn() -> RemoteError) {
        for request_id in request_ids {
            if let Some((_, ack)) = self.pending_acks.remove(&request_id) {
                let _ = ack.send(Err(error()));
            }
        }
    }

    /// Remove a destroyed handle, unless it was already replaced.
    pub(crate) fn evict(&self, doc: &Arc<MemoryDoc>) {
        self.docs
            .remove_if(&doc.key, |_, existing| Arc::ptr_eq(existing, doc));
    }
}

/// A connection to a [`MemoryBackend`](super::MemoryBackend).
///
/// Cloning is cheap and shares the same connection.
#[derive(Clone)]
pub struct MemoryConnection {
    inner: Arc<ConnectionInner>,
}

impl MemoryConnection {
    pub(crate) fn open(backend: Arc<BackendInner>) -> Self {
        let inner = Arc::new(ConnectionInner {
            id: uuid::Uuid::new_v4().to_string(),
            backend,
            docs: DashMap::new(),
            pending_acks: DashMap::new(),
            next_request: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });
        inner.backend.register(&inner);
        Self { inner }
    }

    /// Concrete handle for `key`, if the connection has one.
    pub fn doc(&self, key: &DocKey) -> Option<Arc<MemoryDoc>> {
        self.inner.doc(key)
    }

    /// Number of handles in the connection's table.
    pub fn doc_count(&self) -> usize {
        self.inner.docs.len()
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Re-request every subscribed document, as after a dropped transport.
    /// Each handle receives a fresh `Load`.
    pub fn reconnect(&self) {
        if self.inner.is_closed() {
            return;
        }
        let keys: Vec<DocKey> = self
            .inner
            .docs
            .iter()
            .filter(|entry| entry.value().want_subscribe())
            .map(|entry| entry.key().clone())
            .collect();

        tracing::info!(conn_id = %self.inner.id, documents = keys.len(), "resubscribing");
        for key in keys {
            self.inner.send(Request::Subscribe { key });
        }
    }
}

impl RemoteConnection for MemoryConnection {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn get(&self, key: &DocKey) -> Arc<dyn RemoteDoc> {
        let mut entry = self
            .inner
            .docs
            .entry(key.clone())
            .or_insert_with(|| Arc::new(MemoryDoc::new(key.clone(), &self.inner)));
        if entry.value().is_destroyed() {
            *entry.value_mut() = Arc::new(MemoryDoc::new(key.clone(), &self.inner));
        }
        let doc: Arc<MemoryDoc> = entry.value().clone();
        doc
    }

    fn get_existing(&self, key: &DocKey) -> Option<Arc<dyn RemoteDoc>> {
        self.inner.doc(key).map(|doc| doc as Arc<dyn RemoteDoc>)
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.backend.unregister(&self.inner.id);

        let pending: Vec<RequestId> = self
            .inner
            .pending_acks
            .iter()
            .map(|entry| *entry.key())
            .collect();
        for request_id in pending {
            if let Some((_, ack)) = self.inner.pending_acks.remove(&request_id) {
                let _ = ack.send(Err(RemoteError::ConnectionClosed));
            }
        }
    }
}

/// What became of an operation broadcast by the store.
#[derive(Debug, PartialEq)]
enum RemoteOp {
    Applied,
    /// Local writes are pending and the store will reject them, which
    /// refetches the document.
    Deferred,
    /// The local copy cannot take the op and must be refetched.
    Resync(String),
}

#[derive(Debug)]
struct DocState {
    snapshot: DocSnapshot,
    /// The write the store has not answered yet
    sent: Option<RequestId>,
    /// Writes held back until the one in flight is answered
    queued: VecDeque<Request>,
    want_subscribe: bool,
    destroyed: bool,
}

/// A document handle on a [`MemoryConnection`].
pub struct MemoryDoc {
    key: DocKey,
    connection: Weak<ConnectionInner>,
    state: Mutex<DocState>,
    listeners: ListenerSet,
}

impl MemoryDoc {
    fn new(key: DocKey, connection: &Arc<ConnectionInner>) -> Self {
        Self {
            key,
            connection: Arc::downgrade(connection),
            state: Mutex::new(DocState {
                snapshot: DocSnapshot::unloaded(),
                sent: None,
                queued: VecDeque::new(),
                want_subscribe: false,
                destroyed: false,
            }),
            listeners: ListenerSet::new(),
        }
    }

    fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// The connection, if it is still open.
    fn open_connection(&self) -> Result<Arc<ConnectionInner>, RemoteError> {
        match self.connection.upgrade() {
            Some(conn) if !conn.is_closed() => Ok(conn),
            _ => Err(RemoteError::ConnectionClosed),
        }
    }

    /// Queue a failure for this handle, delivered on the next flush.
    fn fail_later(&self, error: RemoteError) {
        if let Some(conn) = self.connection.upgrade() {
            conn.backend.enqueue(Envelope::ToConnection {
                conn: self.connection.clone(),
                response: Response::error(self.key.clone(), error, None),
            });
        }
    }

    /// Record a local write. Returns the request if it can go out now; with
    /// another write in flight it waits for that one's answer.
    fn write(state: &mut DocState, request: Request) -> Option<Request> {
        if state.sent.is_some() {
            state.queued.push_back(request);
            return None;
        }
        Some(Self::stamp(state, request))
    }

    /// Mark `request` as the write in flight, basing a submit on the
    /// confirmed version of the document.
    fn stamp(state: &mut DocState, mut request: Request) -> Request {
        if let Request::Submit { version, .. } = &mut request {
            *version = state.snapshot.version.unwrap_or(0);
        }
        state.sent = request.request_id();
        request
    }

    /// The store accepted write `request_id` at `version`. Returns the next
    /// write to send, if any.
    fn acknowledge(&self, request_id: RequestId, version: Version) -> Option<Request> {
        let mut state = self.state.lock();
        if state.sent != Some(request_id) {
            return None;
        }
        state.sent = None;
        state.snapshot.version = Some(version);
        let next = state.queued.pop_front()?;
        Some(Self::stamp(&mut state, next))
    }

    /// The store refused write `request_id`. Writes queued behind it were made
    /// on top of it and are dropped; returns their ids, or `None` if the
    /// write was not this handle's.
    fn reject(&self, request_id: RequestId) -> Option<Vec<RequestId>> {
        let mut state = self.state.lock();
        if state.sent != Some(request_id) {
            return None;
        }
        state.sent = None;
        Some(Self::drain_queued(&mut state))
    }

    fn drain_queued(state: &mut DocState) -> Vec<RequestId> {
        state
            .queued
            .drain(..)
            .filter_map(|request| request.request_id())
            .collect()
    }

    fn load(&self, snapshot: DocSnapshot) {
        {
            let mut state = self.state.lock();
            // a snapshot taken before our own writes landed would undo them
            if state.destroyed || state.sent.is_some() {
                return;
            }
            state.snapshot = snapshot;
        }
        self.listeners.emit(&DocEvent::Load);
    }

    fn remote_create(&self, snapshot: DocSnapshot) {
        {
            let mut state = self.state.lock();
            if state.destroyed || state.snapshot.exists() {
                return;
            }
            state.snapshot = snapshot;
        }
        self.listeners.emit(&DocEvent::Create);
    }

    fn remote_op(&self, op: Op, version: Version) -> RemoteOp {
        {
            let mut state = self.state.lock();
            if state.destroyed || !state.snapshot.exists() {
                return RemoteOp::Applied;
            }
            // the store orders ops by version, so ours were written against a
            // copy without this one and will be rejected
            if state.sent.is_some() {
                return RemoteOp::Deferred;
            }
            let expected = state.snapshot.version.unwrap_or(0) + 1;
            if version != expected {
                return RemoteOp::Resync(format!("expected version {}, got {}", expected, version));
            }
            if let Err(error) = op.apply(&mut state.snapshot.data) {
                return RemoteOp::Resync(error.to_string());
            }
            state.snapshot.version = Some(version);
        }
        self.listeners.emit(&DocEvent::Op(op));
        RemoteOp::Applied
    }

    fn remote_delete(&self, version: Version) {
        {
            let mut state = self.state.lock();
            if state.destroyed || !state.snapshot.exists() {
                return;
            }
            state.snapshot.doc_type = None;
            state.snapshot.data = Value::Null;
            state.snapshot.version = Some(version);
        }
        self.listeners.emit(&DocEvent::Del);
    }

    /// Delete the document locally and in the store.
    pub fn delete(&self) -> Result<(), RemoteError> {
        let conn = self.open_connection()?;
        let outgoing = {
            let mut state = self.state.lock();
            if !state.snapshot.exists() {
                return Err(RemoteError::NotCreated(self.key.clone()));
            }
            state.snapshot.doc_type = None;
            state.snapshot.data = Value::Null;
            Self::write(
                &mut state,
                Request::Delete {
                    key: self.key.clone(),
                    request_id: conn.next_request_id(),
                },
            )
        };
        if let Some(request) = outgoing {
            conn.send(request);
        }
        self.listeners.emit(&DocEvent::Del);
        Ok(())
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl RemoteDoc for MemoryDoc {
    fn key(&self) -> &DocKey {
        &self.key
    }

    fn subscribe(&self) {
        self.state.lock().want_subscribe = true;
        match self.open_connection() {
            Ok(conn) => conn.send(Request::Subscribe {
                key: self.key.clone(),
            }),
            Err(error) => self.fail_later(error),
        }
    }

    fn unsubscribe(&self) {
        self.state.lock().want_subscribe = false;
        if let Ok(conn) = self.open_connection() {
            conn.send(Request::Unsubscribe {
                key: self.key.clone(),
            });
        }
    }

    fn destroy(&self) {
        let dropped = {
            let mut state = self.state.lock();
            state.destroyed = true;
            Self::drain_queued(&mut state)
        };
        self.listeners.clear();

        let conn = match self.connection.upgrade() {
            Some(conn) => conn,
            None => return,
        };
        conn.fail_acks(dropped, || RemoteError::Destroyed);
        let doc = match conn.doc(&self.key) {
            Some(doc) if std::ptr::eq(Arc::as_ptr(&doc), self) => doc,
            _ => return,
        };
        if conn.is_closed() {
            conn.evict(&doc);
        } else {
            conn.backend.enqueue(Envelope::Evict {
                conn: self.connection.clone(),
                doc,
            });
        }
    }

    fn create(&self, data: Value) {
        let conn = match self.open_connection() {
            Ok(conn) => conn,
            Err(error) => {
                tracing::warn!(key = %self.key, error = %error, "create on closed connection");
                return;
            }
        };
        let outgoing = {
            let mut state = self.state.lock();
            if state.snapshot.exists() {
                tracing::warn!(key = %self.key, "create on a document that already exists");
                return;
            }
            state.snapshot.doc_type = Some(JSON0_TYPE.to_string());
            state.snapshot.data = data.clone();
            Self::write(
                &mut state,
                Request::Create {
                    key: self.key.clone(),
                    data,
                    request_id: conn.next_request_id(),
                },
            )
        };
        if let Some(request) = outgoing {
            conn.send(request);
        }
        self.listeners.emit(&DocEvent::Create);
    }

    fn submit_op(&self, op: Op) -> BoxFuture<'static, Result<(), RemoteError>> {
        let conn = match self.open_connection() {
            Ok(conn) => conn,
            Err(error) => return future::ready(Err(error)).boxed(),
        };
        let request_id = conn.next_request_id();
        let (tx, rx) = oneshot::channel();
        let outgoing = {
            let mut state = self.state.lock();
            if state.destroyed {
                return future::ready(Err(RemoteError::Destroyed)).boxed();
            }
            if !state.snapshot.exists() {
                return future::ready(Err(RemoteError::NotCreated(self.key.clone()))).boxed();
            }
            if let Err(e) = op.apply(&mut state.snapshot.data) {
                return future::ready(Err(RemoteError::from(e))).boxed();
            }
            conn.pending_acks.insert(request_id, tx);
            Self::write(
                &mut state,
                Request::Submit {
                    key: self.key.clone(),
                    op: op.clone(),
                    version: 0,
                    request_id,
                },
            )
        };
        if let Some(request) = outgoing {
            conn.send(request);
        }
        self.listeners.emit(&DocEvent::Op(op));

        async move { rx.await.unwrap_or(Err(RemoteError::ConnectionClosed)) }.boxed()
    }

    fn add_listener(&self, listener: DocListener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    fn doc_type(&self) -> Option<DocType> {
        self.state.lock().snapshot.doc_type.clone()
    }

    fn version(&self) -> Option<Version> {
        self.state.lock().snapshot.version
    }

    fn data(&self) -> Value {
        self.state.lock().snapshot.data.clone()
    }

    fn want_subscribe(&self) -> bool {
        self.state.lock().want_subscribe
    }
}
