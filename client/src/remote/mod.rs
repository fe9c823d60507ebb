//! The remote store contract.
//!
//! The session cache never talks to a network itself. It drives per-document
//! handles ([`RemoteDoc`]) obtained from a [`RemoteConnection`] and reacts to
//! the [`DocEvent`]s those handles emit. Any collaborative store that can
//! honour this contract can back the cache; [`memory`] provides one that keeps
//! everything in process.

pub mod memory;
pub mod protocol;

mod backend;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use sharestate_engine::{DocKey, DocType, Op, Version};

use crate::error::RemoteError;

pub use backend::MemoryBackend;
pub use memory::{MemoryConnection, MemoryDoc};

/// Identifier handed out when registering a listener.
pub type ListenerId = u64;

/// Callback invoked for every event a document emits.
pub type DocListener = Arc<dyn Fn(&DocEvent) + Send + Sync>;

/// Events emitted by a remote document handle.
///
/// `Load`, `Create` and `Del` describe the document as a whole; `Op` fires
/// once per applied operation, local or remote, in application order.
#[derive(Debug, Clone, PartialEq)]
pub enum DocEvent {
    /// The document was created
    Create,
    /// An operation was applied to the local copy
    Op(Op),
    /// The document was deleted
    Del,
    /// A snapshot was loaded from the store
    Load,
    /// The store reported an error for this document
    Error(RemoteError),
}

/// Handle to one document on a remote store connection.
pub trait RemoteDoc: Send + Sync {
    /// Key of the document.
    fn key(&self) -> &DocKey;

    /// Ask the store for the document and for every later operation.
    fn subscribe(&self);

    /// Stop receiving operations for the document.
    fn unsubscribe(&self);

    /// Drop the handle from its connection.
    fn destroy(&self);

    /// Ask the store to create the document with `data`.
    fn create(&self, data: Value);

    /// Submit an operation. Resolves when the store acknowledges it.
    fn submit_op(&self, op: Op) -> BoxFuture<'static, Result<(), RemoteError>>;

    /// Register an event listener.
    fn add_listener(&self, listener: DocListener) -> ListenerId;

    /// Remove a previously registered listener.
    fn remove_listener(&self, id: ListenerId);

    /// Type of the document, `None` until created.
    fn doc_type(&self) -> Option<DocType>;

    /// Version of the local copy, `None` until loaded.
    fn version(&self) -> Option<Version>;

    /// Current value of the local copy.
    fn data(&self) -> Value;

    /// Whether the handle currently wants to be subscribed.
    fn want_subscribe(&self) -> bool;
}

/// A connection to a remote store, owning a table of document handles.
pub trait RemoteConnection: Send + Sync {
    /// Identifier of the connection.
    fn id(&self) -> &str;

    /// Get the handle for `key`, creating it if the connection has none.
    fn get(&self, key: &DocKey) -> Arc<dyn RemoteDoc>;

    /// Get the handle for `key` only if the connection already has one.
    fn get_existing(&self, key: &DocKey) -> Option<Arc<dyn RemoteDoc>>;

    /// Close the connection.
    fn close(&self);
}

/// Something that can open a connection bound to its transport.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Arc<dyn RemoteConnection>;
}

/// Listener table shared by document handle implementations.
///
/// Listeners are invoked outside the table lock, so a listener may add or
/// remove listeners or call back into the document.
#[derive(Default)]
pub struct ListenerSet {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, DocListener)>>,
}

impl ListenerSet {
    /// Create an empty listener table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener and return its id.
    pub fn add(&self, listener: DocListener) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, listener));
        id
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn remove(&self, id: ListenerId) {
        self.listeners.lock().retain(|(existing, _)| *existing != id);
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.listeners.lock().clear();
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every listener registered at the time of the call.
    pub fn emit(&self, event: &DocEvent) {
        let snapshot: Vec<DocListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }
}
