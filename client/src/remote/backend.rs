//! In-memory remote store.
//!
//! Holds the authoritative copy of every document plus the subscriber table,
//! and moves messages between the store and its connections through a single
//! FIFO queue. Nothing is delivered until [`MemoryBackend::flush`] is called,
//! which makes every exchange deterministic: "let the server flush" is one
//! explicit call.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use sharestate_engine::{DocKey, DocSnapshot, JSON0_TYPE};

use super::memory::{ConnectionInner, MemoryConnection, MemoryDoc};
use super::protocol::{Request, Response};
use super::{Connector, RemoteConnection};
use crate::error::RemoteError;

/// A queued unit of work.
pub(crate) enum Envelope {
    /// A request travelling from a connection to the store.
    ToStore { conn_id: String, request: Request },
    /// A response travelling from the store to a connection.
    ToConnection {
        conn: Weak<ConnectionInner>,
        response: Response,
    },
    /// Remove a destroyed handle from its connection's table.
    Evict {
        conn: Weak<ConnectionInner>,
        doc: Arc<MemoryDoc>,
    },
}

/// Store-side state shared by the backend and its connections.
#[derive(Default)]
pub(crate) struct BackendInner {
    /// Authoritative documents
    docs: DashMap<DocKey, DocSnapshot>,
    /// Connection ids subscribed to each document
    subscribers: DashMap<DocKey, HashSet<String>>,
    /// Live connections by id
    connections: DashMap<String, Weak<ConnectionInner>>,
    /// Injected failures for the next load of a document
    load_failures: DashMap<DocKey, RemoteError>,
    /// Undelivered messages
    queue: Mutex<VecDeque<Envelope>>,
}

impl BackendInner {
    pub(crate) fn enqueue(&self, envelope: Envelope) {
        self.queue.lock().push_back(envelope);
    }

    pub(crate) fn register(&self, conn: &Arc<ConnectionInner>) {
        self.connections
            .insert(conn.id().to_string(), Arc::downgrade(conn));
        tracing::info!(conn_id = %conn.id(), "memory connection registered");
    }

    pub(crate) fn unregister(&self, conn_id: &str) {
        if self.connections.remove(conn_id).is_some() {
            self.subscribers.retain(|_, ids| {
                ids.remove(conn_id);
                !ids.is_empty()
            });
            tracing::info!(conn_id = %conn_id, "memory connection unregistered");
        }
    }

    fn send_to(&self, conn_id: &str, response: Response) {
        let conn = match self.connections.get(conn_id) {
            Some(conn) => conn.value().clone(),
            None => return,
        };
        self.enqueue(Envelope::ToConnection { conn, response });
    }

    /// Queue `response` for every subscriber of `key` except `sender_conn_id`.
    /// Returns the number of recipients.
    fn broadcast_except(&self, key: &DocKey, sender_conn_id: &str, response: Response) -> usize {
        let recipients: Vec<String> = match self.subscribers.get(key) {
            Some(ids) => ids
                .iter()
                .filter(|id| id.as_str() != sender_conn_id)
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        for conn_id in &recipients {
            self.send_to(conn_id, response.clone());
        }

        tracing::debug!(
            key = %key,
            sender = %sender_conn_id,
            recipients = recipients.len(),
            "broadcast to subscribers"
        );

        recipients.len()
    }

    fn current_snapshot(&self, key: &DocKey) -> DocSnapshot {
        self.docs
            .get(key)
            .map(|doc| doc.value().clone())
            .unwrap_or_else(DocSnapshot::missing)
    }

    fn reply_snapshot(&self, conn_id: &str, key: DocKey) {
        if let Some((_, error)) = self.load_failures.remove(&key) {
            tracing::debug!(key = %key, error = %error, "injected load failure");
            self.send_to(conn_id, Response::error(key, error, None));
            return;
        }
        let snapshot = self.current_snapshot(&key);
        self.send_to(conn_id, Response::Snapshot { key, snapshot });
    }

    fn handle_request(&self, conn_id: &str, request: Request) {
        tracing::trace!(conn_id = %conn_id, ?request, "store received request");

        match request {
            Request::Subscribe { key } => {
                self.subscribers
                    .entry(key.clone())
                    .or_default()
                    .insert(conn_id.to_string());
                self.reply_snapshot(conn_id, key);
            }
            Request::Unsubscribe { key } => {
                if let Some(mut ids) = self.subscribers.get_mut(&key) {
                    ids.remove(conn_id);
                    if ids.is_empty() {
                        drop(ids);
                        self.subscribers.remove_if(&key, |_, ids| ids.is_empty());
                    }
                }
            }
            Request::Fetch { key } => self.reply_snapshot(conn_id, key),
            Request::Create {
                key,
                data,
                request_id,
            } => {
                let created = {
                    let mut entry = self.docs.entry(key.clone()).or_insert_with(DocSnapshot::missing);
                    if entry.exists() {
                        None
                    } else {
                        entry.doc_type = Some(JSON0_TYPE.to_string());
                        entry.version = Some(entry.version.unwrap_or(0) + 1);
                        entry.data = data;
                        Some(entry.value().clone())
                    }
                };

                match created {
                    Some(snapshot) => {
                        let version = snapshot.version.unwrap_or(1);
                        self.send_to(
                            conn_id,
                            Response::Ack {
                                key: key.clone(),
                                request_id,
                                version,
                            },
                        );
                        self.broadcast_except(
                            &key,
                            conn_id,
                            Response::Created {
                                key: key.clone(),
                                snapshot,
                            },
                        );
                    }
                    None => {
                        let error = RemoteError::AlreadyExists(key.clone());
                        self.send_to(conn_id, Response::error(key, error, Some(request_id)));
                    }
                }
            }
            Request::Submit {
                key,
                op,
                version: base,
                request_id,
            } => {
                let applied = match self.docs.get_mut(&key) {
                    Some(mut doc) if doc.exists() => {
                        let current = doc.version.unwrap_or(0);
                        if base != current {
                            // written against a copy that misses operations
                            Err(RemoteError::Rejected(format!(
                                "operation based on version {} but the document is at {}",
                                base, current
                            )))
                        } else {
                            match op.apply(&mut doc.data) {
                                Ok(()) => {
                                    doc.version = Some(current + 1);
                                    Ok(current + 1)
                                }
                                Err(e) => Err(RemoteError::from(e)),
                            }
                        }
                    }
                    _ => Err(RemoteError::NotCreated(key.clone())),
                };

                match applied {
                    Ok(version) => {
                        self.send_to(
                            conn_id,
                            Response::Ack {
                                key: key.clone(),
                                request_id,
                                version,
                            },
                        );
                        self.broadcast_except(
                            &key,
                            conn_id,
                            Response::Op {
                                key: key.clone(),
                                op,
                                version,
                            },
                        );
                    }
                    Err(error) => {
                        tracing::warn!(key = %key, error = %error, "operation rejected");
                        self.send_to(conn_id, Response::error(key, error, Some(request_id)));
                    }
                }
            }
            Request::Delete { key, request_id } => {
                let deleted = match self.docs.get_mut(&key) {
                    Some(mut doc) if doc.exists() => {
                        let version = doc.version.unwrap_or(0) + 1;
                        doc.doc_type = None;
                        doc.data = serde_json::Value::Null;
                        doc.version = Some(version);
                        Some(version)
                    }
                    _ => None,
                };

                match deleted {
                    Some(version) => {
                        self.send_to(
                            conn_id,
                            Response::Ack {
                                key: key.clone(),
                                request_id,
                                version,
                            },
                        );
                        self.broadcast_except(
                            &key,
                            conn_id,
                            Response::Deleted {
                                key: key.clone(),
                                version,
                            },
                        );
                    }
                    None => {
                        let error = RemoteError::NotCreated(key.clone());
                        self.send_to(conn_id, Response::error(key, error, Some(request_id)));
                    }
                }
            }
        }
    }
}

/// An in-process remote store.
///
/// Cloning is cheap and shares the same store.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<BackendInner>,
}

impl MemoryBackend {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to the store.
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection::open(self.inner.clone())
    }

    /// Deliver queued messages until the queue is empty, including messages
    /// queued while delivering. Returns the number of messages delivered.
    pub fn flush(&self) -> usize {
        let mut delivered = 0;

        loop {
            let next = self.inner.queue.lock().pop_front();
            let envelope = match next {
                Some(envelope) => envelope,
                None => break,
            };
            delivered += 1;

            match envelope {
                Envelope::ToStore { conn_id, request } => {
                    self.inner.handle_request(&conn_id, request);
                }
                Envelope::ToConnection { conn, response } => {
                    if let Some(conn) = conn.upgrade() {
                        conn.handle_response(response);
                    }
                }
                Envelope::Evict { conn, doc } => {
                    if let Some(conn) = conn.upgrade() {
                        conn.evict(&doc);
                    }
                }
            }
        }

        delivered
    }

    /// Number of undelivered messages.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// The store's copy of a document, if it was ever created.
    pub fn snapshot(&self, key: &DocKey) -> Option<DocSnapshot> {
        self.inner.docs.get(key).map(|doc| doc.value().clone())
    }

    /// Number of connections subscribed to a document.
    pub fn subscriber_count(&self, key: &DocKey) -> usize {
        self.inner.subscribers.get(key).map_or(0, |ids| ids.len())
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Make the next subscribe or fetch of `key` fail with `error`.
    pub fn fail_next_load(&self, key: DocKey, error: RemoteError) {
        self.inner.load_failures.insert(key, error);
    }
}

impl Connector for MemoryBackend {
    fn connect(&self) -> Arc<dyn RemoteConnection> {
        Arc::new(MemoryBackend::connect(self))
    }
}
