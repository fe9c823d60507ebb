//! Shared helpers for client integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Poll;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use sharestate_client::{
    Config, DocListener, ListenerId, MemoryBackend, MemoryConnection, RemoteConnection,
    RemoteDoc, SessionCache, Subscription,
};
use sharestate_engine::{DocKey, DocType, Op, Version};

/// Calls made on the handles of one document.
#[derive(Debug, Default)]
pub struct DocCalls {
    pub subscribe: AtomicUsize,
    pub unsubscribe: AtomicUsize,
    pub destroy: AtomicUsize,
    pub submit: AtomicUsize,
    /// Lifecycle calls in the order they were made
    pub log: Mutex<Vec<&'static str>>,
}

impl DocCalls {
    pub fn subscribes(&self) -> usize {
        self.subscribe.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.unsubscribe.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroy.load(Ordering::SeqCst)
    }

    pub fn submits(&self) -> usize {
        self.submit.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<&'static str> {
        self.log.lock().clone()
    }

    fn record(&self, counter: &AtomicUsize, call: &'static str) {
        counter.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(call);
    }
}

/// A memory connection that counts the calls made on its document handles.
pub struct RecordingConnection {
    inner: MemoryConnection,
    calls: Mutex<HashMap<DocKey, Arc<DocCalls>>>,
}

impl RecordingConnection {
    pub fn new(inner: MemoryConnection) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: Mutex::new(HashMap::new()),
        })
    }

    pub fn calls(&self, collection: &str, id: &str) -> Arc<DocCalls> {
        self.calls
            .lock()
            .entry(DocKey::new(collection, id))
            .or_default()
            .clone()
    }

    pub fn inner(&self) -> &MemoryConnection {
        &self.inner
    }
}

impl RemoteConnection for RecordingConnection {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn get(&self, key: &DocKey) -> Arc<dyn RemoteDoc> {
        Arc::new(RecordingDoc {
            inner: self.inner.get(key),
            calls: self.calls(&key.collection, &key.id),
        })
    }

    fn get_existing(&self, key: &DocKey) -> Option<Arc<dyn RemoteDoc>> {
        self.inner.get_existing(key).map(|inner| {
            Arc::new(RecordingDoc {
                inner,
                calls: self.calls(&key.collection, &key.id),
            }) as Arc<dyn RemoteDoc>
        })
    }

    fn close(&self) {
        self.inner.close();
    }
}

struct RecordingDoc {
    inner: Arc<dyn RemoteDoc>,
    calls: Arc<DocCalls>,
}

impl RemoteDoc for RecordingDoc {
    fn key(&self) -> &DocKey {
        self.inner.key()
    }

    fn subscribe(&self) {
        self.calls.record(&self.calls.subscribe, "subscribe");
        self.inner.subscribe();
    }

    fn unsubscribe(&self) {
        self.calls.record(&self.calls.unsubscribe, "unsubscribe");
        self.inner.unsubscribe();
    }

    fn destroy(&self) {
        self.calls.record(&self.calls.destroy, "destroy");
        self.inner.destroy();
    }

    fn create(&self, data: Value) {
        self.inner.create(data);
    }

    fn submit_op(&self, op: Op) -> BoxFuture<'static, Result<(), sharestate_client::RemoteError>> {
        self.calls.submit.fetch_add(1, Ordering::SeqCst);
        self.inner.submit_op(op)
    }

    fn add_listener(&self, listener: DocListener) -> ListenerId {
        self.inner.add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.inner.remove_listener(id);
    }

    fn doc_type(&self) -> Option<DocType> {
        self.inner.doc_type()
    }

    fn version(&self) -> Option<Version> {
        self.inner.version()
    }

    fn data(&self) -> Value {
        self.inner.data()
    }

    fn want_subscribe(&self) -> bool {
        self.inner.want_subscribe()
    }
}

/// A store plus one recording connection and a cache over it.
pub struct Harness {
    pub backend: MemoryBackend,
    pub conn: Arc<RecordingConnection>,
    pub cache: SessionCache,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let backend = MemoryBackend::new();
        let conn = RecordingConnection::new(backend.connect());
        let cache = SessionCache::new(conn.clone(), config);
        Self {
            backend,
            conn,
            cache,
        }
    }

    /// Create a document from a separate connection and let it land.
    pub fn seed(&self, collection: &str, id: &str, data: Value) {
        let seeder = self.backend.connect();
        seeder.get(&DocKey::new(collection, id)).create(data);
        self.backend.flush();
        seeder.close();
    }

    /// Access a document, flushing the store until it loads.
    pub async fn load(&self, collection: &str, id: &str) -> Subscription {
        self.load_with(collection, id, None).await
    }

    pub async fn load_with(
        &self,
        collection: &str,
        id: &str,
        projector: Option<sharestate_engine::Projector>,
    ) -> Subscription {
        let access = self.cache.access_with(collection, id, projector);
        tokio::pin!(access);
        for _ in 0..16 {
            if let Poll::Ready(sub) = futures::poll!(access.as_mut()) {
                return sub.expect("document should load");
            }
            self.backend.flush();
        }
        panic!("{collection}/{id} did not load");
    }
}

/// Number of changes queued on a subscription.
pub fn count_changes(sub: &mut Subscription) -> usize {
    sub.drain_changes()
}
