//! Creating documents without subscribing to them.

use serde_json::Value;
use sharestate_engine::DocKey;

use crate::error::Result;
use crate::session::SessionCache;

/// Creates documents through a cache's connection.
///
/// Creating neither loads nor subscribes; consumers waiting on the document
/// resolve once the creation reaches them. If the store refuses the creation
/// (the document already exists, the connection is closed) the refusal is
/// logged and the local copy resyncs to the store's.
#[derive(Debug, Clone)]
pub struct DocumentCreator {
    cache: SessionCache,
}

impl DocumentCreator {
    pub(crate) fn new(cache: SessionCache) -> Self {
        Self { cache }
    }

    /// The creator of the enclosing provider scope.
    pub fn current() -> Result<Self> {
        SessionCache::current().map(Self::new)
    }

    /// Create `collection/id` with `initial_state`.
    pub fn create(&self, collection: &str, id: &str, initial_state: Value) {
        let key = DocKey::new(collection, id);
        tracing::debug!(key = %key, "creating document");
        self.cache.connection().get(&key).create(initial_state);
    }
}
