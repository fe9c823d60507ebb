//! Registry of live document sessions.

use std::sync::Arc;

use dashmap::DashMap;
use sharestate_engine::DocKey;

use super::document::DocumentSession;

/// At most one session per document key.
///
/// An entry is removed when
/// - its last subscription is dropped (after the release delay, if any),
/// - its load succeeds while no subscription holds it and nobody waits on it,
/// - a rejected session is explicitly retried.
///
/// Removal only ever drops the exact session that asked for it, so a session
/// created in the meantime for the same key is left alone.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<DocKey, Arc<DocumentSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The session for `key`, created with `create` if there is none.
    pub fn get_or_create<F>(&self, key: &DocKey, create: F) -> Arc<DocumentSession>
    where
        F: FnOnce() -> DocumentSession,
    {
        if let Some(session) = self.sessions.get(key) {
            return session.value().clone();
        }
        self.sessions
            .entry(key.clone())
            .or_insert_with(|| Arc::new(create()))
            .value()
            .clone()
    }

    pub fn get(&self, key: &DocKey) -> Option<Arc<DocumentSession>> {
        self.sessions.get(key).map(|session| session.value().clone())
    }

    /// Remove `session` if it is still the registered one for its key.
    pub fn evict(&self, session: &Arc<DocumentSession>) -> bool {
        self.sessions
            .remove_if(session.key(), |_, existing| Arc::ptr_eq(existing, session))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
