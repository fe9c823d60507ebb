//! The session cache: the accessor every consumer goes through.

use std::fmt;
use std::sync::{Arc, OnceLock};

use sharestate_engine::{DocKey, Projector};

use super::document::{Access, DocumentSession, SessionStatus};
use super::registry::SessionRegistry;
use super::subscription::Subscription;
use crate::config::Config;
use crate::creator::DocumentCreator;
use crate::error::{ClientError, Result};
use crate::provider::CURRENT_CACHE;
use crate::remote::{Connector, RemoteConnection};

/// Where the cache gets its connection from.
enum ConnectionSource {
    /// Supplied by the caller, never closed by the cache.
    External(Arc<dyn RemoteConnection>),
    /// Opened on first use and closed with the provider.
    Managed {
        connector: Arc<dyn Connector>,
        connection: OnceLock<Arc<dyn RemoteConnection>>,
    },
}

impl ConnectionSource {
    fn get(&self) -> Arc<dyn RemoteConnection> {
        match self {
            ConnectionSource::External(connection) => connection.clone(),
            ConnectionSource::Managed {
                connector,
                connection,
            } => connection
                .get_or_init(|| {
                    let connection = connector.connect();
                    tracing::info!(conn_id = %connection.id(), "managed connection opened");
                    connection
                })
                .clone(),
        }
    }

    fn is_managed(&self) -> bool {
        matches!(self, ConnectionSource::Managed { .. })
    }
}

struct CacheInner {
    source: ConnectionSource,
    registry: Arc<SessionRegistry>,
    config: Config,
}

/// Ref-counted, load-deduplicating access to shared documents.
///
/// Cloning is cheap; clones share the same sessions.
#[derive(Clone)]
pub struct SessionCache {
    inner: Arc<CacheInner>,
}

impl SessionCache {
    /// Cache over an existing connection.
    pub fn new(connection: Arc<dyn RemoteConnection>, config: Config) -> Self {
        Self::from_source(ConnectionSource::External(connection), config)
    }

    pub(crate) fn managed(connector: Arc<dyn Connector>, config: Config) -> Self {
        Self::from_source(
            ConnectionSource::Managed {
                connector,
                connection: OnceLock::new(),
            },
            config,
        )
    }

    fn from_source(source: ConnectionSource, config: Config) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                source,
                registry: Arc::new(SessionRegistry::new()),
                config,
            }),
        }
    }

    /// The cache of the enclosing [`SharedStateProvider`](crate::SharedStateProvider) scope.
    pub fn current() -> Result<Self> {
        CURRENT_CACHE
            .try_with(|cache| cache.clone())
            .map_err(|_| ClientError::MissingProvider)
    }

    /// The connection documents are loaded through.
    pub fn connection(&self) -> Arc<dyn RemoteConnection> {
        self.inner.source.get()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// A creator bound to this cache's connection.
    pub fn creator(&self) -> DocumentCreator {
        DocumentCreator::new(self.clone())
    }

    /// Ask for a subscription without waiting.
    ///
    /// The first call for a document starts its load and subscribes to it;
    /// every call made while the load is in flight shares that load.
    pub fn try_access(
        &self,
        collection: &str,
        id: &str,
        projector: Option<Projector>,
    ) -> Result<Access> {
        let key = DocKey::new(collection, id);
        loop {
            let session = self.inner.registry.get_or_create(&key, || {
                DocumentSession::new(
                    key.clone(),
                    self.connection().get(&key),
                    Arc::downgrade(&self.inner.registry),
                    self.inner.config.release_delay,
                )
            });

            match session.access(projector.clone())? {
                Some(access) => return Ok(access),
                None => {
                    // torn down but not yet evicted
                    self.inner.registry.evict(&session);
                }
            }
        }
    }

    /// Subscribe to the whole document, waiting for it to load.
    pub async fn access(&self, collection: &str, id: &str) -> Result<Subscription> {
        self.access_with(collection, id, None).await
    }

    /// Subscribe to a projection of the document, waiting for it to load.
    pub async fn access_with(
        &self,
        collection: &str,
        id: &str,
        projector: Option<Projector>,
    ) -> Result<Subscription> {
        // the settled suspension is kept until the next attempt so the
        // session cannot go idle in between
        let mut _settled = None;
        loop {
            match self.try_access(collection, id, projector.clone())? {
                Access::Ready(subscription) => return Ok(subscription),
                Access::Pending(mut suspension) => {
                    (&mut suspension).await?;
                    _settled = Some(suspension);
                }
            }
        }
    }

    /// Drop a rejected session so the next access loads the document again.
    ///
    /// Returns `false` if the document has no rejected session.
    pub fn retry(&self, collection: &str, id: &str) -> bool {
        let key = DocKey::new(collection, id);
        match self.inner.registry.get(&key) {
            Some(session) if session.status() == SessionStatus::Rejected => {
                tracing::debug!(key = %key, "retrying rejected document");
                session.teardown();
                true
            }
            _ => false,
        }
    }

    /// Status of the document's session, if it has one.
    pub fn status(&self, collection: &str, id: &str) -> Option<SessionStatus> {
        self.inner
            .registry
            .get(&DocKey::new(collection, id))
            .map(|session| session.status())
    }

    /// The document's session, if it has one.
    pub fn session(&self, collection: &str, id: &str) -> Option<Arc<DocumentSession>> {
        self.inner.registry.get(&DocKey::new(collection, id))
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.registry.is_empty()
    }

    /// Close the connection if the cache opened it itself.
    pub(crate) fn close_managed(&self) {
        if let ConnectionSource::Managed {
            connection: slot, ..
        } = &self.inner.source
        {
            if let Some(connection) = slot.get() {
                tracing::info!(conn_id = %connection.id(), "closing managed connection");
                connection.close();
            }
        }
    }

    pub(crate) fn is_managed(&self) -> bool {
        self.inner.source.is_managed()
    }
}

impl fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCache")
            .field("managed", &self.is_managed())
            .field("sessions", &self.inner.registry.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryBackend;
    use serde_json::json;

    fn cache(backend: &MemoryBackend) -> SessionCache {
        SessionCache::new(Arc::new(backend.connect()), Config::default())
    }

    #[test]
    fn concurrent_accesses_share_one_session() {
        let backend = MemoryBackend::new();
        let cache = cache(&backend);

        let first = cache.try_access("c", "d", None).unwrap();
        let second = cache.try_access("c", "d", None).unwrap();
        assert!(matches!(first, Access::Pending(_)));
        assert!(matches!(second, Access::Pending(_)));
        assert_eq!(cache.len(), 1);
        assert_eq!(backend.pending(), 1);
    }

    #[test]
    fn current_requires_a_provider() {
        assert_eq!(SessionCache::current().unwrap_err(), ClientError::MissingProvider);
    }

    #[test]
    fn retry_only_drops_rejected_sessions() {
        let backend = MemoryBackend::new();
        let cache = cache(&backend);
        backend.fail_next_load(
            DocKey::new("c", "d"),
            crate::RemoteError::Transport("down".into()),
        );

        let _waiting = cache.try_access("c", "d", None).unwrap();
        assert!(!cache.retry("c", "d"));

        backend.flush();
        assert_eq!(cache.status("c", "d"), Some(SessionStatus::Rejected));
        assert!(cache.retry("c", "d"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn access_waits_for_load() {
        let backend = MemoryBackend::new();
        let cache = cache(&backend);
        backend.connect().get(&DocKey::new("c", "d")).create(json!({"n": 1}));
        backend.flush();

        let access = cache.access("c", "d");
        tokio::pin!(access);
        assert!(futures::poll!(access.as_mut()).is_pending());

        backend.flush();
        let sub = access.await.unwrap();
        assert_eq!(sub.state(), json!({"n": 1}));
        assert_eq!(cache.session("c", "d").unwrap().ref_count(), 1);
    }
}
