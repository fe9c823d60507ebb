//! Scoping a session cache to a subtree of async work.
//!
//! A [`SharedStateProvider`] owns one [`SessionCache`]. Code running inside
//! [`SharedStateProvider::scope`] finds it with [`SessionCache::current`]
//! and [`DocumentCreator::current`](crate::DocumentCreator::current).

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::remote::{Connector, RemoteConnection};
use crate::session::SessionCache;

tokio::task_local! {
    pub(crate) static CURRENT_CACHE: SessionCache;
}

/// How an externally supplied connection differs from the one in use.
///
/// The provider keeps the connection it started with; a mismatch is only
/// reported, never acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionIdentityMismatch {
    #[error("a connection was supplied after the provider opened its own")]
    ArrivedLate,

    #[error("the supplied connection was withdrawn")]
    Withdrawn,

    #[error("the supplied connection was replaced by a different one")]
    Replaced,
}

/// Makes a [`SessionCache`] available to the code it scopes.
pub struct SharedStateProvider {
    cache: SessionCache,
    /// Connection supplied at construction, `None` when managed
    supplied: Option<Arc<dyn RemoteConnection>>,
    last_mismatch: Mutex<Option<ConnectionIdentityMismatch>>,
}

impl SharedStateProvider {
    /// Provider over an existing connection. The caller keeps ownership; the
    /// provider never closes it.
    pub fn new(connection: Arc<dyn RemoteConnection>, config: Config) -> Self {
        Self {
            cache: SessionCache::new(connection.clone(), config),
            supplied: Some(connection),
            last_mismatch: Mutex::new(None),
        }
    }

    /// Provider that opens its own connection on first use and closes it
    /// when dropped.
    pub fn managed(connector: Arc<dyn Connector>, config: Config) -> Self {
        Self {
            cache: SessionCache::managed(connector, config),
            supplied: None,
            last_mismatch: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    /// Run `future` with this provider's cache in scope.
    pub async fn scope<F: Future>(&self, future: F) -> F::Output {
        CURRENT_CACHE.scope(self.cache.clone(), future).await
    }

    /// Run `f` with this provider's cache in scope.
    pub fn sync_scope<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        CURRENT_CACHE.sync_scope(self.cache.clone(), f)
    }

    /// Compare a connection handle supplied now with the one the provider
    /// was built with.
    ///
    /// The provider keeps using its original connection either way. A
    /// mismatch is logged once per change when dev warnings are enabled.
    pub fn observe_connection(
        &self,
        connection: Option<&Arc<dyn RemoteConnection>>,
    ) -> Option<ConnectionIdentityMismatch> {
        let mismatch = match (&self.supplied, connection) {
            (None, None) => None,
            (None, Some(_)) => Some(ConnectionIdentityMismatch::ArrivedLate),
            (Some(_), None) => Some(ConnectionIdentityMismatch::Withdrawn),
            (Some(original), Some(observed)) if !Arc::ptr_eq(original, observed) => {
                Some(ConnectionIdentityMismatch::Replaced)
            }
            (Some(_), Some(_)) => None,
        };

        let previous = std::mem::replace(&mut *self.last_mismatch.lock(), mismatch);
        if let Some(mismatch) = mismatch {
            if self.cache.config().dev_warnings && previous != Some(mismatch) {
                tracing::warn!(
                    mismatch = %mismatch,
                    "connection identity changed; the provider keeps its original connection"
                );
            }
        }
        mismatch
    }
}

impl Drop for SharedStateProvider {
    fn drop(&mut self) {
        self.cache.close_managed();
    }
}

impl fmt::Debug for SharedStateProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedStateProvider")
            .field("cache", &self.cache)
            .field("external", &self.supplied.is_some())
            .finish()
    }
}
