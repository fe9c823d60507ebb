//! # Sharestate Client
//!
//! Shared, ref-counted access to remotely synchronized documents.
//!
//! Many independent consumers can observe and change the same document. The
//! client makes sure that
//!
//! - a document is loaded at most once, however many consumers ask for it
//!   while it loads,
//! - a document is released exactly when its last consumer goes away,
//! - a consumer only hears about changes to the slice of the document it
//!   projects.
//!
//! ## Layout
//!
//! - [`session`]: the [`SessionCache`], one [`DocumentSession`] per document,
//!   and the consumer-side [`Subscription`] and [`Dispatcher`]
//! - [`provider`]: [`SharedStateProvider`], which scopes a cache to async work
//! - [`creator`]: [`DocumentCreator`], fire-and-forget document creation
//! - [`remote`]: the contract a remote store must honour, plus an in-memory
//!   store
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use sharestate_client::{Access, Config, MemoryBackend, SharedStateProvider};
//! use sharestate_engine::{path, projector, OpComponent};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), sharestate_client::ClientError> {
//! let backend = MemoryBackend::new();
//! let provider = SharedStateProvider::managed(Arc::new(backend.clone()), Config::default());
//! let cache = provider.cache();
//!
//! cache.creator().create("counters", "a", json!({"count": 0}));
//! backend.flush();
//!
//! // The first access starts the load
//! let count = Some(projector(|doc| doc["count"].clone()));
//! let Access::Pending(mut loading) = cache.try_access("counters", "a", count.clone())? else {
//!     unreachable!()
//! };
//! backend.flush();
//! (&mut loading).await?;
//!
//! // Once loaded, the same call hands out a subscription
//! let Access::Ready(mut sub) = cache.try_access("counters", "a", count)? else {
//!     unreachable!()
//! };
//! drop(loading);
//! assert_eq!(sub.state(), json!(0));
//!
//! let ack = sub.dispatcher().dispatch(OpComponent::number_add(path!["count"], 1));
//! assert_eq!(sub.try_changed(), Some(json!(1)));
//! backend.flush();
//! ack.await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod creator;
pub mod error;
pub mod provider;
pub mod remote;
pub mod session;

// Re-export main types at crate root
pub use config::{Config, ConfigError};
pub use creator::DocumentCreator;
pub use error::{ClientError, RemoteError, Result};
pub use provider::{ConnectionIdentityMismatch, SharedStateProvider};
pub use remote::{
    Connector, DocEvent, DocListener, ListenerId, MemoryBackend, MemoryConnection, MemoryDoc,
    RemoteConnection, RemoteDoc,
};
pub use session::{
    Access, Dispatcher, DocumentSession, SessionCache, SessionRegistry, SessionStatus,
    Subscription, Suspension,
};
