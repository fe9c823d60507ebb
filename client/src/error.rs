//! Unified error handling for the client.

use serde::{Deserialize, Serialize};
use sharestate_engine::DocKey;

/// Errors reported by a remote store.
///
/// Cloneable so a single load failure can be handed to every consumer that
/// waited on the same load.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RemoteError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("document handle destroyed")]
    Destroyed,

    #[error("document not created: {0}")]
    NotCreated(DocKey),

    #[error("document already exists: {0}")]
    AlreadyExists(DocKey),

    #[error("operation rejected: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<sharestate_engine::Error> for RemoteError {
    fn from(err: sharestate_engine::Error) -> Self {
        RemoteError::Rejected(err.to_string())
    }
}

/// Client error type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("failed to load {key}: {source}")]
    LoadFailure {
        key: DocKey,
        #[source]
        source: RemoteError,
    },

    #[error("no SharedStateProvider in scope: run this inside SharedStateProvider::scope")]
    MissingProvider,

    #[error("dispatch to {key} failed: {source}")]
    DispatchFailure {
        key: DocKey,
        #[source]
        source: RemoteError,
    },
}

impl ClientError {
    /// Key of the document the error concerns, if any.
    pub fn key(&self) -> Option<&DocKey> {
        match self {
            ClientError::LoadFailure { key, .. } | ClientError::DispatchFailure { key, .. } => {
                Some(key)
            }
            ClientError::MissingProvider => None,
        }
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
