//! Message protocol between in-memory connections and the in-memory store.
//!
//! All messages are JSON-encodable and use snake_case for tags and field
//! names, so a queued exchange can be logged or replayed verbatim.

use serde::{Deserialize, Serialize};
use sharestate_engine::{DocKey, DocSnapshot, Op, Version};

use crate::error::RemoteError;

/// Correlates a request with its acknowledgement.
pub type RequestId = u64;

/// Messages sent from a connection to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Load the document and receive every later operation.
    Subscribe { key: DocKey },

    /// Stop receiving operations.
    Unsubscribe { key: DocKey },

    /// Load the document without changing the subscription.
    Fetch { key: DocKey },

    /// Create the document.
    Create {
        key: DocKey,
        data: serde_json::Value,
        request_id: RequestId,
    },

    /// Apply an operation written against `version` of the document.
    Submit {
        key: DocKey,
        op: Op,
        version: Version,
        request_id: RequestId,
    },

    /// Delete the document.
    Delete { key: DocKey, request_id: RequestId },
}

impl Request {
    /// Key of the document the request concerns.
    pub fn key(&self) -> &DocKey {
        match self {
            Request::Subscribe { key }
            | Request::Unsubscribe { key }
            | Request::Fetch { key }
            | Request::Create { key, .. }
            | Request::Submit { key, .. }
            | Request::Delete { key, .. } => key,
        }
    }
}

impl Request {
    /// Id of a write request, which the store answers with an ack or error.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Request::Create { request_id, .. }
            | Request::Submit { request_id, .. }
            | Request::Delete { request_id, .. } => Some(*request_id),
            Request::Subscribe { .. } | Request::Unsubscribe { .. } | Request::Fetch { .. } => None,
        }
    }
}

/// Messages sent from the store to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Current state of a document, in reply to subscribe or fetch.
    Snapshot { key: DocKey, snapshot: DocSnapshot },

    /// Another connection created a document this connection subscribes to.
    Created { key: DocKey, snapshot: DocSnapshot },

    /// Another connection applied an operation.
    Op {
        key: DocKey,
        op: Op,
        version: Version,
    },

    /// Another connection deleted the document.
    Deleted { key: DocKey, version: Version },

    /// A request from this connection was accepted.
    Ack {
        key: DocKey,
        request_id: RequestId,
        version: Version,
    },

    /// A request from this connection failed.
    Error {
        key: DocKey,
        error: RemoteError,
        /// Request ID from the original request (if applicable)
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
    },

    /// The connection itself was shut down.
    Closed,
}

impl Response {
    /// Create an error response.
    pub fn error(key: DocKey, error: RemoteError, request_id: Option<RequestId>) -> Self {
        Response::Error {
            key,
            error,
            request_id,
        }
    }
}
