//! Document identity and point-in-time document state.
//!
//! A [`DocKey`] names a document; a [`DocSnapshot`] is what the remote store
//! reports about it when a client loads it or when it is created.

use crate::{CollectionName, DocId, DocType, Version};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The only document type the engine knows how to apply operations for.
pub const JSON0_TYPE: &str = "json0";

/// Identity of a document: the collection it lives in and its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey {
    pub collection: CollectionName,
    pub id: DocId,
}

impl DocKey {
    /// Create a new key.
    pub fn new(collection: impl Into<CollectionName>, id: impl Into<DocId>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// The state of a document as reported by the remote store.
///
/// `doc_type` is `None` until the document has been created, `version` is
/// `None` until it has been loaded at least once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocSnapshot {
    /// Type of the document, `None` if it does not exist
    #[serde(rename = "type")]
    pub doc_type: Option<DocType>,
    /// Number of operations applied since creation
    pub version: Option<Version>,
    /// Current materialized value
    pub data: serde_json::Value,
}

impl DocSnapshot {
    /// Snapshot of a document nobody has loaded yet.
    pub fn unloaded() -> Self {
        Self {
            doc_type: None,
            version: None,
            data: serde_json::Value::Null,
        }
    }

    /// Snapshot of a loaded document that has not been created.
    pub fn missing() -> Self {
        Self {
            doc_type: None,
            version: Some(0),
            data: serde_json::Value::Null,
        }
    }

    /// Snapshot of a freshly created json0 document.
    pub fn created(data: serde_json::Value) -> Self {
        Self {
            doc_type: Some(JSON0_TYPE.to_string()),
            version: Some(1),
            data,
        }
    }

    /// Whether the document has been created.
    pub fn exists(&self) -> bool {
        self.doc_type.is_some()
    }

    /// Whether the document has been loaded from the store.
    pub fn is_loaded(&self) -> bool {
        self.version.is_some()
    }
}

impl Default for DocSnapshot {
    fn default() -> Self {
        Self::unloaded()
    }
}
