//! # Sharestate Engine
//!
//! Pure document logic for shared, remotely synchronized state.
//!
//! This crate holds everything about documents that does not need a network,
//! a runtime, or a clock: how documents are named, how operations change them,
//! and how a consumer's slice of a document is projected and compared.
//!
//! ## Design Principles
//!
//! - **No IO**: Engine has no knowledge of connections, tasks, or timers
//! - **Deterministic**: Same inputs always produce same outputs
//! - **Testable**: Pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Documents
//!
//! A document is a JSON value identified by a [`DocKey`] (collection + id).
//! The remote store reports its state as a [`DocSnapshot`].
//!
//! ### Operations
//!
//! Changes are json0-style [`Op`]s made of [`OpComponent`]s:
//! - `na` - add to a number
//! - `oi` / `od` - insert / delete an object key
//! - `li` / `ld` - insert / delete a list element
//!
//! ### Projections
//!
//! A [`Projection`] narrows a document to a consumer's slice with a
//! [`Projector`] and decides, via [`has_changed`], whether a new document
//! value is worth telling the consumer about.
//!
//! ## Quick Start
//!
//! ```rust
//! use sharestate_engine::{path, projector, Op, OpComponent, Projection};
//! use serde_json::json;
//!
//! let mut doc = json!({"count1": 0, "title": "draft"});
//! let mut projection = Projection::new(Some(projector(|d| d["count1"].clone())), &doc);
//!
//! // A change outside the slice publishes nothing
//! Op::from(OpComponent::object_insert(path!["title"], json!("final")))
//!     .apply(&mut doc)
//!     .unwrap();
//! assert_eq!(projection.observe(&doc), None);
//!
//! // A change inside it publishes the new slice
//! Op::from(OpComponent::number_add(path!["count1"], 1))
//!     .apply(&mut doc)
//!     .unwrap();
//! assert_eq!(projection.observe(&doc), Some(json!(1)));
//! ```

pub mod action;
pub mod error;
pub mod operation;
pub mod projection;
pub mod snapshot;

// Re-export main types at crate root
pub use action::Action;
pub use error::Error;
pub use operation::{render_path, Op, OpComponent, PathSegment};
pub use projection::{has_changed, projector, Projection, ProjectionState, Projector, ValueKind};
pub use snapshot::{DocKey, DocSnapshot, JSON0_TYPE};

/// Type aliases for clarity
pub type CollectionName = String;
pub type DocId = String;
pub type DocType = String;
pub type Version = u64;
