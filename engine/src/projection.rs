//! Projection and change detection.
//!
//! A consumer rarely cares about a whole document. A [`Projector`] narrows the
//! document to the slice the consumer watches, and a [`Projection`] keeps the
//! last published slice so a remote change only reaches the consumer when that
//! slice actually changed.
//!
//! Comparison is type aware and one level deep:
//! - different kinds (object vs number, ...) are always a change
//! - arrays change when their length or any element differs
//! - objects change when their key set or any value differs
//! - scalars change when they differ by value
//!
//! Published values are owned copies; later changes to the document can never
//! reach back into a slice the consumer already holds.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A pure function narrowing a document to the slice a consumer observes.
pub type Projector = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Wrap a closure as a [`Projector`].
pub fn projector<F>(f: F) -> Projector
where
    F: Fn(&Value) -> Value + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Run-time kind of a JSON value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl ValueKind {
    /// Kind of `value`.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }
}

/// Decide whether `next` is a meaningful change from `previous`.
pub fn has_changed(previous: &Value, next: &Value) -> bool {
    match (previous, next) {
        (Value::Array(prev), Value::Array(next)) => {
            prev.len() != next.len() || prev.iter().zip(next).any(|(a, b)| a != b)
        }
        (Value::Object(prev), Value::Object(next)) => {
            prev.len() != next.len()
                || prev
                    .iter()
                    .any(|(key, value)| next.get(key).map_or(true, |other| other != value))
        }
        _ if ValueKind::of(previous) != ValueKind::of(next) => true,
        _ => previous != next,
    }
}

/// Per-consumer projection bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionState {
    /// Last document value the projection was compared against
    pub raw_snapshot: Value,
    /// Last published slice
    pub projected: Value,
}

/// A consumer's view of a document: an optional projector plus the last
/// published slice.
pub struct Projection {
    projector: Option<Projector>,
    state: ProjectionState,
}

impl Projection {
    /// Start a projection from the current document value.
    pub fn new(projector: Option<Projector>, data: &Value) -> Self {
        let projected = match &projector {
            Some(f) => f(data),
            None => data.clone(),
        };
        Self {
            projector,
            state: ProjectionState {
                raw_snapshot: data.clone(),
                projected,
            },
        }
    }

    /// Projection that forwards the whole document.
    pub fn identity(data: &Value) -> Self {
        Self::new(None, data)
    }

    /// Whether this projection forwards the whole document unconditionally.
    pub fn is_identity(&self) -> bool {
        self.projector.is_none()
    }

    /// The last published slice.
    pub fn value(&self) -> &Value {
        &self.state.projected
    }

    /// Full bookkeeping state.
    pub fn state(&self) -> &ProjectionState {
        &self.state
    }

    /// Feed a new document value. Returns the slice to publish, or `None` if
    /// the consumer should not be notified.
    pub fn observe(&mut self, data: &Value) -> Option<Value> {
        self.state.raw_snapshot = data.clone();
        let projector = match &self.projector {
            Some(f) => f,
            None => {
                self.state.projected = data.clone();
                return Some(self.state.projected.clone());
            }
        };

        let next = projector(data);
        if !has_changed(&self.state.projected, &next) {
            return None;
        }
        self.state.projected = next;
        Some(self.state.projected.clone())
    }

    /// Swap the projector and re-project the last observed document value.
    /// Returns the new slice if it differs from the published one.
    pub fn replace_projector(&mut self, projector: Option<Projector>) -> Option<Value> {
        self.projector = projector;
        let data = self.state.raw_snapshot.clone();
        let next = match &self.projector {
            Some(f) => f(&data),
            None => data,
        };
        if !has_changed(&self.state.projected, &next) {
            return None;
        }
        self.state.projected = next;
        Some(self.state.projected.clone())
    }
}

impl fmt::Debug for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Projection")
            .field("identity", &self.is_identity())
            .field("state", &self.state)
            .finish()
    }
}
