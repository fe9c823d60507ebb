//! Dispatch actions.
//!
//! A consumer either knows the operation it wants to submit, or derives it
//! from the document value at the moment of dispatch.

use crate::operation::{Op, OpComponent};
use serde_json::Value;
use std::fmt;

/// What a consumer asks to submit.
pub enum Action {
    /// Submit this operation as is
    Literal(Op),
    /// Compute the operation from the current document value
    Derive(Box<dyn FnOnce(&Value) -> Op + Send>),
}

impl Action {
    /// Action that derives its operation from the current document value.
    pub fn derive<F>(f: F) -> Self
    where
        F: FnOnce(&Value) -> Op + Send + 'static,
    {
        Action::Derive(Box::new(f))
    }

    /// Turn the action into a concrete operation against `data`.
    pub fn resolve(self, data: &Value) -> Op {
        match self {
            Action::Literal(op) => op,
            Action::Derive(f) => f(data),
        }
    }
}

impl From<Op> for Action {
    fn from(op: Op) -> Self {
        Action::Literal(op)
    }
}

impl From<OpComponent> for Action {
    fn from(component: OpComponent) -> Self {
        Action::Literal(Op::from(component))
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Literal(op) => f.debug_tuple("Literal").field(op).finish(),
            Action::Derive(_) => f.write_str("Derive(..)"),
        }
    }
}
