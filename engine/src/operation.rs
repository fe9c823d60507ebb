//! Operation types for expressing changes to a document.
//!
//! Operations use the json0 component format: a path `p` into the document and
//! exactly one action (`na`, `oi`, `od`, `li`, `ld`, or the `oi`+`od` /
//! `li`+`ld` replace pairs). Only application is implemented here; ordering and
//! transformation of concurrent operations belong to the remote store.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Number, Value};
use std::fmt;

/// One step of a path into a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// Position in a list
    Index(usize),
    /// Key in an object
    Key(String),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(i) => write!(f, "{}", i),
            PathSegment::Key(k) => write!(f, "{}", k),
        }
    }
}

/// Build a path from keys and indices: `path!["list", 0]`.
#[macro_export]
macro_rules! path {
    ($($seg:expr),* $(,)?) => {
        vec![$($crate::PathSegment::from($seg)),*]
    };
}

/// Render a path as a pointer-like string for error messages.
pub fn render_path(path: &[PathSegment]) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.iter().map(|seg| format!("/{}", seg)).collect()
}

/// A single json0 operation component.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OpComponent {
    /// Path to the target value
    pub p: Vec<PathSegment>,
    /// Number add
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub na: Option<Number>,
    /// Object insert
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub oi: Option<Value>,
    /// Object delete
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub od: Option<Value>,
    /// List insert
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub li: Option<Value>,
    /// List delete
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub ld: Option<Value>,
}

// A field that is present but `null` carries the value `null`.
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl OpComponent {
    /// Add `amount` to the number at `path`.
    pub fn number_add(path: Vec<PathSegment>, amount: impl Into<Number>) -> Self {
        Self {
            p: path,
            na: Some(amount.into()),
            ..Default::default()
        }
    }

    /// Set the object key at `path` to `value`.
    pub fn object_insert(path: Vec<PathSegment>, value: Value) -> Self {
        Self {
            p: path,
            oi: Some(value),
            ..Default::default()
        }
    }

    /// Remove the object key at `path`, whose current value is `old`.
    pub fn object_delete(path: Vec<PathSegment>, old: Value) -> Self {
        Self {
            p: path,
            od: Some(old),
            ..Default::default()
        }
    }

    /// Replace the object value at `path`.
    pub fn object_replace(path: Vec<PathSegment>, old: Value, new: Value) -> Self {
        Self {
            p: path,
            od: Some(old),
            oi: Some(new),
            ..Default::default()
        }
    }

    /// Insert `value` into the list at `path` (the last segment is the index).
    pub fn list_insert(path: Vec<PathSegment>, value: Value) -> Self {
        Self {
            p: path,
            li: Some(value),
            ..Default::default()
        }
    }

    /// Remove the list element at `path`, whose current value is `old`.
    pub fn list_delete(path: Vec<PathSegment>, old: Value) -> Self {
        Self {
            p: path,
            ld: Some(old),
            ..Default::default()
        }
    }

    /// Replace the list element at `path`.
    pub fn list_replace(path: Vec<PathSegment>, old: Value, new: Value) -> Self {
        Self {
            p: path,
            ld: Some(old),
            li: Some(new),
            ..Default::default()
        }
    }

    /// Apply this component to `data` in place. On error `data` is left
    /// untouched.
    pub fn apply(&self, data: &mut Value) -> Result<()> {
        self.apply_below(data, 0)
    }

    /// Apply to `data`, which is the value found at the first `depth`
    /// segments of this component's path.
    fn apply_below(&self, data: &mut Value, depth: usize) -> Result<()> {
        let (last, parent_path) = self.p.split_last().ok_or(Error::EmptyPath)?;

        if let Some(amount) = &self.na {
            if self.oi.is_some() || self.od.is_some() || self.li.is_some() || self.ld.is_some() {
                return Err(Error::InvalidComponent(format!(
                    "na combined with another action at {}",
                    render_path(&self.p)
                )));
            }
            let target = navigate(data, &self.p, depth)?;
            let sum = add_numbers(target, amount)
                .ok_or_else(|| Error::NotANumber(render_path(&self.p)))?;
            *target = Value::Number(sum);
            return Ok(());
        }

        let parent = navigate(data, parent_path, depth)?;

        match last {
            PathSegment::Key(key) => {
                if self.li.is_some() || self.ld.is_some() {
                    return Err(Error::InvalidComponent(format!(
                        "list action on object key at {}",
                        render_path(&self.p)
                    )));
                }
                if self.oi.is_none() && self.od.is_none() {
                    return Err(Error::InvalidComponent(format!(
                        "no action at {}",
                        render_path(&self.p)
                    )));
                }
                let object = parent
                    .as_object_mut()
                    .ok_or_else(|| Error::NotAnObject(render_path(parent_path)))?;
                if let Some(old) = &self.od {
                    match object.get(key) {
                        None => return Err(Error::PathNotFound(render_path(&self.p))),
                        Some(current) if current != old => {
                            return Err(Error::ValueMismatch(render_path(&self.p)))
                        }
                        Some(_) => {}
                    }
                }
                match &self.oi {
                    Some(value) => {
                        object.insert(key.clone(), value.clone());
                    }
                    None => {
                        object.remove(key);
                    }
                }
            }
            PathSegment::Index(index) => {
                if self.oi.is_some() || self.od.is_some() {
                    return Err(Error::InvalidComponent(format!(
                        "object action on list index at {}",
                        render_path(&self.p)
                    )));
                }
                let list = parent
                    .as_array_mut()
                    .ok_or_else(|| Error::NotAList(render_path(parent_path)))?;
                let len = list.len();
                if let Some(old) = &self.ld {
                    let current = list
                        .get(*index)
                        .ok_or(Error::IndexOutOfBounds { index: *index, len })?;
                    if current != old {
                        return Err(Error::ValueMismatch(render_path(&self.p)));
                    }
                }
                match (&self.ld, &self.li) {
                    (Some(_), Some(value)) => list[*index] = value.clone(),
                    (Some(_), None) => {
                        list.remove(*index);
                    }
                    (None, Some(value)) => {
                        if *index > len {
                            return Err(Error::IndexOutOfBounds { index: *index, len });
                        }
                        list.insert(*index, value.clone());
                    }
                    (None, None) => {
                        return Err(Error::InvalidComponent(format!(
                            "no action at {}",
                            render_path(&self.p)
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Walk `path` from segment `from` on; `data` is the value at `path[..from]`.
fn navigate<'a>(data: &'a mut Value, path: &[PathSegment], from: usize) -> Result<&'a mut Value> {
    let mut current = data;
    for (depth, segment) in path.iter().enumerate().skip(from) {
        let here = &path[..=depth];
        current = match segment {
            PathSegment::Key(key) => current
                .as_object_mut()
                .ok_or_else(|| Error::NotAnObject(render_path(&path[..depth])))?
                .get_mut(key)
                .ok_or_else(|| Error::PathNotFound(render_path(here)))?,
            PathSegment::Index(index) => {
                let list = current
                    .as_array_mut()
                    .ok_or_else(|| Error::NotAList(render_path(&path[..depth])))?;
                let len = list.len();
                list.get_mut(*index).ok_or(Error::IndexOutOfBounds {
                    index: *index,
                    len,
                })?
            }
        };
    }
    Ok(current)
}

// Integer sums stay integers so `{"count": 0}` + 1 compares equal to `{"count": 1}`.
fn add_numbers(target: &Value, amount: &Number) -> Option<Number> {
    let current = match target {
        Value::Number(n) => n,
        _ => return None,
    };
    if let (Some(a), Some(b)) = (current.as_i64(), amount.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Some(Number::from(sum));
        }
    }
    Number::from_f64(current.as_f64()? + amount.as_f64()?)
}

/// Length of the path prefix shared by the parents of every component.
fn shared_parent_depth(components: &[OpComponent]) -> usize {
    let first = &components[0].p;
    let mut depth = first.len().saturating_sub(1);
    for component in &components[1..] {
        let parent = &component.p[..component.p.len().saturating_sub(1)];
        depth = first[..depth]
            .iter()
            .zip(parent)
            .take_while(|(a, b)| a == b)
            .count();
    }
    depth
}

/// An operation: an ordered list of components applied atomically.
///
/// Serializes as a json0 component array. Deserializes from either an array or
/// a single bare component.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "OpRepr", into = "Vec<OpComponent>")]
pub struct Op {
    pub components: Vec<OpComponent>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OpRepr {
    Many(Vec<OpComponent>),
    One(OpComponent),
}

impl From<OpRepr> for Op {
    fn from(repr: OpRepr) -> Self {
        match repr {
            OpRepr::Many(components) => Op { components },
            OpRepr::One(component) => Op {
                components: vec![component],
            },
        }
    }
}

impl From<Op> for Vec<OpComponent> {
    fn from(op: Op) -> Self {
        op.components
    }
}

impl From<OpComponent> for Op {
    fn from(component: OpComponent) -> Self {
        Op {
            components: vec![component],
        }
    }
}

impl From<Vec<OpComponent>> for Op {
    fn from(components: Vec<OpComponent>) -> Self {
        Op { components }
    }
}

impl Op {
    /// Create an operation from components.
    pub fn new(components: Vec<OpComponent>) -> Self {
        Self { components }
    }

    /// Whether the operation has no components.
    pub fn is_noop(&self) -> bool {
        self.components.is_empty()
    }

    /// Apply every component to `data`. Either all components apply or `data`
    /// is left untouched.
    ///
    /// A single component applies in place. Several components work on a copy
    /// of the deepest subtree that contains all of their targets.
    pub fn apply(&self, data: &mut Value) -> Result<()> {
        match self.components.as_slice() {
            [] => Ok(()),
            [component] => component.apply(data),
            components => {
                let depth = shared_parent_depth(components);
                let subtree = navigate(data, &components[0].p[..depth], 0)?;
                let mut working = subtree.clone();
                for component in components {
                    component.apply_below(&mut working, depth)?;
                }
                *subtree = working;
                Ok(())
            }
        }
    }
}
