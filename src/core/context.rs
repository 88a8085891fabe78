//! Data contexts: the path→value maps exertions read inputs from and
//! write outputs to.
//!
//! A context may be marked `shared`, in which case the dispatcher publishes
//! it to the [`SharedContextPool`](crate::dispatch::SharedContextPool) once
//! its owner completes. Dependents declare [`InputBinding`]s naming the
//! path they want filled and where the value comes from.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::{Error, Result};

/// Reserved key under which an exertion is bound into its own context.
pub const SELF_KEY: &str = "self";

/// Largest `[index]` a write may grow an array to.
pub const MAX_SLOT_INDEX: usize = 4096;

/// Unique identifier for a data context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A path with an optional trailing `[index]` selector.
///
/// `arg/values[2]` addresses slot 2 of the array stored at `arg/values`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSelector<'a> {
    pub base: &'a str,
    pub index: Option<usize>,
}

impl<'a> PathSelector<'a> {
    pub fn parse(path: &'a str) -> Self {
        static INDEXED: OnceLock<Regex> = OnceLock::new();
        let re = INDEXED.get_or_init(|| {
            Regex::new(r"^(?P<base>.+)\[(?P<index>\d+)\]$").expect("static regex is valid")
        });

        if let Some(caps) = re.captures(path) {
            if let (Some(base), Some(index)) = (caps.name("base"), caps.name("index")) {
                if let Ok(index) = index.as_str().parse::<usize>() {
                    return Self {
                        base: &path[base.start()..base.end()],
                        index: Some(index),
                    };
                }
            }
        }
        Self {
            base: path,
            index: None,
        }
    }
}

/// Declares that `path` in this context is filled from `from_path` of
/// another context, resolved at dispatch time.
///
/// When `from_context` is `None` the source is found by path membership
/// (or through the context's scope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputBinding {
    pub path: String,
    pub from_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_context: Option<ContextId>,
}

impl InputBinding {
    pub fn new(path: &str, from_context: Option<ContextId>, from_path: &str) -> Self {
        Self {
            path: path.to_string(),
            from_path: from_path.to_string(),
            from_context,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataContext {
    #[serde(default)]
    pub id: ContextId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub entries: BTreeMap<String, Value>,
    /// Published to the shared pool once the owner is DONE.
    #[serde(default)]
    pub shared: bool,
    /// Non-owning link to an ancestor context, resolved through the pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ContextId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<InputBinding>,
}

impl Default for DataContext {
    fn default() -> Self {
        Self::new("")
    }
}

impl DataContext {
    pub fn new(name: &str) -> Self {
        Self {
            id: ContextId::new(),
            name: name.to_string(),
            entries: BTreeMap::new(),
            shared: false,
            scope: None,
            bindings: Vec::new(),
        }
    }

    pub fn put(&mut self, path: &str, value: impl Into<Value>) {
        self.entries.insert(path.to_string(), value.into());
    }

    pub fn with(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.put(path, value);
        self
    }

    /// Read a value, honoring a trailing `[index]` selector.
    pub fn get(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.entries.get(path) {
            return Some(value);
        }
        let selector = PathSelector::parse(path);
        let index = selector.index?;
        self.entries
            .get(selector.base)
            .and_then(|v| v.as_array())
            .and_then(|items| items.get(index))
    }

    pub fn get_f64(&self, path: &str) -> Option<f64> {
        self.get(path).and_then(Value::as_f64)
    }

    /// Whether the context holds `path`, either directly or as the base of
    /// an indexed selector.
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn remove(&mut self, path: &str) -> Option<Value> {
        self.entries.remove(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write `value` at `path`.
    ///
    /// A trailing `[index]` substitutes into the array at the base path,
    /// growing it with nulls when it is too short. A non-array base is
    /// replaced by a fresh array.
    ///
    /// # Errors
    /// [`Error::Validation`] when the index exceeds [`MAX_SLOT_INDEX`].
    pub fn set_value_at(&mut self, path: &str, value: Value) -> Result<()> {
        let selector = PathSelector::parse(path);
        match selector.index {
            None => {
                self.entries.insert(path.to_string(), value);
            }
            Some(index) if index > MAX_SLOT_INDEX => {
                return Err(Error::Validation(format!(
                    "index {} in '{}' exceeds the limit of {}",
                    index, path, MAX_SLOT_INDEX
                )));
            }
            Some(index) => {
                let slot = self
                    .entries
                    .entry(selector.base.to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if !slot.is_array() {
                    *slot = Value::Array(Vec::new());
                }
                if let Value::Array(items) = slot {
                    if items.len() <= index {
                        items.resize(index + 1, Value::Null);
                    }
                    items[index] = value;
                }
            }
        }
        Ok(())
    }

    pub fn bind(&mut self, path: &str, from_context: Option<ContextId>, from_path: &str) {
        self.bindings
            .push(InputBinding::new(path, from_context, from_path));
    }

    /// Copy every output entry of `other` into this context, overwriting.
    /// The reserved self binding is not carried over.
    pub fn merge_outputs(&mut self, other: &DataContext) {
        for (path, value) in &other.entries {
            if path == SELF_KEY {
                continue;
            }
            self.entries.insert(path.clone(), value.clone());
        }
    }

    /// Take `previous`'s entries as this context's input, replacing the
    /// current ones. Identity, sharing and scope stay with this context.
    pub fn adopt_entries(&mut self, previous: &DataContext) {
        self.entries = previous
            .entries
            .iter()
            .filter(|(path, _)| path.as_str() != SELF_KEY)
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect();
        self.bindings.clear();
    }
}
