//! Contexts published by completed exertions for their dependents to read.

use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::{ContextId, DataContext};

/// Thread-safe set of shared data contexts.
///
/// One lock guards both iteration and insertion. A context is stored at
/// most once; putting it again replaces the stored copy, so harvesting the
/// same exertion twice never duplicates it.
#[derive(Clone, Default)]
pub struct SharedContextPool {
    contexts: Arc<Mutex<Vec<DataContext>>>,
}

impl SharedContextPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DataContext>> {
        self.contexts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert `context` if it is marked shared. Returns whether it was stored.
    pub fn put(&self, context: &DataContext) -> bool {
        if !context.shared {
            return false;
        }
        self.upsert(context);
        true
    }

    /// Insert `context` regardless of its shared flag. Used for block
    /// scopes, which children read through their scope link.
    pub fn put_scope(&self, context: &DataContext) {
        self.upsert(context);
    }

    fn upsert(&self, context: &DataContext) {
        let mut contexts = self.lock();
        match contexts.iter_mut().find(|c| c.id == context.id) {
            Some(existing) => *existing = context.clone(),
            None => contexts.push(context.clone()),
        }
    }

    /// Find a context by id, or else the first one (in insertion order)
    /// that holds `path`.
    pub fn get(&self, path: &str, id: Option<ContextId>) -> Option<DataContext> {
        let contexts = self.lock();
        if let Some(id) = id {
            if let Some(found) = contexts.iter().find(|c| c.id == id) {
                return Some(found.clone());
            }
        }
        contexts.iter().find(|c| c.contains(path)).cloned()
    }

    /// The value at `path`, preferring the context `id`.
    ///
    /// Falls back to a path-membership scan when `id` is unknown or its
    /// context does not hold `path`.
    pub fn lookup(&self, path: &str, id: Option<ContextId>) -> Option<Value> {
        let contexts = self.lock();
        if let Some(id) = id {
            let value = contexts
                .iter()
                .find(|c| c.id == id)
                .and_then(|c| c.get(path));
            if let Some(value) = value {
                return Some(value.clone());
            }
        }
        contexts.iter().find_map(|c| c.get(path)).cloned()
    }

    pub fn contains(&self, id: &ContextId) -> bool {
        self.lock().iter().any(|c| &c.id == id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SharedContextPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedContextPool")
            .field("contexts", &self.len())
            .finish()
    }
}
