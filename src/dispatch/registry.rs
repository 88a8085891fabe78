use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use crate::core::{ExecState, Exertion, ExertionId};
use crate::{Error, Result};

struct Entry {
    name: String,
    state: watch::Receiver<ExecState>,
}

/// Exertions currently being dispatched, keyed by id.
///
/// Owned by whoever creates the dispatch environment and shared by every
/// dispatcher built from it. Registering an id that is already present
/// fails, which keeps one exertion from running twice at once.
#[derive(Clone, Default)]
pub struct DispatcherRegistry {
    active: Arc<Mutex<HashMap<ExertionId, Entry>>>,
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ExertionId, Entry>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// # Errors
    /// [`Error::AlreadyDispatching`] if `exertion` is already registered.
    pub fn register(&self, exertion: &Exertion, state: watch::Receiver<ExecState>) -> Result<()> {
        let mut active = self.lock();
        if active.contains_key(&exertion.id) {
            return Err(Error::AlreadyDispatching(exertion.id));
        }
        active.insert(
            exertion.id,
            Entry {
                name: exertion.name.clone(),
                state,
            },
        );
        Ok(())
    }

    pub fn unregister(&self, id: &ExertionId) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn contains(&self, id: &ExertionId) -> bool {
        self.lock().contains_key(id)
    }

    /// Current state of a running dispatch.
    pub fn state_of(&self, id: &ExertionId) -> Option<ExecState> {
        self.lock().get(id).map(|e| *e.state.borrow())
    }

    /// Names of everything in flight, for diagnostics.
    pub fn active(&self) -> Vec<(ExertionId, String)> {
        self.lock()
            .iter()
            .map(|(id, e)| (*id, e.name.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
