//! Envelopes exchanged through the work queue and the templates used to
//! take them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{ExecState, Exertion, ExertionId};

/// An immutable wrapper around a unit of work plus routing metadata.
///
/// Keyed by `(parent_id, child_id)`. A poison marker carries no child and
/// no exertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub parent_id: ExertionId,
    pub child_id: Option<ExertionId>,
    pub state: ExecState,
    pub exertion: Option<Exertion>,
    pub written_at: DateTime<Utc>,
}

impl Envelope {
    /// Work awaiting pickup by a space worker.
    pub fn work(parent_id: ExertionId, exertion: Exertion) -> Self {
        Self {
            parent_id,
            child_id: Some(exertion.id),
            state: ExecState::Initial,
            exertion: Some(exertion),
            written_at: Utc::now(),
        }
    }

    /// A result tagged with the exertion's own terminal state.
    pub fn result(parent_id: ExertionId, exertion: Exertion) -> Self {
        Self::with_state(parent_id, exertion.status, exertion)
    }

    pub fn with_state(parent_id: ExertionId, state: ExecState, exertion: Exertion) -> Self {
        Self {
            parent_id,
            child_id: Some(exertion.id),
            state,
            exertion: Some(exertion),
            written_at: Utc::now(),
        }
    }

    /// Marker telling workers to abandon all remaining work of `parent_id`.
    pub fn poison(parent_id: ExertionId) -> Self {
        Self {
            parent_id,
            child_id: None,
            state: ExecState::Poisoned,
            exertion: None,
            written_at: Utc::now(),
        }
    }

    pub fn is_poison(&self) -> bool {
        self.state == ExecState::Poisoned && self.child_id.is_none()
    }
}

/// Matches envelopes on `(parent_id, child_id, state)`; `None` is a wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnvelopeTemplate {
    pub parent_id: Option<ExertionId>,
    pub child_id: Option<ExertionId>,
    pub state: Option<ExecState>,
}

impl EnvelopeTemplate {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_parent(parent_id: ExertionId) -> Self {
        Self {
            parent_id: Some(parent_id),
            ..Self::default()
        }
    }

    pub fn with_child(mut self, child_id: ExertionId) -> Self {
        self.child_id = Some(child_id);
        self
    }

    pub fn with_state(mut self, state: ExecState) -> Self {
        self.state = Some(state);
        self
    }

    /// One template per state, sharing this template's parent and child.
    pub fn for_states(self, states: &[ExecState]) -> Vec<Self> {
        states.iter().map(|s| self.with_state(*s)).collect()
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        self.parent_id.map_or(true, |p| p == envelope.parent_id)
            && self.child_id.map_or(true, |c| Some(c) == envelope.child_id)
            && self.state.map_or(true, |s| s == envelope.state)
    }
}
