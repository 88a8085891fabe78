//! Work-queue access for space-mediated dispatch.
//!
//! The distributed queue itself is external; the dispatcher only relies on
//! atomic single-item write and take-matching-template operations.
//! [`MemoryWorkQueue`] is an in-process stand-in and [`SpaceWorker`] is
//! the consumer side that executes published work.

mod envelope;
mod memory;
mod worker;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::Result;

pub use envelope::{Envelope, EnvelopeTemplate};
pub use memory::MemoryWorkQueue;
pub use worker::SpaceWorker;

/// How long a written envelope stays in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lease {
    Forever,
    For(Duration),
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn write(&self, envelope: Envelope, lease: Lease) -> Result<()>;

    /// Remove and return one envelope matching `template`, waiting up to
    /// `timeout`. `Ok(None)` means the wait timed out.
    async fn take(&self, template: &EnvelopeTemplate, timeout: Duration)
        -> Result<Option<Envelope>>;

    /// Like [`take`](Self::take) but leaves the envelope, and its lease,
    /// in the queue.
    async fn read(&self, template: &EnvelopeTemplate, timeout: Duration)
        -> Result<Option<Envelope>>;

    /// Remove up to `max_batch` envelopes matching any of `templates`,
    /// waiting up to `timeout` for the first one.
    async fn take_matching_any(
        &self,
        templates: &[EnvelopeTemplate],
        timeout: Duration,
        max_batch: usize,
    ) -> Result<Vec<Envelope>>;
}

/// Hands out queue handles. `refresh` asks for a new handle after the
/// previous one reported the queue unavailable.
pub trait QueueAccessor: Send + Sync {
    fn acquire(&self, refresh: bool) -> Result<Arc<dyn WorkQueue>>;
}

/// Accessor that always returns the same handle.
#[derive(Clone)]
pub struct FixedQueue {
    queue: Arc<dyn WorkQueue>,
}

impl FixedQueue {
    pub fn new(queue: Arc<dyn WorkQueue>) -> Self {
        Self { queue }
    }
}

impl QueueAccessor for FixedQueue {
    fn acquire(&self, _refresh: bool) -> Result<Arc<dyn WorkQueue>> {
        Ok(Arc::clone(&self.queue))
    }
}
