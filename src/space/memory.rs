use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Envelope, EnvelopeTemplate, Lease, WorkQueue};
use crate::{elog_trace, Error, Result};

struct Slot {
    envelope: Envelope,
    expires: Option<Instant>,
}

/// In-process work queue.
///
/// Takes are first-match in write order. Blocking takes wait on a
/// [`Notify`] that every write signals, so an in-flight take can be
/// dropped at any point without losing an envelope.
#[derive(Default)]
pub struct MemoryWorkQueue {
    slots: Mutex<Vec<Slot>>,
    notify: Notify,
    closed: AtomicBool,
    failing_writes: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`Error::QueueUnavailable`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Fail the next `n` writes as unavailable, then recover.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        let mut slots = self.lock();
        Self::purge(&mut slots);
        slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count live envelopes matching `template` without taking them.
    pub fn count_matching(&self, template: &EnvelopeTemplate) -> usize {
        let mut slots = self.lock();
        Self::purge(&mut slots);
        slots
            .iter()
            .filter(|s| template.matches(&s.envelope))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn purge(slots: &mut Vec<Slot>) {
        let now = Instant::now();
        slots.retain(|s| s.expires.map_or(true, |at| at > now));
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::QueueUnavailable("memory queue is closed".to_string()));
        }
        Ok(())
    }

    fn take_now(&self, templates: &[EnvelopeTemplate], max_batch: usize) -> Vec<Envelope> {
        let mut slots = self.lock();
        Self::purge(&mut slots);

        let mut taken = Vec::new();
        let mut i = 0;
        while i < slots.len() && taken.len() < max_batch {
            if templates.iter().any(|t| t.matches(&slots[i].envelope)) {
                taken.push(slots.remove(i).envelope);
            } else {
                i += 1;
            }
        }
        taken
    }

    fn read_now(&self, template: &EnvelopeTemplate) -> Option<Envelope> {
        let mut slots = self.lock();
        Self::purge(&mut slots);
        slots
            .iter()
            .find(|s| template.matches(&s.envelope))
            .map(|s| s.envelope.clone())
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn write(&self, envelope: Envelope, lease: Lease) -> Result<()> {
        self.ensure_open()?;
        let failing = self.failing_writes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_writes.store(failing - 1, Ordering::SeqCst);
            return Err(Error::QueueUnavailable("transient write failure".to_string()));
        }

        elog_trace!(
            "queue: write parent={} child={:?} state={}",
            envelope.parent_id.short(),
            envelope.child_id.map(|c| c.short()),
            envelope.state
        );
        let expires = match lease {
            Lease::Forever => None,
            Lease::For(d) => Some(Instant::now() + d),
        };
        self.lock().push(Slot { envelope, expires });
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn take(
        &self,
        template: &EnvelopeTemplate,
        timeout: Duration,
    ) -> Result<Option<Envelope>> {
        let mut taken = self
            .take_matching_any(std::slice::from_ref(template), timeout, 1)
            .await?;
        Ok(taken.pop())
    }

    async fn read(
        &self,
        template: &EnvelopeTemplate,
        timeout: Duration,
    ) -> Result<Option<Envelope>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_open()?;
            if let Some(envelope) = self.read_now(template) {
                return Ok(Some(envelope));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                self.ensure_open()?;
                return Ok(self.read_now(template));
            }
        }
    }

    async fn take_matching_any(
        &self,
        templates: &[EnvelopeTemplate],
        timeout: Duration,
        max_batch: usize,
    ) -> Result<Vec<Envelope>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_open()?;
            let taken = self.take_now(templates, max_batch.max(1));
            if !taken.is_empty() {
                return Ok(taken);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                self.ensure_open()?;
                return Ok(self.take_now(templates, max_batch.max(1)));
            }
        }
    }
}
