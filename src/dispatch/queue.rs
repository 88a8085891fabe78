//! Queue-mediated execution: children are published as envelopes to the
//! shared work queue, executed by remote space workers and collected back
//! by polling with state-tagged templates.
//!
//! A failed result poisons the parent: pending publishers are cancelled, a
//! poison marker is written for the workers, and leftover envelopes for
//! the parent are drained before the parent is declared FAILED.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::core::{apply_outcome, bind_inputs, harvest, normalize_result, DispatchEnv};
use crate::core::{ExecState, Exertion, ExertionId};
use crate::space::{Envelope, EnvelopeTemplate, Lease, QueueAccessor, WorkQueue};
use crate::{elog_debug, elog_error, elog_warn, Error, Result};

const RESULT_STATES: [ExecState; 4] = [
    ExecState::Done,
    ExecState::Failed,
    ExecState::Error,
    ExecState::Suspended,
];

const FAILURE_STATES: [ExecState; 2] = [ExecState::Failed, ExecState::Error];

/// A queue handle plus the accessor to replace it with when the queue
/// reports itself unavailable. Each operation reacquires and retries once.
#[derive(Clone)]
struct QueueLink {
    accessor: Arc<dyn QueueAccessor>,
    queue: Arc<dyn WorkQueue>,
}

impl QueueLink {
    fn open(env: &DispatchEnv) -> Result<Self> {
        let accessor = env
            .queue
            .clone()
            .ok_or_else(|| Error::QueueUnavailable("no work queue configured".to_string()))?;
        let queue = accessor.acquire(false)?;
        Ok(Self { accessor, queue })
    }

    fn refresh(&mut self, reason: &str) -> Result<()> {
        elog_warn!("queue: unavailable ({}), reacquiring", reason);
        self.queue = self.accessor.acquire(true)?;
        Ok(())
    }

    async fn write(&mut self, envelope: Envelope, lease: Lease) -> Result<()> {
        match self.queue.write(envelope.clone(), lease).await {
            Err(Error::QueueUnavailable(reason)) => {
                self.refresh(&reason)?;
                self.queue.write(envelope, lease).await
            }
            other => other,
        }
    }

    async fn take_any(
        &mut self,
        templates: &[EnvelopeTemplate],
        timeout: Duration,
        max_batch: usize,
    ) -> Result<Vec<Envelope>> {
        match self.queue.take_matching_any(templates, timeout, max_batch).await {
            Err(Error::QueueUnavailable(reason)) => {
                self.refresh(&reason)?;
                self.queue.take_matching_any(templates, timeout, max_batch).await
            }
            other => other,
        }
    }
}

/// Why collection ended early.
enum Halt {
    Failed(Exertion),
    Suspended(Exertion),
    Stopped,
}

/// Publish the children of `parent` and collect their results.
///
/// With `ordered`, child `k` is published only once `k` children have
/// come back DONE, giving strict in-order hand-off over the queue.
pub(crate) async fn run(env: &DispatchEnv, parent: &mut Exertion, ordered: bool) -> Result<()> {
    let mut link = QueueLink::open(env)?;
    let parent_id = parent.id;
    let children = std::mem::take(&mut parent.children);
    let master_id = parent.control.master;

    if parent.is_block() {
        env.pool.put_scope(&parent.context);
    }

    let mut settled: Vec<Option<Exertion>> = vec![None; children.len()];
    let mut master = None;
    let mut published: Vec<(usize, Exertion)> = Vec::new();
    for (i, mut child) in children.into_iter().enumerate() {
        if parent.is_block() {
            child.context.scope = Some(parent.context.id);
        }
        if Some(child.id) == master_id {
            master = Some((i, child));
        } else if child.status == ExecState::Done {
            settled[i] = Some(child);
        } else {
            published.push((i, child));
        }
    }
    let slot_of: HashMap<ExertionId, usize> =
        published.iter().map(|(i, c)| (c.id, *i)).collect();

    let (done_tx, done_rx) = watch::channel(0usize);
    let (fail_tx, mut fail_rx) = mpsc::unbounded_channel::<Exertion>();
    let publishing = env.stop.child_token();
    let publishers: Vec<JoinHandle<()>> = published
        .iter()
        .enumerate()
        .map(|(position, (_, child))| {
            let publisher = Publisher {
                env: env.clone(),
                link: link.clone(),
                parent_id,
                position: ordered.then_some(position),
                done: done_rx.clone(),
                failures: fail_tx.clone(),
                cancel: publishing.clone(),
            };
            tokio::spawn(publisher.publish(child.clone()))
        })
        .collect();

    let watching = CancellationToken::new();
    let watcher = tokio::spawn(watch_failures(
        link.clone(),
        parent_id,
        env.config.poll_timeout(),
        fail_tx.clone(),
        watching.clone(),
    ));
    drop(fail_tx);

    let templates = EnvelopeTemplate::for_parent(parent_id).for_states(&RESULT_STATES);
    let batch = env.config.collect_batch.max(1);
    let mut collected = 0;
    let mut halt = None;
    let mut failure: Option<Error> = None;

    while collected < published.len() && halt.is_none() {
        if env.stop.is_cancelled() {
            halt = Some(Halt::Stopped);
            break;
        }
        tokio::select! {
            _ = env.stop.cancelled() => {}
            Some(failed) = fail_rx.recv() => {
                halt = Some(Halt::Failed(failed));
            }
            taken = link.take_any(&templates, env.config.poll_timeout(), batch) => {
                let envelopes = match taken {
                    Ok(envelopes) => envelopes,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                };
                for envelope in envelopes {
                    let (Some(child_id), Some(child)) = (envelope.child_id, envelope.exertion) else {
                        continue;
                    };
                    let Some(&slot) = slot_of.get(&child_id) else {
                        elog_debug!("queue: ignoring stray result for {}", child_id.short());
                        continue;
                    };
                    match envelope.state {
                        ExecState::Done | ExecState::Suspended if settled[slot].is_none() => {
                            if child.status == ExecState::Done {
                                harvest(&env.pool, &child);
                                if parent.is_block() {
                                    parent.context.merge_outputs(&child.context);
                                    env.pool.put_scope(&parent.context);
                                }
                            }
                            let suspended = child.status == ExecState::Suspended;
                            if suspended && ordered && halt.is_none() {
                                halt = Some(Halt::Suspended(child.clone()));
                            }
                            settled[slot] = Some(child);
                            collected += 1;
                            if !suspended {
                                done_tx.send_modify(|n| *n += 1);
                            }
                        }
                        ExecState::Done | ExecState::Suspended => {}
                        _ => {
                            if halt.is_none() {
                                halt = Some(Halt::Failed(child));
                            }
                        }
                    }
                }
            }
        }
    }

    watching.cancel();
    let _ = watcher.await;

    if halt.is_some() || failure.is_some() {
        poison(env, &mut link, parent_id, &publishing, publishers).await;
        for (slot, child) in &published {
            if settled[*slot].is_none() {
                let mut abandoned = child.clone();
                abandoned.poison();
                settled[*slot] = Some(abandoned);
            }
        }
    } else {
        for handle in publishers {
            let _ = handle.await;
        }
    }

    if let Some(e) = failure {
        if let Some((i, child)) = master {
            settled[i] = Some(child);
        }
        parent.children = settled.into_iter().flatten().collect();
        return Err(e);
    }

    match halt {
        Some(Halt::Failed(child)) => {
            let slot = slot_of.get(&child.id).copied();
            apply_outcome(parent, &child);
            if let Some(slot) = slot {
                settled[slot] = Some(child);
            }
        }
        Some(Halt::Suspended(child)) => {
            apply_outcome(parent, &child);
        }
        Some(Halt::Stopped) => {
            elog_warn!("queue: {} stopped", parent.describe());
            parent.fail("dispatch stopped");
        }
        None => {
            for child in settled.iter().flatten() {
                if child.status == ExecState::Suspended {
                    apply_outcome(parent, child);
                    break;
                }
            }
        }
    }

    if let Some((i, child)) = master {
        let child = if parent.status == ExecState::Running {
            let child = match publish_and_await(env, &mut link, parent_id, child.clone()).await {
                Ok(result) => result,
                Err(e) => {
                    let mut child = child;
                    child.fail(&e.to_string());
                    child
                }
            };
            if child.status == ExecState::Done {
                harvest(&env.pool, &child);
            }
            apply_outcome(parent, &child);
            child
        } else {
            child
        };
        settled[i] = Some(child);
    }

    parent.children = settled.into_iter().flatten().collect();
    Ok(())
}

/// Cancel outstanding publishers, mark the parent poisoned for workers and
/// drain everything still queued for it.
async fn poison(
    env: &DispatchEnv,
    link: &mut QueueLink,
    parent_id: ExertionId,
    publishing: &CancellationToken,
    publishers: Vec<JoinHandle<()>>,
) {
    publishing.cancel();
    for handle in publishers {
        let _ = handle.await;
    }

    elog_warn!("queue: poisoning work of {}", parent_id.short());
    if let Err(e) = link
        .write(Envelope::poison(parent_id), Lease::For(env.config.lease_period()))
        .await
    {
        elog_error!("queue: could not write poison for {}: {}", parent_id.short(), e);
    }

    let mut states = vec![ExecState::Initial];
    states.extend(RESULT_STATES);
    let templates = EnvelopeTemplate::for_parent(parent_id).for_states(&states);
    let batch = env.config.collect_batch.max(1);
    let mut drained = 0;
    loop {
        match link
            .take_any(&templates, env.config.drain_timeout(), batch)
            .await
        {
            Ok(envelopes) if envelopes.is_empty() => break,
            Ok(envelopes) => drained += envelopes.len(),
            Err(e) => {
                elog_error!("queue: drain for {} failed: {}", parent_id.short(), e);
                break;
            }
        }
    }
    elog_debug!("queue: drained {} envelopes of {}", drained, parent_id.short());
}

/// Forward FAILED/ERROR results of `parent_id` as soon as they appear.
async fn watch_failures(
    mut link: QueueLink,
    parent_id: ExertionId,
    poll: Duration,
    failures: mpsc::UnboundedSender<Exertion>,
    cancel: CancellationToken,
) {
    let templates = EnvelopeTemplate::for_parent(parent_id).for_states(&FAILURE_STATES);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            taken = link.take_any(&templates, poll, 1) => match taken {
                Ok(envelopes) => {
                    let mut seen = false;
                    for child in envelopes.into_iter().filter_map(|e| e.exertion) {
                        seen = true;
                        let _ = failures.send(child);
                    }
                    if seen {
                        break;
                    }
                }
                Err(e) => {
                    elog_warn!("queue: failure watch for {} stopped: {}", parent_id.short(), e);
                    break;
                }
            }
        }
    }
}

struct Publisher {
    env: DispatchEnv,
    link: QueueLink,
    parent_id: ExertionId,
    /// Done-index to wait for before publishing, in ordered mode.
    position: Option<usize>,
    done: watch::Receiver<usize>,
    failures: mpsc::UnboundedSender<Exertion>,
    cancel: CancellationToken,
}

impl Publisher {
    async fn publish(mut self, mut child: Exertion) {
        if let Some(position) = self.position {
            let reached = tokio::select! {
                _ = self.cancel.cancelled() => false,
                reached = self.done.wait_for(|n| *n >= position) => reached.is_ok(),
            };
            if !reached {
                return;
            }
        }

        if let Some(coordinator) = &self.env.provisioner {
            coordinator.wait_settled(&child.id).await;
            if let Some(reason) = coordinator.failure(&child.id) {
                child.fail(&reason);
                let _ = self.failures.send(child);
                return;
            }
        }
        if self.cancel.is_cancelled() {
            return;
        }

        if let Err(e) = bind_inputs(&self.env.pool, &mut child) {
            elog_error!("queue: cannot bind {}: {}", child.describe(), e);
            child.fail(&e.to_string());
            let _ = self.failures.send(child);
            return;
        }
        child.start();
        child.trace(format!("published to queue under {}", self.parent_id.short()));
        elog_debug!("queue: publishing {}", child.describe());

        let envelope = Envelope::work(self.parent_id, child.clone());
        if let Err(e) = self.link.write(envelope, Lease::Forever).await {
            elog_error!("queue: could not publish {}: {}", child.describe(), e);
            child.fail(&e.to_string());
            let _ = self.failures.send(child);
        }
    }
}

/// Publish a single exertion and wait for its result by id.
async fn publish_and_await(
    env: &DispatchEnv,
    link: &mut QueueLink,
    parent_id: ExertionId,
    mut child: Exertion,
) -> Result<Exertion> {
    bind_inputs(&env.pool, &mut child)?;
    child.start();
    let child_id = child.id;
    link.write(Envelope::work(parent_id, child.clone()), Lease::Forever)
        .await?;

    let templates = EnvelopeTemplate::for_parent(parent_id)
        .with_child(child_id)
        .for_states(&RESULT_STATES);
    loop {
        if env.stop.is_cancelled() {
            let mut stopped = child;
            stopped.fail("dispatch stopped");
            return Ok(stopped);
        }
        tokio::select! {
            _ = env.stop.cancelled() => {}
            taken = link.take_any(&templates, env.config.poll_timeout(), 1) => {
                if let Some(result) = taken?.into_iter().find_map(|e| e.exertion) {
                    return Ok(normalize_result(&child, result));
                }
            }
        }
    }
}

/// Dispatch a lone task through the queue: publish it under its parent
/// (or itself when it has none) and wait for the result.
pub(crate) async fn run_single(env: &DispatchEnv, task: &mut Exertion) -> Result<()> {
    let mut link = QueueLink::open(env)?;
    let parent_id = task.parent.unwrap_or(task.id);
    let result = publish_and_await(env, &mut link, parent_id, task.clone()).await?;
    *task = result;
    Ok(())
}
