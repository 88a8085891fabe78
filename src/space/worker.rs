use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Envelope, EnvelopeTemplate, Lease, WorkQueue};
use crate::core::{ExecState, Exertion, ExertionId};
use crate::dispatch::{normalize_result, panic_message, DispatchEnv, DispatcherFactory};
use crate::service::ServiceLocator;
use crate::{elog_debug, elog_warn, Result};

/// Remote-side consumer of the work queue.
///
/// Takes INITIAL envelopes, runs the task through its locator and writes
/// back a result envelope tagged with the terminal state. Work whose
/// parent has been poisoned is abandoned, both before and after the
/// service runs. Composite work is dispatched through a nested dispatcher
/// when the worker has a [`DispatchEnv`].
pub struct SpaceWorker {
    name: String,
    queue: Arc<dyn WorkQueue>,
    locator: Arc<dyn ServiceLocator>,
    poll: Duration,
    env: Option<DispatchEnv>,
}

impl SpaceWorker {
    pub fn new(name: &str, queue: Arc<dyn WorkQueue>, locator: Arc<dyn ServiceLocator>) -> Self {
        Self {
            name: name.to_string(),
            queue,
            locator,
            poll: Duration::from_millis(500),
            env: None,
        }
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_env(mut self, env: DispatchEnv) -> Self {
        self.env = Some(env);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spawn(self, stop: CancellationToken) -> JoinHandle<usize> {
        tokio::spawn(async move { self.run(stop).await })
    }

    /// Serve the queue until `stop` fires. Returns the number of envelopes
    /// handled.
    pub async fn run(&self, stop: CancellationToken) -> usize {
        let template = EnvelopeTemplate::any().with_state(ExecState::Initial);
        let mut handled = 0;
        elog_debug!("worker {}: started", self.name);

        loop {
            let taken = tokio::select! {
                _ = stop.cancelled() => break,
                taken = self.queue.take(&template, self.poll) => taken,
            };
            match taken {
                Ok(Some(envelope)) => {
                    if let Err(e) = self.handle(envelope).await {
                        elog_warn!("worker {}: {}", self.name, e);
                    }
                    handled += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    elog_warn!("worker {}: take failed: {}", self.name, e);
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(self.poll) => {}
                    }
                }
            }
        }

        elog_debug!("worker {}: stopped after {} envelopes", self.name, handled);
        handled
    }

    /// Execute one taken envelope. Returns the state written back, or
    /// [`ExecState::Poisoned`] when the work was abandoned.
    pub async fn handle(&self, envelope: Envelope) -> Result<ExecState> {
        let parent = envelope.parent_id;
        let Some(exertion) = envelope.exertion else {
            return Ok(ExecState::Poisoned);
        };

        if self.is_poisoned(parent).await? {
            elog_debug!("worker {}: abandoning {}", self.name, exertion.describe());
            return Ok(ExecState::Poisoned);
        }

        let result = self.execute(exertion).await;

        if self.is_poisoned(parent).await? {
            elog_debug!(
                "worker {}: dropping result of {} after poison",
                self.name,
                result.describe()
            );
            return Ok(ExecState::Poisoned);
        }

        let state = result.status;
        let child = result.id;
        self.queue
            .write(Envelope::result(parent, result), Lease::Forever)
            .await?;

        // A poison that landed after the check above may have finished
        // draining before this write; withdraw the result.
        if self.is_poisoned(parent).await? {
            let own = EnvelopeTemplate::for_parent(parent)
                .with_child(child)
                .with_state(state);
            self.queue.take(&own, Duration::ZERO).await?;
            elog_debug!("worker {}: withdrew result of {} after poison", self.name, child.short());
            return Ok(ExecState::Poisoned);
        }
        Ok(state)
    }

    /// Check for a poison marker without consuming it.
    async fn is_poisoned(&self, parent: ExertionId) -> Result<bool> {
        let template = EnvelopeTemplate::for_parent(parent).with_state(ExecState::Poisoned);
        Ok(self.queue.read(&template, Duration::ZERO).await?.is_some())
    }

    async fn execute(&self, exertion: Exertion) -> Exertion {
        if exertion.is_composite() {
            return self.execute_composite(exertion).await;
        }

        let Some(signature) = exertion.signature().cloned() else {
            return exertion;
        };
        let Some(service) = self.locator.resolve(&signature) else {
            let mut failed = exertion;
            failed.status = ExecState::Error;
            failed.report_exception(&format!("no service for {}", signature), None);
            return failed;
        };

        let call = AssertUnwindSafe(service.service(exertion.clone())).catch_unwind();
        match call.await {
            Err(payload) => {
                let mut failed = exertion;
                failed.status = ExecState::Error;
                let message = format!("service panicked: {}", panic_message(payload.as_ref()));
                failed.report_exception(&message, None);
                failed
            }
            Ok(Ok(result)) => {
                let mut result = normalize_result(&exertion, result);
                if matches!(result.status, ExecState::Poisoned | ExecState::Stopped) {
                    result.status = ExecState::Failed;
                }
                result
            }
            Ok(Err(e)) => {
                let mut failed = exertion;
                failed.status = ExecState::Error;
                failed.report_exception(&e.to_string(), None);
                failed
            }
        }
    }

    async fn execute_composite(&self, exertion: Exertion) -> Exertion {
        let Some(env) = &self.env else {
            let mut failed = exertion;
            failed.status = ExecState::Error;
            failed.report_exception("worker cannot dispatch composite work", None);
            return failed;
        };
        match DispatcherFactory::create(exertion.clone(), env.clone()) {
            Ok(dispatcher) => {
                dispatcher.exec().await;
                dispatcher.exertion()
            }
            Err(e) => {
                let mut failed = exertion;
                failed.fail(&e.to_string());
                failed
            }
        }
    }
}
