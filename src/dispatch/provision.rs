//! On-demand deployment of the services tasks depend on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use crate::config::DispatchConfig;
use crate::core::{ExecState, Exertion, ExertionId};
use crate::service::{Provisioner, ServiceRegistry};
use crate::space::{Envelope, Lease, WorkQueue};
use crate::{elog_debug, elog_error, elog_warn, Error, Result};

#[derive(Default)]
struct Ledger {
    /// Flips to true once provisioning for the task has finished either way.
    settled: HashMap<ExertionId, watch::Receiver<bool>>,
    failures: HashMap<ExertionId, String>,
}

/// Deploys the services declared by provisionable tasks.
///
/// Provisioning normally runs in the background; a task that needs its
/// service waits on [`wait_settled`](Self::wait_settled) and then checks
/// [`failure`](Self::failure). Provisioned handles are registered with the
/// configured [`ServiceRegistry`] so the normal lookup finds them.
#[derive(Clone)]
pub struct ProvisionCoordinator {
    provisioner: Arc<dyn Provisioner>,
    registry: Option<ServiceRegistry>,
    attempts: u32,
    ledger: Arc<Mutex<Ledger>>,
}

impl ProvisionCoordinator {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self::from_config(provisioner, &DispatchConfig::default())
    }

    /// A coordinator making `provision_attempts` tries per deployment.
    pub fn from_config(provisioner: Arc<dyn Provisioner>, config: &DispatchConfig) -> Self {
        Self {
            provisioner,
            registry: None,
            attempts: config.provision_attempts.max(1),
            ledger: Arc::new(Mutex::new(Ledger::default())),
        }
    }

    pub fn with_registry(mut self, registry: ServiceRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Tasks under `unit` (itself included) that still need a deployment.
    fn candidates(unit: &Exertion) -> Vec<Exertion> {
        let mut found = Vec::new();
        unit.visit(&mut |e| {
            if e.is_task()
                && e.control.provisionable
                && !e.deployments.is_empty()
                && e.status != ExecState::Done
            {
                found.push(e.clone());
            }
        });
        found
    }

    /// Claim `task` for provisioning. Returns the sender to settle it with,
    /// or `None` if it is already provisioned or in progress. A recorded
    /// failure is only retried when `retry_failed` is set.
    fn claim(&self, task: &ExertionId, retry_failed: bool) -> Option<watch::Sender<bool>> {
        let mut ledger = self.lock();
        let failed = ledger.failures.contains_key(task);
        if ledger.settled.contains_key(task) && !(failed && retry_failed) {
            return None;
        }
        ledger.failures.remove(task);
        let (tx, rx) = watch::channel(false);
        ledger.settled.insert(*task, rx);
        Some(tx)
    }

    /// Start provisioning every provisionable task under `unit` without
    /// waiting for it. When `queue` is given, a task whose provisioning
    /// fails is also reported as a FAILED result envelope so a collector
    /// waiting on that queue observes it.
    ///
    /// Earlier failures are retried only when `unit` is a root; nested
    /// dispatchers see the outcome their root already recorded.
    pub fn ensure_provisioned(&self, unit: &Exertion, queue: Option<Arc<dyn WorkQueue>>) {
        let retry_failed = unit.parent.is_none();
        for task in Self::candidates(unit) {
            let Some(settle) = self.claim(&task.id, retry_failed) else {
                continue;
            };
            let coordinator = self.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                let outcome = coordinator.provision_task(&task).await;
                if let Err(e) = &outcome {
                    if let Some(queue) = queue {
                        let mut failed = task.clone();
                        failed.fail(&e.to_string());
                        let parent = task.parent.unwrap_or(task.id);
                        let envelope = Envelope::with_state(parent, ExecState::Failed, failed);
                        if let Err(write_err) = queue.write(envelope, Lease::Forever).await {
                            elog_error!(
                                "provision: could not report failure of {}: {}",
                                task.describe(),
                                write_err
                            );
                        }
                    }
                }
                coordinator.settle(&task.id, &outcome, &settle);
            });
        }
    }

    /// Provision every task under `unit` and wait for all of them.
    ///
    /// # Errors
    /// The first provisioning failure, after every task has been tried.
    pub async fn ensure_provisioned_sync(&self, unit: &Exertion) -> Result<()> {
        let retry_failed = unit.parent.is_none();
        let mut first_error = None;
        for task in Self::candidates(unit) {
            let Some(settle) = self.claim(&task.id, retry_failed) else {
                if let Some(reason) = self.failure(&task.id) {
                    first_error.get_or_insert(Error::Provisioning {
                        service: task.describe(),
                        reason,
                    });
                }
                continue;
            };
            let outcome = self.provision_task(&task).await;
            self.settle(&task.id, &outcome, &settle);
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn settle(&self, task: &ExertionId, outcome: &Result<()>, settle: &watch::Sender<bool>) {
        if let Err(e) = outcome {
            self.lock().failures.insert(*task, e.to_string());
        }
        settle.send_replace(true);
    }

    async fn provision_task(&self, task: &Exertion) -> Result<()> {
        for deployment in &task.deployments {
            let mut last = None;
            for attempt in 1..=self.attempts {
                match self.provisioner.provision(deployment).await {
                    Ok(service) => {
                        elog_debug!(
                            "provision: {} ready as '{}' for {}",
                            deployment,
                            service.name(),
                            task.describe()
                        );
                        if let Some(registry) = &self.registry {
                            registry.register(service);
                        }
                        last = None;
                        break;
                    }
                    Err(e) => {
                        elog_warn!(
                            "provision: {} attempt {}/{} failed: {}",
                            deployment,
                            attempt,
                            self.attempts,
                            e
                        );
                        last = Some(e);
                    }
                }
            }
            if let Some(e) = last {
                return Err(Error::Provisioning {
                    service: deployment.to_string(),
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Wait until provisioning for `task` has finished. Returns at once if
    /// it was never requested.
    pub async fn wait_settled(&self, task: &ExertionId) {
        let rx = self.lock().settled.get(task).cloned();
        if let Some(mut rx) = rx {
            // A dropped sender means the provisioning task is gone.
            let _ = rx.wait_for(|settled| *settled).await;
        }
    }

    pub fn failure(&self, task: &ExertionId) -> Option<String> {
        self.lock().failures.get(task).cloned()
    }
}

impl std::fmt::Debug for ProvisionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ledger = self.lock();
        f.debug_struct("ProvisionCoordinator")
            .field("attempts", &self.attempts)
            .field("tracked", &ledger.settled.len())
            .field("failures", &ledger.failures.len())
            .finish()
    }
}
