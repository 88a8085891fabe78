//! The dispatcher state machine and the per-child execution steps shared
//! by every strategy.
//!
//! A [`Dispatcher`] owns one sorted exertion and drives it from INITIAL to
//! a terminal state:
//!
//! 1. register in the [`DispatcherRegistry`]
//! 2. RUNNING
//! 3. reconcile DONE children, bind inputs, start provisioning
//! 4. run the [`Strategy`]
//! 5. finalize the output context, unregister, release the session lease
//!
//! Any error on the way is attached to the exertion and turns it FAILED;
//! [`Dispatcher::exec`] itself never fails. A panic in a child or in the
//! strategy counts as a failure too.

use futures::future::{BoxFuture, FutureExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::factory::DispatcherFactory;
use super::provision::ProvisionCoordinator;
use super::registry::DispatcherRegistry;
use super::shared::SharedContextPool;
use super::{parallel, queue, sequential};
use crate::config::DispatchConfig;
use crate::core::{Access, ExecState, Exertion, Signature, SELF_KEY};
use crate::service::{Service, ServiceLocator, SessionTracker};
use crate::space::QueueAccessor;
use crate::{elog_debug, elog_error, elog_warn, Error, Result};

/// Everything a dispatcher needs from its surroundings.
///
/// Cloning is cheap; nested dispatchers get a clone of their parent's
/// environment, so they share its registry, pool and stop flag.
#[derive(Clone)]
pub struct DispatchEnv {
    pub registry: DispatcherRegistry,
    pub pool: SharedContextPool,
    pub locator: Arc<dyn ServiceLocator>,
    /// In-process provider tried before the locator.
    pub provider: Option<Arc<dyn Service>>,
    pub queue: Option<Arc<dyn QueueAccessor>>,
    pub provisioner: Option<ProvisionCoordinator>,
    pub tracker: Option<Arc<dyn SessionTracker>>,
    pub config: DispatchConfig,
    /// External stop flag, checked by every collector loop.
    pub stop: CancellationToken,
}

impl DispatchEnv {
    pub fn new(locator: Arc<dyn ServiceLocator>) -> Self {
        Self {
            registry: DispatcherRegistry::new(),
            pool: SharedContextPool::new(),
            locator,
            provider: None,
            queue: None,
            provisioner: None,
            tracker: None,
            config: DispatchConfig::default(),
            stop: CancellationToken::new(),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn Service>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn QueueAccessor>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_provisioner(mut self, provisioner: ProvisionCoordinator) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn SessionTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_pool(mut self, pool: SharedContextPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_registry(mut self, registry: DispatcherRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }
}

/// How a dispatcher executes its exertion, chosen once by the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// A single task run in-process or by a direct service call.
    Direct,
    Sequential,
    Parallel,
    /// Children published to the work queue; `ordered` adds the
    /// done-index barrier.
    Queue { ordered: bool },
    /// A single task published to the work queue and awaited.
    QueueSingle,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Direct => write!(f, "direct"),
            Strategy::Sequential => write!(f, "sequential"),
            Strategy::Parallel => write!(f, "parallel"),
            Strategy::Queue { ordered: true } => write!(f, "queue (ordered)"),
            Strategy::Queue { ordered: false } => write!(f, "queue"),
            Strategy::QueueSingle => write!(f, "queue (single)"),
        }
    }
}

struct Inner {
    strategy: Strategy,
    env: DispatchEnv,
    slot: Mutex<Exertion>,
    state: watch::Sender<ExecState>,
    ran: AtomicBool,
}

/// Drives one exertion to a terminal state.
///
/// Clones share the same run. Create one with
/// [`DispatcherFactory::create`].
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub(crate) fn new(exertion: Exertion, strategy: Strategy, env: DispatchEnv) -> Self {
        let (state, _) = watch::channel(exertion.status);
        Self {
            inner: Arc::new(Inner {
                strategy,
                env,
                slot: Mutex::new(exertion),
                state,
                ran: AtomicBool::new(false),
            }),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Exertion> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn strategy(&self) -> Strategy {
        self.inner.strategy
    }

    /// Current copy of the exertion. Mid-run this is the state it was in
    /// when dispatch started.
    pub fn exertion(&self) -> Exertion {
        self.slot().clone()
    }

    pub fn get_state(&self) -> ExecState {
        *self.inner.state.borrow()
    }

    /// Wait until the dispatch is terminal and return the final state and
    /// exertion. Waits forever if [`exec`](Self::exec) is never called.
    pub async fn get_result(&self) -> (ExecState, Exertion) {
        let mut rx = self.inner.state.subscribe();
        let state = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.get_state(),
        };
        (state, self.exertion())
    }

    /// Run [`exec`](Self::exec) on the tokio runtime.
    pub fn start(&self) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.exec().await })
    }

    /// Run the exertion to a terminal state. Only the first call does
    /// anything; failures end up on the exertion.
    pub async fn exec(&self) {
        if self.inner.ran.swap(true, Ordering::SeqCst) {
            elog_warn!("dispatch: exec called twice for {}", self.exertion().describe());
            return;
        }

        let env = &self.inner.env;
        let mut exertion = self.exertion();

        if let Err(e) = env.registry.register(&exertion, self.inner.state.subscribe()) {
            elog_error!("dispatch: {}", e);
            exertion.fail(&e.to_string());
            self.finish(exertion);
            return;
        }

        self.monitor_init(&exertion);
        exertion.start();
        exertion.trace(format!("{} dispatched ({})", exertion.describe(), self.inner.strategy));
        self.publish_state(&exertion);
        elog_debug!(
            "dispatch: {} running with {} strategy",
            exertion.describe(),
            self.inner.strategy
        );

        let backup = exertion.clone();
        let outcome = AssertUnwindSafe(self.run(&mut exertion)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                elog_error!("dispatch: {} failed: {}", exertion.describe(), e);
                exertion.fail(&e.to_string());
            }
            Err(payload) => {
                let e = Error::Panicked(panic_message(payload.as_ref()));
                elog_error!("dispatch: {} {}", backup.describe(), e);
                exertion = backup;
                exertion.fail(&e.to_string());
            }
        }
        self.finalize(&mut exertion);

        env.registry.unregister(&exertion.id);
        self.monitor_release(&exertion);
        self.finish(exertion);
    }

    async fn run(&self, exertion: &mut Exertion) -> Result<()> {
        self.before_parent(exertion)?;

        let env = &self.inner.env;
        match self.inner.strategy {
            Strategy::Direct | Strategy::QueueSingle => {
                let child = std::mem::replace(exertion, Exertion::job(""));
                *exertion = exec_child(env.clone(), child).await;
            }
            Strategy::Sequential => sequential::run(env, exertion).await?,
            Strategy::Parallel => parallel::run(env, exertion).await?,
            Strategy::Queue { ordered } => queue::run(env, exertion, ordered).await?,
        }

        self.after_exec(exertion);
        Ok(())
    }

    /// Reconcile children left DONE by an earlier run, bind what inputs
    /// are already available and kick off provisioning.
    fn before_parent(&self, exertion: &mut Exertion) -> Result<()> {
        let env = &self.inner.env;
        reconcile(&env.pool, exertion);
        for child in exertion.children.iter_mut() {
            if child.status != ExecState::Done {
                // Retried when the child runs, which fails it on error.
                if let Err(e) = bind_inputs(&env.pool, child) {
                    elog_warn!("bind: {}: {}", child.describe(), e);
                }
            }
        }

        if let Some(coordinator) = &env.provisioner {
            let queue = match (self.inner.strategy, &env.queue) {
                (Strategy::Queue { .. } | Strategy::QueueSingle, Some(accessor)) => {
                    Some(accessor.acquire(false)?)
                }
                _ => None,
            };
            coordinator.ensure_provisioned(exertion, queue);
        }
        Ok(())
    }

    fn after_exec(&self, exertion: &mut Exertion) {
        let note = format!("{} finished {}", exertion.describe(), exertion.status);
        exertion.trace(note);
    }

    fn finalize(&self, exertion: &mut Exertion) {
        match exertion.status {
            ExecState::Running | ExecState::Initial | ExecState::InSpace => exertion.complete(),
            _ => {
                if exertion.control.completed_at.is_none() {
                    exertion.control.completed_at = Some(chrono::Utc::now());
                }
            }
        }
        if exertion.status == ExecState::Done {
            harvest(&self.inner.env.pool, exertion);
        }
    }

    /// Store the result, then announce the terminal state.
    fn finish(&self, exertion: Exertion) {
        let status = exertion.status;
        self.monitor_changed(&exertion);
        *self.slot() = exertion;
        self.inner.state.send_replace(status);
    }

    fn publish_state(&self, exertion: &Exertion) {
        self.monitor_changed(exertion);
        self.inner.state.send_replace(exertion.status);
    }

    fn tracker(&self, exertion: &Exertion) -> Option<&Arc<dyn SessionTracker>> {
        if !exertion.control.monitorable {
            return None;
        }
        self.inner.env.tracker.as_ref()
    }

    fn monitor_init(&self, exertion: &Exertion) {
        if let Some(tracker) = self.tracker(exertion) {
            let config = &self.inner.env.config;
            if let Err(e) = tracker.init(exertion.id, config.lease_period(), config.monitor_timeout()) {
                elog_warn!("monitor: init for {} failed: {}", exertion.describe(), e);
            }
        }
    }

    fn monitor_changed(&self, exertion: &Exertion) {
        if let Some(tracker) = self.tracker(exertion) {
            if let Err(e) = tracker.changed(
                exertion.id,
                &exertion.context,
                &exertion.control,
                exertion.status,
            ) {
                elog_warn!("monitor: update for {} failed: {}", exertion.describe(), e);
            }
        }
    }

    fn monitor_release(&self, exertion: &Exertion) {
        if let Some(tracker) = self.tracker(exertion) {
            if let Err(e) = tracker.release(exertion.id) {
                elog_warn!("monitor: release for {} failed: {}", exertion.describe(), e);
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("strategy", &self.inner.strategy)
            .field("state", &self.get_state())
            .finish()
    }
}

// ========== Shared steps ==========

/// Harvest DONE children into the pool and reset everything else so it
/// runs again. Recurses into composites that are not DONE.
pub(crate) fn reconcile(pool: &SharedContextPool, exertion: &mut Exertion) {
    for child in exertion.children.iter_mut() {
        if child.status == ExecState::Done {
            harvest(pool, child);
            continue;
        }
        child.reset_unfinished();
        reconcile(pool, child);
    }
}

/// Publish the shared contexts of `exertion` and its DONE descendants.
pub(crate) fn harvest(pool: &SharedContextPool, exertion: &Exertion) {
    exertion.visit(&mut |e| {
        if e.status == ExecState::Done && pool.put(&e.context) {
            elog_debug!("pool: harvested context of {}", e.describe());
        }
    });
}

/// Fill every declared input of `exertion` that the pool can resolve.
///
/// A binding without a source context falls back to the exertion's scope.
///
/// # Errors
/// A binding whose target path cannot be written.
pub(crate) fn bind_inputs(pool: &SharedContextPool, exertion: &mut Exertion) -> Result<()> {
    let bindings = exertion.context.bindings.clone();
    for binding in &bindings {
        let source = binding.from_context.or(exertion.context.scope);
        match pool.lookup(&binding.from_path, source) {
            Some(value) => exertion.context.set_value_at(&binding.path, value)?,
            None => elog_debug!(
                "bind: {} has no value yet for {} <- {}",
                exertion.describe(),
                binding.path,
                binding.from_path
            ),
        }
    }
    Ok(())
}

/// Adopt a service's returned task into `original`'s identity.
///
/// Ids, the context id and the context's sharing and scope are kept from
/// `original`; a status left INITIAL or RUNNING becomes DONE.
pub(crate) fn normalize_result(original: &Exertion, mut result: Exertion) -> Exertion {
    result.id = original.id;
    result.parent = original.parent;
    result.context.id = original.context.id;
    result.context.shared = original.context.shared;
    result.context.scope = original.context.scope;
    match result.status {
        ExecState::Initial | ExecState::Running | ExecState::InSpace => result.complete(),
        _ => {
            if result.control.completed_at.is_none() {
                result.control.completed_at = Some(chrono::Utc::now());
            }
        }
    }
    result
}

/// Fold a finished child into its parent. Returns whether the parent may
/// go on with its remaining children.
pub(crate) fn apply_outcome(parent: &mut Exertion, child: &Exertion) -> bool {
    match child.status {
        ExecState::Done => true,
        ExecState::Suspended => {
            parent.suspend();
            parent.trace(format!("suspended by {}", child.describe()));
            false
        }
        status => {
            let cause = child
                .last_exception()
                .map(|e| format!(": {}", e.message))
                .unwrap_or_default();
            parent.fail_from(&format!("{} ended {}{}", child.describe(), status, cause), child.id);
            false
        }
    }
}

fn before_exec(child: &mut Exertion) {
    let me = serde_json::json!({
        "id": child.id.to_string(),
        "name": child.name,
        "kind": child.kind_name(),
    });
    child.context.put(SELF_KEY, me);
    let note = format!("exec {}", child.describe());
    child.trace(note);
    child.start();
}

/// Run one child to a terminal state and harvest it if DONE.
///
/// Takes ownership so it can run on a spawned task. A panic while running
/// leaves the child FAILED with the panic message.
pub(crate) async fn exec_child(env: DispatchEnv, child: Exertion) -> Exertion {
    let backup = child.clone();
    match AssertUnwindSafe(run_child(env, child)).catch_unwind().await {
        Ok(child) => child,
        Err(payload) => {
            let e = Error::Panicked(panic_message(payload.as_ref()));
            elog_error!("dispatch: {} {}", backup.describe(), e);
            let mut child = backup;
            child.fail(&e.to_string());
            child
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return message.to_string();
    }
    payload
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_else(|| "unknown panic".to_string())
}

async fn run_child(env: DispatchEnv, mut child: Exertion) -> Exertion {
    if let Err(e) = bind_inputs(&env.pool, &mut child) {
        elog_error!("dispatch: cannot bind {}: {}", child.describe(), e);
        child.fail(&e.to_string());
        return child;
    }
    before_exec(&mut child);

    if let Some(coordinator) = &env.provisioner {
        coordinator.wait_settled(&child.id).await;
        if let Some(reason) = coordinator.failure(&child.id) {
            child.fail(&reason);
            return child;
        }
    }

    if child.is_task() {
        if child.control.access == Access::Pull {
            if let Err(e) = queue::run_single(&env, &mut child).await {
                child.fail(&e.to_string());
            }
        } else {
            run_task(&env, &mut child).await;
        }
    } else {
        child = dispatch_nested(env.clone(), child).await;
    }

    if child.control.completed_at.is_none() {
        child.control.completed_at = Some(chrono::Utc::now());
    }
    if child.status == ExecState::Done {
        harvest(&env.pool, &child);
    }
    elog_debug!("dispatch: {} -> {}", child.describe(), child.status);
    child
}

/// Dispatch a composite child through its own dispatcher and wait for it.
fn dispatch_nested(env: DispatchEnv, child: Exertion) -> BoxFuture<'static, Exertion> {
    async move {
        match DispatcherFactory::select(&child, &env) {
            Ok(strategy) => {
                let dispatcher = Dispatcher::new(child, strategy, env);
                dispatcher.exec().await;
                dispatcher.exertion()
            }
            Err(e) => {
                let mut child = child;
                child.fail(&e.to_string());
                child
            }
        }
    }
    .boxed()
}

async fn run_task(env: &DispatchEnv, task: &mut Exertion) {
    let Some(signature) = task.signature().cloned() else {
        return;
    };

    let outcome = match &env.provider {
        Some(provider) if provider.accepts(&signature) => provider.service(task.clone()).await,
        _ => call_with_retry(env, &signature, task).await,
    };
    match outcome {
        Ok(result) => *task = normalize_result(task, result),
        Err(e) => task.fail(&e.to_string()),
    }
}

/// Resolve and call the task's service, re-resolving after every failure.
async fn call_with_retry(env: &DispatchEnv, signature: &Signature, task: &Exertion) -> Result<Exertion> {
    let attempts = env.config.max_call_attempts.max(1);
    let mut last = Error::ServiceNotFound(signature.to_string());

    for attempt in 1..=attempts {
        let Some(service) = env.locator.resolve(signature) else {
            elog_warn!(
                "call: no service for {} (attempt {}/{})",
                signature,
                attempt,
                attempts
            );
            last = Error::ServiceNotFound(signature.to_string());
            continue;
        };
        match service.service(task.clone()).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                elog_warn!(
                    "call: {} via '{}' failed (attempt {}/{}): {}",
                    signature,
                    service.name(),
                    attempt,
                    attempts,
                    e
                );
                last = e;
            }
        }
    }
    Err(Error::ServiceCall(format!(
        "{} failed after {} attempts: {}",
        task.describe(),
        attempts,
        last
    )))
}
