//! Test fixtures for integration tests.
//!
//! Provides:
//! - A recording service layered over the arithmetic provider
//! - Locators and provisioners with scripted failures
//! - A queue harness with running space workers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use exert::arith::{Arithmetic, SERVICE_TYPE};
use exert::core::{Deployment, Exertion, ExertionKind, Signature};
use exert::dispatch::DispatchEnv;
use exert::service::{Provisioner, Service, ServiceLocator, ServiceRegistry};
use exert::space::{FixedQueue, MemoryWorkQueue, SpaceWorker};
use exert::{Error, Result};

/// Arithmetic with a call log. Extra selectors:
/// - `fail`: the task ends FAILED
/// - `suspend`: the task ends SUSPENDED
/// - `hold`: waits for [`Recorder::release`], then adds
/// - `panic`: panics
pub struct Recorder {
    name: String,
    calls: Mutex<Vec<String>>,
    gate: Notify,
}

impl Recorder {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: Mutex::new(Vec::new()),
            gate: Notify::new(),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl Service for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, signature: &Signature) -> bool {
        signature.service_type == SERVICE_TYPE
    }

    async fn service(&self, mut task: Exertion) -> Result<Exertion> {
        self.calls.lock().unwrap().push(task.name.clone());
        let selector = task.signature().map(|s| s.selector.clone()).unwrap_or_default();
        match selector.as_str() {
            "fail" => {
                task.fail("recorded failure");
                Ok(task)
            }
            "suspend" => {
                task.suspend();
                Ok(task)
            }
            "panic" => panic!("recorder asked to panic"),
            "hold" => {
                self.gate.notified().await;
                if let ExertionKind::Task { signature } = &mut task.kind {
                    signature.selector = "add".to_string();
                }
                Arithmetic::default().service(task).await
            }
            _ => Arithmetic::default().service(task).await,
        }
    }
}

/// Locator that counts lookups and resolves only after `misses` of them.
pub struct CountingLocator {
    lookups: AtomicUsize,
    misses: usize,
    service: Option<Arc<dyn Service>>,
}

impl CountingLocator {
    /// Never resolves anything.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            lookups: AtomicUsize::new(0),
            misses: usize::MAX,
            service: None,
        })
    }

    pub fn after(misses: usize, service: Arc<dyn Service>) -> Arc<Self> {
        Arc::new(Self {
            lookups: AtomicUsize::new(0),
            misses,
            service: Some(service),
        })
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl ServiceLocator for CountingLocator {
    fn resolve(&self, _signature: &Signature) -> Option<Arc<dyn Service>> {
        let seen = self.lookups.fetch_add(1, Ordering::SeqCst);
        if seen < self.misses {
            return None;
        }
        self.service.clone()
    }
}

/// Deploys an [`Arithmetic`] named after the deployment, failing the
/// first `failures` attempts.
pub struct Deployer {
    attempts: AtomicUsize,
    failures: usize,
}

impl Deployer {
    pub fn failing_first(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicUsize::new(0),
            failures,
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provisioner for Deployer {
    async fn provision(&self, deployment: &Deployment) -> Result<Arc<dyn Service>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(Error::ServiceCall(format!("no capacity for {}", deployment)));
        }
        Ok(Arc::new(Arithmetic::new(&deployment.name)))
    }
}

/// Registry plus environment with `recorder` as the only service.
pub fn local_env(recorder: &Arc<Recorder>) -> (ServiceRegistry, DispatchEnv) {
    let registry = ServiceRegistry::new();
    registry.register(recorder.clone());
    let env = DispatchEnv::new(Arc::new(registry.clone()));
    (registry, env)
}

/// A queue served by running space workers.
pub struct QueueHarness {
    pub env: DispatchEnv,
    pub queue: Arc<MemoryWorkQueue>,
    pub recorder: Arc<Recorder>,
    stop: CancellationToken,
}

impl QueueHarness {
    pub fn new(workers: usize) -> Self {
        let recorder = Recorder::new("remote");
        let registry = ServiceRegistry::new();
        registry.register(recorder.clone());
        let locator = Arc::new(registry);
        let queue = Arc::new(MemoryWorkQueue::new());

        let mut env = DispatchEnv::new(locator.clone())
            .with_queue(Arc::new(FixedQueue::new(queue.clone())));
        env.config.poll_timeout_ms = 100;
        env.config.drain_timeout_ms = 20;

        let stop = CancellationToken::new();
        for i in 0..workers {
            SpaceWorker::new(&format!("worker-{}", i), queue.clone(), locator.clone())
                .with_poll(Duration::from_millis(20))
                .with_env(env.clone())
                .spawn(stop.clone());
        }

        Self {
            env,
            queue,
            recorder,
            stop,
        }
    }
}

impl Drop for QueueHarness {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

pub fn add(name: &str) -> Exertion {
    Exertion::task(name, Signature::new(SERVICE_TYPE, "add"))
}

pub fn op(name: &str, selector: &str) -> Exertion {
    Exertion::task(name, Signature::new(SERVICE_TYPE, selector))
}
