//! Service lookup retries, provisioning, the dispatcher registry and
//! session monitoring.

use std::sync::Arc;
use std::time::Duration;

use exert::arith::{Arithmetic, RESULT_PATH, SERVICE_TYPE};
use exert::core::{Deployment, ExecState, Exertion, Flow, Signature};
use exert::dispatch::{DispatchEnv, DispatcherFactory, ProvisionCoordinator};
use exert::service::{ChannelSessionTracker, ServiceRegistry, SessionEvent};

use super::fixtures::{add, local_env, op, CountingLocator, Deployer, Recorder};

/// Test: Call retry bound
/// Given a locator that never finds a service
/// When a task is dispatched with the default configuration
/// Then the lookup is attempted exactly six times before the task fails
#[tokio::test]
async fn test_missing_service_is_retried_six_times() {
    let locator = CountingLocator::empty();
    let env = DispatchEnv::new(locator.clone());

    let dispatcher =
        DispatcherFactory::create(add("a").with_input("arg/x", 1), env).unwrap();
    dispatcher.exec().await;
    let (state, task) = dispatcher.get_result().await;

    assert_eq!(state, ExecState::Failed);
    assert_eq!(locator.lookups(), 6);
    let message = &task.last_exception().unwrap().message;
    assert!(message.contains("6 attempts"), "unexpected message: {}", message);
}

/// Test: Call retry recovery
/// Given a locator that finds the service on the third lookup
/// When a task is dispatched
/// Then it completes after three lookups
#[tokio::test]
async fn test_lookup_recovers_within_bound() {
    let locator = CountingLocator::after(2, Arc::new(Arithmetic::default()));
    let env = DispatchEnv::new(locator.clone());

    let task = add("a").with_input("arg/x", 1).with_input("arg/y", 2);
    let dispatcher = DispatcherFactory::create(task, env).unwrap();
    dispatcher.exec().await;
    let (state, task) = dispatcher.get_result().await;

    assert_eq!(state, ExecState::Done);
    assert_eq!(locator.lookups(), 3);
    assert_eq!(task.context.get_f64(RESULT_PATH), Some(3.0));
}

/// Test: In-process provider
/// Given an environment with an in-process provider that accepts the task
/// When the task is dispatched
/// Then the locator is never consulted
#[tokio::test]
async fn test_provider_short_circuits_lookup() {
    let locator = CountingLocator::empty();
    let env = DispatchEnv::new(locator.clone()).with_provider(Arc::new(Arithmetic::default()));

    let dispatcher =
        DispatcherFactory::create(add("a").with_input("arg/x", 4), env).unwrap();
    dispatcher.exec().await;

    assert_eq!(dispatcher.get_result().await.0, ExecState::Done);
    assert_eq!(locator.lookups(), 0);
}

fn provisioned_task(name: &str, provider: &str) -> Exertion {
    Exertion::task(name, Signature::new(SERVICE_TYPE, "add").with_provider(provider))
        .with_input("arg/x", 2)
        .with_input("arg/y", 3)
        .provisionable(Deployment::new(SERVICE_TYPE, provider, "1.0"))
}

/// Test: On-demand provisioning
/// Given a provisionable task whose provider is not deployed and a provisioner that fails twice
/// When the job is dispatched
/// Then the provider is deployed on the third attempt and the task runs against it
#[tokio::test]
async fn test_provisioning_deploys_missing_provider() {
    let registry = ServiceRegistry::new();
    let deployer = Deployer::failing_first(2);
    let coordinator = ProvisionCoordinator::new(deployer.clone())
        .with_registry(registry.clone())
        .with_attempts(3);
    let env = DispatchEnv::new(Arc::new(registry.clone())).with_provisioner(coordinator);

    let job = Exertion::job("j").with_child(provisioned_task("a", "calc-1"));
    let dispatcher = DispatcherFactory::create(job, env).unwrap();
    dispatcher.exec().await;
    let (state, job) = dispatcher.get_result().await;

    assert_eq!(state, ExecState::Done);
    assert_eq!(deployer.attempts(), 3);
    assert_eq!(registry.len(), 1);
    assert_eq!(job.children[0].context.get_f64(RESULT_PATH), Some(5.0));
}

/// Test: Provisioning failure
/// Given a provisioner that never succeeds
/// When the job is dispatched
/// Then the task fails without a service call and the job fails with it
#[tokio::test]
async fn test_provisioning_failure_fails_task() {
    let registry = ServiceRegistry::new();
    let deployer = Deployer::failing_first(usize::MAX);
    let coordinator = ProvisionCoordinator::new(deployer.clone())
        .with_registry(registry.clone())
        .with_attempts(3);
    let locator = CountingLocator::empty();
    let env = DispatchEnv::new(locator.clone()).with_provisioner(coordinator);

    let task = provisioned_task("a", "calc-2");
    let task_id = task.id;
    let job = Exertion::job("j").with_flow(Flow::Seq).with_child(task);
    let dispatcher = DispatcherFactory::create(job, env).unwrap();
    dispatcher.exec().await;
    let (state, job) = dispatcher.get_result().await;

    assert_eq!(state, ExecState::Failed);
    assert_eq!(deployer.attempts(), 3);
    assert_eq!(locator.lookups(), 0);
    assert_eq!(job.children[0].status, ExecState::Failed);
    assert_eq!(job.last_exception().and_then(|e| e.origin), Some(task_id));
    assert!(registry.is_empty());
}

/// Test: Provisioning retries are bounded across nesting
/// Given a provisionable task two jobs deep and a provisioner that never succeeds
/// When the outer job is dispatched
/// Then the provisioner is tried exactly the configured number of times
#[tokio::test]
async fn test_nested_provisioning_failure_is_not_retried() {
    let registry = ServiceRegistry::new();
    let deployer = Deployer::failing_first(usize::MAX);
    let coordinator = ProvisionCoordinator::new(deployer.clone())
        .with_registry(registry.clone())
        .with_attempts(3);
    let env = DispatchEnv::new(Arc::new(registry.clone())).with_provisioner(coordinator);

    let middle = Exertion::job("middle")
        .with_flow(Flow::Seq)
        .with_child(Exertion::job("inner").with_child(provisioned_task("a", "calc-3")));
    let outer = Exertion::job("outer").with_flow(Flow::Seq).with_child(middle);
    let dispatcher = DispatcherFactory::create(outer, env).unwrap();
    dispatcher.exec().await;
    let (state, outer) = dispatcher.get_result().await;

    assert_eq!(state, ExecState::Failed);
    assert_eq!(deployer.attempts(), 3);
    assert_eq!(
        outer.find_by_name("a").map(|a| a.status),
        Some(ExecState::Failed)
    );
}

/// Test: Duplicate dispatch guard
/// Given an exertion already being dispatched
/// When a second dispatcher for the same exertion runs in the same registry
/// Then the second one fails at once and the first completes normally
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_dispatch_of_same_exertion_is_rejected() {
    let recorder = Recorder::new("calc");
    let (_, env) = local_env(&recorder);
    let task = op("slow", "hold").with_input("arg/x", 1);
    let id = task.id;

    let first = DispatcherFactory::create(task.clone(), env.clone()).unwrap();
    let handle = first.start();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !env.registry.contains(&id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first dispatch never registered");

    let second = DispatcherFactory::create(task, env.clone()).unwrap();
    second.exec().await;
    let (state, rejected) = second.get_result().await;
    assert_eq!(state, ExecState::Failed);
    assert!(rejected.last_exception().is_some());

    recorder.release();
    handle.await.unwrap();
    let (state, task) = first.get_result().await;
    assert_eq!(state, ExecState::Done);
    assert_eq!(task.context.get_f64(RESULT_PATH), Some(1.0));
    assert!(env.registry.is_empty());
}

/// Test: Session monitoring
/// Given a monitorable job and a channel tracker
/// When the job is dispatched
/// Then the tracker sees init, the running state, the release and the final state
#[tokio::test]
async fn test_monitorable_job_reports_session_events() {
    let recorder = Recorder::new("calc");
    let (_, env) = local_env(&recorder);
    let (tx, rx) = crossbeam_channel::bounded(64);
    let env = env.with_tracker(Arc::new(ChannelSessionTracker::new(tx)));
    let lease = env.config.lease_period();

    let job = Exertion::job("j")
        .monitorable()
        .with_child(add("a").with_input("arg/x", 1));
    let id = job.id;
    let dispatcher = DispatcherFactory::create(job, env).unwrap();
    dispatcher.exec().await;
    assert_eq!(dispatcher.get_result().await.0, ExecState::Done);

    let events: Vec<SessionEvent> = rx.try_iter().collect();
    assert_eq!(
        events.first(),
        Some(&SessionEvent::Init {
            exertion: id,
            lease_period: lease,
        })
    );
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Changed { state: ExecState::Running, .. }
    )));
    assert!(events.contains(&SessionEvent::Released { exertion: id }));
    assert!(matches!(
        events.last(),
        Some(SessionEvent::Changed { state: ExecState::Done, .. })
    ));
}

/// Test: Unmonitored jobs stay silent
/// Given a job that is not monitorable
/// When it is dispatched with a tracker configured
/// Then no session events are sent
#[tokio::test]
async fn test_unmonitored_job_sends_no_events() {
    let recorder = Recorder::new("calc");
    let (_, env) = local_env(&recorder);
    let (tx, rx) = crossbeam_channel::bounded(64);
    let env = env.with_tracker(Arc::new(ChannelSessionTracker::new(tx)));

    let job = Exertion::job("j").with_child(add("a").with_input("arg/x", 1));
    let dispatcher = DispatcherFactory::create(job, env).unwrap();
    dispatcher.exec().await;

    assert_eq!(dispatcher.get_result().await.0, ExecState::Done);
    assert!(rx.try_iter().next().is_none());
}

/// Test: A full monitor channel does not affect the outcome
/// Given a tracker whose channel has no room
/// When a monitorable job is dispatched
/// Then the job still completes
#[tokio::test]
async fn test_monitor_errors_are_ignored() {
    let recorder = Recorder::new("calc");
    let (_, env) = local_env(&recorder);
    let (tx, _rx) = crossbeam_channel::bounded(0);
    let env = env.with_tracker(Arc::new(ChannelSessionTracker::new(tx)));

    let job = Exertion::job("j")
        .monitorable()
        .with_child(add("a").with_input("arg/x", 1));
    let dispatcher = DispatcherFactory::create(job, env).unwrap();
    dispatcher.exec().await;

    assert_eq!(dispatcher.get_result().await.0, ExecState::Done);
}
