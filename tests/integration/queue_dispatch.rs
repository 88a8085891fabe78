//! Queue-mediated execution with running space workers.

use exert::arith::RESULT_PATH;
use exert::core::{Access, ExecState, Exertion, Flow};
use exert::dispatch::{DispatcherFactory, Strategy};
use exert::space::EnvelopeTemplate;

use super::fixtures::{add, op, QueueHarness};

/// Test: Unordered pull job
/// Given a parallel pull job and three workers
/// When the job is dispatched
/// Then every child is executed remotely and collected back in declared order
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pull_job_collects_remote_results() {
    let h = QueueHarness::new(3);
    let job = Exertion::job("j")
        .with_flow(Flow::Par)
        .with_access(Access::Pull)
        .with_child(add("a").with_input("arg/x", 1).with_input("arg/y", 1))
        .with_child(add("b").with_input("arg/x", 2).with_input("arg/y", 2))
        .with_child(add("c").with_input("arg/x", 3).with_input("arg/y", 3));

    let dispatcher = DispatcherFactory::create(job, h.env.clone()).unwrap();
    assert_eq!(dispatcher.strategy(), Strategy::Queue { ordered: false });
    dispatcher.exec().await;
    let (state, job) = dispatcher.get_result().await;

    assert_eq!(state, ExecState::Done);
    let values: Vec<f64> = job
        .children
        .iter()
        .filter_map(|c| c.context.get_f64(RESULT_PATH))
        .collect();
    assert_eq!(values, vec![2.0, 4.0, 6.0]);
    assert_eq!(h.recorder.call_count(), 3);
    assert!(h.queue.is_empty());
}

/// Test: Ordered pull job with data passing
/// Given a sequential pull job where the second child reads the first's output
/// When the job is dispatched
/// Then the second child is published only after the first is collected
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ordered_pull_job_passes_outputs() {
    let h = QueueHarness::new(2);
    let first = add("first").with_input("arg/x", 5).with_input("arg/y", 5).shared();
    let second = op("second", "multiply")
        .with_binding("arg/a", first.context.id, RESULT_PATH)
        .with_input("arg/b", 3);
    let job = Exertion::job("j")
        .with_flow(Flow::Seq)
        .with_access(Access::Pull)
        .with_child(first)
        .with_child(second);

    let dispatcher = DispatcherFactory::create(job, h.env.clone()).unwrap();
    assert_eq!(dispatcher.strategy(), Strategy::Queue { ordered: true });
    dispatcher.exec().await;
    let (state, job) = dispatcher.get_result().await;

    assert_eq!(state, ExecState::Done);
    assert_eq!(h.recorder.calls(), vec!["first", "second"]);
    assert_eq!(job.children[1].context.get_f64(RESULT_PATH), Some(30.0));
}

/// Test: Poisoning on failure
/// Given an ordered pull job whose first child fails
/// When the job is dispatched
/// Then the remaining children are never executed and are marked poisoned
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_poisons_remaining_children() {
    let h = QueueHarness::new(2);
    let bad = op("bad", "fail");
    let bad_id = bad.id;
    let job = Exertion::job("j")
        .with_flow(Flow::Seq)
        .with_access(Access::Pull)
        .with_child(bad)
        .with_child(add("b").with_input("arg/x", 1))
        .with_child(add("c").with_input("arg/x", 1));
    let job_id = job.id;

    let dispatcher = DispatcherFactory::create(job, h.env.clone()).unwrap();
    dispatcher.exec().await;
    let (state, job) = dispatcher.get_result().await;

    assert_eq!(state, ExecState::Failed);
    assert_eq!(h.recorder.calls(), vec!["bad"]);
    assert_eq!(job.last_exception().and_then(|e| e.origin), Some(bad_id));
    assert_eq!(job.children[0].status, ExecState::Failed);
    assert_eq!(job.children[1].status, ExecState::Poisoned);
    assert_eq!(job.children[2].status, ExecState::Poisoned);

    // Only the poison marker is left behind for the job.
    let leftover = h.queue.count_matching(&EnvelopeTemplate::for_parent(job_id));
    assert_eq!(leftover, 1);
}

/// Test: Composite work in the queue
/// Given a pull job holding a push job
/// When the outer job is dispatched
/// Then a worker dispatches the inner job locally and returns it finished
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_dispatches_nested_job() {
    let h = QueueHarness::new(2);
    let inner = Exertion::job("inner")
        .with_flow(Flow::Seq)
        .with_child(add("x").with_input("arg/a", 1).with_input("arg/b", 2))
        .with_child(add("y").with_input("arg/a", 3).with_input("arg/b", 4));
    let job = Exertion::job("outer")
        .with_flow(Flow::Par)
        .with_access(Access::Pull)
        .with_child(inner)
        .with_child(add("z").with_input("arg/a", 5));

    let dispatcher = DispatcherFactory::create(job, h.env.clone()).unwrap();
    dispatcher.exec().await;
    let (state, job) = dispatcher.get_result().await;

    assert_eq!(state, ExecState::Done);
    let inner = job.find_by_name("inner").unwrap();
    assert_eq!(inner.status, ExecState::Done);
    assert_eq!(
        inner.find_by_name("y").and_then(|y| y.context.get_f64(RESULT_PATH)),
        Some(7.0)
    );
    assert_eq!(h.recorder.call_count(), 3);
}

/// Test: Single pull task
/// Given a task with pull access
/// When it is dispatched on its own
/// Then it makes one round trip through the queue
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_pull_task_round_trip() {
    let h = QueueHarness::new(1);
    let task = op("avg", "average")
        .with_access(Access::Pull)
        .with_input("arg/values", serde_json::json!([2, 4, 9]));

    let dispatcher = DispatcherFactory::create(task, h.env.clone()).unwrap();
    assert_eq!(dispatcher.strategy(), Strategy::QueueSingle);
    dispatcher.exec().await;
    let (state, task) = dispatcher.get_result().await;

    assert_eq!(state, ExecState::Done);
    assert_eq!(task.context.get_f64(RESULT_PATH), Some(5.0));
    assert!(h.queue.write_count() >= 2);
}
