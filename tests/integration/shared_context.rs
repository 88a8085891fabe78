//! Shared-context propagation and re-dispatch of partly finished trees.

use exert::arith::RESULT_PATH;
use exert::core::{ExecState, Exertion, Flow};
use exert::dispatch::DispatcherFactory;

use super::fixtures::{add, local_env, op, Recorder};

/// Test: Propagation across dispatchers
/// Given two jobs dispatched one after the other on the same pool
/// When the second job binds to a shared context of the first
/// Then it reads the first job's output
#[tokio::test]
async fn test_shared_output_flows_to_later_dispatch() {
    let recorder = Recorder::new("calc");
    let (_, env) = local_env(&recorder);

    let producer = add("producer").with_input("arg/a", 4).with_input("arg/b", 5).shared();
    let source = producer.context.id;
    let first = Exertion::job("first").with_child(producer);

    let dispatcher = DispatcherFactory::create(first, env.clone()).unwrap();
    dispatcher.exec().await;
    assert_eq!(dispatcher.get_result().await.0, ExecState::Done);
    assert!(env.pool.contains(&source));

    let consumer = add("consumer")
        .with_binding("arg/a", source, RESULT_PATH)
        .with_input("arg/b", 1);
    let second = Exertion::job("second").with_child(consumer);

    let dispatcher = DispatcherFactory::create(second, env).unwrap();
    dispatcher.exec().await;
    let (state, second) = dispatcher.get_result().await;

    assert_eq!(state, ExecState::Done);
    assert_eq!(second.children[0].context.get_f64(RESULT_PATH), Some(10.0));
}

/// Test: Private contexts stay private
/// Given a finished task whose context is not shared
/// When the job completes
/// Then its context is not published to the pool
#[tokio::test]
async fn test_unshared_context_is_not_harvested() {
    let recorder = Recorder::new("calc");
    let (_, env) = local_env(&recorder);

    let private = add("private").with_input("arg/a", 1);
    let id = private.context.id;
    let dispatcher = DispatcherFactory::create(Exertion::job("j").with_child(private), env.clone())
        .unwrap();
    dispatcher.exec().await;

    assert_eq!(dispatcher.get_result().await.0, ExecState::Done);
    assert!(!env.pool.contains(&id));
}

/// Test: Reconciliation of finished children
/// Given a job whose first child is already DONE from an earlier run
/// When the job is dispatched
/// Then the finished child is not run again but its output still reaches its dependent
#[tokio::test]
async fn test_done_children_are_reconciled_not_rerun() {
    let recorder = Recorder::new("calc");
    let (_, env) = local_env(&recorder);

    let mut done = add("done").shared();
    done.status = ExecState::Done;
    done.context.put(RESULT_PATH, 7.0);
    let dependent = add("dependent")
        .with_binding("arg/a", done.context.id, RESULT_PATH)
        .with_input("arg/b", 1);
    let job = Exertion::job("j")
        .with_flow(Flow::Seq)
        .with_child(done)
        .with_child(dependent);

    let dispatcher = DispatcherFactory::create(job, env.clone()).unwrap();
    dispatcher.exec().await;
    let (state, job) = dispatcher.get_result().await;

    assert_eq!(state, ExecState::Done);
    assert_eq!(recorder.calls(), vec!["dependent"]);
    assert_eq!(job.children[1].context.get_f64(RESULT_PATH), Some(8.0));

    // A second dispatch of the finished tree runs nothing.
    let dispatcher = DispatcherFactory::create(job, env).unwrap();
    dispatcher.exec().await;
    let (state, job) = dispatcher.get_result().await;

    assert_eq!(state, ExecState::Done);
    assert_eq!(recorder.call_count(), 1);
    assert_eq!(job.children[1].context.get_f64(RESULT_PATH), Some(8.0));
}

/// Test: Re-dispatch after failure
/// Given a job that failed part way
/// When the same tree is dispatched again with the failing step fixed
/// Then only the unfinished children run
#[tokio::test]
async fn test_failed_job_resumes_from_unfinished_children() {
    let recorder = Recorder::new("calc");
    let (_, env) = local_env(&recorder);

    let job = Exertion::job("j")
        .with_flow(Flow::Seq)
        .with_child(add("first").with_input("arg/a", 1).shared())
        .with_child(op("second", "fail").with_input("arg/a", 2));

    let dispatcher = DispatcherFactory::create(job, env.clone()).unwrap();
    dispatcher.exec().await;
    let (state, mut job) = dispatcher.get_result().await;
    assert_eq!(state, ExecState::Failed);

    if let exert::core::ExertionKind::Task { signature } = &mut job.children[1].kind {
        signature.selector = "add".to_string();
    }
    job.status = ExecState::Initial;

    let dispatcher = DispatcherFactory::create(job, env).unwrap();
    dispatcher.exec().await;
    let (state, job) = dispatcher.get_result().await;

    assert_eq!(state, ExecState::Done);
    assert_eq!(recorder.calls(), vec!["first", "second", "second"]);
    assert_eq!(job.children[1].context.get_f64(RESULT_PATH), Some(2.0));
}
