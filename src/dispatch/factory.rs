use super::core::{DispatchEnv, Dispatcher, Strategy};
use crate::core::{Access, DependencyGraph, Exertion, ExertionKind, Flow};
use crate::{elog_debug, Error, Result};

/// Builds dispatchers: sorts the exertion tree and picks a strategy from
/// the exertion's kind, access type and flow.
///
/// | kind  | access | flow     | strategy                 |
/// |-------|--------|----------|--------------------------|
/// | task  | push   |          | direct                   |
/// | task  | pull   |          | queue (single)           |
/// | block | push   |          | sequential               |
/// | block | pull   |          | queue (ordered)          |
/// | job   | push   | seq      | sequential               |
/// | job   | push   | par      | parallel                 |
/// | job   | pull   | seq/par  | queue, ordered when seq  |
pub struct DispatcherFactory;

impl DispatcherFactory {
    /// # Errors
    /// [`Error::Cycle`] or [`Error::DuplicateId`] if the tree cannot be
    /// sorted, and [`Error::QueueUnavailable`] for pull access without a
    /// configured queue.
    pub fn create(mut exertion: Exertion, env: DispatchEnv) -> Result<Dispatcher> {
        exertion.link_parents();
        DependencyGraph::order(&mut exertion)?;
        let strategy = Self::select(&exertion, &env)?;
        elog_debug!("factory: {} -> {}", exertion.describe(), strategy);
        Ok(Dispatcher::new(exertion, strategy, env))
    }

    /// Choose a strategy for an already sorted exertion.
    pub fn select(exertion: &Exertion, env: &DispatchEnv) -> Result<Strategy> {
        let pull = exertion.control.access == Access::Pull;
        if pull && env.queue.is_none() {
            return Err(Error::QueueUnavailable(format!(
                "{} requests pull access but no work queue is configured",
                exertion.describe()
            )));
        }

        let strategy = match (&exertion.kind, pull) {
            (ExertionKind::Task { .. }, false) => Strategy::Direct,
            (ExertionKind::Task { .. }, true) => Strategy::QueueSingle,
            (ExertionKind::Block, false) => Strategy::Sequential,
            (ExertionKind::Block, true) => Strategy::Queue { ordered: true },
            (ExertionKind::Job, false) => match exertion.control.flow {
                Flow::Par => Strategy::Parallel,
                Flow::Seq | Flow::Auto => Strategy::Sequential,
            },
            (ExertionKind::Job, true) => Strategy::Queue {
                ordered: exertion.control.flow != Flow::Par,
            },
        };
        Ok(strategy)
    }
}
