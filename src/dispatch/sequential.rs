use super::core::{apply_outcome, exec_child, DispatchEnv};
use crate::core::{DataContext, ExecState, Exertion};
use crate::{elog_debug, elog_warn, Result};

/// Run the children of `parent` one at a time in their sorted order.
///
/// The first child that fails or suspends stops the run and decides the
/// parent's status; the rest are left untouched. The master child runs
/// last and only when every regular child is DONE. Blocks expose their
/// context to each child as its scope and collect each child's outputs.
pub(crate) async fn run(env: &DispatchEnv, parent: &mut Exertion) -> Result<()> {
    let children = std::mem::take(&mut parent.children);
    let master_id = parent.control.master;

    let mut finished = Vec::with_capacity(children.len());
    let mut master = None;
    let mut previous: Option<DataContext> = None;
    let mut halted = false;

    let mut pending = children.into_iter();
    while let Some(mut child) = pending.next() {
        if Some(child.id) == master_id {
            master = Some(child);
            continue;
        }
        if child.status == ExecState::Done {
            elog_debug!("seq: skipping finished {}", child.describe());
            previous = Some(child.context.clone());
            finished.push(child);
            continue;
        }
        if env.stop.is_cancelled() {
            elog_warn!("seq: {} stopped before {}", parent.describe(), child.describe());
            parent.fail("dispatch stopped");
            finished.push(child);
            halted = true;
            break;
        }

        prepare(env, parent, &mut child, previous.as_ref());
        let child = exec_child(env.clone(), child).await;
        if parent.is_block() && child.status == ExecState::Done {
            parent.context.merge_outputs(&child.context);
        }
        previous = Some(child.context.clone());

        let proceed = apply_outcome(parent, &child);
        finished.push(child);
        if !proceed {
            halted = true;
            break;
        }
    }
    finished.extend(pending);

    if let Some(mut master) = master {
        if !halted {
            prepare(env, parent, &mut master, None);
            master = exec_child(env.clone(), master).await;
            if parent.is_block() && master.status == ExecState::Done {
                parent.context.merge_outputs(&master.context);
            }
            apply_outcome(parent, &master);
        }
        finished.push(master);
    }

    parent.children = finished;
    Ok(())
}

fn prepare(
    env: &DispatchEnv,
    parent: &Exertion,
    child: &mut Exertion,
    previous: Option<&DataContext>,
) {
    if parent.is_block() {
        child.context.scope = Some(parent.context.id);
        env.pool.put_scope(&parent.context);
    }
    if child.is_task() && child.control.continuous {
        if let Some(previous) = previous {
            child.context.adopt_entries(previous);
        }
    }
}
