use futures::future::join_all;

use super::core::{apply_outcome, exec_child, DispatchEnv};
use crate::core::{ExecState, Exertion};
use crate::{elog_debug, elog_error, Error, Result};

/// Run every pending child of `parent` concurrently and wait for all.
///
/// Any failed child fails the parent (each one is recorded as a cause);
/// otherwise any suspended child suspends it. A child that panics or
/// whose task is cancelled counts as failed. The master child runs after
/// the barrier, and only if the parent is still running.
pub(crate) async fn run(env: &DispatchEnv, parent: &mut Exertion) -> Result<()> {
    let children = std::mem::take(&mut parent.children);
    let master_id = parent.control.master;

    let mut settled: Vec<Option<Exertion>> = vec![None; children.len()];
    let mut master = None;
    let mut running = Vec::new();

    for (i, child) in children.into_iter().enumerate() {
        if Some(child.id) == master_id {
            master = Some((i, child));
        } else if child.status == ExecState::Done {
            settled[i] = Some(child);
        } else {
            let backup = child.clone();
            let handle = tokio::spawn(exec_child(env.clone(), child));
            running.push((i, backup, handle));
        }
    }
    elog_debug!("par: {} waiting on {} children", parent.describe(), running.len());

    let joined = join_all(
        running
            .into_iter()
            .map(|(i, backup, handle)| async move { (i, backup, handle.await) }),
    )
    .await;

    for (i, backup, outcome) in joined {
        let child = match outcome {
            Ok(child) => child,
            Err(e) => {
                elog_error!("par: worker for {} died: {}", backup.describe(), e);
                let mut child = backup;
                child.fail(&Error::TaskJoin(e.to_string()).to_string());
                child
            }
        };
        settled[i] = Some(child);
    }

    let mut suspended = None;
    for child in settled.iter().flatten() {
        match child.status {
            ExecState::Done => {}
            ExecState::Suspended => {
                suspended.get_or_insert(child);
            }
            _ => {
                apply_outcome(parent, child);
            }
        }
    }
    if parent.status != ExecState::Failed {
        if let Some(child) = suspended {
            apply_outcome(parent, child);
        }
    }

    if let Some((i, mut child)) = master {
        if parent.status == ExecState::Running {
            child = exec_child(env.clone(), child).await;
            apply_outcome(parent, &child);
        }
        settled[i] = Some(child);
    }

    parent.children = settled.into_iter().flatten().collect();
    Ok(())
}
