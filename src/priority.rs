//! Priority inheritance (§4.H).
//!
//! A task's *active* priority is the maximum of its base priority and every
//! priority pushed onto its [`crate::task::Task::priority_inheritance_stack`]
//! by a task currently blocked on something it (directly or transitively)
//! owns. Higher numeric value means higher priority, matching the PIQ's
//! "bumping active priorities to the maximum seen".

use std::sync::Arc;

use crate::task::{Membership, Priority, Task};

/// Record that `blocker` is now blocked behind `owner`, bumping `owner`'s
/// (and transitively every task `owner` is itself blocked behind) active
/// priority to at least `blocker`'s.
///
/// Walks the blocking chain starting at `owner`: the chain itself is
/// reconstructed by the caller (a serial or owner lock knows who its
/// current holder is blocked on, if anyone), so this function takes the
/// whole chain as a slice, outermost (the directly-blocked owner) first.
pub fn bump_chain(chain: &[Arc<Task>], priority: Priority) {
    for task in chain {
        task.priority_inheritance_stack.lock().unwrap().push(priority);
        recompute(task);
    }
}

/// Undo a single contribution of `priority` previously pushed by
/// [`bump_chain`] for each task in `chain` (called once the blocking
/// relationship that caused it is resolved, on `onRelease`).
pub fn release_chain(chain: &[Arc<Task>], priority: Priority) {
    for task in chain {
        let mut stack = task.priority_inheritance_stack.lock().unwrap();
        if let Some(pos) = stack.iter().rposition(|&p| p == priority) {
            stack.remove(pos);
        }
        drop(stack);
        recompute(task);
    }
}

fn recompute(task: &Arc<Task>) {
    let top = task
        .priority_inheritance_stack
        .lock()
        .unwrap()
        .iter()
        .copied()
        .max();
    let active = match top {
        Some(p) if p > task.base_priority() => p,
        _ => task.base_priority(),
    };
    task.set_active_priority(active);

    // §4.H: "The cluster's ready queue is notified so that the
    // newly-bumped task's queue position reflects its active priority."
    // A no-op if `task` isn't currently sitting in the ready queue (it
    // may be running or blocked elsewhere).
    if task.membership() == Membership::ReadyQueue {
        if let Some(cluster) = task.cluster() {
            cluster.reposition_ready(task.clone());
        }
    }
}
