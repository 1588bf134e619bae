//! Condition variable layered on an owner lock (§4.E).
//!
//! A waiter is never woken directly: `signal`/`broadcast` hand it straight
//! to its remembered [`OwnerLock`]'s waiter queue (or grant it ownership
//! outright if that lock is free), so by the time a woken task resumes it
//! already holds the lock — a spurious wake-up can never skip
//! re-acquiring it (§4.E).

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Fault;
use crate::lock::OwnerLock;
use crate::processor;
use crate::spin::SpinLock;
use crate::task::{Task, ThreadState};
use crate::timer::EventId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Signaled,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct WaiterId(u64);

static NEXT_WAITER_ID: AtomicU64 = AtomicU64::new(1);

struct Entry {
    id: WaiterId,
    task: Arc<Task>,
    owner: Arc<OwnerLock>,
    timed_out: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    timeout_event: Option<EventId>,
}

struct ConditionState {
    waiters: VecDeque<Entry>,
    /// Set by `Condition`'s destructor path; subsequent `wait` calls fail
    /// with `WaitingFailure` immediately instead of queuing (§7).
    destroyed: bool,
}

/// A FIFO queue of tasks blocked on a predicate, parameterized by whichever
/// [`OwnerLock`] each waiter happened to be holding (§4.E: "different
/// waiters may be associated with different owner locks").
pub struct Condition {
    spin: SpinLock,
    state: UnsafeCell<ConditionState>,
}

unsafe impl Sync for Condition {}
unsafe impl Send for Condition {}

impl Condition {
    pub fn new() -> Self {
        Self {
            spin: SpinLock::new(),
            state: UnsafeCell::new(ConditionState { waiters: VecDeque::new(), destroyed: false }),
        }
    }

    /// Release `owner`, block until signaled, then re-acquire `owner`
    /// before returning.
    pub fn wait(self: &Arc<Self>, owner: &Arc<OwnerLock>) -> Result<(), Fault> {
        match self.wait_timeout(owner, None)? {
            WaitResult::Signaled => Ok(()),
            WaitResult::TimedOut => unreachable!("no timeout was set"),
        }
    }

    /// As `wait`, but gives up and returns `TimedOut` (after re-acquiring
    /// `owner`) if `timeout` elapses first (§4.E `wait(owner_lock,
    /// timeout)`).
    pub fn wait_timeout(
        self: &Arc<Self>,
        owner: &Arc<OwnerLock>,
        timeout: Option<Duration>,
    ) -> Result<WaitResult, Fault> {
        let task = processor::current_task().expect("Condition::wait called off a processor");
        let timed_out = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));
        let id = WaiterId(NEXT_WAITER_ID.fetch_add(1, Ordering::Relaxed));

        let guard = self.spin.acquire();
        let state = unsafe { &mut *self.state.get() };
        if state.destroyed {
            drop(guard);
            return Err(Fault::WaitingFailure);
        }

        let timeout_event = timeout.map(|duration| {
            let this = self.clone();
            let flag = timed_out.clone();
            crate::runtime::Runtime::global()
                .events
                .insert_at(std::time::Instant::now() + duration, move || {
                    this.fire_timeout(id, flag)
                })
        });

        task.set_state(ThreadState::Blocked);
        state.waiters.push_back(Entry {
            id,
            task: task.clone(),
            owner: owner.clone(),
            timed_out: timed_out.clone(),
            failed: failed.clone(),
            timeout_event,
        });
        drop(guard);

        // `owner` is released as a deferred action so the switch away from
        // this task's stack (§4.I `schedule()`) completes before anything
        // else can see it free and wake us.
        let owner_to_release = owner.clone();
        processor::schedule(vec![Box::new(move || owner_to_release.release())]);
        // `requeue_waiter` (called by `signal`/`broadcast`/the timeout
        // handler below) already re-granted `owner` to us before waking.

        if failed.load(Ordering::Acquire) {
            Err(Fault::WaitingFailure)
        } else if timed_out.load(Ordering::Acquire) {
            Ok(WaitResult::TimedOut)
        } else {
            Ok(WaitResult::Signaled)
        }
    }

    fn fire_timeout(self: &Arc<Self>, id: WaiterId, flag: Arc<AtomicBool>) {
        let guard = self.spin.acquire();
        let state = unsafe { &mut *self.state.get() };
        let pos = state.waiters.iter().position(|e| e.id == id);
        let entry = match pos {
            Some(i) => state.waiters.remove(i).unwrap(),
            None => return, // already signaled; race lost, nothing to do
        };
        drop(guard);
        flag.store(true, Ordering::Release);
        entry.owner.requeue_waiter(entry.task);
    }

    /// Wake the longest-waiting task (§5 "Ordering guarantees": "Condition
    /// `signal` wakes the longest-waiting task"). No-op on an empty queue.
    pub fn signal(&self) {
        let guard = self.spin.acquire();
        let state = unsafe { &mut *self.state.get() };
        let entry = state.waiters.pop_front();
        drop(guard);
        if let Some(entry) = entry {
            self.cancel_timeout(&entry);
            entry.owner.requeue_waiter(entry.task);
        }
    }

    /// Wake every waiter, each re-granted its own remembered owner lock.
    pub fn broadcast(&self) {
        let guard = self.spin.acquire();
        let state = unsafe { &mut *self.state.get() };
        let all: Vec<Entry> = state.waiters.drain(..).collect();
        drop(guard);
        for entry in all {
            self.cancel_timeout(&entry);
            entry.owner.requeue_waiter(entry.task);
        }
    }

    fn cancel_timeout(&self, entry: &Entry) {
        if let Some(event) = entry.timeout_event {
            crate::runtime::Runtime::global().events.cancel(event);
        }
    }

    pub fn is_empty(&self) -> bool {
        let _guard = self.spin.acquire();
        unsafe { &*self.state.get() }.waiters.is_empty()
    }

    /// Marks the condition unusable; any task still queued is woken with
    /// `WaitingFailure` delivered through its next `wait_timeout` return
    /// (§7 "WaitingFailure", §3 "a condition is destroyed while tasks are
    /// still on its queue").
    pub fn destroy(&self) {
        let guard = self.spin.acquire();
        let state = unsafe { &mut *self.state.get() };
        state.destroyed = true;
        let all: Vec<Entry> = state.waiters.drain(..).collect();
        drop(guard);
        for entry in all {
            self.cancel_timeout(&entry);
            entry.failed.store(true, Ordering::Release);
            entry.owner.requeue_waiter(entry.task);
        }
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}
