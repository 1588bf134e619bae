//! Counting semaphore (§4.F).

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::processor;
use crate::spin::SpinLock;
use crate::task::{Task, ThreadState};
use crate::timer::EventId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Acquired,
    TimedOut,
}

struct Waiter {
    task: Arc<Task>,
    timed_out: Arc<AtomicBool>,
    timeout_event: Option<EventId>,
    woken: Arc<AtomicBool>,
}

struct SemState {
    count: i64,
    waiters: VecDeque<Waiter>,
}

/// Count-plus-queue semaphore (§4.F). `P` (here, [`Semaphore::wait`])
/// decrements and enqueues on going negative; `V` ([`Semaphore::signal`])
/// increments and wakes a waiter if any are queued.
pub struct Semaphore {
    spin: SpinLock,
    state: UnsafeCell<SemState>,
}

unsafe impl Sync for Semaphore {}
unsafe impl Send for Semaphore {}

impl Semaphore {
    pub fn new(initial: i64) -> Self {
        Self {
            spin: SpinLock::new(),
            state: UnsafeCell::new(SemState { count: initial, waiters: VecDeque::new() }),
        }
    }

    pub fn count(&self) -> i64 {
        let _guard = self.spin.acquire();
        unsafe { &*self.state.get() }.count
    }

    /// `P`: decrement, blocking if the count goes negative.
    pub fn wait(self: &Arc<Self>) {
        match self.wait_timeout_impl(None, None) {
            WaitResult::Acquired => {}
            WaitResult::TimedOut => unreachable!("no timeout was set"),
        }
    }

    /// `P` with a timeout; the count is decremented consistently either
    /// way (§4.F "Timeouts cancel the wait and decrement count
    /// consistently" — meaning a timed-out waiter is removed from the
    /// queue and its earlier decrement undone).
    pub fn wait_timeout(self: &Arc<Self>, timeout: Duration) -> WaitResult {
        self.wait_timeout_impl(Some(timeout), None)
    }

    /// `V(other)` then `P(self)`, used to implement signal-block (§4.F:
    /// "release-other-semaphore-then-wait").
    pub fn signal_then_wait(self: &Arc<Self>, other: &Semaphore) {
        self.wait_timeout_impl(None, Some(other));
    }

    fn wait_timeout_impl(self: &Arc<Self>, timeout: Option<Duration>, release_first: Option<&Semaphore>) -> WaitResult {
        let task = processor::current_task().expect("Semaphore::wait called off a processor");
        let guard = self.spin.acquire();
        let state = unsafe { &mut *self.state.get() };
        state.count -= 1;
        if state.count >= 0 {
            drop(guard);
            if let Some(other) = release_first {
                other.signal();
            }
            return WaitResult::Acquired;
        }

        let timed_out = Arc::new(AtomicBool::new(false));
        let woken = Arc::new(AtomicBool::new(false));
        let timeout_event = timeout.map(|duration| {
            let this = self.clone();
            let flag = timed_out.clone();
            let woken_flag = woken.clone();
            let task_for_timeout = task.clone();
            crate::runtime::Runtime::global()
                .events
                .insert_at(std::time::Instant::now() + duration, move || {
                    this.fire_timeout(task_for_timeout, flag, woken_flag)
                })
        });

        task.set_state(ThreadState::Blocked);
        state.waiters.push_back(Waiter { task, timed_out: timed_out.clone(), timeout_event, woken: woken.clone() });

        if let Some(other) = release_first {
            other.signal();
        }

        // Deferred: the spin guard must outlive our own context switch
        // (§4.I `schedule()`), not be dropped ahead of it.
        let this = self.clone();
        let guard = unsafe { guard.into_static() };
        processor::schedule(vec![Box::new(move || {
            drop(guard);
            drop(this);
        })]);

        if timed_out.load(Ordering::Acquire) {
            WaitResult::TimedOut
        } else {
            WaitResult::Acquired
        }
    }

    /// `V`: increment, waking the longest-waiting task if the queue is
    /// non-empty.
    pub fn signal(&self) {
        let guard = self.spin.acquire();
        let state = unsafe { &mut *self.state.get() };
        state.count += 1;
        let next = state.waiters.pop_front();
        drop(guard);
        if let Some(waiter) = next {
            if waiter.woken.swap(true, Ordering::AcqRel) {
                // Lost the race to the timeout handler; it already
                // accounted for this waiter's decrement, so undo our
                // increment-for-nobody by re-signaling ourselves.
                self.signal();
                return;
            }
            if let Some(event) = waiter.timeout_event {
                crate::runtime::Runtime::global().events.cancel(event);
            }
            waiter.task.wake();
        }
    }

    fn fire_timeout(&self, task: Arc<Task>, timed_out: Arc<AtomicBool>, woken: Arc<AtomicBool>) {
        if woken.swap(true, Ordering::AcqRel) {
            return; // `signal()` already claimed this waiter
        }
        let guard = self.spin.acquire();
        let state = unsafe { &mut *self.state.get() };
        let before = state.waiters.len();
        state.waiters.retain(|w| !Arc::ptr_eq(&w.task, &task));
        let removed = state.waiters.len() != before;
        if removed {
            // This waiter never got counted as acquired; undo its `P`.
            state.count += 1;
        }
        drop(guard);
        timed_out.store(true, Ordering::Release);
        task.wake();
    }

    pub fn has_waiters(&self) -> bool {
        let _guard = self.spin.acquire();
        !unsafe { &*self.state.get() }.waiters.is_empty()
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // §4.F: "A semaphore destructor with waiters present is a fatal
        // error."
        if self.has_waiters() {
            panic!("KernelFailure: Semaphore dropped with waiters still queued");
        }
    }
}
