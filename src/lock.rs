//! Yielding lock and owner (recursive) lock (§4.C, §4.D).
//!
//! Both are spin-lock-protected state machines: the spin lock only ever
//! guards the tiny `locked`/`owner`/`waiters` record, never anything a task
//! runs while holding it. On the contended path its release is packaged as
//! a deferred action passed to [`processor::schedule`], so it only runs
//! once the blocked task's own context switch has safely completed (§4.I).

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::processor;
use crate::spin::SpinLock;
use crate::task::{Task, ThreadState};

struct LockState {
    locked: bool,
    waiters: VecDeque<Arc<Task>>,
}

/// Binary semaphore built on the spin lock (§4.C): on contention the
/// caller yields (reschedules to `Ready`) rather than busy-waiting.
pub struct Lock {
    spin: SpinLock,
    state: UnsafeCell<LockState>,
}

// Safety: `state` is only ever accessed while `spin` is held.
unsafe impl Sync for Lock {}
unsafe impl Send for Lock {}

impl Lock {
    pub fn new() -> Self {
        Self {
            spin: SpinLock::new(),
            state: UnsafeCell::new(LockState { locked: false, waiters: VecDeque::new() }),
        }
    }

    pub fn acquire(self: &Arc<Self>) {
        let guard = self.spin.acquire();
        let state = unsafe { &mut *self.state.get() };
        if !state.locked {
            state.locked = true;
            return;
        }
        let task = processor::current_task().expect("Lock::acquire called off a processor");
        task.set_state(ThreadState::Blocked);
        state.waiters.push_back(task);

        // The spin guard is released as a deferred action so it outlives
        // this task's own context switch (§4.I `schedule()`); releasing it
        // any earlier would let another processor observe and resume us
        // while we're still mid-switch.
        let this = self.clone();
        let guard = unsafe { guard.into_static() };
        processor::schedule(vec![Box::new(move || {
            drop(guard);
            drop(this);
        })]);
    }

    /// Never blocks (§4.C / §4.F "Tryacquire never spins").
    pub fn try_acquire(&self) -> bool {
        let guard = match self.spin.try_acquire() {
            Some(g) => g,
            None => return false,
        };
        let state = unsafe { &mut *self.state.get() };
        if state.locked {
            false
        } else {
            state.locked = true;
            true
        }
    }

    /// Release, handing off directly to the head of the waiter queue if
    /// one exists (the lock stays logically held; ownership just moves).
    pub fn release(&self) {
        let guard = self.spin.acquire();
        let state = unsafe { &mut *self.state.get() };
        match state.waiters.pop_front() {
            Some(next) => {
                drop(guard);
                next.wake();
            }
            None => state.locked = false,
        }
    }

    pub fn guard(self: &Arc<Self>) -> LockGuard<'_> {
        self.acquire();
        LockGuard { lock: self }
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LockGuard<'a> {
    lock: &'a Lock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

struct OwnerState {
    owner: Option<Arc<Task>>,
    count: u32,
    waiters: VecDeque<Arc<Task>>,
}

/// Recursive mutual-exclusion lock (§4.D). `count > 0 iff owner != nil`.
pub struct OwnerLock {
    spin: SpinLock,
    state: UnsafeCell<OwnerState>,
}

unsafe impl Sync for OwnerLock {}
unsafe impl Send for OwnerLock {}

impl OwnerLock {
    pub fn new() -> Self {
        Self {
            spin: SpinLock::new(),
            state: UnsafeCell::new(OwnerState { owner: None, count: 0, waiters: VecDeque::new() }),
        }
    }

    pub fn acquire(self: &Arc<Self>) {
        let task = processor::current_task().expect("OwnerLock::acquire called off a processor");
        let guard = self.spin.acquire();
        let state = unsafe { &mut *self.state.get() };

        if let Some(owner) = &state.owner {
            if Arc::ptr_eq(owner, &task) {
                state.count += 1;
                return;
            }
            let from_priority = task.priority();
            task.set_state(ThreadState::Blocked);
            state.waiters.push_back(task.clone());
            let chain = vec![state.owner.clone().unwrap()];

            // Deferred for the same reason as `Lock::acquire`: the spin
            // guard must outlive our own context switch, not precede it.
            let this = self.clone();
            let guard = unsafe { guard.into_static() };
            crate::priority::bump_chain(&chain, from_priority);
            processor::schedule(vec![Box::new(move || {
                drop(guard);
                drop(this);
            })]);
            // `release()` already set `owner = Some(task)`, `count = 1` on
            // our behalf before waking us (§4.D "transferring ownership
            // atomically").
            crate::priority::release_chain(&chain, from_priority);
            return;
        }

        state.owner = Some(task);
        state.count = 1;
    }

    /// Never blocks.
    pub fn try_acquire(&self) -> bool {
        let task = match processor::current_task() {
            Some(t) => t,
            None => return false,
        };
        let guard = match self.spin.try_acquire() {
            Some(g) => g,
            None => return false,
        };
        let state = unsafe { &mut *self.state.get() };
        match &state.owner {
            Some(owner) if Arc::ptr_eq(owner, &task) => {
                state.count += 1;
                true
            }
            None => {
                state.owner = Some(task);
                state.count = 1;
                true
            }
            Some(_) => {
                drop(guard);
                false
            }
        }
    }

    pub fn release(&self) {
        let guard = self.spin.acquire();
        let state = unsafe { &mut *self.state.get() };
        assert!(state.count > 0, "KernelFailure: release of an unheld OwnerLock");
        state.count -= 1;
        if state.count > 0 {
            return;
        }
        match state.waiters.pop_front() {
            Some(next) => {
                state.owner = Some(next.clone());
                state.count = 1;
                drop(guard);
                next.wake();
            }
            None => {
                state.owner = None;
                drop(guard);
            }
        }
    }

    /// Directly enqueue a task that is *not* currently running (it is
    /// parked on a [`crate::condition::Condition`]) into this lock's
    /// waiter queue, or grant it ownership immediately if free, then wake
    /// it. Used by `Condition::signal`/`broadcast` so a woken waiter
    /// always resumes already holding its remembered owner lock (§4.E:
    /// "a spurious wake-up cannot skip re-acquiring the lock").
    pub(crate) fn requeue_waiter(&self, task: Arc<Task>) {
        let guard = self.spin.acquire();
        let state = unsafe { &mut *self.state.get() };
        if state.owner.is_none() {
            state.owner = Some(task.clone());
            state.count = 1;
            drop(guard);
            task.wake();
        } else {
            state.waiters.push_back(task.clone());
        }
    }

    pub fn is_held_by_current(&self) -> bool {
        let _guard = self.spin.acquire();
        let state = unsafe { &*self.state.get() };
        match (&state.owner, processor::current_task()) {
            (Some(o), Some(t)) => Arc::ptr_eq(o, &t),
            _ => false,
        }
    }

    pub fn guard(self: &Arc<Self>) -> OwnerGuard<'_> {
        self.acquire();
        OwnerGuard { lock: self }
    }
}

impl Default for OwnerLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct OwnerGuard<'a> {
    lock: &'a OwnerLock,
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
