//! Serial / monitor core (§4.G): the synchronisation kernel backing mutex
//! objects. Each generated mutex-object type owns one [`Serial`] and calls
//! [`Serial::enter`]/[`Serial::leave`] around every entry member body and
//! [`Serial::accept`] for `_Accept` statements.
//!
//! Deviation from §4.G step 2's literal "context-switch" inside
//! `acceptTry`: rather than a direct task-to-task coroutine handoff, the
//! accepting task parks itself on the acceptor/signalled stack and wakes
//! the callee through the ordinary ready-queue path, consistent with this
//! runtime's processor-mediated scheduling (every switch goes through a
//! processor's native context, never task-to-task) — see DESIGN.md.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::Fault;
use crate::priority;
use crate::processor;
use crate::task::{Task, ThreadState};

/// Reserved entry-mask bit positions (§4.G).
pub const BIT_TIMEOUT: u32 = 0;
pub const BIT_DESTRUCTOR: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DestructorState {
    NotCalled,
    Called,
}

struct PendingAccept {
    bits: Vec<u32>,
    acceptor: Arc<Task>,
    result: Arc<Mutex<Option<u32>>>,
}

struct SerialState {
    owner: Option<Arc<Task>>,
    recursion: u32,
    /// One FIFO queue per entry-member bit (§3 "mutex-queue").
    member_queues: HashMap<u32, VecDeque<Arc<Task>>>,
    /// All blocked entrants in arrival order, used by `leave` to find the
    /// next caller regardless of which member they called (§3
    /// "owning entry queue").
    entry_queue: VecDeque<Arc<Task>>,
    /// LIFO of tasks with notional ownership waiting for their turn to
    /// resume (§3 "acceptor/signalled stack").
    acceptor_stack: Vec<Arc<Task>>,
    /// Accept statements currently blocked with no immediate caller,
    /// waiting for one of `bits` to be entered (§4.G step 2 "block").
    pending_accepts: Vec<PendingAccept>,
    destructor_state: DestructorState,
    not_alive: bool,
}

/// The monitor core backing a mutex object (§3 "Serial").
pub struct Serial {
    spin: crate::spin::SpinLock,
    state: std::cell::UnsafeCell<SerialState>,
}

unsafe impl Sync for Serial {}
unsafe impl Send for Serial {}

impl Serial {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            spin: crate::spin::SpinLock::new(),
            state: std::cell::UnsafeCell::new(SerialState {
                owner: None,
                recursion: 0,
                member_queues: HashMap::new(),
                entry_queue: VecDeque::new(),
                acceptor_stack: Vec::new(),
                pending_accepts: Vec::new(),
                destructor_state: DestructorState::NotCalled,
                not_alive: false,
            }),
        })
    }

    fn is_not_alive(&self) -> bool {
        let _g = self.spin.acquire();
        unsafe { &*self.state.get() }.not_alive
    }

    /// Enter member `member` (§4.G "Enter"). Blocks if the monitor is
    /// currently owned by a different task and no accept statement has
    /// this bit open.
    pub fn enter(self: &Arc<Self>, member: u32) -> Result<(), Fault> {
        let task = processor::current_task().expect("Serial::enter called off a processor");
        let guard = self.spin.acquire();
        let state = unsafe { &mut *self.state.get() };

        if state.not_alive {
            drop(guard);
            return Err(Fault::EntryFailure);
        }

        if let Some(idx) = state.pending_accepts.iter().position(|p| p.bits.contains(&member)) {
            let pending = state.pending_accepts.remove(idx);
            // The acceptor regains notional ownership once this entrant's
            // body finishes; `leave()` hands it back via the acceptor stack,
            // exactly as it does for an accept that matched immediately.
            state.acceptor_stack.push(pending.acceptor);
            state.owner = Some(task.clone());
            state.recursion = 1;
            drop(guard);
            *pending.result.lock().unwrap() = Some(member);
            return Ok(());
        }

        if state.owner.is_none() {
            state.owner = Some(task);
            state.recursion = 1;
            return Ok(());
        }

        if let Some(owner) = &state.owner {
            if Arc::ptr_eq(owner, &task) {
                state.recursion += 1;
                return Ok(());
            }
        }

        // Contended: queue on this member's mutex-queue and the shared
        // entry queue, then park (§4.G step 4).
        let from_priority = task.priority();
        let chain = vec![state.owner.clone().unwrap()];
        task.set_state(ThreadState::Blocked);
        state.member_queues.entry(member).or_default().push_back(task.clone());
        state.entry_queue.push_back(task.clone());

        // Deferred: the spin guard must outlive our own context switch
        // (§4.I `schedule()`) — another task already running on another
        // processor could pop us off `entry_queue` via `leave()` the
        // instant it's unguarded, racing our still in-flight suspend.
        let this = self.clone();
        let guard = unsafe { guard.into_static() };
        priority::bump_chain(&chain, from_priority);
        processor::schedule(vec![Box::new(move || {
            drop(guard);
            drop(this);
        })]);
        priority::release_chain(&chain, from_priority);

        if self.is_not_alive() {
            return Err(Fault::EntryFailure);
        }
        Ok(())
    }

    /// Leave the member most recently entered (§4.G "Leave").
    pub fn leave(self: &Arc<Self>) {
        let guard = self.spin.acquire();
        let state = unsafe { &mut *self.state.get() };

        if state.recursion > 1 {
            state.recursion -= 1;
            return;
        }
        state.recursion = 0;

        if matches!(state.destructor_state, DestructorState::Called) {
            if state
                .owner
                .as_ref()
                .map(|o| processor::current_task().map(|t| Arc::ptr_eq(o, &t)).unwrap_or(false))
                .unwrap_or(false)
            {
                state.destructor_state = DestructorState::NotCalled;
            }
        }

        if let Some(next) = state.acceptor_stack.pop() {
            state.owner = Some(next.clone());
            drop(guard);
            next.wake();
            return;
        }

        if let Some(next) = state.entry_queue.pop_front() {
            for q in state.member_queues.values_mut() {
                q.retain(|t| !Arc::ptr_eq(t, &next));
            }
            state.owner = Some(next.clone());
            state.recursion = 1;
            drop(guard);
            next.wake();
            return;
        }

        state.owner = None;
    }

    /// `_Accept` statement: try each member in `members` for an immediately
    /// waiting caller; else block (optionally with `timeout`, optionally
    /// falling through to `else` if `has_else`). Returns the accepted
    /// member bit, or `None` for a taken `else` branch (§4.G "Accept
    /// statement").
    pub fn accept(
        self: &Arc<Self>,
        members: &[u32],
        timeout: Option<Duration>,
        has_else: bool,
    ) -> Result<Option<u32>, Fault> {
        let task = processor::current_task().expect("Serial::accept called off a processor");
        let guard = self.spin.acquire();
        let state = unsafe { &mut *self.state.get() };

        for &bit in members {
            if let Some(callee) = state.member_queues.get_mut(&bit).and_then(|q| q.pop_front()) {
                state.entry_queue.retain(|t| !Arc::ptr_eq(t, &callee));
                state.acceptor_stack.push(task.clone());
                state.owner = Some(callee.clone());
                state.recursion = 1;
                task.set_state(ThreadState::Blocked);

                // Both the callee's wake and this guard's release are
                // packaged as deferred actions (§4.I "lock to release,
                // task to wake") so they only run once our own switch away
                // has completed.
                let this = self.clone();
                let guard = unsafe { guard.into_static() };
                processor::schedule(vec![Box::new(move || {
                    callee.wake();
                    drop(guard);
                    drop(this);
                })]);
                if self.is_not_alive() {
                    return Err(Fault::EntryFailure);
                }
                return Ok(Some(bit));
            }
        }

        if has_else {
            drop(guard);
            return Ok(None);
        }

        let result = Arc::new(Mutex::new(None));
        state.pending_accepts.push(PendingAccept {
            bits: members.to_vec(),
            acceptor: task.clone(),
            result: result.clone(),
        });
        // `owner` is left as-is (this task, since only the current owner
        // ever calls `accept`): a caller of one of `members` bypasses it via
        // `pending_accepts` above regardless, while a caller of any other
        // member must still queue behind the still-outstanding ownership
        // (§3 Serial invariant — only an accepted member's bit is open).
        task.set_state(ThreadState::Blocked);

        let timeout_event = timeout.map(|duration| {
            let this = self.clone();
            let waiting_task = task.clone();
            let result = result.clone();
            crate::runtime::Runtime::global()
                .events
                .insert_at(Instant::now() + duration, move || {
                    this.fire_accept_timeout(waiting_task, result)
                })
        });

        let this = self.clone();
        let guard = unsafe { guard.into_static() };
        processor::schedule(vec![Box::new(move || {
            drop(guard);
            drop(this);
        })]);

        if let Some(event) = timeout_event {
            crate::runtime::Runtime::global().events.cancel(event);
        }
        if self.is_not_alive() {
            return Err(Fault::EntryFailure);
        }
        Ok(*result.lock().unwrap())
    }

    fn fire_accept_timeout(self: &Arc<Self>, task: Arc<Task>, result: Arc<Mutex<Option<u32>>>) {
        let guard = self.spin.acquire();
        let state = unsafe { &mut *self.state.get() };
        let before = state.pending_accepts.len();
        state.pending_accepts.retain(|p| !Arc::ptr_eq(&p.acceptor, &task));
        if state.pending_accepts.len() == before {
            drop(guard);
            return; // already serviced by a real caller
        }
        state.owner = Some(task.clone());
        state.recursion = 1;
        drop(guard);
        *result.lock().unwrap() = Some(BIT_TIMEOUT);
        task.wake();
    }

    /// Enter as the destructor (bit 1), mark the monitor dead, and wake
    /// every queued entrant with `EntryFailure` (§4.G "Destructor
    /// semantics", §8 "with outstanding entries, each blocked caller is
    /// woken with EntryFailure").
    pub fn destroy(self: &Arc<Self>) {
        if self.enter(BIT_DESTRUCTOR).is_err() {
            panic!("KernelFailure: monitor destructor entered twice");
        }
        let guard = self.spin.acquire();
        let state = unsafe { &mut *self.state.get() };
        state.not_alive = true;
        state.destructor_state = DestructorState::Called;
        let queued: Vec<Arc<Task>> = state.entry_queue.drain(..).collect();
        state.member_queues.clear();
        drop(guard);
        for t in queued {
            t.wake();
        }
        self.leave();
    }

    pub fn is_alive(&self) -> bool {
        !self.is_not_alive()
    }
}
