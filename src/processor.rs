//! Processor kernel: the per-KT scheduling coroutine (§4.I).
//!
//! Each [`Processor`] is a real kernel thread. Rather than modeling the
//! scheduler itself as a second coroutine with its own stack, the KT's own
//! native call stack *is* the scheduler coroutine (`Context::native`, per
//! §9 "Stack switching" — the ABI of `switch` is left opaque, and using the
//! thread's native stack for the one context that never needs a fresh frame
//! is the natural hosted realization of `constance_port_std`'s
//! `ums::ThreadGroup`, which likewise reuses a real OS thread as the
//! scheduling context rather than allocating it a stack of its own).

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use try_lock::TryLock;

use crate::cluster::Cluster;
use crate::context::Context;
use crate::coroutine::RunState;
use crate::runtime::Runtime;
use crate::signal;
use crate::task::{Task, ThreadState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessorId(std::thread::ThreadId);

/// At most one processor, across every cluster, is ever the system
/// processor (§6: "SIGALRM (system processor: ...)"). `spawn`'s `hint`
/// only proposes a candidate; this flag arbitrates when several clusters
/// each nominate their first processor.
static SYSTEM_PROCESSOR_CLAIMED: AtomicBool = AtomicBool::new(false);

/// Deferred "on behalf of user" actions a blocking primitive hands to the
/// scheduler to run on the scheduler's own stack (§4.I step 5 / §4.I
/// `schedule()`), e.g. releasing a spin lock or waking another task only
/// once the blocked task's stack is no longer being touched.
pub type Deferred = Box<dyn FnOnce() + Send>;

pub struct Processor {
    cluster: Arc<Cluster>,
    native_ctx: Context,
    is_system: bool,
    stop: AtomicBool,
    /// Written once by this processor's own KT before entering the
    /// scheduling loop, read by whichever KT delivers a preemption tick or
    /// requests a stop; never actually contended, so `TryLock` (rather than
    /// a real mutex) suffices, mirroring `constance_port_std`'s
    /// `timer_cmd_send`.
    pthread: TryLock<Option<libc::pthread_t>>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
    pending_deferred: Mutex<Vec<Deferred>>,
    spins_done: AtomicU32,
    #[cfg(feature = "stats")]
    pub stats: crate::stats::ProcessorStats,
}

// Safety: `native_ctx` is only ever touched by the one KT running this
// processor's `run_loop`; every other field is behind a `Mutex` or atomic.
unsafe impl Sync for Processor {}

struct Binding {
    processor: Arc<Processor>,
    task: Arc<Task>,
}

thread_local! {
    static CURRENT: RefCell<Option<Binding>> = RefCell::new(None);
}

fn current() -> Option<(Arc<Processor>, Arc<Task>)> {
    CURRENT.with(|c| c.borrow().as_ref().map(|b| (b.processor.clone(), b.task.clone())))
}

pub fn current_task() -> Option<Arc<Task>> {
    current().map(|(_, t)| t)
}

pub fn current_processor() -> Option<Arc<Processor>> {
    current().map(|(p, _)| p)
}

/// Hand the scheduler zero or more deferred actions and suspend the
/// calling task, switching back to this processor's scheduling loop. Every
/// blocking primitive in `lock`, `condition`, `semaphore`, and `serial`
/// bottoms out here.
pub fn schedule(deferred: Vec<Deferred>) {
    let (processor, task) =
        current().expect("schedule() called from a task not running under a Processor");
    processor.pending_deferred.lock().unwrap().extend(deferred);
    // Safety: `task` is the coroutine currently executing on this KT, and
    // `processor.native_ctx` is that KT's own scheduling context.
    unsafe { task.coroutine.suspend_to(&processor.native_ctx) };
}

/// The native scheduling context of whichever processor is currently
/// running the calling task, as a raw pointer. Valid for as long as the
/// call site runs on that processor's KT, which outlives every task it
/// ever resumes; used only by a halting coroutine's terminal handoff
/// ([`exit_current_task`]).
fn current_native_context_ptr() -> *const Context {
    CURRENT.with(|c| {
        let binding = c.borrow();
        let b = binding
            .as_ref()
            .expect("exit_current_task called off a processor");
        &b.processor.native_ctx as *const Context
    })
}

/// The `on_halt` handoff every [`crate::task::Task`] is constructed with
/// (`Task::spawn`): jump back into this processor's scheduling loop for
/// good once the task's body has returned or panicked. Symmetrical with
/// the first switch into a fresh coroutine landing in `invoke` (§4.A):
/// halting lands back wherever the processor's `resume_from` call is
/// still waiting (§4.I step 5).
pub(crate) fn exit_current_task() -> ! {
    let ctx = current_native_context_ptr();
    // Safety: `ctx` points at this processor's own `native_ctx`, which
    // outlives the coroutine currently halting on it; that coroutine is
    // never resumed again, so abandoning its stack here is correct.
    unsafe { Context::set(&*ctx) }
}

/// Voluntary yield (§5 "Suspension points"): re-join the tail of the ready
/// queue and let the scheduler pick the next task.
pub fn yield_now() {
    let (processor, task) =
        current().expect("yield_now() called from a task not running under a Processor");
    let cluster = processor.cluster.clone();
    schedule(vec![Box::new(move || cluster.enqueue_ready(task))]);
}

impl Processor {
    pub(crate) fn spawn(cluster: Arc<Cluster>, hint: bool) -> Arc<Self> {
        let is_system = hint
            && SYSTEM_PROCESSOR_CLAIMED
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
        let processor = Arc::new(Processor {
            cluster,
            native_ctx: Context::native(),
            is_system,
            stop: AtomicBool::new(false),
            pthread: TryLock::new(None),
            join: Mutex::new(None),
            pending_deferred: Mutex::new(Vec::new()),
            spins_done: AtomicU32::new(0),
            #[cfg(feature = "stats")]
            stats: Default::default(),
        });

        let worker = processor.clone();
        let name = format!("processor-{}", worker.cluster.name);
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || worker.enter())
            .expect("failed to spawn processor kernel thread");
        *processor.join.lock().unwrap() = Some(handle);
        processor
    }

    fn enter(self: Arc<Self>) {
        *self.pthread.try_lock().unwrap() = Some(unsafe { libc::pthread_self() });
        if self.is_system {
            Runtime::global().set_system_processor(ProcessorId(std::thread::current().id()));
            signal::install_system_handlers();
            // Bootstrap: `reprogram_alarm` (below) only runs in response to
            // an already-firing `SIGALRM`, so without this hook the very
            // first timed event (or one inserted while the alarm happens
            // to be disarmed) would never get a chance to arm it.
            Runtime::global().events.set_rearm_hook(|at| {
                let now = Instant::now();
                let delay = at.saturating_duration_since(now).max(Duration::from_micros(1));
                signal::arm_alarm(delay);
            });
        } else {
            signal::install_processor_handlers();
        }
        crate::spin::set_roll_forward_action({
            let this = self.clone();
            move || this.roll_forward()
        });
        if let Some(interval) = self.cluster.preemption_interval {
            self.arm_preemption(interval);
        }
        log::debug!("processor {:?} entering scheduling loop", std::thread::current().id());
        self.run_loop();
    }

    /// Re-arm this processor's preemption timer by posting a periodic event
    /// to the runtime's event list whose handler kicks this KT with
    /// `SIGUSR1` (§4.I "Preemption").
    fn arm_preemption(self: &Arc<Self>, interval: Duration) {
        let this = self.clone();
        Runtime::global().events.insert_periodic(interval, move || {
            if let Some(pthread) = *this.pthread.try_lock().unwrap() {
                signal::kick(pthread);
            }
        });
    }

    /// What a `SIGUSR1` roll-forward actually does once it's safe to run:
    /// re-enqueue the currently-running task at the tail of the ready queue
    /// and fall through to the scheduler, i.e. a forced time-slice
    /// boundary. A no-op if no task is currently attributed to this KT
    /// (e.g. the processor itself is idling or inside `select`).
    fn roll_forward(self: &Arc<Self>) {
        #[cfg(feature = "stats")]
        Runtime::global().stats.roll_forwards.fetch_add(1, Ordering::Relaxed);
        if let Some(task) = current_task() {
            if task.state() == ThreadState::Running {
                let cluster = self.cluster.clone();
                task.set_state(ThreadState::Ready);
                schedule(vec![Box::new(move || cluster.enqueue_ready(task))]);
            }
        }
    }

    fn run_deferred(&self) {
        let actions: Vec<Deferred> = std::mem::take(&mut *self.pending_deferred.lock().unwrap());
        for action in actions {
            action();
        }
    }

    /// §4.I main loop, steps 1-5.
    fn run_loop(self: Arc<Self>) {
        while !self.stop.load(Ordering::Acquire) {
            if signal::take_alarm_pending() {
                Runtime::global().events.drain_expired();
                self.reprogram_alarm();
            }
            if self.is_system && signal::take_abort_requested() {
                log::warn!("graceful abort requested; shutting down");
                break;
            }

            let task = match self.pick_next_task() {
                Some(task) => task,
                None => continue,
            };

            task.set_state(ThreadState::Running);
            CURRENT.with(|c| {
                *c.borrow_mut() = Some(Binding {
                    processor: self.clone(),
                    task: task.clone(),
                })
            });

            #[cfg(feature = "stats")]
            self.stats.context_switches.fetch_add(1, Ordering::Relaxed);

            // Safety: this KT's own stack is `self.native_ctx`; `task` is
            // Ready (not concurrently running anywhere else, §8 "Mutual
            // exclusion" extends to ready-queue membership).
            unsafe { task.coroutine.resume_from(&self.native_ctx, task.coroutine_id()) };

            CURRENT.with(|c| *c.borrow_mut() = None);
            self.run_deferred();

            if task.coroutine.state() == RunState::Halt {
                task.set_state(ThreadState::Terminate);
                self.cluster.untrack_task(&task);
                log::debug!("task {:?} terminated", task.id());
            }
        }
    }

    fn reprogram_alarm(&self) {
        if !self.is_system {
            return;
        }
        match Runtime::global().events.next_deadline() {
            Some(at) => {
                let now = Instant::now();
                let delay = at.saturating_duration_since(now).max(Duration::from_micros(1));
                signal::arm_alarm(delay);
            }
            None => signal::disarm_alarm(),
        }
    }

    /// §4.I steps 1-4: processor-private ready work (none, in this
    /// implementation — every task lives on its cluster's shared queue, a
    /// deliberate simplification over the source's per-processor
    /// "external" list, recorded in DESIGN.md), then the cluster's shared
    /// ready queue, then idle/NBIO/deadlock handling.
    fn pick_next_task(self: &Arc<Self>) -> Option<Arc<Task>> {
        if let Some(task) = self.cluster.pop_ready() {
            return Some(task);
        }

        if cfg!(feature = "multiprocessor") {
            let budget = self.cluster.spin_budget;
            for _ in 0..budget {
                if let Some(task) = self.cluster.pop_ready() {
                    return Some(task);
                }
                std::hint::spin_loop();
            }
            self.cluster.park_idle(self.clone());
            None
        } else {
            self.uniprocessor_idle_step()
        }
    }

    /// §4.I step 4: cycle every cluster, then the NBIO poller, then sleep
    /// until the next timed event, then declare deadlock.
    fn uniprocessor_idle_step(self: &Arc<Self>) -> Option<Arc<Task>> {
        for cluster in Runtime::global().clusters() {
            if let Some(task) = cluster.pop_ready() {
                return Some(task);
            }
        }

        if self.cluster.has_viable_poller() {
            self.cluster.nbio.run_poll_iteration(&self.cluster);
            return None;
        }

        if let Some(deadline) = Runtime::global().events.next_deadline() {
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep((deadline - now).min(Duration::from_millis(20)));
            }
            Runtime::global().events.drain_expired();
            return None;
        }

        if Runtime::global().is_globally_deadlocked() {
            log::error!("KernelFailure: deadlock detected, no ready task, no pending I/O or timer");
            panic!("deadlock: every task is blocked with no pending event to wake one");
        }
        None
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(pthread) = *self.pthread.try_lock().unwrap() {
            signal::kick(pthread);
        }
    }

    pub(crate) fn join(&self) {
        if let Some(handle) = self.join.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
