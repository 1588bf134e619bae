//! Tasks: a coroutine plus scheduler-visible thread state (§3 "Task").
//!
//! The teacher kernel (`constance`) indexes statically-allocated task
//! control blocks from arena slots and threads them onto intrusive list
//! nodes (`utils::intrusive_list`) to avoid an allocator in a `no_std`
//! target. This runtime is hosted (`std` is available and the spec's
//! non-goals don't forbid an allocator), so tasks are heap-allocated and
//! referenced by `Arc`; queues are plain `VecDeque<Arc<Task>>` behind each
//! owner's lock instead of arena-indexed intrusive links. See DESIGN.md
//! for this deviation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cluster::Cluster;
use crate::context::Stack;
use crate::coroutine::{CoroutineId, Coroutine};
use crate::serial::Serial;

/// Scheduler-visible state of a task (§3 "Task" lifecycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Start,
    Ready,
    Running,
    Blocked,
    Terminate,
}

pub type Priority = i32;
pub const DEFAULT_PRIORITY: Priority = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Which wait queue (if any) a task currently sits on, mirroring the
/// `listed()` single-bit membership invariant from §3: a task is on at
/// most one of these at a time, enforced here by `Task::park_on`/`unpark`
/// rather than by a shared intrusive-node bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    None,
    ReadyQueue,
    EntryQueue,
    MutexQueue,
    ConditionQueue,
    SemaphoreQueue,
    AcceptorStack,
    NbioWaiter,
}

pub struct Task {
    id: TaskId,
    pub(crate) coroutine: Box<Coroutine>,
    state: Mutex<ThreadState>,
    membership: Mutex<Membership>,
    priority: Mutex<Priority>,
    base_priority: Priority,
    /// The cluster this task is bound to (§3 "Cluster" invariant: "every
    /// bound task's cluster pointer equals this cluster"). `None` until
    /// [`crate::cluster::Cluster::bind_task`] is called.
    cluster: Mutex<Option<Arc<Cluster>>>,
    /// Serial this task is currently a member of (set while inside an
    /// `enter`/`accept`), weak per §3's "weak-references the owning
    /// monitor".
    pub(crate) serial: Mutex<Option<std::sync::Weak<Serial>>>,
    /// Stack of priorities inherited through blocking chains (§4.H PIQ).
    pub(crate) priority_inheritance_stack: Mutex<Vec<Priority>>,
    name: String,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &*self.state.lock().unwrap())
            .finish()
    }
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        stack: Stack,
        priority: Priority,
        body: impl FnOnce() + Send + 'static,
        on_halt: impl FnOnce() -> ! + Send + 'static,
    ) -> Arc<Self> {
        let coroutine = Coroutine::new(stack, body, on_halt);
        Arc::new(Self {
            id: TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)),
            coroutine,
            state: Mutex::new(ThreadState::Start),
            membership: Mutex::new(Membership::None),
            priority: Mutex::new(priority),
            base_priority: priority,
            cluster: Mutex::new(None),
            serial: Mutex::new(None),
            priority_inheritance_stack: Mutex::new(Vec::new()),
            name: name.into(),
        })
    }

    /// Allocate a stack, build the coroutine, and bind the resulting task
    /// onto `cluster`'s ready queue (§3 Task lifecycle: "Start → Ready (on
    /// construction...)"). The task's terminal handoff is always
    /// [`crate::processor::exit_current_task`] — user code never supplies
    /// its own `on_halt`, since the right destination (whichever
    /// processor happens to be running this task when it halts) isn't
    /// known until then.
    ///
    /// The first task ever spawned process-wide is recorded as the
    /// runtime's boot task (§9 "Global mutable state").
    pub fn spawn(
        cluster: &Arc<Cluster>,
        name: impl Into<String>,
        priority: Priority,
        body: impl FnOnce() + Send + 'static,
    ) -> Arc<Self> {
        let stack = Stack::new(cluster.default_stack_size)
            .expect("failed to allocate task stack");
        let task = Self::new(name, stack, priority, body, crate::processor::exit_current_task);
        crate::runtime::Runtime::global().set_boot_task(task.clone());
        cluster.bind_task(task.clone());
        task
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn coroutine_id(&self) -> CoroutineId {
        self.coroutine.id()
    }

    /// Request cancellation of this task's coroutine (§5 "Cancellation").
    /// Honored immediately if its cancel type is `Implicit`, otherwise
    /// deferred until its next [`Task::poll_cancellation`].
    pub fn cancel(self: &Arc<Self>) {
        self.coroutine.cancel();
    }

    /// Explicit `asyncpoll` checkpoint (§5, SPEC supplement): consumes and
    /// returns the next buffered async event, if any, including a pending
    /// cancellation. Must be called from this task's own execution.
    pub fn poll_cancellation(&self) -> Option<crate::error::AsyncEvent> {
        self.coroutine.poll_cancellation()
    }

    pub fn set_cancel_type(&self, ty: crate::coroutine::CancelType) {
        self.coroutine.set_cancel_type(ty);
    }

    pub fn set_cancel_enable(&self, enable: crate::coroutine::CancelEnable) {
        self.coroutine.set_cancel_enable(enable);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, st: ThreadState) {
        *self.state.lock().unwrap() = st;
    }

    pub fn membership(&self) -> Membership {
        *self.membership.lock().unwrap()
    }

    /// Atomically claim membership in `to`, asserting the §3 invariant
    /// that a task is never concurrently listed on two queues.
    pub fn claim_membership(&self, to: Membership) {
        let mut m = self.membership.lock().unwrap();
        assert_eq!(*m, Membership::None, "task already listed elsewhere");
        *m = to;
    }

    pub fn release_membership(&self) {
        *self.membership.lock().unwrap() = Membership::None;
    }

    pub fn priority(&self) -> Priority {
        *self.priority.lock().unwrap()
    }

    pub fn base_priority(&self) -> Priority {
        self.base_priority
    }

    /// Active priority = max(base priority, every priority pushed onto the
    /// inheritance stack) (§4.H).
    pub fn set_active_priority(&self, p: Priority) {
        *self.priority.lock().unwrap() = p;
    }

    pub fn cluster(&self) -> Option<Arc<Cluster>> {
        self.cluster.lock().unwrap().clone()
    }

    pub fn bind_cluster(&self, cluster: Arc<Cluster>) {
        *self.cluster.lock().unwrap() = Some(cluster);
    }

    /// Move this task back onto its cluster's ready queue (§4.I: what every
    /// blocking primitive's wake-up path ultimately does).
    pub fn wake(self: &Arc<Self>) {
        if let Some(cluster) = self.cluster() {
            cluster.enqueue_ready(self.clone());
        } else {
            self.set_state(ThreadState::Ready);
        }
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Task {}
