//! Cluster: a group of processors sharing a ready queue and an NBIO
//! multiplexor (§3 "Cluster", §4.F "Cluster").

use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::nbio::{Mask, Nbio, WaitOutcome};
use crate::processor::Processor;
use crate::task::{Membership, Task, ThreadState};

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub name: String,
    pub default_stack_size: usize,
    pub num_processors: usize,
    /// FIFO (§3 default) when `false`; priority-ordered with FIFO among
    /// equal priorities (§4.H "ready queue is notified") when `true`.
    pub prioritized: bool,
    /// `None` disables preemption (§3 Processor invariant: "0 means
    /// preemption disabled").
    pub preemption_interval: Option<Duration>,
    pub spin_budget: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "cluster".into(),
            default_stack_size: crate::context::MIN_STACK_SIZE,
            num_processors: 1,
            prioritized: false,
            preemption_interval: None,
            spin_budget: 1000,
        }
    }
}

struct ReadyEntry {
    task: Arc<Task>,
    seq: u64,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.task.priority() == other.task.priority() && self.seq == other.seq
    }
}
impl Eq for ReadyEntry {}
impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap by priority; lower `seq` (earlier arrival) wins ties, so
        // invert `seq`'s comparison to keep FIFO order among equals.
        self.task
            .priority()
            .cmp(&other.task.priority())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum ReadyQueue {
    Fifo(VecDeque<Arc<Task>>),
    Priority(BinaryHeap<ReadyEntry>),
}

impl ReadyQueue {
    fn push(&mut self, task: Arc<Task>, seq: u64) {
        match self {
            ReadyQueue::Fifo(q) => q.push_back(task),
            ReadyQueue::Priority(h) => h.push(ReadyEntry { task, seq }),
        }
    }

    fn push_front(&mut self, task: Arc<Task>, seq: u64) {
        match self {
            ReadyQueue::Fifo(q) => q.push_front(task),
            ReadyQueue::Priority(h) => h.push(ReadyEntry { task, seq }),
        }
    }

    fn pop(&mut self) -> Option<Arc<Task>> {
        match self {
            ReadyQueue::Fifo(q) => q.pop_front(),
            ReadyQueue::Priority(h) => h.pop().map(|e| e.task),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            ReadyQueue::Fifo(q) => q.is_empty(),
            ReadyQueue::Priority(h) => h.is_empty(),
        }
    }

    /// Remove every entry for `task`, if any (there should be at most
    /// one, per §3's ready-queue-membership invariant). Used by
    /// [`Cluster::reposition_ready`] so a priority bump doesn't leave a
    /// stale duplicate entry sitting in the heap at the old priority.
    fn remove(&mut self, task: &Arc<Task>) -> bool {
        match self {
            ReadyQueue::Fifo(q) => {
                let before = q.len();
                q.retain(|t| !Arc::ptr_eq(t, task));
                q.len() != before
            }
            ReadyQueue::Priority(h) => {
                let before = h.len();
                let items = std::mem::take(h).into_vec();
                *h = items.into_iter().filter(|e| !Arc::ptr_eq(&e.task, task)).collect();
                h.len() != before
            }
        }
    }
}

pub struct Cluster {
    pub name: String,
    pub default_stack_size: usize,
    pub prioritized: bool,
    pub preemption_interval: Option<Duration>,
    pub spin_budget: u32,
    ready: Mutex<ReadyQueue>,
    ready_seq: AtomicU64,
    idle: Mutex<Vec<Arc<Processor>>>,
    idle_wake: Condvar,
    tasks: Mutex<Vec<Arc<Task>>>,
    processors: Mutex<Vec<Arc<Processor>>>,
    pub(crate) nbio: Nbio,
    running: AtomicBool,
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> Arc<Self> {
        let ready = if config.prioritized {
            ReadyQueue::Priority(BinaryHeap::new())
        } else {
            ReadyQueue::Fifo(VecDeque::new())
        };
        let cluster = Arc::new(Self {
            name: config.name,
            default_stack_size: config.default_stack_size,
            prioritized: config.prioritized,
            preemption_interval: config.preemption_interval,
            spin_budget: config.spin_budget,
            ready: Mutex::new(ready),
            ready_seq: AtomicU64::new(0),
            idle: Mutex::new(Vec::new()),
            idle_wake: Condvar::new(),
            tasks: Mutex::new(Vec::new()),
            processors: Mutex::new(Vec::new()),
            nbio: Nbio::new(),
            running: AtomicBool::new(true),
        });
        let n = config.num_processors.max(1);
        let procs: Vec<Arc<Processor>> = (0..n)
            .map(|i| Processor::spawn(cluster.clone(), i == 0))
            .collect();
        *cluster.processors.lock().unwrap() = procs;
        cluster
    }

    pub fn bind_task(self: &Arc<Self>, task: Arc<Task>) {
        task.bind_cluster(self.clone());
        task.set_state(ThreadState::Ready);
        self.tasks.lock().unwrap().push(task.clone());
        self.enqueue_ready(task);
    }

    /// Place `task` on the tail of the ready queue (or its priority slot)
    /// and, if any processor is idle, wake one (§3 Cluster invariant: "the
    /// ready queue contains only tasks with state=Ready").
    pub fn enqueue_ready(&self, task: Arc<Task>) {
        task.set_state(ThreadState::Ready);
        task.claim_membership(Membership::ReadyQueue);
        let seq = self.ready_seq.fetch_add(1, Ordering::Relaxed);
        self.ready.lock().unwrap().push(task, seq);
        self.wake_one_idle();
    }

    /// Reposition `task` to the front of its priority slot: used when a
    /// priority bump (§4.H) needs the queue to reflect the new active
    /// priority immediately rather than waiting for the next `push`. A
    /// no-op if `task` isn't currently sitting in the ready queue (it may
    /// be blocked or running elsewhere — the bump still applies to its
    /// active priority, there's just no queue position to fix up yet).
    pub fn reposition_ready(&self, task: Arc<Task>) {
        let mut ready = self.ready.lock().unwrap();
        if !ready.remove(&task) {
            return;
        }
        let seq = self.ready_seq.fetch_add(1, Ordering::Relaxed);
        ready.push_front(task, seq);
    }

    pub(crate) fn pop_ready(&self) -> Option<Arc<Task>> {
        let task = self.ready.lock().unwrap().pop();
        if let Some(t) = &task {
            t.release_membership();
        }
        task
    }

    pub fn ready_queue_is_empty(&self) -> bool {
        self.ready.lock().unwrap().is_empty()
    }

    pub(crate) fn park_idle(&self, processor: Arc<Processor>) {
        let mut idle = self.idle.lock().unwrap();
        idle.push(processor);
        let _ = self.idle_wake.wait_timeout(idle, Duration::from_millis(50)).unwrap();
    }

    fn wake_one_idle(&self) {
        let mut idle = self.idle.lock().unwrap();
        if !idle.is_empty() {
            idle.clear();
            self.idle_wake.notify_all();
        }
    }

    pub fn has_viable_poller(&self) -> bool {
        self.nbio.has_waiters()
    }

    /// Block the calling task until `fd` is ready for `mask`, or `timeout`
    /// elapses (§4.J). The public entry point onto this cluster's NBIO
    /// multiplexor — `nbio` itself is crate-private since every waiter
    /// must go through the cluster it's registered against.
    pub fn wait_fd(
        self: &Arc<Self>,
        fd: std::os::unix::io::RawFd,
        mask: Mask,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        self.nbio.wait_fd(self, fd, mask, timeout)
    }

    /// Block the calling task until any fd in `targets` is ready, or
    /// `timeout` elapses (§4.J `select_mask_wait`).
    pub fn wait_mask(
        self: &Arc<Self>,
        targets: Vec<(std::os::unix::io::RawFd, Mask)>,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        self.nbio.wait_mask(self, targets, timeout)
    }

    pub(crate) fn untrack_task(&self, task: &Arc<Task>) {
        self.tasks.lock().unwrap().retain(|t| !Arc::ptr_eq(t, task));
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.wake_one_idle();
        let procs = self.processors.lock().unwrap().clone();
        for p in &procs {
            p.request_stop();
        }
        for p in &procs {
            p.join();
        }
    }
}
