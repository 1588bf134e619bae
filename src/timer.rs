//! Timed event list (§3 "EventNode/EventList"): an ordered set of pending
//! wake-ups consulted by the poller and the preemption timer.
//!
//! Grounded on `constance_port_std::State::pend_tick_after`'s use of a
//! dedicated timer thread parked on `mpsc::Receiver::recv_deadline`; here
//! the list is explicit (rather than delegated to a second channel-backed
//! thread) so the NBIO poller can consult "time of next wake" directly,
//! per §4.J step 7 and §3's "system processor consults this list".

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(u64);

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// What happens when an event fires. Handlers run with the event list's
/// lock already released (the caller of `EventList::drain_expired` invokes
/// them after popping), so they may re-insert events or touch scheduler
/// state.
pub type Handler = Box<dyn FnOnce() + Send>;

struct Node {
    id: EventId,
    at: Instant,
    interval: Option<Duration>,
    handler: Option<Handler>,
}

impl Node {
    fn reschedule(mut self) -> Option<Self> {
        let interval = self.interval?;
        self.at += interval;
        Some(self)
    }
}

// `BinaryHeap` is a max-heap; invert ordering so the earliest `at` sorts
// first (§3 invariant: "the head of the list is the next scheduled wake").
struct ByTime(Node);

impl PartialEq for ByTime {
    fn eq(&self, other: &Self) -> bool {
        self.0.at == other.0.at
    }
}
impl Eq for ByTime {}
impl PartialOrd for ByTime {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for ByTime {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.0.at.cmp(&self.0.at)
    }
}

/// Called after every insertion with the (possibly unchanged) earliest
/// pending deadline, so whatever owns the process's interval timer can
/// re-arm it without waiting for the next `SIGALRM` to notice a sooner
/// event (§3 invariant: "the head of the list is the next scheduled
/// wake" must stay true of the *armed timer*, not just the heap).
type RearmHook = Box<dyn Fn(Instant) + Send>;

#[derive(Default)]
pub struct EventList {
    heap: Mutex<BinaryHeap<ByTime>>,
    rearm: Mutex<Option<RearmHook>>,
}

impl EventList {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            rearm: Mutex::new(None),
        }
    }

    /// Register the system processor's alarm-(re)programming callback
    /// (`processor::Processor::reprogram_alarm`'s underlying action).
    /// Fires once immediately against whatever is already pending, then
    /// again after every subsequent insertion — this is what lets a
    /// freshly-inserted near-term timeout (e.g. an `_Accept` timeout)
    /// preempt an already-armed, farther-out deadline instead of waiting
    /// for it to expire first.
    pub(crate) fn set_rearm_hook(&self, hook: impl Fn(Instant) + Send + 'static) {
        *self.rearm.lock().unwrap() = Some(Box::new(hook));
        self.notify_rearm();
    }

    fn notify_rearm(&self) {
        if let Some(hook) = &*self.rearm.lock().unwrap() {
            if let Some(at) = self.next_deadline() {
                hook(at);
            }
        }
    }

    /// Insert a one-shot event firing at `at`.
    pub fn insert_at(&self, at: Instant, handler: impl FnOnce() + Send + 'static) -> EventId {
        let id = EventId(NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed));
        self.heap.lock().unwrap().push(ByTime(Node {
            id,
            at,
            interval: None,
            handler: Some(Box::new(handler)),
        }));
        self.notify_rearm();
        id
    }

    /// Insert a periodic event, next firing after `interval`.
    pub fn insert_periodic(
        &self,
        interval: Duration,
        handler: impl FnOnce() + Send + 'static,
    ) -> EventId {
        let id = EventId(NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed));
        self.heap.lock().unwrap().push(ByTime(Node {
            id,
            at: Instant::now() + interval,
            interval: Some(interval),
            handler: Some(Box::new(handler)),
        }));
        self.notify_rearm();
        id
    }

    /// Remove a pending event before it fires (e.g. a timed wait that woke
    /// up normally before its timeout). Returns whether it was still
    /// pending.
    pub fn cancel(&self, id: EventId) -> bool {
        let mut heap = self.heap.lock().unwrap();
        let before = heap.len();
        *heap = heap.drain().filter(|n| n.0.id != id).collect();
        heap.len() != before
    }

    /// The time of the next scheduled wake-up, if any (§3 invariant).
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.lock().unwrap().peek().map(|n| n.0.at)
    }

    /// Pop and run every event whose time has passed. Periodic events are
    /// reinserted for their next occurrence.
    pub fn drain_expired(&self) {
        let now = Instant::now();
        loop {
            let due = {
                let mut heap = self.heap.lock().unwrap();
                match heap.peek() {
                    Some(n) if n.0.at <= now => heap.pop(),
                    _ => None,
                }
            };
            let Some(ByTime(mut node)) = due else { break };
            if let Some(handler) = node.handler.take() {
                handler();
            }
            if let Some(next) = node.reschedule() {
                self.heap.lock().unwrap().push(ByTime(next));
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().unwrap().is_empty()
    }
}
