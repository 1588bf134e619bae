//! Non-blocking I/O multiplexor (§4.J, §3 "NBIO state").
//!
//! One `select`-based poller per cluster. Blocking `read`/`write`/`accept`/
//! etc. funnel through [`Nbio::wait_fd`] (single-fd) or [`Nbio::wait_mask`]
//! (multi-fd). Whichever task registers first when no poller is currently
//! elected becomes the poller for as long as it keeps calling `select` on
//! behalf of the whole waiter set; every other registrant just blocks.

use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use try_lock::TryLock;

use crate::cluster::Cluster;
use crate::processor;
use crate::task::Task;
use crate::timer::EventId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mask {
    pub read: bool,
    pub write: bool,
    pub except: bool,
}

impl Mask {
    pub const READ: Mask = Mask { read: true, write: false, except: false };
    pub const WRITE: Mask = Mask { read: false, write: true, except: false };

    pub fn any(self) -> bool {
        self.read || self.write || self.except
    }

    fn intersect(self, other: Mask) -> Mask {
        Mask {
            read: self.read && other.read,
            write: self.write && other.write,
            except: self.except && other.except,
        }
    }

    fn union(self, other: Mask) -> Mask {
        Mask {
            read: self.read || other.read,
            write: self.write || other.write,
            except: self.except || other.except,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum WaitOutcome {
    Ready(Mask),
    TimedOut,
    BadFd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct WaiterId(u64);

static NEXT_WAITER_ID: AtomicU64 = AtomicU64::new(1);

enum Target {
    Single(RawFd, Mask),
    /// A mask-wait over an arbitrary set of fds, represented as the set of
    /// (fd, interest) pairs the caller asked about (§4.J
    /// `select_mask_wait`).
    Multi(Vec<(RawFd, Mask)>),
}

struct Waiter {
    id: WaiterId,
    target: Target,
    task: Arc<Task>,
    outcome: Mutex<Option<WaitOutcome>>,
    timeout_event: Mutex<Option<EventId>>,
    timed_out: AtomicBool,
}

/// Per-cluster NBIO state (§3 "NBIO state").
pub struct Nbio {
    waiters: Mutex<Vec<Arc<Waiter>>>,
    /// The waiter currently responsible for calling `select` on behalf of
    /// everyone, if any (§3 invariant: "poller task is nil iff no task is
    /// waiting on I/O").
    poller: Mutex<Option<WaiterId>>,
    /// Set while some KT is actually blocked inside `select`, so a timeout
    /// handler knows whether it needs to kick that KT with `SIGUSR1`
    /// (§4.J step 7). Never contended in practice, so `TryLock` suffices.
    poller_pthread: TryLock<Option<libc::pthread_t>>,
    #[cfg(feature = "stats")]
    pub select_calls: std::sync::atomic::AtomicU64,
}

impl Nbio {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
            poller: Mutex::new(None),
            poller_pthread: TryLock::new(None),
            #[cfg(feature = "stats")]
            select_calls: Default::default(),
        }
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.lock().unwrap().is_empty()
    }

    /// Block the calling task until `fd` becomes ready for `mask`, or
    /// `timeout` elapses. A zero-duration timeout behaves exactly like a
    /// non-blocking poll (§8 "Boundary behaviours").
    pub fn wait_fd(
        &self,
        cluster: &Arc<Cluster>,
        fd: RawFd,
        mask: Mask,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        self.wait(cluster, Target::Single(fd, mask), timeout)
    }

    /// Block the calling task until any fd in `targets` is ready, or
    /// `timeout` elapses (§4.J `select_mask_wait`).
    pub fn wait_mask(
        &self,
        cluster: &Arc<Cluster>,
        targets: Vec<(RawFd, Mask)>,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        self.wait(cluster, Target::Multi(targets), timeout)
    }

    fn wait(
        &self,
        cluster: &Arc<Cluster>,
        target: Target,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        let task = processor::current_task().expect("NBIO wait called off a processor");
        let id = WaiterId(NEXT_WAITER_ID.fetch_add(1, Ordering::Relaxed));
        let waiter = Arc::new(Waiter {
            id,
            target,
            task: task.clone(),
            outcome: Mutex::new(None),
            timeout_event: Mutex::new(None),
            timed_out: AtomicBool::new(false),
        });

        if let Some(duration) = timeout {
            if duration.is_zero() {
                // Immediate poll: run one iteration synchronously and
                // return without ever parking.
                self.waiters.lock().unwrap().push(waiter.clone());
                self.run_poll_iteration_with_timeout(cluster, Some(Duration::ZERO));
                return self.take_outcome(&waiter).unwrap_or(WaitOutcome::TimedOut);
            }
            let cluster = cluster.clone();
            let w = waiter.clone();
            let event = crate::runtime::Runtime::global()
                .events
                .insert_at(Instant::now() + duration, move || cluster.nbio.fire_timeout(w));
            *waiter.timeout_event.lock().unwrap() = Some(event);
        }

        self.waiters.lock().unwrap().push(waiter.clone());
        self.try_elect_self(id);

        // Every waiter, not just whichever one first registered, may end up
        // elected poller over the course of this wait: `elect_next_poller`
        // hands the role to the next waiter in line (waking it) once the
        // previous poller's own request is satisfied (§4.J step 6). So each
        // time this task is woken it must re-check whether it now owns the
        // poller role before parking again.
        loop {
            if let Some(outcome) = self.take_outcome(&waiter) {
                return outcome;
            }
            if self.is_current_poller(id) {
                self.run_poll_iteration(cluster);
                if let Some(outcome) = self.take_outcome(&waiter) {
                    return outcome;
                }
                // Nothing satisfied our own request this round: yield so
                // other ready tasks get a chance before the next `select`.
                processor::yield_now();
            } else {
                processor::schedule(vec![]);
            }
        }
    }

    fn try_elect_self(&self, id: WaiterId) {
        let mut poller = self.poller.lock().unwrap();
        if poller.is_none() {
            *poller = Some(id);
        }
    }

    fn is_current_poller(&self, id: WaiterId) -> bool {
        *self.poller.lock().unwrap() == Some(id)
    }

    fn take_outcome(&self, waiter: &Arc<Waiter>) -> Option<WaitOutcome> {
        waiter.outcome.lock().unwrap().take()
    }

    fn fire_timeout(&self, waiter: Arc<Waiter>) {
        waiter.timed_out.store(true, Ordering::Release);
        if let Some(pthread) = *self.poller_pthread.try_lock().unwrap() {
            crate::signal::kick(pthread);
        }
        self.retire(&waiter, WaitOutcome::TimedOut);
    }

    /// Remove `waiter` from the set and wake its task with `outcome`
    /// (§4.J step 4/5).
    fn retire(&self, waiter: &Arc<Waiter>, outcome: WaitOutcome) {
        let mut waiters = self.waiters.lock().unwrap();
        let was_present = {
            let before = waiters.len();
            waiters.retain(|w| w.id != waiter.id);
            waiters.len() != before
        };
        drop(waiters);
        if !was_present {
            return;
        }
        *waiter.outcome.lock().unwrap() = Some(outcome);
        if let Some(event) = waiter.timeout_event.lock().unwrap().take() {
            crate::runtime::Runtime::global().events.cancel(event);
        }
        // The poller retires its own waiter from inside `run_poll_iteration`,
        // synchronously, on its own still-running coroutine: enqueuing it
        // onto the ready queue here would make it schedulable a second time
        // while it's still executing. Its `wait()` loop already rechecks
        // `take_outcome` right after this call returns, so there's nothing
        // to wake for that case; every other waiter is genuinely parked and
        // must be woken.
        let is_self = processor::current_task().map(|t| Arc::ptr_eq(&t, &waiter.task)).unwrap_or(false);
        if !is_self {
            waiter.task.wake();
        }
    }

    /// Run one `select` call on behalf of every currently-registered
    /// waiter (§4.J steps 3-6), blocking for at most the shortest pending
    /// timeout (or indefinitely if none).
    pub fn run_poll_iteration(&self, cluster: &Arc<Cluster>) {
        self.run_poll_iteration_with_timeout(cluster, None)
    }

    fn run_poll_iteration_with_timeout(&self, _cluster: &Arc<Cluster>, force_timeout: Option<Duration>) {
        let waiters = self.waiters.lock().unwrap().clone();
        if waiters.is_empty() {
            return;
        }

        let mut read_set = FdSet::new();
        let mut write_set = FdSet::new();
        let mut except_set = FdSet::new();
        let mut max_fd: RawFd = -1;

        for w in &waiters {
            match &w.target {
                Target::Single(fd, mask) => {
                    union_into(*fd, *mask, &mut read_set, &mut write_set, &mut except_set);
                    max_fd = max_fd.max(*fd);
                }
                Target::Multi(targets) => {
                    for (fd, mask) in targets {
                        union_into(*fd, *mask, &mut read_set, &mut write_set, &mut except_set);
                        max_fd = max_fd.max(*fd);
                    }
                }
            }
        }

        let mut timeout = force_timeout;
        if timeout.is_none() {
            if let Some(deadline) = crate::runtime::Runtime::global().events.next_deadline() {
                let now = Instant::now();
                timeout = Some(deadline.saturating_duration_since(now));
            }
        }

        // Preemption is turned off on this processor for the duration of
        // `select` (§4.J step 3) so a timer-driven roll-forward can't try
        // to context-switch a KT that's blocked in a syscall.
        crate::spin::disable_preemption();
        *self.poller_pthread.try_lock().unwrap() = Some(unsafe { libc::pthread_self() });

        #[cfg(feature = "stats")]
        self.select_calls.fetch_add(1, Ordering::Relaxed);

        let rc = unsafe {
            let mut tv = timeout.map(|d| libc::timeval {
                tv_sec: d.as_secs() as libc::time_t,
                tv_usec: d.subsec_micros() as libc::suseconds_t,
            });
            libc::select(
                max_fd + 1,
                read_set.as_mut_ptr(),
                write_set.as_mut_ptr(),
                except_set.as_mut_ptr(),
                tv.as_mut()
                    .map(|t| t as *mut libc::timeval)
                    .unwrap_or(std::ptr::null_mut()),
            )
        };

        *self.poller_pthread.try_lock().unwrap() = None;
        crate::spin::enable_preemption();

        match rc {
            n if n >= 0 => self.dispatch_ready(&waiters, &read_set, &write_set, &except_set),
            _ => {
                let err = errno::errno();
                match err.0 {
                    libc::EINTR => {
                        // §4.J failure handling: retry after the kernel has
                        // had a chance to run any pending roll-forward.
                    }
                    libc::EBADF => {
                        log::warn!("select() returned EBADF; waking every waiter with an error");
                        for w in &waiters {
                            self.retire(w, WaitOutcome::BadFd);
                        }
                    }
                    _ => {
                        log::error!("KernelFailure: unexpected select() error {:?}", err);
                        panic!("select() failed unexpectedly: {:?}", err);
                    }
                }
            }
        }

        self.retire_timed_out(&waiters);
        self.elect_next_poller();
    }

    fn dispatch_ready(&self, waiters: &[Arc<Waiter>], r: &FdSet, w: &FdSet, e: &FdSet) {
        for waiter in waiters {
            match &waiter.target {
                Target::Single(fd, mask) => {
                    let got = Mask {
                        read: mask.read && r.is_set(*fd),
                        write: mask.write && w.is_set(*fd),
                        except: mask.except && e.is_set(*fd),
                    };
                    if got.any() {
                        self.retire(waiter, WaitOutcome::Ready(got));
                    }
                }
                Target::Multi(targets) => {
                    let mut got = Mask::default();
                    for (fd, mask) in targets {
                        got = got.union(Mask {
                            read: mask.read && r.is_set(*fd),
                            write: mask.write && w.is_set(*fd),
                            except: mask.except && e.is_set(*fd),
                        });
                    }
                    if got.any() {
                        self.retire(waiter, WaitOutcome::Ready(got));
                    }
                }
            }
        }
    }

    fn retire_timed_out(&self, waiters: &[Arc<Waiter>]) {
        for w in waiters {
            if w.timed_out.load(Ordering::Acquire) {
                self.retire(w, WaitOutcome::TimedOut);
            }
        }
    }

    /// §4.J step 6: if the current poller's own waiter was satisfied,
    /// nominate the head of whatever remains and wake it so it actually
    /// re-enters `select` on everyone's behalf (a non-poller waiter parked
    /// in `processor::schedule` otherwise never runs again).
    fn elect_next_poller(&self) {
        let mut poller = self.poller.lock().unwrap();
        let remaining = self.waiters.lock().unwrap();
        let current_still_present = poller.map(|id| remaining.iter().any(|w| w.id == id)).unwrap_or(false);
        if !current_still_present {
            let next = remaining.first().cloned();
            *poller = next.as_ref().map(|w| w.id);
            if let Some(next) = next {
                drop(remaining);
                drop(poller);
                next.task.wake();
            }
        }
    }
}

impl Default for Nbio {
    fn default() -> Self {
        Self::new()
    }
}

fn union_into(fd: RawFd, mask: Mask, r: &mut FdSet, w: &mut FdSet, e: &mut FdSet) {
    if mask.read {
        r.set(fd);
    }
    if mask.write {
        w.set(fd);
    }
    if mask.except {
        e.set(fd);
    }
}

/// Thin wrapper over `libc::fd_set`.
struct FdSet(libc::fd_set);

impl FdSet {
    fn new() -> Self {
        let mut raw = MaybeUninit::<libc::fd_set>::uninit();
        unsafe {
            libc::FD_ZERO(raw.as_mut_ptr());
            Self(raw.assume_init())
        }
    }

    fn set(&mut self, fd: RawFd) {
        unsafe { libc::FD_SET(fd, &mut self.0) };
    }

    fn is_set(&self, fd: RawFd) -> bool {
        unsafe { libc::FD_ISSET(fd, &self.0) }
    }

    fn as_mut_ptr(&mut self) -> *mut libc::fd_set {
        &mut self.0
    }
}
