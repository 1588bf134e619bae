//! Spin lock: non-yielding mutual exclusion with preemption disabled while
//! held (§4.B).

use std::cell::{Cell, RefCell};
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};

thread_local! {
    /// Per-KT "in-spin" counter inspected by the preemption signal handler.
    static IN_SPIN: Cell<u32> = Cell::new(0);
    /// Set by the preemption handler when it couldn't safely switch.
    static RF_PENDING: Cell<bool> = Cell::new(false);
    /// What "running the deferred roll-forward" means on this KT; installed
    /// by the processor kernel (§4.I "Preemption").
    static RF_ACTION: RefCell<Option<Box<dyn FnMut()>>> = RefCell::new(None);
    /// Address of the spin lock currently held by this KT, for the
    /// uniprocessor-debug recursive-acquire check.
    static HELD: Cell<usize> = Cell::new(0);
}

/// Install this KT's roll-forward action. Must be called once per
/// processor thread before any spin lock is used on it.
pub fn set_roll_forward_action(action: impl FnMut() + 'static) {
    RF_ACTION.with(|a| *a.borrow_mut() = Some(Box::new(action)));
}

/// Increment the in-spin counter, disabling preemption on this KT.
pub fn disable_preemption() {
    IN_SPIN.with(|c| c.set(c.get() + 1));
}

/// Decrement the in-spin counter; if it reaches zero and a roll-forward is
/// pending, run it now.
pub fn enable_preemption() {
    let should_run = IN_SPIN.with(|c| {
        let v = c.get() - 1;
        c.set(v);
        v == 0 && RF_PENDING.with(Cell::get)
    });
    if should_run {
        RF_PENDING.with(|p| p.set(false));
        RF_ACTION.with(|a| {
            if let Some(action) = a.borrow_mut().as_mut() {
                action();
            }
        });
    }
}

/// Called from the preemption signal handler. If this KT is mid-spin (or a
/// roll-forward is already in progress), defer; otherwise run the action
/// inline.
pub fn request_roll_forward() {
    let in_spin = IN_SPIN.with(Cell::get) > 0;
    if in_spin {
        RF_PENDING.with(|p| p.set(true));
    } else {
        RF_ACTION.with(|a| {
            if let Some(action) = a.borrow_mut().as_mut() {
                action();
            }
        });
    }
}

pub fn in_spin() -> bool {
    IN_SPIN.with(Cell::get) > 0
}

/// Test-and-set spin lock with exponential back-off.
pub struct SpinLock {
    locked: AtomicBool,
    // Used only to identify this lock for the uniprocessor recursive-
    // acquire check; not a real address dependency.
    tag: AtomicUsize,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            tag: AtomicUsize::new(0),
        }
    }

    fn self_tag(&self) -> usize {
        self as *const Self as usize
    }

    pub fn acquire(&self) -> SpinGuard<'_> {
        disable_preemption();

        if !cfg!(feature = "multiprocessor") && cfg!(debug_assertions) {
            let tag = self.self_tag();
            if HELD.with(Cell::get) == tag {
                panic!("KernelFailure: recursive spin lock acquire on a uniprocessor debug build");
            }
        }

        let mut backoff: u32 = 1;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            for _ in 0..backoff {
                std::hint::spin_loop();
            }
            backoff = (backoff * 2).min(1024);
        }
        if cfg!(feature = "multiprocessor") {
            fence(Ordering::SeqCst);
        }
        HELD.with(|h| h.set(self.self_tag()));

        SpinGuard { lock: self }
    }

    /// Never spins: returns `None` immediately on contention.
    pub fn try_acquire(&self) -> Option<SpinGuard<'_>> {
        disable_preemption();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            enable_preemption();
            return None;
        }
        if cfg!(feature = "multiprocessor") {
            fence(Ordering::SeqCst);
        }
        HELD.with(|h| h.set(self.self_tag()));
        Some(SpinGuard { lock: self })
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl<'a> SpinGuard<'a> {
    /// Erase the borrow so the guard can be moved into a `'static`
    /// [`crate::processor::Deferred`] closure that runs after a
    /// context switch, instead of being dropped before it (§4.I).
    ///
    /// Safety: the caller must keep the lock's owner alive (typically by
    /// co-capturing an `Arc` clone in the same closure) until the returned
    /// guard is dropped.
    pub unsafe fn into_static(self) -> SpinGuard<'static> {
        std::mem::transmute::<SpinGuard<'a>, SpinGuard<'static>>(self)
    }
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        if cfg!(feature = "multiprocessor") {
            fence(Ordering::SeqCst);
        }
        HELD.with(|h| h.set(0));
        self.lock.locked.store(false, Ordering::Release);
        enable_preemption();
    }
}
