//! Coroutine lifecycle (§3 "Coroutine", §4.A, §4.J "Coroutine/Task
//! lifecycle").
//!
//! A [`Coroutine`] is the unit the machine-context layer switches between.
//! [`crate::task::Task`] layers scheduler-visible thread state on top of
//! one.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::context::{Context, Stack};
use crate::error::AsyncEvent;

/// Unique, process-wide coroutine id, used for `starter`/`last_resumer`
/// bookkeeping without holding a live reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoroutineId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl CoroutineId {
    fn fresh() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Run state of a coroutine (§3 invariant: `Active` iff currently on some
/// KT's running position; `Halt` is terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Start,
    Active,
    Inactive,
    Halt,
}

/// Whether cancellation is honored only at `asyncpoll` points, or at any
/// point (§5 "Cancellation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelType {
    Poll,
    Implicit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelEnable {
    Enabled,
    Disabled,
}

#[derive(Debug, Default)]
struct CancelFlags {
    requested: bool,
    in_progress: bool,
}

/// A stackful, suspendable routine switched via [`Context`].
pub struct Coroutine {
    id: CoroutineId,
    ctx: UnsafeCell<Context>,
    state: Cell<RunState>,
    starter: Cell<Option<CoroutineId>>,
    last_resumer: Cell<Option<CoroutineId>>,
    cancel_enable: Cell<CancelEnable>,
    cancel_type: Cell<CancelType>,
    cancel: RefCell<CancelFlags>,
    pending: RefCell<VecDeque<AsyncEvent>>,
    body: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
    on_halt: UnsafeCell<Option<Box<dyn FnOnce() -> ! + Send>>>,
}

// Safety: a `Coroutine` is only ever actively running on the one OS thread
// that holds the corresponding `Context`; `Task`/`Cluster` serialize all
// other access behind their own locks.
unsafe impl Sync for Coroutine {}
unsafe impl Send for Coroutine {}

impl Coroutine {
    /// Build a coroutine with its own stack, ready to run `body` on first
    /// resume. `on_halt` runs immediately after `body` returns or panics,
    /// on the coroutine's own stack, and must never return (it's the task
    /// layer's `exit_and_dispatch`); this keeps the halt-then-dispatch
    /// sequencing out of this module, which knows nothing about tasks or
    /// processors.
    ///
    /// The coroutine is allocated in a `Box` and leaked into a raw pointer
    /// because the trampoline needs a stable address before the `Context`
    /// is constructed; ownership is returned to the caller as a `Box`.
    pub fn new(
        stack: Stack,
        body: impl FnOnce() + Send + 'static,
        on_halt: impl FnOnce() -> ! + Send + 'static,
    ) -> Box<Self> {
        let uninit = Box::new(Self {
            id: CoroutineId::fresh(),
            // Placeholder; replaced below once we know our own address.
            ctx: UnsafeCell::new(Context::native()),
            state: Cell::new(RunState::Start),
            starter: Cell::new(None),
            last_resumer: Cell::new(None),
            cancel_enable: Cell::new(CancelEnable::Enabled),
            cancel_type: Cell::new(CancelType::Poll),
            cancel: RefCell::new(CancelFlags::default()),
            pending: RefCell::new(VecDeque::new()),
            body: UnsafeCell::new(Some(Box::new(body))),
            on_halt: UnsafeCell::new(Some(Box::new(on_halt))),
        });
        let raw = Box::into_raw(uninit);
        // Safety: `raw` is a unique, live allocation; no one else observes
        // it until we return the `Box` below.
        let ctx = unsafe { Context::new(stack, invoke, raw as usize) };
        unsafe { *(*raw).ctx.get() = ctx };
        unsafe { Box::from_raw(raw) }
    }

    pub fn id(&self) -> CoroutineId {
        self.id
    }

    pub fn state(&self) -> RunState {
        self.state.get()
    }

    pub fn starter(&self) -> Option<CoroutineId> {
        self.starter.get()
    }

    pub fn last_resumer(&self) -> Option<CoroutineId> {
        self.last_resumer.get()
    }

    /// Resume this coroutine from `from`, which becomes its `last_resumer`
    /// (and, the first time, its `starter`).
    ///
    /// # Safety
    /// `from` must be the context of the OS thread calling this.
    pub unsafe fn resume_from(&self, from: &Context, resumer: CoroutineId) {
        assert_ne!(self.state.get(), RunState::Halt, "resuming a halted coroutine");
        if self.starter.get().is_none() {
            self.starter.set(Some(resumer));
        }
        self.last_resumer.set(Some(resumer));
        self.state.set(RunState::Active);
        let to = unsafe { &*self.ctx.get() };
        unsafe { Context::switch(from, to) };
        // Execution resumes here once this coroutine suspends or halts.
    }

    /// Suspend the currently-active coroutine, switching back to `to`.
    ///
    /// # Safety
    /// Must be called from inside this coroutine's own execution.
    pub unsafe fn suspend_to(&self, to: &Context) {
        self.state.set(RunState::Inactive);
        let from = unsafe { &*self.ctx.get() };
        unsafe { Context::switch(from, to) };
    }

    /// Run the coroutine's body, catching panics and converting them into
    /// an `UnhandledException` posted to the starter, mark `Halt`, then run
    /// `on_halt` (never returns). Called once, from [`invoke`].
    fn run_body(&self) -> ! {
        let body = unsafe { (*self.body.get()).take() }
            .expect("coroutine body already consumed");
        let result = panic::catch_unwind(AssertUnwindSafe(body));
        self.state.set(RunState::Halt);
        if result.is_err() {
            self.pending.borrow_mut().push_back(AsyncEvent::UnhandledException);
        }
        let on_halt = unsafe { (*self.on_halt.get()).take() }
            .expect("coroutine halted twice");
        on_halt()
    }

    /// Request cancellation. Honored immediately if `Implicit`, otherwise
    /// deferred until the next `asyncpoll` (§5).
    pub fn cancel(&self) {
        self.cancel.borrow_mut().requested = true;
        if self.cancel_type.get() == CancelType::Implicit
            && self.cancel_enable.get() == CancelEnable::Enabled
        {
            self.pending.borrow_mut().push_back(AsyncEvent::UnwindStack);
        }
    }

    pub fn set_cancel_type(&self, ty: CancelType) {
        self.cancel_type.set(ty);
    }

    pub fn set_cancel_enable(&self, enable: CancelEnable) {
        self.cancel_enable.set(enable);
    }

    /// Explicit cancellation/async-event checkpoint. Returns the next
    /// buffered event, if any, consuming it.
    pub fn poll_cancellation(&self) -> Option<AsyncEvent> {
        if self.cancel_enable.get() != CancelEnable::Enabled {
            return None;
        }
        if self.cancel.borrow().requested && !self.cancel.borrow().in_progress {
            self.cancel.borrow_mut().in_progress = true;
            return Some(AsyncEvent::UnwindStack);
        }
        self.pending.borrow_mut().pop_front()
    }

    /// Buffer an asynchronous event for delivery at this coroutine's next
    /// `asyncpoll` (used for `RendezvousFailure`, §4.G).
    pub fn post_async_event(&self, event: AsyncEvent) {
        self.pending.borrow_mut().push_back(event);
    }
}

/// The trampoline target passed to `Context::new`: reconstructs the
/// `Coroutine`, runs its body, and on halt runs `on_halt`, which dispatches
/// away for good and never returns here.
unsafe fn invoke(arg: usize) {
    let coroutine = unsafe { &*(arg as *const Coroutine) };
    coroutine.run_body();
}
