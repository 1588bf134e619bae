//! Local failure kinds (§7).
//!
//! `KernelFailure` has no variant here: it always aborts immediately at the
//! point of detection rather than being returned or propagated.

use thiserror::Error;

/// A failure that is reported synchronously to the call site that caused it.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Entry into a monitor that has already run its destructor, or whose
    /// destructor is currently running.
    #[error("entry into a non-alive monitor")]
    EntryFailure,

    /// A condition variable was destroyed while tasks were still queued on
    /// it.
    #[error("condition destroyed with waiters still queued")]
    WaitingFailure,

    /// A blocking syscall retried by the NBIO layer returned an error other
    /// than `EWOULDBLOCK`/`EAGAIN`/`EINTR`.
    #[error("I/O failure: {0}")]
    IOFailure(errno::Errno),

    /// The outgoing stack pointer crossed the guard boundary (`debug-stacks`
    /// builds only).
    #[error("stack overflow")]
    StackOverflow,

    /// The outgoing stack pointer was above the stack's base, i.e. corrupted.
    #[error("stack underflow")]
    StackUnderflow,
}

/// An event raised asynchronously at a coroutine's next `asyncpoll`, rather
/// than returned to a call site. See §5 "Cancellation" and §7
/// "Propagation policy".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncEvent {
    /// The coroutine's cancellation flag was set; the stack must unwind.
    UnwindStack,
    /// A monitor's destructor member exited by exception without an
    /// acceptor having consumed the rendezvous.
    RendezvousFailure,
    /// A resumed coroutine's `main` returned abnormally (panicked).
    UnhandledException,
}
