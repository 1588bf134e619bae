//! A user-level M:N concurrency runtime: lightweight tasks and coroutines
//! multiplexed over a pool of kernel threads ("processors"), with
//! monitor-style synchronisation and non-blocking I/O multiplexing hidden
//! behind ordinary blocking calls.
//!
//! The crate is organized the way the scheduling kernel it's grounded on
//! is organized: leaf primitives first, the processor kernel and cluster
//! that drive them in the middle, and the monitor core (`serial`) that
//! backs mutex objects built on top of both.
//!
//! - [`context`] / [`coroutine`] — stackful coroutines and the register
//!   save/restore that switches between them.
//! - [`task`] — scheduler-visible thread state layered on a coroutine.
//! - [`spin`], [`lock`], [`condition`], [`semaphore`] — the synchronisation
//!   primitives, cheapest first.
//! - [`priority`] — priority inheritance shared by the lock/serial layers.
//! - [`serial`] — the monitor core backing mutex objects.
//! - [`processor`], [`cluster`] — the per-KT scheduler and the group of
//!   processors it belongs to.
//! - [`nbio`] — the `select`-based I/O multiplexor, one poller per cluster.
//! - [`timer`] — the timed event list feeding timeouts and preemption.
//! - [`runtime`] — the process-wide singleton tying everything together.
//! - [`error`] — the failure kinds a caller (or an `asyncpoll` checkpoint)
//!   can observe.
//!
//! See `DESIGN.md` for what each module is grounded on and why.

pub mod cluster;
pub mod condition;
pub mod context;
pub mod coroutine;
pub mod error;
pub mod lock;
pub mod nbio;
pub mod priority;
pub mod processor;
pub mod runtime;
pub mod semaphore;
pub mod serial;
pub mod signal;
#[cfg(feature = "stats")]
pub mod stats;
pub mod task;
pub mod timer;

pub use cluster::{Cluster, ClusterConfig};
pub use condition::Condition;
pub use context::Stack;
pub use coroutine::{CancelEnable, CancelType};
pub use error::{AsyncEvent, Fault};
pub use lock::{Lock, OwnerLock};
pub use nbio::{Mask, WaitOutcome};
pub use processor::{current_processor, current_task, schedule, yield_now};
pub use runtime::{finishup, startup, Runtime};
pub use semaphore::Semaphore;
pub use serial::Serial;
pub use task::{Priority, Task, ThreadState};
