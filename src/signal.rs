//! Signal plumbing (§6 "Signals consumed").
//!
//! Handlers do the least possible work, per the roll-forward discipline in
//! [`crate::spin`]: `SIGUSR1`'s handler is nothing more than
//! `spin::request_roll_forward`, which itself decides (by inspecting the
//! per-KT in-spin counter) whether to act inline or defer. `SIGALRM`'s
//! handler only flags that the event list needs a tick; the actual
//! draining happens on the system processor's own stack, the next time its
//! scheduling loop checks `alarm_pending`, keeping the handler body
//! async-signal-safe.

use std::sync::atomic::{AtomicBool, Ordering};

static ALARM_PENDING: AtomicBool = AtomicBool::new(false);
static ABORT_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Consumed by the system processor's scheduling loop (§4.I step 4 /
/// `processor::Processor::run_loop`).
pub fn take_alarm_pending() -> bool {
    ALARM_PENDING.swap(false, Ordering::AcqRel)
}

/// Consumed the same way, for `SIGHUP`/`SIGINT`/`SIGTERM` (§6 "graceful
/// abort").
pub fn take_abort_requested() -> bool {
    ABORT_REQUESTED.swap(false, Ordering::AcqRel)
}

extern "C" fn handle_sigusr1(_: libc::c_int) {
    crate::spin::request_roll_forward();
}

extern "C" fn handle_sigalrm(_: libc::c_int) {
    ALARM_PENDING.store(true, Ordering::Release);
    crate::spin::request_roll_forward();
}

extern "C" fn handle_graceful_abort(_: libc::c_int) {
    ABORT_REQUESTED.store(true, Ordering::Release);
}

extern "C" fn handle_fatal_signal(sig: libc::c_int) {
    // Best-effort diagnostic; `log` is not async-signal-safe but this
    // path is already headed for `abort()`, matching §6's "abort with
    // diagnostic" and §7's "Signal-delivered faults ... print a stack
    // backtrace (where available) before aborting."
    let name = match sig {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGBUS => "SIGBUS",
        libc::SIGILL => "SIGILL",
        libc::SIGFPE => "SIGFPE",
        _ => "unknown fatal signal",
    };
    eprintln!("fatal signal {} received; aborting", name);
    let bt = std::backtrace::Backtrace::force_capture();
    eprintln!("{}", bt);
    unsafe { libc::_exit(134) };
}

unsafe fn install(sig: libc::c_int, handler: extern "C" fn(libc::c_int)) {
    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    sa.sa_sigaction = handler as usize;
    sa.sa_flags = libc::SA_RESTART;
    unsafe {
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(sig, &sa, std::ptr::null_mut());
    }
}

/// Installed once by the system processor (§6: "SIGALRM (system processor:
/// preemption + event-list tick)").
pub fn install_system_handlers() {
    unsafe {
        install(libc::SIGALRM, handle_sigalrm);
        install(libc::SIGUSR1, handle_sigusr1);
        install(libc::SIGHUP, handle_graceful_abort);
        install(libc::SIGINT, handle_graceful_abort);
        install(libc::SIGTERM, handle_graceful_abort);
        install(libc::SIGSEGV, handle_fatal_signal);
        install(libc::SIGBUS, handle_fatal_signal);
        install(libc::SIGILL, handle_fatal_signal);
        install(libc::SIGFPE, handle_fatal_signal);
    }
}

/// Installed by every non-system processor (§6: "SIGUSR1 (any processor:
/// preemption + wake-from-NBIO)"). `sigaction` dispositions are
/// process-wide, so this mostly just ensures the handler is installed
/// before the first `pthread_kill(SIGUSR1)` targeting this KT can race
/// ahead of it.
pub fn install_processor_handlers() {
    unsafe {
        install(libc::SIGUSR1, handle_sigusr1);
    }
}

/// Program (or reprogram) the process-wide interval timer backing
/// `SIGALRM`. Only the system processor calls this.
pub fn arm_alarm(next: std::time::Duration) {
    let it = libc::itimerval {
        it_interval: libc::timeval { tv_sec: 0, tv_usec: 0 },
        it_value: libc::timeval {
            tv_sec: next.as_secs() as libc::time_t,
            tv_usec: next.subsec_micros() as libc::suseconds_t,
        },
    };
    unsafe {
        libc::setitimer(libc::ITIMER_REAL, &it, std::ptr::null_mut());
    }
}

pub fn disarm_alarm() {
    arm_alarm(std::time::Duration::ZERO);
}

/// Send `SIGUSR1` to `pthread`, used to preempt a task or to kick a
/// processor blocked inside `select` (§4.J step 7).
pub fn kick(pthread: libc::pthread_t) {
    unsafe {
        libc::pthread_kill(pthread, libc::SIGUSR1);
    }
}
