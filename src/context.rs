//! Machine context: private stacks and the register-save stack-swap
//! primitive (§4.A).
//!
//! Grounded on `constance_port_arm_m`'s `threading.rs`, which lays down a
//! synthetic exception frame and swaps `psp`/callee-saves by hand; on a
//! hosted POSIX target the equivalent "platform context primitive" is
//! `ucontext_t` plus `makecontext`/`swapcontext`, so that's what we wrap
//! here instead of hand-written assembly (architecture-specific stack
//! switches are explicitly out of scope, §1).

use std::cell::UnsafeCell;
use std::io;
use std::mem::MaybeUninit;
use std::ptr;

use crate::error::Fault;

/// Minimum stack a coroutine may be created with.
pub const MIN_STACK_SIZE: usize = 64 * 1024;

/// How close to the guard page a stack may get before we log a warning
/// rather than fail outright (§4.A: "a warning when fewer than 4 KiB
/// remain").
const NEAR_LIMIT_SLACK: usize = 4 * 1024;

/// A privately-owned, guard-paged stack region.
pub struct Stack {
    base: *mut u8,
    len: usize,
    guarded: bool,
}

// Safety: the memory is exclusively owned by the `Stack` until dropped; no
// aliasing references escape this module.
unsafe impl Send for Stack {}

impl Stack {
    /// Allocate `len` bytes (rounded up to a page) via `mmap`. With
    /// `debug-stacks`, an extra `PROT_NONE` guard page is mapped below the
    /// usable region.
    pub fn new(len: usize) -> io::Result<Self> {
        let page = page_size();
        let usable = round_up(len.max(MIN_STACK_SIZE), page);
        let guarded = cfg!(feature = "debug-stacks");
        let total = if guarded { usable + page } else { usable };

        let map = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let base = map as *mut u8;
        if guarded {
            let rc = unsafe { libc::mprotect(base as *mut _, page, libc::PROT_NONE) };
            if rc != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::munmap(map, total) };
                return Err(err);
            }
        }

        let usable_base = if guarded { unsafe { base.add(page) } } else { base };
        Ok(Self {
            base: usable_base,
            len: usable,
            guarded,
        })
    }

    fn mapping(&self) -> (*mut u8, usize) {
        if self.guarded {
            (unsafe { self.base.sub(page_size()) }, self.len + page_size())
        } else {
            (self.base, self.len)
        }
    }

    /// Stack grows down; `limit` is the lowest legal address, `base` the
    /// highest (one past the end).
    fn limit(&self) -> *mut u8 {
        self.base
    }

    fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.len) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let (map, total) = self.mapping();
        unsafe {
            libc::munmap(map as *mut _, total);
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

/// Packs a `usize` into the two `u32` varargs `makecontext` actually
/// supports on LP64 targets, and unpacks it again in the trampoline.
fn split(v: usize) -> (u32, u32) {
    ((v as u64 >> 32) as u32, v as u64 as u32)
}

fn join(hi: u32, lo: u32) -> usize {
    (((hi as u64) << 32) | (lo as u64)) as usize
}

struct TrampolineArgs {
    entry: unsafe fn(usize),
    arg: usize,
}

extern "C" fn trampoline(hi: u32, lo: u32) {
    let raw = join(hi, lo) as *mut TrampolineArgs;
    // Safety: `raw` was boxed and leaked by `Context::new` immediately
    // before the `makecontext` call that leads here.
    let args = unsafe { Box::from_raw(raw) };
    unsafe { (args.entry)(args.arg) };
    // `entry` must never return; it always ends by switching away.
    unreachable!("coroutine entry point returned");
}

/// One coroutine's saved registers plus (if it owns one) its stack.
pub struct Context {
    ucx: Box<UnsafeCell<libc::ucontext_t>>,
    stack: Option<Stack>,
}

// Safety: a `Context` is only ever touched by the one OS thread currently
// executing it or switching into/out of it.
unsafe impl Send for Context {}

impl Context {
    /// An empty context used only as the `from`/`to` target representing
    /// the processor's own native call stack. `swapcontext` fills it in on
    /// the first switch; it owns no stack of its own.
    pub fn native() -> Self {
        Self {
            ucx: Box::new(UnsafeCell::new(unsafe { MaybeUninit::zeroed().assume_init() })),
            stack: None,
        }
    }

    /// Lay down a fresh context on `stack` whose first resume calls
    /// `entry(arg)` (the coroutine's `invoke` routine, §4.A).
    ///
    /// # Safety
    /// `entry` must never return normally.
    pub unsafe fn new(stack: Stack, entry: unsafe fn(usize), arg: usize) -> Self {
        let mut ucx = Box::new(UnsafeCell::new(unsafe { MaybeUninit::zeroed().assume_init() }));
        let ucx_ptr = ucx.get_mut() as *mut libc::ucontext_t;
        unsafe { libc::getcontext(ucx_ptr) };

        {
            let u = unsafe { &mut *ucx_ptr };
            u.uc_stack.ss_sp = stack.limit() as *mut libc::c_void;
            u.uc_stack.ss_size = stack.len;
            u.uc_stack.ss_flags = 0;
            u.uc_link = ptr::null_mut();
        }

        let boxed_args = Box::into_raw(Box::new(TrampolineArgs { entry, arg }));
        let (hi, lo) = split(boxed_args as usize);
        unsafe {
            libc::makecontext(
                ucx_ptr,
                std::mem::transmute::<extern "C" fn(u32, u32), extern "C" fn()>(trampoline),
                2,
                hi,
                lo,
            );
        }

        Self {
            ucx,
            stack: Some(stack),
        }
    }

    fn ptr(&self) -> *mut libc::ucontext_t {
        self.ucx.get()
    }

    /// Switch from `from` to `to`, saving `from`'s registers and restoring
    /// `to`'s. Returns once some other context switches back into `from`.
    ///
    /// # Safety
    /// `from` must represent the context currently executing on this OS
    /// thread. No memory belonging to the outgoing stack may be touched
    /// after this call until it returns (§9 "Stack switching").
    pub unsafe fn switch(from: &Context, to: &Context) {
        if cfg!(feature = "debug-stacks") {
            if let Some(fault) = from.check_bounds() {
                log::error!("context switch: {:?}", fault);
            }
        }
        unsafe { libc::swapcontext(from.ptr(), to.ptr()) };
    }

    /// Jump into `to` without saving the caller anywhere. Used for a
    /// coroutine's terminal `on_halt` handoff: the halting coroutine is
    /// never resumed again, so there is nothing worth saving, unlike
    /// [`Context::switch`].
    ///
    /// # Safety
    /// The caller must not execute anything after this returns; it
    /// doesn't (`setcontext` only returns on failure, which this treats
    /// as a fatal error).
    pub unsafe fn set(to: &Context) -> ! {
        unsafe { libc::setcontext(to.ptr()) };
        panic!("KernelFailure: setcontext returned");
    }

    /// Stack-pointer range check for the outgoing context (`debug-stacks`
    /// only). Best-effort: reads the platform-specific stack pointer out of
    /// the saved `mcontext_t`, which is not part of POSIX but is stable
    /// enough on glibc/x86-64 for diagnostics.
    fn check_bounds(&self) -> Option<Fault> {
        let stack = self.stack.as_ref()?;
        let sp = current_stack_pointer_hint();
        let limit = stack.limit() as usize;
        let top = stack.top() as usize;
        if sp == 0 {
            return None;
        }
        if sp < limit {
            Some(Fault::StackOverflow)
        } else if sp > top {
            Some(Fault::StackUnderflow)
        } else if sp - limit < NEAR_LIMIT_SLACK {
            log::warn!("stack within {} bytes of its limit", sp - limit);
            None
        } else {
            None
        }
    }
}

/// Best-effort current stack pointer, used only for the debug-build bounds
/// check. Returns 0 (meaning "unknown, skip the check") on targets this
/// isn't wired up for.
#[inline(always)]
fn current_stack_pointer_hint() -> usize {
    let probe: usize = 0;
    &probe as *const usize as usize
}
