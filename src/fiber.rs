//! Stackful cooperative coroutines.
//!
//! A [`Fiber`] owns a private call stack and a saved machine context.
//! [`Fiber::resume`] swaps the current thread into the fiber;
//! [`yield_to_hold`]/[`yield_to_ready`] swap back out to the thread's
//! scheduler-main fiber, leaving the fiber parked (`Hold`) or requeueable
//! (`Ready`). Because the whole call stack is preserved across a yield, a
//! hooked syscall can suspend the fiber from arbitrarily deep in user code
//! without any annotation at the call sites.
//!
//! Every OS thread lazily gets a *root* fiber representing its original
//! stack; the scheduler designates one fiber per worker thread as the
//! *scheduler-main* fiber that all other fibers swap back to. Exactly one
//! fiber per thread is running at any instant.
//!
//! ```
//! use weft::fiber::{self, Fiber, FiberState};
//!
//! let f = Fiber::new(|| {
//!     fiber::yield_to_hold();
//! }, 0, false);
//! f.resume();
//! assert_eq!(f.state(), FiberState::Hold);
//! f.resume();
//! assert_eq!(f.state(), FiberState::Term);
//! ```

use std::alloc::{self, Layout};
use std::cell::{RefCell, UnsafeCell};
use std::os::raw::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::config::{self, ConfigVar};

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

static STACK_SIZE: Lazy<Arc<ConfigVar<u32>>> =
    Lazy::new(|| config::lookup("fiber.stack_size", 1024 * 1024, "fiber stack size"));

thread_local! {
    /// The fiber currently executing on this thread.
    static CURRENT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    /// The fiber representing this thread's original stack.
    static THREAD_ROOT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    /// The fiber running the worker loop, target of plain yields.
    static SCHED_MAIN: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

////////////////////////////////////////////////////////////////////////////////
// FiberState
////////////////////////////////////////////////////////////////////////////////

/// Lifecycle state of a [`Fiber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Prepared (or re-prepared via [`Fiber::reset`]) but never resumed.
    Init = 0,
    /// Yielded, wants to be rescheduled.
    Ready = 1,
    /// Currently running on some thread.
    Exec = 2,
    /// Yielded, parked until something reschedules it explicitly.
    Hold = 3,
    /// Entry function returned.
    Term = 4,
    /// Entry function panicked; the panic was contained in the trampoline.
    Except = 5,
}

impl FiberState {
    fn from_u8(v: u8) -> FiberState {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Exec,
            3 => FiberState::Hold,
            4 => FiberState::Term,
            5 => FiberState::Except,
            _ => unreachable!("invalid fiber state {}", v),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Stack
////////////////////////////////////////////////////////////////////////////////

struct Stack {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Stack {
    fn new(size: usize) -> Stack {
        // below one page there is no room for even the trampoline frame
        let size = size.max(4096);
        let layout = Layout::from_size_align(size, 16).expect("fiber stack layout");
        let ptr = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(ptr).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Stack { ptr, layout }
    }

    fn bottom(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

type Entry = Box<dyn FnOnce() + Send + 'static>;

/// A stackful coroutine.
///
/// Handles are `Arc`-shared: the scheduler queue, event slots and timers
/// each hold a clone, and resumption consumes the queue's clone.
pub struct Fiber {
    id: u64,
    use_caller: bool,
    state: AtomicU8,
    stack: Option<Stack>,
    ctx: UnsafeCell<libc::ucontext_t>,
    entry: UnsafeCell<Option<Entry>>,
}

// SAFETY: fiber handles travel between worker threads through the
// scheduler queue and event slots, but the context, stack and entry of a
// fiber are only ever touched by the single thread currently resuming it;
// the hand-off happens under the queue mutex (or the per-slot mutex),
// which publishes all prior writes. The state word is atomic.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a fiber running `f` on a private stack.
    ///
    /// `stack_size == 0` uses the `fiber.stack_size` config value. A fiber
    /// built with `use_caller` swaps against the thread's root fiber
    /// instead of the scheduler-main fiber; the scheduler uses this for
    /// the worker loop it runs on the constructing thread.
    pub fn new<F>(f: F, stack_size: usize, use_caller: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from_boxed(Box::new(f), stack_size, use_caller)
    }

    pub(crate) fn from_boxed(entry: Entry, stack_size: usize, use_caller: bool) -> Arc<Fiber> {
        let stack_size = if stack_size == 0 {
            STACK_SIZE.value() as usize
        } else {
            stack_size
        };
        let fiber = Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed) + 1,
            use_caller,
            state: AtomicU8::new(FiberState::Init as u8),
            stack: Some(Stack::new(stack_size)),
            ctx: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            entry: UnsafeCell::new(Some(entry)),
        };
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        unsafe { fiber.rewind() };
        log::debug!("fiber {} created", fiber.id);
        Arc::new(fiber)
    }

    /// The fiber standing in for the thread's original stack.
    fn new_root() -> Fiber {
        let fiber = Fiber {
            id: 0,
            use_caller: false,
            state: AtomicU8::new(FiberState::Exec as u8),
            stack: None,
            ctx: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            entry: UnsafeCell::new(None),
        };
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        let rc = unsafe { libc::getcontext(fiber.ctx.get()) };
        assert_eq!(rc, 0, "getcontext failed");
        fiber
    }

    /// Points the saved context at the trampoline again, reusing the stack.
    unsafe fn rewind(&self) {
        let ctx = self.ctx.get();
        let rc = libc::getcontext(ctx);
        assert_eq!(rc, 0, "getcontext failed");
        let stack = self.stack.as_ref().expect("rewinding a stackless fiber");
        (*ctx).uc_link = ptr::null_mut();
        (*ctx).uc_stack.ss_sp = stack.bottom() as *mut c_void;
        (*ctx).uc_stack.ss_size = stack.size();
        libc::makecontext(ctx, fiber_main, 0);
    }

    /// Re-initializes a finished fiber in place with a new entry function.
    ///
    /// Only valid from `Init`, `Term` or `Except`; the stack is reused.
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(f))
    }

    pub(crate) fn reset_boxed(&self, entry: Entry) {
        assert!(self.stack.is_some(), "cannot reset a thread-root fiber");
        let state = self.state();
        assert!(
            matches!(
                state,
                FiberState::Init | FiberState::Term | FiberState::Except
            ),
            "cannot reset fiber {} in state {:?}",
            self.id,
            state
        );
        unsafe {
            *self.entry.get() = Some(entry);
            self.rewind();
        }
        self.set_state(FiberState::Init);
    }

    /// Swaps the current thread into this fiber.
    ///
    /// Must be called from the thread's scheduler-main (or root) fiber.
    /// Returns when the fiber yields or finishes; inspect [`state`] to
    /// find out which.
    ///
    /// [`state`]: Self::state
    pub fn resume(self: &Arc<Self>) {
        let state = self.state();
        assert_ne!(state, FiberState::Exec, "fiber {} is already running", self.id);
        if self.use_caller {
            // worker-loop fiber on the constructing thread: swap against
            // the thread root, not the scheduler-main (which is `self`)
            let root = current_root();
            set_current(Some(self.clone()));
            self.set_state(FiberState::Exec);
            unsafe { swap(root.ctx.get(), self.ctx.get()) };
        } else {
            let main = sched_main_or_root();
            set_current(Some(self.clone()));
            self.set_state(FiberState::Exec);
            unsafe { swap(main.ctx.get(), self.ctx.get()) };
        }
    }

    /// Swaps this fiber out to its return point without touching state.
    fn swap_out(&self) {
        if self.use_caller {
            let root = current_root();
            set_current(Some(root.clone()));
            unsafe { swap(self.ctx.get(), root.ctx.get()) };
        } else {
            let main = sched_main_or_root();
            set_current(Some(main.clone()));
            unsafe { swap(self.ctx.get(), main.ctx.get()) };
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// The fiber currently running on this thread, creating the thread's
    /// root fiber on first use.
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = CURRENT.with(|c| c.borrow().clone()) {
            return f;
        }
        let root = Arc::new(Fiber::new_root());
        THREAD_ROOT.with(|c| *c.borrow_mut() = Some(root.clone()));
        set_current(Some(root.clone()));
        root
    }

    /// Id of the current fiber, 0 when called from a thread root.
    pub fn current_id() -> u64 {
        CURRENT.with(|c| c.borrow().as_ref().map(|f| f.id).unwrap_or(0))
    }

    /// Number of live fibers in the process (roots included).
    pub fn count() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            let state = self.state();
            assert!(
                matches!(
                    state,
                    FiberState::Init | FiberState::Term | FiberState::Except
                ),
                "fiber {} dropped in state {:?}",
                self.id,
                state
            );
        }
        log::debug!("fiber {} destroyed", self.id);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Yields
////////////////////////////////////////////////////////////////////////////////

/// Parks the current fiber: swap out with state `Hold`.
///
/// The fiber will not run again until an event slot, timer or explicit
/// `schedule` hands it back to a worker.
pub fn yield_to_hold() {
    yield_with(FiberState::Hold)
}

/// Swaps out with state `Ready`; the worker loop requeues the fiber.
pub fn yield_to_ready() {
    yield_with(FiberState::Ready)
}

fn yield_with(state: FiberState) {
    let cur = CURRENT
        .with(|c| c.borrow().clone())
        .expect("yield outside of any fiber");
    debug_assert_eq!(cur.state(), FiberState::Exec);
    cur.set_state(state);
    cur.swap_out();
}

////////////////////////////////////////////////////////////////////////////////
// Thread-local plumbing
////////////////////////////////////////////////////////////////////////////////

fn set_current(f: Option<Arc<Fiber>>) {
    CURRENT.with(|c| *c.borrow_mut() = f);
}

/// Installs the fiber plain yields on this thread swap back to.
pub(crate) fn set_sched_main(f: Option<Arc<Fiber>>) {
    SCHED_MAIN.with(|c| *c.borrow_mut() = f);
}

fn sched_main_or_root() -> Arc<Fiber> {
    if let Some(f) = SCHED_MAIN.with(|c| c.borrow().clone()) {
        return f;
    }
    current_root()
}

fn current_root() -> Arc<Fiber> {
    Fiber::current();
    THREAD_ROOT
        .with(|c| c.borrow().clone())
        .expect("thread root fiber not initialized")
}

unsafe fn swap(from: *mut libc::ucontext_t, to: *mut libc::ucontext_t) {
    let rc = libc::swapcontext(from, to);
    assert_eq!(rc, 0, "swapcontext failed");
}

////////////////////////////////////////////////////////////////////////////////
// Trampoline
////////////////////////////////////////////////////////////////////////////////

extern "C" fn fiber_main() {
    let cur = Fiber::current();
    debug_assert_eq!(cur.state(), FiberState::Exec);
    let entry = unsafe { (*cur.entry.get()).take() };
    debug_assert!(entry.is_some(), "fiber {} resumed without an entry", cur.id);
    if let Some(entry) = entry {
        match panic::catch_unwind(AssertUnwindSafe(entry)) {
            Ok(()) => cur.set_state(FiberState::Term),
            Err(payload) => {
                cur.set_state(FiberState::Except);
                log::error!(
                    "fiber {} panicked: {}",
                    cur.id,
                    panic_message(payload.as_ref())
                );
            }
        }
    } else {
        cur.set_state(FiberState::Term);
    }

    // drop our strong handle before the terminal swap; the resumer on the
    // other side of the swap still holds one
    let raw: *const Fiber = Arc::as_ptr(&cur);
    drop(cur);
    unsafe { (*raw).swap_out() };

    log::error!("terminated fiber {} resumed again", unsafe { (*raw).id });
    std::process::abort();
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}
