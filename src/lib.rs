//! Weft is a C10K-style cooperative networking core: a small pool of OS
//! threads multiplexed over many stackful [fibers](fiber), an epoll-backed
//! [reactor] that parks fibers on descriptor readiness, and a
//! deadline-ordered [timer] set racing against the epoll waits.
//!
//! The pieces, leaves first:
//!
//! - [Fibers](fiber): stackful coroutines with explicit `resume`/`yield`
//! - [Scheduler](scheduler): thread pool draining a shared task queue
//! - [Timers](timer): one-shot, recurring and condition timers
//! - [Reactor](reactor): scheduler + timers + epoll + wake pipe
//! - [Fd registry](fd): per-descriptor socket/non-blocking/timeout state
//! - [Hooked syscalls](hook): blocking POSIX calls turned into fiber parks
//! - [Cooperative TCP](net): thin stream/listener types over the hook layer
//!
//! A hooked call on a worker thread first tries the raw non-blocking
//! syscall; on `EAGAIN` it registers interest with the current reactor,
//! optionally arms a timeout timer, and yields the calling fiber. The
//! reactor's idle fiber blocks in `epoll_wait`, reschedules parked fibers
//! as events fire, and feeds expired timer callbacks back into the task
//! queue. Off worker threads every hooked call forwards verbatim.
//!
//! ```no_run
//! use weft::reactor::Reactor;
//!
//! let reactor = Reactor::new(2, false, "main").unwrap();
//! reactor.schedule(|| {
//!     // runs inside a fiber; hooked I/O in here suspends
//!     // instead of blocking the worker thread
//! });
//! reactor.stop();
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod net;
pub mod reactor;
pub mod scheduler;
pub mod timer;
pub mod util;

pub use error::{Error, Result};
pub use fiber::{Fiber, FiberState};
pub use reactor::{Event, Reactor};
pub use scheduler::{Scheduler, Task};
pub use timer::{TimerHandle, TimerSet};
