//! Epoll-backed I/O reactor driving a [`Scheduler`].
//!
//! The reactor owns an epoll instance, a wake pipe and one interest slot
//! pair per descriptor. [`Reactor::add_event`] registers edge-triggered
//! interest and parks either an explicit callback or the calling fiber in
//! the slot; when the descriptor turns ready (or the interest is
//! cancelled) the parker is handed back to the scheduler. A parked fiber
//! is never woken spuriously: its event fired, its timeout expired, or
//! someone cancelled it.
//!
//! The reactor is also the scheduler's idle implementation: whenever a
//! worker runs out of tasks it blocks in `epoll_wait`, bounded by the
//! earliest timer deadline, then feeds expired timer callbacks and
//! triggered parkers back into the task queue.

use std::io;
use std::os::raw::c_void;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use once_cell::sync::OnceCell;

use crate::error::Result;
use crate::fiber::{self, Fiber, FiberState};
use crate::scheduler::{Scheduler, SchedulerHooks, Task};
use crate::timer::{TimerCallback, TimerSet};
use crate::util;

bitflags::bitflags! {
    /// Readiness interest for one descriptor.
    ///
    /// The values mirror the host's `EPOLLIN`/`EPOLLOUT` bit positions so
    /// the hot path needs no translation.
    pub struct Event: u32 {
        const READ = 0x1;
        const WRITE = 0x4;
    }
}

thread_local! {
    static CURRENT_REACTOR: std::cell::RefCell<Option<Weak<Reactor>>> =
        std::cell::RefCell::new(None);
}

////////////////////////////////////////////////////////////////////////////////
// Event slots
////////////////////////////////////////////////////////////////////////////////

enum Parker {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send + 'static>),
}

#[derive(Default)]
struct EventSlot {
    sched: Option<Weak<Scheduler>>,
    parker: Option<Parker>,
}

struct FdSlotState {
    events: Event,
    read: EventSlot,
    write: EventSlot,
}

impl FdSlotState {
    fn slot_mut(&mut self, event: Event) -> &mut EventSlot {
        if event == Event::READ {
            &mut self.read
        } else if event == Event::WRITE {
            &mut self.write
        } else {
            unreachable!("single direction expected")
        }
    }
}

struct FdSlot {
    fd: RawFd,
    state: Mutex<FdSlotState>,
}

impl FdSlot {
    fn new(fd: RawFd) -> FdSlot {
        FdSlot {
            fd,
            state: Mutex::new(FdSlotState {
                events: Event::empty(),
                read: EventSlot::default(),
                write: EventSlot::default(),
            }),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Reactor
////////////////////////////////////////////////////////////////////////////////

/// Scheduler + timer set + epoll; see the [module docs](self).
pub struct Reactor {
    epfd: RawFd,
    wake_read: RawFd,
    wake_write: RawFd,
    slots: RwLock<Vec<Arc<FdSlot>>>,
    pending: AtomicUsize,
    timers: TimerSet,
    sched: OnceCell<Arc<Scheduler>>,
}

impl Reactor {
    /// Builds the epoll instance and wake pipe, wires up a scheduler with
    /// `threads` workers, and starts it.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Arc<Reactor>> {
        let epfd = util::cvt(unsafe { libc::epoll_create1(0) })?;

        let mut pipe_fds = [0 as RawFd; 2];
        util::cvt(unsafe { libc::pipe(pipe_fds.as_mut_ptr()) })?;
        let flags = util::cvt(unsafe { libc::fcntl(pipe_fds[0], libc::F_GETFL, 0) })?;
        util::cvt(unsafe {
            libc::fcntl(pipe_fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK)
        })?;

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: pipe_fds[0] as u64,
        };
        util::cvt(unsafe {
            libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev)
        })?;

        let reactor = Arc::new(Reactor {
            epfd,
            wake_read: pipe_fds[0],
            wake_write: pipe_fds[1],
            slots: RwLock::new(Vec::new()),
            pending: AtomicUsize::new(0),
            timers: TimerSet::new(),
            sched: OnceCell::new(),
        });
        reactor.grow_slots(32);

        let hooks = Box::new(ReactorHooks(Arc::downgrade(&reactor)));
        let sched = Scheduler::with_hooks(threads, use_caller, name, hooks);
        let _ = reactor.sched.set(sched);

        let weak = Arc::downgrade(&reactor);
        reactor.timers.set_front_waker(Box::new(move || {
            if let Some(reactor) = weak.upgrade() {
                reactor.tickle();
            }
        }));

        reactor.scheduler().start();
        Ok(reactor)
    }

    /// The reactor whose worker is running the calling thread, if any.
    pub fn current() -> Option<Arc<Reactor>> {
        CURRENT_REACTOR.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        self.sched.get().expect("reactor scheduler not wired up")
    }

    pub fn timers(&self) -> &TimerSet {
        &self.timers
    }

    /// Number of registered, not-yet-fired event interests.
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Queues a callback on the scheduler.
    pub fn schedule<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.scheduler().schedule(f);
    }

    /// Queues a fiber on the scheduler.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.scheduler().schedule_fiber(fiber);
    }

    /// Stops the scheduler, joining every worker thread.
    pub fn stop(&self) {
        self.scheduler().stop();
    }

    ////////////////////////////////////////////////////////////////////////
    // Event registration
    ////////////////////////////////////////////////////////////////////////

    /// Registers `event` interest on `fd`.
    ///
    /// The parker is `cb` when given, otherwise the *current fiber*, which
    /// the caller is expected to park with a hold-yield right after.
    /// Registering a direction that is already armed on this descriptor is
    /// a programming error and asserts.
    pub fn add_event(
        &self,
        fd: RawFd,
        event: Event,
        cb: Option<Box<dyn FnOnce() + Send + 'static>>,
    ) -> Result<()> {
        debug_assert!(
            event == Event::READ || event == Event::WRITE,
            "one direction per registration"
        );
        let slot = self.slot_for(fd);
        let mut state = slot.state.lock().expect("fd slot lock poisoned");
        assert!(
            !state.events.contains(event),
            "duplicate {:?} registration on fd {}",
            event,
            fd
        );

        let op = if state.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ep = libc::epoll_event {
            events: libc::EPOLLET as u32 | (state.events | event).bits(),
            u64: fd as u64,
        };
        if let Err(e) = util::cvt(unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) }) {
            let events = ep.events;
            log::error!(
                "epoll_ctl({}, {}, {}, {:#x}) failed: {}",
                self.epfd,
                op,
                fd,
                events,
                e
            );
            return Err(e.into());
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        state.events |= event;
        let dir = state.slot_mut(event);
        debug_assert!(dir.parker.is_none() && dir.sched.is_none());
        dir.sched = Scheduler::current().map(|s| Arc::downgrade(&s));
        dir.parker = Some(match cb {
            Some(cb) => Parker::Call(cb),
            None => {
                let fiber = Fiber::current();
                assert_eq!(fiber.state(), FiberState::Exec);
                Parker::Fiber(fiber)
            }
        });
        Ok(())
    }

    /// Removes `event` interest without firing the parker.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let slot = match self.lookup_slot(fd) {
            Some(slot) => slot,
            None => return false,
        };
        let mut state = slot.state.lock().expect("fd slot lock poisoned");
        if !state.events.contains(event) {
            return false;
        }
        if !self.rearm(fd, state.events & !event) {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        state.events.remove(event);
        let dir = state.slot_mut(event);
        dir.sched = None;
        dir.parker = None;
        true
    }

    /// Removes `event` interest and fires the parker immediately,
    /// signalling cancellation.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let slot = match self.lookup_slot(fd) {
            Some(slot) => slot,
            None => return false,
        };
        let mut state = slot.state.lock().expect("fd slot lock poisoned");
        if !state.events.contains(event) {
            return false;
        }
        if !self.rearm(fd, state.events & !event) {
            return false;
        }
        self.trigger_locked(&mut state, event);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Fires both parkers (if armed) and removes the descriptor from
    /// epoll.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let slot = match self.lookup_slot(fd) {
            Some(slot) => slot,
            None => return false,
        };
        let mut state = slot.state.lock().expect("fd slot lock poisoned");
        if state.events.is_empty() {
            return false;
        }
        if !self.rearm(fd, Event::empty()) {
            return false;
        }
        if state.events.contains(Event::READ) {
            self.trigger_locked(&mut state, Event::READ);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if state.events.contains(Event::WRITE) {
            self.trigger_locked(&mut state, Event::WRITE);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert!(state.events.is_empty());
        true
    }

    /// Applies the remaining interest mask to epoll (MOD or DEL).
    fn rearm(&self, fd: RawFd, left: Event) -> bool {
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ep = libc::epoll_event {
            events: libc::EPOLLET as u32 | left.bits(),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) };
        if rc != 0 {
            let events = ep.events;
            log::error!(
                "epoll_ctl({}, {}, {}, {:#x}) failed: {}",
                self.epfd,
                op,
                fd,
                events,
                io::Error::last_os_error()
            );
            return false;
        }
        true
    }

    /// Clears the slot and hands its parker to the slot's scheduler.
    fn trigger_locked(&self, state: &mut FdSlotState, event: Event) {
        debug_assert!(state.events.contains(event));
        state.events.remove(event);
        let dir = state.slot_mut(event);
        let sched = dir
            .sched
            .take()
            .and_then(|weak| weak.upgrade())
            .or_else(Scheduler::current);
        let sched = match sched {
            Some(sched) => sched,
            None => {
                log::warn!("event parker dropped: owning scheduler is gone");
                dir.parker = None;
                return;
            }
        };
        match dir.parker.take() {
            Some(Parker::Fiber(fiber)) => sched.schedule_fiber(fiber),
            Some(Parker::Call(cb)) => sched.schedule_task(Task::from_fn(cb)),
            None => {}
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Slot table
    ////////////////////////////////////////////////////////////////////////

    fn lookup_slot(&self, fd: RawFd) -> Option<Arc<FdSlot>> {
        let slots = self.slots.read().expect("slot table lock poisoned");
        slots.get(fd as usize).cloned()
    }

    fn slot_for(&self, fd: RawFd) -> Arc<FdSlot> {
        if let Some(slot) = self.lookup_slot(fd) {
            return slot;
        }
        self.grow_slots(fd as usize * 3 / 2 + 1);
        self.lookup_slot(fd).expect("slot table grew past fd")
    }

    fn grow_slots(&self, want: usize) {
        let mut slots = self.slots.write().expect("slot table lock poisoned");
        let want = want.max(32);
        while slots.len() < want {
            let next = slots.len() as RawFd;
            slots.push(Arc::new(FdSlot::new(next)));
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Scheduler hook implementations
    ////////////////////////////////////////////////////////////////////////

    /// Wakes a worker blocked in `epoll_wait`, if there is one.
    fn tickle(&self) {
        let sched = match self.sched.get() {
            Some(sched) => sched,
            None => return,
        };
        if !sched.has_idle_threads() {
            return;
        }
        let rc = unsafe { libc::write(self.wake_write, b"T".as_ptr() as *const c_void, 1) };
        debug_assert_eq!(rc, 1);
    }

    fn stopping_check(&self, sched: &Scheduler, next_timeout: &mut Option<u64>) -> bool {
        *next_timeout = self.timers.next_timeout_ms();
        next_timeout.is_none()
            && self.pending.load(Ordering::SeqCst) == 0
            && sched.base_stopping()
    }

    fn idle(&self, sched: &Scheduler) {
        log::debug!("reactor {} idle loop starting", sched.name());
        const MAX_EVENTS: usize = 64;
        const MAX_TIMEOUT_MS: u64 = 3000;
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            let mut next_timeout = None;
            if self.stopping_check(sched, &mut next_timeout) {
                log::info!("reactor {} idle loop exiting", sched.name());
                break;
            }

            let timeout = next_timeout.unwrap_or(MAX_TIMEOUT_MS).min(MAX_TIMEOUT_MS);
            let n = loop {
                let rc = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as libc::c_int,
                        timeout as libc::c_int,
                    )
                };
                if rc < 0 && util::errno() == libc::EINTR {
                    continue;
                }
                break rc;
            };
            if n < 0 {
                log::error!("epoll_wait failed: {}", io::Error::last_os_error());
            }

            let mut expired: Vec<TimerCallback> = Vec::new();
            self.timers.collect_expired(&mut expired);
            if !expired.is_empty() {
                sched.schedule_batch(
                    expired
                        .into_iter()
                        .map(|cb| Task::from_fn(move || cb())),
                );
            }

            for ev in events.iter().take(n.max(0) as usize) {
                let fd = ev.u64 as RawFd;
                if fd == self.wake_read {
                    self.drain_wake_pipe();
                    continue;
                }
                let slot = match self.lookup_slot(fd) {
                    Some(slot) => slot,
                    None => continue,
                };
                let mut state = slot.state.lock().expect("fd slot lock poisoned");

                let mut epevs = ev.events;
                // errors must be observed through a read/write retry, so
                // force both directions ready
                if epevs & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    epevs |= (libc::EPOLLIN | libc::EPOLLOUT) as u32;
                }
                let mut real = Event::empty();
                if epevs & libc::EPOLLIN as u32 != 0 {
                    real |= Event::READ;
                }
                if epevs & libc::EPOLLOUT as u32 != 0 {
                    real |= Event::WRITE;
                }
                let fire = state.events & real;
                if fire.is_empty() {
                    continue;
                }

                if !self.rearm(slot.fd, state.events & !fire) {
                    continue;
                }
                if fire.contains(Event::READ) {
                    self.trigger_locked(&mut state, Event::READ);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                if fire.contains(Event::WRITE) {
                    self.trigger_locked(&mut state, Event::WRITE);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
            }

            // hand the freshly scheduled tasks to the worker loop before
            // blocking again
            fiber::yield_to_hold();
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(self.wake_read, buf.as_mut_ptr() as *mut c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("epfd", &self.epfd)
            .field("pending", &self.pending_events())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// ReactorHooks
////////////////////////////////////////////////////////////////////////////////

/// Non-owning adapter plugging the reactor into its scheduler.
struct ReactorHooks(Weak<Reactor>);

impl SchedulerHooks for ReactorHooks {
    fn tickle(&self, _sched: &Scheduler) {
        if let Some(reactor) = self.0.upgrade() {
            reactor.tickle();
        }
    }

    fn idle(&self, sched: &Scheduler) {
        if let Some(reactor) = self.0.upgrade() {
            reactor.idle(sched);
        }
    }

    fn stopping(&self, sched: &Scheduler) -> bool {
        match self.0.upgrade() {
            Some(reactor) => {
                let mut next_timeout = None;
                reactor.stopping_check(sched, &mut next_timeout)
            }
            None => true,
        }
    }

    fn on_worker_start(&self, _sched: &Scheduler) {
        CURRENT_REACTOR.with(|c| *c.borrow_mut() = Some(self.0.clone()));
    }

    fn enable_syscall_hook(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_bits_mirror_epoll() {
        assert_eq!(Event::READ.bits(), libc::EPOLLIN as u32);
        assert_eq!(Event::WRITE.bits(), libc::EPOLLOUT as u32);
        assert_eq!(Event::empty().bits(), 0);
    }
}
