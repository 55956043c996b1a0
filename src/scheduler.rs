//! Cooperative fiber scheduler over a fixed pool of OS threads.
//!
//! Each worker thread runs a *scheduler-main* fiber executing the worker
//! loop: pop a task (a fiber to resume or a callback to run in a reusable
//! fiber), run it, and fall back to the idle fiber when the queue is
//! empty. Tasks may be pinned to a specific worker by kernel thread id;
//! unpinned tasks go to whichever worker pops them first.
//!
//! The overridable surface ([`SchedulerHooks`]) is what the
//! [reactor](crate::reactor) plugs into: waking sleeping workers
//! (`tickle`), what to do when idle, and when the scheduler may actually
//! stop. The defaults busy a worker with a yield loop and make `tickle` a
//! log line.
//!
//! With `use_caller` the constructing thread is enlisted as a worker:
//! `threads - 1` extra OS threads are spawned and the caller's own worker
//! loop runs inside [`Scheduler::stop`], draining whatever is queued
//! before the call returns.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use crate::fiber::{self, Fiber, FiberState};
use crate::hook;
use crate::util;

/// Thread-affinity value accepting any worker.
pub const ANY_WORKER: libc::pid_t = -1;

thread_local! {
    static CURRENT_SCHED: std::cell::RefCell<Option<Weak<Scheduler>>> =
        std::cell::RefCell::new(None);
}

////////////////////////////////////////////////////////////////////////////////
// Task
////////////////////////////////////////////////////////////////////////////////

enum TaskKind {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send + 'static>),
}

/// A queue entry: a fiber or a callback, plus an optional worker pin.
pub struct Task {
    kind: TaskKind,
    thread: libc::pid_t,
}

impl Task {
    pub fn from_fiber(fiber: Arc<Fiber>) -> Task {
        Task {
            kind: TaskKind::Fiber(fiber),
            thread: ANY_WORKER,
        }
    }

    pub fn from_fn<F: FnOnce() + Send + 'static>(f: F) -> Task {
        Task {
            kind: TaskKind::Call(Box::new(f)),
            thread: ANY_WORKER,
        }
    }

    /// Pins the task to the worker with the given kernel thread id.
    pub fn pinned(mut self, thread: libc::pid_t) -> Task {
        self.thread = thread;
        self
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Task {
        Task::from_fiber(fiber)
    }
}

////////////////////////////////////////////////////////////////////////////////
// SchedulerHooks
////////////////////////////////////////////////////////////////////////////////

/// The overridable part of a scheduler.
pub trait SchedulerHooks: Send + Sync + 'static {
    /// Wakes a sleeping worker after new work arrived.
    fn tickle(&self, sched: &Scheduler) {
        log::debug!("scheduler {} tickle", sched.name());
    }

    /// Runs inside the per-worker idle fiber whenever the queue is empty.
    fn idle(&self, sched: &Scheduler) {
        log::debug!("scheduler {} idle", sched.name());
        while !self.stopping(sched) {
            fiber::yield_to_hold();
        }
    }

    /// Whether the worker loops may exit.
    fn stopping(&self, sched: &Scheduler) -> bool {
        sched.base_stopping()
    }

    /// Called once on every worker thread before its loop starts.
    fn on_worker_start(&self, _sched: &Scheduler) {}

    /// Whether workers should enable the syscall hook for their thread.
    fn enable_syscall_hook(&self) -> bool {
        false
    }
}

struct DefaultHooks;

impl SchedulerHooks for DefaultHooks {}

////////////////////////////////////////////////////////////////////////////////
// Scheduler
////////////////////////////////////////////////////////////////////////////////

struct Shared {
    tasks: VecDeque<Task>,
    workers: Vec<thread::JoinHandle<()>>,
}

/// Thread pool plus shared task queue; see the [module docs](self).
pub struct Scheduler {
    name: String,
    hooks: Box<dyn SchedulerHooks>,
    shared: Mutex<Shared>,
    thread_count: usize,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    root_thread: libc::pid_t,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
}

impl Scheduler {
    /// A scheduler with the default hooks.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        Self::with_hooks(threads, use_caller, name, Box::new(DefaultHooks))
    }

    /// A scheduler driven by custom [`SchedulerHooks`].
    pub fn with_hooks(
        threads: usize,
        use_caller: bool,
        name: &str,
        hooks: Box<dyn SchedulerHooks>,
    ) -> Arc<Scheduler> {
        assert!(threads > 0, "scheduler needs at least one worker");

        let (thread_count, root_thread) = if use_caller {
            (threads - 1, util::thread_id())
        } else {
            (threads, ANY_WORKER)
        };

        let sched = Arc::new(Scheduler {
            name: name.to_string(),
            hooks,
            shared: Mutex::new(Shared {
                tasks: VecDeque::new(),
                workers: Vec::new(),
            }),
            thread_count,
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stopping: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
            root_thread,
            root_fiber: Mutex::new(None),
        });

        if use_caller {
            assert!(
                Scheduler::current().is_none(),
                "thread already belongs to a scheduler"
            );
            Fiber::current();
            sched.make_current();
            let weak = Arc::downgrade(&sched);
            let root = Fiber::new(
                move || {
                    if let Some(sched) = weak.upgrade() {
                        sched.run();
                    }
                },
                0,
                true,
            );
            fiber::set_sched_main(Some(root.clone()));
            *sched.root_fiber.lock().expect("scheduler lock poisoned") = Some(root);
        }

        sched
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The scheduler owning the calling thread, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHED.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
    }

    fn make_current(self: &Arc<Self>) {
        CURRENT_SCHED.with(|c| *c.borrow_mut() = Some(Arc::downgrade(self)));
    }

    /// Spawns the worker threads. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut shared = self.shared.lock().expect("scheduler lock poisoned");
        if !self.stopping.load(Ordering::SeqCst) {
            return;
        }
        self.stopping.store(false, Ordering::SeqCst);
        assert!(shared.workers.is_empty());
        for i in 0..self.thread_count {
            let sched = self.clone();
            let worker = thread::Builder::new()
                .name(format!("{}_{}", self.name, i))
                .spawn(move || sched.run())
                .expect("failed to spawn scheduler worker");
            shared.workers.push(worker);
        }
    }

    /// Stops the scheduler and joins every worker thread.
    ///
    /// With `use_caller` the calling thread first runs its own worker loop
    /// until the queue drains, so tasks queued before `stop` still
    /// execute. Idempotent.
    pub fn stop(self: &Arc<Self>) {
        self.auto_stop.store(true, Ordering::SeqCst);

        let root = self
            .root_fiber
            .lock()
            .expect("scheduler lock poisoned")
            .clone();

        if let Some(root) = &root {
            if self.thread_count == 0
                && matches!(root.state(), FiberState::Term | FiberState::Init)
            {
                log::info!("scheduler {} stopped", self.name);
                self.stopping.store(true, Ordering::SeqCst);
                if self.hooks.stopping(self) {
                    return;
                }
            }
        }

        self.stopping.store(true, Ordering::SeqCst);
        for _ in 0..self.thread_count {
            self.hooks.tickle(self);
        }
        if let Some(root) = root {
            self.hooks.tickle(self);
            if !self.hooks.stopping(self) {
                debug_assert_eq!(util::thread_id(), self.root_thread);
                root.resume();
            }
        }

        let workers = {
            let mut shared = self.shared.lock().expect("scheduler lock poisoned");
            std::mem::replace(&mut shared.workers, Vec::new())
        };
        for worker in workers {
            let _ = worker.join();
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Scheduling
    ////////////////////////////////////////////////////////////////////////

    /// Queues a callback for any worker.
    pub fn schedule<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.schedule_task(Task::from_fn(f));
    }

    /// Queues a fiber for any worker.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.schedule_task(Task::from_fiber(fiber));
    }

    /// Queues a single task, waking a worker on the empty→non-empty edge.
    pub fn schedule_task(&self, task: Task) {
        let need_tickle = {
            let mut shared = self.shared.lock().expect("scheduler lock poisoned");
            let need_tickle = shared.tasks.is_empty();
            shared.tasks.push_back(task);
            need_tickle
        };
        if need_tickle {
            self.hooks.tickle(self);
        }
    }

    /// Queues a batch of tasks under a single queue lock.
    pub fn schedule_batch<I: IntoIterator<Item = Task>>(&self, tasks: I) {
        let need_tickle = {
            let mut shared = self.shared.lock().expect("scheduler lock poisoned");
            let was_empty = shared.tasks.is_empty();
            let before = shared.tasks.len();
            shared.tasks.extend(tasks);
            was_empty && shared.tasks.len() > before
        };
        if need_tickle {
            self.hooks.tickle(self);
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Introspection used by hooks
    ////////////////////////////////////////////////////////////////////////

    /// Base stopping predicate: stop requested, queue empty, nobody active.
    pub fn base_stopping(&self) -> bool {
        let queue_empty = self
            .shared
            .lock()
            .expect("scheduler lock poisoned")
            .tasks
            .is_empty();
        self.auto_stop.load(Ordering::SeqCst)
            && self.stopping.load(Ordering::SeqCst)
            && queue_empty
            && self.active_threads.load(Ordering::SeqCst) == 0
    }

    /// Whether any worker currently sits in its idle fiber.
    pub fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::SeqCst) > 0
    }

    ////////////////////////////////////////////////////////////////////////
    // Worker loop
    ////////////////////////////////////////////////////////////////////////

    fn run(self: &Arc<Self>) {
        log::debug!("scheduler {} worker loop starting", self.name);
        hook::set_enabled(self.hooks.enable_syscall_hook());
        self.make_current();
        if util::thread_id() != self.root_thread {
            // plain workers yield back to their own root fiber; the
            // use_caller thread keeps the root fiber installed at
            // construction time
            fiber::set_sched_main(Some(Fiber::current()));
        }
        self.hooks.on_worker_start(self);

        let idle_fiber = {
            let weak = Arc::downgrade(self);
            Fiber::new(
                move || {
                    if let Some(sched) = weak.upgrade() {
                        sched.hooks.idle(&sched);
                    }
                },
                0,
                false,
            )
        };
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut task = None;
            let mut tickle_me = false;
            let mut is_active = false;
            {
                let mut shared = self.shared.lock().expect("scheduler lock poisoned");
                let tid = util::thread_id();
                let mut found = None;
                for (i, t) in shared.tasks.iter().enumerate() {
                    if t.thread != ANY_WORKER && t.thread != tid {
                        tickle_me = true;
                        continue;
                    }
                    if let TaskKind::Fiber(f) = &t.kind {
                        // still running on another worker, leave it queued
                        if f.state() == FiberState::Exec {
                            continue;
                        }
                    }
                    found = Some(i);
                    break;
                }
                if let Some(i) = found {
                    task = shared.tasks.remove(i);
                    self.active_threads.fetch_add(1, Ordering::SeqCst);
                    is_active = true;
                }
            }

            if tickle_me {
                self.hooks.tickle(self);
            }

            match task.map(|t| t.kind) {
                Some(TaskKind::Fiber(f)) => {
                    if matches!(f.state(), FiberState::Term | FiberState::Except) {
                        self.active_threads.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    f.resume();
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                    match f.state() {
                        FiberState::Ready => self.schedule_fiber(f),
                        FiberState::Term | FiberState::Except => {}
                        _ => f.set_state(FiberState::Hold),
                    }
                }
                Some(TaskKind::Call(cb)) => {
                    let f = match cb_fiber.take() {
                        Some(f) => {
                            f.reset_boxed(cb);
                            f
                        }
                        None => Fiber::from_boxed(cb, 0, false),
                    };
                    f.resume();
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                    match f.state() {
                        FiberState::Ready => self.schedule_fiber(f),
                        // finished: keep the fiber around for the next callback
                        FiberState::Term | FiberState::Except => cb_fiber = Some(f),
                        // parked: an event slot owns a handle now
                        _ => f.set_state(FiberState::Hold),
                    }
                }
                None => {
                    if is_active {
                        self.active_threads.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    if idle_fiber.state() == FiberState::Term {
                        log::info!("scheduler {} idle fiber terminated", self.name);
                        break;
                    }
                    self.idle_threads.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle_threads.fetch_sub(1, Ordering::SeqCst);
                    if !matches!(
                        idle_fiber.state(),
                        FiberState::Term | FiberState::Except
                    ) {
                        idle_fiber.set_state(FiberState::Hold);
                    }
                }
            }
        }
        log::debug!("scheduler {} worker loop finished", self.name);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.thread_count)
            .finish_non_exhaustive()
    }
}
