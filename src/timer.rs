//! Deadline-ordered timers.
//!
//! A [`TimerSet`] keeps timers sorted by `(absolute deadline ms, insertion
//! sequence)`; the sequence makes ties deterministic and gives the set
//! multiset semantics without depending on allocation addresses. The owner
//! (the [reactor](crate::reactor)) asks for the delay until the next
//! deadline before blocking in `epoll_wait` and drains expired callbacks
//! into the scheduler afterwards.
//!
//! Three flavors: one-shot, recurring (re-inserted at `now + interval` on
//! every expiry), and *condition* timers whose callback is guarded by a
//! weak witness and silently skipped once the witness is gone.
//!
//! A monotonic clock that jumps backwards by more than an hour trips the
//! rollover guard: every timer is treated as expired on the next drain.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use once_cell::sync::OnceCell;

use crate::clock;

/// Backwards clock jumps larger than this expire everything.
const ROLLOVER_MS: u64 = 60 * 60 * 1000;

/// Callback type shared by all timer flavors; recurring timers invoke the
/// same callback on every expiry.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

////////////////////////////////////////////////////////////////////////////////
// Timer
////////////////////////////////////////////////////////////////////////////////

struct Timer {
    seq: u64,
    recurring: bool,
    interval_ms: AtomicU64,
    deadline_ms: AtomicU64,
    cb: Mutex<Option<TimerCallback>>,
}

impl Timer {
    fn key(&self) -> (u64, u64) {
        (self.deadline_ms.load(Ordering::SeqCst), self.seq)
    }
}

/// Cloneable reference to a timer living in some [`TimerSet`].
#[derive(Clone)]
pub struct TimerHandle(Arc<Timer>);

impl TimerHandle {
    /// Milliseconds between firings (or until the single firing).
    pub fn interval_ms(&self) -> u64 {
        self.0.interval_ms.load(Ordering::SeqCst)
    }

    pub fn is_recurring(&self) -> bool {
        self.0.recurring
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("seq", &self.0.seq)
            .field("interval_ms", &self.interval_ms())
            .field("recurring", &self.0.recurring)
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// TimerSet
////////////////////////////////////////////////////////////////////////////////

struct TimerSetInner {
    timers: BTreeMap<(u64, u64), Arc<Timer>>,
    prev_now_ms: u64,
}

/// The ordered set of timers; see the [module docs](self).
pub struct TimerSet {
    inner: RwLock<TimerSetInner>,
    next_seq: AtomicU64,
    /// Suppresses repeated front-insert wakeups between timeout queries.
    tickled: AtomicBool,
    front_waker: OnceCell<Box<dyn Fn() + Send + Sync>>,
}

impl TimerSet {
    pub fn new() -> TimerSet {
        TimerSet {
            inner: RwLock::new(TimerSetInner {
                timers: BTreeMap::new(),
                prev_now_ms: clock::now_ms(),
            }),
            next_seq: AtomicU64::new(0),
            tickled: AtomicBool::new(false),
            front_waker: OnceCell::new(),
        }
    }

    /// Installs the callback fired when a new timer becomes the earliest
    /// deadline (the reactor uses it to cut its epoll wait short).
    pub(crate) fn set_front_waker(&self, waker: Box<dyn Fn() + Send + Sync>) {
        let _ = self.front_waker.set(waker);
    }

    /// Adds a timer firing `interval_ms` from now.
    pub fn add_timer<F>(&self, interval_ms: u64, f: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_cb(interval_ms, Arc::new(f), recurring)
    }

    fn add_timer_cb(&self, interval_ms: u64, cb: TimerCallback, recurring: bool) -> TimerHandle {
        let timer = Arc::new(Timer {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            recurring,
            interval_ms: AtomicU64::new(interval_ms),
            deadline_ms: AtomicU64::new(clock::now_ms() + interval_ms),
            cb: Mutex::new(Some(cb)),
        });
        let at_front = {
            let mut inner = self.inner.write().expect("timer lock poisoned");
            self.insert_locked(&mut *inner, timer.clone())
        };
        if at_front {
            self.wake_front();
        }
        TimerHandle(timer)
    }

    /// Adds a timer whose callback only runs while `witness` is alive.
    pub fn add_condition_timer<F, T>(
        &self,
        interval_ms: u64,
        f: F,
        witness: Weak<T>,
        recurring: bool,
    ) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.add_timer(
            interval_ms,
            move || {
                if witness.upgrade().is_some() {
                    f();
                }
            },
            recurring,
        )
    }

    /// Removes the timer and drops its callback immediately, releasing
    /// whatever the callback captured. Returns false if it already fired
    /// (one-shot) or was cancelled before.
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        let timer = &handle.0;
        let mut inner = self.inner.write().expect("timer lock poisoned");
        let had_cb = timer.cb.lock().expect("timer lock poisoned").take().is_some();
        if !had_cb {
            return false;
        }
        inner.timers.remove(&timer.key());
        true
    }

    /// Pushes the deadline out to `now + interval`, keeping the interval.
    pub fn refresh(&self, handle: &TimerHandle) -> bool {
        let timer = &handle.0;
        let mut inner = self.inner.write().expect("timer lock poisoned");
        if timer.cb.lock().expect("timer lock poisoned").is_none() {
            return false;
        }
        if inner.timers.remove(&timer.key()).is_none() {
            return false;
        }
        let interval = timer.interval_ms.load(Ordering::SeqCst);
        timer
            .deadline_ms
            .store(clock::now_ms() + interval, Ordering::SeqCst);
        inner.timers.insert(timer.key(), timer.clone());
        true
    }

    /// Changes the interval; the new deadline counts either from now or
    /// from the timer's original start point.
    pub fn reset(&self, handle: &TimerHandle, interval_ms: u64, from_now: bool) -> bool {
        let timer = &handle.0;
        if interval_ms == timer.interval_ms.load(Ordering::SeqCst) && !from_now {
            return true;
        }
        let at_front = {
            let mut inner = self.inner.write().expect("timer lock poisoned");
            if timer.cb.lock().expect("timer lock poisoned").is_none() {
                return false;
            }
            if inner.timers.remove(&timer.key()).is_none() {
                return false;
            }
            let old_interval = timer.interval_ms.load(Ordering::SeqCst);
            let start = if from_now {
                clock::now_ms()
            } else {
                timer.deadline_ms.load(Ordering::SeqCst) - old_interval
            };
            timer.interval_ms.store(interval_ms, Ordering::SeqCst);
            timer
                .deadline_ms
                .store(start + interval_ms, Ordering::SeqCst);
            self.insert_locked(&mut *inner, timer.clone())
        };
        if at_front {
            self.wake_front();
        }
        true
    }

    /// Delay until the earliest deadline: `Some(0)` when a timer is due,
    /// `None` when the set is empty.
    pub fn next_timeout_ms(&self) -> Option<u64> {
        self.tickled.store(false, Ordering::SeqCst);
        let inner = self.inner.read().expect("timer lock poisoned");
        let (key, _) = inner.timers.iter().next()?;
        Some(key.0.saturating_sub(clock::now_ms()))
    }

    pub fn has_timers(&self) -> bool {
        !self
            .inner
            .read()
            .expect("timer lock poisoned")
            .timers
            .is_empty()
    }

    /// Appends the callbacks of every timer with `deadline <= now`,
    /// rescheduling recurring ones.
    pub fn collect_expired(&self, out: &mut Vec<TimerCallback>) {
        self.collect_expired_at(clock::now_ms(), out)
    }

    fn collect_expired_at(&self, now_ms: u64, out: &mut Vec<TimerCallback>) {
        {
            let inner = self.inner.read().expect("timer lock poisoned");
            if inner.timers.is_empty() {
                return;
            }
        }

        let mut inner = self.inner.write().expect("timer lock poisoned");
        let rollover = detect_rollover(&mut inner.prev_now_ms, now_ms);
        if !rollover {
            match inner.timers.keys().next() {
                Some(first) if first.0 > now_ms => return,
                None => return,
                _ => {}
            }
        }

        let due = if rollover {
            std::mem::replace(&mut inner.timers, BTreeMap::new())
        } else {
            let pending = inner.timers.split_off(&(now_ms + 1, 0));
            std::mem::replace(&mut inner.timers, pending)
        };

        out.reserve(due.len());
        for (_, timer) in due {
            let mut cb_slot = timer.cb.lock().expect("timer lock poisoned");
            if timer.recurring {
                let cb = match cb_slot.clone() {
                    Some(cb) => cb,
                    None => continue,
                };
                drop(cb_slot);
                out.push(cb);
                let interval = timer.interval_ms.load(Ordering::SeqCst);
                timer
                    .deadline_ms
                    .store(now_ms + interval, Ordering::SeqCst);
                inner.timers.insert(timer.key(), timer.clone());
            } else if let Some(cb) = cb_slot.take() {
                // dropping the slot's callback right here keeps captured
                // resources from outliving the firing
                drop(cb_slot);
                out.push(cb);
            }
        }
    }

    /// Returns whether the timer landed at the front (and the wakeup is
    /// not already pending).
    fn insert_locked(&self, inner: &mut TimerSetInner, timer: Arc<Timer>) -> bool {
        let key = timer.key();
        inner.timers.insert(key, timer);
        let is_front = inner.timers.keys().next() == Some(&key);
        is_front && !self.tickled.swap(true, Ordering::SeqCst)
    }

    fn wake_front(&self) {
        if let Some(waker) = self.front_waker.get() {
            waker();
        }
    }
}

impl Default for TimerSet {
    fn default() -> TimerSet {
        TimerSet::new()
    }
}

fn detect_rollover(prev_now_ms: &mut u64, now_ms: u64) -> bool {
    let rollover = now_ms < prev_now_ms.saturating_sub(ROLLOVER_MS);
    *prev_now_ms = now_ms;
    rollover
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;

    fn drain_at(set: &TimerSet, now_ms: u64) -> usize {
        let mut cbs = Vec::new();
        set.collect_expired_at(now_ms, &mut cbs);
        let n = cbs.len();
        for cb in cbs {
            cb();
        }
        n
    }

    #[test]
    fn fires_in_deadline_then_insertion_order() {
        let set = TimerSet::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (tag, interval) in &[(1u32, 50u64), (2, 30), (3, 30), (4, 10)] {
            let tag = *tag;
            let order = order.clone();
            set.add_timer(*interval, move || order.lock().unwrap().push(tag), false);
        }
        drain_at(&set, clock::now_ms() + 100);
        assert_eq!(*order.lock().unwrap(), vec![4, 2, 3, 1]);
    }

    #[test]
    fn one_shot_fires_exactly_once() {
        let set = TimerSet::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        set.add_timer(10, move || drop(h.fetch_add(1, Ordering::SeqCst)), false);

        assert_eq!(drain_at(&set, clock::now_ms() + 20), 1);
        assert_eq!(drain_at(&set, clock::now_ms() + 40), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!set.has_timers());
    }

    #[test]
    fn zero_interval_is_due_at_the_next_drain() {
        let set = TimerSet::new();
        set.add_timer(0, || {}, false);
        assert_eq!(set.next_timeout_ms(), Some(0));
        assert_eq!(drain_at(&set, clock::now_ms()), 1);
    }

    #[test]
    fn recurring_reschedules_itself() {
        let set = TimerSet::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let handle = set.add_timer(10, move || drop(h.fetch_add(1, Ordering::SeqCst)), true);

        let now = clock::now_ms();
        assert_eq!(drain_at(&set, now + 15), 1);
        assert_eq!(drain_at(&set, now + 30), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(set.has_timers());

        assert!(set.cancel(&handle));
        assert!(!set.has_timers());
        assert_eq!(drain_at(&set, now + 60), 0);
    }

    #[test]
    fn cancel_drops_the_callback_promptly() {
        let set = TimerSet::new();
        let witness = Arc::new(());
        let captured = witness.clone();
        let handle = set.add_timer(1000, move || drop(&captured), false);

        assert_eq!(Arc::strong_count(&witness), 2);
        assert!(set.cancel(&handle));
        assert_eq!(Arc::strong_count(&witness), 1);
        assert!(!set.cancel(&handle));
    }

    #[test]
    fn condition_timer_skips_after_witness_drop() {
        let set = TimerSet::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let witness = Arc::new(());
        set.add_condition_timer(
            10,
            move || drop(h.fetch_add(1, Ordering::SeqCst)),
            Arc::downgrade(&witness),
            false,
        );

        drop(witness);
        assert_eq!(drain_at(&set, clock::now_ms() + 20), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn refresh_and_reset_move_the_deadline() {
        let set = TimerSet::new();
        let handle = set.add_timer(50, || {}, false);

        assert!(set.refresh(&handle));
        // nothing due yet right after a refresh
        assert_eq!(drain_at(&set, clock::now_ms() + 10), 0);

        assert!(set.reset(&handle, 5, true));
        assert_eq!(handle.interval_ms(), 5);
        assert_eq!(drain_at(&set, clock::now_ms() + 10), 1);

        // fired: refresh/reset on a dead timer report failure
        assert!(!set.refresh(&handle));
        assert!(!set.reset(&handle, 5, true));
    }

    #[test]
    fn backwards_clock_jump_expires_everything() {
        let set = TimerSet::new();
        set.add_timer(1_000_000, || {}, false);
        set.add_timer(2_000_000, || {}, false);

        let now = clock::now_ms();
        assert_eq!(drain_at(&set, now), 0);
        // two hours back: the rollover guard fires every timer
        assert_eq!(drain_at(&set, now.saturating_sub(2 * ROLLOVER_MS)), 2);
        assert!(!set.has_timers());
    }

    #[test]
    fn next_timeout_reflects_the_head() {
        let set = TimerSet::new();
        assert_eq!(set.next_timeout_ms(), None);
        set.add_timer(5000, || {}, false);
        let delay = set.next_timeout_ms().unwrap();
        assert!(delay > 4000 && delay <= 5000);
    }
}
