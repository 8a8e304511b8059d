//! Timer manager
//!
//! An ordered set of pending timers keyed by `(expiry_ms, id)`, so timers
//! with the same deadline fire in creation order. The set sits behind one
//! reader/writer lock; callbacks are handed out by
//! [`TimerManager::list_expired_callbacks`] and run by the caller, never
//! under the lock.
//!
//! The reactor owns one manager and gets told through [`TimerHook`] when a
//! new timer becomes the earliest deadline, so that an epoll wait computed
//! before the timer existed is cut short.
//!
//! # Example
//!
//! ```ignore
//! let timers = TimerManager::new();
//! let t = timers.add_timer(100, || kinfo!("tick"), true);
//! // ... later
//! t.cancel();
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use strand_core::constants::INFINITE;

use crate::config;

/// Shared timer callback; recurring timers fire it more than once
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

type TimerKey = (u64, u64);

/// Millisecond time source.
///
/// The default [`SystemClock`] follows the wall clock and can step
/// backwards; see the rollover handling in `list_expired_callbacks`.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall-clock milliseconds since the Unix epoch
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Notified when an insertion becomes the earliest pending timer
pub trait TimerHook: Send + Sync {
    fn on_timer_inserted_at_front(&self);
}

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a scheduled timer.
///
/// `expiry` and `interval` only change under the manager's write lock.
pub struct Timer {
    id: u64,
    recurring: bool,
    interval: AtomicU64,
    expiry: AtomicU64,
    /// `None` once cancelled or fired for the last time
    cb: Mutex<Option<TimerCallback>>,
    manager: Weak<TimerShared>,
}

impl Timer {
    #[inline]
    fn key(&self) -> TimerKey {
        (self.expiry.load(Ordering::Relaxed), self.id)
    }

    /// Absolute expiry in clock milliseconds
    pub fn expiry_ms(&self) -> u64 {
        self.expiry.load(Ordering::Relaxed)
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval.load(Ordering::Relaxed)
    }

    pub fn is_recurring(&self) -> bool {
        self.recurring
    }

    /// Remove the timer; false if it already fired or was cancelled
    pub fn cancel(&self) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let mut queue = mgr.queue.write();
        if self.cb.lock().take().is_none() {
            return false;
        }
        queue.remove(&self.key());
        true
    }

    /// Push the expiry to now + interval, keeping the interval
    pub fn refresh(&self) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let mut queue = mgr.queue.write();
        if self.cb.lock().is_none() {
            return false;
        }
        let Some(me) = queue.remove(&self.key()) else {
            return false;
        };
        self.expiry
            .store(mgr.clock.now_ms().saturating_add(self.interval_ms()), Ordering::Relaxed);
        queue.insert(self.key(), me);
        true
    }

    /// Change the interval to `ms`, counted from now or from the previous
    /// start time.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        if ms == self.interval_ms() && !from_now {
            return true;
        }
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let at_front = {
            let mut queue = mgr.queue.write();
            if self.cb.lock().is_none() {
                return false;
            }
            let Some(me) = queue.remove(&self.key()) else {
                return false;
            };
            let start = if from_now {
                mgr.clock.now_ms()
            } else {
                self.expiry_ms().saturating_sub(self.interval_ms())
            };
            self.interval.store(ms, Ordering::Relaxed);
            self.expiry.store(start.saturating_add(ms), Ordering::Relaxed);
            mgr.insert_locked(&mut queue, me)
        };
        if at_front {
            mgr.notify_front();
        }
        true
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("expiry_ms", &self.expiry_ms())
            .field("interval_ms", &self.interval_ms())
            .field("recurring", &self.recurring)
            .finish()
    }
}

struct TimerShared {
    queue: RwLock<BTreeMap<TimerKey, Arc<Timer>>>,
    /// Set when the front hook fired; cleared by `next_timer`
    tickled: AtomicBool,
    previous_ms: AtomicU64,
    rollover_ms: u64,
    clock: Arc<dyn Clock>,
    hook: Option<Weak<dyn TimerHook>>,
}

impl TimerShared {
    /// Insert and report whether the front hook should fire
    fn insert_locked(&self, queue: &mut BTreeMap<TimerKey, Arc<Timer>>, timer: Arc<Timer>) -> bool {
        let key = timer.key();
        queue.insert(key, timer);
        let at_front = queue.keys().next() == Some(&key) && !self.tickled.load(Ordering::Acquire);
        if at_front {
            self.tickled.store(true, Ordering::Release);
        }
        at_front
    }

    fn notify_front(&self) {
        if let Some(hook) = self.hook.as_ref().and_then(Weak::upgrade) {
            hook.on_timer_inserted_at_front();
        }
    }

    fn detect_rollover(&self, now: u64) -> bool {
        let previous = self.previous_ms.swap(now, Ordering::AcqRel);
        now < previous && now < previous.saturating_sub(self.rollover_ms)
    }
}

/// Ordered set of pending timers
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl TimerManager {
    /// Wall clock, no front hook
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock), None)
    }

    pub fn with_clock(clock: Arc<dyn Clock>, hook: Option<Weak<dyn TimerHook>>) -> Self {
        let now = clock.now_ms();
        Self {
            shared: Arc::new(TimerShared {
                queue: RwLock::new(BTreeMap::new()),
                tickled: AtomicBool::new(false),
                previous_ms: AtomicU64::new(now),
                rollover_ms: config::global().clock_rollover.as_millis() as u64,
                clock,
                hook,
            }),
        }
    }

    /// Fire `cb` after `ms` milliseconds, every `ms` if `recurring`
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_callback(ms, Arc::new(cb), recurring)
    }

    fn add_callback(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Arc<Timer> {
        let shared = &self.shared;
        let timer = Arc::new(Timer {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            recurring,
            interval: AtomicU64::new(ms),
            expiry: AtomicU64::new(shared.clock.now_ms().saturating_add(ms)),
            cb: Mutex::new(Some(cb)),
            manager: Arc::downgrade(shared),
        });
        let at_front = {
            let mut queue = shared.queue.write();
            shared.insert_locked(&mut queue, timer.clone())
        };
        if at_front {
            shared.notify_front();
        }
        timer
    }

    /// Like `add_timer`, but `cb` only runs while `guard` is still alive
    pub fn add_condition_timer<F>(
        &self,
        ms: u64,
        cb: F,
        guard: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if let Some(_alive) = guard.upgrade() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest timer, 0 if overdue, `INFINITE` if
    /// none is pending
    pub fn next_timer(&self) -> u64 {
        let shared = &self.shared;
        shared.tickled.store(false, Ordering::Release);
        let queue = shared.queue.read();
        match queue.keys().next() {
            None => INFINITE,
            Some(&(expiry, _)) => expiry.saturating_sub(shared.clock.now_ms()),
        }
    }

    /// Pop every due timer and append its callback to `out`.
    ///
    /// Recurring timers are re-inserted at now + interval. A backward clock
    /// jump larger than the rollover window expires everything.
    pub fn list_expired_callbacks(&self, out: &mut Vec<TimerCallback>) {
        let shared = &self.shared;
        let now = shared.clock.now_ms();
        if shared.queue.read().is_empty() {
            return;
        }

        let mut queue = shared.queue.write();
        if queue.is_empty() {
            return;
        }
        let rollover = shared.detect_rollover(now);
        if !rollover && queue.keys().next().is_some_and(|&(expiry, _)| expiry > now) {
            return;
        }

        let expired = if rollover {
            std::mem::take(&mut *queue)
        } else {
            let later = queue.split_off(&(now.saturating_add(1), 0));
            std::mem::replace(&mut *queue, later)
        };

        out.reserve(expired.len());
        for timer in expired.into_values() {
            let mut cb = timer.cb.lock();
            let Some(f) = cb.clone() else { continue };
            out.push(f);
            if timer.recurring {
                drop(cb);
                timer.expiry.store(now.saturating_add(timer.interval_ms()), Ordering::Relaxed);
                queue.insert(timer.key(), timer);
            } else {
                *cb = None;
            }
        }
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.queue.read().is_empty()
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.shared.queue.read().len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_timer()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct ManualClock(AtomicU64);

    impl ManualClock {
        fn new(start: u64) -> Arc<Self> {
            Arc::new(ManualClock(AtomicU64::new(start)))
        }
        fn advance(&self, ms: u64) {
            self.0.fetch_add(ms, Ordering::SeqCst);
        }
        fn set(&self, ms: u64) {
            self.0.store(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn manager(clock: &Arc<ManualClock>) -> TimerManager {
        TimerManager::with_clock(clock.clone(), None)
    }

    fn fire(out: Vec<TimerCallback>) -> usize {
        let n = out.len();
        for cb in out {
            cb();
        }
        n
    }

    #[test]
    fn test_next_timer_tracks_minimum() {
        let clock = ManualClock::new(1_000_000);
        let timers = manager(&clock);
        assert_eq!(timers.next_timer(), INFINITE);

        // live model: (handle, expiry)
        let mut live: Vec<(Arc<Timer>, u64)> = Vec::new();
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
        let mut rand = move |n: u64| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed % n
        };

        for _ in 0..500 {
            match rand(4) {
                0 | 1 => {
                    let ms = 1 + rand(5000);
                    let t = timers.add_timer(ms, || {}, false);
                    live.push((t, clock.now_ms() + ms));
                }
                2 if !live.is_empty() => {
                    let (t, _) = live.swap_remove(rand(live.len() as u64) as usize);
                    assert!(t.cancel());
                    assert!(!t.cancel());
                }
                3 if !live.is_empty() => {
                    let i = rand(live.len() as u64) as usize;
                    assert!(live[i].0.refresh());
                    live[i].1 = clock.now_ms() + live[i].0.interval_ms();
                }
                _ => clock.advance(rand(20)),
            }

            let now = clock.now_ms();
            let expected = live
                .iter()
                .map(|(_, e)| e.saturating_sub(now))
                .min()
                .unwrap_or(INFINITE);
            assert_eq!(timers.next_timer(), expected);
        }
    }

    #[test]
    fn test_expired_order_and_recurring() {
        let clock = ManualClock::new(10_000);
        let timers = manager(&clock);
        let order = Arc::new(Mutex::new(Vec::new()));

        for (ms, tag) in [(30, 'c'), (10, 'a'), (20, 'b')] {
            let o = order.clone();
            timers.add_timer(ms, move || o.lock().push(tag), false);
        }
        let o = order.clone();
        let tick = timers.add_timer(15, move || o.lock().push('r'), true);

        clock.advance(25);
        let mut out = Vec::new();
        timers.list_expired_callbacks(&mut out);
        assert_eq!(fire(out), 3);
        assert_eq!(*order.lock(), vec!['a', 'r', 'b']);

        // recurring timer re-armed at now + interval
        assert_eq!(tick.expiry_ms(), clock.now_ms() + 15);
        assert_eq!(timers.len(), 2);

        clock.advance(100);
        let mut out = Vec::new();
        timers.list_expired_callbacks(&mut out);
        assert_eq!(fire(out), 2);
        assert!(tick.cancel());
        assert!(!timers.has_timer());
    }

    #[test]
    fn test_nothing_due() {
        let clock = ManualClock::new(500);
        let timers = manager(&clock);
        timers.add_timer(50, || {}, false);
        clock.advance(49);
        let mut out = Vec::new();
        timers.list_expired_callbacks(&mut out);
        assert!(out.is_empty());
        assert_eq!(timers.next_timer(), 1);
    }

    #[test]
    fn test_reset() {
        let clock = ManualClock::new(0);
        let timers = manager(&clock);
        let t = timers.add_timer(100, || {}, false);

        clock.advance(40);
        assert!(t.reset(200, false));
        assert_eq!(t.expiry_ms(), 200);

        assert!(t.reset(200, true));
        assert_eq!(t.expiry_ms(), 240);
        assert_eq!(timers.next_timer(), 200);

        assert!(t.cancel());
        assert!(!t.reset(10, true));
        assert!(!t.refresh());
    }

    #[test]
    fn test_far_deadlines_saturate() {
        let clock = ManualClock::new(10 * 60 * 60 * 1000);
        let timers = manager(&clock);
        let t = timers.add_timer(u64::MAX - 1, || {}, false);
        assert_eq!(t.expiry_ms(), u64::MAX);
        assert!(t.refresh());
        assert!(t.reset(u64::MAX, true));
        assert_eq!(t.expiry_ms(), u64::MAX);

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let r = timers.add_timer(u64::MAX - 1, move || {
            h.fetch_add(1, Ordering::SeqCst);
        }, true);

        clock.advance(10);
        let mut out = Vec::new();
        timers.list_expired_callbacks(&mut out);
        assert_eq!(fire(out), 0);

        // a clock rollback expires everything; the recurring one is re-armed
        clock.set(clock.now_ms() - 2 * 60 * 60 * 1000);
        let mut out = Vec::new();
        timers.list_expired_callbacks(&mut out);
        assert_eq!(fire(out), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(r.expiry_ms(), u64::MAX);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_condition_timers_share_dead_guard() {
        let clock = ManualClock::new(0);
        let timers = manager(&clock);
        let fired = Arc::new(AtomicUsize::new(0));

        let guard: Arc<dyn Any + Send + Sync> = Arc::new(42u32);
        for ms in [10, 20] {
            let f = fired.clone();
            timers.add_condition_timer(
                ms,
                move || {
                    f.fetch_add(1, Ordering::SeqCst);
                },
                Arc::downgrade(&guard),
                false,
            );
        }
        drop(guard);

        clock.advance(50);
        let mut out = Vec::new();
        timers.list_expired_callbacks(&mut out);
        fire(out);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_condition_timer_live_guard_fires() {
        let clock = ManualClock::new(0);
        let timers = manager(&clock);
        let fired = Arc::new(AtomicUsize::new(0));
        let guard: Arc<dyn Any + Send + Sync> = Arc::new(());
        let f = fired.clone();
        timers.add_condition_timer(5, move || { f.fetch_add(1, Ordering::SeqCst); }, Arc::downgrade(&guard), false);

        clock.advance(5);
        let mut out = Vec::new();
        timers.list_expired_callbacks(&mut out);
        fire(out);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clock_rollover_expires_all() {
        let clock = ManualClock::new(10 * 60 * 60 * 1000);
        let timers = manager(&clock);
        timers.add_timer(60_000, || {}, false);
        timers.add_timer(120_000, || {}, false);

        // small step back: nothing due
        clock.set(clock.now_ms() - 1000);
        let mut out = Vec::new();
        timers.list_expired_callbacks(&mut out);
        assert!(out.is_empty());

        // stepped back past the rollover window
        clock.set(clock.now_ms() - 2 * 60 * 60 * 1000);
        timers.list_expired_callbacks(&mut out);
        assert_eq!(out.len(), 2);
        assert!(!timers.has_timer());
    }

    struct CountingHook(AtomicUsize);

    impl TimerHook for CountingHook {
        fn on_timer_inserted_at_front(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_front_hook_latch() {
        let clock = ManualClock::new(0);
        let hook = Arc::new(CountingHook(AtomicUsize::new(0)));
        let weak: Weak<dyn TimerHook> = Arc::downgrade(&hook) as Weak<dyn TimerHook>;
        let timers = TimerManager::with_clock(clock.clone(), Some(weak));

        timers.add_timer(100, || {}, false);
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);

        // not the front
        timers.add_timer(200, || {}, false);
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);

        // front again, but still latched until next_timer()
        timers.add_timer(50, || {}, false);
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);

        timers.next_timer();
        timers.add_timer(10, || {}, false);
        assert_eq!(hook.0.load(Ordering::SeqCst), 2);
    }
}
