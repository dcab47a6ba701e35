// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deadline timers.
//!
//! Timers live in one ordered map keyed by `(deadline, id)`, so ties on the
//! same millisecond fire in creation order. The manager does not run
//! callbacks itself: `list_expired_callbacks` hands them to whoever drives
//! it (the reactor's idle loop), and `next_timer` tells that driver how long
//! it may block.
//!
//! A wall clock can step backwards. When "now" falls more than the rollover
//! threshold behind the last observed time, every armed timer is treated as
//! due rather than left waiting for the clock to catch up.

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};

use crate::clock::{Clock, SystemClock};
use crate::config::DEFAULT_ROLLOVER_THRESHOLD_MS;

pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    deadline: u64,
    id: u64,
}

/// Handle to an armed timer.
pub struct Timer {
    id: u64,
    recurring: bool,
    /// Written only under the manager's write lock.
    deadline: AtomicU64,
    interval: AtomicU64,
    /// `None` once cancelled or, for one-shot timers, once fired.
    callback: Mutex<Option<TimerCallback>>,
    manager: Weak<TimerShared>,
}

impl Timer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval.load(Ordering::Acquire)
    }

    /// Absolute expiry in clock milliseconds.
    pub fn deadline_ms(&self) -> u64 {
        self.deadline.load(Ordering::Acquire)
    }

    pub fn is_recurring(&self) -> bool {
        self.recurring
    }

    /// Still armed: not cancelled and, if one-shot, not yet fired.
    pub fn is_active(&self) -> bool {
        self.callback.lock().is_some()
    }

    fn key(&self) -> TimerKey {
        TimerKey {
            deadline: self.deadline_ms(),
            id: self.id,
        }
    }

    /// Disarm the timer. Returns false if it had already fired (one-shot),
    /// been cancelled, or outlived its manager.
    pub fn cancel(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut queue = manager.queue.write();
        if self.callback.lock().take().is_none() {
            return false;
        }
        queue.timers.remove(&self.key());
        true
    }

    /// Push the deadline out to now + interval.
    pub fn refresh(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut queue = manager.queue.write();
        if self.callback.lock().is_none() {
            return false;
        }
        let Some(timer) = queue.timers.remove(&self.key()) else {
            return false;
        };
        let now = manager.clock.now_ms();
        self.deadline
            .store(now.saturating_add(self.interval_ms()), Ordering::Release);
        queue.timers.insert(self.key(), timer);
        true
    }

    /// Change the interval. With `from_now` the new deadline is now + `ms`;
    /// otherwise it is measured from when the timer was last armed.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        if ms == self.interval_ms() && !from_now {
            return true;
        }
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut queue = manager.queue.write();
        if self.callback.lock().is_none() {
            return false;
        }
        let Some(timer) = queue.timers.remove(&self.key()) else {
            return false;
        };
        let start = if from_now {
            manager.clock.now_ms()
        } else {
            self.deadline_ms().saturating_sub(self.interval_ms())
        };
        self.interval.store(ms, Ordering::Release);
        self.deadline.store(start.saturating_add(ms), Ordering::Release);
        manager.insert(queue, timer);
        true
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("deadline_ms", &self.deadline_ms())
            .field("interval_ms", &self.interval_ms())
            .field("recurring", &self.recurring)
            .finish()
    }
}

struct TimerQueue {
    timers: BTreeMap<TimerKey, Arc<Timer>>,
    /// Clock reading at the last expiry scan, for rollover detection.
    previous_ms: u64,
}

struct TimerShared {
    queue: RwLock<TimerQueue>,
    /// Set when the front hook fired; cleared by `next_timer`.
    tickled: AtomicBool,
    clock: Arc<dyn Clock>,
    rollover_threshold_ms: u64,
    on_front: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl TimerShared {
    /// Insert `timer` and release the lock, then run the front hook if the
    /// timer became the earliest and nobody has been woken since the last
    /// `next_timer`.
    fn insert(&self, mut queue: RwLockWriteGuard<'_, TimerQueue>, timer: Arc<Timer>) {
        let key = timer.key();
        queue.timers.insert(key, timer);
        let at_front = queue.timers.keys().next() == Some(&key);
        let notify = at_front && !self.tickled.swap(true, Ordering::AcqRel);
        drop(queue);
        if notify {
            if let Some(hook) = self.on_front.get() {
                hook();
            }
        }
    }
}

/// Ordered set of timers sharing one clock.
#[derive(Clone)]
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock), DEFAULT_ROLLOVER_THRESHOLD_MS)
    }

    pub fn with_clock(clock: Arc<dyn Clock>, rollover_threshold_ms: u64) -> Self {
        let previous_ms = clock.now_ms();
        Self {
            shared: Arc::new(TimerShared {
                queue: RwLock::new(TimerQueue {
                    timers: BTreeMap::new(),
                    previous_ms,
                }),
                tickled: AtomicBool::new(false),
                clock,
                rollover_threshold_ms,
                on_front: OnceLock::new(),
            }),
        }
    }

    /// Install the callback run when a new timer becomes the earliest one.
    /// Only the first installation takes effect.
    pub fn on_insert_at_front<F>(&self, hook: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.on_front.set(Box::new(hook)).is_ok()
    }

    pub fn now_ms(&self) -> u64 {
        self.shared.clock.now_ms()
    }

    /// Arm a timer firing `ms` from now, and every `ms` after that if
    /// `recurring`.
    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_arc(ms, Arc::new(callback), recurring)
    }

    fn add_timer_arc(&self, ms: u64, callback: TimerCallback, recurring: bool) -> Arc<Timer> {
        let shared = &self.shared;
        let timer = Arc::new(Timer {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            recurring,
            deadline: AtomicU64::new(shared.clock.now_ms().saturating_add(ms)),
            interval: AtomicU64::new(ms),
            callback: Mutex::new(Some(callback)),
            manager: Arc::downgrade(shared),
        });
        shared.insert(shared.queue.write(), timer.clone());
        timer
    }

    /// Like `add_timer`, but the callback is skipped once `condition` can
    /// no longer be upgraded.
    pub fn add_condition_timer<F, T>(
        &self,
        ms: u64,
        callback: F,
        condition: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if condition.upgrade().is_some() {
                    callback();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline, 0 if one is already due,
    /// `None` if no timer is armed. Re-enables the front hook.
    pub fn next_timer(&self) -> Option<u64> {
        self.shared.tickled.store(false, Ordering::Release);
        let queue = self.shared.queue.read();
        let first = queue.timers.keys().next()?;
        Some(first.deadline.saturating_sub(self.shared.clock.now_ms()))
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.queue.read().timers.is_empty()
    }

    pub fn timer_count(&self) -> usize {
        self.shared.queue.read().timers.len()
    }

    /// Move the callbacks of every due timer into `out`, earliest first.
    /// Recurring timers are re-armed at now + interval.
    pub fn list_expired_callbacks(&self, out: &mut Vec<TimerCallback>) {
        let shared = &self.shared;
        let now = shared.clock.now_ms();
        if shared.queue.read().timers.is_empty() {
            return;
        }

        let mut queue = shared.queue.write();
        if queue.timers.is_empty() {
            return;
        }
        let rollover = self.detect_rollover(&mut queue, now);
        let first_due = queue
            .timers
            .keys()
            .next()
            .is_some_and(|k| k.deadline <= now);
        if !rollover && !first_due {
            return;
        }

        let expired = if rollover {
            mem::take(&mut queue.timers)
        } else {
            let later = queue.timers.split_off(&TimerKey {
                deadline: now.saturating_add(1),
                id: 0,
            });
            mem::replace(&mut queue.timers, later)
        };

        out.reserve(expired.len());
        for timer in expired.into_values() {
            if timer.recurring {
                let callback = timer.callback.lock().clone();
                if let Some(callback) = callback {
                    out.push(callback);
                    timer
                        .deadline
                        .store(now.saturating_add(timer.interval_ms()), Ordering::Release);
                    queue.timers.insert(timer.key(), timer);
                }
            } else if let Some(callback) = timer.callback.lock().take() {
                out.push(callback);
            }
        }
    }

    fn detect_rollover(&self, queue: &mut TimerQueue, now: u64) -> bool {
        let previous = queue.previous_ms;
        queue.previous_ms = now;
        let rollover = now < previous.saturating_sub(self.shared.rollover_threshold_ms);
        if rollover {
            tracing::debug!(now, previous, "clock moved backwards; treating all timers as due");
        }
        rollover
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerManager")
            .field("timers", &self.timer_count())
            .finish()
    }
}
