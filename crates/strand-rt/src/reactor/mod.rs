// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Reactor: turns epoll readiness and timer expiry into scheduled work.
//!
//! The reactor is a scheduler [`Driver`]. Its idle hook blocks in
//! `epoll_wait` for at most the time until the next timer (capped at
//! `max_wait_ms`), then queues due timer callbacks and fired registrations.
//! Several idle workers may wait on the same epoll instance at once;
//! firing a direction clears it under the descriptor's lock, so it is handed
//! out exactly once.
//!
//! Registrations are edge-triggered and one-shot per direction: after a
//! direction fires it has to be registered again.

mod fd;
mod poller;

use std::fmt;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::clock::{Clock, SystemClock};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::fiber::{Fiber, FiberState};
use crate::scheduler::{Driver, Handle, Scheduler, WeakHandle, Work};
use crate::timer::{Timer, TimerManager};
use fd::{FdState, FdTable};
use poller::{Poller, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT};

/// Readiness direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Read,
    Write,
}

impl Event {
    pub(crate) fn bits(self) -> u32 {
        match self {
            Event::Read => EPOLLIN,
            Event::Write => EPOLLOUT,
        }
    }
}

pub struct Reactor {
    poller: Poller,
    fds: FdTable,
    /// Registered directions not yet fired or removed.
    pending_events: AtomicUsize,
    timers: TimerManager,
    /// Scheduler that registrations made off-worker are handed to.
    scheduler: OnceLock<WeakHandle>,
    max_wait_ms: u64,
    max_events: usize,
}

impl Reactor {
    pub fn new(config: &RuntimeConfig, timers: TimerManager) -> Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            fds: FdTable::with_capacity(config.initial_fd_capacity),
            pending_events: AtomicUsize::new(0),
            timers,
            scheduler: OnceLock::new(),
            max_wait_ms: config.max_wait_ms,
            max_events: config.max_events.max(1),
        })
    }

    /// Reactor driving the scheduler of the calling worker thread.
    pub fn current() -> Option<Arc<Reactor>> {
        Handle::current()?.driver_as::<Reactor>()
    }

    /// Bind to the scheduler this reactor drives. New front timers will
    /// wake an idle worker from then on.
    fn attach(&self, handle: &Handle) {
        let weak = handle.downgrade();
        if self.scheduler.set(weak.clone()).is_err() {
            return;
        }
        self.timers.on_insert_at_front(move || {
            if let Some(handle) = weak.upgrade() {
                handle.driver().tickle(&handle);
            }
        });
    }

    fn owner(&self) -> Option<Handle> {
        Handle::current().or_else(|| self.scheduler.get()?.upgrade())
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    pub fn pending_events(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    pub fn fd_capacity(&self) -> usize {
        self.fds.capacity()
    }

    pub fn is_registered(&self, fd: RawFd, event: Event) -> bool {
        self.fds
            .get(fd)
            .is_some_and(|ctx| ctx.state.lock().has(event))
    }

    /// Register `event` on `fd` and resume the calling fiber when it fires.
    /// The caller normally follows up with `Fiber::yield_to_hold`.
    ///
    /// Panics when called outside of a running fiber.
    pub fn add_event(&self, fd: RawFd, event: Event) -> Result<()> {
        let fiber = Fiber::current();
        assert!(
            fiber.stack_size() > 0 && fiber.state() == FiberState::Exec,
            "add_event without a callback must be called from a running fiber"
        );
        self.register(fd, event, Work::Fiber(fiber))
    }

    /// Register `event` on `fd` and run `callback` on a worker when it fires.
    pub fn add_event_with<F>(&self, fd: RawFd, event: Event, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.register(fd, event, Work::call(callback))
    }

    fn register(&self, fd: RawFd, event: Event, work: Work) -> Result<()> {
        let Some(ctx) = self.fds.get_or_grow(fd) else {
            return Err(Error::Register {
                op: "ADD",
                fd,
                events: event.bits(),
                source: std::io::Error::from_raw_os_error(libc::EBADF),
            });
        };
        let mut state = ctx.state.lock();
        debug_assert!(!state.has(event), "{event:?} registered twice on fd {fd}");
        if state.has(event) {
            tracing::error!(fd, ?event, "direction already registered");
            return Err(Error::AlreadyRegistered { fd, event });
        }

        let op = if state.events == 0 {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.poller
            .ctl(op, fd, EPOLLET | state.events | event.bits())?;

        self.pending_events.fetch_add(1, Ordering::SeqCst);
        state.events |= event.bits();
        let slot = state.context_mut(event);
        debug_assert!(slot.is_empty());
        slot.scheduler = self.owner();
        slot.work = Some(work);
        Ok(())
    }

    /// Remove `event` from `fd` without firing it. Returns whether it was
    /// registered.
    pub fn del_event(&self, fd: RawFd, event: Event) -> Result<bool> {
        self.remove(fd, event, false)
    }

    /// Remove `event` from `fd` and fire it as if it had become ready.
    /// Returns whether it was registered.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> Result<bool> {
        self.remove(fd, event, true)
    }

    fn remove(&self, fd: RawFd, event: Event, fire: bool) -> Result<bool> {
        let Some(ctx) = self.fds.get(fd) else {
            return Ok(false);
        };
        let mut state = ctx.state.lock();
        if !state.has(event) {
            return Ok(false);
        }

        let left = state.events & !event.bits();
        self.update(fd, left)?;
        if fire {
            self.trigger(&mut state, fd, event);
        } else {
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
            state.events = left;
            state.context_mut(event).clear();
        }
        Ok(true)
    }

    /// Fire every registered direction of `fd` and drop it from epoll.
    /// Returns whether anything was registered.
    pub fn cancel_all(&self, fd: RawFd) -> Result<bool> {
        let Some(ctx) = self.fds.get(fd) else {
            return Ok(false);
        };
        let mut state = ctx.state.lock();
        if state.events == 0 {
            return Ok(false);
        }

        self.update(fd, 0)?;
        for event in [Event::Read, Event::Write] {
            if state.has(event) {
                self.trigger(&mut state, fd, event);
            }
        }
        debug_assert_eq!(state.events, 0);
        Ok(true)
    }

    /// Point epoll at the directions `left`, deleting the fd when none are.
    fn update(&self, fd: RawFd, left: u32) -> Result<()> {
        let op = if left == 0 {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.poller.ctl(op, fd, EPOLLET | left)
    }

    fn trigger(&self, state: &mut FdState, fd: RawFd, event: Event) {
        if state.trigger(fd, event) {
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Whether workers may exit, and the time until the next timer.
    fn stopping_with_timeout(&self, scheduler: &Handle) -> (bool, Option<u64>) {
        let next = self.timers.next_timer();
        let stop = next.is_none()
            && self.pending_events.load(Ordering::SeqCst) == 0
            && scheduler.queue_drained();
        (stop, next)
    }

    fn dispatch(&self, ready: &libc::epoll_event) {
        let fd = ready.u64 as RawFd;
        if self.poller.is_wake_fd(fd) {
            self.poller.drain_wake();
            return;
        }
        let Some(ctx) = self.fds.get(fd) else {
            return;
        };
        debug_assert_eq!(ctx.fd, fd);
        let mut state = ctx.state.lock();

        let mut flags = ready.events;
        if flags & (EPOLLERR | EPOLLHUP) != 0 {
            flags |= (EPOLLIN | EPOLLOUT) & state.events;
        }
        let realized = flags & state.events & (EPOLLIN | EPOLLOUT);
        if realized == 0 {
            return;
        }

        let left = state.events & !realized;
        if self.update(fd, left).is_err() {
            return;
        }
        for event in [Event::Read, Event::Write] {
            if realized & event.bits() != 0 {
                self.trigger(&mut state, fd, event);
            }
        }
    }

    /// Arm a timer on this reactor's timer manager.
    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, callback, recurring)
    }

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
        self.timers.add_condition_timer(ms, callback, condition, recurring)
    }

    pub fn has_timer(&self) -> bool {
        self.timers.has_timer()
    }
}

impl Driver for Reactor {
    fn tickle(&self, scheduler: &Handle) {
        if !scheduler.has_idle_threads() {
            return;
        }
        tracing::trace!(scheduler = %scheduler.name(), "waking idle worker");
        self.poller.wake();
    }

    fn idle(&self, scheduler: &Handle) {
        let mut ready = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];
        let mut expired = Vec::new();
        loop {
            let (stop, next) = self.stopping_with_timeout(scheduler);
            if stop {
                tracing::info!(scheduler = %scheduler.name(), "reactor idle loop exiting");
                break;
            }

            let timeout = next.map_or(self.max_wait_ms, |ms| ms.min(self.max_wait_ms));
            let n = match self.poller.wait(&mut ready, timeout) {
                Ok(n) => n,
                Err(err) => {
                    tracing::error!(error = %err, "epoll_wait failed");
                    0
                }
            };

            self.timers.list_expired_callbacks(&mut expired);
            if !expired.is_empty() {
                scheduler.schedule_batch(expired.drain(..).map(|cb| Work::call(move || cb())));
            }

            for event in &ready[..n] {
                self.dispatch(event);
            }

            Fiber::yield_to_hold();
        }
    }

    fn stopping(&self, scheduler: &Handle) -> bool {
        self.stopping_with_timeout(scheduler).0
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("pending_events", &self.pending_events())
            .field("timers", &self.timers)
            .field("fd_capacity", &self.fd_capacity())
            .finish()
    }
}

/// A scheduler driven by a [`Reactor`], started on construction.
///
/// Derefs to the [`Scheduler`] for work submission; readiness and timer
/// operations are forwarded to the reactor.
pub struct IoManager {
    scheduler: Scheduler,
    reactor: Arc<Reactor>,
}

impl IoManager {
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Like `new`, with timers read from `clock`.
    pub fn with_clock(config: &RuntimeConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let timers = TimerManager::with_clock(clock, config.rollover_threshold_ms);
        let reactor = Arc::new(Reactor::new(config, timers)?);
        let scheduler = Scheduler::with_driver(config, reactor.clone());
        reactor.attach(scheduler.handle());
        scheduler.start()?;
        Ok(Self { scheduler, reactor })
    }

    /// Reactor of the calling worker thread.
    pub fn current() -> Option<Arc<Reactor>> {
        Reactor::current()
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub fn add_event(&self, fd: RawFd, event: Event) -> Result<()> {
        self.reactor.add_event(fd, event)
    }

    pub fn add_event_with<F>(&self, fd: RawFd, event: Event, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.reactor.add_event_with(fd, event, callback)
    }

    pub fn del_event(&self, fd: RawFd, event: Event) -> Result<bool> {
        self.reactor.del_event(fd, event)
    }

    pub fn cancel_event(&self, fd: RawFd, event: Event) -> Result<bool> {
        self.reactor.cancel_event(fd, event)
    }

    pub fn cancel_all(&self, fd: RawFd) -> Result<bool> {
        self.reactor.cancel_all(fd)
    }

    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reactor.add_timer(ms, callback, recurring)
    }

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
        self.reactor.add_condition_timer(ms, callback, condition, recurring)
    }

    pub fn has_timer(&self) -> bool {
        self.reactor.has_timer()
    }
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl fmt::Debug for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.scheduler)
            .field("reactor", &self.reactor)
            .finish()
    }
}
