// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! N:M fiber scheduler.
//!
//! A fixed pool of worker threads pulls work from one shared queue and runs
//! it on fibers. A worker with nothing to do switches into its idle fiber,
//! whose body is provided by the scheduler's [`Driver`]. The cooperative
//! driver just yields; the reactor blocks in `epoll_wait`.
//!
//! With `use_caller` the constructing thread is one of the workers: it gets
//! a root fiber running the worker loop, entered from `stop()`.

mod queue;

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Mutex, RwLock};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::fiber::{self, Fiber, FiberState};
use queue::{Task, TaskQueue};

pub use queue::Work;

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Weak<Shared>>> = const { RefCell::new(None) };
}

/// Hooks that specialize a scheduler.
///
/// All three run on worker threads. `idle` is the body of every worker's
/// idle fiber: it must return once `stopping` holds, and should suspend
/// with `Fiber::yield_to_hold` whenever there may be new work.
pub trait Driver: Send + Sync + 'static {
    /// Wake one idle worker because work was queued.
    fn tickle(&self, _scheduler: &Handle) {}

    fn idle(&self, scheduler: &Handle) {
        while !scheduler.stopping() {
            thread::yield_now();
            Fiber::yield_to_hold();
        }
    }

    /// Whether workers may exit.
    fn stopping(&self, scheduler: &Handle) -> bool {
        scheduler.queue_drained()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Driver without I/O: idle workers spin through `yield_now`.
#[derive(Debug, Default)]
pub struct Cooperative;

impl Driver for Cooperative {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub(crate) struct Shared {
    name: String,
    stack_size: usize,
    /// Threads spawned by `start`, not counting the caller.
    spawn_count: usize,
    queue: TaskQueue,
    driver: Arc<dyn Driver>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: RwLock<Vec<ThreadId>>,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    started: AtomicBool,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    stopped: AtomicBool,
    /// Worker loop for the caller thread when `use_caller` is set.
    root_fiber: Option<Arc<Fiber>>,
    root_thread: Option<ThreadId>,
}

/// Cheap, cloneable reference to a scheduler. Everything except start and
/// stop goes through here.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

/// Non-owning counterpart of [`Handle`].
#[derive(Clone)]
pub struct WeakHandle {
    shared: Weak<Shared>,
}

impl WeakHandle {
    pub fn upgrade(&self) -> Option<Handle> {
        self.shared.upgrade().map(|shared| Handle { shared })
    }
}

impl Handle {
    /// Scheduler the calling thread works for, if any.
    pub fn current() -> Option<Handle> {
        CURRENT_SCHEDULER
            .with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
            .map(|shared| Handle { shared })
    }

    pub fn downgrade(&self) -> WeakHandle {
        WeakHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Ids of every worker thread, the caller first when it participates.
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.shared.thread_ids.read().clone()
    }

    /// Stack size used for fibers the scheduler creates.
    pub fn stack_size(&self) -> usize {
        self.shared.stack_size
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.shared.driver
    }

    /// The driver as its concrete type.
    pub fn driver_as<T: Driver>(&self) -> Option<Arc<T>> {
        self.shared.driver.clone().into_any().downcast::<T>().ok()
    }

    pub fn ptr_eq(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Run `f` on some worker.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_work(Work::call(f), None);
    }

    /// Run `f` on the worker thread `thread`.
    pub fn schedule_on<F>(&self, f: F, thread: ThreadId)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_work(Work::call(f), Some(thread));
    }

    /// Resume `fiber` on some worker.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.schedule_work(Work::Fiber(fiber), None);
    }

    /// Queue `work`, optionally pinned to one worker thread.
    pub fn schedule_work(&self, work: Work, thread: Option<ThreadId>) {
        if self.shared.queue.push(Task { work, thread }) {
            self.tickle();
        }
    }

    /// Queue several unpinned items with a single lock acquisition and at
    /// most one wake-up.
    pub fn schedule_batch<I>(&self, work: I)
    where
        I: IntoIterator<Item = Work>,
    {
        let tasks = work.into_iter().map(|work| Task { work, thread: None });
        if self.shared.queue.push_batch(tasks) {
            self.tickle();
        }
    }

    /// Items waiting in the queue.
    pub fn pending_work(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn has_idle_threads(&self) -> bool {
        self.shared.idle_threads.load(Ordering::SeqCst) > 0
    }

    pub fn active_threads(&self) -> usize {
        self.shared.active_threads.load(Ordering::SeqCst)
    }

    /// True once workers may exit, as decided by the driver.
    pub fn stopping(&self) -> bool {
        self.shared.driver.stopping(self)
    }

    /// Stop was requested, the queue is empty and no worker is running
    /// anything.
    pub fn queue_drained(&self) -> bool {
        let shared = &self.shared;
        shared.auto_stop.load(Ordering::SeqCst)
            && shared.stopping.load(Ordering::SeqCst)
            && shared.queue.is_empty()
            && shared.active_threads.load(Ordering::SeqCst) == 0
    }

    fn tickle(&self) {
        self.shared.driver.tickle(self);
    }

    fn set_current(&self) {
        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(Arc::downgrade(&self.shared)));
    }

    fn is_current(&self) -> bool {
        Handle::current().is_some_and(|h| h.ptr_eq(self))
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.shared.name)
            .field("pending", &self.shared.queue.len())
            .field("active", &self.active_threads())
            .finish()
    }
}

/// Owner of a scheduler. Dropping it stops the scheduler.
pub struct Scheduler {
    handle: Handle,
}

impl Scheduler {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self::with_driver(config, Arc::new(Cooperative))
    }

    /// Scheduler whose idle, tickle and stop behavior come from `driver`.
    ///
    /// With `config.use_caller` the calling thread becomes a worker and
    /// `stop()` has to be called from it.
    pub fn with_driver(config: &RuntimeConfig, driver: Arc<dyn Driver>) -> Self {
        let threads = config.threads.max(1);
        let use_caller = config.use_caller;
        let caller = thread::current().id();
        if use_caller {
            debug_assert!(
                Handle::current().is_none(),
                "thread already belongs to a scheduler"
            );
            Fiber::current();
        }

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let root_fiber = use_caller.then(|| {
                let weak = weak.clone();
                Fiber::caller_root(
                    move || {
                        if let Some(shared) = weak.upgrade() {
                            run(Handle { shared });
                        }
                    },
                    config.stack_size,
                )
            });
            Shared {
                name: config.name.clone(),
                stack_size: config.stack_size,
                spawn_count: if use_caller { threads - 1 } else { threads },
                queue: TaskQueue::new(),
                driver,
                workers: Mutex::new(Vec::new()),
                thread_ids: RwLock::new(if use_caller { vec![caller] } else { Vec::new() }),
                active_threads: AtomicUsize::new(0),
                idle_threads: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                auto_stop: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                root_fiber,
                root_thread: use_caller.then_some(caller),
            }
        });

        let handle = Handle { shared };
        if let Some(root) = &handle.shared.root_fiber {
            handle.set_current();
            fiber::set_scheduler_fiber(Some(root));
        }
        tracing::debug!(scheduler = %config.name, threads, use_caller, "scheduler created");
        Self { handle }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn the worker threads. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        let shared = &self.handle.shared;
        if shared.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut workers = shared.workers.lock();
        for i in 0..shared.spawn_count {
            let name = format!("{}-worker-{}", shared.name, i);
            let handle = self.handle.clone();
            let worker = thread::Builder::new()
                .name(name.clone())
                .spawn(move || run(handle))
                .map_err(|source| Error::Spawn { name, source })?;
            shared.thread_ids.write().push(worker.thread().id());
            workers.push(worker);
        }
        tracing::debug!(scheduler = %shared.name, workers = workers.len(), "scheduler started");
        Ok(())
    }

    /// Drain the queue, then stop and join every worker.
    ///
    /// With `use_caller` this runs the caller's share of the work before
    /// returning, and must be called from the constructing thread outside
    /// of any fiber.
    pub fn stop(&self) {
        let handle = &self.handle;
        let shared = &handle.shared;
        let me = thread::current().id();

        if shared.root_thread.is_some_and(|t| t != me) {
            tracing::error!(
                scheduler = %shared.name,
                "stop called off the thread that created the scheduler"
            );
            return;
        }
        if shared.root_thread.is_none() && handle.is_current() {
            tracing::error!(scheduler = %shared.name, "stop called from one of its own workers");
            return;
        }
        if shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        shared.auto_stop.store(true, Ordering::SeqCst);
        shared.stopping.store(true, Ordering::SeqCst);
        for _ in 0..shared.spawn_count {
            handle.tickle();
        }

        if let Some(root) = &shared.root_fiber {
            handle.tickle();
            if !handle.stopping() && root.state() == FiberState::Init {
                root.call();
            }
        }

        let workers = mem::take(&mut *shared.workers.lock());
        for worker in workers {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                tracing::error!(scheduler = %shared.name, worker = %name, "worker thread panicked");
            }
        }
        tracing::debug!(scheduler = %shared.name, "scheduler stopped");
    }
}

impl Deref for Scheduler {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
        let shared = &self.handle.shared;
        if shared.root_thread == Some(thread::current().id()) {
            fiber::set_scheduler_fiber(None);
            if self.handle.is_current() {
                CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = None);
            }
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.handle.fmt(f)
    }
}

/// Worker loop. Runs on spawned threads and inside the caller's root fiber.
fn run(handle: Handle) {
    let shared = &handle.shared;
    let me = thread::current().id();
    handle.set_current();
    Fiber::current();
    tracing::trace!(scheduler = %shared.name, "worker running");

    let idle_fiber = {
        let handle = handle.clone();
        Fiber::with_stack_size(
            move || {
                let driver = handle.driver().clone();
                driver.idle(&handle);
            },
            shared.stack_size,
        )
    };
    // Finished callback fibers are reset and reused for the next closure.
    let mut spare: Option<Arc<Fiber>> = None;

    loop {
        let (task, tickle_me) = shared.queue.take(me, &shared.active_threads);
        if tickle_me {
            handle.tickle();
        }

        match task.map(|t| t.work) {
            Some(Work::Fiber(fiber)) => {
                if fiber.state().is_finished() {
                    shared.active_threads.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }
                let left_in = fiber.swap_in();
                shared.active_threads.fetch_sub(1, Ordering::SeqCst);
                after_switch(&handle, &fiber, left_in);
            }
            Some(Work::Call(f)) => {
                let fiber = match spare.take() {
                    Some(fiber) => {
                        fiber.reset(f);
                        fiber
                    }
                    None => Fiber::with_stack_size(f, shared.stack_size),
                };
                let left_in = fiber.swap_in();
                shared.active_threads.fetch_sub(1, Ordering::SeqCst);
                if after_switch(&handle, &fiber, left_in) && Arc::strong_count(&fiber) == 1 {
                    spare = Some(fiber);
                }
            }
            None => {
                if idle_fiber.state() == FiberState::Term {
                    break;
                }
                shared.idle_threads.fetch_add(1, Ordering::SeqCst);
                let left_in = idle_fiber.swap_in();
                shared.idle_threads.fetch_sub(1, Ordering::SeqCst);
                if left_in == FiberState::Except {
                    idle_fiber.report_failure();
                    break;
                }
            }
        }
    }
    tracing::trace!(scheduler = %shared.name, "worker exiting");
}

/// Settle a fiber that just gave the thread back in state `left_in`.
/// Returns whether it finished.
fn after_switch(handle: &Handle, fiber: &Arc<Fiber>, left_in: FiberState) -> bool {
    match left_in {
        FiberState::Ready => {
            handle.schedule_fiber(fiber.clone());
            false
        }
        FiberState::Term => true,
        FiberState::Except => {
            fiber.report_failure();
            true
        }
        // Hold: whoever captured it will schedule it again.
        _ => false,
    }
}
