// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Ready queue shared by all workers of a scheduler.
//!
//! One mutex-protected FIFO. Tasks may be pinned to a worker thread; a
//! worker skips tasks pinned elsewhere and reports that it did so, so the
//! caller can wake someone else. Fibers whose context is still being saved
//! by another worker are skipped too.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::fiber::Fiber;

/// A unit of work: a fiber to resume or a closure to run on a fresh fiber.
pub enum Work {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send + 'static>),
}

impl Work {
    pub fn call<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Work::Call(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Work {
    fn from(fiber: Arc<Fiber>) -> Self {
        Work::Fiber(fiber)
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Work::Fiber(fiber) => f.debug_tuple("Fiber").field(&fiber.id()).finish(),
            Work::Call(_) => f.write_str("Call"),
        }
    }
}

/// Queued work plus optional thread affinity.
#[derive(Debug)]
pub(crate) struct Task {
    pub work: Work,
    pub thread: Option<ThreadId>,
}

pub(crate) struct TaskQueue {
    queue: Mutex<VecDeque<Task>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Append one task. Returns whether the queue was empty before.
    pub fn push(&self, task: Task) -> bool {
        let mut q = self.queue.lock();
        let was_empty = q.is_empty();
        debug_assert_not_queued(&q, &task);
        q.push_back(task);
        was_empty
    }

    /// Append many tasks under one lock acquisition. Returns whether the
    /// queue was empty before.
    pub fn push_batch<I>(&self, tasks: I) -> bool
    where
        I: IntoIterator<Item = Task>,
    {
        let mut q = self.queue.lock();
        let was_empty = q.is_empty();
        for task in tasks {
            debug_assert_not_queued(&q, &task);
            q.push_back(task);
        }
        was_empty
    }

    /// Remove the first task `thread` may run and bump `active` while the
    /// lock is held, so "queue empty and nobody active" is never observed
    /// in between.
    ///
    /// The flag is true when runnable work was left behind for someone else.
    pub fn take(&self, thread: ThreadId, active: &AtomicUsize) -> (Option<Task>, bool) {
        let mut q = self.queue.lock();
        let mut tickle = false;
        let mut found = None;
        for (i, task) in q.iter().enumerate() {
            if task.thread.is_some_and(|t| t != thread) {
                tickle = true;
                continue;
            }
            if let Work::Fiber(fiber) = &task.work {
                if fiber.is_running() {
                    continue;
                }
            }
            found = Some(i);
            break;
        }
        let task = found.and_then(|i| {
            let task = q.remove(i);
            tickle |= i < q.len();
            task
        });
        if task.is_some() {
            active.fetch_add(1, Ordering::SeqCst);
        }
        (task, tickle)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

fn debug_assert_not_queued(q: &VecDeque<Task>, task: &Task) {
    if cfg!(debug_assertions) {
        if let Work::Fiber(fiber) = &task.work {
            let dup = q.iter().any(|t| matches!(&t.work, Work::Fiber(f) if Arc::ptr_eq(f, fiber)));
            assert!(!dup, "fiber {} queued twice", fiber.id());
        }
    }
}
