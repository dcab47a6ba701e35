// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stackful fibers.
//!
//! A fiber owns a stack and a saved machine context. Switching is explicit:
//! the scheduler resumes a fiber with `swap_in`, the fiber gives the thread
//! back with `swap_out` (usually via `yield_to_hold` / `yield_to_ready`).
//!
//! Per OS thread there are three slots:
//! - the current fiber (non-owning, valid while it runs),
//! - the thread root, a fiber standing for the thread's native stack,
//! - the scheduler fiber, which `swap_in`/`swap_out` switch against. It is
//!   the thread root unless a scheduler installed its own loop fiber.
//!
//! A suspended fiber may be resumed on a different thread than the one it
//! left, so thread-local slots are always re-read after a switch.

mod context;
mod stack;

use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::DEFAULT_STACK_SIZE;
use context::ExecutionContext;
use stack::Stack;

pub use stack::MIN_STACK_SIZE;

/// Fiber lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Created or reset, never run.
    Init = 0,
    /// Running on some thread.
    Exec = 1,
    /// Suspended, waiting for someone to reschedule it.
    Hold = 2,
    /// Suspended and due to be queued again.
    Ready = 3,
    /// Entry returned.
    Term = 4,
    /// Entry panicked.
    Except = 5,
}

impl FiberState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::Exec,
            2 => Self::Hold,
            3 => Self::Ready,
            4 => Self::Term,
            _ => Self::Except,
        }
    }

    /// `Term` or `Except`.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Term | Self::Except)
    }
}

type Entry = Box<dyn FnOnce() + Send + 'static>;

/// Where a fiber's context goes when it suspends or finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReturnTo {
    /// The thread's scheduler fiber (`swap_out`).
    Scheduler,
    /// The thread root (`back`). Used by a scheduler loop running on the
    /// caller thread.
    Thread,
}

struct Failure {
    message: String,
    backtrace: Option<Backtrace>,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static LIVE: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT: Cell<*const Fiber> = const { Cell::new(ptr::null()) };
    static SCHEDULER_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };
    static THREAD_ROOT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

pub struct Fiber {
    id: u64,
    state: AtomicU8,
    /// Set from resume until the resumer regains control, i.e. until this
    /// fiber's context has been fully saved again.
    running: AtomicBool,
    ctx: Box<ExecutionContext>,
    /// `None` for a thread root, which runs on the thread's own stack.
    stack: Option<Stack>,
    entry: UnsafeCell<Option<Entry>>,
    returns_to: ReturnTo,
    failure: Mutex<Option<Failure>>,
}

// The entry slot and context are only touched by whoever currently owns
// the right to run the fiber (it is not running, or it is running on
// the accessing thread).
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// New fiber with the default stack size.
    pub fn new<F>(entry: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(entry, DEFAULT_STACK_SIZE)
    }

    /// New fiber with at least `stack_size` bytes of stack, rounded up to
    /// whole pages and to [`MIN_STACK_SIZE`]. Overflowing the stack hits a
    /// guard page and kills the process with `SIGSEGV`.
    pub fn with_stack_size<F>(entry: F, stack_size: usize) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(Box::new(entry), stack_size, ReturnTo::Scheduler)
    }

    /// Fiber that hands control back to the thread root instead of the
    /// scheduler fiber. Entered with `call`, leaves with `back`.
    pub(crate) fn caller_root<F>(entry: F, stack_size: usize) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(Box::new(entry), stack_size, ReturnTo::Thread)
    }

    fn build(entry: Entry, stack_size: usize, returns_to: ReturnTo) -> Arc<Fiber> {
        let stack = Stack::new(stack_size);
        let ctx = ExecutionContext::empty();
        if let Err(err) = unsafe { ctx.prepare(&stack, fiber_main) } {
            panic!("failed to prepare fiber context: {err}");
        }
        LIVE.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Init as u8),
            running: AtomicBool::new(false),
            ctx,
            stack: Some(stack),
            entry: UnsafeCell::new(Some(entry)),
            returns_to,
            failure: Mutex::new(None),
        })
    }

    /// Fiber describing the native stack of the calling thread.
    fn thread_root() -> Fiber {
        LIVE.fetch_add(1, Ordering::Relaxed);
        Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Exec as u8),
            running: AtomicBool::new(false),
            ctx: ExecutionContext::empty(),
            stack: None,
            entry: UnsafeCell::new(None),
            returns_to: ReturnTo::Thread,
            failure: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// True while another thread may still be saving this fiber's context.
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stack_size(&self) -> usize {
        self.stack.as_ref().map_or(0, Stack::size)
    }

    /// Panic message of a fiber that ended in `Except`.
    pub fn panic_message(&self) -> Option<String> {
        self.failure.lock().as_ref().map(|f| f.message.clone())
    }

    /// Log the recorded panic, once, with its backtrace.
    pub(crate) fn report_failure(&self) {
        let mut failure = self.failure.lock();
        if let Some(f) = failure.as_mut() {
            if let Some(backtrace) = f.backtrace.take() {
                tracing::error!(
                    fiber = self.id,
                    panic = %f.message,
                    backtrace = %backtrace,
                    "fiber terminated by panic"
                );
            }
        }
    }

    /// Install a new entry on a fiber that is not running, reusing its stack.
    ///
    /// Panics if the fiber is a thread root or is not in `Init`, `Term` or
    /// `Except`.
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = match self.stack.as_ref() {
            Some(stack) => stack,
            None => panic!("thread root fiber {} cannot be reset", self.id),
        };
        let state = self.state();
        assert!(
            matches!(state, FiberState::Init | FiberState::Term | FiberState::Except),
            "reset of fiber {} in state {:?}",
            self.id,
            state
        );
        unsafe {
            *self.entry.get() = Some(Box::new(entry));
            if let Err(err) = self.ctx.prepare(stack, fiber_main) {
                panic!("failed to prepare fiber context: {err}");
            }
        }
        *self.failure.lock() = None;
        self.set_state(FiberState::Init);
    }

    /// Switch from the thread's scheduler fiber into this one. Returns when
    /// this fiber suspends or finishes, with the state it left in.
    ///
    /// The returned state was read before the fiber became resumable
    /// elsewhere; `state()` afterwards may already reflect another worker.
    pub fn swap_in(&self) -> FiberState {
        self.resume_from(scheduler_fiber())
    }

    /// Switch from this fiber back to the thread's scheduler fiber.
    pub fn swap_out(&self) {
        self.suspend_to(scheduler_fiber());
    }

    /// Like `swap_in`, but switches from the thread root. Used to enter a
    /// scheduler loop fiber on the caller thread.
    pub fn call(&self) -> FiberState {
        self.resume_from(thread_root())
    }

    /// Inverse of `call`.
    pub fn back(&self) {
        self.suspend_to(thread_root());
    }

    fn resume_from(&self, from: *const Fiber) -> FiberState {
        assert!(!ptr::eq(from, self), "fiber {} cannot resume itself", self.id);
        let state = self.state();
        assert!(
            matches!(state, FiberState::Init | FiberState::Hold | FiberState::Ready),
            "resume of fiber {} in state {:?}",
            self.id,
            state
        );
        set_current(self);
        self.running.store(true, Ordering::Release);
        self.set_state(FiberState::Exec);
        // SAFETY: `from` is the fiber running on this thread; the slot it
        // saves into is its own context.
        if let Err(err) = unsafe { (*from).ctx.switch_to(&self.ctx) } {
            panic!("swapcontext into fiber {} failed: {err}", self.id);
        }
        // A bare `swap_out` leaves the state at Exec.
        let _ = self.state.compare_exchange(
            FiberState::Exec as u8,
            FiberState::Hold as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let left_in = self.state();
        self.running.store(false, Ordering::Release);
        left_in
    }

    fn suspend_to(&self, to: *const Fiber) {
        assert!(
            ptr::eq(current_ptr(), self),
            "fiber {} suspended while not running",
            self.id
        );
        set_current(to);
        // SAFETY: `to` is parked on this thread waiting for us to switch back.
        if let Err(err) = unsafe { self.ctx.switch_to(&(*to).ctx) } {
            panic!("swapcontext out of fiber {} failed: {err}", self.id);
        }
    }

    /// Give the thread back through whichever path this fiber came in on.
    fn suspend(&self) {
        match self.returns_to {
            ReturnTo::Scheduler => self.swap_out(),
            ReturnTo::Thread => self.back(),
        }
    }

    /// The fiber running on this thread. Creates the thread root on first
    /// use.
    pub fn current() -> Arc<Fiber> {
        let ptr = ensure_current();
        // SAFETY: the running fiber is kept alive by whoever resumed it, or
        // by THREAD_ROOT.
        unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        }
    }

    /// Id of the fiber running on this thread, 0 if none was ever set up.
    pub fn current_id() -> u64 {
        let ptr = current_ptr();
        if ptr.is_null() {
            0
        } else {
            unsafe { (*ptr).id }
        }
    }

    /// Number of fibers alive in the process, thread roots included.
    pub fn total() -> u64 {
        LIVE.load(Ordering::Relaxed)
    }

    /// Mark the running fiber `Ready` and suspend it. A scheduler worker
    /// queues it again as soon as the switch has completed.
    #[inline(never)]
    pub fn yield_to_ready() {
        let fiber = running_fiber();
        // SAFETY: the resumer holds a reference until we switch back.
        let fiber = unsafe { &*fiber };
        fiber.set_state(FiberState::Ready);
        fiber.suspend();
    }

    /// Mark the running fiber `Hold` and suspend it. Something that captured
    /// it (an event registration, a timer) must schedule it again.
    #[inline(never)]
    pub fn yield_to_hold() {
        let fiber = running_fiber();
        let fiber = unsafe { &*fiber };
        fiber.set_state(FiberState::Hold);
        fiber.suspend();
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack_size", &self.stack_size())
            .finish()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            let state = self.state();
            if matches!(state, FiberState::Hold | FiberState::Ready) {
                // Frames still on the stack are discarded without running
                // their destructors.
                tracing::debug!(fiber = self.id, ?state, "dropping suspended fiber");
            }
        }
    }
}

/// First frame of every fiber stack.
extern "C" fn fiber_main() {
    let raw = {
        let fiber = Fiber::current();
        run_entry(&fiber);
        Arc::as_ptr(&fiber)
    };
    // SAFETY: the resumer still holds a reference; nothing owned by this
    // frame is alive past this point.
    unsafe { (*raw).suspend() };
    tracing::error!("finished fiber was resumed");
    std::process::abort();
}

fn run_entry(fiber: &Fiber) {
    let entry = unsafe { (*fiber.entry.get()).take() };
    let Some(entry) = entry else {
        fiber.set_state(FiberState::Term);
        return;
    };
    match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(()) => fiber.set_state(FiberState::Term),
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "non-string panic payload".to_string()
            };
            *fiber.failure.lock() = Some(Failure {
                message,
                backtrace: Some(Backtrace::force_capture()),
            });
            fiber.set_state(FiberState::Except);
        }
    }
}

#[inline(never)]
fn current_ptr() -> *const Fiber {
    CURRENT.with(|c| c.get())
}

#[inline(never)]
fn set_current(fiber: *const Fiber) {
    CURRENT.with(|c| c.set(fiber));
}

/// Current fiber, which must not be the thread root.
fn running_fiber() -> *const Fiber {
    let ptr = current_ptr();
    assert!(!ptr.is_null(), "no fiber is running on this thread");
    assert!(
        unsafe { (*ptr).stack.is_some() },
        "the thread root cannot yield"
    );
    ptr
}

#[inline(never)]
fn thread_root() -> *const Fiber {
    THREAD_ROOT.with(|root| {
        let mut root = root.borrow_mut();
        let fiber = root.get_or_insert_with(|| Arc::new(Fiber::thread_root()));
        Arc::as_ptr(fiber)
    })
}

#[inline(never)]
fn ensure_current() -> *const Fiber {
    let ptr = current_ptr();
    if !ptr.is_null() {
        return ptr;
    }
    let root = thread_root();
    set_current(root);
    root
}

#[inline(never)]
fn scheduler_fiber() -> *const Fiber {
    let ptr = SCHEDULER_FIBER.with(|s| s.get());
    if !ptr.is_null() {
        return ptr;
    }
    ensure_current();
    thread_root()
}

/// Make `fiber` the one `swap_in`/`swap_out` switch against on this thread.
/// `None` restores the thread root.
#[inline(never)]
pub(crate) fn set_scheduler_fiber(fiber: Option<&Fiber>) {
    let ptr = fiber.map_or(ptr::null(), |f| f as *const Fiber);
    SCHEDULER_FIBER.with(|s| s.set(ptr));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_to_completion() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), FiberState::Init);
        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hold_and_resume() {
        let steps = Arc::new(Mutex::new(Vec::new()));
        let s = steps.clone();
        let fiber = Fiber::new(move || {
            s.lock().push(1);
            Fiber::yield_to_hold();
            s.lock().push(3);
            Fiber::yield_to_ready();
            s.lock().push(5);
        });

        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Hold);
        steps.lock().push(2);

        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Ready);
        steps.lock().push(4);

        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(*steps.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn current_inside_and_outside() {
        let root_id = Fiber::current().id();
        assert_eq!(Fiber::current_id(), root_id);

        let seen = Arc::new(AtomicU64::new(0));
        let s = seen.clone();
        let fiber = Fiber::new(move || {
            s.store(Fiber::current_id(), Ordering::SeqCst);
        });
        fiber.swap_in();
        assert_eq!(seen.load(Ordering::SeqCst), fiber.id());
        assert_eq!(Fiber::current_id(), root_id);
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = Fiber::new(|| {});
        let b = Fiber::new(|| {});
        assert!(b.id() > a.id());
    }

    #[test]
    fn reset_reuses_the_stack() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::with_stack_size(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            64 * 1024,
        );
        let size = fiber.stack_size();
        fiber.swap_in();

        let h = hits.clone();
        fiber.reset(move || {
            h.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), FiberState::Init);
        assert_eq!(fiber.stack_size(), size);
        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    #[should_panic(expected = "reset of fiber")]
    fn reset_while_suspended_panics() {
        let fiber = Fiber::new(Fiber::yield_to_hold);
        fiber.swap_in();
        fiber.reset(|| {});
    }

    #[test]
    fn panic_ends_in_except() {
        let fiber = Fiber::new(|| panic!("boom"));
        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Except);
        assert_eq!(fiber.panic_message().as_deref(), Some("boom"));
        fiber.report_failure();

        // A failed fiber can be reused.
        fiber.reset(|| {});
        assert_eq!(fiber.panic_message(), None);
        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn live_count_includes_new_fibers() {
        let fiber = Fiber::new(|| {});
        // Other tests run concurrently; the exact delta is checked in
        // tests/live_count.rs, which runs alone.
        assert!(Fiber::total() >= 1);
        drop(fiber);
    }

    #[test]
    fn call_and_back_use_the_thread_root() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::caller_root(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            DEFAULT_STACK_SIZE,
        );
        fiber.call();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fiber_migrates_between_threads() {
        let fiber = Fiber::new(|| {
            let first = std::thread::current().id();
            Fiber::yield_to_hold();
            assert_ne!(first, std::thread::current().id());
        });
        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Hold);

        let f = fiber.clone();
        std::thread::spawn(move || f.swap_in()).join().unwrap();
        assert_eq!(fiber.state(), FiberState::Term);
    }
}
