// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Strand runtime: stackful fibers on a worker pool.
//!
//! Fibers are cooperative. A fiber keeps its worker until it yields, parks
//! on an I/O registration or timer, or returns. The reactor turns epoll
//! readiness and timer expiry back into scheduled work.
//!
//! Components:
//! - fiber: stacks, context switching, per-thread current fiber
//! - scheduler: shared ready queue, worker threads, idle/tickle hooks
//! - timer: ordered deadline timers with clock-rollover recovery
//! - reactor: epoll driver and `IoManager`
//! - io/sleep: blocking-style helpers that park the calling fiber
//!
//! Linux with glibc only.

pub mod clock;
pub mod config;
pub mod error;
pub mod fiber;
pub mod io;
pub mod reactor;
pub mod scheduler;
pub mod sleep;
pub mod timer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use fiber::{Fiber, FiberState};
pub use io::FiberStream;
pub use reactor::{Event, IoManager, Reactor};
pub use scheduler::{Driver, Handle, Scheduler, Work};
pub use sleep::{sleep, sleep_ms};
pub use timer::{Timer, TimerCallback, TimerManager};
