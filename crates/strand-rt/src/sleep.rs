// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Sleeping without holding a worker.
//!
//! Inside a fiber on a reactor worker, `sleep` arms a one-shot timer that
//! schedules the fiber again and parks it, so the worker keeps running
//! other work. Anywhere else it blocks the OS thread.

use std::time::Duration;

use crate::fiber::Fiber;
use crate::reactor::Reactor;
use crate::scheduler::Handle;

pub fn sleep(duration: Duration) {
    let Some((reactor, handle)) = fiber_context() else {
        std::thread::sleep(duration);
        return;
    };
    let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    let fiber = Fiber::current();
    let scheduler = handle.downgrade();
    reactor.add_timer(
        ms,
        move || {
            if let Some(handle) = scheduler.upgrade() {
                handle.schedule_fiber(fiber.clone());
            }
        },
        false,
    );
    Fiber::yield_to_hold();
}

pub fn sleep_ms(ms: u64) {
    sleep(Duration::from_millis(ms));
}

/// Reactor and scheduler of the calling fiber, if it runs on a reactor
/// worker.
fn fiber_context() -> Option<(std::sync::Arc<Reactor>, Handle)> {
    let handle = Handle::current()?;
    let reactor = handle.driver_as::<Reactor>()?;
    if Fiber::current().stack_size() == 0 {
        return None;
    }
    Some((reactor, handle))
}
