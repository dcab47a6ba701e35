// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! End-to-end runtime behavior through `IoManager`: workers, timers and
//! readiness together.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use strand_rt::{Event, Fiber, IoManager, ManualClock, Reactor, RuntimeConfig};

/// Route runtime logs to the test harness. Set `RUST_LOG` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(threads: usize, use_caller: bool) -> RuntimeConfig {
    init_tracing();
    RuntimeConfig::new()
        .with_name("it")
        .with_threads(threads)
        .with_use_caller(use_caller)
        .with_stack_size(128 * 1024)
        .with_max_wait_ms(20)
}

fn wait_until(what: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if what() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    what()
}

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(ret, 0);
    (fds[0], fds[1])
}

fn close(fds: &[RawFd]) {
    for &fd in fds {
        unsafe { libc::close(fd) };
    }
}

#[test]
fn thousand_closures_over_four_workers() {
    let iom = IoManager::new(&config(4, false)).unwrap();
    let runs: Arc<Vec<AtomicU8>> = Arc::new((0..1000).map(|_| AtomicU8::new(0)).collect());
    let timer_fired = Arc::new(AtomicBool::new(false));

    for i in 0..1000 {
        let runs = runs.clone();
        iom.schedule(move || {
            runs[i].fetch_add(1, Ordering::SeqCst);
        });
    }
    let t = timer_fired.clone();
    iom.add_timer(30, move || t.store(true, Ordering::SeqCst), false);

    assert!(!iom.stopping());
    iom.stop();

    assert!(runs.iter().all(|r| r.load(Ordering::SeqCst) == 1));
    assert!(timer_fired.load(Ordering::SeqCst));
    assert!(!iom.has_timer());
    assert!(iom.stopping());
}

#[test]
fn recurring_and_one_shot_timers_on_a_manual_clock() {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let iom = IoManager::with_clock(&config(2, false), clock.clone()).unwrap();
    let recurring = Arc::new(AtomicUsize::new(0));
    let one_shot = Arc::new(AtomicUsize::new(0));

    let o = one_shot.clone();
    iom.add_timer(
        50,
        move || {
            o.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );
    let r = recurring.clone();
    let tick = iom.add_timer(
        20,
        move || {
            r.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    for step in 1..=11u64 {
        clock.advance(10);
        let elapsed = step * 10;
        let want_recurring = (elapsed / 20) as usize;
        let want_one_shot = usize::from(elapsed >= 50);
        assert!(
            wait_until(|| {
                recurring.load(Ordering::SeqCst) == want_recurring
                    && one_shot.load(Ordering::SeqCst) == want_one_shot
            }),
            "at {elapsed}ms: recurring={} one_shot={}",
            recurring.load(Ordering::SeqCst),
            one_shot.load(Ordering::SeqCst),
        );
    }
    assert_eq!(recurring.load(Ordering::SeqCst), 5);
    assert_eq!(one_shot.load(Ordering::SeqCst), 1);
    assert!(tick.cancel());
}

#[test]
fn clock_rollback_fires_every_timer() {
    let clock = Arc::new(ManualClock::new(10 * 60 * 60 * 1000));
    let iom = IoManager::with_clock(&config(1, false), clock.clone()).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    for ms in [60_000, 600_000, 3_000_000] {
        let f = fired.clone();
        iom.add_timer(
            ms,
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
    }
    clock.rewind(2 * 60 * 60 * 1000);
    assert!(wait_until(|| fired.load(Ordering::SeqCst) == 3));
    assert!(!iom.has_timer());
}

#[test]
fn condition_timer_with_dropped_referent_never_fires() {
    let iom = IoManager::new(&config(1, false)).unwrap();
    let fired = Arc::new(AtomicBool::new(false));
    let owner = Arc::new(String::from("connection"));
    let f = fired.clone();
    iom.add_condition_timer(
        10,
        move || f.store(true, Ordering::SeqCst),
        Arc::downgrade(&owner),
        false,
    );
    drop(owner);

    assert!(wait_until(|| !iom.has_timer()));
    std::thread::sleep(Duration::from_millis(20));
    assert!(!fired.load(Ordering::SeqCst));
}

#[test]
fn readiness_callback_with_caller_as_worker() {
    let iom = IoManager::new(&config(2, true)).unwrap();
    let (rd, wr) = pipe();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    iom.add_event_with(rd, Event::Read, move || {
        h.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(unsafe { libc::write(wr, b"x".as_ptr().cast(), 1) }, 1);

    // Stop runs the caller's share of the work and waits for the
    // registration to drain.
    iom.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(!iom.reactor().is_registered(rd, Event::Read));
    assert_eq!(iom.reactor().pending_events(), 0);
    close(&[rd, wr]);
}

#[test]
fn cancel_event_resumes_a_parked_fiber() {
    let iom = IoManager::new(&config(2, false)).unwrap();
    let (rd, wr) = pipe();
    let resumed = Arc::new(AtomicBool::new(false));
    let r = resumed.clone();
    iom.schedule(move || {
        let reactor = Reactor::current().unwrap();
        reactor.add_event(rd, Event::Read).unwrap();
        Fiber::yield_to_hold();
        r.store(true, Ordering::SeqCst);
    });

    assert!(wait_until(|| iom.reactor().is_registered(rd, Event::Read)));
    assert!(!resumed.load(Ordering::SeqCst));
    assert!(iom.cancel_event(rd, Event::Read).unwrap());
    assert!(wait_until(|| resumed.load(Ordering::SeqCst)));
    assert!(!iom.cancel_event(rd, Event::Read).unwrap());
    close(&[rd, wr]);
}

#[test]
fn yielding_fibers_share_the_workers() {
    let iom = IoManager::new(&config(4, false)).unwrap();
    let steps = Arc::new(AtomicUsize::new(0));
    for _ in 0..50 {
        let s = steps.clone();
        iom.schedule(move || {
            for _ in 0..10 {
                s.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_to_ready();
            }
        });
    }
    iom.stop();
    assert_eq!(steps.load(Ordering::SeqCst), 500);
}

#[test]
fn sleeping_fibers_overlap() {
    let iom = IoManager::new(&config(1, false)).unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    for _ in 0..10 {
        let d = done.clone();
        iom.schedule(move || {
            strand_rt::sleep_ms(50);
            d.fetch_add(1, Ordering::SeqCst);
        });
    }
    iom.stop();
    assert_eq!(done.load(Ordering::SeqCst), 10);
    // Ten sequential sleeps would take at least 500ms.
    assert!(start.elapsed() < Duration::from_millis(400));
}
