// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Blocking-style byte streams for fibers.
//!
//! `FiberStream` wraps a non-blocking descriptor. When an operation would
//! block on a reactor worker, the calling fiber registers the direction,
//! parks, and retries once it is resumed. An optional per-direction timeout
//! is a condition timer that cancels the registration, which resumes the
//! fiber with `TimedOut`.
//!
//! Off a reactor worker the stream falls back to `poll(2)` and blocks the
//! OS thread.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::fiber::Fiber;
use crate::reactor::{Event, Reactor};

/// Put `fd` into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub struct FiberStream<S: AsRawFd> {
    inner: S,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl<S: Read + Write + AsRawFd> FiberStream<S> {
    /// Wrap `inner`, switching its descriptor to non-blocking mode.
    pub fn new(inner: S) -> io::Result<Self> {
        set_nonblocking(inner.as_raw_fd())?;
        Ok(Self {
            inner,
            read_timeout: None,
            write_timeout: None,
        })
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Wake every fiber waiting on this descriptor, then release it.
    pub fn close(self) -> io::Result<()> {
        if let Some(reactor) = Reactor::current() {
            reactor.cancel_all(self.inner.as_raw_fd())?;
        }
        drop(self.inner);
        Ok(())
    }

    fn wait(&self, event: Event, timeout: Option<Duration>) -> io::Result<()> {
        let fd = self.inner.as_raw_fd();
        match Reactor::current() {
            Some(reactor) if Fiber::current().stack_size() > 0 => {
                park_until_ready(&reactor, fd, event, timeout)
            }
            _ => poll_until_ready(fd, event, timeout),
        }
    }
}

/// How a parked wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Parked,
    TimedOut,
    Resumed,
}

fn park_until_ready(
    reactor: &Arc<Reactor>,
    fd: RawFd,
    event: Event,
    timeout: Option<Duration>,
) -> io::Result<()> {
    // The timeout only counts if it is the one that removes the
    // registration; readiness handled in the same idle pass wins otherwise.
    let wake = Arc::new(Mutex::new(Wake::Parked));
    // Keeps the timeout armed only while this wait is in progress.
    let waiting = Arc::new(());
    let timer = timeout.map(|timeout| {
        let reactor_ref = Arc::downgrade(reactor);
        let wake = wake.clone();
        reactor.add_condition_timer(
            millis(timeout),
            move || {
                let mut wake = wake.lock();
                if *wake != Wake::Parked {
                    return;
                }
                if let Some(reactor) = reactor_ref.upgrade() {
                    if matches!(reactor.cancel_event(fd, event), Ok(true)) {
                        *wake = Wake::TimedOut;
                    }
                }
            },
            Arc::downgrade(&waiting),
            false,
        )
    });

    if let Err(err) = reactor.add_event(fd, event) {
        if let Some(timer) = &timer {
            timer.cancel();
        }
        return Err(err.into());
    }
    Fiber::yield_to_hold();

    if let Some(timer) = &timer {
        timer.cancel();
    }
    drop(waiting);
    let outcome = std::mem::replace(&mut *wake.lock(), Wake::Resumed);
    if outcome == Wake::TimedOut {
        return Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{event:?} on fd {fd} timed out"),
        ));
    }
    Ok(())
}

fn poll_until_ready(fd: RawFd, event: Event, timeout: Option<Duration>) -> io::Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: match event {
            Event::Read => libc::POLLIN,
            Event::Write => libc::POLLOUT,
        },
        revents: 0,
    };
    let timeout = timeout.map_or(-1, |t| millis(t).min(i32::MAX as u64) as i32);
    loop {
        let n = unsafe { libc::poll(&mut pfd, 1, timeout) };
        match n {
            0 => return Err(io::Error::from(io::ErrorKind::TimedOut)),
            n if n > 0 => return Ok(()),
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl<S: Read + Write + AsRawFd> Read for FiberStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.wait(Event::Read, self.read_timeout)?;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                result => return result,
            }
        }
    }
}

impl<S: Read + Write + AsRawFd> Write for FiberStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.inner.write(buf) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.wait(Event::Write, self.write_timeout)?;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                result => return result,
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S: AsRawFd> AsRawFd for FiberStream<S> {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RuntimeConfig;
    use crate::reactor::IoManager;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    fn io_manager() -> IoManager {
        let config = RuntimeConfig::new()
            .with_name("io-test")
            .with_threads(2)
            .with_use_caller(false)
            .with_stack_size(128 * 1024)
            .with_max_wait_ms(50);
        IoManager::new(&config).unwrap()
    }

    fn wait_for<T>(slot: &Mutex<Option<T>>) -> T {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(v) = slot.lock().take() {
                return v;
            }
            assert!(Instant::now() < deadline, "timed out waiting for fiber");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn read_parks_until_data_arrives() {
        let iom = io_manager();
        let (a, mut b) = UnixStream::pair().unwrap();
        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        iom.schedule(move || {
            let mut stream = FiberStream::new(a).unwrap();
            let mut buf = [0u8; 5];
            let outcome = stream.read_exact(&mut buf).map(|()| buf);
            *r.lock() = Some(outcome);
            stream.close().unwrap();
        });

        std::thread::sleep(Duration::from_millis(30));
        b.write_all(b"hello").unwrap();
        let got = wait_for(&result).unwrap();
        assert_eq!(&got, b"hello");
    }

    #[test]
    fn read_timeout_surfaces_as_timed_out() {
        let iom = io_manager();
        let (a, _b) = UnixStream::pair().unwrap();
        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        iom.schedule(move || {
            let mut stream = FiberStream::new(a).unwrap();
            stream.set_read_timeout(Some(Duration::from_millis(40)));
            let start = Instant::now();
            let mut buf = [0u8; 1];
            let err = stream.read(&mut buf).unwrap_err();
            *r.lock() = Some((err.kind(), start.elapsed()));
        });

        let (kind, elapsed) = wait_for(&result);
        assert_eq!(kind, io::ErrorKind::TimedOut);
        assert!(elapsed >= Duration::from_millis(35));
        assert_eq!(iom.reactor().pending_events(), 0);
    }

    #[test]
    fn readiness_beats_a_deadline_due_in_the_same_pass() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let config = RuntimeConfig::new()
            .with_name("io-race")
            .with_threads(1)
            .with_use_caller(false)
            .with_stack_size(128 * 1024)
            .with_max_wait_ms(30_000);
        let iom = IoManager::with_clock(&config, clock.clone()).unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        iom.schedule(move || {
            let mut stream = FiberStream::new(a).unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(10)));
            let mut buf = [0u8; 1];
            let outcome = stream.read(&mut buf).map(|n| (n, buf[0]));
            *r.lock() = Some(outcome.map_err(|e| e.kind()));
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while !iom.reactor().is_registered(fd, Event::Read) {
            assert!(Instant::now() < deadline, "reader never parked");
            std::thread::sleep(Duration::from_millis(2));
        }
        // The worker sleeps in epoll_wait; moving the clock does not wake
        // it, so the data and the overdue deadline arrive together.
        clock.advance(20_000);
        b.write_all(b"z").unwrap();

        assert_eq!(wait_for(&result), Ok((1, b'z')));
        assert!(!iom.has_timer());
    }

    #[test]
    fn echo_between_two_fibers() {
        let iom = io_manager();
        let (a, b) = UnixStream::pair().unwrap();
        let result = Arc::new(Mutex::new(None));
        let r = result.clone();

        iom.schedule(move || {
            let mut server = FiberStream::new(b).unwrap();
            let mut buf = [0u8; 4];
            server.read_exact(&mut buf).unwrap();
            server.write_all(&buf).unwrap();
        });
        iom.schedule(move || {
            let mut client = FiberStream::new(a).unwrap();
            client.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).unwrap();
            *r.lock() = Some(buf);
        });

        assert_eq!(&wait_for(&result), b"ping");
    }

    #[test]
    fn off_reactor_falls_back_to_poll() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut stream = FiberStream::new(a).unwrap();
        stream.set_read_timeout(Some(Duration::from_millis(10)));
        let mut buf = [0u8; 3];
        let err = stream.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        b.write_all(b"abc").unwrap();
        assert_eq!(stream.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn set_nonblocking_is_idempotent() {
        let (a, _b) = UnixStream::pair().unwrap();
        set_nonblocking(a.as_raw_fd()).unwrap();
        set_nonblocking(a.as_raw_fd()).unwrap();
        let flags = unsafe { libc::fcntl(a.as_raw_fd(), libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
    }
}
