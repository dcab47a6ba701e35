// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! epoll instance plus the self-pipe used to interrupt it.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

pub(crate) const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub(crate) const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
pub(crate) const EPOLLET: u32 = libc::EPOLLET as u32;
pub(crate) const EPOLLERR: u32 = libc::EPOLLERR as u32;
pub(crate) const EPOLLHUP: u32 = libc::EPOLLHUP as u32;

pub(crate) struct Poller {
    epoll_fd: RawFd,
    wake_read: RawFd,
    wake_write: RawFd,
}

impl Poller {
    /// Create the epoll instance and register the read end of a
    /// non-blocking pipe, edge-triggered.
    pub fn new() -> Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(Error::Poller(io::Error::last_os_error()));
        }

        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(Error::WakePipe(err));
        }
        let poller = Self {
            epoll_fd,
            wake_read: fds[0],
            wake_write: fds[1],
        };

        let mut ev = libc::epoll_event {
            events: EPOLLIN | EPOLLET,
            u64: poller.wake_read as u64,
        };
        let ret = unsafe {
            libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, poller.wake_read, &mut ev)
        };
        if ret < 0 {
            // `poller` closes all three descriptors on drop.
            return Err(Error::WakePipe(io::Error::last_os_error()));
        }
        Ok(poller)
    }

    pub fn is_wake_fd(&self, fd: RawFd) -> bool {
        fd == self.wake_read
    }

    /// `epoll_ctl` with the descriptor number as event data. Failures are
    /// logged here and returned.
    pub fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            let source = io::Error::last_os_error();
            let op = op_name(op);
            tracing::error!(
                epfd = self.epoll_fd,
                op,
                fd,
                events = format_args!("{events:#x}"),
                error = %source,
                "epoll_ctl failed"
            );
            return Err(Error::Register {
                op,
                fd,
                events,
                source,
            });
        }
        Ok(())
    }

    /// Block for up to `timeout_ms` and fill `events`. Interrupted waits are
    /// retried.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: u64) -> io::Result<usize> {
        let timeout = timeout_ms.min(i32::MAX as u64) as i32;
        let max = events.len().min(i32::MAX as usize) as i32;
        loop {
            let n = unsafe { libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), max, timeout) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Write one byte to the wake pipe. A full pipe already guarantees a
    /// pending wake-up, so `EAGAIN` is not an error.
    pub fn wake(&self) {
        let byte = [b'T'];
        let n = unsafe { libc::write(self.wake_write, byte.as_ptr().cast(), 1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                tracing::error!(fd = self.wake_write, error = %err, "wake pipe write failed");
            }
        }
    }

    /// Read the wake pipe until it is empty.
    pub fn drain_wake(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe { libc::read(self.wake_read, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_read);
            libc::close(self.wake_write);
            libc::close(self.epoll_fd);
        }
    }
}

fn op_name(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "ADD",
        libc::EPOLL_CTL_MOD => "MOD",
        libc::EPOLL_CTL_DEL => "DEL",
        _ => "?",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_events(n: usize) -> Vec<libc::epoll_event> {
        vec![libc::epoll_event { events: 0, u64: 0 }; n]
    }

    #[test]
    fn wait_times_out_with_nothing_ready() {
        let poller = Poller::new().unwrap();
        let mut events = empty_events(4);
        assert_eq!(poller.wait(&mut events, 1).unwrap(), 0);
    }

    #[test]
    fn wake_interrupts_wait_and_drains() {
        let poller = Poller::new().unwrap();
        poller.wake();
        poller.wake();
        let mut events = empty_events(4);
        let n = poller.wait(&mut events, 1000).unwrap();
        assert_eq!(n, 1);
        let fd = events[0].u64 as RawFd;
        assert!(poller.is_wake_fd(fd));
        poller.drain_wake();

        // Edge-triggered and drained: nothing further to report.
        assert_eq!(poller.wait(&mut events, 1).unwrap(), 0);
    }

    #[test]
    fn ctl_failure_is_reported() {
        let poller = Poller::new().unwrap();
        let err = poller.ctl(libc::EPOLL_CTL_MOD, 9999, EPOLLIN).unwrap_err();
        assert!(matches!(err, Error::Register { op: "MOD", fd: 9999, .. }));
    }
}
