// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime errors.
//!
//! Setup failures (poller, wake pipe, worker threads) stop a component from
//! being constructed. Registration failures are returned to the caller that
//! asked for the registration and leave the descriptor's prior state alone.

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

use crate::reactor::Event;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// `epoll_create1` failed.
    #[error("failed to create epoll instance: {0}")]
    Poller(#[source] io::Error),

    /// The self-pipe used to interrupt `epoll_wait` could not be set up.
    #[error("failed to set up wake pipe: {0}")]
    WakePipe(#[source] io::Error),

    /// An `epoll_ctl` call was rejected by the kernel.
    #[error("epoll_ctl({op}, fd={fd}, events={events:#x}) failed: {source}")]
    Register {
        op: &'static str,
        fd: RawFd,
        events: u32,
        #[source]
        source: io::Error,
    },

    /// The direction already has a waiter on this descriptor.
    #[error("{event:?} is already registered on fd {fd}")]
    AlreadyRegistered { fd: RawFd, event: Event },

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// An environment override held a value that does not parse.
    #[error("invalid value `{value}` for {key}")]
    Config { key: &'static str, value: String },
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Register { source, .. } => source,
            other => io::Error::other(other),
        }
    }
}
