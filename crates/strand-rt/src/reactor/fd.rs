// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-descriptor registration state.
//!
//! The table is indexed by descriptor number and only ever grows. Its shape
//! is guarded by a reader/writer lock; each entry has its own mutex, so
//! unrelated descriptors never contend.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::Event;
use crate::config::grown_capacity;
use crate::scheduler::{Handle, Work};

/// What to do when one direction fires.
#[derive(Default)]
pub(crate) struct EventContext {
    /// Scheduler the work is handed to.
    pub scheduler: Option<Handle>,
    /// The fiber to resume or the callback to run.
    pub work: Option<Work>,
}

impl EventContext {
    pub fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.work.is_none()
    }

    pub fn clear(&mut self) {
        self.scheduler = None;
        self.work = None;
    }
}

#[derive(Default)]
pub(crate) struct FdState {
    /// Registered directions, as epoll bits.
    pub events: u32,
    pub read: EventContext,
    pub write: EventContext,
}

impl FdState {
    pub fn has(&self, event: Event) -> bool {
        self.events & event.bits() != 0
    }

    pub fn context_mut(&mut self, event: Event) -> &mut EventContext {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }

    /// Clear `event` and hand its work to its scheduler. The bit and the
    /// context go together, so a direction cannot fire twice.
    ///
    /// Returns false if `event` was not registered.
    pub fn trigger(&mut self, fd: RawFd, event: Event) -> bool {
        debug_assert!(self.has(event), "trigger of unregistered {event:?} on fd {fd}");
        if !self.has(event) {
            return false;
        }
        self.events &= !event.bits();
        let ctx = self.context_mut(event);
        let scheduler = ctx.scheduler.take();
        let work = ctx.work.take();
        match (scheduler, work) {
            (Some(scheduler), Some(work)) => scheduler.schedule_work(work, None),
            _ => tracing::error!(fd, ?event, "registered direction had nothing to resume"),
        }
        true
    }
}

pub(crate) struct FdContext {
    pub fd: RawFd,
    pub state: Mutex<FdState>,
}

impl FdContext {
    fn new(fd: RawFd) -> Arc<Self> {
        Arc::new(Self {
            fd,
            state: Mutex::new(FdState::default()),
        })
    }
}

pub(crate) struct FdTable {
    slots: RwLock<Vec<Arc<FdContext>>>,
}

impl FdTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: RwLock::new((0..capacity).map(|fd| FdContext::new(fd as RawFd)).collect()),
        }
    }

    /// Existing entry for `fd`, without growing.
    pub fn get(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let index = usize::try_from(fd).ok()?;
        self.slots.read().get(index).cloned()
    }

    /// Entry for `fd`, growing the table if it is out of range.
    pub fn get_or_grow(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let index = usize::try_from(fd).ok()?;
        if let Some(ctx) = self.slots.read().get(index) {
            return Some(ctx.clone());
        }
        let mut slots = self.slots.write();
        if index >= slots.len() {
            let start = slots.len();
            let target = grown_capacity(index);
            slots.extend((start..target).map(|fd| FdContext::new(fd as RawFd)));
            tracing::trace!(from = start, to = target, "fd table grown");
        }
        Some(slots[index].clone())
    }

    pub fn capacity(&self) -> usize {
        self.slots.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_past_requested_descriptor() {
        let table = FdTable::with_capacity(4);
        assert!(table.get(10).is_none());
        let ctx = table.get_or_grow(10).unwrap();
        assert_eq!(ctx.fd, 10);
        assert_eq!(table.capacity(), 15);
        // Entries are stable across lookups.
        assert!(Arc::ptr_eq(&ctx, &table.get(10).unwrap()));
        assert_eq!(table.get(3).unwrap().fd, 3);
    }

    #[test]
    fn negative_descriptors_are_rejected() {
        let table = FdTable::with_capacity(4);
        assert!(table.get(-1).is_none());
        assert!(table.get_or_grow(-1).is_none());
    }

    #[test]
    fn direction_bits_and_contexts() {
        let mut state = FdState::default();
        assert!(!state.has(Event::Read));
        state.events |= Event::Write.bits();
        assert!(state.has(Event::Write));
        assert!(!state.has(Event::Read));
        assert!(state.context_mut(Event::Read).is_empty());
    }
}
