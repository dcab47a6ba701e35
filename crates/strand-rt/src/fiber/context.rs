// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Saved machine context (ucontext).
//!
//! An `ExecutionContext` is either the parked state of a suspended fiber or
//! the slot the running code saves itself into when it switches away.
//! `ucontext_t` points into itself (the FPU save area), so it lives behind a
//! `Box` and never moves once captured.

use std::cell::UnsafeCell;
use std::io;
use std::mem::MaybeUninit;
use std::ptr;

use super::stack::Stack;

pub(crate) struct ExecutionContext {
    raw: UnsafeCell<libc::ucontext_t>,
}

// Each context is written only by the thread that is switching out of it.
unsafe impl Send for ExecutionContext {}
unsafe impl Sync for ExecutionContext {}

impl ExecutionContext {
    /// Empty slot. Valid as a switch source; becomes a valid target once
    /// something has been saved into it or `prepare` ran.
    pub fn empty() -> Box<Self> {
        Box::new(Self {
            raw: UnsafeCell::new(unsafe { MaybeUninit::zeroed().assume_init() }),
        })
    }

    /// Arrange for the next switch into this context to call `entry` at the
    /// top of `stack`. `entry` must never return.
    ///
    /// # Safety
    /// The context must not be running or saved mid-execution, and `stack`
    /// must outlive every switch into this context.
    pub unsafe fn prepare(&self, stack: &Stack, entry: extern "C" fn()) -> io::Result<()> {
        let ctx = self.raw.get();
        if libc::getcontext(ctx) != 0 {
            return Err(io::Error::last_os_error());
        }
        (*ctx).uc_stack.ss_sp = stack.base().cast();
        (*ctx).uc_stack.ss_size = stack.size();
        (*ctx).uc_stack.ss_flags = 0;
        (*ctx).uc_link = ptr::null_mut();
        libc::makecontext(ctx, entry, 0);
        Ok(())
    }

    /// Save the running context into `self` and resume `to`. Returns once
    /// something switches back into `self`, possibly on another thread.
    ///
    /// # Safety
    /// `self` must describe the code currently running and `to` must be a
    /// prepared or previously saved context that nothing else is running.
    pub unsafe fn switch_to(&self, to: &ExecutionContext) -> io::Result<()> {
        if libc::swapcontext(self.raw.get(), to.raw.get()) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
