// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber stack memory.
//!
//! Stacks are anonymous mappings with one inaccessible page below the
//! usable range, so running off the end of a fiber stack faults instead of
//! writing into whatever memory sits next to it.

use std::io;
use std::ptr::{self, NonNull};

/// Smallest stack handed out, regardless of what the caller asks for.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Owned stack mapping a fiber runs on. Unmapped on drop.
pub(crate) struct Stack {
    /// Start of the mapping, which is the guard page.
    mapping: NonNull<u8>,
    guard: usize,
    size: usize,
}

// The block is plain memory; only the fiber that owns it touches it.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Map a stack of at least `size` usable bytes, rounded up to whole
    /// pages.
    ///
    /// Panics if the mapping cannot be created, the same way an allocation
    /// failure would.
    pub fn new(size: usize) -> Self {
        match Self::map(size) {
            Ok(stack) => stack,
            Err(err) => panic!("failed to map fiber stack of {size} bytes: {err}"),
        }
    }

    fn map(size: usize) -> io::Result<Self> {
        let page = page_size();
        let size = size.max(MIN_STACK_SIZE).next_multiple_of(page);
        let total = size + page;
        unsafe {
            let mapping = libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            );
            if mapping == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            // Stacks grow down, so the guard sits at the lowest address.
            if libc::mprotect(mapping, page, libc::PROT_NONE) != 0 {
                let err = io::Error::last_os_error();
                libc::munmap(mapping, total);
                return Err(err);
            }
            let Some(mapping) = NonNull::new(mapping.cast::<u8>()) else {
                libc::munmap(mapping, total);
                return Err(io::Error::from(io::ErrorKind::OutOfMemory));
            };
            Ok(Self {
                mapping,
                guard: page,
                size,
            })
        }
    }

    /// Lowest usable address, just above the guard page.
    pub fn base(&self) -> *mut u8 {
        unsafe { self.mapping.as_ptr().add(self.guard) }
    }

    /// Usable bytes, not counting the guard page.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mapping.as_ptr().cast(), self.size + self.guard);
        }
    }
}

fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}
