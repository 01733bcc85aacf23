//! Coroutine stacks.
//!
//! Each stack is an anonymous private mapping with a `PROT_NONE` guard
//! page at the low end, so an overflow faults instead of silently
//! corrupting a neighbouring allocation. Stacks grow down from
//! [`Stack::top`].

use crate::utils::page_size;
use anyhow::{Context, Result};
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, mprotect, munmap};
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// Default stack size for a coroutine: 128 KiB of usable space.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

#[derive(Debug)]
pub(crate) struct Stack {
    /// Base of the whole mapping, guard page included.
    base: NonNull<c_void>,
    /// Total mapping length, guard page included.
    len: usize,
}

impl Stack {
    /// Map a stack with at least `size` usable bytes, rounded up to whole
    /// pages, plus one guard page below.
    pub(crate) fn alloc(size: usize) -> Result<Self> {
        let page = page_size();
        let usable = size.max(page).div_ceil(page) * page;
        let len = usable + page;

        // Safety: requesting a fresh anonymous mapping with no file backing.
        let base = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(len).expect("stack length is never zero"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_STACK,
            )
        }
        .context("mmap coroutine stack")?;

        // Guard page at the low end; the stack grows down towards it.
        // Safety: `base` is the start of the mapping we just created and
        // `page` bytes are within it.
        unsafe { mprotect(base, page, ProtFlags::PROT_NONE) }.context("mprotect stack guard page")?;

        Ok(Self { base, len })
    }

    /// One past the highest usable byte; page aligned, hence 16-byte
    /// aligned as every context seed requires.
    pub(crate) fn top(&self) -> *mut u8 {
        // Safety: `base + len` stays within the same mapping's bounds
        // (one past the end is allowed).
        unsafe { (self.base.as_ptr() as *mut u8).add(self.len) }
    }

    /// Usable size, guard page excluded.
    pub(crate) fn size(&self) -> usize {
        self.len - page_size()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // Safety: `base`/`len` describe exactly the mapping created in
        // `alloc`, and nothing can reference the stack once its
        // coroutine is gone.
        if let Err(err) = unsafe { munmap(self.base, self.len) } {
            tracing::error!(?err, "munmap coroutine stack failed");
        }
    }
}

// Safety: a Stack is an owned memory range. It is only written through
// the coroutine that owns it, on whichever thread is currently running
// that coroutine.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}
