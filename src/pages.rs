// Copyright The Dyntrans Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Anonymous page allocation, the only place that talks to the host kernel
//! about memory.
//!
//! Everything the translator owns lives in whole pages obtained here. Pages
//! holding data must never be mapped executable; only the code cache and the
//! trampoline pool ask for [`Prot::EXEC`].

use crate::debug::fatal;
use bitflags::bitflags;
use core::ptr;
use log::trace;

/// Host page size. The allocators below only deal in whole pages.
pub const PAGESIZE: usize = 4096;

bitflags! {
    /// Page protection bits, forwarded verbatim to `mmap`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Prot: i32 {
        /// Pages may be read.
        const READ = libc::PROT_READ;
        /// Pages may be written.
        const WRITE = libc::PROT_WRITE;
        /// Pages may be executed.
        const EXEC = libc::PROT_EXEC;
    }
}

/// Maps `pages` fresh anonymous pages with the given protection.
///
/// The mapping is private and zero-filled. Failure is fatal: once the guest
/// runs out of translated code to jump to there is nothing left to unwind.
pub fn alloc_pages(pages: usize, prot: Prot) -> *mut u8 {
    let size = pages * PAGESIZE;
    // SAFETY: requesting a fresh private anonymous mapping with no fixed
    // address touches no existing memory.
    let mem = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            prot.bits(),
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if mem == libc::MAP_FAILED {
        fatal("failed to allocate pages from the host");
    }
    trace!("mapped {pages} pages at {mem:p} ({prot:?})");
    mem.cast()
}

/// Returns a region obtained from [`alloc_pages`] to the host.
///
/// `ptr` and `size` must describe exactly one prior allocation; a failing
/// `munmap` means our bookkeeping is corrupt, which is fatal.
pub fn free_pages(ptr: *mut u8, size: usize) {
    // SAFETY: per the contract above, the region is a live mapping owned by
    // the caller and nothing points into it any more.
    let ret = unsafe { libc::munmap(ptr.cast(), size) };
    if ret != 0 {
        fatal("failed to return pages to the host");
    }
    trace!("unmapped {size:#x} bytes at {ptr:p}");
}
