// Copyright The Dyntrans Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The process-wide shared region: the one piece of state that crosses
//! thread contexts.
//!
//! Everything else in the translator is partitioned per thread and needs no
//! locking. The shared region only exists so threads can find each other,
//! for instance to request a global flush, and it is deliberately immortal:
//! its pages are excluded from chunk tracking and survive every flush.

use crate::context::{MemKind, ThreadContext};
use crate::debug::fatal;
use crate::mem;
use crate::pages::PAGESIZE;
use arrayvec::ArrayVec;
use core::ptr;
use log::debug;
use spin::Once;
use spin::mutex::SpinMutex;

/// Upper bound on simultaneously live guest threads.
pub const MAX_THREADS: usize = 128;

/// The process-wide region.
pub struct SharedData {
    /// Addresses of every live thread context, behind the region's mutex.
    pub threads: SpinMutex<ArrayVec<usize, MAX_THREADS>>,
}

static SHARED: Once<&'static SharedData> = Once::new();

/// Registers `ctx` with the process-wide region, creating the region on
/// first use.
///
/// The backing pages come from the page allocator but are intentionally
/// untracked: no flush or teardown may ever reclaim them.
pub fn init_shared_data(ctx: &mut ThreadContext) {
    let sd: &'static SharedData = *SHARED.call_once(|| {
        let pages = size_of::<SharedData>().div_ceil(PAGESIZE);
        let mem = mem::lalloc(ctx, pages, MemKind::SharedData).cast::<SharedData>();
        // SAFETY: fresh untracked pages, written exactly once before the
        // reference escapes.
        unsafe {
            mem.write(SharedData {
                threads: SpinMutex::new(ArrayVec::new()),
            });
            &*mem
        }
    });

    if sd.threads.lock().try_push(ctx.addr()).is_err() {
        fatal("too many live guest threads");
    }
    ctx.shared_data = ptr::from_ref(sd);
    debug!("context {:#x} registered with shared data", ctx.addr());
}

/// Removes `ctx` from the thread registry, at thread exit.
pub fn unregister_thread(ctx: &mut ThreadContext) {
    if let Some(sd) = SHARED.get() {
        sd.threads.lock().retain(|addr| *addr != ctx.addr());
    }
    ctx.shared_data = ptr::null();
}

/// Resets the registry to the single surviving context. Runs after the
/// guest replaces its address space, when every other thread is gone.
pub fn reinit_new_process(ctx: &mut ThreadContext) {
    let Some(sd) = SHARED.get() else {
        return;
    };
    let mut threads = sd.threads.lock();
    threads.clear();
    // The surviving context cannot fail to fit in an empty registry.
    let _ = threads.try_push(ctx.addr());
    ctx.shared_data = ptr::from_ref(*sd);
    debug!("thread registry reset to context {:#x}", ctx.addr());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{init_tls, mem_free};

    // The registry is process-global, so these assertions live in one test
    // to stay independent of execution order.
    #[test]
    fn register_reset_unregister() {
        let a = init_tls();
        let b = init_tls();
        init_shared_data(a);
        init_shared_data(b);
        assert_eq!(a.shared_data, b.shared_data);
        {
            // SAFETY: the singleton outlives the whole process.
            let sd = unsafe { &*a.shared_data };
            let threads = sd.threads.lock();
            assert!(threads.contains(&a.addr()));
            assert!(threads.contains(&b.addr()));
        }

        reinit_new_process(a);
        {
            // SAFETY: as above.
            let sd = unsafe { &*a.shared_data };
            let threads = sd.threads.lock();
            assert_eq!(threads.as_slice(), &[a.addr()][..]);
        }

        unregister_thread(a);
        assert!(a.shared_data.is_null());
        mem_free(a);
        mem_free(b);
    }
}
