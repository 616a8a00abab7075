// Copyright The Dyntrans Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Internal memory management: bootstrap, scratch and page allocation, the
//! trampoline and predictor pools, and bulk teardown.
//!
//! A thread's whole footprint hangs off its chunk list. `mem_free` walks
//! that list and unmaps every chunk except the bootstrap block at the tail,
//! which holds the translator stack and the [`ThreadContext`] itself; this
//! is what lets a flush rebuild a thread's world without moving the context.

use crate::cache::{MAPPINGTABLE_SIZE, PC_MAPPINGTABLE_SIZE};
use crate::context::{MemChunk, MemKind, ThreadContext, Translate};
use crate::debug::fatal;
use crate::pages::{self, PAGESIZE, Prot};
use crate::trampoline::Trampoline;
use core::ptr;
use log::debug;

/// Pages per bootstrap block and per scratch-allocator refill.
pub const SMALLOC_PAGES: usize = 8;

/// Upper bound on a single scratch allocation, in bytes.
pub const SMALLOC_MAX: usize = 512;

/// Pages reserved for the translator stack at the bottom of the bootstrap
/// block.
pub const DBT_STACK_PAGES: usize = 2;

/// Pages per code-cache chunk.
pub const CODE_CACHE_ALLOC_PAGES: usize = 256;

/// Slack kept free at the end of a code-cache chunk so a trailing epilogue
/// cannot overflow it.
pub const TRANSL_GUARD: usize = 64;

/// Trampolines added to the pool per refill.
pub const ALLOC_TRAMPOLINES: usize = 256;

/// Predictor records added to the pool per refill.
#[cfg(feature = "icf-predict")]
pub const ALLOC_PREDICTIONS: usize = 256;

const _: () = assert!(DBT_STACK_PAGES < SMALLOC_PAGES);
const _: () = assert!(
    size_of::<ThreadContext>() + size_of::<MemChunk>() + 512
        <= (SMALLOC_PAGES - DBT_STACK_PAGES) * PAGESIZE,
    "bootstrap block cannot hold the context plus initial scratch"
);

/// Creates the context for a new guest thread.
///
/// The bootstrap block is laid out bottom-up: translator stack, then the
/// [`ThreadContext`] at the stack's top, then the first chunk record, then
/// the initial scratch region. Once that much exists, `smalloc`/`lalloc`
/// carry the rest: mapping tables, the optional syscall table and the first
/// code-cache chunk.
pub fn init_tls() -> &'static mut ThreadContext {
    // SAFETY: a null context means "bootstrap from nothing".
    unsafe { reinit(ptr::null_mut()) }
}

/// Rebuilds a context in place after everything but its bootstrap block has
/// been freed. The context address is preserved; this is the flush path.
pub(crate) fn reinit_tls(ctx: &mut ThreadContext) {
    // SAFETY: `ctx` is a live exclusive context; reinit rebuilds the same
    // storage and hands back a reference to the same address.
    unsafe { reinit(ctx) };
}

/// Bootstraps (or re-bootstraps) a thread context.
///
/// # Safety
///
/// `ctx` must be null or point to a live context with no other outstanding
/// references; in the latter case all of its non-bootstrap memory is freed
/// and every pointer into it is invalidated.
unsafe fn reinit(ctx: *mut ThreadContext) -> &'static mut ThreadContext {
    let mem: *mut u8 = if ctx.is_null() {
        pages::alloc_pages(SMALLOC_PAGES, Prot::READ | Prot::WRITE)
    } else {
        // SAFETY: live and exclusive per the contract above.
        let old = unsafe { &mut *ctx };
        mem_free(old);
        // SAFETY: after mem_free the list is exactly the bootstrap record,
        // which describes the block we are about to recycle.
        unsafe { (*old.chunks).ptr }
    };

    // The translator stack grows down from here; the context sits at the
    // same address, which is why the address survives a rebuild.
    // SAFETY: the stack area lies inside the SMALLOC_PAGES block.
    let stack = unsafe { mem.add(DBT_STACK_PAGES * PAGESIZE) };
    debug_assert!(ctx.is_null() || ctx == stack.cast());

    let tld = stack.cast::<ThreadContext>();
    // SAFETY: directly after the context; fits per the const assert above.
    let chunk = unsafe { tld.add(1) }.cast::<MemChunk>();
    // SAFETY: directly after the chunk record, still inside the block.
    let scratch = unsafe { chunk.add(1) }.cast::<u8>();

    // SAFETY: in-bounds, aligned, and nothing live overlaps these writes.
    unsafe {
        chunk.write(MemChunk {
            ptr: mem,
            size: SMALLOC_PAGES * PAGESIZE,
            kind: MemKind::Internal,
            next: ptr::null_mut(),
        });
        tld.write(ThreadContext {
            stack,
            chunks: chunk,
            mappingtable: ptr::null_mut(),
            pc_mappingtable: ptr::null_mut(),
            trans: Translate::empty(),
            ind_target: 0,
            smalloc: scratch,
            smalloc_size: SMALLOC_PAGES * PAGESIZE - (scratch as usize - mem as usize),
            unmanaged_code_trampoline: 0,
            ret2app_trampoline: 0,
            opt_ijump_trampoline: 0,
            opt_icall_trampoline: 0,
            opt_ret_trampoline: 0,
            #[cfg(feature = "stack-protection")]
            opt_ret_remove_trampoline: 0,
            #[cfg(feature = "icf-predict")]
            icf_predict: ptr::null_mut(),
            #[cfg(feature = "icf-predict")]
            opt_ijump_predict_fixup: 0,
            #[cfg(feature = "icf-predict")]
            opt_icall_predict_fixup: 0,
            #[cfg(feature = "authorize-syscalls")]
            syscall_table: ptr::null_mut(),
            #[cfg(feature = "authorize-syscalls")]
            syscall_location: 0,
            #[cfg(feature = "handle-signal")]
            signal_handlers: [ptr::null_mut(); crate::context::MAX_NR_SIGNALS],
            #[cfg(feature = "shared-data")]
            shared_data: ptr::null(),
            #[cfg(feature = "statistics")]
            stats: crate::stats::TransStats::default(),
        });
    }

    // SAFETY: freshly written above; this is the only reference.
    let ctx = unsafe { &mut *tld };

    // From this point on the internal allocators are usable.
    ctx.mappingtable = lalloc(
        ctx,
        MAPPINGTABLE_SIZE / PAGESIZE + 1,
        MemKind::MappingTable,
    );
    ctx.pc_mappingtable = lalloc(
        ctx,
        PC_MAPPINGTABLE_SIZE / PAGESIZE + 1,
        MemKind::PcMappingTable,
    );
    // A fresh anonymous mapping is zero-filled, so every slot starts empty;
    // only the wraparound guard for the fast-path probe needs writing.
    // SAFETY: the extra page allocated above holds the guard word.
    unsafe {
        ctx.mappingtable
            .add(MAPPINGTABLE_SIZE)
            .cast::<usize>()
            .write(1);
    }
    debug!(
        "mapping table at {:p}, pc table at {:p}",
        ctx.mappingtable, ctx.pc_mappingtable
    );

    #[cfg(feature = "authorize-syscalls")]
    {
        ctx.syscall_table = lalloc(
            ctx,
            crate::syscall::SYSCALL_TABLE_PAGES,
            MemKind::SyscallTable,
        )
        .cast();
    }

    allocate_new_code_cache(ctx);
    ctx
}

/// Unmaps every chunk except the bootstrap block at the list tail, which is
/// reset as the new (sole) list head.
pub fn mem_free(ctx: &mut ThreadContext) {
    let mut kb_freed = 0usize;
    let mut chunk = ctx.chunks;
    // SAFETY: list records are live until their backing chunk is unmapped;
    // records for a chunk are always allocated out of an older block, which
    // sits closer to the tail and is therefore unmapped later.
    unsafe {
        while !(*chunk).next.is_null() {
            // A scratch refill's own record lives inside the block it
            // describes, so the successor must be read before the unmap.
            let next = (*chunk).next;
            kb_freed += (*chunk).size >> 10;
            pages::free_pages((*chunk).ptr, (*chunk).size);
            chunk = next;
        }
    }
    ctx.chunks = chunk;
    debug!("{kb_freed} KiB freed");
}

/// Allocates whole pages with protections chosen by `kind` and tracks them
/// on the chunk list.
///
/// The shared-data kind is the one exception to tracking: that region is
/// process-wide and must survive every flush and thread teardown.
pub fn lalloc(ctx: &mut ThreadContext, pages: usize, kind: MemKind) -> *mut u8 {
    if pages == 0 {
        fatal("refusing to allocate zero pages");
    }
    let alloc_size = pages * PAGESIZE;

    // Grab the record first: the scratch allocator may itself extend the
    // chunk list while refilling.
    let chunk: *mut MemChunk = smalloc(ctx, size_of::<MemChunk>()).cast();

    let prot = match kind {
        MemKind::CodeCache | MemKind::Trampoline => Prot::READ | Prot::WRITE | Prot::EXEC,
        _ => Prot::READ | Prot::WRITE,
    };
    let mem = pages::alloc_pages(pages, prot);

    #[cfg(feature = "shared-data")]
    if kind == MemKind::SharedData {
        return mem;
    }

    // SAFETY: fresh record from smalloc, exclusively ours.
    unsafe {
        chunk.write(MemChunk {
            ptr: mem,
            size: alloc_size,
            kind,
            next: ctx.chunks,
        });
    }
    ctx.chunks = chunk;
    mem
}

/// Bump-allocates a small record out of the scratch region, refilling the
/// region from the page allocator when it runs dry.
pub fn smalloc(ctx: &mut ThreadContext, size: usize) -> *mut u8 {
    if size == 0 || size > SMALLOC_MAX {
        fatal("scratch allocation size out of range");
    }
    // Keep successive records naturally aligned.
    let size = size.next_multiple_of(8);

    if size > ctx.smalloc_size {
        let mem = pages::alloc_pages(SMALLOC_PAGES, Prot::READ | Prot::WRITE);
        ctx.smalloc = mem;
        ctx.smalloc_size = SMALLOC_PAGES * PAGESIZE;

        // The refill block's own record comes out of the refill block.
        let chunk: *mut MemChunk = smalloc(ctx, size_of::<MemChunk>()).cast();
        // SAFETY: points into the fresh refill block.
        unsafe {
            chunk.write(MemChunk {
                ptr: mem,
                size: SMALLOC_PAGES * PAGESIZE,
                kind: MemKind::Internal,
                next: ctx.chunks,
            });
        }
        ctx.chunks = chunk;
    }

    let mem = ctx.smalloc;
    // SAFETY: `size` bytes remain in the scratch region.
    ctx.smalloc = unsafe { ctx.smalloc.add(size) };
    ctx.smalloc_size -= size;
    mem
}

/// Puts a fresh code-cache chunk under the translator's write cursor.
pub fn allocate_new_code_cache(ctx: &mut ThreadContext) {
    let mem = lalloc(ctx, CODE_CACHE_ALLOC_PAGES, MemKind::CodeCache);
    ctx.trans.transl_instr = mem;
    // SAFETY: the guard zone lies inside the chunk just mapped.
    ctx.trans.code_cache_end =
        unsafe { mem.add(CODE_CACHE_ALLOC_PAGES * PAGESIZE - TRANSL_GUARD) };
    debug!("code cache chunk at {mem:p}");
}

/// Grows the trampoline pool by one chunk and threads the new records onto
/// the freelist.
pub fn allocate_new_trampolines(ctx: &mut ThreadContext) {
    let pages = (ALLOC_TRAMPOLINES * size_of::<Trampoline>()).div_ceil(PAGESIZE);
    let pool = lalloc(ctx, pages, MemKind::Trampoline).cast::<Trampoline>();
    // SAFETY: the chunk holds ALLOC_TRAMPOLINES records; only the embedded
    // links are touched, the rest stays uninitialised until allocation.
    unsafe {
        for i in 0..ALLOC_TRAMPOLINES - 1 {
            (*pool.add(i)).next = pool.add(i + 1);
        }
        (*pool.add(ALLOC_TRAMPOLINES - 1)).next = ctx.trans.trampos;
    }
    ctx.trans.trampos = pool;
}

/// Returns a trampoline to the freelist.
pub fn trampoline_free(ctx: &mut ThreadContext, trampo: *mut Trampoline) {
    // SAFETY: the caller passes a pool record it owns; only the link moves.
    unsafe {
        (*trampo).next = ctx.trans.trampos;
    }
    ctx.trans.trampos = trampo;
}

/// Grows the predictor pool by one chunk.
#[cfg(feature = "icf-predict")]
pub fn allocate_new_icf_predictors(ctx: &mut ThreadContext) {
    use crate::context::IcfPrediction;

    let pages = (ALLOC_PREDICTIONS * size_of::<IcfPrediction>()).div_ceil(PAGESIZE);
    let pool = lalloc(ctx, pages, MemKind::IcfPredict).cast::<IcfPrediction>();
    // SAFETY: the chunk holds ALLOC_PREDICTIONS records.
    unsafe {
        for i in 0..ALLOC_PREDICTIONS - 1 {
            (*pool.add(i)).next = pool.add(i + 1);
        }
        (*pool.add(ALLOC_PREDICTIONS - 1)).next = ctx.icf_predict;
    }
    ctx.icf_predict = pool;
}

/// Resets a predictor record and returns it to the freelist.
#[cfg(feature = "icf-predict")]
pub fn icf_predictor_free(ctx: &mut ThreadContext, pred: *mut crate::context::IcfPrediction) {
    // SAFETY: the caller passes a pool record it owns.
    unsafe {
        (*pred).origin1 = 0;
        (*pred).dst1 = 0;
        (*pred).mispredicts = 0;
        (*pred).next = ctx.icf_predict;
    }
    ctx.icf_predict = pred;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_count(ctx: &ThreadContext) -> usize {
        let mut n = 0;
        let mut chunk = ctx.chunks;
        // SAFETY: walking the live chunk list read-only.
        unsafe {
            while !chunk.is_null() {
                n += 1;
                chunk = (*chunk).next;
            }
        }
        n
    }

    fn tail_chunk(ctx: &ThreadContext) -> &MemChunk {
        let mut chunk = ctx.chunks;
        // SAFETY: the list always ends at the bootstrap record.
        unsafe {
            while !(*chunk).next.is_null() {
                chunk = (*chunk).next;
            }
            &*chunk
        }
    }

    #[test]
    fn context_sits_on_top_of_its_own_stack() {
        let ctx = init_tls();
        assert_eq!(ctx.stack as usize, ctx.addr());
        let tail = tail_chunk(ctx);
        assert_eq!(tail.kind, MemKind::Internal);
        assert_eq!(tail.ptr as usize + DBT_STACK_PAGES * PAGESIZE, ctx.addr());
        assert_eq!(tail.size, SMALLOC_PAGES * PAGESIZE);
        mem_free(ctx);
    }

    #[test]
    fn mem_free_leaves_only_the_bootstrap_block() {
        let ctx = init_tls();
        assert!(chunk_count(ctx) > 1);
        mem_free(ctx);
        assert_eq!(chunk_count(ctx), 1);
    }

    #[test]
    fn alloc_free_reinit_cycle() {
        let ctx = init_tls();
        for _ in 0..4 {
            lalloc(ctx, 2, MemKind::CodeCache);
            lalloc(ctx, 1, MemKind::Trampoline);
        }
        mem_free(ctx);
        assert_eq!(chunk_count(ctx), 1);

        let addr = ctx.addr();
        reinit_tls(ctx);
        assert_eq!(ctx.addr(), addr);
        assert!(!ctx.mappingtable.is_null());
        assert!(!ctx.trans.transl_instr.is_null());
        mem_free(ctx);
    }

    #[test]
    fn lalloc_tracks_kind_on_the_list_head() {
        let ctx = init_tls();
        lalloc(ctx, 3, MemKind::Trampoline);
        // SAFETY: head record was just created.
        let head = unsafe { &*ctx.chunks };
        assert_eq!(head.kind, MemKind::Trampoline);
        assert_eq!(head.size, 3 * PAGESIZE);
        mem_free(ctx);
    }

    #[test]
    fn smalloc_refills_with_a_tracked_internal_chunk() {
        let ctx = init_tls();
        let before = chunk_count(ctx);
        // Burn through more scratch than one block holds.
        let rounds = (SMALLOC_PAGES * PAGESIZE) / SMALLOC_MAX + 2;
        for _ in 0..rounds {
            let p = smalloc(ctx, SMALLOC_MAX);
            assert!(!p.is_null());
        }
        assert!(chunk_count(ctx) > before);
        // SAFETY: head record is the most recent refill.
        assert_eq!(unsafe { (*ctx.chunks).kind }, MemKind::Internal);
        mem_free(ctx);
    }

    #[test]
    fn code_cache_cursor_respects_the_guard() {
        let ctx = init_tls();
        let dist = ctx.trans.code_cache_end as usize - ctx.trans.transl_instr as usize;
        assert_eq!(dist, CODE_CACHE_ALLOC_PAGES * PAGESIZE - TRANSL_GUARD);
        mem_free(ctx);
    }

    #[cfg(feature = "icf-predict")]
    #[test]
    fn predictor_pool_pops_and_resets_on_free() {
        let ctx = init_tls();
        allocate_new_icf_predictors(ctx);
        let pred = ctx.icf_predict;
        // SAFETY: fresh pool record taken off the freelist.
        unsafe {
            ctx.icf_predict = (*pred).next;
            (*pred).origin1 = 0x9000;
            (*pred).dst1 = 0xC900;
            (*pred).mispredicts = 3;
        }
        icf_predictor_free(ctx, pred);
        assert_eq!(ctx.icf_predict, pred);
        // SAFETY: the record was just reset and pushed back.
        unsafe {
            assert_eq!((*pred).origin1, 0);
            assert_eq!((*pred).dst1, 0);
            assert_eq!((*pred).mispredicts, 0);
        }
        mem_free(ctx);
    }

    #[test]
    fn trampoline_pool_links_every_record() {
        let ctx = init_tls();
        allocate_new_trampolines(ctx);
        let mut n = 0;
        let mut t = ctx.trans.trampos;
        // SAFETY: the freelist was threaded through the fresh pool chunk.
        unsafe {
            while !t.is_null() {
                n += 1;
                t = (*t).next;
            }
        }
        assert_eq!(n, ALLOC_TRAMPOLINES);
        mem_free(ctx);
    }
}
