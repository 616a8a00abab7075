// Copyright The Dyntrans Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The code-cache index: guest-to-cache mapping table, the PC table, and
//! the flush protocol.
//!
//! Both tables are fixed-size open-addressed hash tables with linear
//! probing. Their byte layout is load-bearing: the hot lookup is an inline
//! assembly probe elsewhere in the runtime, which relies on power-of-two
//! entry size, the key at offset 0, the value one word later, 0 as the
//! empty marker and a nonzero guard word just past the last slot so a
//! wrapping probe terminates without a bounds check.

use crate::context::{CacheAddr, GuestAddr, MemKind, ThreadContext};
use crate::debug::fatal;
use crate::dispatcher;
use crate::mem;
use crate::trampoline::{self, OriginKind};
use core::slice;
use log::debug;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// log2 of the mapping table size in bytes.
pub const MAPPINGTABLE_NRBITS: usize = 20;

/// Mapping table size in bytes (excluding the guard word).
pub const MAPPINGTABLE_SIZE: usize = 1 << MAPPINGTABLE_NRBITS;

/// Number of slots in the mapping table.
pub const MAPPINGTABLE_MAXENTRIES: usize = MAPPINGTABLE_SIZE / size_of::<MappingEntry>();

/// log2 of the PC table size in bytes.
pub const PC_MAPPINGTABLE_NRBITS: usize = 17;

/// PC table size in bytes.
pub const PC_MAPPINGTABLE_SIZE: usize = 1 << PC_MAPPINGTABLE_NRBITS;

/// Number of slots in the PC table.
pub const PC_MAPPINGTABLE_MAXENTRIES: usize = PC_MAPPINGTABLE_SIZE / size_of::<MappingEntry>();

const _: () = assert!(MAPPINGTABLE_MAXENTRIES.is_power_of_two());
const _: () = assert!(size_of::<MappingEntry>().is_power_of_two());

/// One slot of either table: a `(source, destination)` address pair.
///
/// `src == 0` marks a free slot. A fresh table comes out of zero-filled
/// pages, so it is born empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MappingEntry {
    /// Lookup key; 0 when the slot is free.
    pub src: usize,
    /// Translated address the key maps to.
    pub dst: usize,
}

/// Hashes a guest address to its home slot.
///
/// One shift-xor pair over the word-aligned address; cheap enough for the
/// inline-assembly fast path to recompute on every lookup.
pub fn mapping_hash(addr: GuestAddr) -> usize {
    ((addr >> 2) ^ (addr >> 16)) & (MAPPINGTABLE_MAXENTRIES - 1)
}

fn pc_hash(addr: CacheAddr) -> usize {
    ((addr >> 2) ^ (addr >> 16)) & (PC_MAPPINGTABLE_MAXENTRIES - 1)
}

fn mapping_slots(ctx: &ThreadContext) -> &[MappingEntry] {
    // SAFETY: `mappingtable` points at MAPPINGTABLE_SIZE bytes of live,
    // page-aligned mapping owned by `ctx`, and MappingEntry is plain old
    // data valid for any bit pattern.
    unsafe { slice::from_raw_parts(ctx.mappingtable.cast(), MAPPINGTABLE_MAXENTRIES) }
}

fn mapping_slots_mut(ctx: &mut ThreadContext) -> &mut [MappingEntry] {
    // SAFETY: as in `mapping_slots`, with exclusivity inherited from the
    // `&mut ThreadContext`.
    unsafe { slice::from_raw_parts_mut(ctx.mappingtable.cast(), MAPPINGTABLE_MAXENTRIES) }
}

fn pc_slots_mut(ctx: &mut ThreadContext) -> &mut [MappingEntry] {
    // SAFETY: as in `mapping_slots`, for the PC table allocation.
    unsafe { slice::from_raw_parts_mut(ctx.pc_mappingtable.cast(), PC_MAPPINGTABLE_MAXENTRIES) }
}

/// Looks `orig_address` up in the mapping table.
///
/// A hit found away from its home slot is swapped with the entry at the
/// home slot. Swapping two occupied slots on the same probe chain cannot
/// open a hole, so every key on the chain stays findable, and the hot entry
/// now answers the fast path's first probe.
pub fn ccache_find(ctx: &mut ThreadContext, orig_address: GuestAddr) -> Option<CacheAddr> {
    #[cfg(feature = "statistics")]
    {
        ctx.stats.slow_lookups += 1;
    }

    let home = mapping_hash(orig_address);
    let slots = mapping_slots_mut(ctx);
    let mut idx = home;
    let mut pos = 0;
    while slots[idx].src != 0 {
        if slots[idx].src == orig_address {
            if pos != 0 {
                slots.swap(home, idx);
            }
            let dst = slots[home].dst;
            debug_assert_ne!(dst, 0);
            return Some(dst);
        }
        idx = (idx + 1) & (MAPPINGTABLE_MAXENTRIES - 1);
        pos += 1;
    }
    None
}

/// Registers a `guest -> cache` translation.
///
/// Fatal once the probe displacement reaches a tenth of the table: at that
/// fill level lookups have degraded badly and the thread is overdue for a
/// flush, which is the caller's decision to make.
pub fn ccache_add_entry(
    ctx: &mut ThreadContext,
    orig_address: GuestAddr,
    transl_address: CacheAddr,
) {
    #[cfg(feature = "inline-calls")]
    if ctx.trans.inline_return != 0 {
        // The emitted code belongs to an inlined callee; it must not become
        // reachable through its own guest address.
        debug!("inlining: not registering {orig_address:#x}");
        return;
    }

    let home = mapping_hash(orig_address);
    let slots = mapping_slots_mut(ctx);
    let mut idx = home;
    let mut displacement = 0usize;
    while slots[idx].src != 0 {
        idx = (idx + 1) & (MAPPINGTABLE_MAXENTRIES - 1);
        displacement += 1;
        if displacement >= MAPPINGTABLE_MAXENTRIES / 10 {
            fatal("mapping table out of space");
        }
    }
    slots[idx] = MappingEntry {
        src: orig_address,
        dst: transl_address,
    };
    debug!("mapping {orig_address:#x} -> {transl_address:#x} (displacement {displacement})");

    #[cfg(feature = "statistics")]
    ctx.stats.record_probe(displacement);
}

/// Finds the guest address that maps to `transl_address`.
///
/// Full linear scan; only the flush path uses this, to recover trampoline
/// and commit targets.
pub fn ccache_find_reverse(ctx: &ThreadContext, transl_address: CacheAddr) -> Option<GuestAddr> {
    mapping_slots(ctx)
        .iter()
        .find(|entry| entry.src != 0 && entry.dst == transl_address)
        .map(|entry| entry.src)
}

/// Records the guest PC behind a PC-relative instruction's translated copy.
pub fn pc_cache_add(ctx: &mut ThreadContext, transl_address: CacheAddr, orig_address: GuestAddr) {
    let slots = pc_slots_mut(ctx);
    let mut idx = pc_hash(transl_address);
    let mut displacement = 0usize;
    while slots[idx].src != 0 {
        idx = (idx + 1) & (PC_MAPPINGTABLE_MAXENTRIES - 1);
        displacement += 1;
        if displacement >= PC_MAPPINGTABLE_MAXENTRIES / 10 {
            fatal("pc table out of space");
        }
    }
    slots[idx] = MappingEntry {
        src: transl_address,
        dst: orig_address,
    };
}

/// Recovers the guest PC for a translated PC-relative instruction.
pub fn pc_cache_find(ctx: &mut ThreadContext, transl_address: CacheAddr) -> Option<GuestAddr> {
    let slots = pc_slots_mut(ctx);
    let mut idx = pc_hash(transl_address);
    while slots[idx].src != 0 {
        if slots[idx].src == transl_address {
            return Some(slots[idx].dst);
        }
        idx = (idx + 1) & (PC_MAPPINGTABLE_MAXENTRIES - 1);
    }
    None
}

/// Registers the commit mapping: a guest call to `commit_function` leaves
/// translated execution through the host's end-transaction entry.
pub fn transaction_init(ctx: &mut ThreadContext, commit_function: GuestAddr) {
    ccache_add_entry(ctx, commit_function, dispatcher::end_transaction_entry());
}

/// Throws away every translation this thread owns and rebuilds its state.
///
/// Translated units patch direct jumps straight into one another, so there
/// is no per-unit eviction; the flush is always whole-cache. The context's
/// address is preserved. State that must outlive the cache (signal-handler
/// targets and the commit mapping) is saved up front and re-established on
/// the fresh tables.
pub fn ccache_flush(ctx: &mut ThreadContext) {
    debug!("flushing code cache of context {:#x}", ctx.addr());

    #[cfg(feature = "statistics")]
    ctx.stats.report();

    #[cfg(feature = "handle-signal")]
    let saved_handlers = save_signal_targets(ctx);

    let commit_function = ccache_find_reverse(ctx, dispatcher::end_transaction_entry());

    mem::reinit_tls(ctx);

    if let Some(commit) = commit_function {
        transaction_init(ctx, commit);
    }
    trampoline::initialize_trampolines(ctx);
    #[cfg(feature = "authorize-syscalls")]
    crate::syscall::init_syscalls(ctx);

    #[cfg(feature = "handle-signal")]
    for (signum, target) in saved_handlers.into_iter().enumerate() {
        if let Some(target) = target {
            ctx.signal_handlers[signum] =
                trampoline::create_trampoline(ctx, target, 0, OriginKind::Absolute);
            debug!("signal {signum}: handler trampoline rebuilt for {target:#x}");
        }
    }
}

/// Collects the guest target of every installed signal-handler trampoline
/// before the pool pages under them disappear.
///
/// A handler pointing into translator memory that is not a trampoline means
/// the handler table was corrupted, which is unrecoverable. Handlers
/// outside translator memory belong to the guest and need no saving.
#[cfg(feature = "handle-signal")]
fn save_signal_targets(
    ctx: &mut ThreadContext,
) -> [Option<GuestAddr>; crate::context::MAX_NR_SIGNALS] {
    let mut targets = [None; crate::context::MAX_NR_SIGNALS];
    for (signum, slot) in targets.iter_mut().enumerate() {
        let handler = ctx.signal_handlers[signum];
        if handler.is_null() {
            continue;
        }
        let mut chunk = ctx.chunks;
        // SAFETY: read-only walk of the live chunk list; `handler` is only
        // dereferenced once it is known to lie inside a trampoline-pool
        // chunk, where records are live for the chunk's whole lifetime.
        unsafe {
            while !chunk.is_null() {
                let start = (*chunk).ptr as usize;
                let addr = handler as usize;
                if addr >= start && addr < start + (*chunk).size {
                    match (*chunk).kind {
                        MemKind::Trampoline => *slot = Some((*handler).target),
                        _ => fatal("signal handler points into internal translator data"),
                    }
                }
                chunk = (*chunk).next;
            }
        }
    }
    targets
}
