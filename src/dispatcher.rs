// Copyright The Dyntrans Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The dispatcher seam: given a guest target, find (or make) translated
//! code for it.
//!
//! The real control transfers in and out of translated code are assembly
//! glue owned by the embedding runtime; what lives here is the lookup
//! protocol those stubs funnel into, plus the host entry symbols the
//! per-thread dispatcher stubs are built against.

use crate::cache;
use crate::context::{CacheAddr, GuestAddr, ThreadContext};
use crate::debug::fatal;
use crate::decoder::InstrDecoder;
use crate::translate;
use log::trace;

/// Resolves a guest target to translated code, translating on a miss.
///
/// This is the slow path behind every trampoline: the fast path is the
/// inline assembly probe over the mapping table, which only falls through
/// to here when the home slot does not hit.
pub fn dispatch<D: InstrDecoder>(
    ctx: &mut ThreadContext,
    decoder: &D,
    target: GuestAddr,
) -> CacheAddr {
    if let Some(transl) = cache::ccache_find(ctx, target) {
        trace!("dispatch hit: {target:#x} -> {transl:#x}");
        return transl;
    }
    trace!("dispatch miss: translating {target:#x}");
    translate::translate_unit(ctx, decoder, target)
}

/// Address of the host routine behind the unmanaged-code stubs.
pub fn unmanaged_code_entry() -> usize {
    unmanaged_code as usize
}

/// Address of the host routine behind the return-to-application stub.
pub fn ret2app_entry() -> usize {
    ret2app as usize
}

/// Address of the host routine behind the indirect-jump stub.
pub fn ijump_entry() -> usize {
    ijump as usize
}

/// Address of the host routine behind the indirect-call stub.
pub fn icall_entry() -> usize {
    icall as usize
}

/// Address of the host routine behind the return stubs.
pub fn ret_entry() -> usize {
    ret_lookup as usize
}

/// Cache-side address of the commit entry point: the mapping registered by
/// [`cache::transaction_init`] points here so the guest's commit call leaves
/// translated execution.
pub fn end_transaction_entry() -> CacheAddr {
    end_transaction as usize
}

// The symbols below are branch targets for generated code. Reaching one
// through a plain Rust call means a stub was executed without the runtime's
// assembly glue having set up a guest frame, which is unrecoverable.

extern "C" fn unmanaged_code() {
    fatal("unmanaged-code dispatcher entered without runtime glue");
}

extern "C" fn ret2app() {
    fatal("return-to-application stub entered without runtime glue");
}

extern "C" fn ijump() {
    fatal("indirect-jump dispatcher entered without runtime glue");
}

extern "C" fn icall() {
    fatal("indirect-call dispatcher entered without runtime glue");
}

extern "C" fn ret_lookup() {
    fatal("return dispatcher entered without runtime glue");
}

extern "C" fn end_transaction() {
    fatal("commit entry reached without runtime glue");
}
