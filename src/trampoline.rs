// Copyright The Dyntrans Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Trampolines: the small executable stubs that carry control between
//! translated code and the dispatcher.
//!
//! A trampoline stands in for code that does not exist yet (an untranslated
//! branch target), or for code the host must interpose on (a signal
//! handler). Its stub switches to the translator stack and branches into the
//! dispatcher; the record around the stub carries the metadata the
//! dispatcher needs to finish the job and, for placeholder trampolines, to
//! patch the original branch site once the target is translated.

use crate::arch::{self, CodeCursor};
use crate::context::{CacheAddr, GuestAddr, ThreadContext};
use crate::dispatcher;
use crate::mem;
use log::debug;

/// Bytes of stub code embedded in every trampoline record.
pub const TRAMPOLINE_CODE_BYTES: usize = 16;

/// How the branch site that led into a trampoline encodes its target.
///
/// The dispatcher uses this to patch the site once the target exists in the
/// cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum OriginKind {
    /// The origin holds an absolute cache address (or there is no site to
    /// patch at all, as for signal handlers).
    Absolute = 0,
    /// The origin holds a PC-relative displacement.
    Relative = 1,
    /// The origin is a shadow return-address slot.
    ReturnAddress = 2,
}

/// One pooled trampoline.
///
/// Records embed their own freelist link, so a free record costs nothing
/// beyond its pool slot.
#[repr(C)]
pub struct Trampoline {
    /// Guest address control was headed for.
    pub target: GuestAddr,
    /// Cache-side branch site to patch once `target` is translated, or 0.
    pub origin: CacheAddr,
    /// How `origin` encodes its target.
    pub origin_kind: OriginKind,
    /// The executable stub.
    pub code: [u8; TRAMPOLINE_CODE_BYTES],
    /// Freelist link while the record is unused.
    pub next: *mut Trampoline,
}

/// Takes a trampoline from the pool and arms it.
///
/// The stub loads the translator stack pointer and branches to the
/// unmanaged-code dispatcher stub; the record's metadata tells the
/// dispatcher where the guest was headed and which site to patch.
pub fn create_trampoline(
    ctx: &mut ThreadContext,
    call_target: GuestAddr,
    origin: CacheAddr,
    origin_kind: OriginKind,
) -> *mut Trampoline {
    if ctx.trans.trampos.is_null() {
        mem::allocate_new_trampolines(ctx);
    }

    let trampo = ctx.trans.trampos;
    // SAFETY: the freelist head is a live pool record owned by `ctx`.
    unsafe {
        ctx.trans.trampos = (*trampo).next;
        (*trampo).target = call_target;
        (*trampo).origin = origin;
        (*trampo).origin_kind = origin_kind;

        // The code buffer holds exactly the four words emitted here.
        let mut code = CodeCursor::new((*trampo).code.as_mut_ptr());
        code.emit_mov_imm32(arch::REG_SP, ctx.stack as usize as u32);
        code.emit_branch_abs(ctx.unmanaged_code_trampoline as u32);
    }

    debug!(
        "trampoline {trampo:p}: target {call_target:#x}, origin {origin:#x} ({origin_kind:?})"
    );
    trampo
}

/// Builds the per-thread dispatcher stubs into the code cache and publishes
/// their addresses on the context.
///
/// Every translated control transfer that cannot be resolved inline funnels
/// through one of these. They are rebuilt from scratch after a flush, since
/// the cache pages under them are gone.
pub fn initialize_trampolines(ctx: &mut ThreadContext) {
    ctx.unmanaged_code_trampoline = build_dispatcher_stub(ctx, dispatcher::unmanaged_code_entry());
    ctx.ret2app_trampoline = build_dispatcher_stub(ctx, dispatcher::ret2app_entry());
    ctx.opt_ijump_trampoline = build_dispatcher_stub(ctx, dispatcher::ijump_entry());
    ctx.opt_icall_trampoline = build_dispatcher_stub(ctx, dispatcher::icall_entry());
    ctx.opt_ret_trampoline = build_dispatcher_stub(ctx, dispatcher::ret_entry());
    #[cfg(feature = "stack-protection")]
    {
        ctx.opt_ret_remove_trampoline = build_dispatcher_stub(ctx, dispatcher::ret_entry());
    }
    #[cfg(feature = "icf-predict")]
    {
        ctx.opt_ijump_predict_fixup = build_dispatcher_stub(ctx, dispatcher::ijump_entry());
        ctx.opt_icall_predict_fixup = build_dispatcher_stub(ctx, dispatcher::icall_entry());
    }
    debug!(
        "dispatcher stubs ready, unmanaged-code stub at {:#x}",
        ctx.unmanaged_code_trampoline
    );
}

/// Emits one host-entry stub into the code cache: stack switch plus an
/// absolute branch to the host routine.
fn build_dispatcher_stub(ctx: &mut ThreadContext, host_entry: usize) -> CacheAddr {
    let stub = ctx.trans.transl_instr;
    // SAFETY: the code-cache guard zone leaves room for a four-word stub.
    let mut code = unsafe { CodeCursor::new(stub) };
    code.emit_mov_imm32(arch::REG_SP, ctx.stack as usize as u32);
    code.emit_branch_abs(host_entry as u32);
    ctx.trans.transl_instr = code.pos();
    stub as CacheAddr
}
