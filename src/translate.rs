// Copyright The Dyntrans Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The translator loop and the per-opcode actions.
//!
//! A translation unit (TU) is a straight-line run of guest instructions. The
//! driver decodes one instruction at a time, hands it to the action the
//! decoder selected, and stops when an action reports that the unit is
//! closed. Actions emit into the code cache through the shared cursor in
//! [`Translate`] and must advance it past everything they wrote.
//!
//! [`Translate`]: crate::context::Translate

use crate::arch::{self, CodeCursor, GuestWord, INSTR_WIDTH};
use crate::cache;
use crate::context::{CacheAddr, GuestAddr, ThreadContext};
use crate::debug::fatal;
use crate::decoder::{FLAG_CONDITIONAL, FLAG_PC_RELATIVE, InstrDecoder, KIND_SWI};
use crate::mem;
use crate::trampoline::{OriginKind, create_trampoline};
use log::{debug, warn};

/// An action's verdict on the unit being translated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranslationState {
    /// The unit continues with the next instruction.
    Neutral,
    /// The unit is closed; the action emitted its own epilogue.
    Close,
    /// The unit is closed, and the driver must emit glue that re-enters the
    /// dispatcher at the next instruction. Used after instructions that may
    /// redirect control opaquely, such as system calls.
    CloseGlue,
}

/// A per-opcode translation function.
pub type ActionFn = fn(&mut ThreadContext) -> TranslationState;

/// Headroom under which the driver moves to a fresh code-cache chunk before
/// starting a unit.
const CCACHE_MIN_TU_HEADROOM: usize = 1024;

/// Translates one unit starting at `start` and registers its entry mapping.
///
/// Returns the cache address of the unit's first translated instruction.
pub fn translate_unit<D: InstrDecoder>(
    ctx: &mut ThreadContext,
    decoder: &D,
    start: GuestAddr,
) -> CacheAddr {
    debug!("translating unit at {start:#x}");
    #[cfg(feature = "statistics")]
    {
        ctx.stats.translations += 1;
    }

    let headroom =
        (ctx.trans.code_cache_end as usize).saturating_sub(ctx.trans.transl_instr as usize);
    if headroom < CCACHE_MIN_TU_HEADROOM {
        mem::allocate_new_code_cache(ctx);
    }

    let tu_start = ctx.trans.transl_instr as CacheAddr;
    ctx.trans.cur_instr = start;

    loop {
        let decoded = decoder.decode(ctx.trans.cur_instr);
        ctx.trans.cur_instr_info = decoded.info;
        ctx.trans.next_instr = decoded.next_instr;

        match (decoded.action)(ctx) {
            TranslationState::Neutral => {
                if ctx.trans.transl_instr >= ctx.trans.code_cache_end {
                    // The chunk filled up mid-unit. Stop here; execution
                    // continues in a fresh chunk after one round through the
                    // dispatcher.
                    emit_glue(ctx, ctx.trans.next_instr);
                    break;
                }
                ctx.trans.cur_instr = ctx.trans.next_instr;
            }
            TranslationState::Close => break,
            TranslationState::CloseGlue => {
                emit_glue(ctx, ctx.trans.next_instr);
                break;
            }
        }
    }

    cache::ccache_add_entry(ctx, start, tu_start);
    tu_start
}

/// Emits the standard unit epilogue: an absolute branch into a trampoline
/// that hands `target` to the dispatcher.
///
/// The branch literal's cache address becomes the trampoline's origin, so
/// the dispatcher can patch the exit straight to the translation once the
/// target exists.
fn emit_glue(ctx: &mut ThreadContext, target: GuestAddr) {
    let literal_site = ctx.trans.transl_instr as usize + INSTR_WIDTH;
    let trampo = create_trampoline(ctx, target, literal_site, OriginKind::Absolute);
    // SAFETY: live pool record just returned by create_trampoline.
    let stub = unsafe { (*trampo).code.as_ptr() as usize };
    // SAFETY: the guard zone leaves room for the two-word epilogue.
    let mut code = unsafe { CodeCursor::new(ctx.trans.transl_instr) };
    code.emit_branch_abs(stub as u32);
    ctx.trans.transl_instr = code.pos();
}

/// Marks the start of an inlined call body returning to `return_addr`.
///
/// While set, translated code belongs to the inlined callee: it is only
/// reachable through the surrounding unit, so entry registration is
/// suppressed until [`end_inline`].
#[cfg(feature = "inline-calls")]
pub fn begin_inline(ctx: &mut ThreadContext, return_addr: GuestAddr) {
    debug_assert_eq!(ctx.trans.inline_return, 0, "inlining does not nest");
    ctx.trans.inline_return = return_addr;
}

/// Leaves inlining mode and resumes normal entry registration.
#[cfg(feature = "inline-calls")]
pub fn end_inline(ctx: &mut ThreadContext) {
    ctx.trans.inline_return = 0;
}

/// Translates an instruction by emitting nothing at all. For annotations
/// and hint encodings with no architectural effect.
pub fn action_none(_ctx: &mut ThreadContext) -> TranslationState {
    TranslationState::Neutral
}

/// Copies the instruction verbatim into the cache.
///
/// Software interrupts close the unit with dispatcher glue: the kernel may
/// move control somewhere we have not translated yet.
pub fn action_copy(ctx: &mut ThreadContext) -> TranslationState {
    let addr = ctx.trans.cur_instr;
    // SAFETY: the guest shares our address space and the decoder already
    // read this word.
    let word = unsafe { (addr as *const GuestWord).read() };

    let transl_addr = ctx.trans.transl_instr as CacheAddr;
    // SAFETY: the driver keeps the cursor below the guard zone.
    let mut code = unsafe { CodeCursor::new(ctx.trans.transl_instr) };
    code.emit(word);
    ctx.trans.transl_instr = code.pos();

    if ctx.trans.cur_instr_info.opcode_flags & FLAG_PC_RELATIVE != 0 {
        // The original PC must stay recoverable from the translated
        // location for PC-relative operands.
        cache::pc_cache_add(ctx, transl_addr, addr);
    }

    if ctx.trans.cur_instr_info.kind() == KIND_SWI {
        debug!("software interrupt at {addr:#x} closes the unit");
        return TranslationState::CloseGlue;
    }
    TranslationState::Neutral
}

/// Copies an opcode the tables do not know, hoping it has no control-flow
/// side effects. Last-resort fallback for permissive builds.
pub fn action_warn(ctx: &mut ThreadContext) -> TranslationState {
    warn!(
        "unhandled opcode at {:#x}; copying it verbatim and continuing",
        ctx.trans.cur_instr
    );
    action_copy(ctx)
}

/// Refuses an opcode the translator cannot handle safely.
pub fn action_fail(ctx: &mut ThreadContext) -> TranslationState {
    log::error!("unhandled opcode in unit at {:#x}", ctx.trans.cur_instr);
    fatal("giving up on an untranslatable instruction");
}

/// Translates a direct branch.
///
/// Unconditional branches become the plain epilogue towards the target.
/// Conditional ones get two exits: the taken edge through its own
/// trampoline, the fall-through edge directly after it.
pub fn action_branch(ctx: &mut ThreadContext) -> TranslationState {
    let info = ctx.trans.cur_instr_info;
    if info.opcode_flags & FLAG_CONDITIONAL == 0 {
        emit_glue(ctx, info.branch_target);
        return TranslationState::Close;
    }

    // SAFETY: the guest shares our address space.
    let word = unsafe { (ctx.trans.cur_instr as *const GuestWord).read() };
    let cond = arch::cond_of(word);

    let taken_literal = ctx.trans.transl_instr as usize + 2 * INSTR_WIDTH;
    let taken = create_trampoline(ctx, info.branch_target, taken_literal, OriginKind::Absolute);
    let fall_literal = ctx.trans.transl_instr as usize + 3 * INSTR_WIDTH;
    let fall = create_trampoline(
        ctx,
        ctx.trans.next_instr,
        fall_literal,
        OriginKind::Absolute,
    );

    // Layout: both loads read the literal two words past themselves, so the
    // untaken conditional falls into the unconditional exit.
    //   ldr<cc> pc, [pc, #0]   ; -> taken literal
    //   ldr     pc, [pc, #0]   ; -> fall-through literal
    //   .word   taken-stub
    //   .word   fall-stub
    // SAFETY: the guard zone leaves room for the four-word epilogue.
    let mut code = unsafe { CodeCursor::new(ctx.trans.transl_instr) };
    code.emit(arch::enc_ldr_pc_literal(cond, 0));
    code.emit(arch::enc_ldr_pc_literal(arch::COND_AL, 0));
    // SAFETY: live pool records.
    unsafe {
        code.emit((*taken).code.as_ptr() as usize as u32);
        code.emit((*fall).code.as_ptr() as usize as u32);
    }
    ctx.trans.transl_instr = code.pos();
    TranslationState::Close
}

/// Translates a direct call: materialise the guest return address in the
/// link register, then leave towards the callee.
pub fn action_branch_and_link(ctx: &mut ThreadContext) -> TranslationState {
    let info = ctx.trans.cur_instr_info;
    let return_addr = ctx.trans.next_instr;

    if info.opcode_flags & FLAG_CONDITIONAL == 0 {
        // SAFETY: the guard zone leaves room for the two-word link setup.
        let mut code = unsafe { CodeCursor::new(ctx.trans.transl_instr) };
        code.emit_mov_imm32(arch::REG_LR, return_addr as u32);
        ctx.trans.transl_instr = code.pos();
        emit_glue(ctx, info.branch_target);
        return TranslationState::Close;
    }

    // SAFETY: the guest shares our address space.
    let word = unsafe { (ctx.trans.cur_instr as *const GuestWord).read() };
    let cond = arch::cond_of(word);

    let fall_literal = ctx.trans.transl_instr as usize + 4 * INSTR_WIDTH;
    let fall = create_trampoline(
        ctx,
        ctx.trans.next_instr,
        fall_literal,
        OriginKind::Absolute,
    );
    let taken_literal = ctx.trans.transl_instr as usize + 5 * INSTR_WIDTH;
    let taken = create_trampoline(ctx, info.branch_target, taken_literal, OriginKind::Absolute);

    // The inverted condition skips the call sequence entirely.
    //   ldr<!cc> pc, [pc, #8]  ; -> fall-through literal
    //   movw/movt lr, #return
    //   ldr      pc, [pc, #0]  ; -> taken literal
    //   .word    fall-stub
    //   .word    taken-stub
    // SAFETY: the guard zone leaves room for the six-word epilogue.
    let mut code = unsafe { CodeCursor::new(ctx.trans.transl_instr) };
    code.emit(arch::enc_ldr_pc_literal(cond ^ 1, 8));
    code.emit_mov_imm32(arch::REG_LR, return_addr as u32);
    code.emit(arch::enc_ldr_pc_literal(arch::COND_AL, 0));
    // SAFETY: live pool records.
    unsafe {
        code.emit((*fall).code.as_ptr() as usize as u32);
        code.emit((*taken).code.as_ptr() as usize as u32);
    }
    ctx.trans.transl_instr = code.pos();
    TranslationState::Close
}

/// Translates a function return by routing through the return dispatcher
/// stub.
pub fn action_ret(ctx: &mut ThreadContext) -> TranslationState {
    #[cfg(feature = "stack-protection")]
    let stub = ctx.opt_ret_remove_trampoline;
    #[cfg(not(feature = "stack-protection"))]
    let stub = ctx.opt_ret_trampoline;

    // SAFETY: the guard zone leaves room for the two-word epilogue.
    let mut code = unsafe { CodeCursor::new(ctx.trans.transl_instr) };
    code.emit_branch_abs(stub as u32);
    ctx.trans.transl_instr = code.pos();
    TranslationState::Close
}

/// Translates a system-call instruction.
///
/// The instruction itself is copied; the unit closes with glue because the
/// kernel may hand control anywhere. With syscall authorization on, the
/// call site is recorded for the policy layer first.
pub fn action_sysenter(ctx: &mut ThreadContext) -> TranslationState {
    #[cfg(feature = "authorize-syscalls")]
    {
        ctx.syscall_location = ctx.trans.cur_instr;
    }

    // SAFETY: the guest shares our address space.
    let word = unsafe { (ctx.trans.cur_instr as *const GuestWord).read() };
    // SAFETY: the driver keeps the cursor below the guard zone.
    let mut code = unsafe { CodeCursor::new(ctx.trans.transl_instr) };
    code.emit(word);
    ctx.trans.transl_instr = code.pos();
    TranslationState::CloseGlue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::test::{
        ADD_R0_1, BX_LR, LDR_R0_PC_8, MOV_R1_2, SWI_0, TestDecoder, UDF,
    };
    use crate::decoder::{DecodedInstr, InstrDecoder};
    use crate::mem::{self, init_tls, mem_free};
    use crate::trampoline::{Trampoline, initialize_trampolines};

    fn emitted_words(from: CacheAddr, to: *mut u8) -> Vec<u32> {
        let len = to as usize - from;
        // SAFETY: the range was just written by the code under test.
        unsafe {
            core::slice::from_raw_parts(from as *const u8, len)
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                .collect()
        }
    }

    /// Pre-fills the pool and returns the records the next allocations will
    /// pop, in order. Creation pops from the head and only rewrites a
    /// record's metadata, so the chain stays walkable up front.
    fn next_free_trampolines<const N: usize>(ctx: &mut ThreadContext) -> [*mut Trampoline; N] {
        if ctx.trans.trampos.is_null() {
            mem::allocate_new_trampolines(ctx);
        }
        let mut out = [core::ptr::null_mut(); N];
        let mut t = ctx.trans.trampos;
        for slot in &mut out {
            *slot = t;
            // SAFETY: `t` is a live freelist record.
            t = unsafe { (*t).next };
        }
        out
    }

    #[test]
    fn copy_advances_by_instruction_width_and_swi_closes() {
        let ctx = init_tls();
        let program = [ADD_R0_1, MOV_R1_2, SWI_0];
        let start = ctx.trans.transl_instr as usize;

        let mut verdicts = Vec::new();
        let mut addr = program.as_ptr() as usize;
        for _ in 0..program.len() {
            let DecodedInstr {
                info,
                next_instr,
                action,
            } = TestDecoder.decode(addr);
            ctx.trans.cur_instr = addr;
            ctx.trans.cur_instr_info = info;
            ctx.trans.next_instr = next_instr;
            verdicts.push(action(ctx));
            addr = next_instr;
        }

        assert_eq!(
            verdicts,
            [
                TranslationState::Neutral,
                TranslationState::Neutral,
                TranslationState::CloseGlue
            ]
        );
        // Three copied instructions, nothing else: 12 bytes.
        assert_eq!(ctx.trans.transl_instr as usize - start, 12);
        assert_eq!(
            emitted_words(start, ctx.trans.transl_instr),
            [ADD_R0_1, MOV_R1_2, SWI_0]
        );
        mem_free(ctx);
    }

    #[test]
    fn driver_registers_the_unit_and_appends_glue() {
        let ctx = init_tls();
        initialize_trampolines(ctx);
        let program = [ADD_R0_1, MOV_R1_2, SWI_0];
        let entry = program.as_ptr() as usize;

        let [glue] = next_free_trampolines(ctx);
        let tu_start = translate_unit(ctx, &TestDecoder, entry);
        assert_eq!(cache::ccache_find(ctx, entry), Some(tu_start));

        // Body plus the two-word dispatcher epilogue.
        let words = emitted_words(tu_start, ctx.trans.transl_instr);
        assert_eq!(words.len(), 5);
        assert_eq!(words[..3], program);
        assert_eq!(words[3], arch::LDR_PC_LITERAL_M4);
        // SAFETY: the record was armed by the epilogue emission.
        unsafe {
            assert_eq!(words[4], (*glue).code.as_ptr() as usize as u32);
            assert_eq!((*glue).target, entry + 3 * INSTR_WIDTH);
            assert_eq!((*glue).origin, tu_start + 4 * INSTR_WIDTH);
            assert_eq!((*glue).origin_kind, OriginKind::Absolute);
        }
        mem_free(ctx);
    }

    #[test]
    fn unconditional_branch_exits_through_a_trampoline() {
        let ctx = init_tls();
        initialize_trampolines(ctx);
        // b . + 0x10 (target two instructions ahead of the successor)
        let program = [0xEA00_0002u32, UDF, UDF, UDF, ADD_R0_1];
        let entry = program.as_ptr() as usize;

        let [glue] = next_free_trampolines(ctx);
        let tu_start = translate_unit(ctx, &TestDecoder, entry);
        let words = emitted_words(tu_start, ctx.trans.transl_instr);
        assert_eq!(words.len(), 2);
        assert_eq!(words[0], arch::LDR_PC_LITERAL_M4);
        // SAFETY: the record was armed by the branch epilogue.
        unsafe {
            assert_eq!(words[1], (*glue).code.as_ptr() as usize as u32);
            assert_eq!((*glue).target, entry + 4 * INSTR_WIDTH);
        }
        mem_free(ctx);
    }

    #[test]
    fn conditional_branch_gets_two_exits() {
        let ctx = init_tls();
        initialize_trampolines(ctx);
        // bne . + 8
        let program = [0x1A00_0000u32, ADD_R0_1];
        let entry = program.as_ptr() as usize;

        let [taken, fall] = next_free_trampolines(ctx);
        let tu_start = translate_unit(ctx, &TestDecoder, entry);
        let words = emitted_words(tu_start, ctx.trans.transl_instr);
        assert_eq!(words.len(), 4);
        assert_eq!(words[0], arch::enc_ldr_pc_literal(0x1, 0));
        assert_eq!(words[1], arch::enc_ldr_pc_literal(arch::COND_AL, 0));
        // SAFETY: both records were armed by the branch epilogue.
        unsafe {
            assert_eq!(words[2], (*taken).code.as_ptr() as usize as u32);
            assert_eq!((*taken).target, entry + 2 * INSTR_WIDTH);
            assert_eq!((*fall).target, entry + INSTR_WIDTH);
        }
        mem_free(ctx);
    }

    #[test]
    fn call_materialises_the_return_address() {
        let ctx = init_tls();
        initialize_trampolines(ctx);
        // bl . + 8
        let program = [0xEB00_0000u32, ADD_R0_1, MOV_R1_2];
        let entry = program.as_ptr() as usize;
        let return_addr = entry + INSTR_WIDTH;

        let [glue] = next_free_trampolines(ctx);
        let tu_start = translate_unit(ctx, &TestDecoder, entry);
        let words = emitted_words(tu_start, ctx.trans.transl_instr);
        assert_eq!(words.len(), 4);
        assert_eq!(
            words[0],
            arch::enc_movw(arch::REG_LR, return_addr as u16)
        );
        assert_eq!(
            words[1],
            arch::enc_movt(arch::REG_LR, (return_addr >> 16) as u16)
        );
        assert_eq!(words[2], arch::LDR_PC_LITERAL_M4);
        // SAFETY: the record was armed by the call epilogue.
        unsafe {
            assert_eq!((*glue).target, entry + 2 * INSTR_WIDTH);
        }
        mem_free(ctx);
    }

    #[cfg(not(feature = "stack-protection"))]
    #[test]
    fn ret_routes_through_the_return_stub() {
        let ctx = init_tls();
        initialize_trampolines(ctx);
        let program = [BX_LR];
        let entry = program.as_ptr() as usize;

        let tu_start = translate_unit(ctx, &TestDecoder, entry);
        let words = emitted_words(tu_start, ctx.trans.transl_instr);
        assert_eq!(words.len(), 2);
        assert_eq!(words[0], arch::LDR_PC_LITERAL_M4);
        assert_eq!(words[1], ctx.opt_ret_trampoline as u32);
        mem_free(ctx);
    }

    #[test]
    fn pc_relative_copy_lands_in_the_pc_table() {
        let ctx = init_tls();
        initialize_trampolines(ctx);
        let program = [LDR_R0_PC_8, SWI_0, 0, 0, 0x1234_5678u32];
        let entry = program.as_ptr() as usize;

        let tu_start = translate_unit(ctx, &TestDecoder, entry);
        assert_eq!(cache::pc_cache_find(ctx, tu_start), Some(entry));
        mem_free(ctx);
    }

    #[cfg(feature = "inline-calls")]
    #[test]
    fn inlining_suppresses_entry_registration() {
        let ctx = init_tls();
        initialize_trampolines(ctx);
        let inlined = [ADD_R0_1, SWI_0];
        let outer = [MOV_R1_2, SWI_0];

        begin_inline(ctx, 0xBEE4);
        translate_unit(ctx, &TestDecoder, inlined.as_ptr() as usize);
        assert_eq!(cache::ccache_find(ctx, inlined.as_ptr() as usize), None);
        end_inline(ctx);

        let tu = translate_unit(ctx, &TestDecoder, outer.as_ptr() as usize);
        assert_eq!(cache::ccache_find(ctx, outer.as_ptr() as usize), Some(tu));
        mem_free(ctx);
    }
}
