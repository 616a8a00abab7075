// Copyright The Dyntrans Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Per-thread translator state.
//!
//! Each guest thread owns exactly one [`ThreadContext`]. The context is
//! self-rooted: the struct sits at the top of its own private translator
//! stack, inside the first page block its chunk list describes. That layout
//! is what makes a cache flush address-stable: everything downstream of the
//! bootstrap block can be torn down and rebuilt while the context itself
//! stays put.

use crate::decoder::InstrInfo;
use crate::trampoline::Trampoline;
use core::ptr;

/// An address in the guest program's (untranslated) code.
pub type GuestAddr = usize;

/// An address inside translator-owned executable memory.
pub type CacheAddr = usize;

/// Number of signal slots tracked per thread.
#[cfg(feature = "handle-signal")]
pub const MAX_NR_SIGNALS: usize = 64;

/// What a page-allocator chunk is used for.
///
/// The kind decides the page protection at allocation time: only the code
/// cache and the trampoline pool are mapped executable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MemKind {
    /// Bootstrap block and scratch-allocator refills.
    Internal,
    /// The guest-to-cache mapping table.
    MappingTable,
    /// The cache-to-guest PC table used for PC-relative materialisation.
    PcMappingTable,
    /// Translated instruction bytes.
    CodeCache,
    /// The trampoline pool.
    Trampoline,
    /// The system-call authorization table.
    #[cfg(feature = "authorize-syscalls")]
    SyscallTable,
    /// The indirect-control-flow predictor pool.
    #[cfg(feature = "icf-predict")]
    IcfPredict,
    /// The process-wide shared region. Never tracked, never freed.
    #[cfg(feature = "shared-data")]
    SharedData,
}

/// Bookkeeping record for one page-allocator allocation.
///
/// Chunks form a singly linked list rooted at [`ThreadContext::chunks`]; the
/// list is the sole authority on what must be unmapped at flush or teardown.
/// The records themselves live in scratch memory, so a record can sit inside
/// the very region it describes.
#[repr(C)]
pub struct MemChunk {
    /// Start of the mapped region.
    pub ptr: *mut u8,
    /// Size of the region in bytes.
    pub size: usize,
    /// What the region is used for.
    pub kind: MemKind,
    /// Next chunk, or null for the list tail (the bootstrap block).
    pub next: *mut MemChunk,
}

/// One indirect-control-flow prediction record.
///
/// Records embed their own freelist link; see the pool management in
/// [`crate::mem`].
#[cfg(feature = "icf-predict")]
#[repr(C)]
pub struct IcfPrediction {
    /// Guest location the prediction was made for.
    pub origin1: GuestAddr,
    /// Predicted translated target.
    pub dst1: CacheAddr,
    /// Times the prediction missed since it was installed.
    pub mispredicts: u32,
    /// Freelist link while the record is unused.
    pub next: *mut IcfPrediction,
}

/// Translator cursor state, shared between the driver and the per-opcode
/// actions.
#[repr(C)]
pub struct Translate {
    /// Guest address of the instruction being translated.
    pub cur_instr: GuestAddr,
    /// Decoded descriptor for `cur_instr`.
    pub cur_instr_info: InstrInfo,
    /// Guest address of the next instruction in program order.
    pub next_instr: GuestAddr,
    /// High-water mark: where the next translated byte goes.
    pub transl_instr: *mut u8,
    /// End of usable cache space; a guard zone past this keeps a trailing
    /// epilogue from overrunning the chunk.
    pub code_cache_end: *mut u8,
    /// Head of the trampoline freelist.
    pub trampos: *mut Trampoline,
    /// Return address of the call currently being inlined, or 0. While this
    /// is set, freshly translated code belongs to an inlined callee and must
    /// not become externally addressable.
    #[cfg(feature = "inline-calls")]
    pub inline_return: GuestAddr,
}

impl Translate {
    pub(crate) fn empty() -> Self {
        Self {
            cur_instr: 0,
            cur_instr_info: InstrInfo::default(),
            next_instr: 0,
            transl_instr: ptr::null_mut(),
            code_cache_end: ptr::null_mut(),
            trampos: ptr::null_mut(),
            #[cfg(feature = "inline-calls")]
            inline_return: 0,
        }
    }
}

/// The owning context for one guest thread.
///
/// Created by [`crate::mem::init_tls`] and alive until the thread exits. The
/// struct is reached through a `&'static mut` whose address never changes;
/// a cache flush rebuilds everything it points to in place.
#[repr(C)]
pub struct ThreadContext {
    /// Top of this thread's private translator stack. Always equal to the
    /// address of the context itself.
    pub stack: *mut u8,
    /// Head of the chunk list; the tail is always the bootstrap block.
    pub chunks: *mut MemChunk,
    /// The guest-to-cache mapping table (raw storage plus guard word).
    pub mappingtable: *mut u8,
    /// The cache-to-guest PC table.
    pub pc_mappingtable: *mut u8,
    /// Translator cursor state.
    pub trans: Translate,
    /// Pending indirect-jump target handed over by translated code.
    pub ind_target: GuestAddr,
    /// Scratch allocator cursor.
    pub(crate) smalloc: *mut u8,
    /// Bytes left in the current scratch region.
    pub(crate) smalloc_size: usize,

    /// Dispatcher stub taking over when translated code reaches an
    /// untranslated target.
    pub unmanaged_code_trampoline: CacheAddr,
    /// Dispatcher stub returning control to the untranslated application.
    pub ret2app_trampoline: CacheAddr,
    /// Fast-path stub for indirect jumps.
    pub opt_ijump_trampoline: CacheAddr,
    /// Fast-path stub for indirect calls.
    pub opt_icall_trampoline: CacheAddr,
    /// Fast-path stub for function returns.
    pub opt_ret_trampoline: CacheAddr,
    /// Return stub that also pops a shadow-stack entry.
    #[cfg(feature = "stack-protection")]
    pub opt_ret_remove_trampoline: CacheAddr,

    /// Head of the predictor freelist.
    #[cfg(feature = "icf-predict")]
    pub icf_predict: *mut IcfPrediction,
    /// Fixup stub repairing a missed indirect-jump prediction.
    #[cfg(feature = "icf-predict")]
    pub opt_ijump_predict_fixup: CacheAddr,
    /// Fixup stub repairing a missed indirect-call prediction.
    #[cfg(feature = "icf-predict")]
    pub opt_icall_predict_fixup: CacheAddr,

    /// Authorization function table, one entry per system call number.
    #[cfg(feature = "authorize-syscalls")]
    pub syscall_table: *mut crate::syscall::SyscallAuthFn,
    /// Guest address of the system-call instruction currently being
    /// translated or authorized.
    #[cfg(feature = "authorize-syscalls")]
    pub syscall_location: GuestAddr,

    /// Installed per-signal trampolines; null where the guest handler is
    /// untouched.
    #[cfg(feature = "handle-signal")]
    pub signal_handlers: [*mut Trampoline; MAX_NR_SIGNALS],

    /// The process-wide shared region, once this thread registered with it.
    #[cfg(feature = "shared-data")]
    pub shared_data: *const crate::shared::SharedData,

    /// Translation and lookup counters.
    #[cfg(feature = "statistics")]
    pub stats: crate::stats::TransStats,
}

impl ThreadContext {
    /// The context's own address; stable for the lifetime of the thread.
    pub fn addr(&self) -> usize {
        self as *const Self as usize
    }
}
