// Copyright The Dyntrans Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Dyntrans: the core of a user-space dynamic binary translator.
//!
//! Guest machine code is never executed where it lies. The first time
//! control would reach an address, the translator copies and rewrites one
//! straight-line unit of instructions into a per-thread executable code
//! cache, registers the guest-to-cache mapping, and lets execution continue
//! inside the cache. Control transfers that leave translated code land in
//! trampolines that funnel back into the dispatcher, which looks the target
//! up and translates on a miss.
//!
//! The embedding runtime drives a thread like this:
//!
//! ```no_run
//! use dyntrans::mem;
//! use dyntrans::trampoline;
//!
//! let ctx = mem::init_tls();
//! trampoline::initialize_trampolines(ctx);
//! #[cfg(feature = "authorize-syscalls")]
//! dyntrans::syscall::init_syscalls(ctx);
//! // dispatcher::dispatch(ctx, &decoder, guest_entry) on every miss.
//! ```
//!
//! Everything a thread allocates hangs off its [`context::ThreadContext`];
//! the only reclamation is [`cache::ccache_flush`], which tears the whole
//! cache down and rebuilds the thread's state at the same address.

pub mod arch;
pub mod cache;
pub mod context;
pub mod debug;
pub mod decoder;
pub mod dispatcher;
pub mod mem;
pub mod pages;
#[cfg(feature = "shared-data")]
pub mod shared;
#[cfg(feature = "statistics")]
pub mod stats;
#[cfg(feature = "authorize-syscalls")]
pub mod syscall;
pub mod trampoline;
pub mod translate;

pub use context::{CacheAddr, GuestAddr, ThreadContext};
pub use translate::TranslationState;
