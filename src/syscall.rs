// Copyright The Dyntrans Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The system-call authorization table.
//!
//! Policy lives outside the translator; this module only owns the table
//! plumbing. Each guest thread carries one page of authorization function
//! pointers, indexed by system-call number, and translated system-call
//! sites route through whatever function is installed for their number.

use crate::context::{GuestAddr, ThreadContext};
use crate::pages::PAGESIZE;
use log::debug;

/// Number of system calls the table covers.
pub const MAX_SYSCALLS: usize = 512;

/// Pages backing one authorization table.
pub(crate) const SYSCALL_TABLE_PAGES: usize =
    (MAX_SYSCALLS * size_of::<SyscallAuthFn>()).div_ceil(PAGESIZE);

// The fast path indexes the table from assembly and expects it to be one
// page exactly.
const _: () = assert!(SYSCALL_TABLE_PAGES == 1);

/// The authorization layer's answer for one intercepted system call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthResponse {
    /// Let the call through unchanged.
    Granted,
    /// Refuse the call; the guest sees the given errno.
    Denied(i32),
    /// Skip the kernel and hand the guest a fabricated return value.
    Fake(usize),
}

/// An intercepted system call, as seen by an authorization function.
#[derive(Clone, Copy, Debug)]
pub struct SyscallRequest {
    /// System-call number.
    pub nr: usize,
    /// The call's six argument registers.
    pub args: [usize; 6],
    /// Guest address of the instruction that raised the call.
    pub site: GuestAddr,
}

/// One entry of the authorization table.
pub type SyscallAuthFn = fn(&mut ThreadContext, &SyscallRequest) -> AuthResponse;

/// The default policy: everything is allowed.
pub fn allow_syscall(_ctx: &mut ThreadContext, _request: &SyscallRequest) -> AuthResponse {
    AuthResponse::Granted
}

/// Fills the thread's table with the default policy.
///
/// Runs at thread start and again after every flush; a policy layer
/// installs its own entries on top afterwards.
pub fn init_syscalls(ctx: &mut ThreadContext) {
    for nr in 0..MAX_SYSCALLS {
        // SAFETY: the table page is live and sized for MAX_SYSCALLS entries.
        // Raw writes, because the freshly mapped page holds no valid
        // function pointers yet and must not be viewed as initialised.
        unsafe {
            ctx.syscall_table.add(nr).write(allow_syscall);
        }
    }
    debug!("syscall table reset to default-allow");
}

/// Installs an authorization function for one system-call number.
pub fn install_syscall_handler(ctx: &mut ThreadContext, nr: usize, auth: SyscallAuthFn) {
    if nr >= MAX_SYSCALLS {
        crate::debug::fatal("system-call number beyond the authorization table");
    }
    // SAFETY: in bounds of the live table page.
    unsafe {
        ctx.syscall_table.add(nr).write(auth);
    }
}

/// Runs the installed authorization function for a call.
pub fn authorize(ctx: &mut ThreadContext, request: &SyscallRequest) -> AuthResponse {
    if request.nr >= MAX_SYSCALLS {
        return AuthResponse::Denied(libc::ENOSYS);
    }
    // SAFETY: the table was fully initialised by `init_syscalls` before any
    // call can be authorized; entries are plain function pointers.
    let auth = unsafe { *ctx.syscall_table.add(request.nr) };
    auth(ctx, request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{init_tls, mem_free};

    fn deny_everything(_ctx: &mut ThreadContext, _request: &SyscallRequest) -> AuthResponse {
        AuthResponse::Denied(libc::EPERM)
    }

    fn request(nr: usize) -> SyscallRequest {
        SyscallRequest {
            nr,
            args: [0; 6],
            site: 0x8000,
        }
    }

    #[test]
    fn default_policy_grants() {
        let ctx = init_tls();
        init_syscalls(ctx);
        assert_eq!(authorize(ctx, &request(1)), AuthResponse::Granted);
        assert_eq!(
            authorize(ctx, &request(MAX_SYSCALLS - 1)),
            AuthResponse::Granted
        );
        mem_free(ctx);
    }

    #[test]
    fn installed_handler_overrides_one_number() {
        let ctx = init_tls();
        init_syscalls(ctx);
        install_syscall_handler(ctx, 42, deny_everything);
        assert_eq!(
            authorize(ctx, &request(42)),
            AuthResponse::Denied(libc::EPERM)
        );
        assert_eq!(authorize(ctx, &request(41)), AuthResponse::Granted);
        mem_free(ctx);
    }

    #[test]
    fn out_of_range_numbers_are_denied() {
        let ctx = init_tls();
        init_syscalls(ctx);
        assert_eq!(
            authorize(ctx, &request(MAX_SYSCALLS)),
            AuthResponse::Denied(libc::ENOSYS)
        );
        mem_free(ctx);
    }
}
