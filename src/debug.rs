// Copyright The Dyntrans Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Build-mode switches and the fatal-error primitive.

/// True if the build is configured with debug assertions on.
pub const DEBUG: bool = cfg!(debug_assertions);

/// Exit status used for unrecoverable translator failures.
pub const FATAL_EXIT_CODE: i32 = 255;

/// Terminates the process after an unrecoverable translator failure.
///
/// There is deliberately no unwinding here: by the time this is called the
/// guest may already depend on translated code that no longer exists, so the
/// only representable state is "gone". With the `sleep-on-fail` feature the
/// thread parks forever instead, so a debugger can be attached.
pub fn fatal(msg: &str) -> ! {
    log::error!("{msg}");

    #[cfg(feature = "sleep-on-fail")]
    {
        log::error!("sleeping instead of exiting; attach a debugger");
        loop {
            std::thread::park();
        }
    }

    #[cfg(not(feature = "sleep-on-fail"))]
    // SAFETY: `_exit` never returns and performs no cleanup that could touch
    // translator state; that is exactly what we want here.
    unsafe {
        libc::_exit(FATAL_EXIT_CODE);
    }
}
