// Copyright The Coldboot Probe Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The core's sole non-recoverable exit path.
//!
//! Contract violations (bad descriptors, region invariant breaks, capacity overflow) are fatal:
//! they can never be caused by decaying RAM, only by a bug or an unsupported platform, so there is
//! nothing useful left to do but report exactly which check failed and stop.

/// True if the build is configured with debug assertions on.
pub const DEBUG: bool = cfg!(debug_assertions);

/// Checks a fatal precondition, halting the core if it does not hold.
///
/// On a real platform this never returns from a failed check, since
/// [`crate::platform::Platform::halt`] diverges. Under `cfg(test)` it panics instead, so the same
/// call sites are exercised by host unit tests.
#[macro_export]
macro_rules! require {
    ($platform:expr, $cond:expr $(,)?) => {
        $crate::require!($platform, $cond, ::core::stringify!($cond))
    };
    ($platform:expr, $cond:expr, $($arg:tt)+) => {
        if !($cond) {
            $crate::debug::fatal($platform, ::core::file!(), ::core::line!(), &format_args!($($arg)+));
        }
    };
}

/// Prints a single line identifying a failed check and halts.
///
/// Exposed as a plain function (rather than inlined in the macro) so there is exactly one place
/// that decides what a fatal diagnostic looks like and what happens after it is printed.
pub fn fatal(
    platform: &impl crate::platform::Platform,
    file: &str,
    line: u32,
    message: &core::fmt::Arguments,
) -> ! {
    log::error!("{file}:{line}: {message}");
    platform.halt()
}
