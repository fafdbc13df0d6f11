// Copyright The Coldboot Probe Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Log sinks and the global [`log`] backend.
//!
//! The real target has a single console to write to, so [`init`] installs one concrete
//! [`LogSink`], chosen at compile time between the UEFI console writer (`uefi-platform` feature)
//! and a `std`-backed sink used by host tests.

use crate::debug::DEBUG;
use core::fmt::Arguments;
#[cfg(not(test))]
use core::option_env;
#[cfg(not(test))]
use core::panic::PanicInfo;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Once;

static LOGGER: Once<Logger> = Once::new();

struct Logger {
    sink: LogSinkImpl,
}

impl Log for Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        self.sink
            .write_fmt(format_args!("{}: {}\n", record.level(), record.args()));
    }

    fn flush(&self) {}
}

/// Installs `sink` as the global logger.
pub fn init(sink: LogSinkImpl) -> Result<(), SetLoggerError> {
    let logger = LOGGER.call_once(|| Logger { sink });
    log::set_logger(logger)?;
    log::set_max_level(build_time_log_level());
    Ok(())
}

/// Returns a reference to the installed log sink, if [`init`] has run.
#[allow(unused)]
pub fn get_log_sink() -> Option<&'static LogSinkImpl> {
    LOGGER.get().map(|logger| &logger.sink)
}

/// Reports a panic through the installed sink (if any) and halts the core.
///
/// There is no [`crate::platform::Platform`] to hand to [`crate::debug::fatal`] here, since a
/// panic can happen before one exists; this writes directly to whichever sink [`init`] installed.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    if let Some(sink) = get_log_sink() {
        sink.write_fmt(format_args!("{info}\n"));
    }
    loop {}
}

/// Returns the logging [`LevelFilter`] set by the build-time environment variable `LOG_LEVEL`.
/// Accepted values are the lower-case names of [`LevelFilter`] ("off", "error", "warn", "info",
/// "debug", "trace"). If absent or unrecognised, returns `LevelFilter::Debug` in debug builds
/// ([`DEBUG`]) and `LevelFilter::Info` otherwise.
pub const fn build_time_log_level() -> LevelFilter {
    let level = match option_env!("LOG_LEVEL") {
        Some(level) => level,
        None => "",
    };
    match level.as_bytes() {
        b"off" => LevelFilter::Off,
        b"error" => LevelFilter::Error,
        b"warn" => LevelFilter::Warn,
        b"info" => LevelFilter::Info,
        b"debug" => LevelFilter::Debug,
        b"trace" => LevelFilter::Trace,
        _ => {
            if DEBUG {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            }
        }
    }
}

/// Something log records can be sent to.
///
/// Unlike `core::fmt::Write`, `write_fmt` takes `&self`: implementations own their locking, so a
/// single static sink can be shared across the whole application.
pub trait LogSink {
    /// Writes the given format arguments to the sink.
    fn write_fmt(&self, args: Arguments);
}

#[cfg(all(feature = "uefi-platform", not(test)))]
pub type LogSinkImpl = crate::platform::uefi::ConsoleLogSink;

#[cfg(any(test, not(feature = "uefi-platform")))]
pub type LogSinkImpl = StdLogSink;

/// A [`LogSink`] that writes to the host's standard error, for use under `cfg(test)` and when the
/// `uefi-platform` feature is disabled.
#[cfg(any(test, not(feature = "uefi-platform")))]
pub struct StdLogSink;

#[cfg(any(test, not(feature = "uefi-platform")))]
impl LogSink for StdLogSink {
    fn write_fmt(&self, args: Arguments) {
        extern crate std;
        use std::io::Write as _;
        let _ = write!(std::io::stderr(), "{args}");
    }
}
