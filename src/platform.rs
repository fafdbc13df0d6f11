// Copyright The Coldboot Probe Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! C6: the thin contract facade over firmware services.
//!
//! This is the only module in the crate aware that it is running under UEFI at all. Everything
//! else — the region table, the pattern generator, the phase engine — talks only to [`Platform`],
//! so the same core logic runs unmodified against the real firmware (`platform::uefi`, behind the
//! `uefi-platform` feature) and against an in-memory fake (`platform::fake`) driven by host unit
//! and integration tests.

#[cfg(feature = "uefi-platform")]
pub mod uefi;

#[cfg(any(test, feature = "fakes"))]
pub mod fake;

use crate::error::CoreError;
use crate::memmap::RawMemoryMap;
use bitflags::bitflags;
use uuid::Uuid;

bitflags! {
    /// Mirrors the UEFI `EFI_VARIABLE_*` attribute bits this core relies on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NvAttributes: u32 {
        /// `EFI_VARIABLE_NON_VOLATILE`.
        const NON_VOLATILE = 0x1;
        /// `EFI_VARIABLE_BOOTSERVICE_ACCESS`.
        const BOOT_SERVICE_ACCESS = 0x2;
        /// `EFI_VARIABLE_RUNTIME_ACCESS`.
        const RUNTIME_ACCESS = 0x4;
    }
}

/// Attributes the Persistence Adapter (§4.C5) stores the region table with.
pub const PERSISTED_VARIABLE_ATTRIBUTES: NvAttributes = NvAttributes::NON_VOLATILE
    .union(NvAttributes::BOOT_SERVICE_ACCESS)
    .union(NvAttributes::RUNTIME_ACCESS);

/// Name of the non-volatile variable the region table is persisted under (§6).
pub const PERSISTED_VARIABLE_NAME: &str = "TestedMemoryMap";

/// GUID of the non-volatile variable the region table is persisted under (§6).
pub const PERSISTED_VARIABLE_GUID: Uuid = Uuid::from_bytes([
    0x86, 0x5a, 0x4a, 0x83, 0x19, 0xe9, 0x4f, 0x5b, 0x84, 0x06, 0xbc, 0xa0, 0xdb, 0x86, 0x91, 0x5e,
]);

/// Which way to reset the platform, as chosen by the operator at the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// A warm reset, re-running firmware without removing power.
    Warm,
    /// A full shutdown, for the operator to physically remove power.
    Shutdown,
}

/// Wall-clock time as reported by the firmware real-time clock, used only to derive the CSV
/// result filename (§4.C6, non-core).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    /// Calendar year, e.g. 2026.
    pub year: u16,
    /// Month, 1-12.
    pub month: u8,
    /// Day of month, 1-31.
    pub day: u8,
    /// Hour, 0-23.
    pub hour: u8,
    /// Minute, 0-59.
    pub minute: u8,
}

/// A single SMBIOS Type 17 memory-device record, used only for result labeling (§4.C6,
/// non-core).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DimmRecord {
    /// `DeviceLocator` string, or "unknown".
    pub locator: arrayvec::ArrayString<64>,
    /// `BankLocator` string, or "unknown".
    pub bank_locator: arrayvec::ArrayString<64>,
    /// `PartNumber` string, or "unknown".
    pub part_number: arrayvec::ArrayString<64>,
}

/// A destination the CSV result report can be streamed into (§4.C6, non-core).
pub trait ReportWriter {
    /// Appends `bytes` to the report.
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CoreError>;

    /// Forces any buffered bytes to be written out before the operator is prompted for more
    /// annotations, so a later unexpected reset loses as little of the report as possible.
    fn flush(&mut self) -> Result<(), CoreError>;
}

/// The contract facade through which the core reaches platform (UEFI) services.
///
/// Every method here is either a direct passthrough to a firmware service (memory map, NV
/// variables, console, reset) or a narrow non-core convenience used only by the result-report
/// glue (§4.C6, §10). None of the non-core methods are reachable from the Phase Engine, the
/// Region Table, or the Pattern Generator.
pub trait Platform {
    /// Writer type returned by [`Self::open_result_file`].
    type ResultFile: ReportWriter;

    /// Retrieves the current firmware memory map into `buf`, returning a borrowed view of it.
    ///
    /// Fails with [`CoreError::FirmwareMapUnavailable`] if the underlying service call errors.
    fn get_memory_map<'buf>(&self, buf: &'buf mut [u8]) -> Result<RawMemoryMap<'buf>, CoreError>;

    /// The physical address of (a location inside) this application's own loaded image, used by
    /// the normalizer to exclude the low-memory range firmware is still using.
    fn own_image_base(&self) -> u64;

    /// Reads the non-volatile variable `name`/`guid` into `buf`, returning the number of bytes
    /// written.
    ///
    /// Fails with [`CoreError::NoSavedMap`] if the variable does not exist, or
    /// [`CoreError::NvWriteFailed`] if `buf` is too small or the service otherwise errors.
    fn nv_get(&self, name: &str, guid: Uuid, buf: &mut [u8]) -> Result<usize, CoreError>;

    /// Writes `bytes` to the non-volatile variable `name`/`guid` with the given attributes.
    fn nv_set(
        &self,
        name: &str,
        guid: Uuid,
        attributes: NvAttributes,
        bytes: &[u8],
    ) -> Result<(), CoreError>;

    /// Deletes the non-volatile variable `name`/`guid`.
    ///
    /// Per §6, deletion is encoded as a zero-length write with zero attributes; the default
    /// implementation does exactly that, so platform implementations only need to implement
    /// [`Self::nv_set`].
    fn nv_delete(&self, name: &str, guid: Uuid) -> Result<(), CoreError> {
        self.nv_set(name, guid, NvAttributes::empty(), &[])
    }

    /// Blocks until a key is available from the operator console and returns it.
    fn read_key(&self) -> char;

    /// Echoes a single character to the operator console while [`Self::read_line`] assembles a
    /// line (non-core).
    ///
    /// The default no-op suits platforms (such as the fake) that drive input programmatically and
    /// have no console for a human to read an echo from.
    fn echo(&self, _ch: char) {}

    /// Reads one line of operator input for the result-report prompts (§4.C6, §10).
    ///
    /// Calls [`Self::read_key`] in a loop, echoing each accepted character via [`Self::echo`],
    /// until Enter is pressed or `max_len` characters (clamped to the line's 96-character
    /// capacity) have been accepted. Backspace (`\u{8}` or DEL) removes the last accepted
    /// character and erases it from the echo.
    fn read_line(&self, max_len: usize) -> arrayvec::ArrayString<96> {
        let max_len = max_len.min(96);
        let mut line = arrayvec::ArrayString::<96>::new();
        let mut count = 0usize;
        loop {
            match self.read_key() {
                '\r' | '\n' => break,
                '\u{8}' | '\u{7f}' => {
                    if line.pop().is_some() {
                        count -= 1;
                        self.echo('\u{8}');
                        self.echo(' ');
                        self.echo('\u{8}');
                    }
                }
                ch if !ch.is_control() => {
                    if count < max_len && line.try_push(ch).is_ok() {
                        count += 1;
                        self.echo(ch);
                    }
                }
                _ => {}
            }
        }
        line
    }

    /// Disables the platform watchdog, which must happen before any long-running phase.
    ///
    /// A failure here is logged and propagated, not fatal (§7): the phase can still complete
    /// correctly, just with a risk the watchdog fires mid-phase on a misconfigured platform.
    fn disable_watchdog(&self) -> Result<(), CoreError>;

    /// Globally flushes all CPU caches to DRAM, so the values written by the Write phase (or read
    /// fresh by Compare) cannot be served from cache across the operator-induced power cycle.
    fn writeback_invalidate_caches(&self);

    /// Writes `words` as consecutive 64-bit little-endian values starting at physical address
    /// `addr`.
    ///
    /// `addr` always lies inside a region the normalizer (§4.C3) judged to be conventional RAM
    /// outside this application's own image, so on real firmware this is a direct volatile store;
    /// the fake platform backs it with ordinary heap memory instead.
    fn write_words(&self, addr: u64, words: &[u64]);

    /// Reads the 64-bit little-endian value at physical address `addr`. See [`Self::write_words`].
    fn read_word(&self, addr: u64) -> u64;

    /// Resets or shuts down the platform. Diverges.
    fn reset(&self, kind: ResetKind) -> !;

    /// Halts the core after a fatal diagnostic has been printed (see [`crate::require`]).
    ///
    /// Diverges on real firmware (an interrupt-disabled spin loop); panics in the fake platform so
    /// host tests can observe the failure.
    fn halt(&self) -> !;

    /// Current wall-clock time, used only to derive the CSV result filename (non-core).
    fn now(&self) -> Timestamp;

    /// Opens (creating if necessary) a file named `name` on the boot volume for the CSV result
    /// report (non-core).
    fn open_result_file(&self, name: &str) -> Result<Self::ResultFile, CoreError>;

    /// The platform product name from SMBIOS, or "unknown" (non-core).
    fn product_name(&self) -> arrayvec::ArrayString<64>;

    /// The populated and unpopulated DIMM slots described by SMBIOS Type 17 (non-core).
    fn dimm_inventory(&self) -> arrayvec::ArrayVec<DimmRecord, 32>;
}
