// Copyright The Coldboot Probe Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The real [`Platform`] backend, talking to actual UEFI boot and runtime services.
//!
//! This is the only module in the crate that knows the shape of `EFI_MEMORY_DESCRIPTOR`,
//! `EFI_VARIABLE_*`, or any other UEFI wire detail beyond what [`crate::memmap`] and
//! [`crate::platform`] already declare; it exists to translate between those and the `uefi` crate.

use crate::error::CoreError;
use crate::logger::LogSink;
use crate::memmap::{EXPECTED_DESCRIPTOR_VERSION, MemoryDescriptor};
use crate::memmap::RawMemoryMap;
use crate::platform::{DimmRecord, NvAttributes, Platform, ReportWriter, ResetKind, Timestamp};
use core::fmt::Arguments;
use spin::mutex::SpinMutex;
use uefi::prelude::BootServices;
use uefi::proto::loaded_image::LoadedImage;
use uefi::proto::media::file::{File, FileAttribute, FileMode, RegularFile};
use uefi::table::boot::{MemoryType, ResetType};
use uefi::table::runtime::{VariableAttributes, VariableVendor};
use uefi::table::{Boot, Runtime, SystemTable};
use uefi::{CStr16, Guid, Handle};
use uuid::Uuid;
use zerocopy::IntoBytes;

/// Scratch buffer size for the raw UEFI memory map query; generously over what a typical 200-entry
/// map needs, since the firmware is free to hand back a larger one.
const MEMORY_MAP_SCRATCH_BYTES: usize = 16 * 1024;

/// Converts a [`Uuid`] into the `uefi` crate's own GUID type; both are the 128-bit
/// `EFI_GUID` layout, just with different wrapper types.
fn to_uefi_guid(guid: Uuid) -> Guid {
    let (a, b, c, d) = guid.as_fields();
    Guid::from_values(a, b, c, *d)
}

/// Writes UTF-16 into a fixed `[u16; N]` buffer null-terminated for `CStr16`, since several `uefi`
/// calls (NV variable names, file names) borrow a string as `&CStr16` rather than owning one.
fn with_cstr16<R>(text: &str, f: impl FnOnce(&CStr16) -> R) -> R {
    let mut buf = [0u16; 64];
    let cstr = CStr16::from_str_with_buf(text, &mut buf).expect("string too long for CStr16 buffer");
    f(cstr)
}

/// Backs [`crate::platform::Platform`] with a real `SystemTable<Boot>`.
///
/// Boot services (the memory map and the loaded-image protocol) are only queried while still in
/// boot services; the region table operations the core performs afterwards need neither.
pub struct UefiPlatform {
    system_table: SpinMutex<SystemTable<Boot>>,
    image_handle: Handle,
    image_base: u64,
}

impl UefiPlatform {
    /// Creates a platform wrapping `system_table`, caching the loaded image's base address up
    /// front while boot services are still available.
    pub fn new(image_handle: Handle, system_table: SystemTable<Boot>) -> Self {
        let image_base = {
            let boot_services = system_table.boot_services();
            boot_services
                .open_protocol_exclusive::<LoadedImage>(image_handle)
                .ok()
                .and_then(|loaded_image| {
                    let (base, _size) = loaded_image.info();
                    Some(base as u64)
                })
                .unwrap_or(0)
        };
        Self {
            system_table: SpinMutex::new(system_table),
            image_handle,
            image_base,
        }
    }

    fn runtime_services(&self) -> *const uefi::table::runtime::RuntimeServices {
        // SAFETY: runtime services remain valid for the lifetime of the application; the pointer
        // is only ever dereferenced for the duration of a single call below.
        unsafe { self.system_table.lock().runtime_services() as *const _ }
    }

    fn with_boot_services<R>(&self, f: impl FnOnce(&BootServices) -> R) -> R {
        f(self.system_table.lock().boot_services())
    }

    fn with_stdin<R>(&self, f: impl FnOnce(&mut uefi::proto::console::text::Input) -> R) -> R {
        f(self.system_table.lock().stdin())
    }

    /// Returns a [`LogSink`] writing to this platform's console, for [`crate::logger::init`].
    ///
    /// Borrows `self.system_table` through a raw pointer rather than a reference so the sink has
    /// no lifetime tied to `&self`, since the global logger it is installed into is `'static`.
    pub fn log_sink(&self) -> ConsoleLogSink {
        ConsoleLogSink {
            system_table: &self.system_table as *const SpinMutex<SystemTable<Boot>>,
        }
    }
}

impl Platform for UefiPlatform {
    type ResultFile = UefiResultFile;

    fn get_memory_map<'buf>(&self, buf: &'buf mut [u8]) -> Result<RawMemoryMap<'buf>, CoreError> {
        let stride = size_of::<MemoryDescriptor>();
        // Scratch space for the firmware-native descriptor iterator; sized generously over the
        // reported map size since a pool allocation in between the size query and the map query
        // could grow it.
        let mut scratch = [0u8; MEMORY_MAP_SCRATCH_BYTES];
        let descriptor_count = self.with_boot_services(|boot_services| {
            let (_key, iter) = boot_services
                .memory_map(&mut scratch)
                .map_err(|_| CoreError::FirmwareMapUnavailable)?;
            let mut count = 0;
            for descriptor in iter {
                if descriptor.ty != MemoryType::CONVENTIONAL {
                    continue;
                }
                if count * stride + stride > buf.len() {
                    return Err(CoreError::MapOverflow);
                }
                let mirrored =
                    MemoryDescriptor::conventional(descriptor.phys_start, descriptor.page_count);
                buf[count * stride..count * stride + stride].copy_from_slice(mirrored.as_bytes());
                count += 1;
            }
            Ok(count)
        })?;

        Ok(RawMemoryMap {
            descriptors: &buf[..descriptor_count * stride],
            descriptor_stride: stride,
            version: EXPECTED_DESCRIPTOR_VERSION,
        })
    }

    fn own_image_base(&self) -> u64 {
        self.image_base
    }

    fn nv_get(&self, name: &str, guid: Uuid, buf: &mut [u8]) -> Result<usize, CoreError> {
        let vendor = VariableVendor(to_uefi_guid(guid));
        // SAFETY: `runtime_services` returns a pointer valid for the call duration, as described
        // on the function.
        let runtime_services = unsafe { &*self.runtime_services() };
        with_cstr16(name, |cstr| {
            runtime_services
                .get_variable(cstr, &vendor, buf)
                .map(|(size, _attributes)| size)
                .map_err(|_| CoreError::NoSavedMap)
        })
    }

    fn nv_set(
        &self,
        name: &str,
        guid: Uuid,
        attributes: NvAttributes,
        bytes: &[u8],
    ) -> Result<(), CoreError> {
        let vendor = VariableVendor(to_uefi_guid(guid));
        let mut flags = VariableAttributes::empty();
        if attributes.contains(NvAttributes::NON_VOLATILE) {
            flags |= VariableAttributes::NON_VOLATILE;
        }
        if attributes.contains(NvAttributes::BOOT_SERVICE_ACCESS) {
            flags |= VariableAttributes::BOOTSERVICE_ACCESS;
        }
        if attributes.contains(NvAttributes::RUNTIME_ACCESS) {
            flags |= VariableAttributes::RUNTIME_ACCESS;
        }
        // SAFETY: see `nv_get`.
        let runtime_services = unsafe { &*self.runtime_services() };
        with_cstr16(name, |cstr| {
            runtime_services
                .set_variable(cstr, &vendor, flags, bytes)
                .map_err(|_| CoreError::NvWriteFailed)
        })
    }

    fn read_key(&self) -> char {
        loop {
            if let Ok(Some(key)) = self.with_stdin(|stdin| stdin.read_key()) {
                if let uefi::proto::console::text::Key::Printable(ch) = key {
                    return char::from(ch);
                }
            }
        }
    }

    fn echo(&self, ch: char) {
        use core::fmt::Write;
        let _ = self.system_table.lock().stdout().write_char(ch);
    }

    fn disable_watchdog(&self) -> Result<(), CoreError> {
        self.with_boot_services(|boot_services| {
            boot_services
                .set_watchdog_timer(0, 0x10000, None)
                .map_err(|_| CoreError::FirmwareMapUnavailable)
        })
    }

    fn writeback_invalidate_caches(&self) {
        // SAFETY: WBINVD takes no arguments and has no memory-safety preconditions beyond
        // requiring CPL0, which this application always runs at under UEFI.
        unsafe {
            core::arch::asm!("wbinvd", options(nostack, nomem));
        }
    }

    fn write_words(&self, addr: u64, words: &[u64]) {
        for (i, word) in words.iter().enumerate() {
            let ptr = (addr + (i as u64) * size_of::<u64>() as u64) as *mut u64;
            // SAFETY: `addr` lies inside a region the normalizer restricted to conventional RAM
            // outside this application's own image; the core holds exclusive access to that
            // memory for the duration of the phase.
            unsafe {
                ptr.write_volatile(*word);
            }
        }
    }

    fn read_word(&self, addr: u64) -> u64 {
        // SAFETY: see `write_words`.
        unsafe { (addr as *const u64).read_volatile() }
    }

    fn reset(&self, kind: ResetKind) -> ! {
        let reset_type = match kind {
            ResetKind::Warm => ResetType::WARM,
            ResetKind::Shutdown => ResetType::SHUTDOWN,
        };
        // SAFETY: runtime services remain valid for the lifetime of the application.
        let runtime_services = unsafe { &*self.runtime_services() };
        runtime_services.reset(reset_type, uefi::Status::SUCCESS, None)
    }

    fn halt(&self) -> ! {
        loop {
            // SAFETY: WFI has no preconditions; it simply idles the core until the next
            // interrupt, which never arrives once boot services have been exited.
            unsafe {
                core::arch::asm!("hlt", options(nostack, nomem));
            }
        }
    }

    fn now(&self) -> Timestamp {
        // SAFETY: see `nv_get`.
        let runtime_services = unsafe { &*self.runtime_services() };
        match runtime_services.get_time() {
            Ok(time) => Timestamp {
                year: time.year(),
                month: time.month(),
                day: time.day(),
                hour: time.hour(),
                minute: time.minute(),
            },
            Err(_) => Timestamp {
                year: 2000,
                month: 1,
                day: 1,
                hour: 0,
                minute: 0,
            },
        }
    }

    fn open_result_file(&self, name: &str) -> Result<Self::ResultFile, CoreError> {
        self.with_boot_services(|boot_services| {
            let mut file_system = boot_services
                .get_image_file_system(self.image_handle)
                .map_err(|_| CoreError::NvWriteFailed)?;
            let mut root = file_system
                .open_volume()
                .map_err(|_| CoreError::NvWriteFailed)?;
            let file_handle = with_cstr16(name, |cstr| {
                root.open(cstr, FileMode::CreateReadWrite, FileAttribute::empty())
            })
            .map_err(|_| CoreError::NvWriteFailed)?;
            let file = file_handle
                .into_regular_file()
                .ok_or(CoreError::NvWriteFailed)?;
            Ok(UefiResultFile { file })
        })
    }

    fn product_name(&self) -> arrayvec::ArrayString<64> {
        let system_table = self.system_table.lock();
        smbios::table(&system_table)
            .and_then(smbios::product_name)
            .unwrap_or_else(|| arrayvec::ArrayString::from("unknown").unwrap())
    }

    fn dimm_inventory(&self) -> arrayvec::ArrayVec<DimmRecord, 32> {
        let system_table = self.system_table.lock();
        match smbios::table(&system_table) {
            Some(table) => smbios::dimm_inventory(table),
            None => arrayvec::ArrayVec::new(),
        }
    }
}

/// A [`crate::logger::LogSink`] that writes to the UEFI console, borrowing the owning
/// [`UefiPlatform`]'s system table. Constructed via [`UefiPlatform::log_sink`].
pub struct ConsoleLogSink {
    system_table: *const SpinMutex<SystemTable<Boot>>,
}

// SAFETY: `UefiPlatform` is never dropped before the application halts or resets, so the pointer
// stays valid for as long as the global logger that owns this sink does.
unsafe impl Send for ConsoleLogSink {}
unsafe impl Sync for ConsoleLogSink {}

impl LogSink for ConsoleLogSink {
    fn write_fmt(&self, args: Arguments) {
        use core::fmt::Write;
        // SAFETY: see the struct-level comment.
        let system_table = unsafe { &*self.system_table };
        let _ = system_table.lock().stdout().write_fmt(args);
    }
}

/// A [`ReportWriter`] backed by a UEFI Simple File System file handle, opened on the boot volume
/// via [`UefiPlatform::open_result_file`].
pub struct UefiResultFile {
    file: RegularFile,
}

impl ReportWriter for UefiResultFile {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CoreError> {
        self.file.write(bytes).map_err(|_| CoreError::NvWriteFailed)
    }

    fn flush(&mut self) -> Result<(), CoreError> {
        self.file.flush().map_err(|_| CoreError::NvWriteFailed)
    }
}

/// Reads the platform product name and DIMM inventory from the firmware's SMBIOS 3.x table
/// (§4.C6, §10, non-core), mirroring `app.c`'s `GetProductName`/`StoreDimmsInfo`.
mod smbios {
    use crate::platform::DimmRecord;
    use uefi::table::{Boot, SystemTable};

    /// Byte offset of `TableMaximumSize` (u32) in the 64-bit SMBIOS 3.x entry point structure.
    const TABLE_MAX_SIZE_OFFSET: usize = 12;
    /// Byte offset of `TableAddress` (u64) in the 64-bit SMBIOS 3.x entry point structure.
    const TABLE_ADDRESS_OFFSET: usize = 16;

    /// SMBIOS structure type for System Information (carries the product name string).
    const TYPE_SYSTEM_INFORMATION: u8 = 1;
    /// SMBIOS structure type for Memory Device (one per DIMM slot, populated or not).
    const TYPE_MEMORY_DEVICE: u8 = 17;

    /// Byte offset of the `ProductName` string index within a Type 1 structure.
    const TYPE1_PRODUCT_NAME_OFFSET: u64 = 5;
    /// Byte offsets of the `DeviceLocator`/`BankLocator`/`PartNumber` string indices within a
    /// Type 17 structure (SMBIOS 2.3 layout, matching `app.c`'s `SMBIOS_TYPE17`).
    const TYPE17_DEVICE_LOCATOR_OFFSET: u64 = 16;
    const TYPE17_BANK_LOCATOR_OFFSET: u64 = 17;
    const TYPE17_PART_NUMBER_OFFSET: u64 = 26;

    /// The address span `[start, end)` of the firmware's SMBIOS structure table.
    #[derive(Clone, Copy)]
    pub struct Table {
        start: u64,
        end: u64,
    }

    /// Locates the SMBIOS 3.x entry point via the system configuration table, if the firmware
    /// published one. Returns `None` for firmware that only publishes the legacy 32-bit anchor.
    pub fn table(system_table: &SystemTable<Boot>) -> Option<Table> {
        let entry = system_table
            .config_table()
            .iter()
            .find(|entry| entry.guid == uefi::table::cfg::SMBIOS3_GUID)?;
        let base = entry.address as *const u8;
        // SAFETY: the firmware publishes this entry point structure mapped and valid for the
        // lifetime of the application; these are plain reads of fixed-offset fields.
        unsafe {
            let table_max_size =
                u32::from_ne_bytes(*base.add(TABLE_MAX_SIZE_OFFSET).cast::<[u8; 4]>());
            let table_address =
                u64::from_ne_bytes(*base.add(TABLE_ADDRESS_OFFSET).cast::<[u8; 8]>());
            Some(Table {
                start: table_address,
                end: table_address + table_max_size as u64,
            })
        }
    }

    /// Byte at `table`-relative address `addr`.
    ///
    /// SAFETY: `addr` must be known to lie within `[table.start, table.end)`.
    unsafe fn read_u8(addr: u64) -> u8 {
        unsafe { *(addr as *const u8) }
    }

    /// Advances past the structure starting at `header_addr` to the next structure's address,
    /// mirroring `app.c`'s `GetNextSmbiosStruct`: skip the formatted area, then the trailing
    /// string table up to its double-NUL terminator.
    fn next_struct(table: Table, header_addr: u64) -> Option<u64> {
        // SAFETY: header_addr + 1 lies within the table by the iterator's own invariant.
        let length = unsafe { read_u8(header_addr + 1) } as u64;
        let mut ptr = header_addr + length;
        if ptr + 1 >= table.end {
            return None;
        }
        // SAFETY: ptr stays below table.end by the loop condition.
        unsafe {
            while ptr + 1 < table.end && !(read_u8(ptr) == 0 && read_u8(ptr + 1) == 0) {
                ptr += 1;
            }
        }
        ptr += 2;
        if ptr >= table.end { None } else { Some(ptr) }
    }

    /// Iterates the addresses of every structure header in `table`, in table order.
    fn struct_addresses(table: Table) -> impl Iterator<Item = u64> {
        let mut next = Some(table.start);
        core::iter::from_fn(move || {
            let current = next?;
            next = next_struct(table, current);
            Some(current)
        })
    }

    /// Reads the `index`-th (1-based) string from the string table trailing the structure at
    /// `header_addr` (whose formatted area is `formatted_length` bytes), mirroring `app.c`'s
    /// `LibGetSmbiosString`. Returns `None` for index 0 (no string) or an index past the last one.
    fn smbios_string(
        header_addr: u64,
        formatted_length: u8,
        index: u8,
    ) -> Option<arrayvec::ArrayString<64>> {
        if index == 0 {
            return None;
        }
        let mut ptr = header_addr + formatted_length as u64;
        for _ in 1..index {
            // SAFETY: ptr is advanced one string at a time through the structure's own
            // double-NUL-terminated string table.
            unsafe {
                while read_u8(ptr) != 0 {
                    ptr += 1;
                }
                ptr += 1;
                if read_u8(ptr) == 0 {
                    return None;
                }
            }
        }
        let start = ptr;
        let mut len = 0usize;
        // SAFETY: see above.
        while len < 64 && unsafe { read_u8(start + len as u64) } != 0 {
            len += 1;
        }
        // SAFETY: [start, start + len) were all read individually above and are non-NUL.
        let bytes = unsafe { core::slice::from_raw_parts(start as *const u8, len) };
        let text = core::str::from_utf8(bytes).ok()?;
        arrayvec::ArrayString::from(text).ok()
    }

    /// The platform product name from the Type 1 (System Information) structure, if present.
    pub fn product_name(table: Table) -> Option<arrayvec::ArrayString<64>> {
        for header_addr in struct_addresses(table) {
            // SAFETY: header_addr is a valid structure start within table.
            let (smbios_type, length) =
                unsafe { (read_u8(header_addr), read_u8(header_addr + 1)) };
            if smbios_type != TYPE_SYSTEM_INFORMATION {
                continue;
            }
            // SAFETY: TYPE1_PRODUCT_NAME_OFFSET lies within a conformant Type 1 structure.
            let index = unsafe { read_u8(header_addr + TYPE1_PRODUCT_NAME_OFFSET) };
            return smbios_string(header_addr, length, index);
        }
        None
    }

    /// Every Type 17 (Memory Device) structure's locator and part number, one per DIMM slot
    /// regardless of whether it is populated, as `app.c`'s `StoreDimmsInfo` also reports.
    pub fn dimm_inventory(table: Table) -> arrayvec::ArrayVec<DimmRecord, 32> {
        let mut records = arrayvec::ArrayVec::new();
        let unknown = || arrayvec::ArrayString::from("unknown").unwrap();
        for header_addr in struct_addresses(table) {
            if records.is_full() {
                break;
            }
            // SAFETY: header_addr is a valid structure start within table.
            let (smbios_type, length) =
                unsafe { (read_u8(header_addr), read_u8(header_addr + 1)) };
            if smbios_type != TYPE_MEMORY_DEVICE {
                continue;
            }
            // SAFETY: these offsets lie within a conformant (SMBIOS 2.3+) Type 17 structure.
            let (device_locator, bank_locator, part_number) = unsafe {
                (
                    read_u8(header_addr + TYPE17_DEVICE_LOCATOR_OFFSET),
                    read_u8(header_addr + TYPE17_BANK_LOCATOR_OFFSET),
                    read_u8(header_addr + TYPE17_PART_NUMBER_OFFSET),
                )
            };
            records.push(DimmRecord {
                locator: smbios_string(header_addr, length, device_locator)
                    .unwrap_or_else(unknown),
                bank_locator: smbios_string(header_addr, length, bank_locator)
                    .unwrap_or_else(unknown),
                part_number: smbios_string(header_addr, length, part_number)
                    .unwrap_or_else(unknown),
            });
        }
        records
    }
}
