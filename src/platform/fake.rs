// Copyright The Coldboot Probe Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! An in-memory [`Platform`] used by host unit and integration tests.
//!
//! Backed entirely by `std` collections behind a [`SpinMutex`] so the same `&FakePlatform` can be
//! shared by value across calls the way a real UEFI system table reference is. Physical memory is
//! modelled as a sparse page map rather than one giant buffer, since tests only ever touch a
//! handful of regions.

extern crate std;

use crate::error::CoreError;
use crate::memmap::{EXPECTED_DESCRIPTOR_VERSION, MemoryDescriptor, RawMemoryMap};
use crate::platform::{DimmRecord, NvAttributes, Platform, ReportWriter, ResetKind, Timestamp};
use crate::region::PAGE_SIZE;
use spin::mutex::SpinMutex;
use std::collections::HashMap;
use std::vec::Vec;
use uuid::Uuid;
use zerocopy::IntoBytes;

/// A region of fake conventional RAM, as handed to [`FakePlatform::with_regions`].
pub type FakeRegion = (u64, u64);

struct FakeState {
    pages: HashMap<u64, [u8; PAGE_SIZE as usize]>,
    nv_vars: HashMap<(std::string::String, Uuid), (NvAttributes, Vec<u8>)>,
    keys: Vec<char>,
    reset_requested: Option<ResetKind>,
    watchdog_disabled: bool,
    cache_flushes: u32,
    result_files: HashMap<std::string::String, Vec<u8>>,
}

/// An in-memory stand-in for real UEFI firmware services (§10).
pub struct FakePlatform {
    regions: Vec<FakeRegion>,
    own_image_base: u64,
    state: SpinMutex<FakeState>,
}

impl FakePlatform {
    /// Creates a platform whose fake memory map reports exactly `regions` as conventional memory,
    /// each lazily zero-filled on first touch.
    pub fn with_regions(regions: &[FakeRegion]) -> Self {
        Self {
            regions: regions.to_vec(),
            own_image_base: 0,
            state: SpinMutex::new(FakeState {
                pages: HashMap::new(),
                nv_vars: HashMap::new(),
                keys: Vec::new(),
                reset_requested: None,
                watchdog_disabled: false,
                cache_flushes: 0,
                result_files: HashMap::new(),
            }),
        }
    }

    /// Queues `key` to be returned by the next call to [`Platform::read_key`].
    pub fn push_key(&self, key: char) {
        self.state.lock().keys.push(key);
    }

    /// Queues `line`'s characters followed by Enter, for a subsequent [`Platform::read_line`] call.
    pub fn push_line(&self, line: &str) {
        let mut state = self.state.lock();
        state.keys.extend(line.chars());
        state.keys.push('\n');
    }

    /// Flips bit `bit` (0-63) of the 64-bit word at `addr`, simulating an observed decay.
    pub fn flip_bit(&self, addr: u64, bit: u32) {
        let mut state = self.state.lock();
        let page_addr = addr & !(PAGE_SIZE - 1);
        let offset = (addr - page_addr) as usize;
        let page = state
            .pages
            .entry(page_addr)
            .or_insert_with(|| [0u8; PAGE_SIZE as usize]);
        let mut word = u64::from_le_bytes(page[offset..offset + 8].try_into().unwrap());
        word ^= 1 << bit;
        page[offset..offset + 8].copy_from_slice(&word.to_le_bytes());
    }

    /// Whether [`Platform::reset`] has been called, and with which [`ResetKind`].
    pub fn reset_requested(&self) -> Option<ResetKind> {
        self.state.lock().reset_requested
    }

    /// Number of times [`Platform::writeback_invalidate_caches`] has been called.
    pub fn cache_flush_count(&self) -> u32 {
        self.state.lock().cache_flushes
    }

    /// Contents written to the named result file, if one was opened.
    pub fn result_file_contents(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().result_files.get(name).cloned()
    }
}

/// An in-memory [`ReportWriter`] that appends straight into the owning [`FakePlatform`]'s state.
pub struct FakeResultFile {
    name: std::string::String,
    state: *const SpinMutex<FakeState>,
}

// SAFETY: `FakeResultFile` only ever outlives the `FakePlatform` it borrowed from in tests, which
// are single-threaded; the raw pointer exists only to avoid a lifetime parameter on
// `Platform::ResultFile`, which the trait does not allow.
unsafe impl Send for FakeResultFile {}

impl ReportWriter for FakeResultFile {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CoreError> {
        // SAFETY: see the struct-level comment.
        let state = unsafe { &*self.state };
        state
            .lock()
            .result_files
            .entry(self.name.clone())
            .or_default()
            .extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CoreError> {
        Ok(())
    }
}

impl Platform for FakePlatform {
    type ResultFile = FakeResultFile;

    fn get_memory_map<'buf>(&self, buf: &'buf mut [u8]) -> Result<RawMemoryMap<'buf>, CoreError> {
        let stride = size_of::<MemoryDescriptor>();
        let needed = stride * self.regions.len();
        if buf.len() < needed {
            return Err(CoreError::FirmwareMapUnavailable);
        }
        for (i, &(base, pages)) in self.regions.iter().enumerate() {
            let descriptor = conventional_descriptor(base, pages);
            buf[i * stride..i * stride + stride].copy_from_slice(descriptor.as_bytes());
        }
        Ok(RawMemoryMap {
            descriptors: &buf[..needed],
            descriptor_stride: stride,
            version: EXPECTED_DESCRIPTOR_VERSION,
        })
    }

    fn own_image_base(&self) -> u64 {
        self.own_image_base
    }

    fn nv_get(&self, name: &str, guid: Uuid, buf: &mut [u8]) -> Result<usize, CoreError> {
        let state = self.state.lock();
        let (_, bytes) = state
            .nv_vars
            .get(&(name.into(), guid))
            .ok_or(CoreError::NoSavedMap)?;
        if buf.len() < bytes.len() {
            return Err(CoreError::NvWriteFailed);
        }
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }

    fn nv_set(
        &self,
        name: &str,
        guid: Uuid,
        attributes: NvAttributes,
        bytes: &[u8],
    ) -> Result<(), CoreError> {
        let mut state = self.state.lock();
        if attributes.is_empty() {
            state.nv_vars.remove(&(name.into(), guid));
        } else {
            state
                .nv_vars
                .insert((name.into(), guid), (attributes, bytes.to_vec()));
        }
        Ok(())
    }

    fn read_key(&self) -> char {
        let mut state = self.state.lock();
        if state.keys.is_empty() {
            panic!("FakePlatform::read_key called with no queued keys");
        }
        state.keys.remove(0)
    }

    fn disable_watchdog(&self) -> Result<(), CoreError> {
        self.state.lock().watchdog_disabled = true;
        Ok(())
    }

    fn writeback_invalidate_caches(&self) {
        self.state.lock().cache_flushes += 1;
    }

    fn write_words(&self, addr: u64, words: &[u64]) {
        let mut state = self.state.lock();
        for (i, word) in words.iter().enumerate() {
            let word_addr = addr + (i as u64) * size_of::<u64>() as u64;
            let page_addr = word_addr & !(PAGE_SIZE - 1);
            let offset = (word_addr - page_addr) as usize;
            let page = state
                .pages
                .entry(page_addr)
                .or_insert_with(|| [0u8; PAGE_SIZE as usize]);
            page[offset..offset + 8].copy_from_slice(&word.to_le_bytes());
        }
    }

    fn read_word(&self, addr: u64) -> u64 {
        let mut state = self.state.lock();
        let page_addr = addr & !(PAGE_SIZE - 1);
        let offset = (addr - page_addr) as usize;
        let page = state
            .pages
            .entry(page_addr)
            .or_insert_with(|| [0u8; PAGE_SIZE as usize]);
        u64::from_le_bytes(page[offset..offset + 8].try_into().unwrap())
    }

    fn reset(&self, kind: ResetKind) -> ! {
        self.state.lock().reset_requested = Some(kind);
        panic!("FakePlatform::reset({kind:?})");
    }

    fn halt(&self) -> ! {
        panic!("FakePlatform::halt called: a fatal diagnostic fired");
    }

    fn now(&self) -> Timestamp {
        Timestamp {
            year: 2026,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
        }
    }

    fn open_result_file(&self, name: &str) -> Result<Self::ResultFile, CoreError> {
        Ok(FakeResultFile {
            name: name.into(),
            state: &self.state as *const SpinMutex<FakeState>,
        })
    }

    fn product_name(&self) -> arrayvec::ArrayString<64> {
        arrayvec::ArrayString::from("Fake Platform").unwrap()
    }

    fn dimm_inventory(&self) -> arrayvec::ArrayVec<DimmRecord, 32> {
        arrayvec::ArrayVec::new()
    }
}

fn conventional_descriptor(base: u64, pages: u64) -> MemoryDescriptor {
    MemoryDescriptor::conventional(base, pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::MIN_REGION_PAGES;

    #[test]
    fn memory_map_reports_configured_regions() {
        let platform = FakePlatform::with_regions(&[(0x1_0000_0000, MIN_REGION_PAGES)]);
        let mut buf = [0u8; 4096];
        let map = platform.get_memory_map(&mut buf).unwrap();
        assert_eq!(map.descriptors.len() / map.descriptor_stride, 1);
    }

    #[test]
    fn write_then_read_round_trips() {
        let platform = FakePlatform::with_regions(&[(0x1_0000_0000, MIN_REGION_PAGES)]);
        platform.write_words(0x1_0000_0000, &[0x1122_3344_5566_7788]);
        assert_eq!(platform.read_word(0x1_0000_0000), 0x1122_3344_5566_7788);
    }

    #[test]
    fn nv_round_trips() {
        let platform = FakePlatform::with_regions(&[]);
        let guid = Uuid::nil();
        platform
            .nv_set("x", guid, NvAttributes::NON_VOLATILE, &[1, 2, 3])
            .unwrap();
        let mut buf = [0u8; 8];
        let len = platform.nv_get("x", guid, &mut buf).unwrap();
        assert_eq!(&buf[..len], &[1, 2, 3]);
    }

    #[test]
    fn nv_delete_makes_get_fail() {
        let platform = FakePlatform::with_regions(&[]);
        let guid = Uuid::nil();
        platform
            .nv_set("x", guid, NvAttributes::NON_VOLATILE, &[1])
            .unwrap();
        platform.nv_delete("x", guid).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(
            platform.nv_get("x", guid, &mut buf),
            Err(CoreError::NoSavedMap)
        );
    }

    #[test]
    #[should_panic(expected = "halt")]
    fn halt_panics() {
        let platform = FakePlatform::with_regions(&[]);
        platform.halt();
    }

    #[test]
    fn read_key_returns_queued_keys_in_order() {
        let platform = FakePlatform::with_regions(&[]);
        platform.push_key('w');
        platform.push_key('r');
        assert_eq!(platform.read_key(), 'w');
        assert_eq!(platform.read_key(), 'r');
    }

    #[test]
    fn result_file_accumulates_writes() {
        let platform = FakePlatform::with_regions(&[]);
        let mut file = platform.open_result_file("report.csv").unwrap();
        file.write_bytes(b"a,b,c\n").unwrap();
        file.write_bytes(b"1,2,3\n").unwrap();
        file.flush().unwrap();
        assert_eq!(
            platform.result_file_contents("report.csv").unwrap(),
            b"a,b,c\n1,2,3\n"
        );
    }
}
