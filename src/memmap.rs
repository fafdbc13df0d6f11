// Copyright The Coldboot Probe Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! C3: normalizes a firmware-reported UEFI memory map into a stable [`RegionTable`].
//!
//! The firmware memory map is re-queried on every boot and is not guaranteed to report the same
//! layout twice, down to spurious reshuffling of small regions. This module filters it down to the
//! large, conventional-memory regions that are stable enough to retarget by physical address
//! across a reboot, and rounds each surviving region to the 16 MiB grid the rest of the core
//! assumes (§4.C3).

use crate::error::CoreError;
use crate::region::{MIN_REGION_PAGES, PAGE_SIZE, REGION_ALIGNMENT, Region, RegionTable};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// `EfiConventionalMemory`, the only memory type this core treats as candidate RAM.
const CONVENTIONAL_MEMORY_TYPE: u32 = 7;

/// `EFI_MEMORY_DESCRIPTOR_VERSION`, the only descriptor version this core understands.
pub const EXPECTED_DESCRIPTOR_VERSION: u32 = 1;

/// Regions below this physical address are where firmware itself tends to operate; edk2 in
/// particular is unpredictable there across boots.
const LOW_MEMORY_CEILING: u64 = 0x1_0000_0000;

/// Maximum number of descriptors the firmware memory-map buffer is sized for.
pub const MAX_DESCRIPTORS: usize = 200;

/// Layout-compatible mirror of `EFI_MEMORY_DESCRIPTOR`.
///
/// `Type` is a 32-bit field but the structure is naturally aligned to 8 bytes, so there are 4
/// bytes of padding between `memory_type` and `physical_start` that must be accounted for
/// explicitly to get a correct `size_of`. The firmware-reported descriptor *stride* can still
/// exceed `size_of::<MemoryDescriptor>()`; callers must iterate using the reported stride, never
/// this type's size (§4.C3).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MemoryDescriptor {
    memory_type: u32,
    _padding: u32,
    physical_start: u64,
    virtual_start: u64,
    number_of_pages: u64,
    attribute: u64,
}

impl MemoryDescriptor {
    fn is_conventional(&self) -> bool {
        self.memory_type == CONVENTIONAL_MEMORY_TYPE
    }

    /// Builds a descriptor reporting `pages` pages of conventional memory at `physical_start`, for
    /// use by the fake platform's synthetic memory map.
    pub(crate) fn conventional(physical_start: u64, number_of_pages: u64) -> Self {
        Self {
            memory_type: CONVENTIONAL_MEMORY_TYPE,
            _padding: 0,
            physical_start,
            virtual_start: 0,
            number_of_pages,
            attribute: 0,
        }
    }
}

/// Raw memory map as returned by [`crate::platform::Platform::get_memory_map`].
pub struct RawMemoryMap<'a> {
    /// Concatenated descriptors, each `descriptor_stride` bytes apart.
    pub descriptors: &'a [u8],
    /// Byte distance between the start of consecutive descriptors; may exceed
    /// `size_of::<MemoryDescriptor>()` due to firmware-added padding.
    pub descriptor_stride: usize,
    /// Descriptor format version reported by the firmware.
    pub version: u32,
}

fn round_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Validates a [`RawMemoryMap`] and normalizes it into a [`RegionTable`].
///
/// `own_image_base` is the physical address of (a location inside) this application's own loaded
/// image, used to tell apart low-memory ranges the firmware is still actively using from ordinary
/// conventional RAM below 4 GiB.
///
/// Returns [`CoreError::DescriptorMismatch`] if the version, stride, or total byte length is
/// invalid, and [`CoreError::MapOverflow`] if the map has more descriptors than
/// [`MAX_DESCRIPTORS`]. Both are contract violations the caller should treat as fatal (§7).
pub fn normalize(map: &RawMemoryMap, own_image_base: u64) -> Result<RegionTable, CoreError> {
    if map.version != EXPECTED_DESCRIPTOR_VERSION {
        return Err(CoreError::DescriptorMismatch);
    }
    if map.descriptor_stride < size_of::<MemoryDescriptor>() {
        return Err(CoreError::DescriptorMismatch);
    }
    if map.descriptor_stride == 0 || map.descriptors.len() % map.descriptor_stride != 0 {
        return Err(CoreError::DescriptorMismatch);
    }
    let descriptor_count = map.descriptors.len() / map.descriptor_stride;
    if descriptor_count > MAX_DESCRIPTORS {
        return Err(CoreError::MapOverflow);
    }

    let mut table = RegionTable::new();
    for i in 0..descriptor_count {
        let offset = i * map.descriptor_stride;
        let bytes = &map.descriptors[offset..offset + size_of::<MemoryDescriptor>()];
        let descriptor =
            MemoryDescriptor::ref_from_bytes(bytes).map_err(|_| CoreError::DescriptorMismatch)?;

        if let Some(region) = normalize_descriptor(descriptor, own_image_base) {
            // A well-formed firmware map can never exceed MAX_DESCRIPTORS surviving entries,
            // since filtering only removes descriptors; the capacity check above already
            // guarantees this push cannot fail.
            table.push(region).map_err(|_| CoreError::MapOverflow)?;
        }
    }
    Ok(table)
}

/// Applies the filter-and-round pipeline of §4.C3 to a single descriptor.
fn normalize_descriptor(descriptor: &MemoryDescriptor, own_image_base: u64) -> Option<Region> {
    if !descriptor.is_conventional() {
        return None;
    }
    if descriptor.number_of_pages < MIN_REGION_PAGES {
        return None;
    }
    if descriptor.physical_start < LOW_MEMORY_CEILING && descriptor.physical_start > own_image_base
    {
        return None;
    }

    // Align base up and size down to a multiple of REGION_ALIGNMENT. A full MIN_REGION_PAGES
    // margin is always given up first (the region may straddle the rounding in the worst case),
    // then the pages gained by rounding the base up are added back before rounding the size down.
    let misalign_pages = (descriptor.physical_start & (REGION_ALIGNMENT - 1)) / PAGE_SIZE;
    let pages = descriptor
        .number_of_pages
        .checked_sub(MIN_REGION_PAGES)?
        .checked_add(misalign_pages)?;
    let rounded_pages = pages - (pages % MIN_REGION_PAGES);
    if rounded_pages < MIN_REGION_PAGES {
        return None;
    }

    let aligned_base = round_up(descriptor.physical_start, REGION_ALIGNMENT);
    Region::new(aligned_base, rounded_pages).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(memory_type: u32, physical_start: u64, number_of_pages: u64) -> MemoryDescriptor {
        MemoryDescriptor {
            memory_type,
            _padding: 0,
            physical_start,
            virtual_start: 0,
            number_of_pages,
            attribute: descriptor_attribute(),
        }
    }

    fn descriptor_attribute() -> u64 {
        0
    }

    fn pack(descriptors: &[MemoryDescriptor], stride: usize) -> Vec<u8> {
        let mut buf = vec![0u8; descriptors.len() * stride];
        for (i, descriptor) in descriptors.iter().enumerate() {
            let bytes = descriptor.as_bytes();
            buf[i * stride..i * stride + bytes.len()].copy_from_slice(bytes);
        }
        buf
    }

    #[test]
    fn filters_non_conventional_memory() {
        let descriptors = [descriptor(2 /* LoaderData */, 0x10_0000_0000, MIN_REGION_PAGES)];
        let stride = size_of::<MemoryDescriptor>();
        let buf = pack(&descriptors, stride);
        let map = RawMemoryMap {
            descriptors: &buf,
            descriptor_stride: stride,
            version: EXPECTED_DESCRIPTOR_VERSION,
        };
        let table = normalize(&map, 0).unwrap();
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn drops_small_regions() {
        let descriptors = [descriptor(
            CONVENTIONAL_MEMORY_TYPE,
            0x10_0000_0000,
            MIN_REGION_PAGES - 1,
        )];
        let stride = size_of::<MemoryDescriptor>();
        let buf = pack(&descriptors, stride);
        let map = RawMemoryMap {
            descriptors: &buf,
            descriptor_stride: stride,
            version: EXPECTED_DESCRIPTOR_VERSION,
        };
        let table = normalize(&map, 0).unwrap();
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn drops_low_memory_above_own_image() {
        let own_image_base = 0x1000_0000u64;
        let descriptors = [descriptor(
            CONVENTIONAL_MEMORY_TYPE,
            own_image_base + REGION_ALIGNMENT,
            MIN_REGION_PAGES,
        )];
        let stride = size_of::<MemoryDescriptor>();
        let buf = pack(&descriptors, stride);
        let map = RawMemoryMap {
            descriptors: &buf,
            descriptor_stride: stride,
            version: EXPECTED_DESCRIPTOR_VERSION,
        };
        let table = normalize(&map, own_image_base).unwrap();
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn already_aligned_region_still_loses_a_full_margin() {
        // An already-aligned descriptor still gives up a full MIN_REGION_PAGES margin (there is no
        // rounding-up gain to offset it against), so 2x MIN_REGION_PAGES survives as exactly 1x.
        let base = 0x10_0000_0000u64;
        assert_eq!(base % REGION_ALIGNMENT, 0);
        let descriptors = [descriptor(CONVENTIONAL_MEMORY_TYPE, base, MIN_REGION_PAGES * 2)];
        let stride = size_of::<MemoryDescriptor>();
        let buf = pack(&descriptors, stride);
        let map = RawMemoryMap {
            descriptors: &buf,
            descriptor_stride: stride,
            version: EXPECTED_DESCRIPTOR_VERSION,
        };
        let table = normalize(&map, 0).unwrap();
        assert_eq!(table.len(), 1);
        let region = table.get(0).unwrap();
        assert_eq!(region.base, base);
        assert_eq!(region.pages, MIN_REGION_PAGES);
    }

    #[test]
    fn already_aligned_minimum_region_is_dropped() {
        let base = 0x10_0000_0000u64;
        assert_eq!(base % REGION_ALIGNMENT, 0);
        let descriptors = [descriptor(CONVENTIONAL_MEMORY_TYPE, base, MIN_REGION_PAGES)];
        let stride = size_of::<MemoryDescriptor>();
        let buf = pack(&descriptors, stride);
        let map = RawMemoryMap {
            descriptors: &buf,
            descriptor_stride: stride,
            version: EXPECTED_DESCRIPTOR_VERSION,
        };
        let table = normalize(&map, 0).unwrap();
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn keeps_and_aligns_large_conventional_region() {
        let base = 0x10_0000_0000u64 + 0x1234;
        let descriptors = [descriptor(CONVENTIONAL_MEMORY_TYPE, base, MIN_REGION_PAGES * 3)];
        let stride = size_of::<MemoryDescriptor>();
        let buf = pack(&descriptors, stride);
        let map = RawMemoryMap {
            descriptors: &buf,
            descriptor_stride: stride,
            version: EXPECTED_DESCRIPTOR_VERSION,
        };
        let table = normalize(&map, 0).unwrap();
        assert_eq!(table.len(), 1);
        let region = table.get(0).unwrap();
        assert!(region.is_valid());
        assert_eq!(region.base % REGION_ALIGNMENT, 0);
    }

    #[test]
    fn honours_descriptor_stride_padding() {
        let base = 0x20_0000_0000u64;
        let descriptor = descriptor(CONVENTIONAL_MEMORY_TYPE, base, MIN_REGION_PAGES * 2);
        let stride = size_of::<MemoryDescriptor>() + 16;
        let buf = pack(&[descriptor], stride);
        let map = RawMemoryMap {
            descriptors: &buf,
            descriptor_stride: stride,
            version: EXPECTED_DESCRIPTOR_VERSION,
        };
        let table = normalize(&map, 0).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn rejects_wrong_version() {
        let map = RawMemoryMap {
            descriptors: &[],
            descriptor_stride: size_of::<MemoryDescriptor>(),
            version: 2,
        };
        assert_eq!(normalize(&map, 0), Err(CoreError::DescriptorMismatch));
    }

    #[test]
    fn rejects_non_multiple_length() {
        let stride = size_of::<MemoryDescriptor>();
        let buf = vec![0u8; stride + 1];
        let map = RawMemoryMap {
            descriptors: &buf,
            descriptor_stride: stride,
            version: EXPECTED_DESCRIPTOR_VERSION,
        };
        assert_eq!(normalize(&map, 0), Err(CoreError::DescriptorMismatch));
    }
}
