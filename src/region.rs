// Copyright The Coldboot Probe Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! C2: the fixed-capacity region table and its splice operation.
//!
//! A [`Region`] is a contiguous, page-aligned span of physical RAM that the normalizer (§4.C3)
//! judged stable enough to retarget across a reboot. The table is a bounded, insertion-ordered
//! sequence of such regions; the only mutation it ever undergoes is [`RegionTable::remove_range`],
//! which excises a sub-range during the Exclude phase.

use crate::error::CoreError;
use arrayvec::ArrayVec;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Bytes in a page; the unit of exclusion.
pub const PAGE_SIZE: u64 = 0x1000;

/// Bytes in the 16 MiB alignment unit that the normalizer rounds regions to.
pub const REGION_ALIGNMENT: u64 = 0x100_0000;

/// Pages in one [`REGION_ALIGNMENT`]-sized unit, and so the minimum page count of a region.
pub const MIN_REGION_PAGES: u64 = REGION_ALIGNMENT / PAGE_SIZE;

/// Maximum number of regions the table can hold; a hardware-bounded constant, not a tunable.
pub const MAX_REGIONS: usize = 200;

/// A contiguous, page-aligned span of physical memory.
///
/// Invariants (checked by [`Region::new`], and relied on by the rest of the core):
/// `base % 16 MiB == 0`, `pages * 4 KiB % 16 MiB == 0`, `pages >= 4096`.
///
/// These invariants hold for every region the normalizer (§4.C3) produces. After an Exclude
/// splice the *size* invariant may no longer hold for the surviving sub-ranges — see
/// [`RegionTable::remove_range`] — which is acceptable because a post-exclude table is only ever
/// consumed again by the Compare phase on the same platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Region {
    /// Physical base address of the region.
    pub base: u64,
    /// Number of 4 KiB pages in the region.
    pub pages: u64,
}

impl Region {
    /// Creates a region known to satisfy the 16-MiB alignment and minimum-size invariants.
    ///
    /// Returns [`CoreError::RegionInvariantViolated`] otherwise; the normalizer is the only
    /// production caller and treats any such error as fatal, since it can only mean a platform
    /// that violates the assumptions this tool depends on.
    pub fn new(base: u64, pages: u64) -> Result<Self, CoreError> {
        let region = Self { base, pages };
        if region.is_valid() {
            Ok(region)
        } else {
            Err(CoreError::RegionInvariantViolated)
        }
    }

    /// Returns whether this region satisfies the 16-MiB alignment and minimum-size invariants.
    pub const fn is_valid(&self) -> bool {
        self.base % REGION_ALIGNMENT == 0
            && (self.pages * PAGE_SIZE) % REGION_ALIGNMENT == 0
            && self.pages >= MIN_REGION_PAGES
    }

    /// Exclusive end address of the region.
    pub const fn end(&self) -> u64 {
        self.base + self.pages * PAGE_SIZE
    }

    /// Returns whether `[base, base + pages * PAGE_SIZE)` is fully contained in this region.
    const fn contains_range(&self, base: u64, pages: u64) -> bool {
        self.base <= base && base + pages * PAGE_SIZE <= self.end()
    }
}

/// Bounded, insertion-ordered sequence of [`Region`]s.
///
/// Owned exclusively by the Phase Engine for the duration of a phase; populated by the normalizer
/// at boot, mutated only by [`RegionTable::remove_range`], and serialized verbatim by the
/// Persistence Adapter (§4.C5).
#[derive(Debug, Clone, Default)]
pub struct RegionTable {
    regions: ArrayVec<Region, MAX_REGIONS>,
}

impl RegionTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of regions currently in the table.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Returns whether the table holds no regions.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Returns the region at index `i`, if any.
    pub fn get(&self, i: usize) -> Option<&Region> {
        self.regions.get(i)
    }

    /// Iterates over the regions in table order.
    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    /// Appends a region to the table.
    ///
    /// Returns [`CoreError::CapacityExceeded`] if the table is already at [`MAX_REGIONS`].
    pub fn push(&mut self, region: Region) -> Result<(), CoreError> {
        self.regions
            .try_push(region)
            .map_err(|_| CoreError::CapacityExceeded)
    }

    /// Sum of `pages` across every region in the table.
    pub fn total_pages(&self) -> u64 {
        self.regions.iter().map(|region| region.pages).sum()
    }

    /// Excises the page-aligned sub-range `[base, base + pages * PAGE_SIZE)` from region `i`.
    ///
    /// Four cases, tested in this order (see §4.C2):
    ///
    /// 1. **Whole region**: the sub-range is the entire region. Forbidden
    ///    ([`CoreError::UnderflowRemoval`]) if this is the last remaining region.
    /// 2. **Tail**: the sub-range ends at the region's end.
    /// 3. **Head**: the sub-range starts at the region's base.
    /// 4. **Middle split**: the region is split into two. Requires spare capacity
    ///    ([`CoreError::CapacityExceeded`] otherwise).
    ///
    /// Case 1 is a subset of both 2 and 3, so it is matched first.
    ///
    /// # Panics
    ///
    /// Panics (via slice indexing) if `i >= self.len()`. Panics if the sub-range is not fully
    /// contained in region `i`, or does not start at `regions[i].base` or later; the Exclude and
    /// Compare phases only ever call this with sub-ranges they just observed diverging inside
    /// region `i`, so these can never fail in practice and are a programmer-error check, not a
    /// platform-error one.
    pub fn remove_range(&mut self, i: usize, base: u64, pages: u64) -> Result<(), CoreError> {
        let region = self.regions[i];
        assert!(region.base <= base, "sub-range starts before region");
        assert!(
            region.contains_range(base, pages),
            "sub-range not contained in region"
        );

        let whole_region = base == region.base && pages == region.pages;
        let ends_at_region_end = base + pages * PAGE_SIZE == region.end();
        let starts_at_region_base = base == region.base;

        if whole_region {
            if self.regions.len() <= 1 {
                return Err(CoreError::UnderflowRemoval);
            }
            self.regions.remove(i);
        } else if ends_at_region_end {
            self.regions[i].pages -= pages;
        } else if starts_at_region_base {
            self.regions[i].base += pages * PAGE_SIZE;
            self.regions[i].pages -= pages;
        } else {
            if self.regions.len() >= MAX_REGIONS {
                return Err(CoreError::CapacityExceeded);
            }
            let left = Region {
                base: region.base,
                pages: (base - region.base) / PAGE_SIZE,
            };
            let right = Region {
                base: base + pages * PAGE_SIZE,
                pages: region.pages - left.pages - pages,
            };
            self.regions[i] = left;
            self.regions
                .try_insert(i + 1, right)
                .map_err(|_| CoreError::CapacityExceeded)?;
        }
        Ok(())
    }

    /// Borrows the active prefix of the table as a raw byte slice, for the Persistence Adapter.
    pub fn as_bytes(&self) -> &[u8] {
        zerocopy::IntoBytes::as_bytes(self.regions.as_slice())
    }

    /// Replaces the table's contents from a raw byte image produced by [`Self::as_bytes`].
    ///
    /// Returns [`CoreError::DescriptorMismatch`] if `bytes.len()` is not an exact multiple of
    /// `size_of::<Region>()`, and [`CoreError::MapOverflow`] if the implied region count would
    /// exceed [`MAX_REGIONS`].
    pub fn load_from_bytes(&mut self, bytes: &[u8]) -> Result<(), CoreError> {
        if bytes.len() % size_of::<Region>() != 0 {
            return Err(CoreError::DescriptorMismatch);
        }
        let regions =
            <[Region]>::ref_from_bytes(bytes).map_err(|_| CoreError::DescriptorMismatch)?;
        if regions.len() > MAX_REGIONS {
            return Err(CoreError::MapOverflow);
        }
        self.regions.clear();
        self.regions
            .try_extend_from_slice(regions)
            .map_err(|_| CoreError::MapOverflow)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(base: u64, pages: u64) -> Region {
        Region::new(base, pages).unwrap()
    }

    fn table(regions: &[Region]) -> RegionTable {
        let mut table = RegionTable::new();
        for &region in regions {
            table.push(region).unwrap();
        }
        table
    }

    #[test]
    fn rejects_misaligned_base() {
        assert_eq!(
            Region::new(1, MIN_REGION_PAGES),
            Err(CoreError::RegionInvariantViolated)
        );
    }

    #[test]
    fn rejects_undersized_region() {
        assert_eq!(
            Region::new(0, MIN_REGION_PAGES - 1),
            Err(CoreError::RegionInvariantViolated)
        );
    }

    #[test]
    fn remove_tail() {
        let mut t = table(&[region(0x8000_0000, 8192)]);
        t.remove_range(0, 0x8000_0000 + 4096 * PAGE_SIZE, 4096).unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(0).unwrap().pages, 4096);
        assert_eq!(t.get(0).unwrap().base, 0x8000_0000);
    }

    #[test]
    fn remove_head() {
        let mut t = table(&[region(0x8000_0000, 8192)]);
        t.remove_range(0, 0x8000_0000, 4096).unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(0).unwrap().pages, 4096);
        assert_eq!(t.get(0).unwrap().base, 0x8000_0000 + 4096 * PAGE_SIZE);
    }

    #[test]
    fn remove_middle_splits_region() {
        let base = 0x1_0000_0000u64;
        let mut t = table(&[region(base, 12288)]);
        t.remove_range(0, base + 4096 * PAGE_SIZE, 4096).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(0).unwrap().base, base);
        assert_eq!(t.get(0).unwrap().pages, 4096);
        assert_eq!(t.get(1).unwrap().base, base + 8192 * PAGE_SIZE);
        assert_eq!(t.get(1).unwrap().pages, 4096);
    }

    #[test]
    fn remove_whole_region_with_sibling_present() {
        let a = region(0x1000_0000, 4096);
        let b = region(0x2000_0000, 4096);
        let mut t = table(&[a, b]);
        t.remove_range(0, a.base, a.pages).unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(*t.get(0).unwrap(), b);
    }

    #[test]
    fn remove_whole_last_region_is_forbidden() {
        let mut t = table(&[region(0x1000_0000, 4096)]);
        assert_eq!(
            t.remove_range(0, 0x1000_0000, 4096),
            Err(CoreError::UnderflowRemoval)
        );
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn middle_split_rejects_when_table_is_full() {
        let mut t = RegionTable::new();
        let base = 0x1_0000_0000u64;
        t.push(region(base, 12288)).unwrap();
        for i in 1..MAX_REGIONS {
            t.push(region(base + (i as u64) * 0x1_0000_0000, MIN_REGION_PAGES))
                .unwrap();
        }
        assert_eq!(
            t.remove_range(0, base + 4096 * PAGE_SIZE, 4096),
            Err(CoreError::CapacityExceeded)
        );
    }

    #[test]
    fn splice_preserves_page_union() {
        let base = 0x4000_0000u64;
        let mut t = table(&[region(base, 8192)]);
        let excised_base = base + 2048 * PAGE_SIZE;
        let excised_pages = 1024;
        t.remove_range(0, excised_base, excised_pages).unwrap();

        let mut covered: arrayvec::ArrayVec<u64, 8192> = t
            .iter()
            .flat_map(|r| (0..r.pages).map(move |p| r.base + p * PAGE_SIZE))
            .collect();
        let excised: arrayvec::ArrayVec<u64, 8192> =
            (0..excised_pages).map(|p| excised_base + p * PAGE_SIZE).collect();
        covered.extend(excised);

        let original: arrayvec::ArrayVec<u64, 8192> =
            (0..8192).map(|p| base + p * PAGE_SIZE).collect();
        let mut covered_sorted = covered.to_vec();
        covered_sorted.sort_unstable();
        let mut original_sorted = original.to_vec();
        original_sorted.sort_unstable();
        assert_eq!(covered_sorted, original_sorted);
        assert!((1..=MAX_REGIONS).contains(&t.len()));
    }

    #[test]
    fn round_trip_persistence_bytes() {
        let t = table(&[region(0x1000_0000, 4096), region(0x2000_0000, 8192)]);
        let mut restored = RegionTable::new();
        restored.load_from_bytes(t.as_bytes()).unwrap();
        assert_eq!(restored.len(), t.len());
        for i in 0..t.len() {
            assert_eq!(restored.get(i), t.get(i));
        }
    }

    #[test]
    fn load_rejects_truncated_bytes() {
        let mut t = RegionTable::new();
        assert_eq!(
            t.load_from_bytes(&[0u8; 3]),
            Err(CoreError::DescriptorMismatch)
        );
    }
}
