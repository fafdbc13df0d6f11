// Copyright The Coldboot Probe Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! C4: the Write / Exclude / Compare phase engine.
//!
//! Each phase is a single pass over the [`RegionTable`], stepping one 4 KiB page at a time and
//! re-seeding the [`Lfsr`] from the page's physical address before touching its 512 64-bit words.
//! All of the mutable state a phase needs — the table, the running page counter, and (Compare
//! only) the per-bit statistics — lives in an explicit [`PhaseContext`] rather than module-level
//! statics (§9): nothing here is global.

use crate::pattern::Lfsr;
use crate::platform::Platform;
use crate::region::{PAGE_SIZE, Region, RegionTable};
use crate::require;

/// 64-bit words per page.
const WORDS_PER_PAGE: u64 = PAGE_SIZE / size_of::<u64>() as u64;

/// The explicit, non-global state a phase operates on (§9's "re-architect module statics as an
/// explicit `PhaseContext`" redesign note).
#[derive(Debug, Clone, Default)]
pub struct PhaseContext {
    /// The region table being iterated.
    pub table: RegionTable,
    /// Pages processed so far, across every region.
    pub pages_done: u64,
}

impl PhaseContext {
    /// Creates a context over `table`.
    pub fn new(table: RegionTable) -> Self {
        Self {
            table,
            pages_done: 0,
        }
    }

    fn log_progress(&self, total_pages: u64) {
        let percent = if total_pages == 0 {
            100
        } else {
            self.pages_done * 100 / total_pages
        };
        log::info!("... {percent:3}%");
    }
}

/// Per-bit decay statistics accumulated by the Compare phase (§3).
#[derive(Debug, Clone)]
pub struct RunStatistics {
    /// Count of bits observed to flip from 0 (expected) to 1 (observed), indexed by bit position.
    pub zero_to_one: [u64; 64],
    /// Count of bits observed to flip from 1 (expected) to 0 (observed), indexed by bit position.
    pub one_to_zero: [u64; 64],
    /// Total bits compared across every region.
    pub compared_bits: u64,
}

impl Default for RunStatistics {
    fn default() -> Self {
        Self {
            zero_to_one: [0; 64],
            one_to_zero: [0; 64],
            compared_bits: 0,
        }
    }
}

impl RunStatistics {
    /// Total number of bits observed to have flipped, in either direction.
    pub fn differences(&self) -> u64 {
        (0..64)
            .map(|b| self.zero_to_one[b] + self.one_to_zero[b])
            .sum()
    }
}

/// Drives the three-phase protocol (§4.C4) over a [`PhaseContext`], via a [`Platform`].
pub struct PhaseEngine<'p, P: Platform> {
    platform: &'p P,
}

impl<'p, P: Platform> PhaseEngine<'p, P> {
    /// Creates an engine bound to `platform`.
    pub fn new(platform: &'p P) -> Self {
        Self { platform }
    }

    /// Write phase: stamps the deterministic pattern across every region, with no tallying or
    /// persistence. Flushes caches to DRAM at the end, so the values survive the operator's power
    /// cycle.
    pub fn write(&self, ctx: &mut PhaseContext) {
        let total_pages = ctx.table.total_pages();
        let region_count = ctx.table.len();
        for i in 0..region_count {
            let region = *ctx.table.get(i).unwrap();
            self.write_region(ctx, total_pages, region);
        }
        self.platform.writeback_invalidate_caches();
    }

    fn write_region(&self, ctx: &mut PhaseContext, total_pages: u64, region: Region) {
        for page in 0..region.pages {
            let page_base = region.base + page * PAGE_SIZE;
            let mut lfsr = Lfsr::stir(page_base);
            let mut words = [0u64; WORDS_PER_PAGE as usize];
            for word in words.iter_mut() {
                *word = lfsr.next();
            }
            self.platform.write_words(page_base, &words);
            ctx.pages_done += 1;
            ctx.log_progress(total_pages);
        }
    }

    /// Exclude phase: compares the generated pattern against what is actually observed, and
    /// permanently excises any page that ever diverged (i.e. was rewritten by firmware during
    /// normal boot rather than decaying). Persists the resulting table via the Persistence
    /// Adapter.
    ///
    /// # Panics
    ///
    /// Panics (via [`crate::require`], which halts on real firmware) if persisting the resulting
    /// table fails; Compare would otherwise have no valid input.
    pub fn exclude(&self, ctx: &mut PhaseContext) {
        let total_pages = ctx.table.total_pages();
        let mut i = 0;
        // The outer index is never rewound after a middle-split inserts a new region at `i + 1`:
        // splits only ever insert *after* the region currently being scanned, never renumber
        // regions at or below `i` (§4.C4's "note on indexing during splits").
        while i < ctx.table.len() {
            let region = *ctx.table.get(i).unwrap();
            self.exclude_region(ctx, total_pages, i, region);
            i += 1;
        }

        crate::persistence::save(self.platform, &ctx.table);
    }

    fn exclude_region(
        &self,
        ctx: &mut PhaseContext,
        total_pages: u64,
        i: usize,
        region: Region,
    ) {
        let mut was_same = true;
        let mut first_bad: Option<u64> = None;

        for page in 0..region.pages {
            let page_base = region.base + page * PAGE_SIZE;
            let mut lfsr = Lfsr::stir(page_base);
            for word in 0..WORDS_PER_PAGE {
                let expected = lfsr.next();
                let word_addr = page_base + word * size_of::<u64>() as u64;
                let observed = self.platform.read_word(word_addr);

                if observed != expected {
                    if was_same {
                        first_bad = Some(word_addr & !(PAGE_SIZE - 1));
                    }
                    was_same = false;
                } else if !was_same {
                    let last = (word_addr + PAGE_SIZE) & !(PAGE_SIZE - 1);
                    let bad = first_bad.take().expect("first_bad set while !was_same");
                    self.excise(ctx, i, bad, (last - bad) / PAGE_SIZE);
                    was_same = true;
                }
            }
            ctx.pages_done += 1;
            ctx.log_progress(total_pages);
        }

        if let Some(bad) = first_bad {
            let region_end = region.end();
            self.excise(ctx, i, bad, (region_end - bad) / PAGE_SIZE);
        }
    }

    fn excise(&self, ctx: &mut PhaseContext, i: usize, base: u64, pages: u64) {
        require!(
            self.platform,
            ctx.table.remove_range(i, base, pages).is_ok(),
            "exclude range @ {base:#x}, {pages} pages"
        );
    }

    /// Compare phase: reloads the region table persisted by Exclude, re-derives the expected
    /// pattern, and tallies per-bit flip statistics. Deletes the persisted table afterwards so a
    /// later Write phase starts clean.
    ///
    /// Issues its own cache writeback-invalidate at entry, rather than relying on an undocumented
    /// assumption that a cold boot has already flushed speculative caching (§9, Open Question 2).
    pub fn compare(&self, ctx: &mut PhaseContext) -> RunStatistics {
        self.platform.writeback_invalidate_caches();

        let mut stats = RunStatistics::default();
        let total_pages = ctx.table.total_pages();
        let region_count = ctx.table.len();
        for i in 0..region_count {
            let region = *ctx.table.get(i).unwrap();
            self.compare_region(ctx, total_pages, region, &mut stats);
        }

        crate::persistence::clear(self.platform);
        stats
    }

    fn compare_region(
        &self,
        ctx: &mut PhaseContext,
        total_pages: u64,
        region: Region,
        stats: &mut RunStatistics,
    ) {
        for page in 0..region.pages {
            let page_base = region.base + page * PAGE_SIZE;
            let mut lfsr = Lfsr::stir(page_base);
            for word in 0..WORDS_PER_PAGE {
                let expected = lfsr.next();
                let word_addr = page_base + word * size_of::<u64>() as u64;
                let observed = self.platform.read_word(word_addr);

                if observed != expected {
                    let delta = expected ^ observed;
                    for bit in 0..64 {
                        if delta & (1 << bit) == 0 {
                            continue;
                        }
                        if observed & (1 << bit) != 0 {
                            stats.zero_to_one[bit] += 1;
                        } else {
                            stats.one_to_zero[bit] += 1;
                        }
                    }
                }
            }
            ctx.pages_done += 1;
            ctx.log_progress(total_pages);
        }
        stats.compared_bits += region.pages * PAGE_SIZE * 8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::FakePlatform;
    use crate::region::{MIN_REGION_PAGES, Region};

    fn single_region_table(base: u64, pages: u64) -> RegionTable {
        let mut table = RegionTable::new();
        table.push(Region::new(base, pages).unwrap()).unwrap();
        table
    }

    #[test]
    fn write_then_read_back_matches_pattern() {
        let base = 0x1_0000_0000u64;
        let platform = FakePlatform::with_regions(&[(base, MIN_REGION_PAGES)]);
        let engine = PhaseEngine::new(&platform);
        let mut ctx = PhaseContext::new(single_region_table(base, MIN_REGION_PAGES));

        engine.write(&mut ctx);

        assert_eq!(ctx.pages_done, MIN_REGION_PAGES);
        let mut expected = Lfsr::stir(base);
        for word in 0..WORDS_PER_PAGE {
            let addr = base + word * size_of::<u64>() as u64;
            assert_eq!(platform.read_word(addr), expected.next());
        }
    }

    #[test]
    fn exclude_removes_tail_that_firmware_rewrote() {
        let base = 0x8000_0000u64;
        let pages = 8192;
        let platform = FakePlatform::with_regions(&[(base, pages)]);
        let engine = PhaseEngine::new(&platform);
        let mut ctx = PhaseContext::new(single_region_table(base, pages));
        engine.write(&mut ctx);

        // Flip bit 0 of the last word of each page in the final 4096 pages.
        for page in 4096..pages {
            let page_base = base + page * PAGE_SIZE;
            let last_word_addr = page_base + (WORDS_PER_PAGE - 1) * size_of::<u64>() as u64;
            platform.flip_bit(last_word_addr, 0);
        }

        let mut ctx = PhaseContext::new(single_region_table(base, pages));
        engine.exclude(&mut ctx);

        assert_eq!(ctx.table.len(), 1);
        assert_eq!(ctx.table.get(0).unwrap().pages, 4096);
        assert_eq!(ctx.table.get(0).unwrap().base, base);
    }

    #[test]
    fn exclude_splits_region_around_middle_divergence() {
        let base = 0x1_0000_0000u64;
        let pages = 12288;
        let platform = FakePlatform::with_regions(&[(base, pages)]);
        let engine = PhaseEngine::new(&platform);
        let mut ctx = PhaseContext::new(single_region_table(base, pages));
        engine.write(&mut ctx);

        for page in 4096..8192 {
            let page_base = base + page * PAGE_SIZE;
            platform.flip_bit(page_base, 0);
        }

        let mut ctx = PhaseContext::new(single_region_table(base, pages));
        engine.exclude(&mut ctx);

        assert_eq!(ctx.table.len(), 2);
        assert_eq!(ctx.table.get(0).unwrap().base, base);
        assert_eq!(ctx.table.get(0).unwrap().pages, 4096);
        assert_eq!(ctx.table.get(1).unwrap().base, base + 8192 * PAGE_SIZE);
        assert_eq!(ctx.table.get(1).unwrap().pages, 4096);
    }

    #[test]
    fn exclude_removes_whole_region_leaving_sibling() {
        let a_base = 0x1000_0000u64;
        let b_base = 0x2000_0000u64;
        let pages = 4096;
        let platform = FakePlatform::with_regions(&[(a_base, pages), (b_base, pages)]);
        let engine = PhaseEngine::new(&platform);

        let mut table = RegionTable::new();
        table.push(Region::new(a_base, pages).unwrap()).unwrap();
        table.push(Region::new(b_base, pages).unwrap()).unwrap();
        let mut ctx = PhaseContext::new(table.clone());
        engine.write(&mut ctx);

        for page in 0..pages {
            platform.flip_bit(a_base + page * PAGE_SIZE, 0);
        }

        let mut ctx = PhaseContext::new(table);
        engine.exclude(&mut ctx);

        assert_eq!(ctx.table.len(), 1);
        assert_eq!(ctx.table.get(0).unwrap().base, b_base);
    }

    #[test]
    fn compare_counts_single_bit_flip() {
        let base = 0x1_0000_0000u64;
        let pages = MIN_REGION_PAGES * 2;
        let platform = FakePlatform::with_regions(&[(base, pages)]);
        let engine = PhaseEngine::new(&platform);
        let mut ctx = PhaseContext::new(single_region_table(base, pages));
        engine.write(&mut ctx);

        platform.flip_bit(base, 17);

        let mut ctx = PhaseContext::new(single_region_table(base, pages));
        let stats = engine.compare(&mut ctx);

        assert_eq!(stats.differences(), 1);
        assert_eq!(stats.one_to_zero[17] + stats.zero_to_one[17], 1);
        for bit in 0..64 {
            if bit != 17 {
                assert_eq!(stats.zero_to_one[bit], 0);
                assert_eq!(stats.one_to_zero[bit], 0);
            }
        }
        assert_eq!(stats.compared_bits, pages * PAGE_SIZE * 8);
    }

    #[test]
    fn statistics_identity_holds() {
        let base = 0x1_0000_0000u64;
        let pages = MIN_REGION_PAGES;
        let platform = FakePlatform::with_regions(&[(base, pages)]);
        let engine = PhaseEngine::new(&platform);
        let mut ctx = PhaseContext::new(single_region_table(base, pages));
        engine.write(&mut ctx);

        for bit in 0..5 {
            platform.flip_bit(base + bit * size_of::<u64>() as u64, bit as u32);
        }

        let mut ctx = PhaseContext::new(single_region_table(base, pages));
        let stats = engine.compare(&mut ctx);

        for bit in 0..64 {
            assert!(stats.zero_to_one[bit] + stats.one_to_zero[bit] <= stats.compared_bits / 64);
        }
        assert!(stats.differences() <= stats.compared_bits);
    }
}
