// Copyright The Coldboot Probe Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! A pre-OS UEFI application that measures DRAM data remanence across a cold boot.
//!
//! Run it three times in sequence, power-cycling the machine between Exclude and Compare:
//!
//! 1. **Write** stamps a reproducible pattern across every region of conventional RAM.
//! 2. **Exclude** (after a warm reset) drops any range firmware itself overwrote, and persists
//!    the surviving region table to a UEFI non-volatile variable.
//! 3. **Compare** (after a full power cycle) re-derives the pattern and tallies, per bit
//!    position, how often it decayed from the expected value.

#![cfg_attr(not(test), no_main)]
#![cfg_attr(not(test), no_std)]

mod debug;
mod error;
mod logger;
mod memmap;
mod pattern;
mod persistence;
mod phase;
mod platform;
mod region;
mod report;

use crate::phase::{PhaseContext, PhaseEngine};
use crate::platform::{Platform, ResetKind};
use log::info;

/// Largest raw memory-map byte image this core will request from the platform.
const MEMORY_MAP_BUF_BYTES: usize = memmap::MAX_DESCRIPTORS * size_of::<memmap::MemoryDescriptor>();

/// Which mode the operator selected from the startup menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Write,
    Exclude,
    Compare,
}

fn prompt_mode(platform: &impl Platform) -> Mode {
    info!("Application for testing RAM data decay");
    info!("");
    info!("Choose the mode:");
    info!("1. Pattern write");
    info!("2. Exclude modified by firmware");
    info!("3. Pattern compare");
    loop {
        match platform.read_key() {
            '1' => return Mode::Write,
            '2' => return Mode::Exclude,
            '3' => return Mode::Compare,
            _ => continue,
        }
    }
}

fn prompt_reset(platform: &impl Platform) -> ! {
    info!("Press R to reboot, S to shut down");
    loop {
        match platform.read_key() {
            'r' | 'R' => platform.reset(ResetKind::Warm),
            's' | 'S' => platform.reset(ResetKind::Shutdown),
            _ => continue,
        }
    }
}

fn current_region_table(platform: &impl Platform) -> region::RegionTable {
    let mut buf = [0u8; MEMORY_MAP_BUF_BYTES];
    let map = platform
        .get_memory_map(&mut buf)
        .unwrap_or_else(|err| fatal_map_error(platform, err));
    memmap::normalize(&map, platform.own_image_base())
        .unwrap_or_else(|err| fatal_map_error(platform, err))
}

fn fatal_map_error(platform: &impl Platform, err: error::CoreError) -> ! {
    debug::fatal(platform, file!(), line!(), &format_args!("memory map: {err}"))
}

/// Drives the full operator-facing flow: prompts for a mode, runs the matching phase, and (for
/// Write and Compare, which do not loop back into a later phase on the same boot) prompts for a
/// reset.
fn run(platform: &impl Platform) {
    if let Err(err) = platform.disable_watchdog() {
        log::warn!("failed to disable watchdog: {err}");
    }

    match prompt_mode(platform) {
        Mode::Write => {
            info!("Pattern write was selected");
            let table = current_region_table(platform);
            let mut ctx = PhaseContext::new(table);
            PhaseEngine::new(platform).write(&mut ctx);
            info!("Pattern write done");
            prompt_reset(platform);
        }
        Mode::Exclude => {
            info!("Exclude modified by firmware was selected");
            let table = current_region_table(platform);
            let mut ctx = PhaseContext::new(table);
            PhaseEngine::new(platform).exclude(&mut ctx);
            info!("Exclude modified by firmware done");
            prompt_reset(platform);
        }
        Mode::Compare => {
            info!("Pattern compare was selected");
            let table = persistence::load(platform)
                .unwrap_or_else(|err| fatal_map_error(platform, err));
            let mut ctx = PhaseContext::new(table);
            let stats = PhaseEngine::new(platform).compare(&mut ctx);
            info!("Pattern comparison done");

            for bit in 0..64 {
                info!(
                    "{bit:2}: {:16} 0to1, {:16} 1to0",
                    stats.zero_to_one[bit], stats.one_to_zero[bit]
                );
            }
            let differences = stats.differences();
            info!(
                "{differences}/{} different bits",
                stats.compared_bits
            );

            let annotation = prompt_annotation(platform);
            let file_name = report::result_file_name(platform);
            report::write(platform, file_name.as_str(), &stats, &annotation);
            prompt_reset(platform);
        }
    }
}

/// Prompts the operator for the result report's optional annotation fields.
///
/// A blank temperature or power-off-time line (or one that doesn't parse) is recorded as absent
/// rather than failing the prompt, since these fields are informational, not load-bearing.
fn prompt_annotation(platform: &impl Platform) -> report::ResultAnnotation {
    info!("Ambient temperature in whole degrees Celsius (blank to skip):");
    let ambient_temperature_c = platform.read_line(10).trim().parse().ok();

    info!("Seconds without power between Exclude and Compare (blank to skip):");
    let power_off_seconds = platform.read_line(10).trim().parse().ok();

    info!("Comments, max 96 characters (blank to skip):");
    let comments = arrayvec::ArrayString::from(platform.read_line(96).trim()).unwrap_or_default();

    report::ResultAnnotation {
        ambient_temperature_c,
        power_off_seconds,
        comments,
    }
}

#[cfg(all(feature = "uefi-platform", not(test)))]
use uefi::prelude::entry;
#[cfg(all(feature = "uefi-platform", not(test)))]
use uefi::table::{Boot, SystemTable};
#[cfg(all(feature = "uefi-platform", not(test)))]
use uefi::{Handle, Status};

#[cfg(all(feature = "uefi-platform", not(test)))]
#[entry]
fn efi_main(image_handle: Handle, system_table: SystemTable<Boot>) -> Status {
    let platform = platform::uefi::UefiPlatform::new(image_handle, system_table);
    let _ = logger::init(platform.log_sink());
    run(&platform);
    Status::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::FakePlatform;
    use crate::region::MIN_REGION_PAGES;

    #[test]
    fn write_then_exclude_then_compare_end_to_end() {
        let base = 0x1_0000_0000u64;
        let platform = FakePlatform::with_regions(&[(base, MIN_REGION_PAGES)]);

        platform.push_key('1');
        run(&platform);

        platform.push_key('2');
        run(&platform);

        platform.flip_bit(base, 0);

        platform.push_key('3');
        platform.push_line("21");
        platform.push_line("3600");
        platform.push_line("overnight run");
        platform.push_key('r');
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run(&platform)));
        assert!(result.is_err());
        assert_eq!(platform.reset_requested(), Some(ResetKind::Warm));

        let report_name = report::result_file_name(&platform);
        let contents = platform.result_file_contents(report_name.as_str()).unwrap();
        let text = core::str::from_utf8(&contents).unwrap();
        assert!(text.contains("ambient_temperature_c,21"));
        assert!(text.contains("power_off_seconds,3600"));
        assert!(text.contains("comments,overnight run"));
    }
}
