// Copyright The Coldboot Probe Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! C5: persists the excluded region table across the operator's cold-boot power cycle.
//!
//! The Exclude phase's output is only useful to Compare if it survives a reboot with power fully
//! removed, which rules out anything backed by DRAM. UEFI non-volatile variables are the one
//! storage facility guaranteed to survive that (§6); this module is the sole reader and writer of
//! [`crate::platform::PERSISTED_VARIABLE_NAME`].

use crate::error::CoreError;
use crate::platform::{
    PERSISTED_VARIABLE_ATTRIBUTES, PERSISTED_VARIABLE_GUID, PERSISTED_VARIABLE_NAME, Platform,
};
use crate::region::{MAX_REGIONS, Region, RegionTable};
use crate::require;

/// Largest byte image [`save`]/[`load`] will ever exchange with the platform.
const MAX_PERSISTED_BYTES: usize = MAX_REGIONS * size_of::<Region>();

/// Persists `table` to the non-volatile variable, halting the core on failure (§4.C5): Exclude
/// cannot proceed to a later Compare without a durable table, so a write failure here is
/// unrecoverable.
pub fn save(platform: &impl Platform, table: &RegionTable) {
    let bytes = table.as_bytes();
    require!(
        platform,
        platform
            .nv_set(
                PERSISTED_VARIABLE_NAME,
                PERSISTED_VARIABLE_GUID,
                PERSISTED_VARIABLE_ATTRIBUTES,
                bytes,
            )
            .is_ok(),
        "persist region table ({} bytes)",
        bytes.len()
    );
}

/// Loads the region table most recently written by [`save`].
///
/// Returns [`CoreError::NoSavedMap`] if the variable has never been set (the operator ran Compare
/// before Exclude) or has since been deleted.
pub fn load(platform: &impl Platform) -> Result<RegionTable, CoreError> {
    let mut buf = [0u8; MAX_PERSISTED_BYTES];
    let len = platform
        .nv_get(PERSISTED_VARIABLE_NAME, PERSISTED_VARIABLE_GUID, &mut buf)
        .map_err(|_| CoreError::NoSavedMap)?;

    let mut table = RegionTable::new();
    table.load_from_bytes(&buf[..len])?;
    Ok(table)
}

/// Deletes the persisted region table once Compare has consumed it, so a later Write phase starts
/// from a clean slate.
pub fn clear(platform: &impl Platform) {
    // Deletion failure is not treated as fatal: the stale variable is harmless until the operator
    // runs Exclude again, which simply overwrites it.
    if platform
        .nv_delete(PERSISTED_VARIABLE_NAME, PERSISTED_VARIABLE_GUID)
        .is_err()
    {
        log::warn!("failed to delete persisted region table; ignoring");
    }
}
