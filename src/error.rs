// Copyright The Coldboot Probe Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Error kinds produced by the core (§7 of the design).
//!
//! Contract-violation kinds are always fatal at the call site (see [`crate::require`]);
//! the remaining kinds are ordinary `Result` errors that callers may choose to propagate.

use core::fmt::{self, Display, Formatter};

/// Error kinds produced by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    /// The firmware memory-map service failed.
    FirmwareMapUnavailable,
    /// The firmware-reported memory map has more descriptors than [`crate::region::MAX_REGIONS`]
    /// can hold.
    MapOverflow,
    /// The memory-map descriptor version, size, or stride did not match what this core expects.
    DescriptorMismatch,
    /// Compare was started with no region table saved from a prior Exclude phase.
    NoSavedMap,
    /// Writing the region table to non-volatile storage failed.
    NvWriteFailed,
    /// A [`crate::region::Region`] invariant (alignment, minimum size, non-overlap) was violated.
    RegionInvariantViolated,
    /// A splice would have grown the region table past capacity.
    CapacityExceeded,
    /// A splice would have removed the last remaining region.
    UnderflowRemoval,
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let message = match self {
            Self::FirmwareMapUnavailable => "firmware memory map unavailable",
            Self::MapOverflow => "memory map has more descriptors than the region table capacity",
            Self::DescriptorMismatch => "memory map descriptor version, size or stride mismatch",
            Self::NoSavedMap => "no saved region table; run Exclude before Compare",
            Self::NvWriteFailed => "failed to write region table to non-volatile storage",
            Self::RegionInvariantViolated => "region invariant violated",
            Self::CapacityExceeded => "region table splice would exceed capacity",
            Self::UnderflowRemoval => "region table splice would remove the last region",
        };
        f.write_str(message)
    }
}
