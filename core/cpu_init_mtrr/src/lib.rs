//! IA32 Memory Type Range Register management.
//!
//! Programs the fixed (below 1MB) and variable cache-range registers so a physical range gets a requested memory
//! type without leaving unrelated ranges inconsistent. Overlapping requests are merged with existing ranges where the
//! architecture allows it and refused where it does not.
//!
//! ## Examples
//!
//! ```rust ignore
//! use cpu_init_mtrr::{create_mtrr_lib, structs::MtrrMemoryCacheType, Mtrr};
//!
//! let mut mtrr = create_mtrr_lib(cpu_init_mtrr::RESERVED_FIRMWARE_VARIABLE_MTRR_NUMBER);
//! let written = mtrr.set_memory_attribute(0, 0x8000_0000, MtrrMemoryCacheType::WriteBack)?;
//! if written > 0 {
//!     // Every other processor must now load `mtrr.get_all_mtrrs()?`.
//! }
//! ```
//!
//! ## Features
//!
//! - `sim`: Exposes [hal::SimulatedHal], an in-memory register file used by host tests of dependent crates.
//! - `mockall`: Exposes `MockMtrr` and `MockHal`.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

use alloc::vec::Vec;

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

pub mod error;
pub mod hal;
pub mod mtrr;
pub mod structs;

use error::MtrrResult;
use structs::{MtrrMemoryCacheType, MtrrMemoryRange, MtrrSettings};

/// Variable MTRRs left to the OS at the top of the register set.
pub const RESERVED_FIRMWARE_VARIABLE_MTRR_NUMBER: usize = 2;

/// Cache attribute programming for the running processor.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait Mtrr {
    /// Whether CPUID reports MTRR support.
    fn is_supported(&self) -> bool;

    /// Snapshot of every MTRR MSR.
    fn get_all_mtrrs(&self) -> MtrrResult<MtrrSettings>;

    /// Loads a snapshot, typically the BSP's, writing only registers that differ. Returns the number changed.
    fn set_all_mtrrs(&mut self, mtrr_setting: &MtrrSettings) -> usize;

    /// Effective memory type of `address`.
    fn get_memory_attribute(&self, address: u64) -> MtrrMemoryCacheType;

    /// Marks `[base_address, base_address + length)` as `attribute`.
    ///
    /// Returns the number of MTRR registers whose value changed. Zero means the hardware already matched and nothing
    /// was touched.
    fn set_memory_attribute(
        &mut self,
        base_address: u64,
        length: u64,
        attribute: MtrrMemoryCacheType,
    ) -> MtrrResult<usize>;

    /// Applies several ranges in order as one change. Either all of them land or the hardware is untouched.
    fn set_memory_attributes(&mut self, ranges: &[MtrrMemoryRange]) -> MtrrResult<usize>;

    /// Valid variable ranges, decoded.
    fn get_memory_ranges(&self) -> MtrrResult<Vec<MtrrMemoryRange>>;

    /// Logs the full MTRR state at info level.
    fn debug_print_all_mtrrs(&self);
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Creates the MTRR library for the running processor.
        pub fn create_mtrr_lib(reserved_variable_mtrr_count: usize) -> mtrr::MtrrLib<hal::X64Hal> {
            mtrr::MtrrLib::new(hal::X64Hal::new(), reserved_variable_mtrr_count)
        }
    }
}
