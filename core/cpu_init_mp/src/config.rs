//! MP bring-up configuration.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use crate::arena::{WakeUpManner, BIST_TABLE_SLOTS};

/// Tunables for processor discovery and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpConfig {
    /// How idle APs wait for work.
    pub wakeup_manner: WakeUpManner,
    /// Stack bytes per AP.
    pub ap_stack_size: usize,
    /// Upper bound on logical processors, BSP included.
    pub max_processors: usize,
    /// How long the BSP waits for APs to check in during discovery and detailed init.
    pub discovery_timeout_us: u64,
    /// Stall between two polls of a blocking wait.
    pub poll_interval_us: u64,
    /// How long [switch_bsp](crate::MpServices::switch_bsp) waits for the new BSP to rendezvous.
    pub switch_bsp_timeout_us: u64,
    /// Variable MTRRs the APs leave alone when loading the BSP snapshot.
    pub reserved_variable_mtrrs: usize,
}

impl Default for MpConfig {
    fn default() -> Self {
        Self {
            wakeup_manner: WakeUpManner::HltLoop,
            ap_stack_size: 0x8000,
            max_processors: BIST_TABLE_SLOTS,
            discovery_timeout_us: 100_000,
            poll_interval_us: 10,
            switch_bsp_timeout_us: 1_000_000,
            reserved_variable_mtrrs: cpu_init_mtrr::RESERVED_FIRMWARE_VARIABLE_MTRR_NUMBER,
        }
    }
}
