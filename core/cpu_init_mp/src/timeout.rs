//! Microsecond timeouts as time stamp counter deadlines.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use crate::{cpu_data::NO_DEADLINE, platform::MpPlatform};

/// Stall used to calibrate the time stamp counter.
const CALIBRATION_STALL_US: u64 = 1000;

/// Converts timeouts into absolute TSC values using a frequency measured once per boot session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutCoordinator {
    ticks_per_us: u64,
}

impl TimeoutCoordinator {
    /// Measures the TSC over a 1ms stall.
    pub fn measure<P: MpPlatform + ?Sized>(platform: &P) -> Self {
        let start = platform.read_tsc();
        platform.stall(CALIBRATION_STALL_US);
        let end = platform.read_tsc();
        let ticks_per_us = (end.wrapping_sub(start) / CALIBRATION_STALL_US).max(1);
        log::info!("TSC frequency: {} MHz", ticks_per_us);
        Self { ticks_per_us }
    }

    pub const fn from_ticks_per_us(ticks_per_us: u64) -> Self {
        Self { ticks_per_us: if ticks_per_us == 0 { 1 } else { ticks_per_us } }
    }

    pub fn cpu_frequency_hz(&self) -> u64 {
        self.ticks_per_us.saturating_mul(1_000_000)
    }

    /// Absolute TSC deadline `timeout_us` from now. Zero means no deadline.
    pub fn deadline<P: MpPlatform + ?Sized>(&self, platform: &P, timeout_us: u64) -> u64 {
        if timeout_us == 0 {
            return NO_DEADLINE;
        }
        platform.read_tsc().saturating_add(timeout_us.saturating_mul(self.ticks_per_us)).min(NO_DEADLINE - 1)
    }

    pub fn is_expired<P: MpPlatform + ?Sized>(&self, platform: &P, deadline: u64) -> bool {
        deadline != NO_DEADLINE && platform.read_tsc() >= deadline
    }
}
