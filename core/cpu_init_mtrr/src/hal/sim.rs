//! In-memory register file implementing [Hal](super::Hal).
//!
//! Every simulated processor owns one of these. Writes to MTRR MSRs outside of a quiesce window, or while
//! IA32_MTRR_DEF_TYPE still has the MTRRs enabled, are counted as violations so tests can assert on them.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{CacheControlState, CpuidResult, Hal};
use crate::structs::{
    MsrIa32MtrrCap, MsrIa32MtrrDefType, MSR_IA32_MTRRCAP, MSR_IA32_MTRR_DEF_TYPE, MSR_IA32_MTRR_FIX4K_C0000,
    MSR_IA32_MTRR_FIX64K_00000, MSR_IA32_MTRR_PHYSBASE0, MtrrMemoryCacheType,
};

/// CPUID.1:EDX.MTRR
const CPUID_1_EDX_MTRR: u32 = 1 << 12;

/// A processor's MSRs and CPUID answers held in memory.
pub struct SimulatedHal {
    msrs: spin::Mutex<BTreeMap<u32, u64>>,
    cpuid: spin::Mutex<BTreeMap<(u32, u32), CpuidResult>>,
    quiesced: AtomicBool,
    mtrr_writes: AtomicUsize,
    violations: AtomicUsize,
    interrupts_enabled: AtomicBool,
}

impl SimulatedHal {
    /// Creates a processor with `variable_count` variable MTRRs, fixed range and WC support, the given physical
    /// address width, and MTRRs enabled with `default_type`.
    pub fn new(variable_count: u8, physical_address_bits: u8, default_type: MtrrMemoryCacheType) -> Self {
        let hal = Self {
            msrs: spin::Mutex::new(BTreeMap::new()),
            cpuid: spin::Mutex::new(BTreeMap::new()),
            quiesced: AtomicBool::new(false),
            mtrr_writes: AtomicUsize::new(0),
            violations: AtomicUsize::new(0),
            interrupts_enabled: AtomicBool::new(true),
        };
        hal.set_cpuid(1, 0, CpuidResult { edx: CPUID_1_EDX_MTRR, ..Default::default() });
        hal.set_cpuid(0x8000_0000, 0, CpuidResult { eax: 0x8000_0008, ..Default::default() });
        hal.set_cpuid(0x8000_0008, 0, CpuidResult { eax: physical_address_bits as u32, ..Default::default() });
        let cap = MsrIa32MtrrCap::new().with_vcnt(variable_count).with_fix(true).with_wc(true);
        let def = MsrIa32MtrrDefType::new().with_mem_type(default_type as u8).with_e(true).with_fe(true);
        {
            let mut msrs = hal.msrs.lock();
            msrs.insert(MSR_IA32_MTRRCAP, cap.into_bits());
            msrs.insert(MSR_IA32_MTRR_DEF_TYPE, def.into_bits());
        }
        hal
    }

    /// A processor whose CPUID reports no MTRRs.
    pub fn without_mtrrs() -> Self {
        let hal = Self::new(0, 36, MtrrMemoryCacheType::Uncacheable);
        hal.set_cpuid(1, 0, CpuidResult::default());
        hal
    }

    /// Overrides a CPUID answer.
    pub fn set_cpuid(&self, leaf: u32, subleaf: u32, result: CpuidResult) {
        self.cpuid.lock().insert((leaf, subleaf), result);
    }

    /// Sets an MSR without going through the write accounting.
    pub fn poke_msr(&self, msr: u32, value: u64) {
        self.msrs.lock().insert(msr, value);
    }

    /// Number of MTRR MSR writes so far, excluding IA32_MTRR_DEF_TYPE.
    pub fn mtrr_write_count(&self) -> usize {
        self.mtrr_writes.load(Ordering::Acquire)
    }

    /// Number of MTRR writes made outside of the quiesce window.
    pub fn violation_count(&self) -> usize {
        self.violations.load(Ordering::Acquire)
    }

    /// Interrupt flag of this processor as left by the last quiesce window.
    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled.load(Ordering::Acquire)
    }

    fn is_mtrr_msr(msr: u32) -> bool {
        (MSR_IA32_MTRR_PHYSBASE0..MSR_IA32_MTRR_PHYSBASE0 + 0x40).contains(&msr)
            || (MSR_IA32_MTRR_FIX64K_00000..=MSR_IA32_MTRR_FIX4K_C0000 + 7).contains(&msr)
    }
}

impl Hal for SimulatedHal {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        self.cpuid.lock().get(&(leaf, subleaf)).copied().unwrap_or_default()
    }

    fn read_msr(&self, msr: u32) -> u64 {
        self.msrs.lock().get(&msr).copied().unwrap_or(0)
    }

    fn write_msr(&self, msr: u32, value: u64) {
        let mut msrs = self.msrs.lock();
        if Self::is_mtrr_msr(msr) {
            self.mtrr_writes.fetch_add(1, Ordering::AcqRel);
            let def = MsrIa32MtrrDefType::from_bits(msrs.get(&MSR_IA32_MTRR_DEF_TYPE).copied().unwrap_or(0));
            if !self.quiesced.load(Ordering::Acquire) || def.e() {
                self.violations.fetch_add(1, Ordering::AcqRel);
            }
        }
        msrs.insert(msr, value);
    }

    fn disable_cache(&self) -> CacheControlState {
        let interrupts_enabled = self.interrupts_enabled.swap(false, Ordering::AcqRel);
        self.quiesced.store(true, Ordering::Release);
        CacheControlState { interrupts_enabled, cr4: 0 }
    }

    fn restore_cache(&self, saved: CacheControlState) {
        self.quiesced.store(false, Ordering::Release);
        self.interrupts_enabled.store(saved.interrupts_enabled, Ordering::Release);
    }
}
