//! x86_64 [Hal](super::Hal) backed by the real processor.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::arch::asm;

use x86_64::{
    instructions::{interrupts, tlb},
    registers::{
        control::{Cr0, Cr0Flags, Cr4, Cr4Flags},
        model_specific::Msr,
    },
};

use super::{CacheControlState, CpuidResult, Hal};

/// The running processor.
#[derive(Debug, Default, Clone, Copy)]
pub struct X64Hal;

impl X64Hal {
    pub const fn new() -> Self {
        Self
    }
}

impl Hal for X64Hal {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        // SAFETY: CPUID is available on every x86_64 processor.
        #[allow(unused_unsafe)]
        let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
        CpuidResult { eax: r.eax, ebx: r.ebx, ecx: r.ecx, edx: r.edx }
    }

    fn read_msr(&self, msr: u32) -> u64 {
        // SAFETY: only architectural MTRR/APIC MSRs are read, after CPUID confirmed their presence.
        unsafe { Msr::new(msr).read() }
    }

    fn write_msr(&self, msr: u32, value: u64) {
        let mut msr = Msr::new(msr);
        // SAFETY: MTRR writes happen inside the quiesce window. Other MSRs are written with values read back from
        // the same register with single fields changed.
        unsafe { msr.write(value) };
    }

    fn disable_cache(&self) -> CacheControlState {
        let interrupts_enabled = interrupts::are_enabled();
        interrupts::disable();

        let cr4 = Cr4::read();
        // SAFETY: clearing PGE only forces global TLB entries out, paging stays enabled.
        unsafe { Cr4::write(cr4 - Cr4Flags::PAGE_GLOBAL) };

        let mut cr0 = Cr0::read();
        cr0.insert(Cr0Flags::CACHE_DISABLE);
        cr0.remove(Cr0Flags::NOT_WRITE_THROUGH);
        // SAFETY: no-fill cache mode, the processor keeps running from memory.
        unsafe { Cr0::write(cr0) };

        // SAFETY: WBINVD writes back and invalidates caches. No memory is made inconsistent.
        unsafe { asm!("wbinvd", options(nostack, preserves_flags)) };
        tlb::flush_all();

        CacheControlState { interrupts_enabled, cr4: cr4.bits() }
    }

    fn restore_cache(&self, saved: CacheControlState) {
        tlb::flush_all();

        let mut cr0 = Cr0::read();
        cr0.remove(Cr0Flags::CACHE_DISABLE | Cr0Flags::NOT_WRITE_THROUGH);
        // SAFETY: re-enables normal cache mode.
        unsafe { Cr0::write(cr0) };

        // SAFETY: restores the value read in `disable_cache`.
        unsafe { Cr4::write(Cr4Flags::from_bits_truncate(saved.cr4)) };

        if saved.interrupts_enabled {
            interrupts::enable();
        }
    }
}
