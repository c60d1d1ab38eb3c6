//! Hardware access used by the MTRR library.
//!
//! [Hal] is the only seam between the register algebra in [crate::mtrr] and the processor. The x86_64 implementation
//! talks to real MSRs and control registers. The simulated implementation keeps a per processor register file in
//! memory and is what the host tests (and the MP simulator) program.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x64;
        pub use x64::X64Hal;
    }
}

#[cfg(any(test, feature = "sim"))]
mod sim;
#[cfg(any(test, feature = "sim"))]
pub use sim::SimulatedHal;

/// Result of a CPUID query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Processor state saved when entering the MTRR quiesce window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheControlState {
    /// Interrupt flag at entry.
    pub interrupts_enabled: bool,
    /// CR4 at entry, restored verbatim on exit.
    pub cr4: u64,
}

/// Processor primitives the MTRR code needs.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait Hal {
    /// Executes CPUID for `leaf`/`subleaf`.
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;

    /// Reads an MSR.
    fn read_msr(&self, msr: u32) -> u64;

    /// Writes an MSR.
    fn write_msr(&self, msr: u32, value: u64);

    /// Enters the quiesce window: interrupts off, CR4.PGE off, CR0.CD=1/NW=0, WBINVD, TLB flush.
    ///
    /// The caller disables the MTRRs in IA32_MTRR_DEF_TYPE itself once this returns.
    fn disable_cache(&self) -> CacheControlState;

    /// Leaves the quiesce window entered by [Hal::disable_cache], in reverse order.
    fn restore_cache(&self, saved: CacheControlState);
}

impl<T: Hal + ?Sized> Hal for &T {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        (**self).cpuid(leaf, subleaf)
    }

    fn read_msr(&self, msr: u32) -> u64 {
        (**self).read_msr(msr)
    }

    fn write_msr(&self, msr: u32, value: u64) {
        (**self).write_msr(msr, value)
    }

    fn disable_cache(&self) -> CacheControlState {
        (**self).disable_cache()
    }

    fn restore_cache(&self, saved: CacheControlState) {
        (**self).restore_cache(saved)
    }
}
