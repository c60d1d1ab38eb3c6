//! CPU init DXE driver core.
//!
//! [CpuInitDxe] is one boot session of the driver. It owns the MP services, the interrupt vector table with its
//! exception dispatcher, and SMRAM access, and it exposes them through [CpuArch](cpu_arch::CpuArch), the
//! [MpServices](cpu_init_mp::MpServices) it hands out, and [SmramAccess](smram::SmramAccess). The host drives it
//! through [on_phase](CpuInitDxe::on_phase) and a periodic [on_timer_tick](CpuInitDxe::on_timer_tick).
//!
//! ## Examples
//!
//! ```rust ignore
//! let config = CpuInitConfig::load(&variables);
//! let idt = IdtSetup { original: &firmware_idt, code_selector: 0x38, entry_stub: vector_entry_address };
//! let mut dxe = CpuInitDxe::initialize(platform, config, idt, status_code, smram)?;
//! dxe.set_memory_attributes(frame_buffer, frame_buffer_size, efi::MEMORY_WC)?;
//! dxe.on_phase(PlatformPhase::EndOfPlatformInit)?;
//! ```
//!
//! ## Features
//!
//! - `std`: Logs to the host terminal instead of the null sink.
//! - `mockall`: Exposes `MockVariableStore` and `MockSmramControl`.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

pub mod config;
pub mod cpu_arch;
pub mod logger;
pub mod phase;
pub mod smram;

use alloc::sync::Arc;

use cpu_init_interrupts::{
    exception_handling::ExceptionDispatcher,
    vector_table::{GateDescriptor, VectorTable},
};
use cpu_init_mp::{platform::MpPlatform, MpServices};
use cpu_init_mtrr::{mtrr::MtrrLib, Mtrr};
use cpu_init_sdk::{error::Result, status_code::ReportStatusCode};

pub use config::CpuInitConfig;
pub use phase::PlatformPhase;

use smram::{SmramAccess, SmramControl};

/// The interrupt vector table the driver takes over.
#[derive(Clone, Copy)]
pub struct IdtSetup<'a> {
    /// The table live when the driver starts.
    pub original: &'a [GateDescriptor],
    /// Code segment for extended entries.
    pub code_selector: u16,
    /// Address of the entry stub for a vector.
    pub entry_stub: fn(usize) -> u64,
}

/// One boot session of the CPU init driver.
pub struct CpuInitDxe<P: MpPlatform + 'static, S: SmramControl> {
    pub(crate) config: CpuInitConfig,
    pub(crate) mp: MpServices<P>,
    pub(crate) vectors: VectorTable,
    pub(crate) exceptions: ExceptionDispatcher,
    pub(crate) smram: SmramAccess<S>,
    pub(crate) entry_stub: fn(usize) -> u64,
}

impl<P: MpPlatform + 'static, S: SmramControl> CpuInitDxe<P, S> {
    /// Starts the boot session on the BSP.
    ///
    /// Takes over the vector table, brings the APs up and applies the hyper-threading setting.
    ///
    /// # Errors
    ///
    /// Fails only if MP bring-up cannot start. Missing APs are not an error.
    pub fn initialize(
        platform: Arc<P>,
        config: CpuInitConfig,
        idt: IdtSetup<'_>,
        status_code: Arc<dyn ReportStatusCode>,
        smram: SmramAccess<S>,
    ) -> Result<Self> {
        log::info!("CPU init: {config:?}");

        let mtrr = MtrrLib::new(&*platform, config.mp.reserved_variable_mtrrs);
        if mtrr.is_supported() {
            mtrr.debug_print_all_mtrrs();
        } else {
            log::warn!("MTRRs not supported, cache attribute changes will fail");
        }

        let vectors = VectorTable::new(idt.original, idt.code_selector, idt.entry_stub);
        #[cfg(all(target_os = "uefi", target_arch = "x86_64"))]
        {
            // SAFETY: The live table is heap allocated and owned by the session for the rest of boot.
            unsafe { vectors.load() };
        }
        let exceptions = ExceptionDispatcher::new(&vectors, status_code);

        let mp = MpServices::start(platform, config.mp)?;
        let mut dxe = Self { config, mp, vectors, exceptions, smram, entry_stub: idt.entry_stub };
        if !config.hyper_threading {
            dxe.disable_secondary_threads()?;
        }

        let (total, enabled) = dxe.mp.get_number_of_processors()?;
        log::info!("CPU init done: {total} processors, {enabled} enabled");
        Ok(dxe)
    }

    pub fn config(&self) -> &CpuInitConfig {
        &self.config
    }

    pub fn mp(&self) -> &MpServices<P> {
        &self.mp
    }

    pub fn mp_mut(&mut self) -> &mut MpServices<P> {
        &mut self.mp
    }

    pub fn vectors(&self) -> &VectorTable {
        &self.vectors
    }

    /// The dispatcher the vector entry stubs call into.
    pub fn exceptions(&self) -> &ExceptionDispatcher {
        &self.exceptions
    }

    pub fn smram(&self) -> &SmramAccess<S> {
        &self.smram
    }

    pub fn smram_mut(&mut self) -> &mut SmramAccess<S> {
        &mut self.smram
    }

    fn disable_secondary_threads(&mut self) -> Result<()> {
        let secondary: alloc::vec::Vec<usize> = self
            .mp
            .system()
            .cpus()
            .iter()
            .enumerate()
            .filter(|(_, cpu)| cpu.is_secondary_thread())
            .map(|(number, _)| number)
            .collect();
        for number in secondary {
            if number == self.mp.system().bsp_index() {
                continue;
            }
            self.mp.enable_disable_ap(number, false, None)?;
            log::info!("Processor {number} disabled, hyper-threading is off");
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use alloc::vec::Vec;
    use cpu_init_mp::sim::SimPlatform;
    use cpu_init_sdk::status_code::NullStatusCode;
    use smram::{MockSmramControl, SmramDescriptor, SmramState};

    pub(crate) type SimSession = CpuInitDxe<SimPlatform, MockSmramControl>;

    /// Entries of the firmware table the sessions start from.
    pub(crate) const ORIGINAL_VECTORS: usize = 48;

    pub(crate) fn entry_stub(vector: usize) -> u64 {
        0x7F00_0000 + vector as u64 * 0x10
    }

    pub(crate) fn original_idt() -> Vec<GateDescriptor> {
        (0..ORIGINAL_VECTORS).map(|vector| GateDescriptor::interrupt_gate(0x38, 0xFFF0_0000 + vector as u64 * 8)).collect()
    }

    pub(crate) fn smram_regions() -> Vec<SmramDescriptor> {
        alloc::vec![SmramDescriptor {
            physical_start: 0x7B00_0000,
            cpu_start: 0x7B00_0000,
            physical_size: 0x80_0000,
            region_state: SmramState::CACHEABLE,
        }]
    }

    pub(crate) fn build(
        apic_ids: &[u32],
        original: &[GateDescriptor],
        control: MockSmramControl,
        adjust: impl FnOnce(&mut CpuInitConfig),
    ) -> SimSession {
        let platform = Arc::new(SimPlatform::new(apic_ids).unwrap());
        let mut config = CpuInitConfig::default();
        config.mp.discovery_timeout_us = 50_000;
        adjust(&mut config);
        let idt = IdtSetup { original, code_selector: 0x38, entry_stub };
        let smram = SmramAccess::new(control, smram_regions());
        CpuInitDxe::initialize(platform, config, idt, Arc::new(NullStatusCode), smram).unwrap()
    }

    pub(crate) fn session_with(apic_ids: &[u32], adjust: impl FnOnce(&mut CpuInitConfig)) -> SimSession {
        build(apic_ids, &original_idt(), MockSmramControl::new(), adjust)
    }

    pub(crate) fn session(apic_ids: &[u32]) -> SimSession {
        session_with(apic_ids, |_| {})
    }

    pub(crate) fn session_with_idt(apic_ids: &[u32], original: &[GateDescriptor]) -> SimSession {
        build(apic_ids, original, MockSmramControl::new(), |_| {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpu_init_interrupts::NUM_INTERRUPT_VECTORS;
    use cpu_init_mp::{arena::WakeUpManner, cpu_data::CpuState};
    use test_support::*;

    #[test]
    fn test_initialize_brings_up_every_processor() {
        let dxe = session(&[0, 2, 4, 6]);
        assert_eq!(dxe.mp().get_number_of_processors(), Ok((4, 4)));
        assert!(dxe.mp().is_bsp());
        for number in 1..4 {
            assert_eq!(dxe.mp().system().cpu(number).unwrap().state.get(), CpuState::Idle);
        }
    }

    #[test]
    fn test_initialize_extends_vector_table() {
        let dxe = session(&[0]);
        assert_eq!(dxe.vectors().original_len(), ORIGINAL_VECTORS);
        assert_eq!(dxe.vectors().entry(0x10).unwrap().handler_address(), 0xFFF0_0000 + 0x10 * 8);
        assert_eq!(dxe.vectors().entry(NUM_INTERRUPT_VECTORS - 1).unwrap().handler_address(), entry_stub(0xFF));
        assert!(!dxe.exceptions().is_registered(0x10));
    }

    #[test]
    fn test_initialize_uses_configured_manner() {
        let dxe = session_with(&[0, 1], |config| config.mp.wakeup_manner = WakeUpManner::MwaitLoop);
        assert_eq!(dxe.mp().system().wakeup_manner(), WakeUpManner::MwaitLoop);
        assert_eq!(dxe.config().mp.wakeup_manner, WakeUpManner::MwaitLoop);
    }

    #[test]
    fn test_hyper_threading_off_keeps_primary_threads() {
        // Simulated processors are all first threads of their core.
        let dxe = session_with(&[0, 1, 2], |config| config.hyper_threading = false);
        assert_eq!(dxe.mp().get_number_of_processors(), Ok((3, 3)));
    }

    #[test]
    fn test_active_core_limit() {
        let dxe = session_with(&[0, 1, 2, 3], |config| config.mp.max_processors = 2);
        assert_eq!(dxe.mp().get_number_of_processors(), Ok((2, 2)));
    }
}
