//! Boot phase notifications.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use cpu_init_mp::platform::MpPlatform;
use cpu_init_mtrr::{mtrr::MtrrLib, Mtrr};
use cpu_init_sdk::error::Result;

use crate::{smram::SmramControl, CpuInitDxe};

/// Points in the boot flow the driver reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformPhase {
    /// Memory is fully described. The BSP's final MTRR layout is pushed to the APs.
    PostMemoryInit,
    /// Platform init is done. SMRAM is closed and locked when configured to.
    EndOfPlatformInit,
    ReadyToBoot,
    /// The APs are parked for the OS.
    ExitBootServices,
}

impl<P: MpPlatform + 'static, S: SmramControl> CpuInitDxe<P, S> {
    pub fn on_phase(&mut self, phase: PlatformPhase) -> Result<()> {
        log::debug!("CPU init: {phase:?}");
        match phase {
            PlatformPhase::PostMemoryInit => self.mp.sync_mtrrs_to_aps(),
            PlatformPhase::EndOfPlatformInit => match self.config.smram_lock {
                true => self.close_and_lock_smram(),
                false => Ok(()),
            },
            PlatformPhase::ReadyToBoot => {
                MtrrLib::new(&**self.mp.platform(), self.config.mp.reserved_variable_mtrrs).debug_print_all_mtrrs();
                if self.config.smram_lock && !self.smram.is_locked() {
                    log::warn!("SMRAM still unlocked at ready to boot");
                    self.close_and_lock_smram()?;
                }
                Ok(())
            }
            PlatformPhase::ExitBootServices => self.mp.prepare_for_exit_boot_services(),
        }
    }

    /// Advances non-blocking MP requests. Called from the periodic timer.
    pub fn on_timer_tick(&mut self) {
        self.mp.check_all_aps_status();
    }

    fn close_and_lock_smram(&mut self) -> Result<()> {
        self.smram.close()?;
        self.smram.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{build, original_idt, session};
    use crate::{cpu_arch::CpuArch, smram::MockSmramControl};
    use alloc::sync::Arc;
    use cpu_init_mp::{arena::WakeUpManner, cpu_data::CpuState, MockMpEvent};
    use cpu_init_mtrr::structs::MtrrMemoryCacheType;
    use cpu_init_sdk::error::EfiError;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn locking_control() -> MockSmramControl {
        let mut control = MockSmramControl::new();
        control.expect_close().times(1).returning(|| Ok(()));
        control.expect_lock().times(1).returning(|| Ok(()));
        control
    }

    #[test]
    fn test_post_memory_init_syncs_mtrrs() {
        let mut dxe = session(&[0, 1, 2]);
        let platform = dxe.mp().platform().clone();
        MtrrLib::new(&*platform, 2)
            .set_memory_attribute(0x1_0000_0000, 0x4000_0000, MtrrMemoryCacheType::WriteCombining)
            .unwrap();

        dxe.on_phase(PlatformPhase::PostMemoryInit).unwrap();

        for apic_id in [1, 2] {
            let ap = MtrrLib::new(platform.hal_of(apic_id).unwrap(), 2);
            assert_eq!(ap.get_memory_attribute(0x1_0000_0000), MtrrMemoryCacheType::WriteCombining);
        }
    }

    #[test]
    fn test_end_of_platform_init_locks_smram() {
        let mut dxe = build(&[0], &original_idt(), locking_control(), |_| {});
        dxe.on_phase(PlatformPhase::EndOfPlatformInit).unwrap();
        assert!(dxe.smram().is_locked());

        // Nothing more reaches the control once locked.
        dxe.on_phase(PlatformPhase::ReadyToBoot).unwrap();
        assert_eq!(dxe.smram_mut().open(), Err(EfiError::AccessDenied));
    }

    #[test]
    fn test_smram_left_alone_when_not_configured() {
        let mut control = MockSmramControl::new();
        control.expect_close().never();
        control.expect_lock().never();
        let mut dxe = build(&[0], &original_idt(), control, |config| config.smram_lock = false);

        dxe.on_phase(PlatformPhase::EndOfPlatformInit).unwrap();
        dxe.on_phase(PlatformPhase::ReadyToBoot).unwrap();
        assert!(!dxe.smram().is_locked());
    }

    #[test]
    fn test_ready_to_boot_locks_open_smram() {
        let mut control = locking_control();
        control.expect_open().times(1).returning(|| Ok(()));
        let mut dxe = build(&[0], &original_idt(), control, |_| {});

        dxe.smram_mut().open().unwrap();
        dxe.on_phase(PlatformPhase::ReadyToBoot).unwrap();
        assert!(dxe.smram().is_locked());
        assert!(!dxe.smram().is_open());
    }

    #[test]
    fn test_exit_boot_services_parks_aps() {
        let mut dxe = build(&[0, 1, 2], &original_idt(), MockSmramControl::new(), |config| {
            config.mp.wakeup_manner = WakeUpManner::RunLoop
        });
        dxe.on_phase(PlatformPhase::ExitBootServices).unwrap();

        let platform = dxe.mp().platform().clone();
        assert!(platform.is_halted(1));
        assert!(platform.is_halted(2));
        assert_eq!(dxe.mp().system().wakeup_manner(), WakeUpManner::HltLoop);
    }

    #[test]
    fn test_timer_tick_completes_non_blocking_request() {
        let mut dxe = session(&[0, 1, 2]);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let mut event = MockMpEvent::new();
        event.expect_signal().times(1).return_const(());

        dxe.mp_mut()
            .startup_all_aps(
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                false,
                Some(Arc::new(event)),
                0,
            )
            .unwrap();

        for _ in 0..8 {
            dxe.on_timer_tick();
            dxe.mp().platform().stall(10);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        for number in [1, 2] {
            assert_eq!(dxe.mp().system().cpu(number).unwrap().state.get(), CpuState::Idle);
        }
    }

    #[test]
    fn test_full_boot_flow() {
        let mut control = locking_control();
        control.expect_open().never();
        let mut dxe = build(&[0, 1, 2, 3], &original_idt(), control, |_| {});

        dxe.set_memory_attributes(0x1_0000_0000, 0x4000_0000, r_efi::efi::MEMORY_WC).unwrap();
        dxe.on_phase(PlatformPhase::PostMemoryInit).unwrap();
        dxe.on_phase(PlatformPhase::EndOfPlatformInit).unwrap();
        dxe.on_phase(PlatformPhase::ReadyToBoot).unwrap();
        dxe.on_phase(PlatformPhase::ExitBootServices).unwrap();

        assert!(dxe.smram().is_locked());
        let platform = dxe.mp().platform().clone();
        for apic_id in [1, 2, 3] {
            let ap = MtrrLib::new(platform.hal_of(apic_id).unwrap(), 2);
            assert_eq!(ap.get_memory_attribute(0x1_0000_0000), MtrrMemoryCacheType::WriteCombining);
            assert!(platform.is_halted(apic_id));
        }
    }
}
