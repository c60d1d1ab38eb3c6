//! Handing the BSP role to an AP.
//!
//! The exchange is a rendezvous through [ExchangeRoleInfo]:
//!
//! 1. The BSP disables interrupts, publishes the target and moves the exchange to `Requested`, then wakes the target.
//! 2. The target disables its interrupts, saves its context and answers `ApReady`.
//! 3. The BSP clears IA32_APIC_BASE.BSP and swaps contexts with the target. From here on the code that called
//!    [MpServices::switch_bsp] runs on the new BSP, which sets its own BSP flag, records the new roles and moves the
//!    exchange to `Swapped`.
//! 4. The former BSP, now running the AP half, restores the AP's interrupt state and returns the exchange to `Idle`.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use cpu_init_sdk::error::{EfiError, Result};

use crate::{
    arena::exchange_info,
    cpu_data::{CpuState, MpSystemData},
    platform::{CpuContext, MpPlatform},
    wakeup::wake_up_ap,
    ApLoopAction, MpServices,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExchangeState {
    Idle = 0,
    Requested = 1,
    ApReady = 2,
    Swapped = 3,
}

impl ExchangeState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Requested,
            2 => Self::ApReady,
            3 => Self::Swapped,
            _ => Self::Idle,
        }
    }
}

/// Rendezvous area for a BSP role exchange.
pub struct ExchangeRoleInfo {
    state: AtomicU8,
    old_bsp: AtomicUsize,
    new_bsp: AtomicUsize,
    ap_interrupts: AtomicBool,
    bsp_context: spin::Mutex<CpuContext>,
    ap_context: spin::Mutex<CpuContext>,
}

impl ExchangeRoleInfo {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(ExchangeState::Idle as u8),
            old_bsp: AtomicUsize::new(usize::MAX),
            new_bsp: AtomicUsize::new(usize::MAX),
            ap_interrupts: AtomicBool::new(false),
            bsp_context: spin::Mutex::new(CpuContext::default()),
            ap_context: spin::Mutex::new(CpuContext::default()),
        }
    }

    pub fn state(&self) -> ExchangeState {
        ExchangeState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ExchangeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Context the former BSP left behind.
    pub fn bsp_context(&self) -> CpuContext {
        *self.bsp_context.lock()
    }

    fn arm(&self, old_bsp: usize, new_bsp: usize) {
        self.old_bsp.store(old_bsp, Ordering::Release);
        self.new_bsp.store(new_bsp, Ordering::Release);
        self.set_state(ExchangeState::Requested);
    }

    fn is_new_bsp(&self, number: usize) -> bool {
        self.new_bsp.load(Ordering::Acquire) == number
    }

    fn is_old_bsp(&self, number: usize) -> bool {
        self.old_bsp.load(Ordering::Acquire) == number
    }
}

/// The AP half of the exchange. `None` means there is nothing for processor `number` to do.
pub(crate) fn service_ap_side<P: MpPlatform + ?Sized>(
    system: &MpSystemData,
    platform: &P,
    number: usize,
) -> Option<ApLoopAction> {
    let exchange = &system.exchange;
    match exchange.state() {
        ExchangeState::Requested if exchange.is_new_bsp(number) => {
            exchange.ap_interrupts.store(platform.disable_interrupts(), Ordering::Release);
            *exchange.ap_context.lock() = platform.save_context();
            exchange.set_state(ExchangeState::ApReady);
            Some(ApLoopAction::Continue)
        }
        ExchangeState::ApReady if exchange.is_new_bsp(number) => Some(ApLoopAction::Continue),
        ExchangeState::Swapped if exchange.is_old_bsp(number) => {
            platform.restore_interrupts(exchange.ap_interrupts.load(Ordering::Acquire));
            exchange.set_state(ExchangeState::Idle);
            log::info!("CPU {number}: now running as an AP");
            None
        }
        _ => None,
    }
}

impl<P: MpPlatform + 'static> MpServices<P> {
    /// Makes processor `number` the BSP.
    ///
    /// The former BSP becomes an idle AP, or a disabled one when `enable_old_bsp` is false.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`](EfiError::DeviceError) if the caller is not the BSP.
    /// Returns [`NotFound`](EfiError::NotFound) if `number` does not exist.
    /// Returns [`InvalidParameter`](EfiError::InvalidParameter) if `number` is the BSP or disabled.
    /// Returns [`NotReady`](EfiError::NotReady) if `number` is busy or a batch is in flight.
    /// Returns [`Timeout`](EfiError::Timeout) if the target never reached the rendezvous.
    ///
    pub fn switch_bsp(&mut self, number: usize, enable_old_bsp: bool) -> Result<()> {
        self.check_bsp()?;
        let system = &*self.system;
        let platform = &*self.platform;
        let target = system.cpu(number).ok_or(EfiError::NotFound)?;
        let old_bsp = system.bsp_index();
        if number == old_bsp || target.state.get() == CpuState::Disabled {
            return Err(EfiError::InvalidParameter);
        }
        if self.batch.is_some() {
            return Err(EfiError::NotReady);
        }

        let _serialize = system.ap_serialize_lock.lock();
        if !target.state.transition(CpuState::Idle, CpuState::Busy) {
            return Err(EfiError::NotReady);
        }

        log::info!("Switching BSP from CPU {old_bsp} to CPU {number}");
        let interrupts = platform.disable_interrupts();
        system.exchange.arm(old_bsp, number);
        wake_up_ap(platform, system, number);

        let deadline = self.timeout.deadline(platform, self.config.switch_bsp_timeout_us);
        while system.exchange.state() != ExchangeState::ApReady {
            if self.timeout.is_expired(platform, deadline) {
                log::error!("CPU {number} never reached the BSP exchange rendezvous");
                system.exchange.set_state(ExchangeState::Idle);
                target.state.force(CpuState::Idle);
                platform.restore_interrupts(interrupts);
                return Err(EfiError::Timeout);
            }
            platform.stall(self.config.poll_interval_us);
        }

        platform.set_bsp_flag(false);
        let ap_context = *system.exchange.ap_context.lock();
        let mut bsp_context = CpuContext::default();
        platform.exchange_context(&mut bsp_context, &ap_context);
        *system.exchange.bsp_context.lock() = bsp_context;

        // Running on the new BSP.
        platform.set_bsp_flag(true);
        system.set_bsp_index(number);
        platform.arena().write(exchange_info::BSP_APIC_ID, target.apic_id());
        target.state.force(CpuState::Idle);
        if let Some(old) = system.cpu(old_bsp) {
            old.state.force(if enable_old_bsp { CpuState::Idle } else { CpuState::Disabled });
        }
        system.exchange.set_state(ExchangeState::Swapped);
        platform.restore_interrupts(interrupts);

        log::info!("CPU {number} is the BSP");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::{sync::Arc, vec::Vec};
    use core::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{arena::WakeUpManner, sim::SimPlatform, MpConfig};

    fn start(manner: WakeUpManner) -> (Arc<SimPlatform>, MpServices<SimPlatform>) {
        let sim = Arc::new(SimPlatform::new(&[0, 2, 4, 6]).unwrap());
        let config = MpConfig { wakeup_manner: manner, ..Default::default() };
        let mp = MpServices::start(sim.clone(), config).unwrap();
        (sim, mp)
    }

    #[test]
    fn test_switch_bsp_is_symmetric() {
        for manner in [WakeUpManner::HltLoop, WakeUpManner::RunLoop] {
            let (sim, mut mp) = start(manner);
            sim.set_interrupts_enabled(0, true);

            mp.switch_bsp(2, true).unwrap();

            assert_eq!(mp.who_am_i().unwrap(), 2);
            assert_eq!(sim.main_apic_id(), 4);
            assert!(sim.bsp_flag(4));
            assert!(!sim.bsp_flag(0));
            assert!(sim.interrupts_enabled(4));
            let info = mp.get_processor_info(0).unwrap();
            assert!(!info.status_flag.contains(crate::cpu_data::StatusFlags::BSP));
            assert!(mp.get_processor_info(2).unwrap().status_flag.contains(crate::cpu_data::StatusFlags::BSP));

            // The former BSP takes work like any other AP.
            let ran_on = Arc::new(AtomicUsize::new(usize::MAX));
            let record = ran_on.clone();
            mp.startup_this_ap(Arc::new(move |n| record.store(n, Ordering::SeqCst)), 0, None, 0).unwrap();
            assert_eq!(ran_on.load(Ordering::SeqCst), 0);
            assert_eq!(mp.system().exchange.state(), ExchangeState::Idle);

            // And the role can be handed back.
            mp.switch_bsp(0, true).unwrap();
            assert_eq!(mp.who_am_i().unwrap(), 0);
            assert_eq!(sim.main_apic_id(), 0);
        }
    }

    #[test]
    fn test_switch_bsp_can_disable_old_bsp() {
        let (_sim, mut mp) = start(WakeUpManner::HltLoop);
        mp.switch_bsp(3, false).unwrap();
        assert_eq!(mp.system().cpu(0).unwrap().state.get(), CpuState::Disabled);
        assert_eq!(mp.get_number_of_processors().unwrap(), (4, 3));
        let aps: Vec<usize> = mp.system().enabled_aps().collect();
        assert_eq!(aps, [1, 2]);
    }

    #[test]
    fn test_switch_bsp_errors() {
        let (sim, mut mp) = start(WakeUpManner::HltLoop);
        assert_eq!(mp.switch_bsp(9, true), Err(EfiError::NotFound));
        assert_eq!(mp.switch_bsp(0, true), Err(EfiError::InvalidParameter));
        mp.enable_disable_ap(1, false, None).unwrap();
        assert_eq!(mp.switch_bsp(1, true), Err(EfiError::InvalidParameter));

        sim.set_unresponsive(4, true);
        assert_eq!(mp.switch_bsp(2, true), Err(EfiError::Timeout));
        assert_eq!(mp.system().cpu(2).unwrap().state.get(), CpuState::Idle);
        assert_eq!(mp.who_am_i().unwrap(), 0);
        assert_eq!(mp.system().exchange.state(), ExchangeState::Idle);
    }
}
