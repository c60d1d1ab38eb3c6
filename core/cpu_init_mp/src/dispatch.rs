//! Handing procedures to APs and collecting them again.
//!
//! A blocking request polls until it is done. A non-blocking one, signalled through an [MpEvent], is advanced by
//! [MpServices::check_all_aps_status] from a periodic timer.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{sync::Arc, vec::Vec};
use core::fmt;

use cpu_init_sdk::error::{EfiError, Result};

use crate::{
    cpu_data::{CpuState, MpSystemData, NO_DEADLINE},
    platform::{Destination, MpPlatform},
    wakeup::{send_init, send_startup, wake_up_ap, INIT_TO_SIPI_DELAY_US, SIPI_TO_SIPI_DELAY_US},
    ApProcedure, MpEvent, MpServices,
};

/// Failure of [MpServices::startup_all_aps], with the processors that did not finish.
#[derive(Clone, PartialEq, Eq)]
pub struct StartupError {
    pub status: EfiError,
    pub failed_cpus: Vec<usize>,
}

impl From<EfiError> for StartupError {
    fn from(status: EfiError) -> Self {
        Self { status, failed_cpus: Vec::new() }
    }
}

impl From<StartupError> for EfiError {
    fn from(err: StartupError) -> Self {
        err.status
    }
}

impl fmt::Debug for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (failed: {:?})", self.status, self.failed_cpus)
    }
}

/// An in-flight [MpServices::startup_all_aps].
pub(crate) struct Batch {
    cpus: Vec<usize>,
    single_thread: bool,
    deadline: u64,
    event: Option<Arc<dyn MpEvent>>,
    finished: usize,
}

/// INIT, then a start-up IPI pair to bring processor `number` back into the procedure loop with nothing to do.
pub(crate) fn reset_processor<P: MpPlatform + ?Sized>(platform: &P, system: &MpSystemData, number: usize) {
    let Some(cpu) = system.cpu(number) else {
        return;
    };
    let destination = Destination::ApicId(cpu.apic_id());
    send_init(platform, destination);
    platform.stall(INIT_TO_SIPI_DELAY_US);

    cpu.set_task(None);
    cpu.set_deadline(NO_DEADLINE);
    cpu.take_start_signal();
    cpu.state.force(CpuState::Idle);

    send_startup(platform, destination);
    platform.stall(SIPI_TO_SIPI_DELAY_US);
    send_startup(platform, destination);
    log::debug!("CPU {number} reset to idle");
}

impl<P: MpPlatform + 'static> MpServices<P> {
    /// Runs `procedure` on AP `number`.
    ///
    /// With an `event` the call returns at once and the event is signalled from
    /// [check_all_aps_status](Self::check_all_aps_status) when the AP finishes or times out. Without one it blocks.
    /// A `timeout_us` of zero waits forever.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`](EfiError::DeviceError) if the caller is not the BSP.
    /// Returns [`NotFound`](EfiError::NotFound) if `number` does not exist.
    /// Returns [`InvalidParameter`](EfiError::InvalidParameter) if `number` is the BSP or disabled.
    /// Returns [`NotReady`](EfiError::NotReady) if `number` is not idle.
    /// Returns [`Timeout`](EfiError::Timeout) if a blocking call ran out of time. The AP has been reset.
    ///
    pub fn startup_this_ap(
        &mut self,
        procedure: ApProcedure,
        number: usize,
        event: Option<Arc<dyn MpEvent>>,
        timeout_us: u64,
    ) -> Result<()> {
        self.check_bsp()?;
        let system = self.system.clone();
        let platform = &*self.platform;
        let cpu = system.cpu(number).ok_or(EfiError::NotFound)?;
        if number == system.bsp_index() || cpu.state.get() == CpuState::Disabled {
            return Err(EfiError::InvalidParameter);
        }
        if cpu.state.get() != CpuState::Idle {
            return Err(EfiError::NotReady);
        }

        let blocking = event.is_none();
        cpu.set_task(Some(procedure));
        cpu.set_deadline(self.timeout.deadline(platform, timeout_us));
        cpu.set_wait_event(event);
        if !cpu.state.transition(CpuState::Idle, CpuState::Ready) {
            cpu.set_task(None);
            cpu.set_wait_event(None);
            return Err(EfiError::NotReady);
        }
        wake_up_ap(platform, &system, number);

        if !blocking {
            return Ok(());
        }
        loop {
            if cpu.state.transition(CpuState::Finished, CpuState::Idle) {
                cpu.set_task(None);
                return Ok(());
            }
            if self.timeout.is_expired(platform, cpu.deadline()) {
                log::warn!("CPU {number} timed out");
                reset_processor(platform, &system, number);
                return Err(EfiError::Timeout);
            }
            platform.stall(self.config.poll_interval_us);
        }
    }

    /// Runs `procedure` on every enabled AP.
    ///
    /// With `single_thread` the APs run one after another in processor number order, otherwise all at once. `event`
    /// and `timeout_us` behave as in [startup_this_ap](Self::startup_this_ap). A non-blocking batch leaves its failed
    /// processors in [take_failed_cpus](Self::take_failed_cpus).
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`](EfiError::DeviceError) if the caller is not the BSP.
    /// Returns [`NotReady`](EfiError::NotReady) if a batch is in flight or an enabled AP is not idle.
    /// Returns [`NotStarted`](EfiError::NotStarted) if there are no enabled APs.
    /// Returns [`Timeout`](EfiError::Timeout), with the processors that were reset, if a blocking call ran out of
    /// time.
    ///
    pub fn startup_all_aps(
        &mut self,
        procedure: ApProcedure,
        single_thread: bool,
        event: Option<Arc<dyn MpEvent>>,
        timeout_us: u64,
    ) -> core::result::Result<(), StartupError> {
        self.check_bsp()?;
        if self.batch.is_some() {
            return Err(EfiError::NotReady.into());
        }
        let system = self.system.clone();
        let platform = &*self.platform;

        let cpus: Vec<usize> = system.enabled_aps().collect();
        if cpus.is_empty() {
            return Err(EfiError::NotStarted.into());
        }
        if cpus.iter().filter_map(|&n| system.cpu(n)).any(|cpu| cpu.state.get() != CpuState::Idle) {
            return Err(EfiError::NotReady.into());
        }

        let blocking = event.is_none();
        let deadline = self.timeout.deadline(platform, timeout_us);
        {
            let _serialize = system.ap_serialize_lock.lock();
            for (position, cpu) in cpus.iter().filter_map(|&n| system.cpu(n)).enumerate() {
                cpu.set_task(Some(procedure.clone()));
                cpu.set_deadline(deadline);
                let next = if single_thread && position > 0 { CpuState::Blocked } else { CpuState::Ready };
                cpu.state.transition(CpuState::Idle, next);
            }
        }
        self.batch = Some(Batch { cpus: cpus.clone(), single_thread, deadline, event, finished: 0 });
        log::debug!("Dispatching to {} APs{}", cpus.len(), if single_thread { ", one at a time" } else { "" });

        for &number in &cpus {
            if system.cpu(number).is_some_and(|cpu| cpu.state.get() == CpuState::Ready) {
                wake_up_ap(platform, &system, number);
            }
        }

        if !blocking {
            return Ok(());
        }
        loop {
            if let Some(result) = self.advance_batch() {
                return result;
            }
            self.platform.stall(self.config.poll_interval_us);
        }
    }

    /// One step of the in-flight batch. `Some` once it has completed.
    fn advance_batch(&mut self) -> Option<core::result::Result<(), StartupError>> {
        let system = self.system.clone();
        let platform = &*self.platform;
        let batch = self.batch.as_mut()?;

        let running = |state: CpuState| matches!(state, CpuState::Ready | CpuState::Busy);
        if batch.single_thread && !batch.cpus.iter().filter_map(|&n| system.cpu(n)).any(|cpu| running(cpu.state.get()))
        {
            let next = batch.cpus.iter().copied().find(|&n| {
                system.cpu(n).is_some_and(|cpu| cpu.state.transition(CpuState::Blocked, CpuState::Ready))
            });
            if let Some(number) = next {
                wake_up_ap(platform, &system, number);
            }
        }

        for cpu in batch.cpus.iter().filter_map(|&n| system.cpu(n)) {
            if cpu.state.transition(CpuState::Finished, CpuState::Idle) {
                cpu.set_task(None);
                batch.finished += 1;
            }
        }

        let pending: Vec<usize> = batch
            .cpus
            .iter()
            .copied()
            .filter(|&n| system.cpu(n).is_some_and(|cpu| cpu.state.get().is_pending()))
            .collect();

        let result = if pending.is_empty() {
            log::debug!("Batch complete, {} APs finished", batch.finished);
            Ok(())
        } else if self.timeout.is_expired(platform, batch.deadline) {
            for &number in &pending {
                let Some(cpu) = system.cpu(number) else { continue };
                if cpu.state.get() == CpuState::Blocked {
                    cpu.set_task(None);
                    cpu.state.force(CpuState::Idle);
                } else {
                    reset_processor(platform, &system, number);
                }
            }
            log::warn!("Batch timed out, {} of {} APs did not finish", pending.len(), batch.cpus.len());
            Err(StartupError { status: EfiError::Timeout, failed_cpus: pending.clone() })
        } else {
            return None;
        };

        let batch = self.batch.take()?;
        if let Some(event) = batch.event {
            event.signal();
        }
        self.failed_cpus = result.as_ref().err().map(|err| err.failed_cpus.clone()).unwrap_or_default();
        Some(result)
    }

    /// Advances every non-blocking request. Called periodically while any are outstanding.
    pub fn check_all_aps_status(&mut self) {
        let system = self.system.clone();
        let platform = &*self.platform;

        for (number, cpu) in system.cpus().iter().enumerate() {
            if !cpu.has_wait_event() {
                continue;
            }
            if cpu.state.transition(CpuState::Finished, CpuState::Idle) {
                cpu.set_task(None);
            } else if self.timeout.is_expired(platform, cpu.deadline()) {
                log::warn!("CPU {number} timed out");
                reset_processor(platform, &system, number);
            } else {
                continue;
            }
            if let Some(event) = cpu.take_wait_event() {
                event.signal();
            }
        }

        if self.batch.as_ref().is_some_and(|batch| batch.event.is_some()) {
            self.advance_batch();
        }
    }

    /// Processors the last non-blocking batch reset after it timed out.
    pub fn take_failed_cpus(&mut self) -> Vec<usize> {
        core::mem::take(&mut self.failed_cpus)
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{arena::WakeUpManner, sim::SimPlatform, MockMpEvent, MpConfig};

    fn start(apic_ids: &[u32], manner: WakeUpManner) -> (Arc<SimPlatform>, MpServices<SimPlatform>) {
        let sim = Arc::new(SimPlatform::new(apic_ids).unwrap());
        let config = MpConfig { wakeup_manner: manner, ..Default::default() };
        let mp = MpServices::start(sim.clone(), config).unwrap();
        (sim, mp)
    }

    fn signalled_once() -> Arc<dyn MpEvent> {
        let mut event = MockMpEvent::new();
        event.expect_signal().times(1).return_const(());
        Arc::new(event)
    }

    #[test]
    fn test_single_thread_runs_one_at_a_time() {
        for manner in [WakeUpManner::HltLoop, WakeUpManner::RunLoop] {
            let (_sim, mut mp) = start(&[0, 1, 2, 3], manner);
            let running = Arc::new(AtomicUsize::new(0));
            let finished = Arc::new(AtomicUsize::new(0));
            let order = Arc::new(spin::Mutex::new(Vec::new()));

            let (r, f, o) = (running.clone(), finished.clone(), order.clone());
            let procedure: ApProcedure = Arc::new(move |n| {
                assert_eq!(r.fetch_add(1, Ordering::SeqCst), 0);
                o.lock().push(n);
                r.fetch_sub(1, Ordering::SeqCst);
                f.fetch_add(1, Ordering::SeqCst);
            });
            mp.startup_all_aps(procedure, true, None, 0).unwrap();

            assert_eq!(finished.load(Ordering::SeqCst), 3);
            assert_eq!(*order.lock(), [1, 2, 3]);
            assert!(mp.system().cpus().iter().all(|cpu| cpu.state.get() == CpuState::Idle));
        }
    }

    #[test]
    fn test_startup_this_ap_blocking() {
        let (_sim, mut mp) = start(&[0, 1, 2], WakeUpManner::MwaitLoop);
        let ran_on = Arc::new(AtomicUsize::new(0));
        let record = ran_on.clone();
        mp.startup_this_ap(Arc::new(move |n| record.store(n, Ordering::SeqCst)), 2, None, 1_000).unwrap();
        assert_eq!(ran_on.load(Ordering::SeqCst), 2);
        assert_eq!(mp.system().cpu(2).unwrap().state.get(), CpuState::Idle);
    }

    #[test]
    fn test_startup_this_ap_errors() {
        let (_sim, mut mp) = start(&[0, 1, 2], WakeUpManner::HltLoop);
        let nop: ApProcedure = Arc::new(|_| {});
        assert_eq!(mp.startup_this_ap(nop.clone(), 5, None, 0), Err(EfiError::NotFound));
        assert_eq!(mp.startup_this_ap(nop.clone(), 0, None, 0), Err(EfiError::InvalidParameter));
        mp.enable_disable_ap(1, false, None).unwrap();
        assert_eq!(mp.startup_this_ap(nop.clone(), 1, None, 0), Err(EfiError::InvalidParameter));
        mp.system().cpu(2).unwrap().state.force(CpuState::Busy);
        assert_eq!(mp.startup_this_ap(nop, 2, None, 0), Err(EfiError::NotReady));
    }

    #[test]
    fn test_timeout_resets_unresponsive_ap() {
        let (sim, mut mp) = start(&[0, 1, 2, 3], WakeUpManner::HltLoop);
        sim.set_unresponsive(2, true);

        assert_eq!(mp.startup_this_ap(Arc::new(|_| {}), 2, None, 1), Err(EfiError::Timeout));
        assert_eq!(mp.system().cpu(2).unwrap().state.get(), CpuState::Idle);

        let finished = Arc::new(AtomicUsize::new(0));
        let f = finished.clone();
        let err = mp.startup_all_aps(Arc::new(move |_| { f.fetch_add(1, Ordering::SeqCst); }), false, None, 1).unwrap_err();
        assert_eq!(err.status, EfiError::Timeout);
        assert_eq!(err.failed_cpus, [2]);
        assert_eq!(finished.load(Ordering::SeqCst), 2);
        assert!(mp.system().cpus().iter().all(|cpu| cpu.state.get() == CpuState::Idle));

        // Once it answers again it takes work like the others.
        sim.set_unresponsive(2, false);
        mp.startup_this_ap(Arc::new(|_| {}), 2, None, 0).unwrap();
    }

    #[test]
    fn test_single_thread_timeout_releases_queued_aps() {
        let (sim, mut mp) = start(&[0, 1, 2, 3], WakeUpManner::HltLoop);
        sim.set_unresponsive(1, true);
        let err = mp.startup_all_aps(Arc::new(|_| {}), true, None, 5_000).unwrap_err();
        assert_eq!(err.status, EfiError::Timeout);
        assert_eq!(err.failed_cpus, [1, 2, 3]);
        assert!(mp.system().cpus().iter().all(|cpu| cpu.state.get() == CpuState::Idle));
    }

    #[test]
    fn test_non_blocking_this_ap() {
        let (sim, mut mp) = start(&[0, 1], WakeUpManner::RunLoop);
        mp.startup_this_ap(Arc::new(|_| {}), 1, Some(signalled_once()), 0).unwrap();
        assert_eq!(mp.startup_this_ap(Arc::new(|_| {}), 1, None, 0), Err(EfiError::NotReady));

        sim.stall(10);
        mp.check_all_aps_status();
        assert_eq!(mp.system().cpu(1).unwrap().state.get(), CpuState::Idle);
        // Already signalled, nothing left to do.
        mp.check_all_aps_status();
    }

    #[test]
    fn test_non_blocking_all_aps() {
        let (sim, mut mp) = start(&[0, 1, 2, 3], WakeUpManner::RunLoop);
        let finished = Arc::new(AtomicUsize::new(0));
        let f = finished.clone();
        mp.startup_all_aps(Arc::new(move |_| { f.fetch_add(1, Ordering::SeqCst); }), true, Some(signalled_once()), 0)
            .unwrap();
        assert_eq!(mp.startup_all_aps(Arc::new(|_| {}), false, None, 0).unwrap_err().status, EfiError::NotReady);
        assert_eq!(mp.switch_bsp(1, true), Err(EfiError::NotReady));

        for _ in 0..8 {
            mp.check_all_aps_status();
            sim.stall(10);
        }
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert!(mp.take_failed_cpus().is_empty());
        mp.startup_all_aps(Arc::new(|_| {}), false, None, 0).unwrap();
    }

    #[test]
    fn test_non_blocking_failed_cpus() {
        let (sim, mut mp) = start(&[0, 1, 2], WakeUpManner::HltLoop);
        sim.set_unresponsive(1, true);
        mp.startup_all_aps(Arc::new(|_| {}), false, Some(signalled_once()), 100).unwrap();
        sim.stall(1_000);
        mp.check_all_aps_status();
        assert_eq!(mp.take_failed_cpus(), [1]);
        assert!(mp.take_failed_cpus().is_empty());
    }

    #[test]
    fn test_reset_processor_to_idle() {
        let (sim, mut mp) = start(&[0, 1], WakeUpManner::HltLoop);
        sim.set_unresponsive(1, true);
        mp.startup_this_ap(Arc::new(|_| {}), 1, Some(Arc::new(MockMpEvent::new())), 0).unwrap();
        assert_eq!(mp.system().cpu(1).unwrap().state.get(), CpuState::Ready);

        mp.reset_processor_to_idle(1).unwrap();
        assert_eq!(mp.system().cpu(1).unwrap().state.get(), CpuState::Idle);
        assert_eq!(mp.reset_processor_to_idle(0), Err(EfiError::InvalidParameter));
        assert_eq!(mp.reset_processor_to_idle(2), Err(EfiError::NotFound));
    }
}
