//! Processor discovery and the BSP-side MP services.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{boxed::Box, sync::Arc, vec, vec::Vec};

use cpu_init_mtrr::{mtrr::MtrrLib, Mtrr};
use cpu_init_sdk::error::{EfiError, Result};

use crate::{
    arena::{bist_slot, exchange_info, ApFunction, WakeUpManner, BIST_TABLE_SLOTS, STUB_MAX_SIZE, STUB_OFFSET},
    cpu_data::{CpuData, CpuState, MpSystemData, ProcessorInformation, StatusFlags},
    dispatch::{reset_processor, Batch},
    platform::{Destination, MpPlatform},
    timeout::TimeoutCoordinator,
    wakeup::{hardware_thread_count, processor_location, send_init_sipi_sipi},
    MpConfig,
};

/// MP services for one boot session.
///
/// Only the BSP may call these. The AP side lives in [crate::wakeup].
pub struct MpServices<P: MpPlatform + 'static> {
    pub(crate) platform: Arc<P>,
    pub(crate) system: Arc<MpSystemData>,
    pub(crate) config: MpConfig,
    pub(crate) timeout: TimeoutCoordinator,
    pub(crate) batch: Option<Batch>,
    pub(crate) failed_cpus: Vec<usize>,
    _ap_stacks: Box<[u8]>,
}

impl<P: MpPlatform + 'static> MpServices<P> {
    /// Brings every AP up and leaves it waiting in the procedure loop.
    ///
    /// Missing APs and stragglers are logged, the boot carries on with whatever checked in.
    ///
    /// # Errors
    ///
    /// Returns [`BufferTooSmall`](EfiError::BufferTooSmall) if the start-up stub does not fit the arena.
    ///
    pub fn start(platform: Arc<P>, config: MpConfig) -> Result<Self> {
        let system = Arc::new(MpSystemData::new(config.wakeup_manner, config.reserved_variable_mtrrs));
        platform.attach_system_data(&system);

        let timeout = TimeoutCoordinator::measure(&*platform);
        let max_processors = config.max_processors.clamp(1, BIST_TABLE_SLOTS);
        let ap_stacks = vec![0u8; config.ap_stack_size * (max_processors - 1)].into_boxed_slice();
        prepare_arena(&*platform, &system, &config, &ap_stacks)?;

        let mut services =
            Self { platform, system, config, timeout, batch: None, failed_cpus: Vec::new(), _ap_stacks: ap_stacks };
        services.count_processors(max_processors);
        services.detailed_init();
        Ok(services)
    }

    fn wait_for_counter(&self, field: crate::arena::Field<u32>, expected: usize) -> usize {
        let deadline = self.timeout.deadline(&*self.platform, self.config.discovery_timeout_us);
        loop {
            let count = self.platform.arena().read(field) as usize;
            if count >= expected || self.timeout.is_expired(&*self.platform, deadline) {
                return count;
            }
            self.platform.stall(self.config.poll_interval_us);
        }
    }

    fn count_processors(&mut self, max_processors: usize) {
        let platform = &*self.platform;
        let arena = platform.arena();
        let bsp_apic_id = platform.apic_id();
        let expected = hardware_thread_count(platform).min(max_processors) - 1;

        arena.reset_counters();
        arena.write(exchange_info::AP_FUNCTION, ApFunction::CountProcessors as u32);
        let claimed = if expected > 0 {
            send_init_sipi_sipi(platform, Destination::AllExcludingSelf);
            self.wait_for_counter(exchange_info::CLAIM_COUNTER, expected)
        } else {
            0
        };
        if claimed < expected {
            log::warn!("Only {claimed} of {expected} APs checked in before the discovery timeout");
        }

        let mut aps: Vec<(u32, u32)> = (0..claimed)
            .filter_map(bist_slot)
            .map(|slot| arena.read(slot))
            .map(|value| (value as u32, (value >> 32) as u32))
            .filter(|(apic_id, _)| *apic_id != bsp_apic_id)
            .collect();
        aps.sort_unstable_by_key(|(apic_id, _)| *apic_id);
        aps.dedup_by_key(|(apic_id, _)| *apic_id);
        aps.truncate(max_processors - 1);

        let mut cpus = Vec::with_capacity(aps.len() + 1);
        cpus.push(CpuData::new(bsp_apic_id, 0));
        for (apic_id, bist) in aps {
            if bist != 0 {
                log::error!("APIC ID {apic_id:#x} failed BIST ({bist:#x}), disabled");
            }
            cpus.push(CpuData::new(apic_id, bist));
        }
        let cpus = self.system.populate(cpus);
        self.system.set_bsp_index(0);
        if let Some(bsp) = cpus.first() {
            bsp.set_location(processor_location(platform));
        }
        log::info!("Found {} processors, BSP APIC ID {bsp_apic_id:#x}", cpus.len());
    }

    fn detailed_init(&mut self) {
        let platform = &*self.platform;
        let arena = platform.arena();

        let snapshot = MtrrLib::new(platform, self.config.reserved_variable_mtrrs).get_all_mtrrs().ok();
        self.system.set_mtrr_snapshot(snapshot);

        let expected = self.system.enabled_aps().count();
        arena.write(exchange_info::INIT_FINISHED, 0);
        arena.write(exchange_info::AP_FUNCTION, ApFunction::DetailedInit as u32);
        if expected > 0 {
            send_init_sipi_sipi(platform, Destination::AllExcludingSelf);
            let finished = self.wait_for_counter(exchange_info::INIT_FINISHED, expected);
            if finished < expected {
                log::warn!("{} APs did not finish detailed init", expected - finished);
            }
        }
        arena.write(exchange_info::AP_FUNCTION, ApFunction::ProcedureLoop as u32);
    }

    pub fn system(&self) -> &Arc<MpSystemData> {
        &self.system
    }

    pub fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    pub fn config(&self) -> &MpConfig {
        &self.config
    }

    pub fn timeout(&self) -> &TimeoutCoordinator {
        &self.timeout
    }

    /// Whether the caller is the BSP.
    pub fn is_bsp(&self) -> bool {
        self.system.cpu(self.system.bsp_index()).is_some_and(|bsp| bsp.apic_id() == self.platform.apic_id())
    }

    pub(crate) fn check_bsp(&self) -> Result<()> {
        if self.is_bsp() {
            Ok(())
        } else {
            Err(EfiError::DeviceError)
        }
    }

    /// Total and enabled processor count, BSP included.
    pub fn get_number_of_processors(&self) -> Result<(usize, usize)> {
        self.check_bsp()?;
        let cpus = self.system.cpus();
        let enabled = cpus.iter().filter(|cpu| cpu.state.get() != CpuState::Disabled).count();
        Ok((cpus.len(), enabled))
    }

    pub fn get_processor_info(&self, number: usize) -> Result<ProcessorInformation> {
        self.check_bsp()?;
        let cpu = self.system.cpu(number).ok_or(EfiError::NotFound)?;

        let mut status_flag = StatusFlags::empty();
        status_flag.set(StatusFlags::BSP, number == self.system.bsp_index());
        status_flag.set(StatusFlags::ENABLED, cpu.state.get() != CpuState::Disabled);
        status_flag.set(StatusFlags::HEALTHY, cpu.is_healthy());
        Ok(ProcessorInformation { processor_id: cpu.apic_id() as u64, status_flag, location: cpu.location() })
    }

    /// Processor number of the caller.
    pub fn who_am_i(&self) -> Result<usize> {
        self.system.find_by_apic_id(self.platform.apic_id()).ok_or(EfiError::NotFound)
    }

    /// Enables or disables AP `number`, optionally updating its health flag.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`](EfiError::DeviceError) if the caller is not the BSP, or `number` failed its self test
    /// and cannot be enabled.
    /// Returns [`NotFound`](EfiError::NotFound) if `number` does not exist.
    /// Returns [`InvalidParameter`](EfiError::InvalidParameter) if `number` is the BSP.
    /// Returns [`NotReady`](EfiError::NotReady) if `number` has a task assigned.
    ///
    pub fn enable_disable_ap(&mut self, number: usize, enable: bool, healthy: Option<bool>) -> Result<()> {
        self.check_bsp()?;
        let cpu = self.system.cpu(number).ok_or(EfiError::NotFound)?;
        if number == self.system.bsp_index() {
            return Err(EfiError::InvalidParameter);
        }

        let _serialize = self.system.ap_serialize_lock.lock();
        if enable {
            if cpu.failed_self_test() {
                return Err(EfiError::DeviceError);
            }
            cpu.state.transition(CpuState::Disabled, CpuState::Idle);
        } else {
            match cpu.state.get() {
                CpuState::Idle | CpuState::Disabled => cpu.state.force(CpuState::Disabled),
                _ => return Err(EfiError::NotReady),
            }
        }
        if let Some(healthy) = healthy {
            cpu.set_healthy(healthy);
        }
        log::info!("CPU {number} {}", if enable { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Forces AP `number` back to idle with INIT and a start-up IPI. Whatever it was running is abandoned.
    pub fn reset_processor_to_idle(&mut self, number: usize) -> Result<()> {
        self.check_bsp()?;
        let cpu = self.system.cpu(number).ok_or(EfiError::NotFound)?;
        if number == self.system.bsp_index() {
            return Err(EfiError::InvalidParameter);
        }
        cpu.set_wait_event(None);
        reset_processor(&*self.platform, &self.system, number);
        Ok(())
    }

    /// Makes every AP load the BSP's current MTRRs. Blocks until they have.
    pub fn sync_mtrrs_to_aps(&mut self) -> Result<()> {
        self.check_bsp()?;
        let reserved = self.config.reserved_variable_mtrrs;
        let snapshot = MtrrLib::new(&*self.platform, reserved).get_all_mtrrs()?;
        self.system.set_mtrr_snapshot(Some(snapshot));

        let platform = self.platform.clone();
        let procedure: crate::ApProcedure = Arc::new(move |_| {
            MtrrLib::new(&*platform, reserved).set_all_mtrrs(&snapshot);
        });
        match self.startup_all_aps(procedure, false, None, 0) {
            Err(err) if err.status == EfiError::NotStarted => Ok(()),
            result => result.map_err(EfiError::from),
        }
    }

    /// Parks every AP in a HLT loop so nothing runs behind the OS loader's back.
    pub fn prepare_for_exit_boot_services(&mut self) -> Result<()> {
        self.check_bsp()?;
        let platform = &*self.platform;
        let arena = platform.arena();

        self.batch = None;
        self.system.set_wakeup_manner(WakeUpManner::HltLoop);
        arena.write(exchange_info::WAKEUP_MANNER, WakeUpManner::HltLoop as u32);
        arena.write(exchange_info::AP_FUNCTION, ApFunction::Park as u32);
        send_init_sipi_sipi(platform, Destination::AllExcludingSelf);

        for number in self.system.enabled_aps() {
            if let Some(cpu) = self.system.cpu(number) {
                if cpu.state.get().is_pending() {
                    log::warn!("CPU {number}: task abandoned at exit boot services");
                }
                cpu.set_task(None);
                cpu.set_wait_event(None);
                cpu.state.force(CpuState::Idle);
            }
        }
        log::info!("APs parked");
        Ok(())
    }
}

fn prepare_arena<P: MpPlatform + ?Sized>(
    platform: &P,
    system: &Arc<MpSystemData>,
    config: &MpConfig,
    ap_stacks: &[u8],
) -> Result<()> {
    let arena = platform.arena();
    let stub = platform.startup_stub();
    if stub.len() > STUB_MAX_SIZE {
        return Err(EfiError::BufferTooSmall);
    }
    arena.write_bytes(STUB_OFFSET, stub)?;

    let context = platform.save_context();
    arena.write(exchange_info::LOCK, 0);
    arena.write(exchange_info::STACK_START, ap_stacks.as_ptr() as u64);
    arena.write(exchange_info::STACK_SIZE, config.ap_stack_size as u32);
    arena.write(exchange_info::WAKEUP_MANNER, config.wakeup_manner as u32);
    arena.write(exchange_info::GDTR_BASE, context.gdtr_base);
    arena.write(exchange_info::GDTR_LIMIT, context.gdtr_limit as u32);
    arena.write(exchange_info::IDTR_BASE, context.idtr_base);
    arena.write(exchange_info::IDTR_LIMIT, context.idtr_limit as u32);
    arena.write(exchange_info::CR3, context.cr3);
    arena.write(exchange_info::BSP_APIC_ID, platform.apic_id());
    arena.write(exchange_info::SYSTEM_DATA, Arc::as_ptr(system) as u64);
    Ok(())
}
