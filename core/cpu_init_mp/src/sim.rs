//! A deterministic set of simulated processors.
//!
//! [SimPlatform] runs every processor on the calling thread. The processor the caller's code runs on is the main
//! processor, the BSP until a role exchange moves it. Every [stall](MpPlatform::stall) on the main processor advances
//! the TSC and then gives each awake AP one pass of its loop, so a wait loop on the BSP is what makes the APs
//! progress. IPIs are delivered synchronously.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use cpu_init_mtrr::{
    hal::{CacheControlState, CpuidResult, Hal, SimulatedHal},
    structs::MtrrMemoryCacheType,
};
use cpu_init_sdk::{
    bit,
    error::{EfiError, Result},
};

use crate::{
    arena::LowMemoryArena,
    cpu_data::{MpSystemData, ProcessorLocation},
    platform::{
        CpuContext, DeliveryMode, IcrValue, MpPlatform, Shorthand, APIC_BASE_BSP, CPUID_EXTENDED_TOPOLOGY,
        CPUID_SIGNATURE, CPUID_VERSION_INFO, MSR_IA32_APIC_BASE,
    },
    wakeup::{ap_entry, ap_loop_once},
    ApLoopAction,
};

/// TSC ticks per simulated microsecond.
pub const SIM_TSC_PER_US: u64 = 1000;
/// Where the simulated arena sits.
pub const SIM_ARENA_BASE: u64 = 0x8_8000;

const SIM_STACK_BASE: u64 = 0x20_0000;
const SIM_CR3: u64 = 0x10_0000;
const LOCAL_APIC_BASE: u64 = 0xFEE0_0000;
const APIC_BASE_ENABLE: u64 = bit!(11);

/// cli; hlt; jmp $-2
const SIM_STARTUP_STUB: [u8; 4] = [0xFA, 0xF4, 0xEB, 0xFD];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RunState {
    WaitForInit = 0,
    WaitForSipi = 1,
    Entering = 2,
    Running = 3,
    Halted = 4,
    Main = 5,
}

impl RunState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::WaitForSipi,
            2 => Self::Entering,
            3 => Self::Running,
            4 => Self::Halted,
            5 => Self::Main,
            _ => Self::WaitForInit,
        }
    }
}

struct SimCpu {
    apic_id: u32,
    hal: SimulatedHal,
    run: AtomicU8,
    bist: AtomicU32,
    unresponsive: AtomicBool,
    interrupts: AtomicBool,
    fpu_inits: AtomicUsize,
}

impl SimCpu {
    fn new(apic_id: u32, thread_count: u32, bsp: bool) -> Self {
        let hal = SimulatedHal::new(8, 39, MtrrMemoryCacheType::Uncacheable);
        hal.set_cpuid(CPUID_SIGNATURE, 0, CpuidResult { eax: CPUID_EXTENDED_TOPOLOGY, ..Default::default() });
        hal.set_cpuid(
            CPUID_VERSION_INFO,
            0,
            CpuidResult { ebx: apic_id << 24 | (thread_count.min(0xFF)) << 16, edx: 1 << 12, ..Default::default() },
        );
        // One thread per core, up to 16 cores per package.
        hal.set_cpuid(CPUID_EXTENDED_TOPOLOGY, 0, CpuidResult { eax: 0, ebx: 1, ecx: 0x100, edx: apic_id });
        hal.set_cpuid(CPUID_EXTENDED_TOPOLOGY, 1, CpuidResult { eax: 4, ebx: thread_count, ecx: 0x201, edx: apic_id });
        let apic_base = LOCAL_APIC_BASE | APIC_BASE_ENABLE | if bsp { APIC_BASE_BSP } else { 0 };
        hal.poke_msr(MSR_IA32_APIC_BASE, apic_base);

        let run = if bsp { RunState::Main } else { RunState::WaitForInit };
        Self {
            apic_id,
            hal,
            run: AtomicU8::new(run as u8),
            bist: AtomicU32::new(0),
            unresponsive: AtomicBool::new(false),
            interrupts: AtomicBool::new(false),
            fpu_inits: AtomicUsize::new(0),
        }
    }

    fn run_state(&self) -> RunState {
        RunState::from_raw(self.run.load(Ordering::Acquire))
    }

    fn set_run_state(&self, state: RunState) {
        self.run.store(state as u8, Ordering::Release);
    }
}

/// Location [SimPlatform] reports for `apic_id`.
pub fn sim_location(apic_id: u32) -> ProcessorLocation {
    ProcessorLocation { package: apic_id >> 4, core: apic_id & 0xF, thread: 0 }
}

/// Simulated processor set. The first APIC ID is the BSP.
pub struct SimPlatform {
    cpus: Vec<SimCpu>,
    main: AtomicUsize,
    current: AtomicUsize,
    stepping: AtomicBool,
    tsc: AtomicU64,
    system: spin::Once<Arc<MpSystemData>>,
    arena: LowMemoryArena,
    ipis: spin::Mutex<Vec<IcrValue>>,
}

impl SimPlatform {
    /// # Errors
    ///
    /// Returns [`InvalidParameter`](EfiError::InvalidParameter) if `apic_ids` is empty or has duplicates.
    pub fn new(apic_ids: &[u32]) -> Result<Self> {
        let mut sorted = apic_ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if apic_ids.is_empty() || sorted.len() != apic_ids.len() {
            return Err(EfiError::InvalidParameter);
        }

        let count = apic_ids.len() as u32;
        let cpus = apic_ids.iter().enumerate().map(|(index, &apic_id)| SimCpu::new(apic_id, count, index == 0)).collect();
        Ok(Self {
            cpus,
            main: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            stepping: AtomicBool::new(false),
            tsc: AtomicU64::new(0),
            system: spin::Once::new(),
            arena: LowMemoryArena::new(SIM_ARENA_BASE)?,
            ipis: spin::Mutex::new(Vec::new()),
        })
    }

    fn index_of(&self, apic_id: u32) -> Option<usize> {
        self.cpus.iter().position(|cpu| cpu.apic_id == apic_id)
    }

    fn current_cpu(&self) -> &SimCpu {
        &self.cpus[self.current.load(Ordering::Acquire)]
    }

    /// BIST value processor `apic_id` reports at its next reset.
    pub fn set_bist(&self, apic_id: u32, bist: u32) {
        if let Some(index) = self.index_of(apic_id) {
            self.cpus[index].bist.store(bist, Ordering::Release);
        }
    }

    /// An unresponsive processor ignores IPIs and is never stepped.
    pub fn set_unresponsive(&self, apic_id: u32, unresponsive: bool) {
        if let Some(index) = self.index_of(apic_id) {
            self.cpus[index].unresponsive.store(unresponsive, Ordering::Release);
        }
    }

    pub fn hal_of(&self, apic_id: u32) -> Option<&SimulatedHal> {
        self.index_of(apic_id).map(|index| &self.cpus[index].hal)
    }

    /// Every IPI sent so far.
    pub fn ipi_log(&self) -> Vec<IcrValue> {
        self.ipis.lock().clone()
    }

    /// APIC ID of the processor the caller's code runs on.
    pub fn main_apic_id(&self) -> u32 {
        self.cpus[self.main.load(Ordering::Acquire)].apic_id
    }

    pub fn bsp_flag(&self, apic_id: u32) -> bool {
        self.hal_of(apic_id).is_some_and(|hal| hal.read_msr(MSR_IA32_APIC_BASE) & APIC_BASE_BSP != 0)
    }

    pub fn interrupts_enabled(&self, apic_id: u32) -> bool {
        self.index_of(apic_id).is_some_and(|index| self.cpus[index].interrupts.load(Ordering::Acquire))
    }

    pub fn set_interrupts_enabled(&self, apic_id: u32, enabled: bool) {
        if let Some(index) = self.index_of(apic_id) {
            self.cpus[index].interrupts.store(enabled, Ordering::Release);
        }
    }

    pub fn is_halted(&self, apic_id: u32) -> bool {
        self.index_of(apic_id).is_some_and(|index| self.cpus[index].run_state() == RunState::Halted)
    }

    pub fn fpu_init_count(&self, apic_id: u32) -> usize {
        self.index_of(apic_id).map_or(0, |index| self.cpus[index].fpu_inits.load(Ordering::Acquire))
    }

    /// Runs `f` as if processor `apic_id` were executing it.
    pub fn run_as<R>(&self, apic_id: u32, f: impl FnOnce() -> R) -> R {
        let previous = self.current.load(Ordering::Acquire);
        if let Some(index) = self.index_of(apic_id) {
            self.current.store(index, Ordering::Release);
        }
        let result = f();
        self.current.store(previous, Ordering::Release);
        result
    }

    /// One loop pass for every awake AP.
    fn step(&self, system: &MpSystemData) {
        let previous = self.current.load(Ordering::Acquire);
        for (index, cpu) in self.cpus.iter().enumerate() {
            if index == self.main.load(Ordering::Acquire) || cpu.unresponsive.load(Ordering::Acquire) {
                continue;
            }
            let action = match cpu.run_state() {
                RunState::Entering => {
                    self.current.store(index, Ordering::Release);
                    ap_entry(system, self)
                }
                RunState::Running => {
                    self.current.store(index, Ordering::Release);
                    ap_loop_once(system, self)
                }
                _ => continue,
            };
            cpu.set_run_state(match action {
                ApLoopAction::Continue => RunState::Running,
                ApLoopAction::Halt => RunState::Halted,
            });
        }
        self.current.store(previous, Ordering::Release);
    }

    fn deliver(&self, cpu: &SimCpu, icr: IcrValue) {
        match icr.delivery_mode() {
            DeliveryMode::Init => cpu.set_run_state(RunState::WaitForSipi),
            DeliveryMode::Startup
                if cpu.run_state() == RunState::WaitForSipi && icr.vector() == self.arena.sipi_vector() =>
            {
                cpu.set_run_state(RunState::Entering)
            }
            _ => {}
        }
    }
}

impl Hal for SimPlatform {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        self.current_cpu().hal.cpuid(leaf, subleaf)
    }

    fn read_msr(&self, msr: u32) -> u64 {
        self.current_cpu().hal.read_msr(msr)
    }

    fn write_msr(&self, msr: u32, value: u64) {
        self.current_cpu().hal.write_msr(msr, value)
    }

    fn disable_cache(&self) -> CacheControlState {
        self.current_cpu().hal.disable_cache()
    }

    fn restore_cache(&self, saved: CacheControlState) {
        self.current_cpu().hal.restore_cache(saved)
    }
}

impl MpPlatform for SimPlatform {
    fn send_ipi(&self, icr: IcrValue) {
        self.ipis.lock().push(icr);
        let sender = self.current.load(Ordering::Acquire);
        let main = self.main.load(Ordering::Acquire);
        for (index, cpu) in self.cpus.iter().enumerate() {
            if index == sender || index == main || cpu.unresponsive.load(Ordering::Acquire) {
                continue;
            }
            let targeted = match icr.shorthand() {
                Shorthand::AllExcludingSelf | Shorthand::AllIncludingSelf => true,
                Shorthand::None => cpu.apic_id as u8 == icr.destination(),
                Shorthand::ToSelf => false,
            };
            if targeted {
                self.deliver(cpu, icr);
            }
        }
    }

    fn stall(&self, microseconds: u64) {
        self.tsc.fetch_add(microseconds.saturating_mul(SIM_TSC_PER_US), Ordering::AcqRel);
        let Some(system) = self.system.get() else {
            return;
        };
        if self.stepping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.step(system);
        self.stepping.store(false, Ordering::Release);
    }

    fn read_tsc(&self) -> u64 {
        self.tsc.load(Ordering::Acquire)
    }

    fn self_test_result(&self) -> u32 {
        self.current_cpu().bist.load(Ordering::Acquire)
    }

    fn init_fpu(&self) {
        self.current_cpu().fpu_inits.fetch_add(1, Ordering::AcqRel);
    }

    fn disable_interrupts(&self) -> bool {
        self.current_cpu().interrupts.swap(false, Ordering::AcqRel)
    }

    fn restore_interrupts(&self, enabled: bool) {
        self.current_cpu().interrupts.store(enabled, Ordering::Release);
    }

    fn save_context(&self) -> CpuContext {
        let index = self.current.load(Ordering::Acquire) as u64;
        CpuContext {
            rsp: SIM_STACK_BASE + index * 0x1000,
            rflags: if self.current_cpu().interrupts.load(Ordering::Acquire) { 0x202 } else { 0x2 },
            cr0: 0x8000_0033,
            cr3: SIM_CR3,
            cr4: 0x668,
            gdtr_base: 0x7000,
            gdtr_limit: 0x47,
            idtr_base: 0x6000,
            idtr_limit: 0xFFF,
        }
    }

    fn exchange_context(&self, save: &mut CpuContext, load: &CpuContext) {
        *save = self.save_context();
        let Some(target) =
            (0..self.cpus.len()).find(|index| SIM_STACK_BASE + *index as u64 * 0x1000 == load.rsp)
        else {
            log::error!("No processor owns context rsp {:#x}", load.rsp);
            return;
        };
        let old = self.main.swap(target, Ordering::AcqRel);
        self.cpus[old].set_run_state(RunState::Running);
        self.cpus[target].set_run_state(RunState::Main);
        self.current.store(target, Ordering::Release);
    }

    fn startup_stub(&self) -> &[u8] {
        &SIM_STARTUP_STUB
    }

    fn arena(&self) -> &LowMemoryArena {
        &self.arena
    }

    fn attach_system_data(&self, system: &Arc<MpSystemData>) {
        self.system.call_once(|| system.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wakeup::send_init_sipi_sipi;
    use crate::platform::Destination;

    #[test]
    fn test_rejects_bad_processor_sets() {
        assert!(SimPlatform::new(&[]).is_err());
        assert!(SimPlatform::new(&[0, 1, 1]).is_err());
    }

    #[test]
    fn test_reports_topology() {
        let sim = SimPlatform::new(&[0, 0x12]).unwrap();
        assert_eq!(sim.apic_id(), 0);
        assert!(sim.is_bsp_flag_set());
        sim.run_as(0x12, || {
            assert_eq!(sim.apic_id(), 0x12);
            assert!(!sim.is_bsp_flag_set());
            assert_eq!(crate::wakeup::processor_location(&sim), sim_location(0x12));
        });
        assert_eq!(crate::wakeup::hardware_thread_count(&sim), 2);
    }

    #[test]
    fn test_ipi_delivery() {
        let sim = SimPlatform::new(&[0, 1, 2]).unwrap();
        sim.set_unresponsive(2, true);
        send_init_sipi_sipi(&sim, Destination::AllExcludingSelf);

        assert_eq!(sim.ipi_log().len(), 3);
        assert_eq!(sim.cpus[1].run_state(), RunState::Entering);
        assert_eq!(sim.cpus[2].run_state(), RunState::WaitForInit);
        assert_eq!(sim.cpus[0].run_state(), RunState::Main);

        // A start-up IPI at the wrong page does nothing.
        sim.send_ipi(IcrValue::init(Shorthand::None, 1));
        sim.send_ipi(IcrValue::startup(Shorthand::None, 1, 0x10));
        assert_eq!(sim.cpus[1].run_state(), RunState::WaitForSipi);
    }
}
