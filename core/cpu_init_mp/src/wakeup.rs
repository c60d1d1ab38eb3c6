//! The wake-up protocol and everything an AP runs.
//!
//! [ap_entry] is where the start-up stub hands over after a start-up IPI. What it does depends on the
//! [ApFunction] the BSP published in the exchange info. [ap_loop_once] is one pass of the procedure loop, the stub
//! keeps calling it until it answers [ApLoopAction::Halt].
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use cpu_init_mtrr::{hal::Hal, mtrr::MtrrLib, Mtrr};
use cpu_init_sdk::bit_field;

use crate::{
    arena::{bist_slot, exchange_info, ApFunction, WakeUpManner},
    cpu_data::{CpuState, MpSystemData, ProcessorLocation},
    exchange_role,
    platform::{
        Destination, IcrValue, MpPlatform, CPUID_CACHE_PARAMS, CPUID_EXTENDED_TOPOLOGY, CPUID_SIGNATURE,
        CPUID_VERSION_INFO,
    },
    ApLoopAction,
};

/// Delay between INIT and the first start-up IPI.
pub const INIT_TO_SIPI_DELAY_US: u64 = 10_000;
/// Delay between the two start-up IPIs.
pub const SIPI_TO_SIPI_DELAY_US: u64 = 200;

const TOPOLOGY_LEVEL_SMT: u32 = 1;
const TOPOLOGY_LEVEL_CORE: u32 = 2;

/// INIT, 10ms, start-up IPI, 200us, start-up IPI.
pub fn send_init_sipi_sipi<P: MpPlatform + ?Sized>(platform: &P, destination: Destination) {
    let (shorthand, apic_id) = destination.shorthand();
    let vector = platform.arena().sipi_vector();
    platform.send_ipi(IcrValue::init(shorthand, apic_id));
    platform.stall(INIT_TO_SIPI_DELAY_US);
    platform.send_ipi(IcrValue::startup(shorthand, apic_id, vector));
    platform.stall(SIPI_TO_SIPI_DELAY_US);
    platform.send_ipi(IcrValue::startup(shorthand, apic_id, vector));
}

/// Sends only the INIT, leaving the target waiting for a start-up IPI.
pub fn send_init<P: MpPlatform + ?Sized>(platform: &P, destination: Destination) {
    let (shorthand, apic_id) = destination.shorthand();
    platform.send_ipi(IcrValue::init(shorthand, apic_id));
}

/// Sends a single start-up IPI at the stub.
pub fn send_startup<P: MpPlatform + ?Sized>(platform: &P, destination: Destination) {
    let (shorthand, apic_id) = destination.shorthand();
    platform.send_ipi(IcrValue::startup(shorthand, apic_id, platform.arena().sipi_vector()));
}

/// Makes processor `number` look at its state again.
pub fn wake_up_ap<P: MpPlatform + ?Sized>(platform: &P, system: &MpSystemData, number: usize) {
    let Some(cpu) = system.cpu(number) else {
        return;
    };
    match system.wakeup_manner() {
        WakeUpManner::HltLoop => send_init_sipi_sipi(platform, Destination::ApicId(cpu.apic_id())),
        WakeUpManner::MwaitLoop | WakeUpManner::RunLoop => cpu.signal_start(),
    }
}

/// Logical processors the package reports, at least 1.
pub fn hardware_thread_count<H: Hal + ?Sized>(hal: &H) -> usize {
    if hal.cpuid(CPUID_SIGNATURE, 0).eax >= CPUID_EXTENDED_TOPOLOGY {
        let count = hal.cpuid(CPUID_EXTENDED_TOPOLOGY, 1).ebx & 0xFFFF;
        if count != 0 {
            return count as usize;
        }
    }
    (bit_field!(hal.cpuid(CPUID_VERSION_INFO, 0).ebx, 23, 16) as usize).max(1)
}

fn bits_for(count: u32) -> u32 {
    match count {
        0 | 1 => 0,
        n => u32::BITS - (n - 1).leading_zeros(),
    }
}

fn low_mask(bits: u32) -> u32 {
    match bits {
        0 => 0,
        b if b >= u32::BITS => u32::MAX,
        b => (1 << b) - 1,
    }
}

/// Package, core and thread of the calling processor, from CPUID leaf 0xB or, lacking it, leaves 1 and 4.
pub fn processor_location<H: Hal + ?Sized>(hal: &H) -> ProcessorLocation {
    let max_leaf = hal.cpuid(CPUID_SIGNATURE, 0).eax;

    let (apic_id, thread_bits, core_bits) =
        if max_leaf >= CPUID_EXTENDED_TOPOLOGY && hal.cpuid(CPUID_EXTENDED_TOPOLOGY, 0).ebx & 0xFFFF != 0 {
            let apic_id = hal.cpuid(CPUID_EXTENDED_TOPOLOGY, 0).edx;
            let (mut thread_bits, mut package_shift) = (0, 0);
            for subleaf in 0..8 {
                let level = hal.cpuid(CPUID_EXTENDED_TOPOLOGY, subleaf);
                let shift = bit_field!(level.eax, 4, 0) as u32;
                match bit_field!(level.ecx, 15, 8) as u32 {
                    0 => break,
                    TOPOLOGY_LEVEL_SMT => thread_bits = shift,
                    TOPOLOGY_LEVEL_CORE => package_shift = shift,
                    _ => {}
                }
            }
            (apic_id, thread_bits, package_shift.saturating_sub(thread_bits))
        } else {
            let version = hal.cpuid(CPUID_VERSION_INFO, 0);
            let logical = (bit_field!(version.ebx, 23, 16) as u32).max(1);
            let cores = match max_leaf >= CPUID_CACHE_PARAMS {
                true => bit_field!(hal.cpuid(CPUID_CACHE_PARAMS, 0).eax, 31, 26) as u32 + 1,
                false => 1,
            };
            (bit_field!(version.ebx, 31, 24) as u32, bits_for((logical / cores).max(1)), bits_for(cores))
        };

    ProcessorLocation {
        package: apic_id.checked_shr(thread_bits + core_bits).unwrap_or(0),
        core: (apic_id >> thread_bits) & low_mask(core_bits),
        thread: apic_id & low_mask(thread_bits),
    }
}

/// Where the start-up stub lands.
pub fn ap_entry<P: MpPlatform + ?Sized>(system: &MpSystemData, platform: &P) -> ApLoopAction {
    let arena = platform.arena();
    match ApFunction::from_raw(arena.read(exchange_info::AP_FUNCTION)) {
        Some(ApFunction::CountProcessors) => {
            let sequence = arena.fetch_add(exchange_info::CLAIM_COUNTER, 1) as usize;
            if let Some(slot) = bist_slot(sequence) {
                arena.write(slot, (platform.self_test_result() as u64) << 32 | platform.apic_id() as u64);
            }
            ApLoopAction::Halt
        }
        Some(ApFunction::DetailedInit) => detailed_init(system, platform),
        Some(ApFunction::ProcedureLoop) => ap_loop_once(system, platform),
        Some(ApFunction::Park) | None => ApLoopAction::Halt,
    }
}

fn detailed_init<P: MpPlatform + ?Sized>(system: &MpSystemData, platform: &P) -> ApLoopAction {
    let Some(cpu) = system.find_by_apic_id(platform.apic_id()).and_then(|number| system.cpu(number)) else {
        return ApLoopAction::Halt;
    };
    if cpu.state.get() == CpuState::Disabled {
        return ApLoopAction::Halt;
    }

    platform.init_fpu();
    if let Some(snapshot) = system.mtrr_snapshot() {
        MtrrLib::new(platform, system.reserved_variable_mtrrs()).set_all_mtrrs(&snapshot);
    }
    cpu.set_location(processor_location(platform));
    platform.arena().fetch_add(exchange_info::INIT_FINISHED, 1);

    ap_loop_once(system, platform)
}

/// One pass of the procedure loop.
pub fn ap_loop_once<P: MpPlatform + ?Sized>(system: &MpSystemData, platform: &P) -> ApLoopAction {
    let Some(number) = system.find_by_apic_id(platform.apic_id()) else {
        return ApLoopAction::Halt;
    };
    let Some(cpu) = system.cpu(number) else {
        return ApLoopAction::Halt;
    };

    if let Some(action) = exchange_role::service_ap_side(system, platform, number) {
        return action;
    }

    let manner = system.wakeup_manner();
    if cpu.state.get() == CpuState::Ready
        && (manner == WakeUpManner::HltLoop || cpu.take_start_signal())
        && cpu.state.transition(CpuState::Ready, CpuState::Busy)
    {
        if let Some(task) = cpu.task() {
            task(number);
        }
        // A reset may have moved the state on while the task ran.
        if !cpu.state.transition(CpuState::Busy, CpuState::Finished) {
            log::warn!("CPU {number}: finished after being reset, result dropped");
        }
    }

    match manner {
        WakeUpManner::HltLoop => ApLoopAction::Halt,
        WakeUpManner::MwaitLoop | WakeUpManner::RunLoop => {
            platform.cpu_pause();
            ApLoopAction::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use cpu_init_mtrr::{hal::CpuidResult, hal::SimulatedHal, structs::MtrrMemoryCacheType};

    use super::*;

    fn hal() -> SimulatedHal {
        SimulatedHal::new(8, 39, MtrrMemoryCacheType::Uncacheable)
    }

    #[test]
    fn test_location_from_extended_topology() {
        let hal = hal();
        hal.set_cpuid(CPUID_SIGNATURE, 0, CpuidResult { eax: 0xB, ..Default::default() });
        // 2 threads per core, 4 cores per package, APIC ID 0b1_11_1.
        hal.set_cpuid(CPUID_EXTENDED_TOPOLOGY, 0, CpuidResult { eax: 1, ebx: 2, ecx: 0x100, edx: 0xF });
        hal.set_cpuid(CPUID_EXTENDED_TOPOLOGY, 1, CpuidResult { eax: 3, ebx: 8, ecx: 0x201, edx: 0xF });

        assert_eq!(processor_location(&hal), ProcessorLocation { package: 1, core: 3, thread: 1 });
        assert_eq!(hardware_thread_count(&hal), 8);
    }

    #[test]
    fn test_location_from_legacy_leaves() {
        let hal = hal();
        hal.set_cpuid(CPUID_SIGNATURE, 0, CpuidResult { eax: 0x4, ..Default::default() });
        // 4 logical processors over 4 cores, APIC ID 6.
        hal.set_cpuid(CPUID_VERSION_INFO, 0, CpuidResult { ebx: 0x0604_0000, edx: 1 << 12, ..Default::default() });
        hal.set_cpuid(CPUID_CACHE_PARAMS, 0, CpuidResult { eax: 3 << 26, ..Default::default() });

        assert_eq!(processor_location(&hal), ProcessorLocation { package: 1, core: 2, thread: 0 });
        assert_eq!(hardware_thread_count(&hal), 4);
    }

    #[test]
    fn test_location_without_topology_leaves() {
        let hal = hal();
        assert_eq!(processor_location(&hal), ProcessorLocation::default());
        assert_eq!(hardware_thread_count(&hal), 1);
    }

    #[test]
    fn test_bit_helpers() {
        assert_eq!(bits_for(1), 0);
        assert_eq!(bits_for(2), 1);
        assert_eq!(bits_for(3), 2);
        assert_eq!(bits_for(8), 3);
        assert_eq!(low_mask(0), 0);
        assert_eq!(low_mask(3), 0b111);
        assert_eq!(low_mask(32), u32::MAX);
    }
}
