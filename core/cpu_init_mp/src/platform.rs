//! Hardware the MP code runs on.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::sync::Arc;

use bitfield_struct::bitfield;
use cpu_init_mtrr::hal::Hal;
use cpu_init_sdk::bit;

use crate::{arena::LowMemoryArena, cpu_data::MpSystemData};

/// IA32_APIC_BASE
pub const MSR_IA32_APIC_BASE: u32 = 0x1B;
/// IA32_APIC_BASE.BSP
pub const APIC_BASE_BSP: u64 = bit!(8);

pub const CPUID_SIGNATURE: u32 = 0x0;
pub const CPUID_VERSION_INFO: u32 = 0x1;
pub const CPUID_CACHE_PARAMS: u32 = 0x4;
pub const CPUID_EXTENDED_TOPOLOGY: u32 = 0xB;

/// ICR delivery modes used by the wake-up protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeliveryMode {
    Fixed = 0,
    Init = 5,
    Startup = 6,
}

impl DeliveryMode {
    const fn into_bits(self) -> u8 {
        self as u8
    }

    const fn from_bits(value: u8) -> Self {
        match value {
            5 => Self::Init,
            6 => Self::Startup,
            _ => Self::Fixed,
        }
    }
}

/// ICR destination shorthands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Shorthand {
    None = 0,
    ToSelf = 1,
    AllIncludingSelf = 2,
    AllExcludingSelf = 3,
}

impl Shorthand {
    const fn into_bits(self) -> u8 {
        self as u8
    }

    const fn from_bits(value: u8) -> Self {
        match value {
            1 => Self::ToSelf,
            2 => Self::AllIncludingSelf,
            3 => Self::AllExcludingSelf,
            _ => Self::None,
        }
    }
}

/// Local APIC interrupt command register, xAPIC layout.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct IcrValue {
    pub vector: u8,
    #[bits(3)]
    pub delivery_mode: DeliveryMode,
    pub logical_destination: bool,
    pub delivery_pending: bool,
    __: bool,
    pub level_assert: bool,
    pub level_triggered: bool,
    #[bits(2)]
    __: u8,
    #[bits(2)]
    pub shorthand: Shorthand,
    #[bits(36)]
    __: u64,
    pub destination: u8,
}

impl IcrValue {
    /// INIT, level assert.
    pub fn init(shorthand: Shorthand, destination: u8) -> Self {
        Self::new()
            .with_delivery_mode(DeliveryMode::Init)
            .with_level_assert(true)
            .with_shorthand(shorthand)
            .with_destination(destination)
    }

    /// Start-up IPI to the 4KB page `vector`.
    pub fn startup(shorthand: Shorthand, destination: u8, vector: u8) -> Self {
        Self::new()
            .with_vector(vector)
            .with_delivery_mode(DeliveryMode::Startup)
            .with_level_assert(true)
            .with_shorthand(shorthand)
            .with_destination(destination)
    }
}

/// Where an IPI goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    AllExcludingSelf,
    ApicId(u32),
}

impl Destination {
    pub fn shorthand(&self) -> (Shorthand, u8) {
        match *self {
            Destination::AllExcludingSelf => (Shorthand::AllExcludingSelf, 0),
            Destination::ApicId(id) => (Shorthand::None, id as u8),
        }
    }
}

/// The processor state swapped between the two sides of a BSP role exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuContext {
    pub rsp: u64,
    pub rflags: u64,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub gdtr_base: u64,
    pub gdtr_limit: u16,
    pub idtr_base: u64,
    pub idtr_limit: u16,
}

/// Everything the MP code needs from the processor it is currently running on.
///
/// Every call acts on the calling processor. On hardware that is implicit. A simulated platform tracks which
/// processor is executing.
pub trait MpPlatform: Hal + Send + Sync {
    /// Initial APIC ID of the calling processor.
    fn apic_id(&self) -> u32 {
        let max_leaf = self.cpuid(CPUID_SIGNATURE, 0).eax;
        if max_leaf >= CPUID_EXTENDED_TOPOLOGY {
            let topology = self.cpuid(CPUID_EXTENDED_TOPOLOGY, 0);
            if topology.ebx & 0xFFFF != 0 {
                return topology.edx;
            }
        }
        self.cpuid(CPUID_VERSION_INFO, 0).ebx >> 24
    }

    /// Whether IA32_APIC_BASE marks the calling processor as the BSP.
    fn is_bsp_flag_set(&self) -> bool {
        self.read_msr(MSR_IA32_APIC_BASE) & APIC_BASE_BSP != 0
    }

    fn set_bsp_flag(&self, bsp: bool) {
        let value = self.read_msr(MSR_IA32_APIC_BASE);
        let value = if bsp { value | APIC_BASE_BSP } else { value & !APIC_BASE_BSP };
        self.write_msr(MSR_IA32_APIC_BASE, value);
    }

    /// Writes the local APIC ICR and waits for delivery.
    fn send_ipi(&self, icr: IcrValue);

    /// Busy waits for at least `microseconds`.
    fn stall(&self, microseconds: u64);

    fn read_tsc(&self) -> u64;

    /// BIST result the calling processor left in EAX at reset.
    fn self_test_result(&self) -> u32;

    /// Pause hint for spin loops.
    fn cpu_pause(&self) {
        core::hint::spin_loop();
    }

    /// FNINIT and the default MXCSR.
    fn init_fpu(&self);

    /// Disables interrupts and returns whether they were enabled.
    fn disable_interrupts(&self) -> bool;

    fn restore_interrupts(&self, enabled: bool);

    /// Captures the calling processor's context.
    fn save_context(&self) -> CpuContext;

    /// Saves the calling processor's context to `save` and continues on `load`.
    ///
    /// The processor that owned `load` must be spinning right after its own [save_context](Self::save_context).
    /// Returns on that processor.
    fn exchange_context(&self, save: &mut CpuContext, load: &CpuContext);

    /// Real mode code the APs start executing.
    fn startup_stub(&self) -> &[u8];

    /// The region the stub and the exchange info live in.
    fn arena(&self) -> &LowMemoryArena;

    /// Called once, before the first AP is woken, with the data every processor shares.
    fn attach_system_data(&self, _system: &Arc<MpSystemData>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icr_encoding() {
        assert_eq!(IcrValue::init(Shorthand::None, 3).into_bits(), 0x0300_0000_0000_4500);
        assert_eq!(IcrValue::startup(Shorthand::None, 3, 0x88).into_bits(), 0x0300_0000_0000_4688);
        assert_eq!(IcrValue::init(Shorthand::AllExcludingSelf, 0).into_bits(), 0x000C_4500);

        let sipi = IcrValue::from_bits(0x000C_4688);
        assert_eq!(sipi.delivery_mode(), DeliveryMode::Startup);
        assert_eq!(sipi.shorthand(), Shorthand::AllExcludingSelf);
        assert_eq!(sipi.vector(), 0x88);
    }

    #[test]
    fn test_destination_shorthand() {
        assert_eq!(Destination::AllExcludingSelf.shorthand(), (Shorthand::AllExcludingSelf, 0));
        assert_eq!(Destination::ApicId(6).shorthand(), (Shorthand::None, 6));
    }
}
