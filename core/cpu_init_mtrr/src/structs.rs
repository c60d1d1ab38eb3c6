//! MTRR register layouts and the software shadow of the full MTRR state.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use bitfield_struct::bitfield;
use cpu_init_sdk::base::{SIZE_16KB, SIZE_4KB, SIZE_512KB, SIZE_640KB, SIZE_64KB, SIZE_768KB};

/// IA32_MTRRCAP
pub const MSR_IA32_MTRRCAP: u32 = 0x0FE;
/// IA32_MTRR_DEF_TYPE
pub const MSR_IA32_MTRR_DEF_TYPE: u32 = 0x2FF;
/// IA32_MTRR_PHYSBASE0. PHYSBASEn is `MSR_IA32_MTRR_PHYSBASE0 + 2 * n`.
pub const MSR_IA32_MTRR_PHYSBASE0: u32 = 0x200;
/// IA32_MTRR_PHYSMASK0. PHYSMASKn is `MSR_IA32_MTRR_PHYSMASK0 + 2 * n`.
pub const MSR_IA32_MTRR_PHYSMASK0: u32 = 0x201;
/// IA32_MTRR_FIX64K_00000
pub const MSR_IA32_MTRR_FIX64K_00000: u32 = 0x250;
/// IA32_MTRR_FIX16K_80000
pub const MSR_IA32_MTRR_FIX16K_80000: u32 = 0x258;
/// IA32_MTRR_FIX16K_A0000
pub const MSR_IA32_MTRR_FIX16K_A0000: u32 = 0x259;
/// IA32_MTRR_FIX4K_C0000. The 4K group runs contiguously up to `IA32_MTRR_FIX4K_F8000` at 0x26F.
pub const MSR_IA32_MTRR_FIX4K_C0000: u32 = 0x268;

/// Valid bit of a PHYSMASK register.
pub const MTRR_LIB_MSR_VALID_MASK: u64 = 1 << 11;
/// Memory type field of a PHYSBASE register.
pub const MTRR_LIB_CACHE_TYPE_MASK: u64 = 0xFF;

/// Number of fixed range MTRR MSRs.
pub const MTRR_NUMBER_OF_FIXED_MTRR: usize = 11;
/// Upper bound of variable MTRR pairs tracked in [MtrrVariableSettings].
pub const MTRR_NUMBER_OF_VARIABLE_MTRR: usize = 32;
/// Each fixed MSR holds eight one byte slots.
pub const FIXED_MTRR_SLOTS: usize = 8;

/// Physical address width assumed when CPUID 0x80000008 is not available.
pub const DEFAULT_PHYSICAL_ADDRESS_BITS: u32 = 36;

/// Memory cache types an MTRR can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MtrrMemoryCacheType {
    Uncacheable = 0,
    WriteCombining = 1,
    WriteThrough = 4,
    WriteProtected = 5,
    WriteBack = 6,
    /// Any encoding the architecture reserves.
    Invalid = 0xFF,
}

impl From<u8> for MtrrMemoryCacheType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Uncacheable,
            1 => Self::WriteCombining,
            4 => Self::WriteThrough,
            5 => Self::WriteProtected,
            6 => Self::WriteBack,
            _ => Self::Invalid,
        }
    }
}

impl From<u64> for MtrrMemoryCacheType {
    fn from(value: u64) -> Self {
        Self::from((value & MTRR_LIB_CACHE_TYPE_MASK) as u8)
    }
}

impl core::fmt::Display for MtrrMemoryCacheType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let short = match self {
            Self::Uncacheable => "UC",
            Self::WriteCombining => "WC",
            Self::WriteThrough => "WT",
            Self::WriteProtected => "WP",
            Self::WriteBack => "WB",
            Self::Invalid => "??",
        };
        f.write_str(short)
    }
}

/// IA32_MTRRCAP layout.
#[bitfield(u64)]
pub struct MsrIa32MtrrCap {
    /// Number of variable range pairs.
    pub vcnt: u8,
    /// Fixed range MTRRs are supported.
    pub fix: bool,
    __: bool,
    /// Write combining is supported.
    pub wc: bool,
    pub smrr: bool,
    #[bits(52)]
    __: u64,
}

/// IA32_MTRR_DEF_TYPE layout.
#[bitfield(u64)]
pub struct MsrIa32MtrrDefType {
    /// Memory type used where no MTRR matches.
    pub mem_type: u8,
    #[bits(2)]
    __: u8,
    /// Fixed range enable.
    pub fe: bool,
    /// MTRR enable.
    pub e: bool,
    #[bits(52)]
    __: u64,
}

/// Location and slot geometry of one fixed range MTRR MSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedMtrr {
    pub msr: u32,
    pub base_address: u64,
    pub slot_length: u64,
}

impl FixedMtrr {
    /// One past the last address this MSR covers.
    pub const fn end(&self) -> u64 {
        self.base_address + self.slot_length * FIXED_MTRR_SLOTS as u64
    }
}

/// The fixed MSRs in address order. Together they cover `[0, 1MB)`.
pub const FIXED_MTRR_TABLE: [FixedMtrr; MTRR_NUMBER_OF_FIXED_MTRR] = [
    FixedMtrr { msr: MSR_IA32_MTRR_FIX64K_00000, base_address: 0, slot_length: SIZE_64KB },
    FixedMtrr { msr: MSR_IA32_MTRR_FIX16K_80000, base_address: SIZE_512KB, slot_length: SIZE_16KB },
    FixedMtrr { msr: MSR_IA32_MTRR_FIX16K_A0000, base_address: SIZE_640KB, slot_length: SIZE_16KB },
    FixedMtrr { msr: MSR_IA32_MTRR_FIX4K_C0000, base_address: SIZE_768KB, slot_length: SIZE_4KB },
    FixedMtrr { msr: MSR_IA32_MTRR_FIX4K_C0000 + 1, base_address: SIZE_768KB + 0x8000, slot_length: SIZE_4KB },
    FixedMtrr { msr: MSR_IA32_MTRR_FIX4K_C0000 + 2, base_address: SIZE_768KB + 0x10000, slot_length: SIZE_4KB },
    FixedMtrr { msr: MSR_IA32_MTRR_FIX4K_C0000 + 3, base_address: SIZE_768KB + 0x18000, slot_length: SIZE_4KB },
    FixedMtrr { msr: MSR_IA32_MTRR_FIX4K_C0000 + 4, base_address: SIZE_768KB + 0x20000, slot_length: SIZE_4KB },
    FixedMtrr { msr: MSR_IA32_MTRR_FIX4K_C0000 + 5, base_address: SIZE_768KB + 0x28000, slot_length: SIZE_4KB },
    FixedMtrr { msr: MSR_IA32_MTRR_FIX4K_C0000 + 6, base_address: SIZE_768KB + 0x30000, slot_length: SIZE_4KB },
    FixedMtrr { msr: MSR_IA32_MTRR_FIX4K_C0000 + 7, base_address: SIZE_768KB + 0x38000, slot_length: SIZE_4KB },
];

/// Raw PHYSBASE/PHYSMASK pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MtrrVariableSetting {
    pub base: u64,
    pub mask: u64,
}

impl MtrrVariableSetting {
    pub const fn is_valid(&self) -> bool {
        self.mask & MTRR_LIB_MSR_VALID_MASK != 0
    }

    pub fn mem_type(&self) -> MtrrMemoryCacheType {
        MtrrMemoryCacheType::from(self.base)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MtrrFixedSettings {
    pub mtrr: [u64; MTRR_NUMBER_OF_FIXED_MTRR],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MtrrVariableSettings {
    pub mtrr: [MtrrVariableSetting; MTRR_NUMBER_OF_VARIABLE_MTRR],
}

/// Snapshot of every MTRR MSR of one processor.
///
/// The BSP's snapshot is what every AP loads when the cache configuration is re-synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MtrrSettings {
    pub fixed: MtrrFixedSettings,
    pub variables: MtrrVariableSettings,
    pub mtrr_def_type: u64,
}

impl MtrrSettings {
    pub fn def_type(&self) -> MsrIa32MtrrDefType {
        MsrIa32MtrrDefType::from_bits(self.mtrr_def_type)
    }
}

/// A decoded memory range with a single cache type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtrrMemoryRange {
    pub base_address: u64,
    pub length: u64,
    pub mem_type: MtrrMemoryCacheType,
}

impl MtrrMemoryRange {
    pub const fn new(base_address: u64, length: u64, mem_type: MtrrMemoryCacheType) -> Self {
        Self { base_address, length, mem_type }
    }

    /// Last address inside the range.
    pub const fn end(&self) -> u64 {
        self.base_address + self.length - 1
    }

    pub const fn overlaps(&self, other: &MtrrMemoryRange) -> bool {
        !(self.base_address > other.end() || other.base_address > self.end())
    }

    pub const fn contains(&self, address: u64) -> bool {
        address >= self.base_address && address <= self.end()
    }
}

impl core::fmt::Display for MtrrMemoryRange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{:#014x}, {:#014x}) {}", self.base_address, self.base_address + self.length, self.mem_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_table_is_contiguous() {
        let mut expected = 0;
        for entry in FIXED_MTRR_TABLE.iter() {
            assert_eq!(entry.base_address, expected);
            expected = entry.end();
        }
        assert_eq!(expected, cpu_init_sdk::base::SIZE_1MB);
        assert_eq!(FIXED_MTRR_TABLE[10].msr, 0x26F);
    }

    #[test]
    fn test_register_layouts() {
        let cap = MsrIa32MtrrCap::from_bits(0xD0A);
        assert_eq!(cap.vcnt(), 0x0A);
        assert!(cap.fix());
        assert!(cap.wc());

        let def = MsrIa32MtrrDefType::new().with_mem_type(6).with_e(true);
        assert_eq!(def.into_bits(), 0x806);
        assert!(!def.fe());
    }

    #[test]
    fn test_cache_type_decoding() {
        assert_eq!(MtrrMemoryCacheType::from(0x1_0000_0006u64), MtrrMemoryCacheType::WriteBack);
        assert_eq!(MtrrMemoryCacheType::from(2u8), MtrrMemoryCacheType::Invalid);
    }
}
