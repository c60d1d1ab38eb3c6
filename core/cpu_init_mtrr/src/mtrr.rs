//! MTRR library.
//!
//! All programming is done against a software copy of the MTRR state ([MtrrSettings]). Only when the requested
//! change has been fully resolved on the copy are the registers that differ from hardware written, inside a single
//! cache quiesce window. A failing request therefore never leaves the hardware half programmed.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;

use cpu_init_sdk::base::{is_aligned, natural_alignment, power2_floor, SIZE_1MB, SIZE_4KB};

use crate::{
    error::{MtrrError, MtrrResult},
    hal::Hal,
    structs::{
        MsrIa32MtrrCap, MsrIa32MtrrDefType, MtrrMemoryCacheType, MtrrMemoryRange, MtrrSettings, MtrrVariableSetting,
        DEFAULT_PHYSICAL_ADDRESS_BITS, FIXED_MTRR_SLOTS, FIXED_MTRR_TABLE, MSR_IA32_MTRRCAP, MSR_IA32_MTRR_DEF_TYPE,
        MSR_IA32_MTRR_PHYSBASE0, MSR_IA32_MTRR_PHYSMASK0, MTRR_LIB_CACHE_TYPE_MASK, MTRR_LIB_MSR_VALID_MASK,
        MTRR_NUMBER_OF_FIXED_MTRR, MTRR_NUMBER_OF_VARIABLE_MTRR,
    },
    Mtrr,
};

const CPUID_VERSION_INFO: u32 = 0x1;
const CPUID_EXTENDED_FUNCTION: u32 = 0x8000_0000;
const CPUID_VIR_PHY_ADDRESS_SIZE: u32 = 0x8000_0008;
const CPUID_1_EDX_MTRR: u32 = 1 << 12;

/// MTRR programming for one processor.
pub struct MtrrLib<H: Hal> {
    hal: H,
    mtrr_supported: bool,
    fixed_supported: bool,
    wc_supported: bool,
    variable_mtrr_count: usize,
    reserved_variable_mtrr_count: usize,
    physical_address_bits: u32,
}

/// How a span is decomposed into variable MTRRs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Power of two chunks laid end to end.
    Positive,
    /// One covering power of two range with the excess carved out as uncacheable.
    Subtractive { covering_length: u64 },
}

impl<H: Hal> MtrrLib<H> {
    /// Probes the processor through `hal`. `reserved_variable_mtrr_count` registers at the top of the variable set
    /// are left to the OS and never touched.
    pub fn new(hal: H, reserved_variable_mtrr_count: usize) -> Self {
        let mtrr_supported = hal.cpuid(CPUID_VERSION_INFO, 0).edx & CPUID_1_EDX_MTRR != 0;

        let (fixed_supported, wc_supported, variable_mtrr_count) = if mtrr_supported {
            let cap = MsrIa32MtrrCap::from_bits(hal.read_msr(MSR_IA32_MTRRCAP));
            (cap.fix(), cap.wc(), (cap.vcnt() as usize).min(MTRR_NUMBER_OF_VARIABLE_MTRR))
        } else {
            (false, false, 0)
        };

        let physical_address_bits = if hal.cpuid(CPUID_EXTENDED_FUNCTION, 0).eax >= CPUID_VIR_PHY_ADDRESS_SIZE {
            match hal.cpuid(CPUID_VIR_PHY_ADDRESS_SIZE, 0).eax & 0xFF {
                0 => DEFAULT_PHYSICAL_ADDRESS_BITS,
                bits => bits.min(52),
            }
        } else {
            DEFAULT_PHYSICAL_ADDRESS_BITS
        };

        Self {
            hal,
            mtrr_supported,
            fixed_supported,
            wc_supported,
            variable_mtrr_count,
            reserved_variable_mtrr_count,
            physical_address_bits,
        }
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// Number of variable MTRR pairs the processor implements.
    pub fn variable_mtrr_count(&self) -> usize {
        self.variable_mtrr_count
    }

    /// Number of variable MTRR pairs firmware may allocate.
    pub fn firmware_variable_mtrr_count(&self) -> usize {
        self.variable_mtrr_count.saturating_sub(self.reserved_variable_mtrr_count)
    }

    pub fn physical_address_bits(&self) -> u32 {
        self.physical_address_bits
    }

    /// Memory type applied where no MTRR matches.
    pub fn default_memory_type(&self) -> MtrrMemoryCacheType {
        if !self.mtrr_supported {
            return MtrrMemoryCacheType::Uncacheable;
        }
        MtrrMemoryCacheType::from(MsrIa32MtrrDefType::from_bits(self.hal.read_msr(MSR_IA32_MTRR_DEF_TYPE)).mem_type())
    }

    fn valid_bits_mask(&self) -> u64 {
        (1u64 << self.physical_address_bits) - 1
    }

    fn valid_address_mask(&self) -> u64 {
        self.valid_bits_mask() & !(SIZE_4KB - 1)
    }

    fn read_settings(&self) -> MtrrSettings {
        let mut settings = MtrrSettings::default();
        if self.fixed_supported {
            for (value, entry) in settings.fixed.mtrr.iter_mut().zip(FIXED_MTRR_TABLE.iter()) {
                *value = self.hal.read_msr(entry.msr);
            }
        }
        for (index, var) in settings.variables.mtrr.iter_mut().take(self.variable_mtrr_count).enumerate() {
            var.base = self.hal.read_msr(MSR_IA32_MTRR_PHYSBASE0 + 2 * index as u32);
            var.mask = self.hal.read_msr(MSR_IA32_MTRR_PHYSMASK0 + 2 * index as u32);
        }
        settings.mtrr_def_type = self.hal.read_msr(MSR_IA32_MTRR_DEF_TYPE);
        settings
    }

    /// Decodes a variable MTRR pair into a range, or None when the pair is not valid.
    fn decode(&self, var: &MtrrVariableSetting) -> Option<MtrrMemoryRange> {
        if !var.is_valid() {
            return None;
        }
        let base_address = var.base & self.valid_address_mask();
        let length = (!(var.mask & self.valid_address_mask()) & self.valid_bits_mask()) + 1;
        Some(MtrrMemoryRange::new(base_address, length, var.mem_type()))
    }

    fn encode(&self, base_address: u64, length: u64, mem_type: MtrrMemoryCacheType) -> MtrrVariableSetting {
        MtrrVariableSetting {
            base: (base_address & self.valid_address_mask()) | mem_type as u64,
            mask: (!(length - 1) & self.valid_address_mask()) | MTRR_LIB_MSR_VALID_MASK,
        }
    }

    fn validate(&self, base_address: u64, length: u64, mem_type: MtrrMemoryCacheType) -> MtrrResult<()> {
        if !self.mtrr_supported {
            return Err(MtrrError::MtrrNotSupported);
        }
        if length == 0 || mem_type == MtrrMemoryCacheType::Invalid {
            return Err(MtrrError::InvalidParameter);
        }
        let end = base_address.checked_add(length).ok_or(MtrrError::InvalidParameter)?;
        if base_address & !self.valid_address_mask() != 0
            || length & !self.valid_address_mask() != 0
            || end > self.valid_bits_mask() + 1
        {
            return Err(MtrrError::AddressNotAligned);
        }
        if mem_type == MtrrMemoryCacheType::WriteCombining && !self.wc_supported {
            return Err(MtrrError::MemoryTypeNotSupported);
        }
        Ok(())
    }

    /// Resolves one request on the shadow `settings`.
    fn apply(
        &self,
        settings: &mut MtrrSettings,
        base_address: u64,
        length: u64,
        mem_type: MtrrMemoryCacheType,
    ) -> MtrrResult<()> {
        self.validate(base_address, length, mem_type)?;

        let mut base = base_address;
        let mut length = length;

        if base < SIZE_1MB {
            if !self.fixed_supported {
                return Err(MtrrError::FixedRangeMtrrBaseAddressNotAligned);
            }
            Self::program_fixed_mtrr(settings, mem_type, &mut base, &mut length)?;
            let def = settings.def_type().with_fe(true).with_e(true);
            settings.mtrr_def_type = def.into_bits();
            if length == 0 {
                return Ok(());
            }
        }

        // The fixed MTRRs override everything below 1MB, so a range starting there can be widened down to zero.
        if base == SIZE_1MB && self.fixed_supported && settings.def_type().fe() {
            base = 0;
            length += SIZE_1MB;
        }

        self.program_variable_mtrr(settings, base, length, mem_type)
    }

    /// Folds `[base, base+length)` below 1MB into the fixed MTRR shadow. On return `base`/`length` describe whatever
    /// part of the request lies at or above 1MB.
    fn program_fixed_mtrr(
        settings: &mut MtrrSettings,
        mem_type: MtrrMemoryCacheType,
        base: &mut u64,
        length: &mut u64,
    ) -> MtrrResult<()> {
        while *base < SIZE_1MB && *length > 0 {
            let (index, entry) = FIXED_MTRR_TABLE
                .iter()
                .enumerate()
                .find(|(_, entry)| *base >= entry.base_address && *base < entry.end())
                .ok_or(MtrrError::FixedRangeMtrrBaseAddressNotAligned)?;

            let offset = *base - entry.base_address;
            if offset % entry.slot_length != 0 {
                return Err(MtrrError::FixedRangeMtrrBaseAddressNotAligned);
            }

            let mut slot = (offset / entry.slot_length) as usize;
            let mut or_mask = 0u64;
            let mut clear_mask = 0u64;
            while slot < FIXED_MTRR_SLOTS && *length >= entry.slot_length {
                or_mask |= (mem_type as u64) << (slot * 8);
                clear_mask |= MTRR_LIB_CACHE_TYPE_MASK << (slot * 8);
                *base += entry.slot_length;
                *length -= entry.slot_length;
                slot += 1;
            }

            if slot < FIXED_MTRR_SLOTS && *length > 0 {
                return Err(MtrrError::FixedRangeMtrrLengthNotAligned);
            }

            settings.fixed.mtrr[index] = (settings.fixed.mtrr[index] & !clear_mask) | or_mask;
        }
        Ok(())
    }

    fn firmware_ranges(&self, settings: &MtrrSettings) -> Vec<MtrrMemoryRange> {
        let count = self.firmware_variable_mtrr_count();
        settings.variables.mtrr.iter().take(count).filter_map(|var| self.decode(var)).collect()
    }

    fn overlaps_any(&self, settings: &MtrrSettings, request: &MtrrMemoryRange) -> bool {
        self.firmware_ranges(settings).iter().any(|range| range.overlaps(request))
    }

    /// Merges the request with existing variable ranges.
    ///
    /// Same type ranges that contain the request make it a no-op (length set to 0). Same type ranges the request
    /// covers, and any range the original request covers, are invalidated. Same type ranges that overlap or adjoin
    /// the request are unioned into it and the scan restarts. A different type range that overlaps the original
    /// request is only tolerated when the request takes precedence over it, otherwise it would shadow part of the
    /// request. Different type ranges reached only through a union keep describing memory outside the request.
    fn combine_memory_attribute(
        &self,
        settings: &mut MtrrSettings,
        mem_type: MtrrMemoryCacheType,
        base: &mut u64,
        length: &mut u64,
    ) -> MtrrResult<()> {
        let count = self.firmware_variable_mtrr_count();
        let mut covered_by_existing = false;
        let mut end = *base + *length - 1;
        let (request_base, request_end) = (*base, end);
        let mut index = 0;

        while index < count {
            let Some(range) = self.decode(&settings.variables.mtrr[index]) else {
                index += 1;
                continue;
            };
            let range_end = range.end();
            let overlaps = !(*base > range_end || end < range.base_address);
            let adjoins = range_end.checked_add(1) == Some(*base) || end.checked_add(1) == Some(range.base_address);
            let same_type = range.mem_type == mem_type;
            let touches_request = !(request_base > range_end || request_end < range.base_address);
            let inside_request = request_base <= range.base_address && request_end >= range_end;

            if (!overlaps && !adjoins) || (!same_type && !touches_request) {
                index += 1;
                continue;
            }

            if overlaps && same_type && range.base_address <= *base && range_end >= end {
                // Keep scanning so higher precedence ranges inside the request still get invalidated.
                covered_by_existing = true;
                index += 1;
                continue;
            }

            if overlaps && *base <= range.base_address && end >= range_end && (same_type || inside_request) {
                log::trace!("MTRR{index} {range} covered by request, invalidated");
                settings.variables.mtrr[index] = MtrrVariableSetting::default();
                index += 1;
                continue;
            }

            if same_type {
                if covered_by_existing {
                    index += 1;
                    continue;
                }
                *base = (*base).min(range.base_address);
                end = end.max(range_end);
                *length = end - *base + 1;
                log::trace!("MTRR{index} {range} merged, request now [{:#x}, {:#x}]", *base, end);
                settings.variables.mtrr[index] = MtrrVariableSetting::default();
                index = 0;
                continue;
            }

            if !overlaps || Self::takes_precedence(mem_type, range.mem_type) {
                index += 1;
                continue;
            }

            log::error!("MTRR request {} [{:#x}, {:#x}] conflicts with MTRR{index} {range}", mem_type, *base, end);
            return Err(MtrrError::IncompatibleOverlap);
        }

        if covered_by_existing {
            *length = 0;
        }
        Ok(())
    }

    /// Whether `request` wins where it overlaps a range of type `existing`. UC wins over anything and WT over WB.
    fn takes_precedence(request: MtrrMemoryCacheType, existing: MtrrMemoryCacheType) -> bool {
        use MtrrMemoryCacheType::*;
        matches!((request, existing), (Uncacheable, _) | (WriteThrough, WriteBack))
    }

    /// Registers needed when laying power of two chunks end to end from `base`.
    fn positive_mtrr_count(base: u64, length: u64) -> usize {
        let mut base = base;
        let mut remaining = length;
        let mut count = 0;
        while remaining > 0 {
            let chunk = power2_floor(remaining).min(natural_alignment(base));
            base += chunk;
            remaining -= chunk;
            count += 1;
        }
        count
    }

    /// Chooses between positive and subtractive decomposition and returns the register count it needs.
    fn mtrr_number_and_direction(&self, settings: &MtrrSettings, base: u64, length: u64) -> (Direction, usize) {
        let positive = Self::positive_mtrr_count(base, length);

        let Some(covering_length) = length.checked_mul(2).map(power2_floor) else {
            return (Direction::Positive, positive);
        };
        let excess = covering_length - length;
        let excess_range = MtrrMemoryRange::new(base + length, excess, MtrrMemoryCacheType::Uncacheable);
        // The covering pair must be encodable, and the carve-out must only touch memory already at the UC default.
        let representable = excess > 0
            && is_aligned(base, covering_length)
            && base.checked_add(covering_length).is_some_and(|end| end <= self.valid_bits_mask() + 1)
            && settings.def_type().mem_type() == MtrrMemoryCacheType::Uncacheable as u8
            && !self.overlaps_any(settings, &excess_range);
        if !representable {
            return (Direction::Positive, positive);
        }

        let subtractive = excess.count_ones() as usize + 1;
        if positive <= subtractive {
            (Direction::Positive, positive)
        } else {
            (Direction::Subtractive { covering_length }, subtractive)
        }
    }

    fn program_variable_mtrr(
        &self,
        settings: &mut MtrrSettings,
        base: u64,
        length: u64,
        mem_type: MtrrMemoryCacheType,
    ) -> MtrrResult<()> {
        let mut base = base;
        let mut length = length;
        let default_type = MtrrMemoryCacheType::from(settings.def_type().mem_type());
        let request = MtrrMemoryRange::new(base, length, mem_type);

        if !self.overlaps_any(settings, &request) && mem_type == default_type {
            return Ok(());
        }

        self.combine_memory_attribute(settings, mem_type, &mut base, &mut length)?;
        if length == 0 {
            return Ok(());
        }
        let request = MtrrMemoryRange::new(base, length, mem_type);
        if mem_type == default_type && !self.overlaps_any(settings, &request) {
            return Ok(());
        }

        let (direction, needed) = self.mtrr_number_and_direction(settings, base, length);
        let used = self.firmware_ranges(settings).len();
        if used + needed > self.firmware_variable_mtrr_count() {
            log::warn!(
                "MTRR exhausted: {request} needs {needed}, {used} of {} in use",
                self.firmware_variable_mtrr_count()
            );
            return Err(MtrrError::VariableRangeMtrrExhausted);
        }

        let mut mem_type = mem_type;
        let mut remaining = length;
        if let Direction::Subtractive { covering_length } = direction {
            self.allocate(settings, base, covering_length, mem_type)?;
            base += covering_length;
            remaining = covering_length - length;
            mem_type = MtrrMemoryCacheType::Uncacheable;
        }

        while remaining > 0 {
            match direction {
                Direction::Positive => {
                    let chunk = power2_floor(remaining).min(natural_alignment(base));
                    self.allocate(settings, base, chunk, mem_type)?;
                    base += chunk;
                    remaining -= chunk;
                }
                Direction::Subtractive { .. } => {
                    let chunk = power2_floor(remaining);
                    base -= chunk;
                    self.allocate(settings, base, chunk, mem_type)?;
                    remaining -= chunk;
                }
            }
        }
        settings.mtrr_def_type = settings.def_type().with_e(true).into_bits();
        Ok(())
    }

    /// Writes one range into the first free firmware variable MTRR of the shadow.
    fn allocate(
        &self,
        settings: &mut MtrrSettings,
        base: u64,
        length: u64,
        mem_type: MtrrMemoryCacheType,
    ) -> MtrrResult<()> {
        let count = self.firmware_variable_mtrr_count();
        let slot = settings
            .variables
            .mtrr
            .iter_mut()
            .take(count)
            .find(|var| !var.is_valid())
            .ok_or(MtrrError::VariableRangeMtrrExhausted)?;
        *slot = self.encode(base, length, mem_type);
        Ok(())
    }

    /// Programs every register of `target` that differs from `current`.
    ///
    /// Returns the number of registers whose value changed, zero when the hardware already matched. IA32_MTRR_DEF_TYPE
    /// is written twice around the quiesce window but counts once, and only when its value changed.
    fn commit(&self, current: &MtrrSettings, target: &MtrrSettings) -> usize {
        let fixed_count = if self.fixed_supported { MTRR_NUMBER_OF_FIXED_MTRR } else { 0 };
        let fixed_changes = (0..fixed_count).filter(|&i| current.fixed.mtrr[i] != target.fixed.mtrr[i]).count();
        let variable_changes: usize = (0..self.variable_mtrr_count)
            .map(|i| {
                let (c, t) = (&current.variables.mtrr[i], &target.variables.mtrr[i]);
                (c.base != t.base) as usize + (c.mask != t.mask) as usize
            })
            .sum();
        let def_changes = (current.mtrr_def_type != target.mtrr_def_type) as usize;

        let total = fixed_changes + variable_changes + def_changes;
        if total == 0 {
            return 0;
        }

        let saved = self.hal.disable_cache();
        let quiesced = MsrIa32MtrrDefType::from_bits(current.mtrr_def_type).with_e(false).with_fe(false);
        self.hal.write_msr(MSR_IA32_MTRR_DEF_TYPE, quiesced.into_bits());

        for (index, entry) in FIXED_MTRR_TABLE.iter().enumerate().take(fixed_count) {
            if current.fixed.mtrr[index] != target.fixed.mtrr[index] {
                self.hal.write_msr(entry.msr, target.fixed.mtrr[index]);
            }
        }
        for index in 0..self.variable_mtrr_count {
            let (c, t) = (&current.variables.mtrr[index], &target.variables.mtrr[index]);
            if c.base != t.base {
                self.hal.write_msr(MSR_IA32_MTRR_PHYSBASE0 + 2 * index as u32, t.base);
            }
            if c.mask != t.mask {
                self.hal.write_msr(MSR_IA32_MTRR_PHYSMASK0 + 2 * index as u32, t.mask);
            }
        }

        self.hal.write_msr(MSR_IA32_MTRR_DEF_TYPE, target.mtrr_def_type);
        self.hal.restore_cache(saved);

        log::debug!("MTRR: {total} register(s) changed");
        total
    }

    fn fixed_memory_attribute(settings: &MtrrSettings, address: u64) -> Option<MtrrMemoryCacheType> {
        FIXED_MTRR_TABLE.iter().enumerate().find(|(_, e)| address >= e.base_address && address < e.end()).map(
            |(index, entry)| {
                let slot = (address - entry.base_address) / entry.slot_length;
                MtrrMemoryCacheType::from(settings.fixed.mtrr[index] >> (slot * 8))
            },
        )
    }

    fn memory_attribute_in(&self, settings: &MtrrSettings, address: u64) -> MtrrMemoryCacheType {
        let def = settings.def_type();
        if !def.e() {
            return MtrrMemoryCacheType::Uncacheable;
        }

        if address < SIZE_1MB && def.fe() && self.fixed_supported {
            if let Some(mem_type) = Self::fixed_memory_attribute(settings, address) {
                return mem_type;
            }
        }

        let address_mask = self.valid_address_mask();
        let mut found: Option<MtrrMemoryCacheType> = None;
        for var in settings.variables.mtrr.iter().take(self.variable_mtrr_count).filter(|v| v.is_valid()) {
            let mask = var.mask & address_mask;
            if address & mask != var.base & mask {
                continue;
            }
            let mem_type = var.mem_type();
            found = match (found, mem_type) {
                (_, MtrrMemoryCacheType::Uncacheable) => return MtrrMemoryCacheType::Uncacheable,
                (None, t) => Some(t),
                (Some(MtrrMemoryCacheType::WriteThrough), _) | (_, MtrrMemoryCacheType::WriteThrough) => {
                    Some(MtrrMemoryCacheType::WriteThrough)
                }
                (Some(prev), _) => Some(prev),
            };
        }
        found.unwrap_or_else(|| MtrrMemoryCacheType::from(def.mem_type()))
    }
}

impl<H: Hal> Mtrr for MtrrLib<H> {
    fn is_supported(&self) -> bool {
        self.mtrr_supported
    }

    fn get_all_mtrrs(&self) -> MtrrResult<MtrrSettings> {
        if !self.mtrr_supported {
            return Err(MtrrError::MtrrNotSupported);
        }
        Ok(self.read_settings())
    }

    fn set_all_mtrrs(&mut self, mtrr_setting: &MtrrSettings) -> usize {
        if !self.mtrr_supported {
            return 0;
        }
        let current = self.read_settings();
        let mut target = *mtrr_setting;
        // Registers this processor does not implement are left alone.
        for var in target.variables.mtrr.iter_mut().skip(self.variable_mtrr_count) {
            *var = MtrrVariableSetting::default();
        }
        self.commit(&current, &target)
    }

    fn get_memory_attribute(&self, address: u64) -> MtrrMemoryCacheType {
        if !self.mtrr_supported {
            return MtrrMemoryCacheType::Uncacheable;
        }
        self.memory_attribute_in(&self.read_settings(), address)
    }

    fn set_memory_attribute(
        &mut self,
        base_address: u64,
        length: u64,
        attribute: MtrrMemoryCacheType,
    ) -> MtrrResult<usize> {
        let current = self.read_settings_checked()?;
        let mut target = current;
        self.apply(&mut target, base_address, length, attribute)?;
        Ok(self.commit(&current, &target))
    }

    fn set_memory_attributes(&mut self, ranges: &[MtrrMemoryRange]) -> MtrrResult<usize> {
        let current = self.read_settings_checked()?;
        let mut target = current;
        for range in ranges {
            self.apply(&mut target, range.base_address, range.length, range.mem_type)?;
        }
        Ok(self.commit(&current, &target))
    }

    fn get_memory_ranges(&self) -> MtrrResult<Vec<MtrrMemoryRange>> {
        let settings = self.read_settings_checked()?;
        Ok(settings.variables.mtrr.iter().take(self.variable_mtrr_count).filter_map(|v| self.decode(v)).collect())
    }

    fn debug_print_all_mtrrs(&self) {
        let Ok(settings) = self.read_settings_checked() else {
            log::info!("MTRRs not supported");
            return;
        };
        let def = settings.def_type();
        log::info!(
            "MTRR default type: {}, E={} FE={}, {} variable ({} firmware), {} address bits",
            MtrrMemoryCacheType::from(def.mem_type()),
            def.e(),
            def.fe(),
            self.variable_mtrr_count,
            self.firmware_variable_mtrr_count(),
            self.physical_address_bits
        );
        for (entry, value) in FIXED_MTRR_TABLE.iter().zip(settings.fixed.mtrr.iter()) {
            log::info!("  Fixed MTRR[{:#05x}]: {:#018x}", entry.msr, value);
        }
        for (index, var) in settings.variables.mtrr.iter().take(self.variable_mtrr_count).enumerate() {
            match self.decode(var) {
                Some(range) => log::info!("  MTRR{index}: {range}"),
                None => log::info!("  MTRR{index}: unused"),
            }
        }
    }
}

impl<H: Hal> MtrrLib<H> {
    fn read_settings_checked(&self) -> MtrrResult<MtrrSettings> {
        if !self.mtrr_supported {
            return Err(MtrrError::MtrrNotSupported);
        }
        Ok(self.read_settings())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{MockHal, SimulatedHal};
    use crate::structs::{MSR_IA32_MTRR_FIX16K_A0000, MSR_IA32_MTRR_FIX64K_00000};
    use crate::RESERVED_FIRMWARE_VARIABLE_MTRR_NUMBER;
    use cpu_init_sdk::base::{SIZE_16MB, SIZE_1GB, SIZE_256MB, SIZE_2MB, SIZE_4GB, SIZE_640KB};
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use MtrrMemoryCacheType::*;

    fn sim(default_type: MtrrMemoryCacheType) -> SimulatedHal {
        SimulatedHal::new(10, 39, default_type)
    }

    fn lib(hal: &SimulatedHal) -> MtrrLib<&SimulatedHal> {
        MtrrLib::new(hal, RESERVED_FIRMWARE_VARIABLE_MTRR_NUMBER)
    }

    /// Asserts the final variable ranges only overlap in compatible pairs.
    fn assert_compatible_overlaps(ranges: &[MtrrMemoryRange]) {
        for (i, a) in ranges.iter().enumerate() {
            for b in ranges.iter().skip(i + 1) {
                if a.overlaps(b) {
                    assert!(
                        MtrrLib::<&SimulatedHal>::takes_precedence(a.mem_type, b.mem_type)
                            || MtrrLib::<&SimulatedHal>::takes_precedence(b.mem_type, a.mem_type)
                            || a.mem_type == b.mem_type,
                        "{a} overlaps {b}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_probe() {
        let hal = sim(Uncacheable);
        let mtrr = lib(&hal);
        assert!(mtrr.is_supported());
        assert_eq!(mtrr.variable_mtrr_count(), 10);
        assert_eq!(mtrr.firmware_variable_mtrr_count(), 8);
        assert_eq!(mtrr.physical_address_bits(), 39);
        assert_eq!(mtrr.default_memory_type(), Uncacheable);
    }

    #[test]
    fn test_physical_address_bits_default_without_extended_leaf() {
        let hal = sim(Uncacheable);
        hal.set_cpuid(0x8000_0000, 0, Default::default());
        assert_eq!(lib(&hal).physical_address_bits(), DEFAULT_PHYSICAL_ADDRESS_BITS);
    }

    #[test]
    fn test_not_supported_never_touches_msrs() {
        let mut hal = MockHal::new();
        hal.expect_cpuid().returning(|_, _| Default::default());
        hal.expect_read_msr().never();
        hal.expect_write_msr().never();
        let mut mtrr = MtrrLib::new(hal, 2);
        assert!(!mtrr.is_supported());
        assert_eq!(mtrr.set_memory_attribute(0, SIZE_1GB, WriteBack), Err(MtrrError::MtrrNotSupported));
        assert_eq!(mtrr.get_memory_attribute(0x1000), Uncacheable);
        assert_eq!(mtrr.get_all_mtrrs(), Err(MtrrError::MtrrNotSupported));
    }

    #[test]
    fn test_parameter_validation() {
        let hal = sim(Uncacheable);
        let mut mtrr = lib(&hal);
        assert_eq!(mtrr.set_memory_attribute(SIZE_1GB, 0, WriteBack), Err(MtrrError::InvalidParameter));
        assert_eq!(mtrr.set_memory_attribute(u64::MAX - 0xFFF, 0x2000, WriteBack), Err(MtrrError::InvalidParameter));
        assert_eq!(mtrr.set_memory_attribute(SIZE_1GB + 0x10, SIZE_2MB, WriteBack), Err(MtrrError::AddressNotAligned));
        assert_eq!(mtrr.set_memory_attribute(SIZE_1GB, SIZE_2MB + 1, WriteBack), Err(MtrrError::AddressNotAligned));
        assert_eq!(mtrr.set_memory_attribute(1 << 39, SIZE_2MB, WriteBack), Err(MtrrError::AddressNotAligned));
        assert_eq!(mtrr.set_memory_attribute(SIZE_1GB, SIZE_2MB, Invalid), Err(MtrrError::InvalidParameter));
        let efi: cpu_init_sdk::error::EfiError = MtrrError::AddressNotAligned.into();
        assert_eq!(efi, cpu_init_sdk::error::EfiError::Unsupported);
        assert_eq!(hal.mtrr_write_count(), 0);
    }

    #[test]
    fn test_set_then_query_and_idempotent() {
        let hal = sim(Uncacheable);
        let mut mtrr = lib(&hal);

        let written = mtrr.set_memory_attribute(0, SIZE_4GB - SIZE_256MB * 2, WriteBack).unwrap();
        assert!(written > 0);
        for address in [SIZE_1MB, SIZE_1GB, SIZE_4GB - SIZE_256MB * 2 - SIZE_4KB] {
            assert_eq!(mtrr.get_memory_attribute(address), WriteBack, "{address:#x}");
        }
        assert_eq!(mtrr.get_memory_attribute(SIZE_4GB - SIZE_256MB), Uncacheable);
        assert_eq!(mtrr.get_memory_attribute(0x8_0000), WriteBack);

        let before = hal.mtrr_write_count();
        assert_eq!(mtrr.set_memory_attribute(0, SIZE_4GB - SIZE_256MB * 2, WriteBack), Ok(0));
        assert_eq!(hal.mtrr_write_count(), before);
        assert_eq!(hal.violation_count(), 0);
        assert!(hal.interrupts_enabled());
    }

    #[test]
    fn test_change_count_includes_default_type_once() {
        let hal = sim(Uncacheable);
        hal.poke_msr(MSR_IA32_MTRR_DEF_TYPE, Uncacheable as u64);
        let mut mtrr = lib(&hal);

        // One base/mask pair plus IA32_MTRR_DEF_TYPE gaining the enable bit.
        assert_eq!(mtrr.set_memory_attribute(SIZE_1GB, SIZE_1GB, WriteBack), Ok(3));
        assert_eq!(hal.mtrr_write_count(), 2);

        assert_eq!(mtrr.set_memory_attribute(SIZE_4GB, SIZE_1GB, WriteBack), Ok(2));
        assert_eq!(hal.mtrr_write_count(), 4);
        assert_eq!(hal.violation_count(), 0);
    }

    #[test]
    fn test_fixed_ranges() {
        let hal = sim(Uncacheable);
        let mut mtrr = lib(&hal);

        mtrr.set_memory_attribute(0, SIZE_640KB, WriteBack).unwrap();
        assert_eq!(hal.read_msr(MSR_IA32_MTRR_FIX64K_00000), 0x0606_0606_0606_0606);
        assert_eq!(mtrr.get_memory_attribute(0x9_C000), WriteBack);
        assert_eq!(mtrr.get_memory_attribute(0xA_0000), Uncacheable);

        mtrr.set_memory_attribute(0xA_0000, 0x8000, WriteCombining).unwrap();
        assert_eq!(hal.read_msr(MSR_IA32_MTRR_FIX16K_A0000), 0x0101);
        assert_eq!(mtrr.get_memory_attribute(0xA_4000), WriteCombining);

        // 0xC1000 lands inside a 4K MSR but a 16K boundary inside the 16K MSRs cannot be split.
        assert_eq!(mtrr.set_memory_attribute(0xC_1000, 0x1000, WriteProtected), Ok(1));
        assert_eq!(mtrr.set_memory_attribute(0xA_1000, 0x1000, WriteBack), Err(MtrrError::FixedRangeMtrrBaseAddressNotAligned));
        assert_eq!(mtrr.set_memory_attribute(0x8_0000, 0x5000, WriteBack), Err(MtrrError::FixedRangeMtrrLengthNotAligned));
        assert_eq!(hal.violation_count(), 0);
    }

    #[test]
    fn test_range_straddling_one_megabyte() {
        let hal = sim(Uncacheable);
        let mut mtrr = lib(&hal);
        mtrr.set_memory_attribute(0xF_0000, SIZE_1MB, WriteBack).unwrap();
        assert_eq!(mtrr.get_memory_attribute(0xF_F000), WriteBack);
        assert_eq!(mtrr.get_memory_attribute(SIZE_1MB + 0x8_0000), WriteBack);
        assert_eq!(mtrr.get_memory_attribute(0xE_F000), Uncacheable);
    }

    #[test]
    fn test_default_type_shortcut() {
        let hal = sim(WriteBack);
        let mut mtrr = lib(&hal);
        assert_eq!(mtrr.set_memory_attribute(SIZE_1GB, SIZE_1GB, WriteBack), Ok(0));
        assert!(mtrr.get_memory_ranges().unwrap().is_empty());
    }

    #[test]
    fn test_container_same_type_is_noop() {
        let hal = sim(Uncacheable);
        let mut mtrr = lib(&hal);
        mtrr.set_memory_attribute(0, SIZE_4GB, WriteBack).unwrap();
        assert_eq!(mtrr.set_memory_attribute(SIZE_1GB, SIZE_16MB, WriteBack), Ok(0));
    }

    #[test]
    fn test_request_covering_existing_invalidates_it() {
        let hal = sim(Uncacheable);
        let mut mtrr = lib(&hal);
        mtrr.set_memory_attribute(SIZE_1GB, SIZE_16MB, WriteThrough).unwrap();
        mtrr.set_memory_attribute(SIZE_1GB, SIZE_1GB, WriteBack).unwrap();
        let ranges = mtrr.get_memory_ranges().unwrap();
        assert_eq!(ranges, [MtrrMemoryRange::new(SIZE_1GB, SIZE_1GB, WriteBack)]);
        assert_eq!(mtrr.get_memory_attribute(SIZE_1GB), WriteBack);
    }

    #[test]
    fn test_adjoining_same_type_ranges_are_unioned() {
        let hal = sim(Uncacheable);
        let mut mtrr = lib(&hal);
        mtrr.set_memory_attribute(0, SIZE_1GB * 2, WriteBack).unwrap();
        mtrr.set_memory_attribute(SIZE_1GB * 2, SIZE_1GB * 2, WriteBack).unwrap();
        assert_eq!(mtrr.get_memory_ranges().unwrap(), [MtrrMemoryRange::new(0, SIZE_4GB, WriteBack)]);
    }

    #[test]
    fn test_uc_hole_inside_wb() {
        let hal = sim(Uncacheable);
        let mut mtrr = lib(&hal);
        mtrr.set_memory_attribute(0, SIZE_4GB, WriteBack).unwrap();
        mtrr.set_memory_attribute(SIZE_4GB - SIZE_256MB, SIZE_256MB, Uncacheable).unwrap();
        assert_eq!(mtrr.get_memory_attribute(SIZE_4GB - SIZE_4KB), Uncacheable);
        assert_eq!(mtrr.get_memory_attribute(SIZE_4GB - SIZE_256MB - SIZE_4KB), WriteBack);
        assert_compatible_overlaps(&mtrr.get_memory_ranges().unwrap());
    }

    #[test]
    fn test_wt_over_wb_is_allowed_and_wins() {
        let hal = sim(Uncacheable);
        let mut mtrr = lib(&hal);
        mtrr.set_memory_attribute(0, SIZE_4GB, WriteBack).unwrap();
        mtrr.set_memory_attribute(SIZE_1GB, SIZE_16MB, WriteThrough).unwrap();
        assert_eq!(mtrr.get_memory_attribute(SIZE_1GB), WriteThrough);
    }

    #[test]
    fn test_partial_overlap_with_higher_precedence_range_is_denied() {
        let hal = sim(WriteBack);
        let mut mtrr = lib(&hal);
        mtrr.set_memory_attribute(SIZE_1GB, SIZE_16MB, Uncacheable).unwrap();
        let before = hal.mtrr_write_count();
        assert_eq!(
            mtrr.set_memory_attribute(SIZE_1GB + SIZE_16MB / 2, SIZE_1GB - SIZE_16MB / 2, WriteThrough),
            Err(MtrrError::IncompatibleOverlap)
        );
        assert_eq!(hal.mtrr_write_count(), before);
        assert_eq!(mtrr.get_memory_attribute(SIZE_1GB + SIZE_16MB / 2), Uncacheable);

        let hal = sim(WriteBack);
        let mut mtrr = lib(&hal);
        mtrr.set_memory_attribute(SIZE_1GB, SIZE_16MB, WriteThrough).unwrap();
        assert_eq!(
            mtrr.set_memory_attribute(SIZE_1GB + SIZE_16MB / 2, SIZE_1GB - SIZE_16MB / 2, WriteBack),
            Err(MtrrError::IncompatibleOverlap)
        );
        assert_eq!(mtrr.get_memory_attribute(SIZE_1GB + SIZE_16MB / 2), WriteThrough);
    }

    #[test]
    fn test_partial_overlap_with_lower_precedence_range_reads_request() {
        let hal = sim(Uncacheable);
        let mut mtrr = lib(&hal);
        mtrr.set_memory_attribute(SIZE_1GB, SIZE_16MB, WriteBack).unwrap();
        mtrr.set_memory_attribute(SIZE_1GB + SIZE_16MB / 2, SIZE_16MB, WriteThrough).unwrap();
        assert_eq!(mtrr.get_memory_attribute(SIZE_1GB), WriteBack);
        assert_eq!(mtrr.get_memory_attribute(SIZE_1GB + SIZE_16MB / 2), WriteThrough);
        assert_eq!(mtrr.get_memory_attribute(SIZE_1GB + SIZE_16MB), WriteThrough);

        mtrr.set_memory_attribute(SIZE_1GB + SIZE_16MB, SIZE_16MB, Uncacheable).unwrap();
        assert_eq!(mtrr.get_memory_attribute(SIZE_1GB + SIZE_16MB), Uncacheable);
        assert_eq!(mtrr.get_memory_attribute(SIZE_1GB + SIZE_16MB / 2), WriteThrough);
        assert_compatible_overlaps(&mtrr.get_memory_ranges().unwrap());
    }

    #[test]
    fn test_union_keeps_hole_outside_request() {
        let hal = sim(Uncacheable);
        let mut mtrr = lib(&hal);
        mtrr.set_memory_attribute(SIZE_4GB, SIZE_4GB, WriteBack).unwrap();
        mtrr.set_memory_attribute(SIZE_4GB * 2 - SIZE_256MB, SIZE_256MB, Uncacheable).unwrap();

        mtrr.set_memory_attribute(SIZE_4GB * 2, SIZE_1GB, WriteBack).unwrap();
        assert_eq!(mtrr.get_memory_attribute(SIZE_4GB), WriteBack);
        assert_eq!(mtrr.get_memory_attribute(SIZE_4GB * 2 - SIZE_4KB), Uncacheable);
        assert_eq!(mtrr.get_memory_attribute(SIZE_4GB * 2 + SIZE_1GB / 2), WriteBack);
        assert_compatible_overlaps(&mtrr.get_memory_ranges().unwrap());
    }

    #[test]
    fn test_incompatible_overlap_is_denied_without_writes() {
        let hal = sim(Uncacheable);
        let mut mtrr = lib(&hal);
        mtrr.set_memory_attribute(0, SIZE_4GB, WriteBack).unwrap();
        let before = hal.mtrr_write_count();
        assert_eq!(mtrr.set_memory_attribute(SIZE_1GB, SIZE_16MB, WriteCombining), Err(MtrrError::IncompatibleOverlap));
        assert_eq!(hal.mtrr_write_count(), before);
        let efi: cpu_init_sdk::error::EfiError = MtrrError::IncompatibleOverlap.into();
        assert_eq!(efi, cpu_init_sdk::error::EfiError::AccessDenied);
    }

    #[test]
    fn test_subtractive_direction_saves_registers() {
        let hal = sim(Uncacheable);
        let mut mtrr = lib(&hal);
        // 4GB - 4MB positive needs 10 registers, subtractive needs 4GB WB plus one 4MB UC carve-out.
        let length = SIZE_4GB - SIZE_2MB * 2;
        mtrr.set_memory_attribute(0x1_0000_0000u64 * 4, length, WriteBack).unwrap();
        let ranges = mtrr.get_memory_ranges().unwrap();
        assert_eq!(
            ranges,
            [
                MtrrMemoryRange::new(SIZE_4GB * 4, SIZE_4GB, WriteBack),
                MtrrMemoryRange::new(SIZE_4GB * 5 - SIZE_2MB * 2, SIZE_2MB * 2, Uncacheable),
            ]
        );
        assert_eq!(mtrr.get_memory_attribute(SIZE_4GB * 4 + length - SIZE_4KB), WriteBack);
        assert_eq!(mtrr.get_memory_attribute(SIZE_4GB * 4 + length), Uncacheable);
    }

    #[test]
    fn test_positive_direction_when_base_unaligned_for_cover() {
        let hal = sim(Uncacheable);
        let mut mtrr = lib(&hal);
        // Base aligned to 1GB only, so a 4GB cover can not be encoded.
        let base = SIZE_1GB;
        let length = SIZE_1GB * 3;
        mtrr.set_memory_attribute(base, length, WriteBack).unwrap();
        let ranges = mtrr.get_memory_ranges().unwrap();
        assert_eq!(
            ranges,
            [MtrrMemoryRange::new(SIZE_1GB, SIZE_1GB, WriteBack), MtrrMemoryRange::new(SIZE_1GB * 2, SIZE_1GB * 2, WriteBack)]
        );
    }

    #[test]
    fn test_out_of_resources_leaves_hardware_untouched() {
        let hal = SimulatedHal::new(4, 39, MtrrMemoryCacheType::WriteBack);
        let mut mtrr = lib(&hal);
        assert_eq!(mtrr.firmware_variable_mtrr_count(), 2);
        // Three UC pieces with a WB default can not use the subtractive form.
        let before = hal.mtrr_write_count();
        assert_eq!(
            mtrr.set_memory_attribute(SIZE_1GB, SIZE_256MB + SIZE_16MB + SIZE_2MB, Uncacheable),
            Err(MtrrError::VariableRangeMtrrExhausted)
        );
        assert_eq!(hal.mtrr_write_count(), before);
        let efi: cpu_init_sdk::error::EfiError = MtrrError::VariableRangeMtrrExhausted.into();
        assert_eq!(efi, cpu_init_sdk::error::EfiError::OutOfResources);
    }

    #[test]
    fn test_reserved_registers_are_never_used() {
        let hal = SimulatedHal::new(4, 39, MtrrMemoryCacheType::Uncacheable);
        let mut mtrr = lib(&hal);
        mtrr.set_memory_attribute(0, SIZE_1GB, WriteBack).unwrap();
        mtrr.set_memory_attribute(SIZE_4GB, SIZE_1GB, WriteBack).unwrap();
        assert_eq!(hal.read_msr(MSR_IA32_MTRR_PHYSMASK0 + 4) & MTRR_LIB_MSR_VALID_MASK, 0);
        assert_eq!(hal.read_msr(MSR_IA32_MTRR_PHYSMASK0 + 6) & MTRR_LIB_MSR_VALID_MASK, 0);
    }

    #[test]
    fn test_mtrrs_disabled_reads_uncacheable() {
        let hal = sim(WriteBack);
        hal.poke_msr(MSR_IA32_MTRR_DEF_TYPE, WriteBack as u64);
        assert_eq!(lib(&hal).get_memory_attribute(SIZE_1GB), Uncacheable);
    }

    #[test]
    fn test_snapshot_restore_onto_another_processor() {
        let bsp = sim(Uncacheable);
        let ap = sim(Uncacheable);
        let mut bsp_mtrr = lib(&bsp);
        bsp_mtrr.set_memory_attribute(0, SIZE_640KB, WriteBack).unwrap();
        bsp_mtrr.set_memory_attribute(SIZE_1MB, SIZE_1GB - SIZE_1MB, WriteBack).unwrap();
        let snapshot = bsp_mtrr.get_all_mtrrs().unwrap();

        let mut ap_mtrr = lib(&ap);
        assert!(ap_mtrr.set_all_mtrrs(&snapshot) > 0);
        assert_eq!(ap_mtrr.get_all_mtrrs().unwrap(), snapshot);
        assert_eq!(ap_mtrr.set_all_mtrrs(&snapshot), 0);
        assert_eq!(ap.violation_count(), 0);
    }

    #[test]
    fn test_set_memory_attributes_is_all_or_nothing() {
        let hal = sim(Uncacheable);
        let mut mtrr = lib(&hal);
        let ranges = [
            MtrrMemoryRange::new(0, SIZE_1GB, WriteBack),
            MtrrMemoryRange::new(SIZE_1GB / 2, SIZE_16MB, WriteCombining),
        ];
        assert_eq!(mtrr.set_memory_attributes(&ranges), Err(MtrrError::IncompatibleOverlap));
        assert_eq!(hal.mtrr_write_count(), 0);

        let ranges = [MtrrMemoryRange::new(0, SIZE_1GB, WriteBack), MtrrMemoryRange::new(SIZE_1GB, SIZE_1GB, WriteBack)];
        assert!(mtrr.set_memory_attributes(&ranges).unwrap() > 0);
        assert_eq!(mtrr.get_memory_ranges().unwrap(), [MtrrMemoryRange::new(0, SIZE_1GB * 2, WriteBack)]);
    }

    /// Random disjoint requests, one per 64GB window so no covering range reaches into another request: each
    /// succeeds or reports exhaustion, and every success reads back and is idempotent.
    #[test]
    fn test_random_disjoint_requests_read_back() {
        const WINDOW: u64 = 64 * SIZE_1GB;
        let mut rng = StdRng::seed_from_u64(0x5EED_0001);
        for _ in 0..200 {
            let hal = sim(Uncacheable);
            let mut mtrr = lib(&hal);
            let mut programmed: Vec<MtrrMemoryRange> = Vec::new();
            for window in 1..5u64 {
                let base = window * WINDOW + rng.gen_range(0..1024u64) * SIZE_16MB;
                let length = rng.gen_range(1..512u64) * SIZE_16MB;
                let mem_type = [WriteBack, WriteThrough, WriteProtected, WriteCombining][rng.gen_range(0..4)];
                match mtrr.set_memory_attribute(base, length, mem_type) {
                    Ok(_) => programmed.push(MtrrMemoryRange::new(base, length, mem_type)),
                    Err(MtrrError::VariableRangeMtrrExhausted) => {}
                    Err(err) => panic!("unexpected {err:?} for {base:#x}+{length:#x}"),
                }
            }
            for range in programmed.iter() {
                for address in [range.base_address, range.base_address + range.length / 2, range.end() & !0xFFF] {
                    assert_eq!(mtrr.get_memory_attribute(address), range.mem_type, "{range} at {address:#x}");
                }
                assert_eq!(mtrr.get_memory_attribute(range.base_address + range.length), Uncacheable);
                assert_eq!(mtrr.set_memory_attribute(range.base_address, range.length, range.mem_type), Ok(0));
            }
            assert_compatible_overlaps(&mtrr.get_memory_ranges().unwrap());
            assert_eq!(hal.violation_count(), 0);
        }
    }

    /// Random overlapping requests: whatever succeeds, the final ranges overlap only in compatible pairs, and every
    /// successful request reads back its own type.
    #[test]
    fn test_random_overlapping_requests_keep_invariants() {
        let mut rng = StdRng::seed_from_u64(0x5EED_0002);
        let types = [Uncacheable, WriteBack, WriteThrough, WriteCombining, WriteProtected];
        for _ in 0..300 {
            let hal = sim(Uncacheable);
            let mut mtrr = lib(&hal);
            for _ in 0..6 {
                let base = rng.gen_range(1..64u64) * SIZE_16MB;
                let length = rng.gen_range(1..64u64) * SIZE_16MB;
                let mem_type = types[rng.gen_range(0..types.len())];
                let result = mtrr.set_memory_attribute(base, length, mem_type);
                let ranges = mtrr.get_memory_ranges().unwrap();
                assert_compatible_overlaps(&ranges);
                if result.is_ok() {
                    for address in [base, base + length / 2, base + length - SIZE_4KB] {
                        let actual = mtrr.get_memory_attribute(address);
                        assert_eq!(actual, mem_type, "{mem_type} [{base:#x}+{length:#x}] at {address:#x}");
                    }
                }
            }
            assert_eq!(hal.violation_count(), 0);
        }
    }
}
