//! CPU architecture services of the boot session.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use cpu_init_interrupts::{ExceptionType, HandlerType};
use cpu_init_mp::platform::MpPlatform;
use cpu_init_mtrr::{mtrr::MtrrLib, structs::MtrrMemoryCacheType, Mtrr};
use cpu_init_sdk::error::{EfiError, Result};
use r_efi::efi;

use crate::{smram::SmramControl, CpuInitDxe};

/// Femtoseconds per second, for the timer period.
const FEMTOSECONDS_PER_SECOND: u64 = 1_000_000_000_000_000;

/// Cache policy bits of an EFI memory attribute mask.
pub const CACHE_ATTRIBUTE_MASK: u64 =
    efi::MEMORY_UC | efi::MEMORY_WC | efi::MEMORY_WT | efi::MEMORY_WB | efi::MEMORY_UCE | efi::MEMORY_WP;

/// The CPU architecture interface the rest of DXE uses.
pub trait CpuArch {
    /// Enables interrupt processing by the CPU.
    fn enable_interrupt(&self) -> Result<()>;

    /// Disables interrupt processing by the CPU.
    fn disable_interrupt(&self) -> Result<()>;

    /// Whether the CPU currently takes interrupts.
    fn get_interrupt_state(&self) -> Result<bool>;

    /// Registers a function to be called from the processor interrupt handler.
    ///
    /// [HandlerType::None] removes the handler and gives the vector back to whatever the original table had.
    ///
    /// ## Errors
    ///
    /// InvalidParameter - Vector out of range, or nothing registered when removing.
    /// AlreadyStarted   - A handler is already registered for the vector.
    fn register_interrupt_handler(&mut self, interrupt_type: ExceptionType, handler: HandlerType) -> Result<()>;

    /// Changes the cache policy of a memory range.
    ///
    /// Only the cache bits of `attributes` are acted on. A mask without cache bits is accepted and ignored.
    ///
    /// ## Errors
    ///
    /// InvalidParameter - More than one cache policy, or a range the MTRRs cannot describe.
    /// Unsupported      - The policy has no MTRR encoding.
    /// OutOfResources   - Not enough variable MTRRs.
    fn set_memory_attributes(&mut self, base_address: efi::PhysicalAddress, length: u64, attributes: u64)
        -> Result<()>;

    /// Returns the timer value and the timer period in femtoseconds.
    ///
    /// ## Errors
    ///
    /// InvalidParameter - timer_index is not 0.
    fn get_timer_value(&self, timer_index: u32) -> Result<(u64, u64)>;
}

/// Maps a single EFI cache attribute to its MTRR memory type.
pub fn cache_type_from_attributes(attributes: u64) -> Result<Option<MtrrMemoryCacheType>> {
    let cache = attributes & CACHE_ATTRIBUTE_MASK;
    if cache == 0 {
        return Ok(None);
    }
    if !cache.is_power_of_two() {
        return Err(EfiError::InvalidParameter);
    }
    match cache {
        efi::MEMORY_UC => Ok(Some(MtrrMemoryCacheType::Uncacheable)),
        efi::MEMORY_WC => Ok(Some(MtrrMemoryCacheType::WriteCombining)),
        efi::MEMORY_WT => Ok(Some(MtrrMemoryCacheType::WriteThrough)),
        efi::MEMORY_WB => Ok(Some(MtrrMemoryCacheType::WriteBack)),
        efi::MEMORY_WP => Ok(Some(MtrrMemoryCacheType::WriteProtected)),
        _ => Err(EfiError::Unsupported),
    }
}

impl<P: MpPlatform + 'static, S: SmramControl> CpuArch for CpuInitDxe<P, S> {
    fn enable_interrupt(&self) -> Result<()> {
        cpu_init_interrupts::enable_interrupts();
        Ok(())
    }

    fn disable_interrupt(&self) -> Result<()> {
        cpu_init_interrupts::disable_interrupts();
        Ok(())
    }

    fn get_interrupt_state(&self) -> Result<bool> {
        cpu_init_interrupts::get_interrupt_state()
    }

    fn register_interrupt_handler(&mut self, interrupt_type: ExceptionType, handler: HandlerType) -> Result<()> {
        if handler.is_none() {
            self.exceptions.unregister(interrupt_type)?;
            return self.vectors.restore_vector(interrupt_type);
        }
        self.exceptions.register(interrupt_type, handler)?;
        if let Err(err) = self.vectors.install_vector(interrupt_type, (self.entry_stub)(interrupt_type)) {
            let _ = self.exceptions.unregister(interrupt_type);
            return Err(err);
        }
        Ok(())
    }

    fn set_memory_attributes(
        &mut self,
        base_address: efi::PhysicalAddress,
        length: u64,
        attributes: u64,
    ) -> Result<()> {
        let Some(cache_type) = cache_type_from_attributes(attributes)? else {
            log::trace!("No cache policy in {attributes:#x} for {base_address:#x}+{length:#x}");
            return Ok(());
        };

        let reserved = self.config.mp.reserved_variable_mtrrs;
        let changed = {
            let mut mtrr = MtrrLib::new(&**self.mp.platform(), reserved);
            mtrr.set_memory_attribute(base_address, length, cache_type)?
        };
        log::debug!("{base_address:#x}+{length:#x} -> {cache_type:?}, {changed} MTRRs changed");

        if changed != 0 && self.config.mtrr_resync {
            self.mp.sync_mtrrs_to_aps()?;
        }
        Ok(())
    }

    fn get_timer_value(&self, timer_index: u32) -> Result<(u64, u64)> {
        if timer_index != 0 {
            return Err(EfiError::InvalidParameter);
        }
        let frequency = self.mp.timeout().cpu_frequency_hz();
        let period = FEMTOSECONDS_PER_SECOND.checked_div(frequency).ok_or(EfiError::DeviceError)?;
        Ok((self.mp.platform().read_tsc(), period))
    }
}
