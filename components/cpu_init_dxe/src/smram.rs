//! SMRAM access control.
//!
//! The SMRAM regions open, close and lock together. Once locked they stay closed until the next reset.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;

use cpu_init_sdk::error::{EfiError, Result};
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

bitflags::bitflags! {
    /// EFI_SMRAM_STATE bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SmramState: u64 {
        const OPEN = 0x0000_0001;
        const CLOSED = 0x0000_0002;
        const LOCKED = 0x0000_0004;
        const CACHEABLE = 0x0000_0008;
        const ALLOCATED = 0x0000_0010;
    }
}

/// One SMRAM region, as reported by `get_capabilities`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmramDescriptor {
    pub physical_start: u64,
    pub cpu_start: u64,
    pub physical_size: u64,
    pub region_state: SmramState,
}

/// The chipset controls behind SMRAM.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait SmramControl {
    /// Makes SMRAM visible outside SMM.
    fn open(&self) -> Result<()>;
    /// Hides SMRAM from non-SMM accesses.
    fn close(&self) -> Result<()>;
    /// Locks the SMRAM configuration until reset.
    fn lock(&self) -> Result<()>;
}

pub struct SmramAccess<C: SmramControl> {
    control: C,
    regions: Vec<SmramDescriptor>,
    open: bool,
    locked: bool,
}

impl<C: SmramControl> SmramAccess<C> {
    /// Takes over `regions` in the closed, unlocked state.
    pub fn new(control: C, regions: Vec<SmramDescriptor>) -> Self {
        let mut access = Self { control, regions, open: false, locked: false };
        access.update_region_state();
        access
    }

    /// # Errors
    ///
    /// Returns [`AccessDenied`](EfiError::AccessDenied) once SMRAM is locked.
    pub fn open(&mut self) -> Result<()> {
        if self.locked {
            log::warn!("SMRAM is locked, cannot open");
            return Err(EfiError::AccessDenied);
        }
        self.control.open()?;
        self.open = true;
        self.update_region_state();
        log::debug!("SMRAM opened");
        Ok(())
    }

    /// Closing locked SMRAM is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.locked {
            return Ok(());
        }
        self.control.close()?;
        self.open = false;
        self.update_region_state();
        log::debug!("SMRAM closed");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`DeviceError`](EfiError::DeviceError) if SMRAM is still open.
    pub fn lock(&mut self) -> Result<()> {
        if self.locked {
            return Ok(());
        }
        if self.open {
            log::error!("SMRAM must be closed before it is locked");
            return Err(EfiError::DeviceError);
        }
        self.control.lock()?;
        self.locked = true;
        self.update_region_state();
        log::info!("SMRAM locked");
        Ok(())
    }

    pub fn get_capabilities(&self) -> &[SmramDescriptor] {
        &self.regions
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn update_region_state(&mut self) {
        let mut state = if self.open { SmramState::OPEN } else { SmramState::CLOSED };
        if self.locked {
            state |= SmramState::LOCKED;
        }
        for region in &mut self.regions {
            let kept = region.region_state & (SmramState::CACHEABLE | SmramState::ALLOCATED);
            region.region_state = kept | state;
        }
    }
}
