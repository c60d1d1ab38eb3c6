//! CPU init configuration and the setup variable it is read from.
//!
//! The setup UI stores the CPU options as one packed little-endian structure, [CpuSetupVariable], under
//! [CPU_SETUP_VARIABLE_NAME] in the [CPU_SETUP_VARIABLE_GUID] namespace. The driver reads it once when the boot
//! session starts and turns it into a [CpuInitConfig]. A missing or unreadable variable is not fatal, the defaults
//! are used and written back so the setup UI has something to show.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{vec, vec::Vec};

use cpu_init_mp::{arena::WakeUpManner, MpConfig};
use cpu_init_sdk::error::{EfiError, Result};
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use r_efi::efi;
use scroll::{Pread, Pwrite};

pub const CPU_SETUP_VARIABLE_NAME: &str = "CpuSetup";

pub const CPU_SETUP_VARIABLE_GUID: efi::Guid =
    efi::Guid::from_fields(0xB08F_97FF, 0xE6E8, 0x4193, 0xA9, 0x97, &[0x5E, 0x9E, 0x9B, 0x0A, 0xDB, 0x32]);

/// Layout revision the driver understands.
pub const CPU_SETUP_REVISION: u8 = 1;

/// Size of [CpuSetupVariable] in the variable store.
pub const CPU_SETUP_VARIABLE_SIZE: usize = 15;

/// Persisted CPU options as the setup UI writes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pread, Pwrite)]
pub struct CpuSetupVariable {
    pub revision: u8,
    /// Logical processors to bring up, BSP included. 0 means all.
    pub active_core_count: u8,
    /// 0 leaves secondary threads disabled.
    pub hyper_threading: u8,
    /// 1 HLT loop, 2 MWAIT loop, 3 run loop.
    pub ap_idle_manner: u8,
    /// Non-zero re-syncs AP MTRRs after every attribute change.
    pub mtrr_resync: u8,
    pub reserved_variable_mtrrs: u8,
    /// Non-zero closes and locks SMRAM at the end of platform init.
    pub smram_lock: u8,
    pub ap_stack_size_kb: u16,
    pub discovery_timeout_ms: u16,
    pub switch_bsp_timeout_ms: u16,
    pub poll_interval_us: u16,
}

impl CpuSetupVariable {
    /// Decodes the stored bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BufferTooSmall`](EfiError::BufferTooSmall) if `bytes` is shorter than the structure.
    /// Returns [`Unsupported`](EfiError::Unsupported) for a layout revision other than [CPU_SETUP_REVISION].
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let setup: Self = bytes.pread_with(0, scroll::LE).map_err(|_| EfiError::BufferTooSmall)?;
        if setup.revision != CPU_SETUP_REVISION {
            return Err(EfiError::Unsupported);
        }
        Ok(setup)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; CPU_SETUP_VARIABLE_SIZE];
        bytes.pwrite_with(*self, 0, scroll::LE).map_err(|_| EfiError::BufferTooSmall)?;
        Ok(bytes)
    }
}

impl Default for CpuSetupVariable {
    fn default() -> Self {
        CpuInitConfig::default().to_setup_variable()
    }
}

/// Access to the platform's variable store.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait VariableStore {
    /// Reads the whole variable. [`NotFound`](EfiError::NotFound) if it does not exist.
    fn get_variable(&self, name: &str, namespace: &efi::Guid) -> Result<Vec<u8>>;

    /// Replaces the whole variable.
    fn set_variable(&self, name: &str, namespace: &efi::Guid, data: &[u8]) -> Result<()>;
}

/// Options for one boot session of the CPU init driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInitConfig {
    pub mp: MpConfig,
    /// Keep secondary hardware threads enabled.
    pub hyper_threading: bool,
    /// Push MTRR changes made through the CPU architecture interface to every AP.
    pub mtrr_resync: bool,
    /// Close and lock SMRAM at the end of platform init.
    pub smram_lock: bool,
}

impl Default for CpuInitConfig {
    fn default() -> Self {
        Self { mp: MpConfig::default(), hyper_threading: true, mtrr_resync: true, smram_lock: true }
    }
}

impl CpuInitConfig {
    /// Reads the setup variable from `store`, falling back to the defaults.
    pub fn load(store: &dyn VariableStore) -> Self {
        let setup = store
            .get_variable(CPU_SETUP_VARIABLE_NAME, &CPU_SETUP_VARIABLE_GUID)
            .and_then(|bytes| CpuSetupVariable::parse(&bytes));
        match setup {
            Ok(setup) => {
                log::info!("CPU setup variable loaded: {setup:?}");
                Self::from_setup_variable(&setup)
            }
            Err(EfiError::NotFound) => {
                log::warn!("CPU setup variable not found, storing defaults");
                let config = Self::default();
                if let Err(err) = config.store(store) {
                    log::warn!("Failed to store the default CPU setup variable: {err:?}");
                }
                config
            }
            Err(err) => {
                log::warn!("CPU setup variable unusable ({err:?}), using defaults");
                Self::default()
            }
        }
    }

    /// Writes this configuration back as the setup variable.
    pub fn store(&self, store: &dyn VariableStore) -> Result<()> {
        let bytes = self.to_setup_variable().to_bytes()?;
        store.set_variable(CPU_SETUP_VARIABLE_NAME, &CPU_SETUP_VARIABLE_GUID, &bytes)
    }

    pub fn from_setup_variable(setup: &CpuSetupVariable) -> Self {
        let defaults = MpConfig::default();
        let or_default = |value: u16, default: u64, scale: u64| match value {
            0 => default,
            value => value as u64 * scale,
        };
        let mp = MpConfig {
            wakeup_manner: WakeUpManner::from_raw(setup.ap_idle_manner),
            ap_stack_size: match setup.ap_stack_size_kb {
                0 => defaults.ap_stack_size,
                kb => kb as usize * 1024,
            },
            max_processors: match setup.active_core_count {
                0 => defaults.max_processors,
                count => (count as usize).min(defaults.max_processors),
            },
            discovery_timeout_us: or_default(setup.discovery_timeout_ms, defaults.discovery_timeout_us, 1000),
            poll_interval_us: or_default(setup.poll_interval_us, defaults.poll_interval_us, 1),
            switch_bsp_timeout_us: or_default(setup.switch_bsp_timeout_ms, defaults.switch_bsp_timeout_us, 1000),
            reserved_variable_mtrrs: setup.reserved_variable_mtrrs as usize,
        };
        Self { mp, hyper_threading: setup.hyper_threading != 0, mtrr_resync: setup.mtrr_resync != 0, smram_lock: setup.smram_lock != 0 }
    }

    pub fn to_setup_variable(&self) -> CpuSetupVariable {
        let mp = &self.mp;
        let active_core_count = if mp.max_processors >= MpConfig::default().max_processors {
            0
        } else {
            mp.max_processors.min(u8::MAX as usize) as u8
        };
        CpuSetupVariable {
            revision: CPU_SETUP_REVISION,
            active_core_count,
            hyper_threading: self.hyper_threading as u8,
            ap_idle_manner: mp.wakeup_manner as u8,
            mtrr_resync: self.mtrr_resync as u8,
            reserved_variable_mtrrs: mp.reserved_variable_mtrrs.min(u8::MAX as usize) as u8,
            smram_lock: self.smram_lock as u8,
            ap_stack_size_kb: (mp.ap_stack_size / 1024).min(u16::MAX as usize) as u16,
            discovery_timeout_ms: (mp.discovery_timeout_us / 1000).min(u16::MAX as u64) as u16,
            switch_bsp_timeout_ms: (mp.switch_bsp_timeout_us / 1000).min(u16::MAX as u64) as u16,
            poll_interval_us: mp.poll_interval_us.min(u16::MAX as u64) as u16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(bytes: Vec<u8>) -> MockVariableStore {
        let mut store = MockVariableStore::new();
        store
            .expect_get_variable()
            .withf(|name, guid| name == CPU_SETUP_VARIABLE_NAME && *guid == CPU_SETUP_VARIABLE_GUID)
            .return_once(move |_, _| Ok(bytes));
        store
    }

    #[test]
    fn test_setup_variable_layout() {
        let bytes = [1, 2, 0, 3, 1, 2, 1, 0x40, 0x00, 0x32, 0x00, 0x00, 0x00, 0x05, 0x00];
        let setup = CpuSetupVariable::parse(&bytes).unwrap();
        assert_eq!(setup.active_core_count, 2);
        assert_eq!(setup.ap_idle_manner, 3);
        assert_eq!(setup.ap_stack_size_kb, 0x40);
        assert_eq!(setup.discovery_timeout_ms, 50);
        assert_eq!(setup.poll_interval_us, 5);
        assert_eq!(setup.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_parse_rejects_short_and_unknown() {
        assert_eq!(CpuSetupVariable::parse(&[1, 0, 1]), Err(EfiError::BufferTooSmall));
        let mut bytes = CpuSetupVariable::default().to_bytes().unwrap();
        bytes[0] = 7;
        assert_eq!(CpuSetupVariable::parse(&bytes), Err(EfiError::Unsupported));
    }

    #[test]
    fn test_load_maps_fields() {
        let setup = CpuSetupVariable {
            revision: CPU_SETUP_REVISION,
            active_core_count: 2,
            hyper_threading: 0,
            ap_idle_manner: WakeUpManner::MwaitLoop as u8,
            mtrr_resync: 0,
            reserved_variable_mtrrs: 0,
            smram_lock: 1,
            ap_stack_size_kb: 16,
            discovery_timeout_ms: 20,
            switch_bsp_timeout_ms: 0,
            poll_interval_us: 0,
        };
        let config = CpuInitConfig::load(&stored(setup.to_bytes().unwrap()));

        assert_eq!(config.mp.wakeup_manner, WakeUpManner::MwaitLoop);
        assert_eq!(config.mp.max_processors, 2);
        assert_eq!(config.mp.ap_stack_size, 0x4000);
        assert_eq!(config.mp.discovery_timeout_us, 20_000);
        assert_eq!(config.mp.switch_bsp_timeout_us, MpConfig::default().switch_bsp_timeout_us);
        assert_eq!(config.mp.poll_interval_us, MpConfig::default().poll_interval_us);
        assert_eq!(config.mp.reserved_variable_mtrrs, 0);
        assert!(!config.hyper_threading);
        assert!(!config.mtrr_resync);
        assert!(config.smram_lock);
    }

    #[test]
    fn test_missing_variable_stores_defaults() {
        let mut store = MockVariableStore::new();
        store.expect_get_variable().return_once(|_, _| Err(EfiError::NotFound));
        let expected = CpuSetupVariable::default().to_bytes().unwrap();
        store
            .expect_set_variable()
            .withf(move |name, _, data| name == CPU_SETUP_VARIABLE_NAME && data == expected.as_slice())
            .times(1)
            .returning(|_, _, _| Ok(()));

        assert_eq!(CpuInitConfig::load(&store), CpuInitConfig::default());
    }

    #[test]
    fn test_corrupt_variable_uses_defaults() {
        assert_eq!(CpuInitConfig::load(&stored(vec![CPU_SETUP_REVISION, 0])), CpuInitConfig::default());
    }

    #[test]
    fn test_defaults_survive_the_variable() {
        let config = CpuInitConfig::default();
        assert_eq!(CpuInitConfig::from_setup_variable(&config.to_setup_variable()), config);
    }
}
