//! Status code reporting.
//!
//! Constants follow the PI specification, volume 3, "Status Codes". The CPU init driver only reports error codes
//! from the exception path, so only that corner of the code space is defined here.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

use crate::error::Result;

/// EFI_STATUS_CODE_TYPE
pub type EfiStatusCodeType = u32;
/// EFI_STATUS_CODE_VALUE
pub type EfiStatusCodeValue = u32;

/// Status code type: progress.
pub const EFI_PROGRESS_CODE: EfiStatusCodeType = 0x0000_0001;
/// Status code type: error.
pub const EFI_ERROR_CODE: EfiStatusCodeType = 0x0000_0002;
/// Error severity: minor.
pub const EFI_ERROR_MINOR: EfiStatusCodeType = 0x4000_0000;
/// Error severity: major.
pub const EFI_ERROR_MAJOR: EfiStatusCodeType = 0x8000_0000;
/// Error severity: unrecovered.
pub const EFI_ERROR_UNRECOVERED: EfiStatusCodeType = 0x9000_0000;

/// Class: software.
pub const EFI_SOFTWARE: EfiStatusCodeValue = 0x0300_0000;
/// Software subclass: unspecified.
pub const EFI_SOFTWARE_UNSPECIFIED: EfiStatusCodeValue = EFI_SOFTWARE;
/// Software subclass: DXE boot service driver.
pub const EFI_SOFTWARE_DXE_BS_DRIVER: EfiStatusCodeValue = EFI_SOFTWARE | 0x0005_0000;
/// Operation codes at or above this value are subclass specific.
pub const EFI_SUBCLASS_SPECIFIC: EfiStatusCodeValue = 0x0000_1000;

/// IA32 exception operation codes, `EFI_SOFTWARE_EC_IA32_*`. The vector number is the offset from the base.
pub mod ia32_exception {
    use super::{EfiStatusCodeValue, EFI_SUBCLASS_SPECIFIC};

    /// #DE
    pub const DIVIDE_ERROR: EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC;
    /// #DB
    pub const DEBUG: EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC | 0x01;
    /// NMI
    pub const NMI: EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC | 0x02;
    /// #BP
    pub const BREAKPOINT: EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC | 0x03;
    /// #OF
    pub const OVERFLOW: EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC | 0x04;
    /// #BR
    pub const BOUND: EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC | 0x05;
    /// #UD
    pub const INVALID_OPCODE: EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC | 0x06;
    /// #DF
    pub const DOUBLE_FAULT: EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC | 0x08;
    /// #TS
    pub const INVALID_TSS: EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC | 0x0A;
    /// #NP
    pub const SEG_NOT_PRESENT: EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC | 0x0B;
    /// #SS
    pub const STACK_FAULT: EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC | 0x0C;
    /// #GP
    pub const GP_FAULT: EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC | 0x0D;
    /// #PF
    pub const PAGE_FAULT: EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC | 0x0E;
    /// #MF
    pub const FP_ERROR: EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC | 0x10;
    /// #AC
    pub const ALIGNMENT_CHECK: EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC | 0x11;
    /// #MC
    pub const MACHINE_CHECK: EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC | 0x12;
    /// #XM
    pub const SIMD: EfiStatusCodeValue = EFI_SUBCLASS_SPECIFIC | 0x13;
}

/// Sink for status codes, backed by the platform's status code protocol.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait ReportStatusCode: Send + Sync {
    /// Reports `value` with severity/type `code_type` for the given processor `instance`.
    fn report_status_code(
        &self,
        code_type: EfiStatusCodeType,
        value: EfiStatusCodeValue,
        instance: u32,
    ) -> Result<()>;
}

/// A status code sink that drops every report. Used until a platform sink is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatusCode;

impl ReportStatusCode for NullStatusCode {
    fn report_status_code(&self, _: EfiStatusCodeType, _: EfiStatusCodeValue, _: u32) -> Result<()> {
        Ok(())
    }
}
