//! MTRR errors.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use cpu_init_sdk::error::EfiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtrrError {
    /// CPUID reports no MTRR support.
    MtrrNotSupported,
    /// Every firmware owned variable MTRR is in use.
    VariableRangeMtrrExhausted,
    /// A fixed range boundary does not start on a slot.
    FixedRangeMtrrBaseAddressNotAligned,
    /// A fixed range ends inside a slot.
    FixedRangeMtrrLengthNotAligned,
    /// Base or length is outside the valid address mask.
    AddressNotAligned,
    /// The requested type is not supported by this processor.
    MemoryTypeNotSupported,
    /// The request overlaps an existing range of an incompatible type.
    IncompatibleOverlap,
    InvalidParameter,
}

pub type MtrrResult<T> = Result<T, MtrrError>;

impl From<MtrrError> for EfiError {
    fn from(err: MtrrError) -> Self {
        match err {
            MtrrError::MtrrNotSupported => EfiError::Unsupported,
            MtrrError::VariableRangeMtrrExhausted => EfiError::OutOfResources,
            MtrrError::FixedRangeMtrrBaseAddressNotAligned => EfiError::Unsupported,
            MtrrError::FixedRangeMtrrLengthNotAligned => EfiError::Unsupported,
            MtrrError::AddressNotAligned => EfiError::Unsupported,
            MtrrError::MemoryTypeNotSupported => EfiError::Unsupported,
            MtrrError::IncompatibleOverlap => EfiError::AccessDenied,
            MtrrError::InvalidParameter => EfiError::InvalidParameter,
        }
    }
}
