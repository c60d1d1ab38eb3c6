//! EFI error type shared by the CPU init crates.
//!
//! Only the status codes the MP, MTRR, exception and SMRAM paths can return are modeled. Anything else coming back
//! from a consumed interface is kept as [EfiError::Unknown].
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

/// A specialized [`Result`](core::result::Result) type for CPU init operations.
pub type Result<T> = core::result::Result<T, EfiError>;

use r_efi::efi;

/// EDK II Error Code equivalent as a Rust Error enum
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum EfiError {
    /// The parameter was incorrect.
    InvalidParameter,
    /// The operation is not supported.
    Unsupported,
    /// The buffer was not large enough to hold the requested data.
    BufferTooSmall,
    /// The operation was attempted before its prerequisite state was reached.
    NotReady,
    /// The hardware, or the caller's role, did not allow the operation.
    DeviceError,
    /// The resource has run out.
    OutOfResources,
    /// The item was not found.
    NotFound,
    /// Access was denied.
    AccessDenied,
    /// A timeout time expired.
    Timeout,
    /// The service has not been started.
    NotStarted,
    /// The service has already been started.
    AlreadyStarted,
    /// The operation was aborted.
    Aborted,
    /// An unknown EFI status code was encountered.
    Unknown(efi::Status),
}

impl EfiError {
    /// Converts an `r_efi::efi::Status` to a `Result`.
    ///
    /// If the status is `SUCCESS`, it returns `Ok(())`, otherwise it returns an `Err` with the corresponding
    /// `EfiError`.
    pub fn status_to_result(status: efi::Status) -> Result<()> {
        match status {
            efi::Status::SUCCESS => Ok(()),
            other => Err(EfiError::from(other)),
        }
    }
}

impl From<EfiError> for efi::Status {
    fn from(e: EfiError) -> efi::Status {
        match e {
            EfiError::InvalidParameter => efi::Status::INVALID_PARAMETER,
            EfiError::Unsupported => efi::Status::UNSUPPORTED,
            EfiError::BufferTooSmall => efi::Status::BUFFER_TOO_SMALL,
            EfiError::NotReady => efi::Status::NOT_READY,
            EfiError::DeviceError => efi::Status::DEVICE_ERROR,
            EfiError::OutOfResources => efi::Status::OUT_OF_RESOURCES,
            EfiError::NotFound => efi::Status::NOT_FOUND,
            EfiError::AccessDenied => efi::Status::ACCESS_DENIED,
            EfiError::Timeout => efi::Status::TIMEOUT,
            EfiError::NotStarted => efi::Status::NOT_STARTED,
            EfiError::AlreadyStarted => efi::Status::ALREADY_STARTED,
            EfiError::Aborted => efi::Status::ABORTED,
            EfiError::Unknown(status) => status,
        }
    }
}

impl From<efi::Status> for EfiError {
    fn from(status: efi::Status) -> EfiError {
        match status {
            efi::Status::INVALID_PARAMETER => EfiError::InvalidParameter,
            efi::Status::UNSUPPORTED => EfiError::Unsupported,
            efi::Status::BUFFER_TOO_SMALL => EfiError::BufferTooSmall,
            efi::Status::NOT_READY => EfiError::NotReady,
            efi::Status::DEVICE_ERROR => EfiError::DeviceError,
            efi::Status::OUT_OF_RESOURCES => EfiError::OutOfResources,
            efi::Status::NOT_FOUND => EfiError::NotFound,
            efi::Status::ACCESS_DENIED => EfiError::AccessDenied,
            efi::Status::TIMEOUT => EfiError::Timeout,
            efi::Status::NOT_STARTED => EfiError::NotStarted,
            efi::Status::ALREADY_STARTED => EfiError::AlreadyStarted,
            efi::Status::ABORTED => EfiError::Aborted,
            other => EfiError::Unknown(other),
        }
    }
}

impl core::fmt::Display for EfiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EfiError::Unknown(status) => write!(f, "Unknown({:#x})", status.as_usize()),
            other => write!(f, "{other:?}"),
        }
    }
}
