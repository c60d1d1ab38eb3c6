//! CPU Init Software Development Kit (SDK)
//!
//! Common definitions shared by the CPU init crates: the EFI error type, base size constants and helpers, status
//! code reporting, and the serial logger used by the DXE driver.
//!
//! ## Features
//!
//! - `std`: Enables the std backed [serial::Terminal] writer for host builds.
//! - `mockall`: Exposes mock implementations of the consumed traits to dependent crates.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

#[macro_use]
pub mod macros;

pub mod base;
pub mod error;
pub mod log;
pub mod serial;
pub mod status_code;
