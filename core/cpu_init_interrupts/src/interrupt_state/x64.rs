//! X64 interrupt flag control.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use cpu_init_sdk::error::EfiError;
use x86_64::instructions::interrupts;

pub fn enable_interrupts() {
    interrupts::enable();
}

pub fn disable_interrupts() {
    interrupts::disable();
}

pub fn get_interrupt_state() -> Result<bool, EfiError> {
    Ok(interrupts::are_enabled())
}
