//! Processor interrupt flag control.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use cpu_init_sdk::error::EfiError;

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "uefi", target_arch = "x86_64"))] {
        mod x64;
        pub use x64::{disable_interrupts, enable_interrupts, get_interrupt_state};
    } else {
        mod null;
        pub use null::{disable_interrupts, enable_interrupts, get_interrupt_state};
    }
}

/// Runs `f` with interrupts disabled and puts the interrupt flag back the way it was.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> Result<R, EfiError> {
    let was_enabled = get_interrupt_state()?;
    if was_enabled {
        disable_interrupts();
    }
    let result = f();
    if was_enabled {
        enable_interrupts();
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_without_interrupts_restores_prior_state() {
        enable_interrupts();
        let inside = without_interrupts(|| get_interrupt_state().unwrap()).unwrap();
        assert!(!inside);
        assert!(get_interrupt_state().unwrap());

        disable_interrupts();
        without_interrupts(|| ()).unwrap();
        assert!(!get_interrupt_state().unwrap());
    }
}
