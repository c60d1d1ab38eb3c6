//! The driver's log sink.
//!
//! UEFI builds log to COM1. Host builds log to the terminal with the `std` feature, and nowhere otherwise.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use cpu_init_sdk::{
    error::{EfiError, Result},
    log::{Format, SerialLogger},
};

const TARGET_FILTERS: &[(&str, log::LevelFilter)] =
    &[("cpu_init_mtrr", log::LevelFilter::Info), ("cpu_init_interrupts::vector_table", log::LevelFilter::Debug)];

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "uefi", target_arch = "x86_64"))] {
        use cpu_init_sdk::serial::{Interface, Uart16550};

        static LOGGER: SerialLogger<Uart16550> =
            SerialLogger::new(Format::Standard, TARGET_FILTERS, log::LevelFilter::Info, Uart16550::new(Interface::Io(0x3F8)));
    } else if #[cfg(feature = "std")] {
        use cpu_init_sdk::serial::Terminal;

        static LOGGER: SerialLogger<Terminal> =
            SerialLogger::new(Format::Standard, TARGET_FILTERS, log::LevelFilter::Info, Terminal);
    } else {
        use cpu_init_sdk::serial::UartNull;

        static LOGGER: SerialLogger<UartNull> =
            SerialLogger::new(Format::Standard, TARGET_FILTERS, log::LevelFilter::Off, UartNull);
    }
}

/// Installs the driver's logger as the global `log` sink.
///
/// # Errors
///
/// Returns [`AlreadyStarted`](EfiError::AlreadyStarted) if a logger is already installed.
pub fn init_logger() -> Result<()> {
    LOGGER.init();
    log::set_logger(&LOGGER).map_err(|_| EfiError::AlreadyStarted)?;
    log::set_max_level(LOGGER.max_level());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logger_once() {
        let first = init_logger();
        assert!(first.is_ok() || first == Err(EfiError::AlreadyStarted));
        assert_eq!(init_logger(), Err(EfiError::AlreadyStarted));
    }
}
