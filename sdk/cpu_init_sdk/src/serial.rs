//! Serial IO sinks for the logger.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod uart_16550;
        pub use uart_16550::{Interface, Uart as Uart16550};
    }
}

mod uart_null;
pub use uart_null::Uart as UartNull;

#[cfg(feature = "std")]
mod std;
#[cfg(feature = "std")]
pub use std::Terminal;

/// Byte oriented serial device used as the log sink.
pub trait SerialIO: Sync {
    /// Programs the device so it can be written to.
    fn init(&self);
    /// Writes every byte of `buffer`, blocking as needed.
    fn write(&self, buffer: &[u8]);
    /// Reads a single byte, blocking until one is available.
    fn read(&self) -> u8;
    /// Reads a single byte if one is pending.
    fn try_read(&self) -> Option<u8>;
}
