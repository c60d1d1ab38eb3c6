//! UEFI targeted logging implementations
//!
//! ## Examples
//!
//! ```rust ignore
//! use cpu_init_sdk::log::{Format, SerialLogger};
//! use cpu_init_sdk::serial::{Interface, Uart16550};
//!
//! static LOGGER: SerialLogger<Uart16550> = SerialLogger::new(
//!    Format::Standard,
//!    &[("cpu_init_mp::sim", log::LevelFilter::Off)],
//!    log::LevelFilter::Info,
//!    Uart16550::new(Interface::Io(0x3F8)),
//! );
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

mod serial_logger;
pub use serial_logger::Logger as SerialLogger;

/// Enum to describe the format of the log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Standard text format containing the log level and message.
    Standard,
    /// JSON blob containing the log level and message.
    Json,
    /// Verbose JSON blob containing the log level, message, target, and file path and line number.
    VerboseJson,
}

impl Format {
    /// Formats the log message and writes it to the target.
    ///
    /// No heap allocation happens here. Application processors log through the same sink before any allocator
    /// state on their side is trusted.
    pub fn write<T: core::fmt::Write>(&self, target: &mut T, record: &log::Record) -> core::fmt::Result {
        match self {
            Format::Standard if record.level() == log::Level::Trace => writeln!(
                target,
                "TRACE - {}:{}: {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            ),
            Format::Standard => writeln!(target, "{} - {}", record.level(), record.args()),
            Format::Json => {
                writeln!(target, "{{\"level\": \"{}\", \"message\": \"{}\"}}", record.level(), record.args())
            }
            Format::VerboseJson => writeln!(
                target,
                "{{\"level\": \"{}\", \"target\": \"{}\", \"message\": \"{}\", \"file\": \"{}\", \"line\": \"{}\"}}",
                record.level(),
                record.target(),
                record.args(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0)
            ),
        }
    }
}
