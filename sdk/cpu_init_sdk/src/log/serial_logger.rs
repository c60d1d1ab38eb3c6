//! A serial logger implementation for the `log` crate.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use super::Format;
use crate::serial::SerialIO;

/// A Base implementation for a logger.
///
/// ## Functionality
///
/// This implementation writes log messages directly to a hardware port. Every record is emitted while holding a
/// spin lock so lines from different processors do not interleave.
pub struct Logger<'a, S>
where
    S: SerialIO + Send,
{
    serial_port: S,
    target_filters: &'a [(&'a str, log::LevelFilter)],
    max_level: log::LevelFilter,
    format: Format,
    lock: spin::Mutex<()>,
}

impl<'a, S> Logger<'a, S>
where
    S: SerialIO + Send,
{
    /// Creates a logger. Filters are matched by target prefix, first match wins.
    pub const fn new(
        format: Format,
        target_filters: &'a [(&'a str, log::LevelFilter)],
        max_level: log::LevelFilter,
        serial_port: S,
    ) -> Self {
        Self { serial_port, target_filters, max_level, format, lock: spin::Mutex::new(()) }
    }

    /// Initializes the serial device behind the logger.
    pub fn init(&self) {
        self.serial_port.init();
    }

    /// The most verbose level any filter of this logger lets through, for [log::set_max_level].
    pub fn max_level(&self) -> log::LevelFilter {
        self.target_filters.iter().map(|(_, level)| *level).fold(self.max_level, core::cmp::max)
    }
}

impl<S> log::Log for Logger<'_, S>
where
    S: SerialIO + Send,
{
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level().to_level_filter()
            <= self
                .target_filters
                .iter()
                .find(|(name, _)| metadata.target().starts_with(name))
                .map(|(_, level)| *level)
                .unwrap_or(self.max_level)
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let _guard = self.lock.lock();
            let mut writer = LogWriter { serial_port: &self.serial_port };
            // A failing sink has nowhere left to report to.
            let _ = self.format.write(&mut writer, record);
        }
    }

    fn flush(&self) {
        // Do nothing
    }
}

/// A wrapper for handling log writes to a serial IO object.
struct LogWriter<'a, S>
where
    S: SerialIO + Send,
{
    serial_port: &'a S,
}

impl<S> core::fmt::Write for LogWriter<'_, S>
where
    S: SerialIO + Send,
{
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.serial_port.write(s.as_bytes());
        Ok(())
    }
}
