//! A [SerialIO](super::SerialIO) that discards everything.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

/// A serial port that drops writes and never has data to read.
#[derive(Debug, Default)]
pub struct Uart;

impl super::SerialIO for Uart {
    fn init(&self) {}

    fn write(&self, _buffer: &[u8]) {}

    fn read(&self) -> u8 {
        0
    }

    fn try_read(&self) -> Option<u8> {
        None
    }
}
