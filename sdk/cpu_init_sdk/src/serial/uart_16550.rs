//! [SerialIO](super::SerialIO) implementation for a uart_16550 device.
//!
//! The debug UART on the MinnowBoard3 is the legacy COM1 port at `0x3F8`. The memory mapped variant covers the SoC's
//! LPSS HS-UARTs, which use a 4 byte register stride.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use uart_16550::MmioSerialPort;
use uart_16550::SerialPort as IoSerialPort;

/// The port type for the Uart16550 serial port.
#[derive(Debug, Clone, Copy)]
pub enum Interface {
    /// The I/O interface for the Uart16550 serial port.
    Io(u16),
    /// The Memory Mapped I/O interface for the Uart16550 serial port.
    Mmio { base: usize, reg_stride: usize },
}

/// An interface for writing to a Uart 16550 device.
#[derive(Debug)]
pub struct Uart {
    interface: Interface,
}

impl Uart {
    /// Creates a UART accessor. The device is not touched until [init](super::SerialIO::init).
    pub const fn new(interface: Interface) -> Self {
        Self { interface }
    }

    fn with_port<R>(&self, f: impl FnOnce(&mut dyn Port) -> R) -> R {
        match self.interface {
            Interface::Io(base) => {
                // SAFETY: the caller of `new` owns the I/O port range starting at `base`.
                let mut port = unsafe { IoSerialPort::new(base) };
                f(&mut port)
            }
            Interface::Mmio { base, reg_stride } => {
                // SAFETY: the caller of `new` owns the MMIO window starting at `base`.
                let mut port = unsafe { MmioSerialPort::new_with_stride(base, reg_stride) };
                f(&mut port)
            }
        }
    }
}

trait Port {
    fn init(&mut self);
    fn send(&mut self, data: u8);
    fn receive(&mut self) -> u8;
    fn try_receive(&mut self) -> Option<u8>;
}

impl Port for IoSerialPort {
    fn init(&mut self) {
        IoSerialPort::init(self)
    }
    fn send(&mut self, data: u8) {
        IoSerialPort::send(self, data)
    }
    fn receive(&mut self) -> u8 {
        IoSerialPort::receive(self)
    }
    fn try_receive(&mut self) -> Option<u8> {
        IoSerialPort::try_receive(self).ok()
    }
}

impl Port for MmioSerialPort {
    fn init(&mut self) {
        MmioSerialPort::init(self)
    }
    fn send(&mut self, data: u8) {
        MmioSerialPort::send(self, data)
    }
    fn receive(&mut self) -> u8 {
        MmioSerialPort::receive(self)
    }
    fn try_receive(&mut self) -> Option<u8> {
        MmioSerialPort::try_receive(self).ok()
    }
}

impl super::SerialIO for Uart {
    fn init(&self) {
        self.with_port(|port| port.init());
    }

    fn write(&self, buffer: &[u8]) {
        self.with_port(|port| {
            for b in buffer {
                port.send(*b);
            }
        });
    }

    fn read(&self) -> u8 {
        self.with_port(|port| port.receive())
    }

    fn try_read(&self) -> Option<u8> {
        self.with_port(|port| port.try_receive())
    }
}
