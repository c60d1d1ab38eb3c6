//! Interrupt vector table management and exception dispatch.
//!
//! [VectorTable](vector_table::VectorTable) owns the 256 entry table the processor vectors through. Entries taken
//! over from the table that was live before the driver started are kept in a shadow copy so they can be put back.
//! [ExceptionDispatcher](exception_handling::ExceptionDispatcher) decides what a vector does at runtime: run a
//! registered handler, chain to the original handler, or end in the terminal fault sink.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

pub mod exception_handling;
mod interrupt_state;
pub mod vector_table;

pub use interrupt_state::{disable_interrupts, enable_interrupts, get_interrupt_state, without_interrupts};

use r_efi::protocols::debug_support;

/// Number of vectors in the x86 interrupt descriptor table.
pub const NUM_INTERRUPT_VECTORS: usize = 256;

/// Vectors below this value are processor exceptions.
pub const NUM_PROCESSOR_EXCEPTIONS: usize = 32;

/// Register state captured by the vector entry stubs.
pub type ExceptionContext = debug_support::SystemContextX64;

/// Type for storing the exception type. This corresponds to the vector number.
pub type ExceptionType = usize;

/// A UEFI compliant interrupt handler routine, as registered through the CPU architecture interface.
pub type InterruptHandlerRoutine = extern "efiapi" fn(debug_support::ExceptionType, debug_support::SystemContext);

/// Type for storing the handler for a given exception.
#[derive(Clone, Copy)]
pub enum HandlerType {
    /// No handler is registered.
    None,
    /// Handler is a UEFI compliant routine.
    UefiRoutine(InterruptHandlerRoutine),
    /// Handler is a implementation of the interrupt handler trait.
    Handler(&'static dyn InterruptHandler),
}

impl HandlerType {
    /// Returns true if the handler is None.
    pub fn is_none(&self) -> bool {
        matches!(self, HandlerType::None)
    }
}

impl core::fmt::Debug for HandlerType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HandlerType::None => f.write_str("None"),
            HandlerType::UefiRoutine(routine) => write!(f, "UefiRoutine({:#x})", *routine as usize),
            HandlerType::Handler(_) => f.write_str("Handler"),
        }
    }
}

/// Trait for structs to handle interrupts.
///
/// Interrupt handlers are expected to be static and are called from the exception
/// handler. Because exceptions can be reentrant, any mutable state within the
/// handler is expected to leverage internal locking.
///
pub trait InterruptHandler: Sync {
    /// Invoked when the registered interrupt is triggered.
    ///
    /// Upon return, the processor will be resumed from the exception with any
    /// changes made to the provided exception context. If it is not safe to resume,
    /// then the handler should panic or otherwise halt the system.
    ///
    fn handle_interrupt(&'static self, exception_type: ExceptionType, context: &mut ExceptionContext);
}
