//! Runtime dispatch of interrupts and exceptions.
//!
//! Each vector has a slot holding the handler registered through the CPU architecture interface. Interrupt vectors
//! that had a handler before the driver took over the table fall through to it when nothing is registered.
//! Everything else ends in [ExceptionDispatcher::handle_exception], which dumps the register context, reports an
//! unrecovered error status code and halts the processor.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::sync::Arc;

use cpu_init_sdk::{
    error::{EfiError, Result},
    log_registers,
    status_code::{
        ia32_exception, EfiStatusCodeValue, ReportStatusCode, EFI_ERROR_CODE, EFI_ERROR_UNRECOVERED,
        EFI_SOFTWARE_DXE_BS_DRIVER, EFI_SOFTWARE_UNSPECIFIED,
    },
};
use r_efi::protocols::debug_support;
use spin::rwlock::RwLock;

use crate::{
    vector_table::{OriginalHandler, VectorTable},
    ExceptionContext, ExceptionType, HandlerType, NUM_INTERRUPT_VECTORS, NUM_PROCESSOR_EXCEPTIONS,
};

/// What the vector entry stub does after [ExceptionDispatcher::dispatch] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A registered handler ran. Resume with the (possibly modified) context.
    Handled,
    /// Nothing is registered. Jump to the handler the vector had before the driver took over.
    ChainToOriginal(OriginalHandler),
}

/// Status code value reported for an unhandled `vector`.
pub fn exception_status_code(vector: ExceptionType) -> EfiStatusCodeValue {
    let specific = match vector {
        0x00 => ia32_exception::DIVIDE_ERROR,
        0x01 => ia32_exception::DEBUG,
        0x02 => ia32_exception::NMI,
        0x03 => ia32_exception::BREAKPOINT,
        0x04 => ia32_exception::OVERFLOW,
        0x05 => ia32_exception::BOUND,
        0x06 => ia32_exception::INVALID_OPCODE,
        0x08 => ia32_exception::DOUBLE_FAULT,
        0x0A => ia32_exception::INVALID_TSS,
        0x0B => ia32_exception::SEG_NOT_PRESENT,
        0x0C => ia32_exception::STACK_FAULT,
        0x0D => ia32_exception::GP_FAULT,
        0x0E => ia32_exception::PAGE_FAULT,
        0x10 => ia32_exception::FP_ERROR,
        0x11 => ia32_exception::ALIGNMENT_CHECK,
        0x12 => ia32_exception::MACHINE_CHECK,
        0x13 => ia32_exception::SIMD,
        _ => return EFI_SOFTWARE_UNSPECIFIED,
    };
    EFI_SOFTWARE_DXE_BS_DRIVER | specific
}

/// Handler slots for every vector plus the handlers inherited from the original table.
pub struct ExceptionDispatcher {
    // RwLock so a nested exception on the same vector can still read its slot.
    handlers: [RwLock<HandlerType>; NUM_INTERRUPT_VECTORS],
    originals: [Option<OriginalHandler>; NUM_INTERRUPT_VECTORS],
    status_code: Arc<dyn ReportStatusCode>,
}

impl ExceptionDispatcher {
    /// Creates a dispatcher with no handlers registered.
    ///
    /// Interrupt vectors inherit their original handler from `table`. Processor exceptions never chain, an
    /// unregistered exception always reaches the fault sink.
    pub fn new(table: &VectorTable, status_code: Arc<dyn ReportStatusCode>) -> Self {
        Self {
            handlers: core::array::from_fn(|_| RwLock::new(HandlerType::None)),
            originals: core::array::from_fn(|vector| match vector {
                v if v < NUM_PROCESSOR_EXCEPTIONS => None,
                v => table.original_handler(v),
            }),
            status_code,
        }
    }

    /// Registers a handler callback for the provided exception type.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidParameter`](EfiError::InvalidParameter) if the exception type is above the expected range,
    /// or `handler` is [HandlerType::None].
    /// Returns [`AlreadyStarted`](EfiError::AlreadyStarted) if a callback has already been registered.
    ///
    pub fn register(&self, exception_type: ExceptionType, handler: HandlerType) -> Result<()> {
        if handler.is_none() || exception_type >= NUM_INTERRUPT_VECTORS {
            return Err(EfiError::InvalidParameter);
        }

        let mut entry = self.handlers[exception_type].write();
        if !entry.is_none() {
            return Err(EfiError::AlreadyStarted);
        }

        *entry = handler;
        log::debug!("Registered handler for vector {exception_type:#04x}: {handler:?}");
        Ok(())
    }

    /// Removes a handler callback for the provided exception type.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidParameter`](EfiError::InvalidParameter) if the exception type is above the expected range.
    /// Returns [`InvalidParameter`](EfiError::InvalidParameter) if no callback currently exists.
    ///
    pub fn unregister(&self, exception_type: ExceptionType) -> Result<()> {
        if exception_type >= NUM_INTERRUPT_VECTORS {
            return Err(EfiError::InvalidParameter);
        }

        let mut entry = self.handlers[exception_type].write();
        if entry.is_none() {
            return Err(EfiError::InvalidParameter);
        }

        *entry = HandlerType::None;
        log::debug!("Unregistered handler for vector {exception_type:#04x}");
        Ok(())
    }

    pub fn is_registered(&self, exception_type: ExceptionType) -> bool {
        self.handlers.get(exception_type).is_some_and(|entry| !entry.read().is_none())
    }

    /// Runs whatever vector `exception_type` is bound to.
    ///
    /// Does not return when the vector has neither a registered nor an original handler.
    pub fn dispatch(&self, exception_type: ExceptionType, context: &mut ExceptionContext) -> Dispatch {
        let handler = match self.handlers.get(exception_type).and_then(|entry| entry.try_read()) {
            Some(entry) => *entry,
            None => HandlerType::None,
        };

        match handler {
            HandlerType::UefiRoutine(routine) => {
                let system_context = debug_support::SystemContext { system_context_x64: context as *mut _ };
                routine(exception_type as debug_support::ExceptionType, system_context);
                Dispatch::Handled
            }
            HandlerType::Handler(handler) => {
                handler.handle_interrupt(exception_type, context);
                Dispatch::Handled
            }
            HandlerType::None => match self.originals.get(exception_type).copied().flatten() {
                Some(original) => Dispatch::ChainToOriginal(original),
                None => self.handle_exception(exception_type, context),
            },
        }
    }

    /// Terminal sink for unhandled exceptions.
    pub fn handle_exception(&self, exception_type: ExceptionType, context: &ExceptionContext) -> ! {
        log::error!("Unhandled Exception! {exception_type:#X}");
        log::error!("");
        dump_system_context_registers(context);
        log::error!("");

        let value = exception_status_code(exception_type);
        if let Err(err) = self.status_code.report_status_code(EFI_ERROR_CODE | EFI_ERROR_UNRECOVERED, value, 0) {
            log::error!("Failed to report exception status code {value:#x}: {err}");
        }

        halt(exception_type)
    }
}

fn dump_system_context_registers(context: &ExceptionContext) {
    log::error!("Control Registers:");
    log_registers!(
        "CR0",
        context.cr0,
        "CR2",
        context.cr2,
        "CR3",
        context.cr3,
        "CR4",
        context.cr4,
        "RIP",
        context.rip,
        "CS",
        context.cs,
        "SS",
        context.ss,
        "DS",
        context.ds,
        "RSP",
        context.rsp,
        "RFLAGS",
        context.rflags
    );

    log::error!("");

    log::error!("General-Purpose Registers:");
    log_registers!(
        "RAX", context.rax, "RBX", context.rbx, "RCX", context.rcx, "RDX", context.rdx, "RSI", context.rsi, "RDI",
        context.rdi, "RBP", context.rbp, "R8", context.r8, "R9", context.r9, "R10", context.r10, "R11", context.r11,
        "R12", context.r12, "R13", context.r13, "R14", context.r14, "R15", context.r15
    );
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "uefi", target_arch = "x86_64"))] {
        fn halt(_exception_type: ExceptionType) -> ! {
            x86_64::instructions::interrupts::disable();
            loop {
                x86_64::instructions::hlt();
            }
        }
    } else {
        fn halt(exception_type: ExceptionType) -> ! {
            panic!("Unhandled Exception! {exception_type:#X}");
        }
    }
}
