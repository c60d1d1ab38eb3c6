//! Interrupt vector table ownership.
//!
//! The table that was live when the driver started is copied aside once at construction. The driver's live table
//! starts out as that copy, with any vector the original table did not have pointed at a firmware stub. Installing a
//! vector points its gate at a new handler. Restoring a vector writes the shadow entry back, and is a silent no-op
//! for vectors the original table never had.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{boxed::Box, vec::Vec};

use bitfield_struct::bitfield;
use cpu_init_sdk::error::{EfiError, Result};

use crate::{interrupt_state::without_interrupts, NUM_INTERRUPT_VECTORS};

/// 64-bit interrupt gate type.
pub const INTERRUPT_GATE_TYPE: u8 = 0xE;

/// An IA32e mode gate descriptor.
#[bitfield(u128)]
#[derive(PartialEq, Eq)]
pub struct GateDescriptor {
    pub offset_low: u16,
    pub selector: u16,
    #[bits(3)]
    pub ist: u8,
    #[bits(5)]
    __: u8,
    #[bits(4)]
    pub gate_type: u8,
    __: bool,
    #[bits(2)]
    pub dpl: u8,
    pub present: bool,
    pub offset_mid: u16,
    pub offset_high: u32,
    __: u32,
}

impl GateDescriptor {
    /// A present ring 0 interrupt gate to `handler` through code segment `selector`.
    pub fn interrupt_gate(selector: u16, handler: u64) -> Self {
        Self::new()
            .with_selector(selector)
            .with_gate_type(INTERRUPT_GATE_TYPE)
            .with_present(true)
            .with_handler_address(handler)
    }

    /// The handler address split across the three offset fields.
    pub fn handler_address(&self) -> u64 {
        self.offset_low() as u64 | (self.offset_mid() as u64) << 16 | (self.offset_high() as u64) << 32
    }

    pub fn with_handler_address(self, handler: u64) -> Self {
        self.with_offset_low(handler as u16).with_offset_mid((handler >> 16) as u16).with_offset_high((handler >> 32) as u32)
    }
}

/// The address of the handler an original table entry pointed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginalHandler(pub u64);

/// The live interrupt vector table plus the shadow of the table it replaced.
pub struct VectorTable {
    live: Box<[GateDescriptor; NUM_INTERRUPT_VECTORS]>,
    shadow: Vec<GateDescriptor>,
    code_selector: u16,
}

impl VectorTable {
    /// Builds the live table from `original`.
    ///
    /// Entries past the original table's length become interrupt gates through `code_selector` to
    /// `default_stub(vector)`. At most [NUM_INTERRUPT_VECTORS] original entries are kept.
    pub fn new(original: &[GateDescriptor], code_selector: u16, default_stub: impl Fn(usize) -> u64) -> Self {
        let shadow: Vec<GateDescriptor> = original.iter().take(NUM_INTERRUPT_VECTORS).copied().collect();
        let live = Box::new(core::array::from_fn(|vector| match shadow.get(vector) {
            Some(entry) => *entry,
            None => GateDescriptor::interrupt_gate(code_selector, default_stub(vector)),
        }));
        log::debug!("Vector table: {} original entries, {} extended", shadow.len(), NUM_INTERRUPT_VECTORS - shadow.len());
        Self { live, shadow, code_selector }
    }

    /// Number of entries the original table had.
    pub fn original_len(&self) -> usize {
        self.shadow.len()
    }

    /// Handler the original table had for `index`, if it had that vector at all.
    pub fn original_handler(&self, index: usize) -> Option<OriginalHandler> {
        self.shadow.get(index).filter(|entry| entry.present()).map(|entry| OriginalHandler(entry.handler_address()))
    }

    pub fn entry(&self, index: usize) -> Option<GateDescriptor> {
        self.live.get(index).copied()
    }

    /// Points vector `index` at `handler`.
    ///
    /// The gate keeps the selector it had, extended entries use the driver's code selector. Interrupts are off
    /// while the entry is rewritten.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidParameter`](EfiError::InvalidParameter) if `index` is not a valid vector.
    pub fn install_vector(&mut self, index: usize, handler: u64) -> Result<()> {
        if index >= NUM_INTERRUPT_VECTORS {
            return Err(EfiError::InvalidParameter);
        }
        let selector = match self.shadow.get(index) {
            Some(entry) if entry.present() => entry.selector(),
            _ => self.code_selector,
        };
        let live = &mut self.live;
        without_interrupts(|| live[index] = GateDescriptor::interrupt_gate(selector, handler))?;
        log::trace!("Vector {index:#04x} -> {handler:#x}");
        Ok(())
    }

    /// Writes the original entry for `index` back. Vectors the original table did not have are left untouched.
    pub fn restore_vector(&mut self, index: usize) -> Result<()> {
        let Some(original) = self.shadow.get(index).copied() else {
            return Ok(());
        };
        let live = &mut self.live;
        without_interrupts(|| live[index] = original)?;
        log::trace!("Vector {index:#04x} restored");
        Ok(())
    }

    /// Base and limit of the live table, as loaded into IDTR.
    pub fn descriptor(&self) -> (u64, u16) {
        let base = self.live.as_ptr() as u64;
        let limit = (core::mem::size_of::<[GateDescriptor; NUM_INTERRUPT_VECTORS]>() - 1) as u16;
        (base, limit)
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "uefi", target_arch = "x86_64"))] {
        use x86_64::{instructions::tables, structures::DescriptorTablePointer, VirtAddr};

        impl VectorTable {
            /// Copies the table the processor is currently using.
            ///
            /// # Safety
            ///
            /// IDTR must describe a mapped, readable table.
            pub unsafe fn capture_current() -> Vec<GateDescriptor> {
                let idtr = tables::sidt();
                let count = (idtr.limit as usize + 1) / core::mem::size_of::<GateDescriptor>();
                // SAFETY: the caller guarantees IDTR points at `count` descriptors.
                unsafe { core::slice::from_raw_parts(idtr.base.as_ptr::<GateDescriptor>(), count) }.to_vec()
            }

            /// Makes the live table the one the processor vectors through.
            ///
            /// # Safety
            ///
            /// Every present entry must point at a valid handler, and `self` must outlive its use by the processor.
            pub unsafe fn load(&self) {
                let (base, limit) = self.descriptor();
                let pointer = DescriptorTablePointer { limit, base: VirtAddr::new(base) };
                // SAFETY: forwarded from the caller.
                unsafe { tables::lidt(&pointer) };
            }
        }
    }
}
