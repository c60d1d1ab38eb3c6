//! The low memory region shared between the BSP and waking APs.
//!
//! APs start in real mode, so the start-up stub and everything it reads must live below 1MB on a 4KB boundary. The
//! region is laid out as:
//!
//! ```text
//!   0x000  start-up stub code
//!   0x400  exchange info (see [exchange_info])
//!   0x800  BIST table, one (APIC ID, BIST) pair per claimed slot
//! ```
//!
//! Every field is a [Field] whose offset is checked when the constant is evaluated. Storage is a run of `AtomicU64`
//! words so both sides can use the fields concurrently.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{boxed::Box, vec::Vec};
use core::{
    marker::PhantomData,
    sync::atomic::{AtomicU64, Ordering},
};

use cpu_init_sdk::{
    base::{is_aligned, SIZE_1MB, SIZE_4KB},
    error::{EfiError, Result},
};

/// Bytes in the arena.
pub const ARENA_SIZE: usize = 0x1000;
/// The stub is copied here, and may use up to [STUB_MAX_SIZE] bytes.
pub const STUB_OFFSET: usize = 0;
pub const STUB_MAX_SIZE: usize = 0x400;
/// Start of the BIST table.
pub const BIST_TABLE_OFFSET: usize = 0x800;
/// Number of slots in the BIST table. APs claiming a slot past this are not recorded.
pub const BIST_TABLE_SLOTS: usize = 64;

const WORD: usize = core::mem::size_of::<u64>();

/// What a woken AP runs once the stub hands over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ApFunction {
    /// Claim a BIST slot and halt.
    CountProcessors = 1,
    /// Initialize FPU, MTRRs and topology, then enter the procedure loop.
    DetailedInit = 2,
    /// Go straight to the procedure loop.
    ProcedureLoop = 3,
    /// Halt for good. Used at exit boot services.
    Park = 4,
}

impl ApFunction {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::CountProcessors),
            2 => Some(Self::DetailedInit),
            3 => Some(Self::ProcedureLoop),
            4 => Some(Self::Park),
            _ => None,
        }
    }
}

/// How an idle AP waits for its next task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WakeUpManner {
    /// HLT, woken by INIT + start-up IPIs.
    HltLoop = 1,
    /// MONITOR/MWAIT on the start signal.
    MwaitLoop = 2,
    /// Spin on the start signal.
    RunLoop = 3,
}

impl WakeUpManner {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            2 => Self::MwaitLoop,
            3 => Self::RunLoop,
            _ => Self::HltLoop,
        }
    }
}

/// Values that fit an arena field.
pub trait ArenaValue: Copy + sealed::Sealed {
    fn to_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
}

impl ArenaValue for u32 {
    fn to_bits(self) -> u64 {
        self as u64
    }
    fn from_bits(bits: u64) -> Self {
        bits as u32
    }
}

impl ArenaValue for u64 {
    fn to_bits(self) -> u64 {
        self
    }
    fn from_bits(bits: u64) -> Self {
        bits
    }
}

/// A typed location in the arena.
#[derive(Debug)]
pub struct Field<T> {
    offset: usize,
    _marker: PhantomData<T>,
}

impl<T> Clone for Field<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Field<T> {}

impl<T: ArenaValue> Field<T> {
    /// Panics, at compile time for constants, if the field is misaligned or runs past the arena.
    pub const fn at(offset: usize) -> Self {
        assert!(offset % core::mem::size_of::<T>() == 0, "misaligned arena field");
        assert!(offset + core::mem::size_of::<T>() <= ARENA_SIZE, "arena field out of range");
        Self { offset, _marker: PhantomData }
    }

    pub const fn offset(&self) -> usize {
        self.offset
    }

    fn word(&self) -> usize {
        self.offset / WORD
    }

    fn shift(&self) -> u32 {
        ((self.offset % WORD) * 8) as u32
    }

    fn mask(&self) -> u64 {
        match core::mem::size_of::<T>() {
            WORD => u64::MAX,
            size => ((1u64 << (size * 8)) - 1) << self.shift(),
        }
    }
}

/// Exchange info fields the stub and the AP side read.
pub mod exchange_info {
    use super::Field;

    /// Serializes APs while they pick a stack.
    pub const LOCK: Field<u32> = Field::at(0x400);
    /// An [ApFunction](super::ApFunction).
    pub const AP_FUNCTION: Field<u32> = Field::at(0x404);
    pub const STACK_START: Field<u64> = Field::at(0x408);
    pub const STACK_SIZE: Field<u32> = Field::at(0x410);
    /// A [WakeUpManner](super::WakeUpManner).
    pub const WAKEUP_MANNER: Field<u32> = Field::at(0x414);
    pub const GDTR_BASE: Field<u64> = Field::at(0x418);
    pub const GDTR_LIMIT: Field<u32> = Field::at(0x420);
    pub const IDTR_LIMIT: Field<u32> = Field::at(0x424);
    pub const IDTR_BASE: Field<u64> = Field::at(0x428);
    pub const CR3: Field<u64> = Field::at(0x430);
    /// Incremented by each AP to claim its BIST slot and stack.
    pub const CLAIM_COUNTER: Field<u32> = Field::at(0x438);
    /// Incremented by each AP when detailed init completes.
    pub const INIT_FINISHED: Field<u32> = Field::at(0x43C);
    pub const BSP_APIC_ID: Field<u32> = Field::at(0x440);
    /// Address of the shared [MpSystemData](crate::cpu_data::MpSystemData).
    pub const SYSTEM_DATA: Field<u64> = Field::at(0x448);
}

/// BIST slot `index`, holding the APIC ID in the low half and the BIST result in the high half.
pub fn bist_slot(index: usize) -> Option<Field<u64>> {
    (index < BIST_TABLE_SLOTS).then(|| Field::at(BIST_TABLE_OFFSET + index * WORD))
}

/// A 4KB region below 1MB.
pub struct LowMemoryArena {
    base: u64,
    words: Box<[AtomicU64]>,
}

impl LowMemoryArena {
    /// Creates a zeroed arena placed at physical address `base`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidParameter`](EfiError::InvalidParameter) if `base` is not 4KB aligned or the arena would not
    /// fit below 1MB.
    pub fn new(base: u64) -> Result<Self> {
        if !is_aligned(base, SIZE_4KB) || base + ARENA_SIZE as u64 > SIZE_1MB {
            return Err(EfiError::InvalidParameter);
        }
        let words: Vec<AtomicU64> = (0..ARENA_SIZE / WORD).map(|_| AtomicU64::new(0)).collect();
        Ok(Self { base, words: words.into_boxed_slice() })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Start-up IPI vector that makes an AP begin at the stub.
    pub fn sipi_vector(&self) -> u8 {
        (self.base >> 12) as u8
    }

    pub fn read<T: ArenaValue>(&self, field: Field<T>) -> T {
        let word = self.words[field.word()].load(Ordering::Acquire);
        T::from_bits((word & field.mask()) >> field.shift())
    }

    pub fn write<T: ArenaValue>(&self, field: Field<T>, value: T) {
        self.update(field, |_| value);
    }

    /// Atomically adds `value` to a counter field and returns the previous value.
    pub fn fetch_add(&self, field: Field<u32>, value: u32) -> u32 {
        self.update(field, |current| current.wrapping_add(value))
    }

    fn update<T: ArenaValue>(&self, field: Field<T>, f: impl Fn(T) -> T) -> T {
        let (shift, mask) = (field.shift(), field.mask());
        let result = self.words[field.word()].fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
            let new = f(T::from_bits((word & mask) >> shift)).to_bits();
            Some((word & !mask) | ((new << shift) & mask))
        });
        let previous = match result {
            Ok(word) | Err(word) => word,
        };
        T::from_bits((previous & mask) >> shift)
    }

    /// Copies `bytes` into the arena at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`BufferTooSmall`](EfiError::BufferTooSmall) if the bytes run past the end of the arena.
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        if offset.checked_add(bytes.len()).map_or(true, |end| end > ARENA_SIZE) {
            return Err(EfiError::BufferTooSmall);
        }
        for (i, byte) in bytes.iter().enumerate() {
            let at = offset + i;
            let shift = ((at % WORD) * 8) as u32;
            let mask = 0xFFu64 << shift;
            let _ = self.words[at / WORD].fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some((word & !mask) | ((*byte as u64) << shift))
            });
        }
        Ok(())
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        (offset..offset.saturating_add(len).min(ARENA_SIZE))
            .map(|at| (self.words[at / WORD].load(Ordering::Acquire) >> ((at % WORD) * 8)) as u8)
            .collect()
    }

    /// Zeroes the exchange info counters and the BIST table before a broadcast.
    pub fn reset_counters(&self) {
        self.write(exchange_info::CLAIM_COUNTER, 0);
        self.write(exchange_info::INIT_FINISHED, 0);
        for slot in (0..BIST_TABLE_SLOTS).filter_map(bist_slot) {
            self.write(slot, 0);
        }
    }
}
