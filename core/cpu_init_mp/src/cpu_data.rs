//! Per-processor records and the data shared by every processor.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;
use cpu_init_mtrr::structs::MtrrSettings;

use crate::{arena::WakeUpManner, exchange_role::ExchangeRoleInfo, ApProcedure, MpEvent};

/// Deadline value meaning "wait forever".
pub const NO_DEADLINE: u64 = u64::MAX;

/// Start signal value written to wake a looping AP.
pub const START_SIGNALED: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CpuState {
    Idle = 0,
    /// Queued behind another AP of a single-threaded batch.
    Blocked = 1,
    /// Armed, the AP picks the task up on its next pass.
    Ready = 2,
    Busy = 3,
    /// Done, waiting for the dispatcher to reclaim it.
    Finished = 4,
    Disabled = 5,
}

impl CpuState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Blocked,
            2 => Self::Ready,
            3 => Self::Busy,
            4 => Self::Finished,
            _ => Self::Disabled,
        }
    }

    /// A task is assigned but has not been reclaimed.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Blocked | Self::Ready | Self::Busy)
    }
}

/// A [CpuState] shared between processors.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub const fn new(state: CpuState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> CpuState {
        CpuState::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Moves from `from` to `to`. Fails, changing nothing, if the state is no longer `from`.
    pub fn transition(&self, from: CpuState, to: CpuState) -> bool {
        self.0.compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Unconditional store. Only the reset and enable/disable paths use it.
    pub fn force(&self, state: CpuState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

bitflags! {
    /// Processor status flags, as reported by the PI MP services.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u32 {
        const BSP = 1 << 0;
        const ENABLED = 1 << 1;
        const HEALTHY = 1 << 2;
    }
}

/// Package, core and thread of a logical processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorLocation {
    pub package: u32,
    pub core: u32,
    pub thread: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorInformation {
    /// The APIC ID.
    pub processor_id: u64,
    pub status_flag: StatusFlags,
    pub location: ProcessorLocation,
}

/// One logical processor.
pub struct CpuData {
    apic_id: u32,
    bist: u32,
    pub state: StateCell,
    healthy: AtomicBool,
    location: spin::Mutex<ProcessorLocation>,
    secondary_thread: AtomicBool,
    task: spin::Mutex<Option<ApProcedure>>,
    start_signal: AtomicU32,
    deadline: AtomicU64,
    wait_event: spin::Mutex<Option<Arc<dyn MpEvent>>>,
}

impl CpuData {
    /// A processor that reported `bist` during discovery. Anything but 0 leaves it disabled and unhealthy.
    pub fn new(apic_id: u32, bist: u32) -> Self {
        let healthy = bist == 0;
        Self {
            apic_id,
            bist,
            state: StateCell::new(if healthy { CpuState::Idle } else { CpuState::Disabled }),
            healthy: AtomicBool::new(healthy),
            location: spin::Mutex::new(ProcessorLocation::default()),
            secondary_thread: AtomicBool::new(false),
            task: spin::Mutex::new(None),
            start_signal: AtomicU32::new(0),
            deadline: AtomicU64::new(NO_DEADLINE),
            wait_event: spin::Mutex::new(None),
        }
    }

    pub fn apic_id(&self) -> u32 {
        self.apic_id
    }

    pub fn bist(&self) -> u32 {
        self.bist
    }

    pub fn failed_self_test(&self) -> bool {
        self.bist != 0
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn location(&self) -> ProcessorLocation {
        *self.location.lock()
    }

    pub fn set_location(&self, location: ProcessorLocation) {
        *self.location.lock() = location;
        self.secondary_thread.store(location.thread != 0, Ordering::Release);
    }

    /// Whether this is not the first thread of its core.
    pub fn is_secondary_thread(&self) -> bool {
        self.secondary_thread.load(Ordering::Acquire)
    }

    pub(crate) fn set_task(&self, task: Option<ApProcedure>) {
        *self.task.lock() = task;
    }

    pub(crate) fn task(&self) -> Option<ApProcedure> {
        self.task.lock().clone()
    }

    pub(crate) fn signal_start(&self) {
        self.start_signal.store(START_SIGNALED, Ordering::Release);
    }

    /// Consumes a pending start signal.
    pub(crate) fn take_start_signal(&self) -> bool {
        self.start_signal.swap(0, Ordering::AcqRel) == START_SIGNALED
    }

    pub(crate) fn deadline(&self) -> u64 {
        self.deadline.load(Ordering::Acquire)
    }

    pub(crate) fn set_deadline(&self, deadline: u64) {
        self.deadline.store(deadline, Ordering::Release);
    }

    pub(crate) fn set_wait_event(&self, event: Option<Arc<dyn MpEvent>>) {
        *self.wait_event.lock() = event;
    }

    pub(crate) fn take_wait_event(&self) -> Option<Arc<dyn MpEvent>> {
        self.wait_event.lock().take()
    }

    pub(crate) fn has_wait_event(&self) -> bool {
        self.wait_event.lock().is_some()
    }
}

impl core::fmt::Debug for CpuData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CpuData")
            .field("apic_id", &self.apic_id)
            .field("bist", &self.bist)
            .field("state", &self.state.get())
            .field("healthy", &self.is_healthy())
            .field("location", &self.location())
            .finish()
    }
}

/// State shared by the BSP and every AP for the lifetime of the boot session.
pub struct MpSystemData {
    cpus: spin::Once<Vec<CpuData>>,
    bsp_index: AtomicUsize,
    wakeup_manner: AtomicU8,
    mtrr_snapshot: spin::Mutex<Option<MtrrSettings>>,
    reserved_variable_mtrrs: usize,
    pub(crate) exchange: ExchangeRoleInfo,
    /// Held for structural changes of the processor list.
    pub(crate) ap_serialize_lock: spin::Mutex<()>,
}

impl MpSystemData {
    pub fn new(wakeup_manner: WakeUpManner, reserved_variable_mtrrs: usize) -> Self {
        Self {
            cpus: spin::Once::new(),
            bsp_index: AtomicUsize::new(0),
            wakeup_manner: AtomicU8::new(wakeup_manner as u8),
            mtrr_snapshot: spin::Mutex::new(None),
            reserved_variable_mtrrs,
            exchange: ExchangeRoleInfo::new(),
            ap_serialize_lock: spin::Mutex::new(()),
        }
    }

    /// Records the processors found by discovery. The first call wins.
    pub(crate) fn populate(&self, cpus: Vec<CpuData>) -> &[CpuData] {
        self.cpus.call_once(|| cpus)
    }

    /// Every processor, BSP included. Empty until discovery completes.
    pub fn cpus(&self) -> &[CpuData] {
        self.cpus.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn cpu(&self, number: usize) -> Option<&CpuData> {
        self.cpus().get(number)
    }

    pub fn processor_count(&self) -> usize {
        self.cpus().len()
    }

    pub fn bsp_index(&self) -> usize {
        self.bsp_index.load(Ordering::Acquire)
    }

    pub(crate) fn set_bsp_index(&self, index: usize) {
        self.bsp_index.store(index, Ordering::Release);
    }

    pub fn find_by_apic_id(&self, apic_id: u32) -> Option<usize> {
        self.cpus().iter().position(|cpu| cpu.apic_id() == apic_id)
    }

    pub fn wakeup_manner(&self) -> WakeUpManner {
        WakeUpManner::from_raw(self.wakeup_manner.load(Ordering::Acquire))
    }

    pub(crate) fn set_wakeup_manner(&self, manner: WakeUpManner) {
        self.wakeup_manner.store(manner as u8, Ordering::Release);
    }

    /// The MTRR state APs load during detailed init.
    pub fn mtrr_snapshot(&self) -> Option<MtrrSettings> {
        *self.mtrr_snapshot.lock()
    }

    pub(crate) fn set_mtrr_snapshot(&self, settings: Option<MtrrSettings>) {
        *self.mtrr_snapshot.lock() = settings;
    }

    pub fn reserved_variable_mtrrs(&self) -> usize {
        self.reserved_variable_mtrrs
    }

    /// Enabled application processors.
    pub fn enabled_aps(&self) -> impl Iterator<Item = usize> + '_ {
        let bsp = self.bsp_index();
        self.cpus()
            .iter()
            .enumerate()
            .filter(move |(index, cpu)| *index != bsp && cpu.state.get() != CpuState::Disabled)
            .map(|(index, _)| index)
    }
}
