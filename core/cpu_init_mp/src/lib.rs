//! Multiprocessor bring-up and task dispatch.
//!
//! The bootstrap processor (BSP) wakes every application processor (AP) with INIT and two start-up IPIs pointed at a
//! real-mode stub copied into a [LowMemoryArena](arena::LowMemoryArena). Waking APs count themselves, then run a
//! second detailed-init pass, and finally settle into a procedure loop where they wait for work.
//!
//! Every processor has a [CpuData](cpu_data::CpuData) record with an atomic state:
//!
//! ```text
//!   Idle -> Blocked -> Ready -> Busy -> Finished -> Idle
//!     \___________________________________________/
//!                         |
//!                     Disabled (failed BIST or disabled by the caller)
//! ```
//!
//! The dispatcher ([MpServices]) owns the Idle/Blocked/Ready and Finished/Idle edges, an AP owns Ready/Busy and
//! Busy/Finished. Processors coordinate through shared memory only. Waiting is a poll with a stall in between, and
//! non-blocking requests are advanced by [MpServices::check_all_aps_status] from a periodic timer.
//!
//! ## Features
//!
//! - `sim`: Exposes [sim::SimPlatform], a deterministic simulated processor set for host tests.
//! - `mockall`: Exposes `MockMpEvent`.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

use alloc::sync::Arc;

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

pub mod arena;
mod config;
pub mod cpu_data;
mod dispatch;
mod exchange_role;
pub mod platform;
mod services;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod timeout;
pub mod wakeup;

pub use config::MpConfig;
pub use dispatch::StartupError;
pub use exchange_role::{ExchangeRoleInfo, ExchangeState};
pub use services::MpServices;

/// Work handed to an AP. Called with the processor number of the AP running it.
pub type ApProcedure = Arc<dyn Fn(usize) + Send + Sync>;

/// Completion notification for non-blocking requests.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait MpEvent: Send + Sync {
    fn signal(&self);
}

/// What an AP does after one pass through its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApLoopAction {
    /// Keep polling.
    Continue,
    /// Halt until the next INIT/start-up IPI.
    Halt,
}
