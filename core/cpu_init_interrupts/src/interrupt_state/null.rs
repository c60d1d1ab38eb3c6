//! Null interrupt flag control - For host builds and tests
//!
//! There is no flag to flip. The state is only remembered so callers that save and restore it behave the same way
//! they do on hardware. Host builds keep it per thread so parallel tests do not see each other.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use cpu_init_sdk::error::EfiError;

cfg_if::cfg_if! {
    if #[cfg(any(test, feature = "std"))] {
        use core::cell::Cell;

        std::thread_local! {
            static INTERRUPT_STATE: Cell<bool> = const { Cell::new(false) };
        }

        fn store(enabled: bool) {
            INTERRUPT_STATE.with(|state| state.set(enabled));
        }

        fn load() -> bool {
            INTERRUPT_STATE.with(|state| state.get())
        }
    } else {
        use core::sync::atomic::{AtomicBool, Ordering};

        static INTERRUPT_STATE: AtomicBool = AtomicBool::new(false);

        fn store(enabled: bool) {
            INTERRUPT_STATE.store(enabled, Ordering::SeqCst);
        }

        fn load() -> bool {
            INTERRUPT_STATE.load(Ordering::SeqCst)
        }
    }
}

pub fn enable_interrupts() {
    store(true);
}

pub fn disable_interrupts() {
    store(false);
}

pub fn get_interrupt_state() -> Result<bool, EfiError> {
    Ok(load())
}
