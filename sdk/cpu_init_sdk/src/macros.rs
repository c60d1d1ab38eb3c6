//! Macro definitions for the CPU init SDK.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

/// Returns a `u64` with only bit `$n` set.
///
/// ```rust
/// use cpu_init_sdk::bit;
///
/// assert_eq!(bit!(11), 0x800);
/// ```
#[macro_export]
macro_rules! bit {
    ($n:expr) => {
        (1u64 << ($n))
    };
}

/// Extracts bits `$high..=$low` of `$value` as a `u64`.
///
/// ```rust
/// use cpu_init_sdk::bit_field;
///
/// assert_eq!(bit_field!(0xABCD_u64, 11, 8), 0xB);
/// ```
#[macro_export]
macro_rules! bit_field {
    ($value:expr, $high:expr, $low:expr) => {
        ((($value) as u64 >> ($low)) & ((1u64 << (($high) - ($low) + 1)) - 1))
    };
}

/// Logs register name and value pairs, three per line.
///
/// Used by the exception paths where the full register context must be dumped before the processor is halted.
#[macro_export]
macro_rules! log_registers {
    ($($name:expr, $value:expr),+ $(,)?) => {{
        let registers: &[(&str, u64)] = &[$(($name, $value as u64)),+];
        for chunk in registers.chunks(3) {
            match chunk {
                [(n0, v0), (n1, v1), (n2, v2)] => {
                    log::error!("{n0:>6}: {v0:#018X}  {n1:>6}: {v1:#018X}  {n2:>6}: {v2:#018X}")
                }
                [(n0, v0), (n1, v1)] => log::error!("{n0:>6}: {v0:#018X}  {n1:>6}: {v1:#018X}"),
                [(n0, v0)] => log::error!("{n0:>6}: {v0:#018X}"),
                _ => {}
            }
        }
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_bit_macros() {
        assert_eq!(bit!(0), 1);
        assert_eq!(bit!(63), 0x8000_0000_0000_0000);
        assert_eq!(bit_field!(0xFEE0_0900_u64, 11, 8), 0x9);
        assert_eq!(bit_field!(0x0000_0000_0000_0FFF_u64, 11, 11), 1);
    }
}
