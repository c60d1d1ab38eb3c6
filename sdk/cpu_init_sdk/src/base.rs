//! Base Definitions
//!
//! Size constants and alignment helpers used by the cache-range and low-memory code.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent

/// 4KB, 4096 bytes, 0x1000, 2^12
pub const SIZE_4KB: u64 = 0x1000;

/// 16KB, 16384 bytes, 0x4000, 2^14
pub const SIZE_16KB: u64 = 0x4000;

/// 32KB, 32768 bytes, 0x8000, 2^15
pub const SIZE_32KB: u64 = 0x8000;

/// 64KB, 65536 bytes, 0x10000, 2^16
pub const SIZE_64KB: u64 = 0x10000;

/// 512KB, 0x80000, 2^19
pub const SIZE_512KB: u64 = 0x80000;

/// 640KB, 0xA0000, the start of the legacy VGA window.
pub const SIZE_640KB: u64 = 0xA0000;

/// 768KB, 0xC0000, the start of the legacy option ROM window.
pub const SIZE_768KB: u64 = 0xC0000;

/// 1MB, 0x100000, 2^20
pub const SIZE_1MB: u64 = 0x100000;

/// 2MB, 0x200000, 2^21
pub const SIZE_2MB: u64 = 0x200000;

/// 16MB, 0x1000000, 2^24
pub const SIZE_16MB: u64 = 0x1000000;

/// 256MB, 0x10000000, 2^28
pub const SIZE_256MB: u64 = 0x10000000;

/// 1GB, 0x40000000, 2^30
pub const SIZE_1GB: u64 = 0x40000000;

/// 4GB, 0x100000000, 2^32
pub const SIZE_4GB: u64 = 0x100000000;

/// Aligns `value` down to `alignment`, which must be a power of two.
#[inline]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

/// Aligns `value` up to `alignment`, which must be a power of two. Returns `None` on overflow.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> Option<u64> {
    match value.checked_add(alignment - 1) {
        Some(v) => Some(v & !(alignment - 1)),
        None => None,
    }
}

/// Returns true when `value` is a multiple of `alignment`, which must be a power of two.
#[inline]
pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    value & (alignment - 1) == 0
}

/// Largest power of two that is less than or equal to `value`. Zero for zero.
#[inline]
pub const fn power2_floor(value: u64) -> u64 {
    if value == 0 {
        0
    } else {
        1u64 << (63 - value.leading_zeros())
    }
}

/// The natural alignment of `value`, the largest power of two dividing it. `u64::MAX` stands in for address zero.
#[inline]
pub const fn natural_alignment(value: u64) -> u64 {
    if value == 0 {
        u64::MAX
    } else {
        1u64 << value.trailing_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power2_floor() {
        assert_eq!(power2_floor(0), 0);
        assert_eq!(power2_floor(1), 1);
        assert_eq!(power2_floor(SIZE_1MB + 1), SIZE_1MB);
        assert_eq!(power2_floor(u64::MAX), 1 << 63);
    }

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_down(0x1234, SIZE_4KB), 0x1000);
        assert_eq!(align_up(0x1234, SIZE_4KB), Some(0x2000));
        assert_eq!(align_up(u64::MAX, SIZE_4KB), None);
        assert!(is_aligned(SIZE_768KB, SIZE_64KB));
        assert!(!is_aligned(SIZE_768KB + SIZE_4KB, SIZE_64KB));
        assert_eq!(natural_alignment(SIZE_768KB), 0x40000);
        assert_eq!(natural_alignment(0), u64::MAX);
    }
}
