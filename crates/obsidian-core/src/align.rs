//! Alignment arithmetic for GPU resource sizing.

/// Round `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a nonzero power of two, which is what Vulkan
/// reports for every alignment limit this crate consumes.
#[inline]
#[must_use]
pub const fn round_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// `round_up` for `u32` limits (shader group handle sizes and strides).
#[inline]
#[must_use]
pub const fn round_up_u32(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Whether `value` is already a multiple of `alignment`.
#[inline]
#[must_use]
pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    debug_assert!(alignment.is_power_of_two());
    value & (alignment - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_is_identity_on_aligned_values() {
        for value in [0u64, 64, 128, 4096] {
            assert_eq!(round_up(value, 64), value);
        }
    }

    #[test]
    fn round_up_reaches_next_multiple() {
        assert_eq!(round_up(1, 64), 64);
        assert_eq!(round_up(65, 64), 128);
        assert_eq!(round_up(255, 256), 256);
        assert_eq!(round_up(257, 256), 512);
        assert_eq!(round_up_u32(33, 32), 64);
    }

    #[test]
    fn round_up_result_is_aligned_and_minimal() {
        for value in 0u64..1000 {
            for alignment in [1u64, 2, 16, 64, 256] {
                let rounded = round_up(value, alignment);
                assert!(is_aligned(rounded, alignment));
                assert!(rounded >= value);
                assert!(rounded - value < alignment);
            }
        }
    }

    #[test]
    fn alignment_one_is_identity() {
        for value in [0u64, 1, 7, 1023] {
            assert_eq!(round_up(value, 1), value);
        }
    }
}
