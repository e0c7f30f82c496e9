//! Size-class schedule: the mapping between byte counts and bucket indices.

use crate::error::{AllocError, AllocResult};

/// Largest number of pool buckets a `BucketAllocator` may have.
pub const MAX_BUCKETS: u32 = 62;

pub const MIN_VALID_ALIGNMENT: u32 = 4;
pub const MAX_VALID_ALIGNMENT: u32 = 4096;
pub const CACHE_LINE_SIZE: u32 = 64;

/// Which size-class schedule a [`crate::allocator::BucketAllocator`] uses.
///
/// `PiecewiseLinear` is the production schedule (see module docs on
/// [`index_for_size`]); `Linear` is kept as the simpler alternate the
/// schedule was generalized from, useful for experimentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClassStrategy {
    Linear,
    PiecewiseLinear,
}

/// Maps a byte count to the smallest bucket index whose cell fits it.
///
/// `bytes_count` must be nonzero; callers that might see a zero-size
/// request (the crate's public `alloc` entry point) must special-case it
/// before reaching here rather than relying on this function to do so.
#[inline]
pub fn index_for_size(bytes_count: u32, strategy: SizeClassStrategy) -> u32 {
    debug_assert!(bytes_count > 0, "index_for_size called with bytes_count == 0");
    let size = bytes_count - 1;
    match strategy {
        SizeClassStrategy::Linear => size >> 4,
        SizeClassStrategy::PiecewiseLinear => {
            if size <= 127 {
                size >> 4
            } else if size <= 1023 {
                7 + (size >> 7)
            } else {
                13 + (size >> 9)
            }
        }
    }
}

/// Maps a bucket index to the cell size (in bytes) that bucket holds.
///
/// Returns `InvalidStrategy` if `strategy` is unrecognized (mirrors the
/// original's `panic("no proper strategy")`, but as a recoverable error
/// since this is reachable from caller-controlled configuration).
#[inline]
pub fn size_for_index(bucket_index: u32, strategy: SizeClassStrategy) -> AllocResult<u32> {
    Ok(match strategy {
        SizeClassStrategy::Linear => 16 + bucket_index * 16,
        SizeClassStrategy::PiecewiseLinear => {
            if bucket_index <= 7 {
                (bucket_index + 1) << 4
            } else if bucket_index > 14 {
                (bucket_index - 12) << 9
            } else {
                (bucket_index - 6) << 7
            }
        }
    })
}

/// Same as [`size_for_index`] but panics on an unrecognized strategy,
/// for call sites (bucket initialization) where the strategy is a
/// compile-time-known constant and a bad value is a programming error.
#[inline]
pub fn size_for_index_unchecked(bucket_index: u32, strategy: SizeClassStrategy) -> u32 {
    size_for_index(bucket_index, strategy)
        .unwrap_or_else(|_| unreachable!("size_for_index covers every SizeClassStrategy variant"))
}

/// Rounds `val` up to the next multiple of `alignment` (`alignment` must be
/// a power of two).
#[inline]
pub const fn align(val: u32, alignment: u32) -> u32 {
    crate::utils::align_up(val, alignment)
}

pub fn validate_alignment(align: u32) -> AllocResult<u32> {
    let align = align.max(MIN_VALID_ALIGNMENT);
    if align > MAX_VALID_ALIGNMENT || !crate::utils::is_power_of_two(align) {
        return Err(AllocError::new(crate::error::AllocErrorKind::InvalidLayout)
            .with_message("alignment must be a power of two within [4, 4096]"));
    }
    Ok(align)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_indices_match_schedule() {
        let s = SizeClassStrategy::PiecewiseLinear;
        assert_eq!(index_for_size(1, s), 0);
        assert_eq!(index_for_size(16, s), 0);
        assert_eq!(index_for_size(17, s), 1);
        assert_eq!(index_for_size(128, s), 7);
        assert_eq!(index_for_size(129, s), 8);
        assert_eq!(index_for_size(1024, s), 14);
        assert_eq!(index_for_size(1025, s), 15);
    }

    #[test]
    fn size_for_index_round_trips_within_class() {
        let s = SizeClassStrategy::PiecewiseLinear;
        for idx in 0..MAX_BUCKETS {
            let size = size_for_index(idx, s).unwrap();
            assert!(size > 0, "bucket {idx} has zero size");
            assert_eq!(index_for_size(size, s), idx, "bucket {idx} size {size} maps back incorrectly");
        }
    }

    #[test]
    fn sizes_strictly_increase_with_index() {
        let s = SizeClassStrategy::PiecewiseLinear;
        let mut prev = 0;
        for idx in 0..MAX_BUCKETS {
            let size = size_for_index(idx, s).unwrap();
            assert!(size > prev, "bucket sizes must strictly increase");
            prev = size;
        }
    }

    #[test]
    fn validate_alignment_rejects_non_power_of_two() {
        assert!(validate_alignment(3).is_err());
        assert!(validate_alignment(8).is_ok());
        assert_eq!(validate_alignment(1).unwrap(), MIN_VALID_ALIGNMENT);
    }
}
