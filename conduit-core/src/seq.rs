//! Wraparound-safe sequence arithmetic
//!
//! Sequence numbers are 16 bits and wrap. `a` counts as at or after `b` when
//! the forward distance `(a - b) mod 2^16` lies in `[0, 32767]`; strictly after
//! when it lies in `[1, 32767]`. Every comparison in the crate goes through
//! these helpers so the half-open convention is applied consistently.

use crate::constants::SEQ_HALF_RANGE;

/// Forward distance from `b` to `a`
#[inline]
pub const fn distance(a: u16, b: u16) -> u16 {
    a.wrapping_sub(b)
}

/// `a` is at or after `b`
#[inline]
pub const fn is_at_or_after(a: u16, b: u16) -> bool {
    distance(a, b) < SEQ_HALF_RANGE
}

/// `a` is strictly after `b`
#[inline]
pub const fn is_after(a: u16, b: u16) -> bool {
    let d = distance(a, b);
    d != 0 && d < SEQ_HALF_RANGE
}

/// `a` precedes `b`
#[inline]
pub const fn is_before(a: u16, b: u16) -> bool {
    distance(a, b) >= SEQ_HALF_RANGE
}

/// The more recent of two sequence numbers
#[inline]
pub const fn latest(a: u16, b: u16) -> u16 {
    if is_at_or_after(a, b) {
        a
    } else {
        b
    }
}

/// Same ordering over 32-bit timestamps
#[inline]
pub const fn timestamp_is_after(a: u32, b: u32) -> bool {
    let d = a.wrapping_sub(b);
    d != 0 && d < 0x8000_0000
}
