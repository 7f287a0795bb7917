// Small arithmetic helpers shared by the quantizer and trellis.
//
// Everything here is integer-only and branch-light by design: the core
// relies on these being exact, not merely "close enough" floating point
// approximations.

/// `value` clamped into `[lo, hi]`.
pub fn clamp<T: PartialOrd>(value: T, lo: T, hi: T) -> T {
  if value < lo {
    lo
  } else if value > hi {
    hi
  } else {
    value
  }
}

/// Round-to-nearest-even-free rounding shift: `(value + (1 << (bits-1))) >> bits`,
/// with `bits == 0` short-circuited to avoid shifting by a negative amount.
pub fn round2(value: i64, bits: u32) -> i64 {
  if bits == 0 {
    value
  } else {
    (value + (1i64 << (bits - 1))) >> bits
  }
}

/// `ceil(log2(value))` for `value >= 1`.
pub fn ceil_log2(value: u64) -> u32 {
  assert!(value >= 1);
  64 - (value - 1).leading_zeros()
}

/// Saturating byte add, used by the per-sub-block context accumulators:
/// `min(a + b, 255)`.
pub fn sat_add_u8(a: u8, b: u8) -> u8 {
  a.saturating_add(b)
}

/// Saturating add capped at 127 rather than 255, used for the per-position
/// `sumAbs` context accumulator (both the in-sub-block push and the
/// out-of-sub-block seed use the same cap).
pub fn sat_add_u8_127(a: i32, b: i32) -> u8 {
  let sum = a + b;
  clamp(sum, 0, 127) as u8
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn clamp_bounds() {
    assert_eq!(clamp(5, 0, 10), 5);
    assert_eq!(clamp(-5, 0, 10), 0);
    assert_eq!(clamp(15, 0, 10), 10);
  }

  #[test]
  fn round2_rounds_half_up() {
    assert_eq!(round2(3, 1), 2);
    assert_eq!(round2(2, 1), 1);
    assert_eq!(round2(7, 0), 7);
  }

  #[test]
  fn ceil_log2_powers_of_two() {
    assert_eq!(ceil_log2(1), 0);
    assert_eq!(ceil_log2(2), 1);
    assert_eq!(ceil_log2(3), 2);
    assert_eq!(ceil_log2(32), 5);
  }

  #[test]
  fn sat_add_saturates() {
    assert_eq!(sat_add_u8(250, 10), 255);
    assert_eq!(sat_add_u8_127(120, 20), 127);
  }
}
