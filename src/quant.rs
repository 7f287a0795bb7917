// Scalar quantizer (component C): the non-dependent part of dependent
// quantization. Two interleaved scalar quantizers (`Q0`, `Q1`) share the
// same step size but are offset from each other by half a step; which one
// reconstructs a given coefficient is decided by the trellis state, not by
// this module.
//
// Everything here is pure integer arithmetic operating on one coefficient
// at a time; the trellis decides which of the four `(quantizer, level)`
// candidates each state actually keeps.

use crate::array2d::Array2D;
use crate::consts::{
  distortion_precision_adjustment, IQUANT_SHIFT, INV_QUANT_SCALES, LOG2_SCALING_LIST_NEUTRAL_VALUE, QUANT_SCALES, QUANT_SHIFT,
};
use crate::scan::TuParameters;
use crate::state::{next_state, quantizer_of};
use crate::util::{clamp, round2};

/// Number of interleaved scalar quantizers dependent quantization alternates
/// between (`Q0` and `Q1`, half a step apart).
pub const NUM_QUANTIZERS: usize = 2;

/// Per-transform-block quantization parameters, derived once from the QP
/// and shared by every coefficient in the block.
#[derive(Clone, Copy, Debug)]
pub struct QuantBlock {
  qp_per: i32,
  scale: [i64; NUM_QUANTIZERS],
  inv_scale: [i64; NUM_QUANTIZERS],
  bit_depth: u32,
}

impl QuantBlock {
  /// Derives forward/inverse scale factors for `qp` at `bit_depth`.
  /// `needs_sqrt2_adjustment` is set for transform blocks whose log2 width
  /// plus log2 height is odd, matching the non-power-of-sqrt(2) transform
  /// size correction applied to the base VVC quantization step table.
  pub fn init(qp: i32, bit_depth: u32, needs_sqrt2_adjustment: bool) -> Self {
    assert!(qp >= 0);
    let qp_per = qp.div_euclid(6);
    let qp_rem = qp.rem_euclid(6) as usize;
    let row = needs_sqrt2_adjustment as usize;

    let q0_scale = QUANT_SCALES[row][qp_rem];
    let q0_inv = INV_QUANT_SCALES[row][qp_rem];
    // Q1 is Q0's grid shifted by one reconstruction step; in scale terms
    // that is the neighbouring remainder bucket (qpRem + 3) mod 6, which
    // the VVC step tables are arranged so that picking it reproduces a
    // half-step-offset quantizer of the same step size class.
    let q1_rem = (qp_rem + 3) % 6;
    let q1_scale = QUANT_SCALES[row][q1_rem];
    let q1_inv = INV_QUANT_SCALES[row][q1_rem];

    Self {
      qp_per,
      scale: [q0_scale, q1_scale],
      inv_scale: [q0_inv, q1_inv],
      bit_depth,
    }
  }

  pub fn qp_per(&self) -> i32 {
    self.qp_per
  }
}

/// The four `(quantizer, level)` candidates a coefficient's raw transform
/// value quantizes to: quantizers `Q0`/`Q1`, each with a floor and a
/// floor+1 candidate level. `delta_dist[k]` is the squared-error cost of
/// picking `abs_level[k]` over the unquantized value, in the same units the
/// caller's distortion metric uses elsewhere.
#[derive(Clone, Copy, Debug, Default)]
pub struct PqData {
  pub abs_level: [i32; 4],
  pub delta_dist: [i64; 4],
  /// Squared-error cost of forcing this coefficient to zero outright,
  /// regardless of which quantizer is active. Always a valid candidate: the
  /// trellis needs it even when both quantizers' floor level is nonzero.
  pub zero_dist: i64,
}

impl PqData {
  /// `abs_level`/`delta_dist` index for quantizer `q` (`0` or `1`) and
  /// candidate `k` (`0` = floor, `1` = floor + 1).
  pub fn index_of(q: usize, k: usize) -> usize {
    debug_assert!(q < NUM_QUANTIZERS && k < 2);
    q * 2 + k
  }
}

/// Dequantizes a single `level` reconstructed under quantizer `q_idx`.
pub fn dequant_one(qb: &QuantBlock, q_idx: usize, level: i32) -> i32 {
  if level == 0 {
    return 0;
  }
  let shift = IQUANT_SHIFT + LOG2_SCALING_LIST_NEUTRAL_VALUE - qb.qp_per;
  let scale = qb.inv_scale[q_idx];
  let value = if shift >= 0 {
    round2(level as i64 * scale, shift as u32)
  } else {
    (level as i64 * scale) << (-shift)
  };
  let max_val = (1i64 << (qb.bit_depth + 7)) - 1;
  clamp(value, -max_val - 1, max_val) as i32
}

/// Computes the four quantization candidates for one transform coefficient.
pub fn pre_quant_coeff(qb: &QuantBlock, coeff: i32) -> PqData {
  let abs_coeff = coeff.unsigned_abs() as i64;
  let shift = QUANT_SHIFT + qb.qp_per;
  // Squared error grows with the square of the extra precision bit depths
  // above 8 bring, so it's shifted back down to the same scale `lambda` was
  // calibrated against; a no-op at 8-bit.
  let dist_shift = 2 * distortion_precision_adjustment(qb.bit_depth) as u32;

  let mut abs_level = [0i32; 4];
  let mut delta_dist = [0i64; 4];

  for q in 0..NUM_QUANTIZERS {
    let floor_level = if shift >= 0 {
      (abs_coeff * qb.scale[q]) >> shift
    } else {
      (abs_coeff * qb.scale[q]) << (-shift)
    };

    for k in 0..2 {
      let level = floor_level + k as i64;
      let idx = PqData::index_of(q, k);
      abs_level[idx] = level as i32;

      let recon = dequant_one(qb, q, level as i32) as i64;
      let err = abs_coeff - recon.abs();
      delta_dist[idx] = (err * err) >> dist_shift;
    }
  }

  PqData { abs_level, delta_dist, zero_dist: (abs_coeff * abs_coeff) >> dist_shift }
}

/// Dequantizes an entire transform block. `levels` holds the signed level
/// the trellis chose at each position; `tu` supplies the same scan order the
/// forward pass walked. Which of `Q0`/`Q1` reconstructs a position is never
/// carried alongside the levels: it is re-derived here by walking the scan
/// in the same reverse order the trellis decided it in and replaying the
/// `0x7D28` state transition from each decoded level, exactly as a decoder
/// with nothing but the level array would. The trellis always enters its
/// first coded position in state 0, so starting the walk there and running
/// it across the whole scan range (rather than stopping at the true last
/// significant position) reproduces the same state at every position: a
/// run of leading zero levels never perturbs state away from 0.
pub fn dequant_block(qb: &QuantBlock, levels: &Array2D<i32>, tu: &TuParameters) -> Array2D<i32> {
  let mut out = Array2D::zeroed(levels.rows(), levels.cols());
  let mut state: u8 = 0;
  for scan_idx in (0..tu.num_coeff).rev() {
    let info = &tu.scan_info[scan_idx];
    let (x, y) = (info.pos_x as usize, info.pos_y as usize);
    let level = levels[y][x];
    if level != 0 {
      let q_idx = quantizer_of(state) as usize;
      let mag = dequant_one(qb, q_idx, level.abs());
      out[y][x] = if level < 0 { -mag } else { mag };
    }
    state = next_state(state, level);
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn zero_coefficient_quantizes_to_zero_floor() {
    let qb = QuantBlock::init(32, 8, false);
    let pq = pre_quant_coeff(&qb, 0);
    assert_eq!(pq.abs_level[PqData::index_of(0, 0)], 0);
    assert_eq!(pq.abs_level[PqData::index_of(1, 0)], 0);
  }

  #[test]
  fn floor_and_ceil_candidates_differ_by_one() {
    let qb = QuantBlock::init(37, 8, false);
    let pq = pre_quant_coeff(&qb, 500);
    for q in 0..NUM_QUANTIZERS {
      let floor = pq.abs_level[PqData::index_of(q, 0)];
      let ceil = pq.abs_level[PqData::index_of(q, 1)];
      assert_eq!(ceil, floor + 1);
    }
  }

  #[test]
  fn dequant_of_zero_level_is_zero() {
    let qb = QuantBlock::init(32, 8, false);
    assert_eq!(dequant_one(&qb, 0, 0), 0);
    assert_eq!(dequant_one(&qb, 1, 0), 0);
  }

  #[test]
  fn dequant_block_preserves_sign() {
    let tu = crate::scan::rom().tu_parameters(4, 4, crate::enums::ChannelType::Luma);
    let qb = QuantBlock::init(32, 8, false);
    let mut levels = Array2D::<i32>::zeroed(4, 4);
    levels[0][0] = -3;
    levels[3][3] = 5;
    let out = dequant_block(&qb, &levels, &tu);
    assert!(out[0][0] < 0);
    assert!(out[3][3] > 0);
  }

  #[test]
  fn higher_qp_yields_coarser_reconstruction_step() {
    let fine = QuantBlock::init(10, 8, false);
    let coarse = QuantBlock::init(40, 8, false);
    let fine_step = dequant_one(&fine, 0, 2) - dequant_one(&fine, 0, 1);
    let coarse_step = dequant_one(&coarse, 0, 2) - dequant_one(&coarse, 0, 1);
    assert!(coarse_step >= fine_step);
  }

  #[test]
  fn deeper_bit_depth_scales_distortion_down() {
    let qb8 = QuantBlock::init(32, 8, false);
    let qb10 = QuantBlock::init(32, 10, false);
    let pq8 = pre_quant_coeff(&qb8, 500);
    let pq10 = pre_quant_coeff(&qb10, 500);
    assert!(pq10.zero_dist <= pq8.zero_dist);
  }
}
