// Rate estimator (component B): turns a snapshot of the entropy coder's
// context-probability state into fixed-point fractional-bit costs the
// trellis can add directly into an RD cost, without ever touching the
// entropy coder itself.
//
// The entropy coder's actual bin-probability model is intentionally kept
// outside this crate: callers hand in a `FracBitsAccess` that answers "what
// does coding a 0/1 bin at context N cost right now", and everything below
// is pure bookkeeping on top of that.

use crate::consts::{GO_RICE_BITS, LAST_PREFIX_CTX, SCALE_BITS};
use crate::enums::ChannelType;
use crate::scan::TuParameters;
use crate::util::ceil_log2;

/// Fractional-bit cost, in `1 << SCALE_BITS`-scaled fixed point, of coding a
/// single regular bin as 0 or as 1 at some context.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinFracBits {
  pub bits: [i64; 2],
}

/// Cumulative fractional-bit cost of a coefficient taking on a given
/// absolute level tier, before any bypass (Golomb-Rice) remainder.
///
/// `bits[0]` is the cost of level 0 (not significant). `bits[1]` is the cost
/// of level exactly 1. `bits[2..=5]` cover levels 2 through 5, each built
/// from the "greater than 1" flag plus that level's parity bin and, for
/// levels 4 and 5, the "greater than 2" flag. Beyond level 5 the remaining
/// magnitude is bypass-coded and priced separately via
/// [`RateEstimator::rice_remainder_fbits`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CoeffFracBits {
  pub bits: [i64; 6],
}

/// Supplies fractional-bit costs for entropy-coder contexts. Implemented by
/// the caller on top of whatever CABAC-style probability state it owns;
/// this crate never inspects or updates that state itself.
pub trait FracBitsAccess {
  /// Cost of the sub-block significance flag at context `ctx_id` (`0` or `1`).
  fn sig_sbb_flag(&self, ctx_id: usize) -> BinFracBits;
  /// Cost of the per-coefficient significance flag at context `ctx_id`.
  fn sig_flag(&self, ctx_id: usize) -> BinFracBits;
  /// Cost of the "absolute level is greater than 1" flag at context `ctx_id`.
  fn gt1_flag(&self, ctx_id: usize) -> BinFracBits;
  /// Cost of the parity bin at context `ctx_id`, coded once gt1 is set.
  fn par_flag(&self, ctx_id: usize) -> BinFracBits;
  /// Cost of the "absolute level is greater than 2" flag at context `ctx_id`.
  fn gt2_flag(&self, ctx_id: usize) -> BinFracBits;
  /// Cost of a last-significant-coefficient prefix bin at context `ctx_id`.
  fn last_prefix(&self, ctx_id: usize, is_x: bool) -> BinFracBits;
  /// Cost of asserting vs. negating the coded-block flag at context `ctx_id`.
  /// Used for the `cbfDeltaBits` term folded into the last-position cost when
  /// the CBF isn't inferred by the ISP last-subpartition rule.
  fn cbf_flag(&self, ctx_id: usize) -> BinFracBits;
}

/// Number of distinct significance contexts: one of the three diagonal
/// bands (`sigCtxOffsetNext` in `{0, 4, 8}`) times a local neighbour-count
/// delta in `0..=3`.
pub const NUM_SIG_CTX: usize = 12;

/// Number of distinct "greater than 1" contexts: one of the four diagonal
/// bands (`gtxCtxOffsetNext` in `{1, 6, 11, 16}`) times a delta in `0..=3`.
pub const NUM_GT1_CTX: usize = 20;

/// Rate-estimation state for one transform block: a flat snapshot of every
/// context this TB's coefficients can reference, taken once up front so the
/// trellis search never calls back into the entropy coder.
pub struct RateEstimator {
  sig_sbb_fbits: [BinFracBits; 2],
  sig_fbits: [BinFracBits; NUM_SIG_CTX],
  gt1_fbits: [BinFracBits; NUM_GT1_CTX],
  par_fbits: [BinFracBits; NUM_GT1_CTX],
  gt2_fbits: [BinFracBits; NUM_GT1_CTX],
  /// `last_x_fbits[g]`/`last_y_fbits[g]`: cumulative cost of signalling that
  /// the last significant coefficient's x/y falls in prefix group `g`,
  /// including the cost of every earlier group's "continue" bin.
  last_x_fbits: Vec<i64>,
  last_y_fbits: Vec<i64>,
  /// Per-group fixed (bypass) suffix cost: `(g - 1) << SCALE_BITS` bits for
  /// group `g >= 4`, zero below that, mirroring the binarization's extra
  /// suffix bits once a last-coefficient group spans more than one position.
  last_x_suffix_bits: Vec<i64>,
  last_y_suffix_bits: Vec<i64>,
}

fn one_bit_cost() -> i64 {
  1i64 << SCALE_BITS
}

impl RateEstimator {
  /// Snapshots every context this TB's geometry can reference. `fba` is
  /// consulted exactly once per context id: the results are cached for the
  /// lifetime of this `RateEstimator`.
  /// `channel` is accepted for interface parity with the reference design
  /// (luma and chroma draw from differently sized context sets there); this
  /// implementation's significance/greater-than tables are sized to cover
  /// both uniformly, so it is not yet read. Kept rather than dropped so a
  /// future per-channel table split doesn't change the call signature.
  pub fn init(tu: &TuParameters, channel: ChannelType, fba: &dyn FracBitsAccess) -> Self {
    let _ = channel;
    let mut sig_sbb_fbits = [BinFracBits::default(); 2];
    for (ctx, slot) in sig_sbb_fbits.iter_mut().enumerate() {
      *slot = fba.sig_sbb_flag(ctx);
    }

    let mut sig_fbits = [BinFracBits::default(); NUM_SIG_CTX];
    for (ctx, slot) in sig_fbits.iter_mut().enumerate() {
      *slot = fba.sig_flag(ctx);
    }

    let mut gt1_fbits = [BinFracBits::default(); NUM_GT1_CTX];
    for (ctx, slot) in gt1_fbits.iter_mut().enumerate() {
      *slot = fba.gt1_flag(ctx);
    }

    let mut par_fbits = [BinFracBits::default(); NUM_GT1_CTX];
    for (ctx, slot) in par_fbits.iter_mut().enumerate() {
      *slot = fba.par_flag(ctx);
    }

    let mut gt2_fbits = [BinFracBits::default(); NUM_GT1_CTX];
    for (ctx, slot) in gt2_fbits.iter_mut().enumerate() {
      *slot = fba.gt2_flag(ctx);
    }

    let (last_x_fbits, last_x_suffix_bits) = Self::build_last_axis(tu.width, true, fba);
    let (last_y_fbits, last_y_suffix_bits) = Self::build_last_axis(tu.height, false, fba);

    Self {
      sig_sbb_fbits,
      sig_fbits,
      gt1_fbits,
      par_fbits,
      gt2_fbits,
      last_x_fbits,
      last_y_fbits,
      last_x_suffix_bits,
      last_y_suffix_bits,
    }
  }

  fn build_last_axis(dim: usize, is_x: bool, fba: &dyn FracBitsAccess) -> (Vec<i64>, Vec<i64>) {
    let num_groups = ceil_log2(dim as u64) as usize + 1;
    let mut cumulative = vec![0i64; num_groups];
    let mut suffix = vec![0i64; num_groups];

    let mut running = 0i64;
    for g in 0..num_groups {
      let ctx = LAST_PREFIX_CTX[g.min(LAST_PREFIX_CTX.len() - 1)] as usize;
      let bfb = fba.last_prefix(ctx, is_x);
      cumulative[g] = running + bfb.bits[0];
      running += bfb.bits[1];
      suffix[g] = if g >= 4 { ((g as i64) - 3) * one_bit_cost() / 2 } else { 0 };
    }
    (cumulative, suffix)
  }

  /// Cost of signalling "this sub-block is significant" / "is all-zero".
  pub fn sig_sbb_fbits(&self, ctx_inc: usize) -> BinFracBits {
    self.sig_sbb_fbits[ctx_inc.min(1)]
  }

  /// Assembles the per-level cost table for one coefficient. `sig_ctx_base`
  /// and `gt1_ctx_base` come from the scan ROM's per-position diagonal
  /// offsets; `sig_delta`/`gt1_delta` are the local neighbour-derived
  /// increments (each in `0..=3`) the trellis state tracks at runtime.
  pub fn coeff_fbits(&self, sig_ctx_base: usize, sig_delta: usize, gt1_ctx_base: usize, gt1_delta: usize) -> CoeffFracBits {
    let sig = self.sig_fbits[(sig_ctx_base + sig_delta).min(NUM_SIG_CTX - 1)];
    let idx = (gt1_ctx_base + gt1_delta).min(NUM_GT1_CTX - 1);
    let gt1 = self.gt1_fbits[idx];
    let par = self.par_fbits[idx];
    let gt2 = self.gt2_fbits[idx];

    let mut bits = [0i64; 6];
    bits[0] = sig.bits[0];
    bits[1] = sig.bits[1] + gt1.bits[0];
    for (lvl, slot) in bits.iter_mut().enumerate().skip(2) {
      let parity = lvl & 1;
      let gt2_bit = (lvl >= 4) as usize;
      *slot = sig.bits[1] + gt1.bits[1] + par.bits[parity] + gt2.bits[gt2_bit];
    }
    CoeffFracBits { bits }
  }

  /// Fractional-bit cost of the bypass (Golomb-Rice) remainder `value` at
  /// rice parameter `rice_param`.
  pub fn rice_remainder_fbits(&self, rice_param: u8, value: u32) -> i64 {
    let row = (rice_param as usize).min(GO_RICE_BITS.len() - 1);
    let col = (value as usize).min(GO_RICE_BITS[row].len() - 1);
    GO_RICE_BITS[row][col]
  }

  /// Cost of the last-significant-coefficient position, x and y combined.
  pub fn last_coeff_fbits(&self, last_x: usize, last_y: usize) -> i64 {
    let gx = ceil_log2((last_x + 1) as u64) as usize;
    let gy = ceil_log2((last_y + 1) as u64) as usize;
    self.last_x_fbits[gx.min(self.last_x_fbits.len() - 1)]
      + self.last_x_suffix_bits[gx.min(self.last_x_suffix_bits.len() - 1)]
      + self.last_y_fbits[gy.min(self.last_y_fbits.len() - 1)]
      + self.last_y_suffix_bits[gy.min(self.last_y_suffix_bits.len() - 1)]
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::scan::rom;

  struct UniformFba;
  impl FracBitsAccess for UniformFba {
    fn sig_sbb_flag(&self, _ctx_id: usize) -> BinFracBits {
      BinFracBits { bits: [1 << SCALE_BITS, 2 << SCALE_BITS] }
    }
    fn sig_flag(&self, _ctx_id: usize) -> BinFracBits {
      BinFracBits { bits: [1 << SCALE_BITS, 2 << SCALE_BITS] }
    }
    fn gt1_flag(&self, _ctx_id: usize) -> BinFracBits {
      BinFracBits { bits: [1 << SCALE_BITS, 1 << SCALE_BITS] }
    }
    fn par_flag(&self, _ctx_id: usize) -> BinFracBits {
      BinFracBits { bits: [1 << SCALE_BITS, 1 << SCALE_BITS] }
    }
    fn gt2_flag(&self, _ctx_id: usize) -> BinFracBits {
      BinFracBits { bits: [1 << SCALE_BITS, 1 << SCALE_BITS] }
    }
    fn last_prefix(&self, _ctx_id: usize, _is_x: bool) -> BinFracBits {
      BinFracBits { bits: [1 << SCALE_BITS, 1 << SCALE_BITS] }
    }
    fn cbf_flag(&self, _ctx_id: usize) -> BinFracBits {
      BinFracBits { bits: [1 << SCALE_BITS, 1 << SCALE_BITS] }
    }
  }

  #[test]
  fn level_costs_are_monotonically_increasing() {
    let tu = rom().tu_parameters(8, 8, ChannelType::Luma);
    let re = RateEstimator::init(&tu, ChannelType::Luma, &UniformFba);
    let cfb = re.coeff_fbits(0, 0, 1, 0);
    assert!(cfb.bits[0] < cfb.bits[1]);
    for lvl in 1..cfb.bits.len() {
      assert!(cfb.bits[lvl - 1] <= cfb.bits[lvl]);
    }
  }

  #[test]
  fn last_coeff_cost_grows_with_distance() {
    let tu = rom().tu_parameters(16, 16, ChannelType::Luma);
    let re = RateEstimator::init(&tu, ChannelType::Luma, &UniformFba);
    let near = re.last_coeff_fbits(0, 0);
    let far = re.last_coeff_fbits(15, 15);
    assert!(far >= near);
  }

  #[test]
  fn rice_remainder_is_nondecreasing_in_value() {
    let tu = rom().tu_parameters(4, 4, ChannelType::Luma);
    let re = RateEstimator::init(&tu, ChannelType::Luma, &UniformFba);
    let mut prev = 0;
    for v in 0..31 {
      let c = re.rice_remainder_fbits(0, v);
      assert!(c >= prev);
      prev = c;
    }
  }
}
