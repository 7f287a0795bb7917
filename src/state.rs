// Copyright (c) 2024-2025, The tinyavif contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

// Trellis state and cross-sub-block context (components D and E): the
// 4-state dependent-quantization machine itself, plus the small amount of
// context it carries between coefficient-group boundaries.
//
// The trellis runs in reverse scan order, one coefficient-group at a time.
// At any instant only 12 `State` values are live: four "incoming" states
// finalized at the previous (higher) scan position, four being built at the
// current position, and four held aside for the coefficient group's
// "entirely zero" alternative. Everything else needed to backtrace the
// winning path lives in the flat `decisions` table the driver owns.
//
// Context for a position's significance/greater-than flags is *not* a
// running total over the whole decided path: it comes from a bounded set of
// up to five named neighbours (`scan::NbInfoSbb`/`NbInfoOut`), so `State`
// carries one small per-sub-block-position accumulator array rather than a
// handful of whole-path running sums.

use crate::consts::{go_rice_param_for_sum, DQ_STATE_TRANSITION, MAX_SBB_SIZE, RD_COST_INIT};
use crate::quant::PqData;
use crate::rate::RateEstimator;
use crate::scan::{NbInfoSbb, ScanInfo, TuParameters};
use crate::util::{sat_add_u8, sat_add_u8_127};

/// Number of states in the dependent-quantization machine.
pub const NUM_STATES: usize = 4;

/// One position's local context accumulator: how much the as-yet-undecided
/// neighbours that feed into it have already contributed.
#[derive(Clone, Copy, Debug, Default)]
struct CtxAcc {
  num_nz: u8,
  sum_abs1: u8,
  sum_abs: u8,
}

/// Running state carried by one trellis path as it crosses coefficient
/// positions. The per-position context arrays are scoped to the *current*
/// sub-block: they get reseeded (not cleared to zero in isolation, but
/// re-derived from already-decided neighbouring sub-blocks) every time the
/// trellis crosses into a new group.
#[derive(Clone, Copy, Debug)]
pub struct State {
  pub rd_cost: i64,
  /// Nonzero coefficient count within the current sub-block only.
  pub num_sig: u16,
  /// Regular-coded-bin budget remaining on this path; once this drops below
  /// 4, level-rate costing switches to the bypass-only regime.
  pub rem_reg_bins: i32,
  ctx_num_nz: [u8; MAX_SBB_SIZE],
  ctx_sum_abs1: [u8; MAX_SBB_SIZE],
  ctx_sum_abs: [u8; MAX_SBB_SIZE],
  /// Absolute levels decided so far at each position of the current
  /// sub-block, kept so a finished sub-block's contribution can seed the
  /// next one's context (see `CommonCtx`).
  sbb_levels: [u8; MAX_SBB_SIZE],
}

impl State {
  /// The initial state at the last (highest-scan-index) coefficient of a
  /// transform block, before any position has been decided. `rem_reg_bins`
  /// is the whole transform block's regular-coded-bin budget.
  pub fn root(rem_reg_bins: i32) -> Self {
    Self {
      rd_cost: 0,
      num_sig: 0,
      rem_reg_bins,
      ctx_num_nz: [0; MAX_SBB_SIZE],
      ctx_sum_abs1: [0; MAX_SBB_SIZE],
      ctx_sum_abs: [0; MAX_SBB_SIZE],
      sbb_levels: [0; MAX_SBB_SIZE],
    }
  }

  /// Re-derives this state's per-position context for a freshly entered
  /// sub-block from `seed` (the out-of-sub-block contributions `CommonCtx`
  /// computed for it), resetting everything scoped to the previous group.
  fn reseed(&self, seed: &[CtxAcc; MAX_SBB_SIZE]) -> Self {
    let mut s = *self;
    s.num_sig = 0;
    s.sbb_levels = [0; MAX_SBB_SIZE];
    for i in 0..MAX_SBB_SIZE {
      s.ctx_num_nz[i] = seed[i].num_nz;
      s.ctx_sum_abs1[i] = seed[i].sum_abs1;
      s.ctx_sum_abs[i] = seed[i].sum_abs;
    }
    s
  }

  fn sig_ctx_delta(&self, inside_pos: usize) -> usize {
    (self.ctx_num_nz[inside_pos] as usize).min(3)
  }

  fn gt1_ctx_delta(&self, inside_pos: usize) -> usize {
    (self.ctx_sum_abs1[inside_pos] as usize).min(3)
  }

  fn rice_param(&self, inside_pos: usize) -> u8 {
    go_rice_param_for_sum(self.ctx_sum_abs[inside_pos])
  }

  /// Commits `level` decided at `inside_pos`, returning the successor state:
  /// pushes this level's contribution into every not-yet-decided recipient
  /// named in `push_targets`, and debits the regular-bin budget.
  fn advance(&self, level: i32, inside_pos: usize, push_targets: &NbInfoSbb) -> Self {
    let level_u8 = level.unsigned_abs().min(255) as u8;
    let still_regular = self.rem_reg_bins >= 4;
    let spent = 1 + if still_regular { level.unsigned_abs().min(3) as i32 } else { 0 };

    let mut s = *self;
    s.rem_reg_bins = self.rem_reg_bins - spent;
    s.num_sig = self.num_sig + (level != 0) as u16;
    s.sbb_levels[inside_pos] = level_u8;

    let contrib_nz = (level != 0) as u8;
    let contrib_sum_abs1 = (4 + (level_u8 & 1)).min(level_u8);
    for k in 0..push_targets.num_inv as usize {
      let r = push_targets.inv_in_pos[k] as usize;
      s.ctx_num_nz[r] = sat_add_u8(self.ctx_num_nz[r], contrib_nz);
      s.ctx_sum_abs1[r] = sat_add_u8(self.ctx_sum_abs1[r], contrib_sum_abs1);
      s.ctx_sum_abs[r] = sat_add_u8_127(self.ctx_sum_abs[r] as i32, level_u8 as i32);
    }
    s
  }
}

/// The winning choice recorded for one `(scan position, arriving state)`
/// pair: enough to both continue the trellis and, once the best final state
/// is known, backtrace the whole level array.
#[derive(Clone, Copy, Debug)]
pub struct Decision {
  pub rd_cost: i64,
  pub abs_level: i32,
  pub prev_state: i8,
}

/// `prev_state` sentinel for "no candidate has reached this outgoing state
/// yet" — distinct from [`DECISION_TERMINAL`] so a genuine last-coefficient
/// candidate (which legitimately carries no predecessor) can't be mistaken
/// for an empty slot and overwritten unconditionally by a later, costlier
/// candidate.
pub const DECISION_UNSET: i8 = -2;

/// `prev_state` marker for "this position is the last significant
/// coefficient": back-trace stops here, same as `DECISION_UNSET`, but the
/// slot was filled in deliberately via a real RD comparison.
pub const DECISION_TERMINAL: i8 = -1;

impl Default for Decision {
  fn default() -> Self {
    Self { rd_cost: RD_COST_INIT, abs_level: 0, prev_state: DECISION_UNSET }
  }
}

/// Cross-sub-block context store: one optional per-state snapshot of a
/// finished sub-block's decided levels, filled in as each group is finished.
/// A new group's context is *not* seeded from an aggregate summary of its
/// neighbours; it is re-derived position by position from `TuParameters`'s
/// `NbInfoOut` table, which names exactly which finished position each of
/// the new group's slots reads from.
pub struct CommonCtx {
  groups: Vec<Option<[[u8; MAX_SBB_SIZE]; NUM_STATES]>>,
}

impl CommonCtx {
  pub fn new(num_sbb: usize) -> Self {
    Self { groups: vec![None; num_sbb] }
  }

  pub fn update(&mut self, sbb_pos: usize, states: &[State; NUM_STATES]) {
    let mut snap = [[0u8; MAX_SBB_SIZE]; NUM_STATES];
    for i in 0..NUM_STATES {
      snap[i] = states[i].sbb_levels;
    }
    self.groups[sbb_pos] = Some(snap);
  }

  /// Whether the finished sub-block at `sbb_pos` has any nonzero level under
  /// `state`. Used for the sub-block significance context of an adjacent,
  /// still-being-decided sub-block.
  pub fn is_significant(&self, sbb_pos: Option<usize>, state: usize) -> bool {
    sbb_pos
      .and_then(|p| self.groups[p])
      .map(|levels| levels[state].iter().any(|&l| l != 0))
      .unwrap_or(false)
  }

  /// Builds the per-position, per-state context seed for the sub-block
  /// starting at absolute scan index `beg_sbb`, by resolving every position's
  /// `NbInfoOut` entries to the exact already-decided coefficient (and hence
  /// the exact finished sub-block and slot) they name.
  pub fn seed_ctx(&self, tu: &TuParameters, beg_sbb: usize) -> [[CtxAcc; MAX_SBB_SIZE]; NUM_STATES] {
    let mut out = [[CtxAcc::default(); MAX_SBB_SIZE]; NUM_STATES];
    for local in 0..tu.sbb_size {
      let scan_idx = beg_sbb + local;
      if scan_idx >= tu.num_coeff {
        continue;
      }
      let nbo = &tu.nb_out[scan_idx];
      for k in 0..nbo.num as usize {
        let abs_candidate = beg_sbb + nbo.out_pos[k] as usize;
        if abs_candidate >= tu.num_coeff {
          continue;
        }
        let cand_info = &tu.scan_info[abs_candidate];
        let (cand_sbb, cand_local) = (cand_info.sbb_pos, cand_info.inside_pos);
        let Some(levels) = self.groups[cand_sbb] else { continue };
        for state in 0..NUM_STATES {
          let t = levels[state][cand_local];
          let slot = &mut out[state][local];
          slot.num_nz = sat_add_u8(slot.num_nz, (t != 0) as u8);
          slot.sum_abs1 = sat_add_u8(slot.sum_abs1, (4 + (t & 1)).min(t));
          slot.sum_abs = sat_add_u8_127(slot.sum_abs as i32, t as i32);
        }
      }
    }
    out
  }
}

/// `next_state = DQ_STATE_TRANSITION[state][level & 1]`, unpacked from the
/// packed transition table.
pub fn next_state(state: u8, level: i32) -> u8 {
  debug_assert!((state as usize) < NUM_STATES);
  let shift = ((state as u32) << 2) + (((level & 1) as u32) << 1);
  ((DQ_STATE_TRANSITION >> shift) & 3) as u8
}

/// Which of the two interleaved scalar quantizers a state reconstructs its
/// coefficient with.
pub fn quantizer_of(state: u8) -> u8 {
  state & 1
}

/// Evaluates every `(incoming state, candidate level)` pair for one scan
/// position and keeps, for each possible resulting state, the cheapest path
/// into it. `lambda` is the Lagrange multiplier in the same fixed-point
/// scale the rate estimator's costs use. `scan_info` supplies this
/// position's own neighbourhood bookkeeping: `inside_pos` (where to read
/// this position's context from) and `curr_nb_info_sbb` (where to push this
/// position's own level once decided). `last_offset` is this position's
/// precomputed cost of signalling itself as the block's last significant
/// coefficient (`rate::RateEstimator::last_coeff_fbits`); `initial_budget` is
/// the transform block's starting `rem_reg_bins`, used to seed a fresh state
/// when a terminal candidate wins.
#[allow(clippy::too_many_arguments)]
pub fn decide_position(
  prev_states: &[State; NUM_STATES],
  pq: &PqData,
  rate_est: &RateEstimator,
  sig_ctx_base: usize,
  gt1_ctx_base: usize,
  lambda: i64,
  scale_bits: u32,
  scan_info: &ScanInfo,
  last_offset: i64,
  initial_budget: i32,
) -> ([State; NUM_STATES], [Decision; NUM_STATES]) {
  let inside_pos = scan_info.inside_pos;
  let push_targets = &scan_info.curr_nb_info_sbb;

  let mut decisions = [Decision::default(); NUM_STATES];
  let mut new_states: [Option<State>; NUM_STATES] = [None; NUM_STATES];

  for ps in 0..NUM_STATES {
    let prev = &prev_states[ps];
    let q = quantizer_of(ps as u8) as usize;
    let cfb = rate_est.coeff_fbits(sig_ctx_base, prev.sig_ctx_delta(inside_pos), gt1_ctx_base, prev.gt1_ctx_delta(inside_pos));
    let rice_param = prev.rice_param(inside_pos);

    let floor = pq.abs_level[PqData::index_of(q, 0)];
    let ceil = pq.abs_level[PqData::index_of(q, 1)];
    let mut candidates: Vec<(i32, i64)> = Vec::with_capacity(3);
    if floor == 0 {
      candidates.push((0, pq.delta_dist[PqData::index_of(q, 0)]));
    } else {
      candidates.push((0, pq.zero_dist));
      candidates.push((floor, pq.delta_dist[PqData::index_of(q, 0)]));
    }
    candidates.push((ceil, pq.delta_dist[PqData::index_of(q, 1)]));

    for &(level, dist) in &candidates {
      let rate = level_rate_fbits(&cfb, rate_est, rice_param, level, prev.rem_reg_bins, scale_bits);
      let cost = prev.rd_cost + mul_lambda(lambda, rate, scale_bits) + (dist << scale_bits);
      let ns = next_state(ps as u8, level);

      let better = match &decisions[ns as usize] {
        d if d.prev_state == DECISION_UNSET => true,
        d => cost < d.rd_cost,
      };
      if better {
        decisions[ns as usize] = Decision { rd_cost: cost, abs_level: level, prev_state: ps as i8 };
        new_states[ns as usize] = Some(prev.advance(level, inside_pos, push_targets));
      }
    }
  }

  // `checkRdCostStart`: this position competing to be the actual last
  // significant coefficient of the block, with nothing decided above it.
  // The trellis always enters its first coded position in state 0 — the
  // matching dequantizer has no side channel and recovers state purely from
  // decoded levels, so the true last coefficient can only ever reconstruct
  // under `Q0`. Fresh context (no predecessor, zero ctx deltas) and
  // `last_offset` (the cost of signalling this exact position as last)
  // replace whatever the normal sweep above already assembled, if cheaper.
  let fresh_cfb = rate_est.coeff_fbits(sig_ctx_base, 0, gt1_ctx_base, 0);
  for k in 0..2 {
    let level = pq.abs_level[PqData::index_of(0, k)];
    if level == 0 {
      continue;
    }
    let dist = pq.delta_dist[PqData::index_of(0, k)];
    let rate = level_rate_fbits(&fresh_cfb, rate_est, 0, level, initial_budget, scale_bits) + last_offset;
    let cost = mul_lambda(lambda, rate, scale_bits) + (dist << scale_bits);
    let ns = next_state(0, level);

    let better = match &decisions[ns as usize] {
      d if d.prev_state == DECISION_UNSET => true,
      d => cost < d.rd_cost,
    };
    if better {
      decisions[ns as usize] = Decision { rd_cost: cost, abs_level: level, prev_state: DECISION_TERMINAL };
      new_states[ns as usize] = Some(State::root(initial_budget).advance(level, inside_pos, push_targets));
    }
  }

  let mut out_states = [State::root(0); NUM_STATES];
  for i in 0..NUM_STATES {
    if let Some(mut s) = new_states[i] {
      s.rd_cost = decisions[i].rd_cost;
      out_states[i] = s;
    } else {
      out_states[i].rd_cost = RD_COST_INIT;
    }
  }

  (out_states, decisions)
}

/// Reseeds every one of `states`' per-position context from `common_ctx`'s
/// record of already-decided neighbouring sub-blocks, for the sub-block
/// starting at absolute scan index `beg_sbb`.
pub fn reseed_group(states: &mut [State; NUM_STATES], common_ctx: &CommonCtx, tu: &TuParameters, beg_sbb: usize) {
  let seeds = common_ctx.seed_ctx(tu, beg_sbb);
  for i in 0..NUM_STATES {
    states[i] = states[i].reseed(&seeds[i]);
  }
}

/// Cost of signalling a sub-block's own significance flag, given whichever
/// of its raster-adjacent (already decided) neighbour sub-blocks are
/// significant under `state`.
pub fn sig_sbb_ctx(common_ctx: &CommonCtx, scan_info: &ScanInfo, state: usize) -> usize {
  (common_ctx.is_significant(scan_info.next_sbb_right, state) || common_ctx.is_significant(scan_info.next_sbb_below, state))
    as usize
}

fn level_rate_fbits(
  cfb: &crate::rate::CoeffFracBits,
  rate_est: &RateEstimator,
  rice_param: u8,
  level: i32,
  rem_reg_bins: i32,
  scale_bits: u32,
) -> i64 {
  let mag = level.unsigned_abs();
  if rem_reg_bins >= 4 {
    match mag {
      0..=5 => cfb.bits[mag as usize],
      _ => cfb.bits[5] + rate_est.rice_remainder_fbits(rice_param, mag - 5),
    }
  } else if mag == 0 {
    // Below the regular-bin budget, even the "not significant" bin is
    // bypass-coded: its cost collapses to the Golomb-Rice remainder of 0.
    rate_est.rice_remainder_fbits(rice_param, 0)
  } else {
    (1i64 << scale_bits) + rate_est.rice_remainder_fbits(rice_param, mag)
  }
}

fn mul_lambda(lambda: i64, rate_fbits: i64, scale_bits: u32) -> i64 {
  (lambda * rate_fbits) >> scale_bits
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::scan::rom;
  use crate::enums::ChannelType;

  #[test]
  fn state_transition_table_is_well_formed() {
    for s in 0..NUM_STATES as u8 {
      for level in 0..4 {
        let ns = next_state(s, level);
        assert!((ns as usize) < NUM_STATES);
      }
    }
  }

  #[test]
  fn quantizer_parity_matches_state_parity() {
    assert_eq!(quantizer_of(0), 0);
    assert_eq!(quantizer_of(1), 1);
    assert_eq!(quantizer_of(2), 0);
    assert_eq!(quantizer_of(3), 1);
  }

  #[test]
  fn advancing_a_state_pushes_only_into_named_targets() {
    let tu = rom().tu_parameters(8, 8, ChannelType::Luma);
    let s = State::root(1000);
    let scan_idx = tu.num_coeff - 1;
    let push_targets = &tu.scan_info[scan_idx].curr_nb_info_sbb;
    let s2 = s.advance(3, tu.scan_info[scan_idx].inside_pos, push_targets);
    assert!(s2.num_sig >= s.num_sig);
    for k in 0..push_targets.num_inv as usize {
      let r = push_targets.inv_in_pos[k] as usize;
      assert!(s2.ctx_sum_abs[r] > 0);
    }
  }

  #[test]
  fn reg_bin_budget_is_spent_on_every_advance() {
    let tu = rom().tu_parameters(4, 4, ChannelType::Luma);
    let s = State::root(10);
    let scan_idx = tu.num_coeff - 1;
    let push_targets = &tu.scan_info[scan_idx].curr_nb_info_sbb;
    let s2 = s.advance(0, tu.scan_info[scan_idx].inside_pos, push_targets);
    assert!(s2.rem_reg_bins < s.rem_reg_bins);
  }

  #[test]
  fn common_ctx_defaults_to_insignificant_with_no_neighbours() {
    let ctx = CommonCtx::new(4);
    assert!(!ctx.is_significant(None, 0));
    assert!(!ctx.is_significant(Some(0), 0));
  }

  #[test]
  fn common_ctx_round_trips_a_finished_group() {
    let tu = rom().tu_parameters(8, 8, ChannelType::Luma);
    let mut ctx = CommonCtx::new(tu.num_sbb);
    let mut states = [State::root(1000); NUM_STATES];
    states[1].sbb_levels[0] = 5;
    ctx.update(0, &states);
    assert!(ctx.is_significant(Some(0), 1));
    assert!(!ctx.is_significant(Some(0), 0));
  }

  struct FlatFba;
  impl crate::rate::FracBitsAccess for FlatFba {
    fn sig_sbb_flag(&self, _ctx_id: usize) -> crate::rate::BinFracBits {
      crate::rate::BinFracBits { bits: [1 << crate::consts::SCALE_BITS, 3 << crate::consts::SCALE_BITS] }
    }
    fn sig_flag(&self, _ctx_id: usize) -> crate::rate::BinFracBits {
      crate::rate::BinFracBits { bits: [1 << crate::consts::SCALE_BITS, 3 << crate::consts::SCALE_BITS] }
    }
    fn gt1_flag(&self, _ctx_id: usize) -> crate::rate::BinFracBits {
      crate::rate::BinFracBits { bits: [2 << crate::consts::SCALE_BITS, 2 << crate::consts::SCALE_BITS] }
    }
    fn par_flag(&self, _ctx_id: usize) -> crate::rate::BinFracBits {
      crate::rate::BinFracBits { bits: [1 << crate::consts::SCALE_BITS, 1 << crate::consts::SCALE_BITS] }
    }
    fn gt2_flag(&self, _ctx_id: usize) -> crate::rate::BinFracBits {
      crate::rate::BinFracBits { bits: [1 << crate::consts::SCALE_BITS, 1 << crate::consts::SCALE_BITS] }
    }
    fn last_prefix(&self, _ctx_id: usize, _is_x: bool) -> crate::rate::BinFracBits {
      crate::rate::BinFracBits { bits: [1 << crate::consts::SCALE_BITS, 1 << crate::consts::SCALE_BITS] }
    }
    fn cbf_flag(&self, _ctx_id: usize) -> crate::rate::BinFracBits {
      crate::rate::BinFracBits { bits: [1 << crate::consts::SCALE_BITS, 1 << crate::consts::SCALE_BITS] }
    }
  }

  /// When every incoming path is artificially expensive (standing in for a
  /// long run of costly "forced zero above here" decisions), a large
  /// coefficient's cheap terminal candidate must win the decision instead,
  /// landing on `DECISION_TERMINAL` rather than inheriting from any of the
  /// four incoming states.
  #[test]
  fn terminal_candidate_wins_over_expensive_incoming_paths() {
    let tu = rom().tu_parameters(4, 4, crate::enums::ChannelType::Luma);
    let rate_est = RateEstimator::init(&tu, crate::enums::ChannelType::Luma, &FlatFba);
    let qb = crate::quant::QuantBlock::init(10, 8, false);
    let pq = crate::quant::pre_quant_coeff(&qb, 500);

    let scan_idx = 0;
    let scan_info = &tu.scan_info[scan_idx];
    let budget = crate::consts::reg_bin_budget(tu.nz_width, tu.nz_height);
    let mut prev_states = [State::root(budget); NUM_STATES];
    for s in &mut prev_states {
      s.rd_cost = 1_000_000_000;
    }
    let last_offset = rate_est.last_coeff_fbits(scan_info.pos_x as usize, scan_info.pos_y as usize);

    let (_, decisions) = decide_position(&prev_states, &pq, &rate_est, 0, 1, 1 << crate::consts::SCALE_BITS, crate::consts::SCALE_BITS, scan_info, last_offset, budget);

    assert!(decisions.iter().any(|d| d.prev_state == DECISION_TERMINAL));
  }
}
