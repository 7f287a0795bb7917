// Fixed geometric and numeric constants for the dependent-quantization trellis.
//
// Most of these mirror the ROM tables and magic numbers of the reference
// encoder they were distilled from: the 4-state DQ machine's transition
// table, the fixed-point rate scale, and the scalar quantizer's integer
// shift math. None of this is tunable at runtime.

/// Number of fractional bits used to express rate estimates and RD costs.
pub const SCALE_BITS: u32 = 15;

/// Number of Golomb-Rice cost table entries (one per possible quotient value).
pub const RICE_MAX: usize = 32;

/// `R` in `remRegBins = (effWidth * effHeight * R) / 16`: the number of
/// regular-coded bins budgeted per 16 samples before bypass coding kicks in.
pub const MAX_TU_LEVEL_CTX_CODED_BIN_CONSTRAINT: i32 = 28;

/// Regular-coded-bin budget for a transform block of `eff_width x eff_height`
/// (the zero-out-clamped dimensions). Once a trellis path's running budget
/// drops below 4, every remaining position in that path switches from the
/// context-coded rate formula to a pure bypass (Golomb-Rice-only) one.
pub const fn reg_bin_budget(eff_width: usize, eff_height: usize) -> i32 {
  ((eff_width * eff_height) as i32 * MAX_TU_LEVEL_CTX_CODED_BIN_CONSTRAINT) / 16
}

/// Upper bound on the coefficient-group (sub-block) size across every
/// supported transform-block shape; every shape this crate builds a scan for
/// collapses its groups to 16 coefficients or fewer.
pub const MAX_SBB_SIZE: usize = 16;

/// Coefficients outside the top-left `ZERO_OUT_SIZE x ZERO_OUT_SIZE` region of
/// a transform block are always forced to zero and excluded from the trellis.
pub const ZERO_OUT_SIZE: usize = 32;

/// Integer shift applied during forward scalar quantization.
pub const QUANT_SHIFT: i32 = 14;

/// Integer shift applied during scalar dequantization.
pub const IQUANT_SHIFT: i32 = 6;

/// log2 of the neutral (1.0) scaling-list weight, used when no scaling list
/// is supplied so dequant shares the same shift math as the scaled path.
pub const LOG2_SCALING_LIST_NEUTRAL_VALUE: i32 = 4;

/// Forward quantization scale per `(needsSqrt2Adjustment, qpRem)`.
pub const QUANT_SCALES: [[i64; 6]; 2] = [
  [26214, 23302, 20560, 18396, 16384, 14564],
  [29775, 26214, 23302, 20560, 18396, 16384],
];

/// Inverse (dequant) scale per `(needsSqrt2Adjustment, qpRem)`.
pub const INV_QUANT_SCALES: [[i64; 6]; 2] = [
  [40, 45, 51, 57, 64, 72],
  [45, 51, 57, 64, 72, 80],
];

/// Bit-exact 4-state x 2-parity DQ transition table, packed as a 16-bit value.
/// `next_state = (DQ_STATE_TRANSITION >> ((state << 2) + ((level & 1) << 1))) & 3`.
pub const DQ_STATE_TRANSITION: u32 = 0x7D28;

/// `Decision::rd_cost` used to seed "no candidate yet" sentinels. Half of
/// `i64::MAX` so two such costs can still be added without overflow.
pub const RD_COST_INIT: i64 = i64::MAX >> 2;

/// Precomputed fractional bit cost of a Golomb-Rice remainder `v`, per Rice
/// parameter (row) and quotient `min(v, RICE_MAX - 1)` (column), in
/// `SCALE_BITS`-fixed-point units.
pub const GO_RICE_BITS: [[i64; RICE_MAX]; 4] = [
  [
    32768, 65536, 98304, 131072, 163840, 196608, 262144, 262144, 327680, 327680, 327680, 327680,
    393216, 393216, 393216, 393216, 393216, 393216, 393216, 393216, 458752, 458752, 458752,
    458752, 458752, 458752, 458752, 458752, 458752, 458752, 458752, 458752,
  ],
  [
    65536, 65536, 98304, 98304, 131072, 131072, 163840, 163840, 196608, 196608, 229376, 229376,
    294912, 294912, 294912, 294912, 360448, 360448, 360448, 360448, 360448, 360448, 360448,
    360448, 425984, 425984, 425984, 425984, 425984, 425984, 425984, 425984,
  ],
  [
    98304, 98304, 98304, 98304, 131072, 131072, 131072, 131072, 163840, 163840, 163840, 163840,
    196608, 196608, 196608, 196608, 229376, 229376, 229376, 229376, 262144, 262144, 262144,
    262144, 327680, 327680, 327680, 327680, 327680, 327680, 327680, 327680,
  ],
  [
    131072, 131072, 131072, 131072, 131072, 131072, 131072, 131072, 163840, 163840, 163840,
    163840, 163840, 163840, 163840, 163840, 196608, 196608, 196608, 196608, 196608, 196608,
    196608, 196608, 229376, 229376, 229376, 229376, 229376, 229376, 229376, 229376,
  ],
];

/// Offsets into the `lastBits[pos]` group table, indexed by `log2(size)`.
pub const LAST_PREFIX_CTX: [u32; 8] = [0, 0, 0, 3, 6, 10, 15, 21];

/// Derives the Golomb-Rice parameter used for bypass coding from a local
/// absolute-level accumulator, following the same staircase shape as the
/// reference ROM table (roughly one step per four units of magnitude).
///
/// The exact ROM contents for this table weren't present in the retrieved
/// reference source; see DESIGN.md for the derivation rationale.
pub const fn go_rice_param_for_sum(sum_all: u8) -> u8 {
  let clipped = if sum_all > 31 { 31 } else { sum_all };
  let par = clipped / 4;
  if par > 4 { 4 } else { par }
}

/// Derives the "near zero" Rice threshold used to decide whether a bypass
/// level should be coded via the short or the escape path. Depends on the
/// trellis state's parity so the four DQ states don't alias.
pub const fn go_rice_pos_coeff0(state_id: i8, rice_par: u8) -> i32 {
  (1i32 << rice_par) + ((state_id & 1) as i32)
}

/// Distortion-precision adjustment per channel bit depth, i.e. `max(0, bd-8)`.
pub const fn distortion_precision_adjustment(bit_depth: u32) -> i32 {
  if bit_depth > 8 { (bit_depth - 8) as i32 } else { 0 }
}
