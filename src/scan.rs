// Scan/neighbourhood ROM (component A): for every supported transform-block
// shape, precomputes the coefficient scan order, sub-block partitioning, and
// the in-/out-of-sub-block neighbour lists the context model reads from.
//
// This is process-wide, read-only, lazily-initialized state: the shape
// tables only depend on geometry, so every caller shares one cache behind a
// mutex taken just long enough to insert a missing entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::enums::ChannelType;
use crate::consts::ZERO_OUT_SIZE;

/// Up to five earlier-in-scan-order (lower inside-sub-block position, not
/// yet decided) positions in the same sub-block that should receive a
/// context push once *this* position's level is decided. The trellis walks
/// the sub-block from its last position to its first, so by the time a
/// position is decided, everything in its `inv_in_pos` list is still ahead
/// of it.
#[derive(Clone, Copy, Debug, Default)]
pub struct NbInfoSbb {
  pub num_inv: u8,
  pub inv_in_pos: [u8; 5],
}

/// Up to five already-decided (higher scanId, in a different, already
/// finished sub-block) positions this position's context reads from when its
/// own sub-block is first seeded, plus the running max distance this
/// position's lookups ever reach into a finished sub-block.
#[derive(Clone, Copy, Debug, Default)]
pub struct NbInfoOut {
  pub num: u8,
  pub out_pos: [u16; 5],
  pub max_dist: u16,
}

/// Denormalized per-scan-position tuple consumed directly by the decision
/// kernel and the trellis state updates.
#[derive(Clone, Copy, Debug)]
pub struct ScanInfo {
  pub scan_idx: usize,
  pub raster_pos: usize,
  pub sbb_pos: usize,
  pub inside_pos: usize,
  pub spt: crate::enums::ScanPosType,
  pub pos_x: u16,
  pub pos_y: u16,
  pub sig_ctx_offset_next: usize,
  pub gtx_ctx_offset_next: usize,
  pub next_inside_pos: usize,
  pub curr_nb_info_sbb: NbInfoSbb,
  pub next_sbb_right: Option<usize>,
  pub next_sbb_below: Option<usize>,
}

/// Geometry shared by every transform block of a given (nonzero-clamped)
/// width/height, independent of channel.
struct ShapeTables {
  width_in_sbb: usize,
  height_in_sbb: usize,
  sbb_w: usize,
  sbb_h: usize,
  scan_id2_pos: Vec<(u16, u16)>,
  scan_sbb_id2_pos: Vec<usize>,
  nb_sbb: Vec<NbInfoSbb>,
  nb_out: Vec<NbInfoOut>,
}

/// Per-shape, per-channel denormalized parameters: the public product of the
/// scan ROM that the Driver and decision kernel consult.
pub struct TuParameters {
  pub width: usize,
  pub height: usize,
  pub nz_width: usize,
  pub nz_height: usize,
  pub num_coeff: usize,
  pub sbb_size: usize,
  pub sbb_mask: usize,
  pub num_sbb: usize,
  pub width_in_sbb: usize,
  pub height_in_sbb: usize,
  pub scan_id2_blk_pos: Vec<(u16, u16)>,
  pub scan_info: Vec<ScanInfo>,
  pub nb_out: Arc<Vec<NbInfoOut>>,
}

impl TuParameters {
  /// Raster offset (row-major, stride = `self.width`) of a scan position.
  pub fn raster_of(&self, scan_idx: usize) -> usize {
    self.scan_info[scan_idx].raster_pos
  }
}

/// Up-right diagonal scan over a `w x h` grid: diagonal index `d = x + y`
/// ascending, and within a diagonal, `y` descending (so positions move
/// up and to the right as the scan index increases).
fn diagonal_scan(w: usize, h: usize) -> Vec<(u16, u16)> {
  let mut out = Vec::with_capacity(w * h);
  for d in 0..(w + h - 1) {
    let y_max = d.min(h - 1);
    let y_min = if d >= w { d - w + 1 } else { 0 };
    for y in (y_min..=y_max).rev() {
      let x = d - y;
      debug_assert!(x < w);
      out.push((x as u16, y as u16));
    }
  }
  debug_assert_eq!(out.len(), w * h);
  out
}

/// Coefficient-group shape for a given (nonzero-clamped) TB shape. Always 16
/// samples unless the whole block is smaller than one group, in which case
/// the group collapses to the block itself.
fn sbb_shape(nz_w: usize, nz_h: usize) -> (usize, usize) {
  if nz_w * nz_h <= 16 {
    (nz_w, nz_h)
  } else if nz_w == 2 {
    (2, 8)
  } else if nz_h == 2 {
    (8, 2)
  } else {
    (4, 4)
  }
}

fn build_shape_tables(nz_w: usize, nz_h: usize) -> ShapeTables {
  let (sbb_w, sbb_h) = sbb_shape(nz_w, nz_h);
  let group_size = sbb_w * sbb_h;
  let width_in_sbb = nz_w / sbb_w;
  let height_in_sbb = nz_h / sbb_h;

  let cg_order = diagonal_scan(width_in_sbb, height_in_sbb);
  let local_order = diagonal_scan(sbb_w, sbb_h);

  let total = nz_w * nz_h;
  let mut scan_id2_pos = Vec::with_capacity(total);
  let mut scan_sbb_id2_pos = Vec::with_capacity(cg_order.len());
  for &(cgx, cgy) in &cg_order {
    scan_sbb_id2_pos.push(cgy as usize * width_in_sbb + cgx as usize);
    for &(lx, ly) in &local_order {
      let x = cgx as usize * sbb_w + lx as usize;
      let y = cgy as usize * sbb_h + ly as usize;
      scan_id2_pos.push((x as u16, y as u16));
    }
  }

  // Local (nz-region-only) raster-to-scanId inverse map, stride nz_w.
  let mut raster2id = vec![0usize; total];
  for (scan_id, &(x, y)) in scan_id2_pos.iter().enumerate() {
    raster2id[y as usize * nz_w + x as usize] = scan_id;
  }

  let mut nb_sbb = vec![NbInfoSbb::default(); total];
  let mut nb_out = vec![NbInfoOut::default(); total];

  for scan_id in 0..total {
    let (x, y) = scan_id2_pos[scan_id];
    let (pos_x, pos_y) = (x as usize, y as usize);
    let rpos = pos_y * nz_w + pos_x;
    let beg_sbb = scan_id - (scan_id & (group_size - 1));

    // Inside-sub-block neighbours: raster2id[candidate] in [scan_id+1, beg_sbb+group_size).
    {
      let mut cpos = [0usize; 5];
      if pos_x + 1 < nz_w {
        let c = raster2id[rpos + 1];
        if c < beg_sbb + group_size {
          cpos[0] = c;
        }
      }
      if pos_x + 2 < nz_w {
        let c = raster2id[rpos + 2];
        if c < beg_sbb + group_size {
          cpos[1] = c;
        }
      }
      if pos_x + 1 < nz_w && pos_y + 1 < nz_h {
        let c = raster2id[rpos + 1 + nz_w];
        if c < beg_sbb + group_size {
          cpos[2] = c;
        }
      }
      if pos_y + 1 < nz_h {
        let c = raster2id[rpos + nz_w];
        if c < beg_sbb + group_size {
          cpos[3] = c;
        }
      }
      if pos_y + 2 < nz_h {
        let c = raster2id[rpos + 2 * nz_w];
        if c < beg_sbb + group_size {
          cpos[4] = c;
        }
      }

      let mut in_pos = [0u8; 5];
      let mut num = 0usize;
      loop {
        let mut nk: Option<usize> = None;
        for k in 0..5 {
          if cpos[k] != 0 && (nk.is_none() || cpos[k] < cpos[nk.unwrap()]) {
            nk = Some(k);
          }
        }
        match nk {
          Some(k) => {
            // Store relative to the target's own sub-block, not absolute:
            // `target` is reconstructed below as `beg_sbb + in_pos[k]`, and
            // `beg_sbb` is the *source*'s sub-block start here, which is the
            // same sub-block the target lives in.
            in_pos[num] = (cpos[k] - beg_sbb) as u8;
            num += 1;
            cpos[k] = 0;
          }
          None => break,
        }
      }
      for k in 0..num {
        let target = beg_sbb + in_pos[k] as usize;
        let dst = &mut nb_sbb[target];
        debug_assert!((dst.num_inv as usize) < 5);
        // `target` (this candidate, higher scanId) is decided before `scan_id`
        // in the reverse-scan trellis, so it pushes into `scan_id`'s slot.
        dst.inv_in_pos[dst.num_inv as usize] = (scan_id & (group_size - 1)) as u8;
        dst.num_inv += 1;
      }
    }

    // Out-of-sub-block neighbours: raster2id[candidate] >= beg_sbb+group_size.
    {
      let mut cpos = [0usize; 5];
      if pos_x + 1 < nz_w {
        let c = raster2id[rpos + 1];
        if c >= beg_sbb + group_size {
          cpos[0] = c;
        }
      }
      if pos_x + 2 < nz_w {
        let c = raster2id[rpos + 2];
        if c >= beg_sbb + group_size {
          cpos[1] = c;
        }
      }
      if pos_x + 1 < nz_w && pos_y + 1 < nz_h {
        let c = raster2id[rpos + 1 + nz_w];
        if c >= beg_sbb + group_size {
          cpos[2] = c;
        }
      }
      if pos_y + 1 < nz_h {
        let c = raster2id[rpos + nz_w];
        if c >= beg_sbb + group_size {
          cpos[3] = c;
        }
      }
      if pos_y + 2 < nz_h {
        let c = raster2id[rpos + 2 * nz_w];
        if c >= beg_sbb + group_size {
          cpos[4] = c;
        }
      }

      let nbo = &mut nb_out[scan_id];
      loop {
        let mut nk: Option<usize> = None;
        for k in 0..5 {
          if cpos[k] != 0 && (nk.is_none() || cpos[k] < cpos[nk.unwrap()]) {
            nk = Some(k);
          }
        }
        match nk {
          Some(k) => {
            nbo.out_pos[nbo.num as usize] = cpos[k] as u16;
            nbo.num += 1;
            cpos[k] = 0;
          }
          None => break,
        }
      }

      nbo.max_dist = if scan_id == 0 {
        0
      } else {
        nb_out[scan_id - 1].max_dist
      };
      let nbo = &mut nb_out[scan_id];
      for k in 0..nbo.num as usize {
        if nbo.out_pos[k] > nbo.max_dist {
          nbo.max_dist = nbo.out_pos[k];
        }
      }
    }
  }

  // Relativize: outPos/maxDist become distances from beg_sbb / scan_id.
  for scan_id in 0..total {
    let beg_sbb = scan_id - (scan_id & (group_size - 1));
    let nbo = &mut nb_out[scan_id];
    for k in 0..nbo.num as usize {
      debug_assert!(nbo.out_pos[k] as usize >= beg_sbb);
      nbo.out_pos[k] -= beg_sbb as u16;
    }
    nbo.max_dist -= scan_id as u16;
  }

  ShapeTables {
    width_in_sbb,
    height_in_sbb,
    sbb_w,
    sbb_h,
    scan_id2_pos,
    scan_sbb_id2_pos,
    nb_sbb,
    nb_out,
  }
}

fn shape_diag_ctx_offsets(chan: ChannelType, diag: usize) -> (usize, usize) {
  match chan {
    ChannelType::Luma => {
      let sig = if diag < 2 {
        8
      } else if diag < 5 {
        4
      } else {
        0
      };
      let gtx = if diag < 1 {
        16
      } else if diag < 3 {
        11
      } else if diag < 10 {
        6
      } else {
        1
      };
      (sig, gtx)
    }
    ChannelType::Chroma => {
      let sig = if diag < 2 { 4 } else { 0 };
      let gtx = if diag < 1 { 6 } else { 1 };
      (sig, gtx)
    }
  }
}

fn build_tu_parameters(width: usize, height: usize, chan: ChannelType, shapes: &ShapeTables) -> TuParameters {
  let nz_width = width.min(ZERO_OUT_SIZE);
  let nz_height = height.min(ZERO_OUT_SIZE);
  let num_coeff = nz_width * nz_height;
  let sbb_size = shapes.sbb_w * shapes.sbb_h;
  let sbb_mask = sbb_size - 1;
  let num_sbb = shapes.width_in_sbb * shapes.height_in_sbb;

  let scan_id2_blk_pos = shapes.scan_id2_pos.clone();
  let nb_out = Arc::new(shapes.nb_out.clone());

  let mut scan_info = Vec::with_capacity(num_coeff);
  for scan_idx in 0..num_coeff {
    let (x, y) = scan_id2_blk_pos[scan_idx];
    let raster_pos = y as usize * width + x as usize;
    let sbb_pos = shapes.scan_sbb_id2_pos[scan_idx >> (sbb_size.trailing_zeros())];
    let inside_pos = scan_idx & sbb_mask;

    let mut spt = crate::enums::ScanPosType::InSbb;
    if inside_pos == sbb_mask && scan_idx > sbb_size && scan_idx < num_coeff - 1 {
      spt = crate::enums::ScanPosType::StartOfSbb;
    } else if inside_pos == 0 && scan_idx > 0 && scan_idx < num_coeff - sbb_size {
      spt = crate::enums::ScanPosType::EndOfSbb;
    }

    let (mut sig_ctx_offset_next, mut gtx_ctx_offset_next, mut next_inside_pos) = (0, 0, 0);
    let mut curr_nb_info_sbb = NbInfoSbb::default();

    if scan_idx > 0 {
      let next_scan_idx = scan_idx - 1;
      let (nx, ny) = scan_id2_blk_pos[next_scan_idx];
      let diag = nx as usize + ny as usize;
      let (sig, gtx) = shape_diag_ctx_offsets(chan, diag);
      sig_ctx_offset_next = sig;
      gtx_ctx_offset_next = gtx;
      next_inside_pos = next_scan_idx & sbb_mask;
      curr_nb_info_sbb = shapes.nb_sbb[scan_idx];
    }

    // This position's own sub-block's raster-adjacent neighbours, used for
    // the sub-block significance context. Computed from `sbb_pos` directly
    // (shared by every position in the sub-block) rather than gated on
    // `inside_pos`, so it is available at both the first and last position
    // of a sub-block.
    let sbb_y = sbb_pos / shapes.width_in_sbb;
    let sbb_x = sbb_pos - sbb_y * shapes.width_in_sbb;
    let next_sbb_right = if sbb_x + 1 < shapes.width_in_sbb { Some(sbb_pos + 1) } else { None };
    let next_sbb_below = if sbb_y + 1 < shapes.height_in_sbb { Some(sbb_pos + shapes.width_in_sbb) } else { None };

    scan_info.push(ScanInfo {
      scan_idx,
      raster_pos,
      sbb_pos,
      inside_pos,
      spt,
      pos_x: x,
      pos_y: y,
      sig_ctx_offset_next,
      gtx_ctx_offset_next,
      next_inside_pos,
      curr_nb_info_sbb,
      next_sbb_right,
      next_sbb_below,
    });
  }

  TuParameters {
    width,
    height,
    nz_width,
    nz_height,
    num_coeff,
    sbb_size,
    sbb_mask,
    num_sbb,
    width_in_sbb: shapes.width_in_sbb,
    height_in_sbb: shapes.height_in_sbb,
    scan_id2_blk_pos,
    scan_info,
    nb_out,
  }
}

type ShapeKey = (usize, usize);
type TuKey = (usize, usize, bool);

/// Process-wide scan/neighbourhood ROM. Initialization is idempotent and
/// guarded by a mutex; once a shape has been built it is never recomputed or
/// mutated, so reads afterwards need no further synchronization.
pub struct Rom {
  shapes: Mutex<HashMap<ShapeKey, Arc<ShapeTables>>>,
  tu_params: Mutex<HashMap<TuKey, Arc<TuParameters>>>,
}

impl Rom {
  fn new() -> Self {
    Self {
      shapes: Mutex::new(HashMap::new()),
      tu_params: Mutex::new(HashMap::new()),
    }
  }

  fn shape_tables(&self, nz_w: usize, nz_h: usize) -> Arc<ShapeTables> {
    let mut guard = self.shapes.lock().unwrap();
    guard
      .entry((nz_w, nz_h))
      .or_insert_with(|| Arc::new(build_shape_tables(nz_w, nz_h)))
      .clone()
  }

  /// Returns the (possibly cached) `TuParameters` for a transform block of
  /// the given shape and channel. Cheap to call repeatedly: the expensive
  /// neighbour-table construction only ever runs once per distinct shape.
  pub fn tu_parameters(&self, width: usize, height: usize, chan: ChannelType) -> Arc<TuParameters> {
    assert!(width.is_power_of_two() && height.is_power_of_two());
    assert!(width >= 2 && height >= 2 && width <= 64 && height <= 64);
    assert!(!(width < 4 && height < 4), "TB shape below 4x4 on both axes is unsupported");

    let key = (width, height, chan == ChannelType::Luma);
    if let Some(p) = self.tu_params.lock().unwrap().get(&key) {
      return p.clone();
    }

    let nz_w = width.min(ZERO_OUT_SIZE);
    let nz_h = height.min(ZERO_OUT_SIZE);
    let shapes = self.shape_tables(nz_w, nz_h);
    let built = Arc::new(build_tu_parameters(width, height, chan, &shapes));

    self
      .tu_params
      .lock()
      .unwrap()
      .entry(key)
      .or_insert(built)
      .clone()
  }
}

static ROM: OnceLock<Rom> = OnceLock::new();

/// Process-wide ROM instance, built lazily on first use.
pub fn rom() -> &'static Rom {
  ROM.get_or_init(Rom::new)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scan_is_a_permutation() {
    for &(w, h) in &[(4usize, 4usize), (8, 8), (4, 8), (8, 4), (16, 16), (32, 32)] {
      let tu = rom().tu_parameters(w, h, ChannelType::Luma);
      let mut seen = vec![false; tu.num_coeff];
      for &(x, y) in &tu.scan_id2_blk_pos {
        let raster = y as usize * w + x as usize;
        assert!(raster < w * h);
        let local = (y as usize) * tu.nz_width + x as usize;
        assert!(!seen[local]);
        seen[local] = true;
      }
      assert!(seen.iter().all(|&b| b));
    }
  }

  #[test]
  fn nb_info_sbb_targets_are_earlier_in_same_sub_block() {
    // `curr_nb_info_sbb` lists positions this one pushes context into once
    // decided; since the trellis decides a sub-block from its last position
    // to its first, every push target must have a strictly lower in-block
    // position than the position doing the pushing.
    let tu = rom().tu_parameters(8, 8, ChannelType::Luma);
    for s in 0..tu.num_coeff {
      let nb = tu.scan_info[s].curr_nb_info_sbb;
      for k in 0..nb.num_inv as usize {
        assert!(nb.inv_in_pos[k] as usize < s % tu.sbb_size);
      }
    }
  }

  #[test]
  fn nb_info_out_offsets_are_positive_and_sorted() {
    let tu = rom().tu_parameters(16, 16, ChannelType::Luma);
    for nbo in tu.nb_out.iter() {
      let mut prev = 0u16;
      for k in 0..nbo.num as usize {
        assert!(nbo.out_pos[k] > 0);
        assert!(nbo.out_pos[k] >= prev);
        prev = nbo.out_pos[k];
      }
      assert!(nbo.num <= 5);
    }
  }

  #[test]
  fn rom_is_shared_across_calls() {
    let a = rom().tu_parameters(8, 8, ChannelType::Luma);
    let b = rom().tu_parameters(8, 8, ChannelType::Luma);
    assert!(Arc::ptr_eq(&a, &b));
  }
}
