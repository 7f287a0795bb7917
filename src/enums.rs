// Copyright (c) 2024-2025, The tinyavif contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

/// Channel type a transform block belongs to. Luma and chroma use differently
/// sized context tables throughout the Rate Estimator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelType {
  Luma,
  Chroma,
}

/// Which colour component a call concerns. Distinct from `ChannelType`
/// because `xSetLastCoeffOffset`'s CBF-delta derivation only special-cases Y.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentId {
  Y,
  Cb,
  Cr,
}

impl ComponentId {
  pub fn channel_type(self) -> ChannelType {
    match self {
      ComponentId::Y => ChannelType::Luma,
      ComponentId::Cb | ComponentId::Cr => ChannelType::Chroma,
    }
  }
}

/// Role of a scan position relative to its coefficient group, driving which
/// extra flags (sub-block significance, sub-block skip) the decision kernel
/// must price in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanPosType {
  /// Ordinary position inside an already-significant sub-block.
  InSbb,
  /// First position visited (in reverse scan) within its sub-block: the
  /// sub-block-significance flag for *this* group is still undecided.
  StartOfSbb,
  /// Last position visited within its sub-block (`insidePos == 0`): the
  /// sub-block may still turn out to be all-zero, so a skip candidate exists.
  EndOfSbb,
}
