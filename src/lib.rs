//! Dependent-quantization core for a block-based video encoder.
//!
//! This crate implements the rate-distortion-optimized trellis quantizer
//! used to turn raw transform coefficients into the signed integer levels
//! an entropy coder writes out, and back. It operates on exactly one
//! transform block at a time and carries no state between calls beyond what
//! [`driver::DepQuant::init`] configures once up front.
//!
//! The pieces, in the order data flows through them:
//!
//! - [`scan`] builds the scan order, sub-block partitioning and neighbour
//!   tables for a transform block's shape (the "scan ROM").
//! - [`rate`] turns a snapshot of the entropy coder's context-probability
//!   state into fractional-bit costs, via the caller-supplied
//!   [`rate::FracBitsAccess`].
//! - [`quant`] is the non-dependent scalar quantizer: two interleaved
//!   quantizers a coefficient could be reconstructed under.
//! - [`state`] is the 4-state trellis itself, plus the small amount of
//!   context carried across coefficient-group boundaries.
//! - [`driver`] wires all of the above into `quant()`/`dequant()`.

pub mod array2d;
pub mod consts;
pub mod driver;
pub mod enums;
pub mod quant;
pub mod rate;
pub mod scan;
pub mod state;
pub mod util;

pub use driver::{DepQuant, QuantResult, RdoqMode, TuContext};
pub use enums::{ChannelType, ComponentId, ScanPosType};
pub use rate::{BinFracBits, CoeffFracBits, FracBitsAccess};
