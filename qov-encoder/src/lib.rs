//! QOV Encoder Library
//!
//! This library turns successive RGBA frames into a QOV byte stream: opcode
//! encoding for RGB frames and YUV planes, plus the [`QovEncoder`]
//! orchestrator that owns the container framing, compression gating and
//! keyframe indexing.

pub mod encoder;
pub mod plane;
pub mod rgb;

pub use encoder::QovEncoder;
pub use qov_core::{Error, Result};
