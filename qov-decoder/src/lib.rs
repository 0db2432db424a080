//! QOV Decoder Library
//!
//! This library reconstructs RGBA frames from a QOV byte stream. The
//! [`QovDecoder`] orchestrator consumes any [`DataSource`] (a fully
//! buffered file or a still-growing byte stream), builds a chunk index
//! incrementally, and serves random access by replaying from the nearest
//! preceding keyframe.

pub mod decoder;
pub mod plane;
pub mod rgb;
pub mod source;

pub use decoder::{ChunkDescriptor, FileStats, QovDecoder};
pub use qov_core::{Error, Result};
pub use source::{DataSource, MemorySource};
