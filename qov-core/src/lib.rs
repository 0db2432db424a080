//! QOV Core Library
//!
//! Shared building blocks for the QOV video format: the error taxonomy, the
//! growable byte writer, the LZ4 block codec, BT.601 color conversion, the
//! container framing and the opcode constants used by the encoder and
//! decoder crates.

pub mod color;
pub mod container;
pub mod frame;
pub mod lz4;
pub mod opcodes;
pub mod pixel;
pub mod writer;

pub use container::{ChunkHeader, Colorspace, FileHeader, IndexEntry};
pub use frame::Frame;
pub use pixel::{ColorCache, Pixel, ValueCache};
pub use writer::ByteWriter;

/// Result type for QOV operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for QOV operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An argument is outside the range the format can represent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The stream does not start with a QOV header this implementation
    /// understands.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// The input ends before the structure it promised.
    #[error("truncated input: {0}")]
    TruncatedInput(String),

    /// The bytes are framed correctly but their content is inconsistent.
    #[error("corrupted stream: {0}")]
    CorruptedStream(String),

    /// The output buffer could not grow.
    #[error("writer exhausted")]
    WriterExhausted,

    /// The data source has not delivered enough bytes yet; callers retry.
    #[error("data not yet available")]
    NotYetAvailable,
}
