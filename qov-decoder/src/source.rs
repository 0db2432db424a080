//! Byte sources feeding the streaming decoder
//!
//! A source hands out ranges of the stream by absolute offset. A fully
//! buffered source answers every in-range read immediately; a source that is
//! still being filled answers `NotYetAvailable` for ranges it does not hold
//! yet, and the decoder resumes where it left off once the caller retries.

use qov_core::{Error, Result};

/// Random-access byte supplier for [`crate::QovDecoder`]
pub trait DataSource {
    /// Total stream size, when known
    fn total_size(&self) -> Option<u64>;

    /// Reads `length` bytes at `offset`.
    ///
    /// Fails with `NotYetAvailable` when the range has not been delivered
    /// yet (transient) and `TruncatedInput` when it lies past the final
    /// stream size.
    fn read(&mut self, offset: u64, length: usize) -> Result<Vec<u8>>;

    /// True when [`Self::read`] for the range would succeed right now
    fn is_available(&self, offset: u64, length: usize) -> bool;
}

/// A fully buffered in-memory stream
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    /// Wraps a complete QOV stream held in memory
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl DataSource for MemorySource {
    fn total_size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn read(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let end = offset + length as u64;
        if end > self.data.len() as u64 {
            return Err(Error::TruncatedInput(format!(
                "read of {length} bytes at offset {offset} past end of {}-byte stream",
                self.data.len()
            )));
        }
        Ok(self.data[offset as usize..end as usize].to_vec())
    }

    fn is_available(&self, offset: u64, length: usize) -> bool {
        offset + length as u64 <= self.data.len() as u64
    }
}
