//! QOV container framing
//!
//! ## File header (24 bytes, multi-byte fields big-endian)
//!
//! | Offset | Size | Field            |
//! |--------|------|------------------|
//! | 0      | 4    | magic `qovf`     |
//! | 4      | 1    | version (1 or 2) |
//! | 5      | 1    | flags            |
//! | 6      | 2    | width            |
//! | 8      | 2    | height           |
//! | 10     | 2    | fps numerator    |
//! | 12     | 2    | fps denominator  |
//! | 14     | 4    | total frames     |
//! | 18     | 1    | audio channels   |
//! | 19     | 3    | audio rate (Hz)  |
//! | 22     | 1    | colorspace       |
//! | 23     | 1    | reserved         |
//!
//! Chunks follow back to back: a header (`type`, `flags`, `size`,
//! `timestamp`; the size field is 16-bit in version 1 and 32-bit in
//! version 2) and `size` payload bytes. The size excludes the header but
//! includes the trailing 8-byte end marker of frame chunks and the 4-byte
//! uncompressed-size prefix of compressed chunks.

use std::fmt::Display;

use byteorder::{BigEndian, ByteOrder};

use crate::{writer::ByteWriter, Error, Result};

/// Magic bytes for the QOV format: "qovf"
pub const MAGIC: [u8; 4] = *b"qovf";

/// Magic bytes opening a SYNC chunk body: "QOVS"
pub const SYNC_MAGIC: [u8; 4] = *b"QOVS";

/// Container version with 16-bit chunk sizes
pub const VERSION_1: u8 = 0x01;
/// Container version with 32-bit chunk sizes; what this encoder emits
pub const VERSION_2: u8 = 0x02;

/// File header flag bits
pub mod header_flags {
    pub const HAS_ALPHA: u8 = 0x01;
    pub const HAS_MOTION: u8 = 0x02;
    pub const HAS_INDEX: u8 = 0x04;
    pub const HAS_BFRAMES: u8 = 0x08;
    pub const ENHANCED_COMP: u8 = 0x10;
}

/// Chunk type bytes
pub mod chunk_type {
    /// Resynchronization marker emitted immediately before every keyframe
    pub const SYNC: u8 = 0x00;
    pub const KEYFRAME: u8 = 0x01;
    pub const PFRAME: u8 = 0x02;
    /// Reserved for HAS_BFRAMES streams; indexed but never produced here
    pub const BFRAME: u8 = 0x03;
    /// Reserved; opaque to the video codec
    pub const AUDIO: u8 = 0x10;
    /// Keyframe index table, written once immediately before END
    pub const INDEX: u8 = 0xF0;
    pub const END: u8 = 0xFF;
}

/// Chunk flag bits
pub mod chunk_flags {
    /// Frame body holds per-plane YUV opcodes instead of RGB opcodes
    pub const YUV: u8 = 0x01;
    /// Reserved for motion vectors; never set by this encoder
    pub const MOTION: u8 = 0x02;
    /// Payload is LZ4-wrapped behind a 4-byte uncompressed size
    pub const COMPRESSED: u8 = 0x10;
}

/// Pixel colorspaces representable in the file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum Colorspace {
    Srgb = 0x00,
    Srgba = 0x01,
    Linear = 0x02,
    LinearAlpha = 0x03,
    Yuv420 = 0x10,
    Yuv422 = 0x11,
    Yuv444 = 0x12,
    Yuv444Alpha = 0x13,
}

impl Colorspace {
    /// Parses a colorspace byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Srgb),
            0x01 => Some(Self::Srgba),
            0x02 => Some(Self::Linear),
            0x03 => Some(Self::LinearAlpha),
            0x10 => Some(Self::Yuv420),
            0x11 => Some(Self::Yuv422),
            0x12 => Some(Self::Yuv444),
            0x13 => Some(Self::Yuv444Alpha),
            _ => None,
        }
    }

    /// True for the plane-coded YUV colorspaces (0x10..=0x13)
    pub fn is_yuv(self) -> bool {
        (self as u8) >= 0x10
    }

    /// True when frames carry a dedicated alpha plane
    pub fn has_alpha_plane(self) -> bool {
        self == Self::Yuv444Alpha
    }
}

impl Display for Colorspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Srgb => "sRGB",
            Self::Srgba => "sRGBA",
            Self::Linear => "linear RGB",
            Self::LinearAlpha => "linear RGBA",
            Self::Yuv420 => "YUV 4:2:0",
            Self::Yuv422 => "YUV 4:2:2",
            Self::Yuv444 => "YUV 4:4:4",
            Self::Yuv444Alpha => "YUV 4:4:4 + alpha",
        };
        write!(f, "{name}")
    }
}

/// QOV file header
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FileHeader {
    /// Container version (1 or 2)
    pub version: u8,
    /// Header flag bits, see [`header_flags`]
    pub flags: u8,
    /// Frame width in pixels
    pub width: u16,
    /// Frame height in pixels
    pub height: u16,
    /// Frame rate numerator
    pub fps_num: u16,
    /// Frame rate denominator, never zero
    pub fps_den: u16,
    /// Total frame count; zero while unknown, patched on finalize
    pub total_frames: u32,
    /// Audio channel count, zero when the stream has no audio
    pub audio_channels: u8,
    /// Audio sample rate in Hz (24 bits on the wire)
    pub audio_rate_hz: u32,
    /// Pixel colorspace of the frame chunks
    pub colorspace: Colorspace,
}

impl FileHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 24;

    /// Byte offset of the `total_frames` field, patched on finalize
    pub const TOTAL_FRAMES_OFFSET: usize = 14;

    /// Size of one chunk header under this container version
    pub fn chunk_header_size(&self) -> usize {
        if self.version == VERSION_1 {
            8
        } else {
            10
        }
    }

    /// True when frame bodies are plane-coded YUV
    pub fn yuv_mode(&self) -> bool {
        self.colorspace.is_yuv()
    }

    /// True when the stream carries meaningful alpha
    pub fn has_alpha(&self) -> bool {
        self.flags & header_flags::HAS_ALPHA != 0 || self.colorspace.has_alpha_plane()
    }

    /// True when the encoder promised a trailing keyframe index
    pub fn has_index(&self) -> bool {
        self.flags & header_flags::HAS_INDEX != 0
    }

    /// Frame rate as a float
    pub fn fps(&self) -> f64 {
        f64::from(self.fps_num) / f64::from(self.fps_den)
    }

    /// Parses a file header from the first [`Self::SIZE`] bytes of `data`
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::TruncatedInput(format!(
                "file header needs {} bytes, got {}",
                Self::SIZE,
                data.len()
            )));
        }
        if data[0..4] != MAGIC {
            return Err(Error::InvalidHeader("magic bytes are not 'qovf'".into()));
        }

        let version = data[4];
        if version != VERSION_1 && version != VERSION_2 {
            return Err(Error::InvalidHeader(format!(
                "unknown container version {version}"
            )));
        }

        let flags = data[5];
        let width = BigEndian::read_u16(&data[6..8]);
        let height = BigEndian::read_u16(&data[8..10]);
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument(format!(
                "resolution {width}x{height} is not representable"
            )));
        }

        let fps_num = BigEndian::read_u16(&data[10..12]);
        let fps_den = BigEndian::read_u16(&data[12..14]);
        if fps_den == 0 {
            return Err(Error::InvalidArgument(
                "frame rate denominator is zero".into(),
            ));
        }

        let total_frames = BigEndian::read_u32(&data[14..18]);
        let audio_channels = data[18];
        let audio_rate_hz = BigEndian::read_u24(&data[19..22]);
        let colorspace = Colorspace::from_u8(data[22]).ok_or_else(|| {
            Error::InvalidArgument(format!("unknown colorspace 0x{:02X}", data[22]))
        })?;

        Ok(Self {
            version,
            flags,
            width,
            height,
            fps_num,
            fps_den,
            total_frames,
            audio_channels,
            audio_rate_hz,
            colorspace,
        })
    }

    /// Writes the 24-byte header
    pub fn write_to(&self, out: &mut ByteWriter) -> Result<()> {
        out.write_bytes(&MAGIC)?;
        out.write_u8(self.version)?;
        out.write_u8(self.flags)?;
        out.write_u16(self.width)?;
        out.write_u16(self.height)?;
        out.write_u16(self.fps_num)?;
        out.write_u16(self.fps_den)?;
        out.write_u32(self.total_frames)?;
        out.write_u8(self.audio_channels)?;
        out.write_u24(self.audio_rate_hz)?;
        out.write_u8(self.colorspace as u8)?;
        out.write_u8(0)?;
        Ok(())
    }
}

/// Header of a single chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Chunk type byte, see [`chunk_type`]
    pub chunk_type: u8,
    /// Chunk flag bits, see [`chunk_flags`]
    pub flags: u8,
    /// Payload size in bytes, excluding this header
    pub size: u32,
    /// Presentation timestamp in microseconds; zero for INDEX and END
    pub timestamp: u32,
}

impl ChunkHeader {
    /// True for chunk types that carry coded video frames
    pub fn is_frame(&self) -> bool {
        matches!(
            self.chunk_type,
            chunk_type::KEYFRAME | chunk_type::PFRAME | chunk_type::BFRAME
        )
    }

    /// True when the payload is LZ4-wrapped
    pub fn is_compressed(&self) -> bool {
        self.flags & chunk_flags::COMPRESSED != 0
    }

    /// True when a frame body is plane-coded YUV
    pub fn is_yuv(&self) -> bool {
        self.flags & chunk_flags::YUV != 0
    }

    /// Parses a chunk header for the given container version
    pub fn parse(data: &[u8], version: u8) -> Result<Self> {
        let needed = if version == VERSION_1 { 8 } else { 10 };
        if data.len() < needed {
            return Err(Error::TruncatedInput(format!(
                "chunk header needs {needed} bytes, got {}",
                data.len()
            )));
        }

        let chunk_type = data[0];
        let flags = data[1];
        let (size, timestamp) = if version == VERSION_1 {
            (
                u32::from(BigEndian::read_u16(&data[2..4])),
                BigEndian::read_u32(&data[4..8]),
            )
        } else {
            (
                BigEndian::read_u32(&data[2..6]),
                BigEndian::read_u32(&data[6..10]),
            )
        };

        Ok(Self {
            chunk_type,
            flags,
            size,
            timestamp,
        })
    }

    /// Writes the chunk header for the given container version
    pub fn write_to(&self, out: &mut ByteWriter, version: u8) -> Result<()> {
        out.write_u8(self.chunk_type)?;
        out.write_u8(self.flags)?;
        if version == VERSION_1 {
            let size = u16::try_from(self.size).map_err(|_| {
                Error::InvalidArgument(format!(
                    "chunk of {} bytes does not fit a version-1 container",
                    self.size
                ))
            })?;
            out.write_u16(size)?;
        } else {
            out.write_u32(self.size)?;
        }
        out.write_u32(self.timestamp)?;
        Ok(())
    }
}

/// One keyframe index entry: where a keyframe's SYNC chunk starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct IndexEntry {
    /// Frame number of the keyframe
    pub frame_number: u32,
    /// Byte offset of the SYNC chunk preceding the keyframe
    pub offset: u64,
    /// Presentation timestamp of the keyframe in microseconds
    pub timestamp: u32,
}

impl IndexEntry {
    /// Serialized size of one entry
    pub const SIZE: usize = 16;
}

/// Writes an INDEX chunk body: entry count followed by the entries
pub fn write_index_body(out: &mut ByteWriter, entries: &[IndexEntry]) -> Result<()> {
    out.write_u32(entries.len() as u32)?;
    for entry in entries {
        out.write_u32(entry.frame_number)?;
        out.write_u64(entry.offset)?;
        out.write_u32(entry.timestamp)?;
    }
    Ok(())
}

/// Parses an INDEX chunk body
pub fn parse_index_body(data: &[u8]) -> Result<Vec<IndexEntry>> {
    if data.len() < 4 {
        return Err(Error::TruncatedInput("index body needs 4 count bytes".into()));
    }
    let count = BigEndian::read_u32(&data[0..4]) as usize;
    if data.len() < 4 + count * IndexEntry::SIZE {
        return Err(Error::CorruptedStream(format!(
            "index body promises {count} entries but holds {} bytes",
            data.len()
        )));
    }

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let base = 4 + i * IndexEntry::SIZE;
        entries.push(IndexEntry {
            frame_number: BigEndian::read_u32(&data[base..base + 4]),
            offset: BigEndian::read_u64(&data[base + 4..base + 12]),
            timestamp: BigEndian::read_u32(&data[base + 12..base + 16]),
        });
    }
    Ok(entries)
}
