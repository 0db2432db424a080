//! QOV encoder orchestration
//!
//! [`QovEncoder`] owns the output writer and all reference state: the color
//! cache, the previous frame (RGB mode) or previous planes (YUV mode), the
//! keyframe index and the frame counter. Frames go out as chunks; when
//! compression is enabled each frame body is staged in a scratch buffer and
//! LZ4-wrapped only if that actually saves space.

use log::debug;

use qov_core::color::{self, YuvPlanes};
use qov_core::container::{
    self, chunk_flags, chunk_type, header_flags, ChunkHeader, Colorspace, FileHeader, IndexEntry,
};
use qov_core::opcodes::END_MARKER;
use qov_core::pixel::ColorCache;
use qov_core::{lz4, ByteWriter, Error, Result};

use crate::{plane, rgb};

/// Streaming QOV encoder
///
/// Frames are pushed one at a time with [`Self::encode_keyframe`] and
/// [`Self::encode_pframe`]; [`Self::finish`] closes the stream and returns
/// the bytes. Timestamps are microseconds and must be non-decreasing.
pub struct QovEncoder {
    header: FileHeader,
    writer: ByteWriter,
    cache: ColorCache,
    prev_frame: Option<Vec<u8>>,
    prev_planes: Option<YuvPlanes>,
    index: Vec<IndexEntry>,
    frame_count: u32,
    last_timestamp: u32,
    compression_enabled: bool,
    header_written: bool,
    finished: bool,
}

impl QovEncoder {
    /// Creates an encoder for the given stream parameters.
    ///
    /// `flags` are the file header flag bits; HAS_ALPHA is implied by
    /// colorspace 0x13. Fails with `InvalidArgument` on a zero dimension or
    /// a zero frame-rate denominator.
    pub fn new(
        width: u16,
        height: u16,
        fps_num: u16,
        fps_den: u16,
        flags: u8,
        colorspace: Colorspace,
        compression_enabled: bool,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument(format!(
                "resolution {width}x{height} is not representable"
            )));
        }
        if fps_den == 0 {
            return Err(Error::InvalidArgument(
                "frame rate denominator is zero".into(),
            ));
        }

        let mut flags = flags;
        if colorspace.has_alpha_plane() {
            flags |= header_flags::HAS_ALPHA;
        }

        Ok(Self {
            header: FileHeader {
                version: container::VERSION_2,
                flags,
                width,
                height,
                fps_num,
                fps_den,
                total_frames: 0,
                audio_channels: 0,
                audio_rate_hz: 0,
                colorspace,
            },
            writer: ByteWriter::new(),
            cache: ColorCache::new(),
            prev_frame: None,
            prev_planes: None,
            index: Vec::new(),
            frame_count: 0,
            last_timestamp: 0,
            compression_enabled,
            header_written: false,
            finished: false,
        })
    }

    /// The stream parameters this encoder writes
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Number of frames encoded so far
    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Emits the 24-byte file header with a placeholder frame count.
    ///
    /// Called implicitly by the first frame; calling it again is a no-op.
    pub fn write_header(&mut self) -> Result<()> {
        if self.header_written {
            return Ok(());
        }
        self.header.write_to(&mut self.writer)?;
        self.header_written = true;
        Ok(())
    }

    /// Encodes `pixels` as a keyframe, preceded by a SYNC chunk.
    pub fn encode_keyframe(&mut self, pixels: &[u8], timestamp: u32) -> Result<()> {
        self.check_frame(pixels, timestamp)?;
        self.write_header()?;

        let start = self.writer.size();
        match self.encode_keyframe_inner(pixels, timestamp, start as u64) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.writer.truncate(start);
                Err(e)
            }
        }
    }

    fn encode_keyframe_inner(
        &mut self,
        pixels: &[u8],
        timestamp: u32,
        sync_offset: u64,
    ) -> Result<()> {
        let frame_number = self.frame_count;
        self.write_sync(timestamp, frame_number)?;
        self.write_frame(pixels, timestamp, true)?;
        if self.header.has_index() {
            self.index.push(IndexEntry {
                frame_number,
                offset: sync_offset,
                timestamp,
            });
        }
        Ok(())
    }

    /// Encodes `pixels` as a P-frame against the previous frame.
    ///
    /// Before any keyframe exists this behaves as [`Self::encode_keyframe`].
    /// No SYNC chunk is emitted.
    pub fn encode_pframe(&mut self, pixels: &[u8], timestamp: u32) -> Result<()> {
        if self.frame_count == 0 {
            return self.encode_keyframe(pixels, timestamp);
        }
        self.check_frame(pixels, timestamp)?;

        let start = self.writer.size();
        match self.write_frame(pixels, timestamp, false) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.writer.truncate(start);
                Err(e)
            }
        }
    }

    /// Writes the keyframe index and END chunk, patches the total frame
    /// count and returns the finished stream.
    ///
    /// A second call returns the same bytes; encoding further frames after
    /// finishing fails with `InvalidArgument`.
    pub fn finish(&mut self) -> Result<Vec<u8>> {
        if self.finished {
            return Ok(self.writer.as_slice().to_vec());
        }
        self.write_header()?;

        let start = self.writer.size();
        match self.finish_inner() {
            Ok(()) => {}
            Err(e) => {
                self.writer.truncate(start);
                return Err(e);
            }
        }
        self.finished = true;
        debug!(
            "finished stream: {} frames, {} keyframes, {} bytes",
            self.frame_count,
            self.index.len(),
            self.writer.size()
        );
        Ok(self.writer.as_slice().to_vec())
    }

    fn finish_inner(&mut self) -> Result<()> {
        if self.header.has_index() && !self.index.is_empty() {
            let header = ChunkHeader {
                chunk_type: chunk_type::INDEX,
                flags: 0,
                size: (4 + self.index.len() * IndexEntry::SIZE) as u32,
                timestamp: 0,
            };
            header.write_to(&mut self.writer, self.header.version)?;
            container::write_index_body(&mut self.writer, &self.index)?;
        }

        let end = ChunkHeader {
            chunk_type: chunk_type::END,
            flags: 0,
            size: 0,
            timestamp: 0,
        };
        end.write_to(&mut self.writer, self.header.version)?;
        self.writer.write_bytes(&END_MARKER)?;

        self.writer
            .patch_u32(FileHeader::TOTAL_FRAMES_OFFSET, self.frame_count)
    }

    fn check_frame(&self, pixels: &[u8], timestamp: u32) -> Result<()> {
        if self.finished {
            return Err(Error::InvalidArgument(
                "encoder is finished, no frames may follow".into(),
            ));
        }
        let expected = self.header.width as usize * self.header.height as usize * 4;
        if pixels.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "frame holds {} bytes, {}x{} RGBA needs {expected}",
                pixels.len(),
                self.header.width,
                self.header.height
            )));
        }
        if self.frame_count > 0 && timestamp < self.last_timestamp {
            return Err(Error::InvalidArgument(format!(
                "timestamp {timestamp} precedes {}",
                self.last_timestamp
            )));
        }
        Ok(())
    }

    fn write_sync(&mut self, timestamp: u32, frame_number: u32) -> Result<()> {
        let header = ChunkHeader {
            chunk_type: chunk_type::SYNC,
            flags: 0,
            size: 8,
            timestamp,
        };
        header.write_to(&mut self.writer, self.header.version)?;
        self.writer.write_bytes(&container::SYNC_MAGIC)?;
        self.writer.write_u32(frame_number)
    }

    /// Writes one frame chunk and rolls the reference state forward.
    fn write_frame(&mut self, pixels: &[u8], timestamp: u32, keyframe: bool) -> Result<()> {
        let chunk = if keyframe {
            chunk_type::KEYFRAME
        } else {
            chunk_type::PFRAME
        };
        let yuv = self.header.yuv_mode();
        let flags = if yuv { chunk_flags::YUV } else { 0 };

        let planes = yuv.then(|| {
            color::rgba_to_planes(
                pixels,
                self.header.width as usize,
                self.header.height as usize,
                self.header.colorspace,
            )
        });

        if self.compression_enabled {
            self.write_frame_staged(chunk, flags, timestamp, pixels, planes.as_ref(), keyframe)?;
        } else {
            self.write_frame_direct(chunk, flags, timestamp, pixels, planes.as_ref(), keyframe)?;
        }

        match planes {
            Some(planes) => self.prev_planes = Some(planes),
            None => match self.prev_frame.as_mut() {
                Some(buf) => buf.copy_from_slice(pixels),
                None => self.prev_frame = Some(pixels.to_vec()),
            },
        }
        self.frame_count += 1;
        self.last_timestamp = timestamp;
        Ok(())
    }

    /// Uncompressed path: the chunk header goes out first with a zero size,
    /// the body is encoded straight into the output, and the size is patched
    /// in afterwards.
    fn write_frame_direct(
        &mut self,
        chunk: u8,
        flags: u8,
        timestamp: u32,
        pixels: &[u8],
        planes: Option<&YuvPlanes>,
        keyframe: bool,
    ) -> Result<()> {
        let header_pos = self.writer.size();
        let header = ChunkHeader {
            chunk_type: chunk,
            flags,
            size: 0,
            timestamp,
        };
        header.write_to(&mut self.writer, self.header.version)?;
        let body_start = self.writer.size();

        let mut writer = std::mem::take(&mut self.writer);
        let result = self.emit_body(&mut writer, pixels, planes, keyframe);
        self.writer = writer;
        result?;

        let size = (self.writer.size() - body_start) as u32;
        // The size field sits two bytes into the chunk header.
        self.writer.patch_u32(header_pos + 2, size)
    }

    /// Compressed path: the body is staged in a scratch buffer, and the LZ4
    /// form is used only when it beats 95% of the original size.
    fn write_frame_staged(
        &mut self,
        chunk: u8,
        mut flags: u8,
        timestamp: u32,
        pixels: &[u8],
        planes: Option<&YuvPlanes>,
        keyframe: bool,
    ) -> Result<()> {
        let mut scratch = ByteWriter::new();
        self.emit_body(&mut scratch, pixels, planes, keyframe)?;
        let payload = scratch.as_slice();

        match lz4::compress(payload) {
            Some(compressed) => {
                flags |= chunk_flags::COMPRESSED;
                let header = ChunkHeader {
                    chunk_type: chunk,
                    flags,
                    size: (4 + compressed.len()) as u32,
                    timestamp,
                };
                header.write_to(&mut self.writer, self.header.version)?;
                self.writer.write_u32(payload.len() as u32)?;
                self.writer.write_bytes(&compressed)?;
                debug!(
                    "frame {}: {} -> {} bytes after lz4",
                    self.frame_count,
                    payload.len(),
                    compressed.len()
                );
            }
            None => {
                let header = ChunkHeader {
                    chunk_type: chunk,
                    flags,
                    size: payload.len() as u32,
                    timestamp,
                };
                header.write_to(&mut self.writer, self.header.version)?;
                self.writer.write_bytes(payload)?;
            }
        }
        Ok(())
    }

    /// Encodes the opcode body of one frame into `out`.
    fn emit_body(
        &mut self,
        out: &mut ByteWriter,
        pixels: &[u8],
        planes: Option<&YuvPlanes>,
        keyframe: bool,
    ) -> Result<()> {
        match planes {
            Some(planes) => {
                if keyframe {
                    plane::encode_plane_keyframe(out, &planes.y)?;
                    plane::encode_plane_keyframe(out, &planes.u)?;
                    plane::encode_plane_keyframe(out, &planes.v)?;
                    if let Some(alpha) = &planes.alpha {
                        plane::encode_plane_keyframe(out, alpha)?;
                    }
                } else {
                    let Some(prev) = self.prev_planes.as_ref() else {
                        return Err(Error::InvalidArgument(
                            "P-frame without a reference frame".into(),
                        ));
                    };
                    plane::encode_plane_pframe(out, &planes.y, &prev.y)?;
                    plane::encode_plane_pframe(out, &planes.u, &prev.u)?;
                    plane::encode_plane_pframe(out, &planes.v, &prev.v)?;
                    if let Some((alpha, prev_alpha)) =
                        planes.alpha.as_ref().zip(prev.alpha.as_ref())
                    {
                        plane::encode_plane_pframe(out, alpha, prev_alpha)?;
                    }
                }
                out.write_bytes(&END_MARKER)
            }
            None => {
                if keyframe {
                    rgb::encode_keyframe(out, pixels, &mut self.cache)
                } else {
                    let Some(prev) = self.prev_frame.as_ref() else {
                        return Err(Error::InvalidArgument(
                            "P-frame without a reference frame".into(),
                        ));
                    };
                    rgb::encode_pframe(out, pixels, prev, &mut self.cache)
                }
            }
        }
    }
}
