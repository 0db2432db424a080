//! Streaming QOV decoder orchestration
//!
//! [`QovDecoder`] wraps a [`DataSource`] and decodes lazily: the header is
//! parsed on demand, the chunk index grows by linear scan and survives
//! `NotYetAvailable` interruptions, and random frame access replays from the
//! nearest preceding keyframe so that decoder state always equals what a
//! linear decode from frame 0 would have produced.

use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};

use qov_core::color::{self, YuvPlanes};
use qov_core::container::{self, chunk_flags, chunk_type, ChunkHeader, FileHeader, IndexEntry};
use qov_core::opcodes::END_MARKER;
use qov_core::pixel::ColorCache;
use qov_core::{lz4, Error, Frame, Result};

use crate::source::DataSource;
use crate::{plane, rgb};

/// Everything the index records about one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ChunkDescriptor {
    /// Byte offset of the chunk header in the stream
    pub offset: u64,
    /// Chunk type byte
    pub chunk_type: u8,
    /// Chunk flag bits
    pub flags: u8,
    /// Payload size, excluding the chunk header
    pub size: u32,
    /// Presentation timestamp in microseconds
    pub timestamp: u32,
    /// Position in the frame sequence, for frame chunks only
    pub frame_index: Option<u32>,
}

/// Summary of a parsed stream
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FileStats {
    /// The stream's file header
    pub header: FileHeader,
    /// Every chunk seen by the index scan, in stream order
    pub chunks: Vec<ChunkDescriptor>,
    /// Frame indices of all keyframes
    pub keyframe_indices: Vec<u32>,
    /// Entries of the trailing INDEX chunk, when one was present
    pub index_entries: Vec<IndexEntry>,
    /// Timestamp of the last frame chunk, in microseconds
    pub total_duration: u32,
}

/// Streaming QOV decoder over a [`DataSource`]
///
/// Re-entry cannot happen: every decoding operation takes `&mut self`, so
/// callers are serialized by construction.
pub struct QovDecoder<S: DataSource> {
    source: S,
    header: Option<FileHeader>,
    chunks: Vec<ChunkDescriptor>,
    frame_chunks: Vec<usize>,
    keyframe_indices: Vec<u32>,
    index_entries: Vec<IndexEntry>,
    index_complete: bool,
    scan_offset: u64,
    cache: ColorCache,
    prev_frame: Vec<u8>,
    work_frame: Vec<u8>,
    prev_planes: Option<YuvPlanes>,
    work_planes: Option<YuvPlanes>,
    last_decoded: Option<u32>,
}

impl<S: DataSource> QovDecoder<S> {
    /// Wraps a data source; nothing is read until the first operation.
    pub fn new(source: S) -> Self {
        Self {
            source,
            header: None,
            chunks: Vec::new(),
            frame_chunks: Vec::new(),
            keyframe_indices: Vec::new(),
            index_entries: Vec::new(),
            index_complete: false,
            scan_offset: 0,
            cache: ColorCache::new(),
            prev_frame: Vec::new(),
            work_frame: Vec::new(),
            prev_planes: None,
            work_planes: None,
            last_decoded: None,
        }
    }

    /// Reads and validates the 24-byte file header, allocating the frame and
    /// plane buffers. Idempotent; fails with `NotYetAvailable` until the
    /// source holds enough bytes.
    pub fn parse_header(&mut self) -> Result<FileHeader> {
        if let Some(header) = &self.header {
            return Ok(header.clone());
        }

        let bytes = self.source.read(0, FileHeader::SIZE)?;
        let header = FileHeader::from_bytes(&bytes)?;

        let width = header.width as usize;
        let height = header.height as usize;
        self.prev_frame = blank_frame(width, height);
        self.work_frame = blank_frame(width, height);
        if header.yuv_mode() {
            self.prev_planes = Some(YuvPlanes::new(header.colorspace, width, height));
            self.work_planes = Some(YuvPlanes::new(header.colorspace, width, height));
        }
        self.scan_offset = FileHeader::SIZE as u64;

        debug!(
            "parsed header: {}x{} @ {}/{} fps, colorspace {}",
            header.width, header.height, header.fps_num, header.fps_den, header.colorspace
        );
        self.header = Some(header.clone());
        Ok(header)
    }

    /// Walks chunk headers from where the last scan stopped until the END
    /// chunk or the end of the source.
    ///
    /// `NotYetAvailable` aborts the walk without losing progress; calling
    /// again resumes it. A stream that ends without an END chunk is reported
    /// with a warning and indexed as far as it goes.
    pub fn build_index(&mut self) -> Result<()> {
        if self.index_complete {
            return Ok(());
        }
        let header = self.parse_header()?;
        let header_size = header.chunk_header_size() as u64;

        loop {
            let offset = self.scan_offset;
            if let Some(total) = self.source.total_size() {
                if offset >= total {
                    warn!("stream ended without an END chunk, {} chunks indexed", self.chunks.len());
                    self.index_complete = true;
                    break;
                }
            }

            let head = match self.source.read(offset, header_size as usize) {
                Ok(bytes) => bytes,
                Err(Error::TruncatedInput(_)) => {
                    warn!("chunk header at offset {offset} is cut short; treating stream as truncated");
                    self.index_complete = true;
                    break;
                }
                Err(e) => return Err(e),
            };
            let chunk = ChunkHeader::parse(&head, header.version)?;

            let mut frame_index = None;
            if chunk.is_frame() {
                let index = self.frame_chunks.len() as u32;
                frame_index = Some(index);
                if chunk.chunk_type == chunk_type::KEYFRAME {
                    self.keyframe_indices.push(index);
                }
            } else if chunk.chunk_type == chunk_type::INDEX {
                let body = match self.source.read(offset + header_size, chunk.size as usize) {
                    Ok(bytes) => bytes,
                    Err(Error::TruncatedInput(_)) => {
                        warn!("INDEX chunk at offset {offset} is cut short; ignoring it");
                        self.index_complete = true;
                        break;
                    }
                    Err(e) => return Err(e),
                };
                self.index_entries = container::parse_index_body(&body)?;
            }

            if frame_index.is_some() {
                self.frame_chunks.push(self.chunks.len());
            }
            self.chunks.push(ChunkDescriptor {
                offset,
                chunk_type: chunk.chunk_type,
                flags: chunk.flags,
                size: chunk.size,
                timestamp: chunk.timestamp,
                frame_index,
            });
            self.scan_offset = offset + header_size + chunk.size as u64;

            if chunk.chunk_type == chunk_type::END {
                self.index_complete = true;
                debug!(
                    "index complete: {} chunks, {} frames, {} keyframes",
                    self.chunks.len(),
                    self.frame_chunks.len(),
                    self.keyframe_indices.len()
                );
                break;
            }
        }
        Ok(())
    }

    /// Number of frame chunks indexed so far
    pub fn frame_count(&self) -> u32 {
        self.frame_chunks.len() as u32
    }

    /// Frame indices of all indexed keyframes
    pub fn keyframe_indices(&self) -> &[u32] {
        &self.keyframe_indices
    }

    /// Every chunk descriptor indexed so far, in stream order
    pub fn chunks(&self) -> &[ChunkDescriptor] {
        &self.chunks
    }

    /// True once the index scan has reached the END chunk or the stream end
    pub fn index_complete(&self) -> bool {
        self.index_complete
    }

    /// Header, chunk list, keyframe index and total duration of the stream
    pub fn file_stats(&self) -> Result<FileStats> {
        let header = self.require_header()?.clone();
        let total_duration = self
            .frame_chunks
            .last()
            .map(|&chunk| self.chunks[chunk].timestamp)
            .unwrap_or(0);

        Ok(FileStats {
            header,
            chunks: self.chunks.clone(),
            keyframe_indices: self.keyframe_indices.clone(),
            index_entries: self.index_entries.clone(),
            total_duration,
        })
    }

    /// Decodes frame `index` and returns a snapshot of it.
    ///
    /// Sequential access decodes just the next chunk; anything else resets
    /// decoder state and replays from the nearest preceding keyframe, so the
    /// result is identical to a linear decode from frame 0. Returns `None`
    /// when the index lies past the end of a fully indexed stream.
    pub fn decode_frame(&mut self, index: u32) -> Result<Option<Frame>> {
        if (index as usize) >= self.frame_chunks.len() && !self.index_complete {
            match self.build_index() {
                Ok(()) => {}
                Err(Error::NotYetAvailable) if (index as usize) < self.frame_chunks.len() => {}
                Err(e) => return Err(e),
            }
        }
        if (index as usize) >= self.frame_chunks.len() {
            return Ok(None);
        }

        let next_sequential = self.last_decoded.map_or(0, |last| last + 1);
        let start = if index == next_sequential {
            index
        } else {
            let keyframe = self
                .keyframe_indices
                .iter()
                .copied()
                .filter(|&k| k <= index)
                .max()
                .unwrap_or(0);
            debug!("seeking to frame {index}: replaying from keyframe {keyframe}");
            self.reset_state();
            keyframe
        };

        for frame in start..=index {
            self.decode_one(frame)?;
        }
        Ok(Some(self.snapshot(index)?))
    }

    fn require_header(&self) -> Result<&FileHeader> {
        self.header
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("file header has not been parsed yet".into()))
    }

    /// Drops all decode state back to the post-header baseline.
    fn reset_state(&mut self) {
        self.cache.reset();
        fill_blank(&mut self.prev_frame);
        fill_blank(&mut self.work_frame);
        for planes in [self.prev_planes.as_mut(), self.work_planes.as_mut()]
            .into_iter()
            .flatten()
        {
            planes.y.fill(0);
            planes.u.fill(0);
            planes.v.fill(0);
            if let Some(alpha) = planes.alpha.as_mut() {
                alpha.fill(0);
            }
        }
        self.last_decoded = None;
    }

    /// Decodes one frame chunk into the working buffers and swaps them.
    fn decode_one(&mut self, index: u32) -> Result<()> {
        let header = self.require_header()?;
        let header_size = header.chunk_header_size() as u64;
        let desc = self.chunks[self.frame_chunks[index as usize]];

        let payload = self.source.read(desc.offset + header_size, desc.size as usize)?;
        let payload = if desc.flags & chunk_flags::COMPRESSED != 0 {
            if payload.len() < 4 {
                return Err(Error::CorruptedStream(
                    "compressed chunk is shorter than its size prefix".into(),
                ));
            }
            let uncompressed = BigEndian::read_u32(&payload[0..4]) as usize;
            lz4::decompress(&payload[4..], uncompressed)?
        } else {
            payload
        };

        let keyframe = match desc.chunk_type {
            chunk_type::KEYFRAME => true,
            chunk_type::PFRAME => false,
            other => {
                return Err(Error::CorruptedStream(format!(
                    "cannot decode chunk type 0x{other:02X} as video"
                )));
            }
        };

        if desc.flags & chunk_flags::YUV != 0 {
            self.decode_yuv_frame(&payload, keyframe)?;
        } else {
            self.decode_rgb_frame(&payload, keyframe)?;
        }
        self.last_decoded = Some(index);
        Ok(())
    }

    fn decode_rgb_frame(&mut self, payload: &[u8], keyframe: bool) -> Result<()> {
        if keyframe {
            rgb::decode_keyframe(payload, &mut self.work_frame, &mut self.cache)?;
        } else {
            self.work_frame.copy_from_slice(&self.prev_frame);
            rgb::decode_pframe(payload, &mut self.work_frame, &mut self.cache)?;
        }
        std::mem::swap(&mut self.work_frame, &mut self.prev_frame);
        Ok(())
    }

    fn decode_yuv_frame(&mut self, payload: &[u8], keyframe: bool) -> Result<()> {
        let header = self.require_header()?;
        let (width, height) = (header.width as usize, header.height as usize);
        let colorspace = header.colorspace;

        let Some(work) = self.work_planes.as_mut() else {
            return Err(Error::CorruptedStream(
                "YUV frame chunk in a non-YUV stream".into(),
            ));
        };

        let mut offset = 0;
        if keyframe {
            offset += plane::decode_plane_keyframe(&payload[offset..], &mut work.y)?;
            offset += plane::decode_plane_keyframe(&payload[offset..], &mut work.u)?;
            offset += plane::decode_plane_keyframe(&payload[offset..], &mut work.v)?;
            if let Some(alpha) = work.alpha.as_mut() {
                offset += plane::decode_plane_keyframe(&payload[offset..], alpha)?;
            }
        } else {
            let Some(prev) = self.prev_planes.as_ref() else {
                return Err(Error::CorruptedStream(
                    "YUV frame chunk in a non-YUV stream".into(),
                ));
            };
            work.y.copy_from_slice(&prev.y);
            offset += plane::decode_plane_pframe(&payload[offset..], &mut work.y)?;
            work.u.copy_from_slice(&prev.u);
            offset += plane::decode_plane_pframe(&payload[offset..], &mut work.u)?;
            work.v.copy_from_slice(&prev.v);
            offset += plane::decode_plane_pframe(&payload[offset..], &mut work.v)?;
            if let Some((alpha, prev_alpha)) = work.alpha.as_mut().zip(prev.alpha.as_ref()) {
                alpha.copy_from_slice(prev_alpha);
                offset += plane::decode_plane_pframe(&payload[offset..], alpha)?;
            }
        }

        // One end marker closes the whole frame, after the last plane.
        if payload.len() != offset + END_MARKER.len() || payload[offset..] != END_MARKER {
            return Err(Error::CorruptedStream(
                "frame body does not end at its end marker".into(),
            ));
        }

        color::planes_to_rgba(work, width, height, colorspace, &mut self.work_frame);
        std::mem::swap(&mut self.work_planes, &mut self.prev_planes);
        std::mem::swap(&mut self.work_frame, &mut self.prev_frame);
        Ok(())
    }

    /// Copies the last decoded frame out with its stream metadata.
    fn snapshot(&self, index: u32) -> Result<Frame> {
        let header = self.require_header()?;
        let desc = &self.chunks[self.frame_chunks[index as usize]];
        Ok(Frame {
            pixels: self.prev_frame.clone(),
            width: header.width,
            height: header.height,
            timestamp: desc.timestamp,
            keyframe: desc.chunk_type == chunk_type::KEYFRAME,
            frame_number: index,
        })
    }
}

/// A zeroed RGBA buffer with alpha pre-filled to 255
fn blank_frame(width: usize, height: usize) -> Vec<u8> {
    let mut buf = vec![0u8; width * height * 4];
    fill_blank(&mut buf);
    buf
}

fn fill_blank(buf: &mut [u8]) {
    buf.fill(0);
    for alpha in buf.iter_mut().skip(3).step_by(4) {
        *alpha = 255;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use qov_core::container::{header_flags, Colorspace, VERSION_1};
    use qov_core::ByteWriter;
    use qov_encoder::QovEncoder;

    use super::*;
    use crate::source::MemorySource;

    /// Deterministic frames drawn from a small palette, so runs, diffs and
    /// cache hits all occur.
    fn palette_frame(width: usize, height: usize, seed: u32) -> Vec<u8> {
        const PALETTE: [[u8; 4]; 6] = [
            [0, 0, 0, 255],
            [200, 30, 40, 255],
            [201, 31, 41, 255],
            [10, 240, 128, 255],
            [10, 240, 128, 64],
            [255, 255, 255, 255],
        ];
        let mut state = seed;
        let mut out = Vec::with_capacity(width * height * 4);
        for _ in 0..width * height {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            // Skew towards the first palette entries to produce runs.
            let roll = (state >> 24) as usize;
            let color = if roll < 128 { 0 } else { roll % PALETTE.len() };
            out.extend_from_slice(&PALETTE[color]);
        }
        out
    }

    fn solid_frame(width: usize, height: usize, rgba: [u8; 4]) -> Vec<u8> {
        rgba.iter()
            .copied()
            .cycle()
            .take(width * height * 4)
            .collect()
    }

    /// Encodes `frames` with a keyframe every `keyframe_interval` frames.
    fn encode_sequence(
        frames: &[Vec<u8>],
        width: u16,
        height: u16,
        keyframe_interval: usize,
        flags: u8,
        colorspace: Colorspace,
        compression: bool,
    ) -> Vec<u8> {
        let mut encoder =
            QovEncoder::new(width, height, 30, 1, flags, colorspace, compression).unwrap();
        for (i, frame) in frames.iter().enumerate() {
            let timestamp = i as u32 * 33_333;
            if i % keyframe_interval == 0 {
                encoder.encode_keyframe(frame, timestamp).unwrap();
            } else {
                encoder.encode_pframe(frame, timestamp).unwrap();
            }
        }
        encoder.finish().unwrap()
    }

    fn decoder_for(bytes: Vec<u8>) -> QovDecoder<MemorySource> {
        let mut decoder = QovDecoder::new(MemorySource::new(bytes));
        decoder.parse_header().unwrap();
        decoder.build_index().unwrap();
        decoder
    }

    #[test]
    fn test_rgb_roundtrip_sequential() {
        let frames: Vec<_> = (0..6).map(|i| palette_frame(8, 8, i * 77 + 1)).collect();
        let bytes = encode_sequence(&frames, 8, 8, 3, 0, Colorspace::Srgba, false);

        let mut decoder = decoder_for(bytes);
        assert_eq!(decoder.frame_count(), 6);
        assert_eq!(decoder.keyframe_indices(), &[0, 3]);

        for (i, expected) in frames.iter().enumerate() {
            let frame = decoder.decode_frame(i as u32).unwrap().unwrap();
            assert_eq!(&frame.pixels, expected, "frame {i} mismatch");
            assert_eq!(frame.frame_number, i as u32);
            assert_eq!(frame.timestamp, i as u32 * 33_333);
            assert_eq!(frame.keyframe, i % 3 == 0);
        }
    }

    #[test]
    fn test_rgb_roundtrip_with_compression() {
        let frames: Vec<_> = (0..4).map(|i| palette_frame(16, 16, i + 5)).collect();
        let bytes = encode_sequence(&frames, 16, 16, 2, 0, Colorspace::Srgba, true);

        let mut decoder = decoder_for(bytes);
        for (i, expected) in frames.iter().enumerate() {
            let frame = decoder.decode_frame(i as u32).unwrap().unwrap();
            assert_eq!(&frame.pixels, expected, "frame {i} mismatch");
        }
    }

    #[test]
    fn test_yuv_roundtrip_matches_conversion() {
        for colorspace in [
            Colorspace::Yuv420,
            Colorspace::Yuv422,
            Colorspace::Yuv444,
            Colorspace::Yuv444Alpha,
        ] {
            let frames: Vec<_> = (0..4).map(|i| palette_frame(6, 5, i * 13 + 3)).collect();
            let bytes = encode_sequence(&frames, 6, 5, 2, 0, colorspace, false);

            let mut decoder = decoder_for(bytes);
            for (i, source) in frames.iter().enumerate() {
                // The opcode layer is lossless; only the colorspace
                // conversion may change pixels.
                let planes = color::rgba_to_planes(source, 6, 5, colorspace);
                let mut expected = vec![0u8; source.len()];
                color::planes_to_rgba(&planes, 6, 5, colorspace, &mut expected);

                let frame = decoder.decode_frame(i as u32).unwrap().unwrap();
                assert_eq!(
                    frame.pixels, expected,
                    "frame {i} mismatch in {colorspace}"
                );
            }
        }
    }

    #[test]
    fn test_seek_matches_linear_decode() {
        let frames: Vec<_> = (0..9).map(|i| palette_frame(8, 8, i * 31 + 2)).collect();
        let bytes = encode_sequence(&frames, 8, 8, 3, 0, Colorspace::Srgba, false);

        let mut linear = decoder_for(bytes.clone());
        let mut expected = Vec::new();
        for i in 0..9 {
            expected.push(linear.decode_frame(i).unwrap().unwrap().pixels);
        }

        // Cold seek straight to a P-frame.
        let mut decoder = decoder_for(bytes);
        assert_eq!(decoder.decode_frame(7).unwrap().unwrap().pixels, expected[7]);

        // Backward seek crosses a keyframe boundary.
        assert_eq!(decoder.decode_frame(2).unwrap().unwrap().pixels, expected[2]);

        // Forward seek within the current group.
        assert_eq!(decoder.decode_frame(8).unwrap().unwrap().pixels, expected[8]);

        // Re-decoding the same frame replays and agrees with itself.
        assert_eq!(decoder.decode_frame(8).unwrap().unwrap().pixels, expected[8]);
    }

    #[test]
    fn test_pframe_of_identical_frame_is_one_skip() {
        let frame = solid_frame(4, 4, [12, 34, 56, 255]);
        let bytes = encode_sequence(
            &[frame.clone(), frame],
            4,
            4,
            2000,
            0,
            Colorspace::Srgb,
            false,
        );

        let decoder = decoder_for(bytes.clone());
        let pframe = decoder
            .chunks()
            .iter()
            .find(|c| c.chunk_type == chunk_type::PFRAME)
            .copied()
            .unwrap();

        let body_start = pframe.offset as usize + 10;
        let payload = &bytes[body_start..body_start + pframe.size as usize];

        // SKIP of 16 pixels, then the end marker.
        let mut expected = vec![0xCFu8];
        expected.extend_from_slice(&END_MARKER);
        assert_eq!(payload, expected.as_slice());
    }

    #[test]
    fn test_index_entries_point_at_sync_chunks() {
        let frames: Vec<_> = (0..9).map(|i| palette_frame(4, 4, i + 40)).collect();
        let bytes = encode_sequence(
            &frames,
            4,
            4,
            3,
            header_flags::HAS_INDEX,
            Colorspace::Srgb,
            false,
        );

        let decoder = decoder_for(bytes.clone());
        let stats = decoder.file_stats().unwrap();

        assert_eq!(stats.keyframe_indices, vec![0, 3, 6]);
        assert_eq!(stats.index_entries.len(), 3);
        assert_eq!(stats.total_duration, 8 * 33_333);

        for (entry, &frame_index) in stats.index_entries.iter().zip(&[0u32, 3, 6]) {
            assert_eq!(entry.frame_number, frame_index);
            // The recorded offset is where the keyframe's SYNC chunk starts.
            let sync = decoder
                .chunks()
                .iter()
                .find(|c| c.offset == entry.offset)
                .unwrap();
            assert_eq!(sync.chunk_type, chunk_type::SYNC);
        }

        // The INDEX chunk sits immediately before END.
        let types: Vec<u8> = decoder.chunks().iter().map(|c| c.chunk_type).collect();
        assert_eq!(types[types.len() - 2], chunk_type::INDEX);
        assert_eq!(types[types.len() - 1], chunk_type::END);
    }

    #[test]
    fn test_yuv420_plane_streams_are_sequential() {
        let frame = palette_frame(4, 4, 99);
        let bytes = encode_sequence(&[frame], 4, 4, 1, 0, Colorspace::Yuv420, false);

        let decoder = decoder_for(bytes.clone());
        let keyframe = decoder
            .chunks()
            .iter()
            .find(|c| c.chunk_type == chunk_type::KEYFRAME)
            .copied()
            .unwrap();
        assert_ne!(keyframe.flags & chunk_flags::YUV, 0);

        let body_start = keyframe.offset as usize + 10;
        let payload = &bytes[body_start..body_start + keyframe.size as usize];

        // Y (16 samples), U (4), V (4), then the single end marker.
        let mut y = vec![0u8; 16];
        let mut u = vec![0u8; 4];
        let mut v = vec![0u8; 4];
        let mut offset = plane::decode_plane_keyframe(payload, &mut y).unwrap();
        offset += plane::decode_plane_keyframe(&payload[offset..], &mut u).unwrap();
        offset += plane::decode_plane_keyframe(&payload[offset..], &mut v).unwrap();
        assert_eq!(&payload[offset..], &END_MARKER);
    }

    #[test]
    fn test_yuv_alpha_adds_fourth_plane() {
        let frame = palette_frame(4, 4, 7);
        let bytes = encode_sequence(&[frame], 4, 4, 1, 0, Colorspace::Yuv444Alpha, false);

        let decoder = decoder_for(bytes.clone());
        let keyframe = decoder
            .chunks()
            .iter()
            .find(|c| c.chunk_type == chunk_type::KEYFRAME)
            .copied()
            .unwrap();

        let body_start = keyframe.offset as usize + 10;
        let payload = &bytes[body_start..body_start + keyframe.size as usize];

        let mut buf16 = vec![0u8; 16];
        let mut offset = 0;
        for _ in 0..4 {
            offset += plane::decode_plane_keyframe(&payload[offset..], &mut buf16).unwrap();
        }
        assert_eq!(&payload[offset..], &END_MARKER);
    }

    /// A source that gains bytes over time, as a progressive download would.
    struct GrowingSource {
        data: Rc<RefCell<Vec<u8>>>,
        complete: Rc<Cell<bool>>,
    }

    impl DataSource for GrowingSource {
        fn total_size(&self) -> Option<u64> {
            self.complete
                .get()
                .then(|| self.data.borrow().len() as u64)
        }

        fn read(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
            let data = self.data.borrow();
            let end = offset + length as u64;
            if end > data.len() as u64 {
                if self.complete.get() {
                    return Err(Error::TruncatedInput(format!(
                        "read past final size {}",
                        data.len()
                    )));
                }
                return Err(Error::NotYetAvailable);
            }
            Ok(data[offset as usize..end as usize].to_vec())
        }

        fn is_available(&self, offset: u64, length: usize) -> bool {
            offset + length as u64 <= self.data.borrow().len() as u64
        }
    }

    #[test]
    fn test_growing_source_resumes_after_not_yet_available() {
        let frames: Vec<_> = (0..3).map(|i| palette_frame(4, 4, i + 9)).collect();
        let bytes = encode_sequence(&frames, 4, 4, 2, 0, Colorspace::Srgb, false);

        let data = Rc::new(RefCell::new(Vec::new()));
        let complete = Rc::new(Cell::new(false));
        let mut decoder = QovDecoder::new(GrowingSource {
            data: Rc::clone(&data),
            complete: Rc::clone(&complete),
        });

        // Nothing delivered yet.
        assert!(matches!(
            decoder.parse_header(),
            Err(Error::NotYetAvailable)
        ));

        // Header plus a sliver of the first chunk.
        data.borrow_mut().extend_from_slice(&bytes[..30]);
        decoder.parse_header().unwrap();
        assert!(matches!(decoder.build_index(), Err(Error::NotYetAvailable)));
        assert!(matches!(
            decoder.decode_frame(0),
            Err(Error::NotYetAvailable)
        ));

        // The rest arrives; indexing resumes where it stopped.
        data.borrow_mut().extend_from_slice(&bytes[30..]);
        complete.set(true);
        decoder.build_index().unwrap();
        assert!(decoder.index_complete());
        assert_eq!(decoder.frame_count(), 3);

        let frame = decoder.decode_frame(2).unwrap().unwrap();
        assert_eq!(frame.pixels, frames[2]);
    }

    #[test]
    fn test_version1_stream_parses() {
        // Hand-build a version-1 stream: 16-bit chunk sizes.
        let pixels = solid_frame(2, 1, [128, 128, 128, 255]);

        let mut body = ByteWriter::new();
        let mut cache = qov_core::ColorCache::new();
        qov_encoder::rgb::encode_keyframe(&mut body, &pixels, &mut cache).unwrap();

        let mut out = ByteWriter::new();
        FileHeader {
            version: VERSION_1,
            flags: 0,
            width: 2,
            height: 1,
            fps_num: 24,
            fps_den: 1,
            total_frames: 1,
            audio_channels: 0,
            audio_rate_hz: 0,
            colorspace: Colorspace::Srgb,
        }
        .write_to(&mut out)
        .unwrap();

        ChunkHeader {
            chunk_type: chunk_type::SYNC,
            flags: 0,
            size: 8,
            timestamp: 0,
        }
        .write_to(&mut out, VERSION_1)
        .unwrap();
        out.write_bytes(&container::SYNC_MAGIC).unwrap();
        out.write_u32(0).unwrap();

        ChunkHeader {
            chunk_type: chunk_type::KEYFRAME,
            flags: 0,
            size: body.size() as u32,
            timestamp: 0,
        }
        .write_to(&mut out, VERSION_1)
        .unwrap();
        out.write_bytes(body.as_slice()).unwrap();

        ChunkHeader {
            chunk_type: chunk_type::END,
            flags: 0,
            size: 0,
            timestamp: 0,
        }
        .write_to(&mut out, VERSION_1)
        .unwrap();
        out.write_bytes(&END_MARKER).unwrap();

        let mut decoder = decoder_for(out.into_bytes());
        assert_eq!(decoder.frame_count(), 1);
        let frame = decoder.decode_frame(0).unwrap().unwrap();
        assert_eq!(frame.pixels, pixels);
    }

    #[test]
    fn test_truncated_stream_is_tolerated() {
        let frames: Vec<_> = (0..3).map(|i| palette_frame(4, 4, i + 60)).collect();
        let bytes = encode_sequence(&frames, 4, 4, 2, 0, Colorspace::Srgb, false);

        // Cut the stream right before the END chunk.
        let full = decoder_for(bytes.clone());
        let end_offset = full
            .chunks()
            .iter()
            .find(|c| c.chunk_type == chunk_type::END)
            .unwrap()
            .offset as usize;

        let mut decoder = QovDecoder::new(MemorySource::new(bytes[..end_offset].to_vec()));
        decoder.build_index().unwrap();
        assert!(decoder.index_complete());
        assert_eq!(decoder.frame_count(), 3);

        let frame = decoder.decode_frame(2).unwrap().unwrap();
        assert_eq!(frame.pixels, frames[2]);
        assert!(decoder.decode_frame(3).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_plane_opcode_is_detected() {
        let frame = palette_frame(4, 4, 11);
        let bytes = encode_sequence(&[frame], 4, 4, 1, 0, Colorspace::Yuv420, false);

        let keyframe = decoder_for(bytes.clone())
            .chunks()
            .iter()
            .find(|c| c.chunk_type == chunk_type::KEYFRAME)
            .copied()
            .unwrap();

        // 0x50 is not a valid plane opcode.
        let mut corrupted = bytes;
        corrupted[keyframe.offset as usize + 10] = 0x50;

        let mut decoder = decoder_for(corrupted);
        assert!(matches!(
            decoder.decode_frame(0),
            Err(Error::CorruptedStream(_))
        ));
    }

    #[test]
    fn test_decode_frame_past_end_returns_none() {
        let bytes = encode_sequence(
            &[palette_frame(4, 4, 1)],
            4,
            4,
            1,
            0,
            Colorspace::Srgb,
            false,
        );

        let mut decoder = decoder_for(bytes);
        assert!(decoder.decode_frame(0).unwrap().is_some());
        assert!(decoder.decode_frame(1).unwrap().is_none());
    }

    #[test]
    fn test_total_frames_patched_in_header() {
        let frames: Vec<_> = (0..4).map(|i| palette_frame(4, 4, i)).collect();
        let bytes = encode_sequence(&frames, 4, 4, 2, 0, Colorspace::Srgb, false);

        let mut decoder = QovDecoder::new(MemorySource::new(bytes));
        let header = decoder.parse_header().unwrap();
        assert_eq!(header.total_frames, 4);
    }
}
