//! Per-plane opcode stream decoding for YUV frames
//!
//! Planes carry no length prefix; each decode consumes opcodes until the
//! plane's expected sample count is reached and reports how many bytes it
//! used, so the caller can hand the rest to the next plane. The value cache
//! is fresh per plane and the sample predictor starts at 0, chroma included.

use qov_core::opcodes::plane::{OP_FULL, OP_SKIP_LONG};
use qov_core::pixel::ValueCache;
use qov_core::{Error, Result};

/// Decodes one keyframe plane into `out`, returning the bytes consumed.
pub fn decode_plane_keyframe(data: &[u8], out: &mut [u8]) -> Result<usize> {
    let mut cache = ValueCache::new();
    let total = out.len();
    let mut prev = 0u8;
    let mut pos = 0usize;
    let mut written = 0usize;

    while written < total {
        let op = read_byte(data, &mut pos)?;
        let value = match op {
            OP_FULL => {
                let value = read_byte(data, &mut pos)?;
                cache.insert(value);
                value
            }
            0x00..=0x3F => cache.get(op as usize),
            0x40..=0x4F => {
                let value = prev.wrapping_add(op & 0x0F).wrapping_sub(8);
                cache.insert(value);
                value
            }
            0x80..=0xBF => {
                let value = prev.wrapping_add(op & 0x3F).wrapping_sub(32);
                cache.insert(value);
                value
            }
            0xC0..=0xFD => {
                let run = (op & 0x3F) as usize + 1;
                if written + run > total {
                    return Err(Error::CorruptedStream(format!(
                        "run of {run} samples overflows the plane at sample {written}"
                    )));
                }
                out[written..written + run].fill(prev);
                written += run;
                continue;
            }
            _ => {
                return Err(Error::CorruptedStream(format!(
                    "unknown keyframe plane opcode 0x{op:02X}"
                )));
            }
        };
        out[written] = value;
        written += 1;
        prev = value;
    }

    Ok(pos)
}

/// Decodes one P-frame plane into `out`, which the caller pre-filled with
/// the previous frame's plane. Returns the bytes consumed.
pub fn decode_plane_pframe(data: &[u8], out: &mut [u8]) -> Result<usize> {
    let mut cache = ValueCache::new();
    let total = out.len();
    let mut pos = 0usize;
    let mut written = 0usize;

    while written < total {
        let op = read_byte(data, &mut pos)?;
        let value = match op {
            OP_FULL => {
                let value = read_byte(data, &mut pos)?;
                cache.insert(value);
                value
            }
            OP_SKIP_LONG => {
                let high = read_byte(data, &mut pos)?;
                let low = read_byte(data, &mut pos)?;
                let count = u16::from_be_bytes([high, low]) as usize;
                if count == 0 {
                    return Err(Error::CorruptedStream("long skip of zero samples".into()));
                }
                skip_samples(&mut written, count, total)?;
                continue;
            }
            0x01..=0x3F => cache.get(op as usize),
            0x40..=0x4F => {
                let value = out[written].wrapping_add(op & 0x0F).wrapping_sub(8);
                cache.insert(value);
                value
            }
            0x80..=0xBF => {
                let value = out[written].wrapping_add(op & 0x3F).wrapping_sub(32);
                cache.insert(value);
                value
            }
            0xC0..=0xFD => {
                let count = (op & 0x3F) as usize + 1;
                skip_samples(&mut written, count, total)?;
                continue;
            }
            _ => {
                return Err(Error::CorruptedStream(format!(
                    "unknown P-frame plane opcode 0x{op:02X}"
                )));
            }
        };
        out[written] = value;
        written += 1;
    }

    Ok(pos)
}

fn skip_samples(written: &mut usize, count: usize, total: usize) -> Result<()> {
    if *written + count > total {
        return Err(Error::CorruptedStream(format!(
            "skip of {count} samples overflows the plane at sample {written}"
        )));
    }
    *written += count;
    Ok(())
}

fn read_byte(data: &[u8], pos: &mut usize) -> Result<u8> {
    let byte = *data.get(*pos).ok_or_else(|| {
        Error::CorruptedStream("opcode stream ended before the plane was complete".into())
    })?;
    *pos += 1;
    Ok(byte)
}
