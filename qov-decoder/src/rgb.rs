//! RGB opcode stream decoding
//!
//! Mirrors the encoder's state machine exactly: the same cache mutations in
//! the same order, so the decoder cache is byte-identical to the encoder's
//! after every frame. All channel deltas apply with mod-256 arithmetic.

use qov_core::opcodes::rgb::OP_SKIP_LONG;
use qov_core::opcodes::END_MARKER;
use qov_core::pixel::{ColorCache, Pixel};
use qov_core::{Error, Result};

/// Decodes a keyframe body (end marker included) into `out`.
///
/// Resets the cache, then writes every pixel of the frame.
pub fn decode_keyframe(data: &[u8], out: &mut [u8], cache: &mut ColorCache) -> Result<()> {
    cache.reset();
    let total = out.len() / 4;
    let mut prev = Pixel::OPAQUE_BLACK;
    let mut pos = 0usize;
    let mut written = 0usize;

    while written < total {
        let op = read_byte(data, &mut pos)?;
        let px = match op {
            0xFE => {
                let r = read_byte(data, &mut pos)?;
                let g = read_byte(data, &mut pos)?;
                let b = read_byte(data, &mut pos)?;
                let px = Pixel::new(r, g, b, prev.a);
                cache.insert(px);
                px
            }
            0xFF => {
                let r = read_byte(data, &mut pos)?;
                let g = read_byte(data, &mut pos)?;
                let b = read_byte(data, &mut pos)?;
                let a = read_byte(data, &mut pos)?;
                let px = Pixel::new(r, g, b, a);
                cache.insert(px);
                px
            }
            0x00..=0x3F => cache.get(op as usize),
            0x40..=0x7F => {
                let px = apply_diff(prev, op);
                cache.insert(px);
                px
            }
            0x80..=0xBF => {
                let chroma = read_byte(data, &mut pos)?;
                let px = apply_luma(prev, op, chroma);
                cache.insert(px);
                px
            }
            0xC0..=0xFD => {
                let run = (op & 0x3F) as usize + 1;
                if written + run > total {
                    return Err(Error::CorruptedStream(format!(
                        "run of {run} pixels overflows the frame at pixel {written}"
                    )));
                }
                for _ in 0..run {
                    prev.write_to(&mut out[written * 4..]);
                    written += 1;
                }
                continue;
            }
        };
        px.write_to(&mut out[written * 4..]);
        written += 1;
        prev = px;
    }

    expect_end_marker(data, pos)
}

/// Decodes a P-frame body into `out`, which the caller pre-filled with the
/// previous frame. Skips leave reference pixels untouched; everything else
/// predicts from the reference pixel at the same position.
pub fn decode_pframe(data: &[u8], out: &mut [u8], cache: &mut ColorCache) -> Result<()> {
    let total = out.len() / 4;
    let mut pos = 0usize;
    let mut written = 0usize;

    while written < total {
        let op = read_byte(data, &mut pos)?;
        let px = match op {
            0xFE => {
                let r = read_byte(data, &mut pos)?;
                let g = read_byte(data, &mut pos)?;
                let b = read_byte(data, &mut pos)?;
                let reference = Pixel::from_slice(&out[written * 4..]);
                let px = Pixel::new(r, g, b, reference.a);
                cache.insert(px);
                px
            }
            0xFF => {
                let r = read_byte(data, &mut pos)?;
                let g = read_byte(data, &mut pos)?;
                let b = read_byte(data, &mut pos)?;
                let a = read_byte(data, &mut pos)?;
                let px = Pixel::new(r, g, b, a);
                cache.insert(px);
                px
            }
            OP_SKIP_LONG => {
                let high = read_byte(data, &mut pos)?;
                let low = read_byte(data, &mut pos)?;
                let count = u16::from_be_bytes([high, low]) as usize;
                if count == 0 {
                    return Err(Error::CorruptedStream("long skip of zero pixels".into()));
                }
                skip_pixels(&mut written, count, total)?;
                continue;
            }
            0x01..=0x3F => cache.get(op as usize),
            0x40..=0x7F => {
                let reference = Pixel::from_slice(&out[written * 4..]);
                let px = apply_diff(reference, op);
                cache.insert(px);
                px
            }
            0x80..=0xBF => {
                let chroma = read_byte(data, &mut pos)?;
                let reference = Pixel::from_slice(&out[written * 4..]);
                let px = apply_luma(reference, op, chroma);
                cache.insert(px);
                px
            }
            0xC0..=0xFD => {
                let count = (op & 0x3F) as usize + 1;
                skip_pixels(&mut written, count, total)?;
                continue;
            }
        };
        px.write_to(&mut out[written * 4..]);
        written += 1;
    }

    expect_end_marker(data, pos)
}

fn skip_pixels(written: &mut usize, count: usize, total: usize) -> Result<()> {
    if *written + count > total {
        return Err(Error::CorruptedStream(format!(
            "skip of {count} pixels overflows the frame at pixel {written}"
        )));
    }
    *written += count;
    Ok(())
}

fn apply_diff(base: Pixel, op: u8) -> Pixel {
    let dr = ((op >> 4) & 0x03).wrapping_sub(2);
    let dg = ((op >> 2) & 0x03).wrapping_sub(2);
    let db = (op & 0x03).wrapping_sub(2);
    Pixel::new(
        base.r.wrapping_add(dr),
        base.g.wrapping_add(dg),
        base.b.wrapping_add(db),
        base.a,
    )
}

fn apply_luma(base: Pixel, op: u8, chroma: u8) -> Pixel {
    let dg = (op & 0x3F).wrapping_sub(32);
    let dr = dg.wrapping_add(chroma >> 4).wrapping_sub(8);
    let db = dg.wrapping_add(chroma & 0x0F).wrapping_sub(8);
    Pixel::new(
        base.r.wrapping_add(dr),
        base.g.wrapping_add(dg),
        base.b.wrapping_add(db),
        base.a,
    )
}

fn read_byte(data: &[u8], pos: &mut usize) -> Result<u8> {
    let byte = *data.get(*pos).ok_or_else(|| {
        Error::CorruptedStream("opcode stream ended before the frame was complete".into())
    })?;
    *pos += 1;
    Ok(byte)
}

fn expect_end_marker(data: &[u8], pos: usize) -> Result<()> {
    if data.len() != pos + END_MARKER.len() || data[pos..] != END_MARKER {
        return Err(Error::CorruptedStream(
            "frame body does not end at its end marker".into(),
        ));
    }
    Ok(())
}
