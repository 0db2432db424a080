//! RGB opcode stream encoding
//!
//! Keyframes predict each pixel from the previously emitted one; P-frames
//! predict from the same position in the previous frame. For every pixel the
//! encoder picks the first opcode that reproduces it exactly, in order:
//! run/skip, cache index, two-bit diff, luma, literal RGB, literal RGBA.
//! Channel deltas use mod-256 arithmetic, so a 255 -> 0 step counts as +1.

use qov_core::opcodes::rgb::{
    MAX_RUN, MAX_SKIP_LONG, OP_DIFF, OP_INDEX, OP_LUMA, OP_RGB, OP_RGBA, OP_RUN, OP_SKIP_LONG,
};
use qov_core::opcodes::END_MARKER;
use qov_core::pixel::{ColorCache, Pixel};
use qov_core::{ByteWriter, Result};

/// Encodes a full keyframe body, end marker included.
///
/// Resets the cache and the run predictor, as every keyframe must.
pub fn encode_keyframe(out: &mut ByteWriter, pixels: &[u8], cache: &mut ColorCache) -> Result<()> {
    cache.reset();
    let mut prev = Pixel::OPAQUE_BLACK;
    let mut run = 0usize;

    for raw in pixels.chunks_exact(4) {
        let px = Pixel::from_slice(raw);
        if px == prev {
            run += 1;
            if run == MAX_RUN {
                out.write_u8(OP_RUN | (MAX_RUN as u8 - 1))?;
                run = 0;
            }
            continue;
        }
        if run > 0 {
            out.write_u8(OP_RUN | (run as u8 - 1))?;
            run = 0;
        }
        encode_pixel(out, px, prev, cache, true)?;
        prev = px;
    }
    if run > 0 {
        out.write_u8(OP_RUN | (run as u8 - 1))?;
    }
    out.write_bytes(&END_MARKER)
}

/// Encodes a P-frame body against `reference`, end marker included.
///
/// The cache is carried over from the preceding frames of the group; it was
/// reset by the keyframe that opened it.
pub fn encode_pframe(
    out: &mut ByteWriter,
    pixels: &[u8],
    reference: &[u8],
    cache: &mut ColorCache,
) -> Result<()> {
    let mut skip = 0usize;

    for (raw, ref_raw) in pixels.chunks_exact(4).zip(reference.chunks_exact(4)) {
        let px = Pixel::from_slice(raw);
        let ref_px = Pixel::from_slice(ref_raw);
        if px == ref_px {
            skip += 1;
            continue;
        }
        flush_skip(out, &mut skip)?;
        encode_pixel(out, px, ref_px, cache, false)?;
    }
    flush_skip(out, &mut skip)?;
    out.write_bytes(&END_MARKER)
}

/// Emits the cheapest opcode reproducing `px` against the prediction `base`.
///
/// In P-frames slot 0 collides with SKIP_LONG and must not be indexed.
fn encode_pixel(
    out: &mut ByteWriter,
    px: Pixel,
    base: Pixel,
    cache: &mut ColorCache,
    allow_slot_zero: bool,
) -> Result<()> {
    if let Some(slot) = cache.lookup(px) {
        if allow_slot_zero || slot != 0 {
            return out.write_u8(OP_INDEX | slot as u8);
        }
    }
    cache.insert(px);

    if px.a == base.a {
        let dr = px.r.wrapping_sub(base.r) as i8;
        let dg = px.g.wrapping_sub(base.g) as i8;
        let db = px.b.wrapping_sub(base.b) as i8;

        if (-2..=1).contains(&dr) && (-2..=1).contains(&dg) && (-2..=1).contains(&db) {
            return out.write_u8(
                OP_DIFF | ((dr + 2) as u8) << 4 | ((dg + 2) as u8) << 2 | (db + 2) as u8,
            );
        }

        let dr_dg = dr.wrapping_sub(dg);
        let db_dg = db.wrapping_sub(dg);
        if (-32..=31).contains(&dg) && (-8..=7).contains(&dr_dg) && (-8..=7).contains(&db_dg) {
            out.write_u8(OP_LUMA | (dg + 32) as u8)?;
            return out.write_u8(((dr_dg + 8) as u8) << 4 | (db_dg + 8) as u8);
        }

        out.write_u8(OP_RGB)?;
        out.write_u8(px.r)?;
        out.write_u8(px.g)?;
        return out.write_u8(px.b);
    }

    out.write_u8(OP_RGBA)?;
    out.write_u8(px.r)?;
    out.write_u8(px.g)?;
    out.write_u8(px.b)?;
    out.write_u8(px.a)
}

fn flush_skip(out: &mut ByteWriter, skip: &mut usize) -> Result<()> {
    while *skip > 0 {
        if *skip <= MAX_RUN {
            out.write_u8(OP_RUN | (*skip as u8 - 1))?;
            *skip = 0;
        } else {
            let count = (*skip).min(MAX_SKIP_LONG);
            out.write_u8(OP_SKIP_LONG)?;
            out.write_u16(count as u16)?;
            *skip -= count;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgba(pixels: &[(u8, u8, u8, u8)]) -> Vec<u8> {
        pixels
            .iter()
            .flat_map(|&(r, g, b, a)| [r, g, b, a])
            .collect()
    }

    fn keyframe_bytes(pixels: &[(u8, u8, u8, u8)]) -> Vec<u8> {
        let mut out = ByteWriter::new();
        let mut cache = ColorCache::new();
        encode_keyframe(&mut out, &rgba(pixels), &mut cache).unwrap();
        out.into_bytes()
    }

    #[test]
    fn test_keyframe_run_and_diff() {
        // A black pixel extends the initial run; a (+1,+1,+1) step is a DIFF
        // byte with bias-2 fields: 0x40 | 3<<4 | 3<<2 | 3 = 0x7F.
        let bytes = keyframe_bytes(&[(0, 0, 0, 255), (1, 1, 1, 255)]);

        let mut expected = vec![OP_RUN, 0x7F];
        expected.extend_from_slice(&END_MARKER);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_keyframe_run_splits_at_62() {
        let bytes = keyframe_bytes(&[(0, 0, 0, 255); 63]);

        // 62 pixels fill one RUN opcode; the 63rd forces a second.
        let mut expected = vec![0xFD, OP_RUN];
        expected.extend_from_slice(&END_MARKER);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_keyframe_index_hit() {
        let first = (10, 20, 30, 255);
        let bytes = keyframe_bytes(&[first, (200, 100, 50, 255), first]);

        // (10*3 + 20*5 + 30*7 + 255*11) % 64 = 9
        let slot = Pixel::new(10, 20, 30, 255).hash_index() as u8;
        assert_eq!(slot, 9);
        assert_eq!(bytes[bytes.len() - 9], OP_INDEX | slot);
    }

    #[test]
    fn test_keyframe_luma_and_rgba() {
        let bytes = keyframe_bytes(&[(0, 20, 0, 255), (0, 20, 0, 128)]);

        // dg = +20 with dr-dg = db-dg = -20 is out of luma range, and the
        // alpha change forces the second pixel to a full RGBA literal.
        assert_eq!(bytes[0], OP_RGB);
        assert_eq!(&bytes[1..4], &[0, 20, 0]);
        assert_eq!(bytes[4], OP_RGBA);
        assert_eq!(&bytes[5..9], &[0, 20, 0, 128]);
    }

    #[test]
    fn test_pframe_skip_counts() {
        let frame: Vec<u8> = rgba(&[(5, 5, 5, 255); 16]);
        let mut out = ByteWriter::new();
        let mut cache = ColorCache::new();
        encode_pframe(&mut out, &frame, &frame, &mut cache).unwrap();

        // 16 unchanged pixels collapse into a single SKIP byte.
        let mut expected = vec![0xCF];
        expected.extend_from_slice(&END_MARKER);
        assert_eq!(out.into_bytes(), expected);
    }

    #[test]
    fn test_pframe_skip_long() {
        let reference = rgba(&[(5, 5, 5, 255); 65]);
        let mut pixels = reference.clone();
        // Change only the last pixel; 64 unchanged ones need SKIP_LONG.
        pixels[64 * 4] = 6;

        let mut out = ByteWriter::new();
        let mut cache = ColorCache::new();
        encode_pframe(&mut out, &pixels, &reference, &mut cache).unwrap();

        let bytes = out.into_bytes();
        assert_eq!(&bytes[0..3], &[OP_SKIP_LONG, 0x00, 64]);
        // (+1, 0, 0) against the reference pixel is a DIFF.
        assert_eq!(bytes[3], OP_DIFF | 3 << 4 | 2 << 2 | 2);
    }

    #[test]
    fn test_pframe_trailing_skip_is_flushed() {
        let reference = rgba(&[(9, 9, 9, 255); 8]);
        let mut pixels = reference.clone();
        pixels[0] = 10;

        let mut out = ByteWriter::new();
        let mut cache = ColorCache::new();
        encode_pframe(&mut out, &pixels, &reference, &mut cache).unwrap();

        let bytes = out.into_bytes();
        // One changed pixel, then the remaining 7 skipped before the marker.
        assert_eq!(bytes[bytes.len() - 9], OP_RUN | 6);
    }
}
