//! Per-plane opcode stream encoding for YUV frames
//!
//! Each plane (Y, U, V, optional A) is encoded independently, back to back
//! inside one frame chunk, with a fresh value cache per plane. The previous
//! sample predictor starts at 0 for every plane, chroma included. No length
//! prefixes are written; the decoder derives each plane's sample count from
//! the colorspace and resolution. The frame's single end marker is appended
//! by the orchestrator after the last plane.

use qov_core::opcodes::plane::{
    MAX_RUN, MAX_SKIP_LONG, OP_DIFF, OP_FULL, OP_INDEX, OP_LUMA, OP_RUN, OP_SKIP_LONG,
};
use qov_core::pixel::ValueCache;
use qov_core::{ByteWriter, Result};

/// Encodes one plane of a keyframe
pub fn encode_plane_keyframe(out: &mut ByteWriter, samples: &[u8]) -> Result<()> {
    let mut cache = ValueCache::new();
    let mut prev = 0u8;
    let mut run = 0usize;

    for &value in samples {
        if value == prev {
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
        encode_sample(out, value, prev, &mut cache, true)?;
        prev = value;
    }
    if run > 0 {
        out.write_u8(OP_RUN | (run as u8 - 1))?;
    }
    Ok(())
}

/// Encodes one plane of a P-frame against the previous frame's plane
pub fn encode_plane_pframe(out: &mut ByteWriter, samples: &[u8], reference: &[u8]) -> Result<()> {
    let mut cache = ValueCache::new();
    let mut skip = 0usize;

    for (&value, &ref_value) in samples.iter().zip(reference.iter()) {
        if value == ref_value {
            skip += 1;
            continue;
        }
        flush_skip(out, &mut skip)?;
        encode_sample(out, value, ref_value, &mut cache, false)?;
    }
    flush_skip(out, &mut skip)
}

/// Emits the cheapest opcode reproducing `value` against the prediction
/// `base`. In P-frames slot 0 collides with SKIP_LONG and must not be
/// indexed.
fn encode_sample(
    out: &mut ByteWriter,
    value: u8,
    base: u8,
    cache: &mut ValueCache,
    allow_slot_zero: bool,
) -> Result<()> {
    if let Some(slot) = cache.lookup(value) {
        if allow_slot_zero || slot != 0 {
            return out.write_u8(OP_INDEX | slot as u8);
        }
    }
    cache.insert(value);

    let delta = value.wrapping_sub(base) as i8;
    if (-8..=7).contains(&delta) {
        return out.write_u8(OP_DIFF | (delta + 8) as u8);
    }
    if (-32..=31).contains(&delta) {
        return out.write_u8(OP_LUMA | (delta + 32) as u8);
    }
    out.write_u8(OP_FULL)?;
    out.write_u8(value)
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
