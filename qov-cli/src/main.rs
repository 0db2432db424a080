//! QOV CLI Tool
//!
//! Command-line interface for encoding PNG image sequences into QOV files
//! and decoding QOV files back into frames.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::PathBuf;

use qov_core::container::{header_flags, Colorspace};
use qov_core::Frame;
use qov_decoder::{MemorySource, QovDecoder};
use qov_encoder::QovEncoder;

#[derive(Parser)]
#[command(name = "qov")]
#[command(about = "QOV - chunked opcode-compressed video container")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ColorspaceArg {
    Rgb,
    Rgba,
    Yuv420,
    Yuv422,
    Yuv444,
    Yuv444a,
}

impl From<ColorspaceArg> for Colorspace {
    fn from(arg: ColorspaceArg) -> Self {
        match arg {
            ColorspaceArg::Rgb => Colorspace::Srgb,
            ColorspaceArg::Rgba => Colorspace::Srgba,
            ColorspaceArg::Yuv420 => Colorspace::Yuv420,
            ColorspaceArg::Yuv422 => Colorspace::Yuv422,
            ColorspaceArg::Yuv444 => Colorspace::Yuv444,
            ColorspaceArg::Yuv444a => Colorspace::Yuv444Alpha,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a directory of image frames to a QOV file
    Encode {
        /// Directory holding the frames, encoded in file-name order
        input: PathBuf,

        /// Output QOV file path
        #[arg(short, long)]
        output: PathBuf,

        /// Frame rate numerator
        #[arg(long, default_value = "30")]
        fps_num: u16,

        /// Frame rate denominator
        #[arg(long, default_value = "1")]
        fps_den: u16,

        /// Pixel colorspace of the stream
        #[arg(long, value_enum, default_value = "rgba")]
        colorspace: ColorspaceArg,

        /// Frames between keyframes
        #[arg(long, default_value = "30")]
        keyframe_interval: u32,

        /// Store all chunks uncompressed
        #[arg(long)]
        no_compress: bool,

        /// Skip the trailing keyframe index
        #[arg(long)]
        no_index: bool,
    },

    /// Decode a QOV file to PNG frames
    Decode {
        /// Input QOV file path
        input: PathBuf,

        /// Output directory for frames, or the file for a single frame
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Show stream information only
        #[arg(long)]
        info: bool,

        /// Extract a single frame by frame number
        #[arg(long)]
        frame: Option<u32>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Encode {
            input,
            output,
            fps_num,
            fps_den,
            colorspace,
            keyframe_interval,
            no_compress,
            no_index,
        } => encode_frames(
            input,
            output,
            fps_num,
            fps_den,
            colorspace.into(),
            keyframe_interval,
            no_compress,
            no_index,
        )?,

        Commands::Decode {
            input,
            output,
            info,
            frame,
        } => decode_file(input, output, info, frame)?,
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn encode_frames(
    input: PathBuf,
    output: PathBuf,
    fps_num: u16,
    fps_den: u16,
    colorspace: Colorspace,
    keyframe_interval: u32,
    no_compress: bool,
    no_index: bool,
) -> Result<()> {
    let mut paths: Vec<PathBuf> = fs::read_dir(&input)
        .with_context(|| format!("Failed to read frame directory {}", input.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    paths.sort();
    if paths.is_empty() {
        bail!("No frames found in {}", input.display());
    }

    println!("Encoding {} frames from {}", paths.len(), input.display());

    let first = image::open(&paths[0])
        .with_context(|| format!("Failed to open {}", paths[0].display()))?
        .to_rgba8();
    let (width, height) = first.dimensions();
    if width > u16::MAX as u32 || height > u16::MAX as u32 {
        bail!("Frames of {width}x{height} exceed the 65535x65535 limit");
    }

    let flags = if no_index { 0 } else { header_flags::HAS_INDEX };
    let mut encoder = QovEncoder::new(
        width as u16,
        height as u16,
        fps_num,
        fps_den,
        flags,
        colorspace,
        !no_compress,
    )
    .context("Failed to create encoder")?;

    let frame_duration = 1_000_000u64 * fps_den as u64 / fps_num as u64;
    for (i, path) in paths.iter().enumerate() {
        let frame = if i == 0 {
            first.clone()
        } else {
            image::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?
                .to_rgba8()
        };
        if frame.dimensions() != (width, height) {
            bail!(
                "Frame {} is {}x{}, expected {width}x{height}",
                path.display(),
                frame.width(),
                frame.height()
            );
        }

        let timestamp = (i as u64 * frame_duration) as u32;
        if i as u32 % keyframe_interval == 0 {
            encoder.encode_keyframe(frame.as_raw(), timestamp)?;
        } else {
            encoder.encode_pframe(frame.as_raw(), timestamp)?;
        }

        if (i + 1) % 50 == 0 {
            println!("Encoded {} / {} frames", i + 1, paths.len());
        }
    }

    let bytes = encoder.finish().context("Failed to finalize stream")?;
    fs::write(&output, &bytes)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!(
        "Wrote {} ({} frames, {} bytes)",
        output.display(),
        encoder.frame_count(),
        bytes.len()
    );
    Ok(())
}

fn decode_file(
    input: PathBuf,
    output: Option<PathBuf>,
    info: bool,
    frame_number: Option<u32>,
) -> Result<()> {
    let bytes =
        fs::read(&input).with_context(|| format!("Failed to read {}", input.display()))?;
    let mut decoder = QovDecoder::new(MemorySource::new(bytes));
    decoder.parse_header().context("Failed to parse header")?;
    decoder.build_index().context("Failed to index stream")?;

    if info || output.is_none() {
        print_info(&decoder)?;
        if info {
            return Ok(());
        }
    }

    if let Some(frame_number) = frame_number {
        let output_path = output.context("Output path required for frame extraction")?;
        let frame = decoder
            .decode_frame(frame_number)?
            .with_context(|| format!("Stream has no frame {frame_number}"))?;
        save_frame(&frame, &output_path)?;
        println!("Saved frame {frame_number} to {}", output_path.display());
    } else {
        let output_dir = output.context("Output directory required")?;
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        let count = decoder.frame_count();
        println!("Extracting {count} frames to {}", output_dir.display());
        for i in 0..count {
            let frame = decoder
                .decode_frame(i)?
                .with_context(|| format!("Stream has no frame {i}"))?;
            save_frame(&frame, &output_dir.join(format!("frame_{i:06}.png")))?;
        }
        println!("Extracted all {count} frames");
    }

    Ok(())
}

fn save_frame(frame: &Frame, path: &PathBuf) -> Result<()> {
    let image = image::RgbaImage::from_raw(
        frame.width as u32,
        frame.height as u32,
        frame.pixels.clone(),
    )
    .context("Frame buffer does not match its dimensions")?;
    image
        .save(path)
        .with_context(|| format!("Failed to save {}", path.display()))
}

fn print_info(decoder: &QovDecoder<MemorySource>) -> Result<()> {
    let stats = decoder.file_stats()?;
    let header = &stats.header;

    println!("\n=== QOV Stream Information ===");
    println!("Container version: {}", header.version);
    println!("Resolution: {}x{}", header.width, header.height);
    println!(
        "Frame rate: {}/{} ({:.2} fps)",
        header.fps_num,
        header.fps_den,
        header.fps()
    );
    println!("Colorspace: {}", header.colorspace);
    println!("Total frames: {}", header.total_frames);
    println!(
        "Duration: {:.3} s",
        stats.total_duration as f64 / 1_000_000.0
    );
    println!(
        "Chunks: {} ({} frame chunks, {} keyframes)",
        stats.chunks.len(),
        decoder.frame_count(),
        stats.keyframe_indices.len()
    );

    if !stats.index_entries.is_empty() {
        println!("\n=== Keyframe Index ===");
        for entry in &stats.index_entries {
            println!(
                "  frame {:>6} at byte {:>10}, {:.3} s",
                entry.frame_number,
                entry.offset,
                entry.timestamp as f64 / 1_000_000.0
            );
        }
    }

    Ok(())
}
