//! PNG export of emulator frames

use anyhow::Result;
use emu_core::types::Frame;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Upscale factor so the 96x16 panel is readable in an image viewer
pub const SCALE: u32 = 4;

/// Write `frame` as an 8-bit RGB PNG, each pixel repeated `scale` times per axis
pub fn write_png(frame: &Frame, path: &Path, scale: u32) -> Result<()> {
    let scale = scale.max(1);
    let width = frame.width * scale;
    let height = frame.height * scale;

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            let argb = frame.pixel(x / scale, y / scale).unwrap_or(0);
            rgb.extend_from_slice(&[(argb >> 16) as u8, (argb >> 8) as u8, argb as u8]);
        }
    }

    let writer = BufWriter::new(File::create(path)?);
    let mut encoder = png::Encoder::new(writer, width, height);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(&rgb)?;
    Ok(())
}
