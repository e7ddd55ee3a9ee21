use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageResult, RgbImage};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Writes an RGB image as PNG. Used by developer tooling for visual inspection.
pub fn save_png(path: &Path, image: &RgbImage) -> ImageResult<()> {
    let output = BufWriter::new(File::create(path)?);
    let encoder = PngEncoder::new(output);
    encoder.write_image(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8)?;
    Ok(())
}

/// Decodes any supported image file into 8-bit RGB.
pub fn load_rgb(path: &Path) -> ImageResult<RgbImage> {
    Ok(image::open(path)?.to_rgb8())
}

/// Encodes an RGB image as JPEG at `quality` (1-100).
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> ImageResult<Vec<u8>> {
    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
    encoder.write_image(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8)?;
    Ok(buffer)
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

/// Replaces `path` with `bytes` through a temporary sibling and a rename, so readers
/// never observe a half-written file.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let temp = temp_sibling(path);
    {
        let mut file = BufWriter::new(File::create(&temp)?);
        file.write_all(bytes)?;
        file.flush()?;
    }
    std::fs::rename(&temp, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&temp);
    })
}
