// THEORY:
// The `blur` module defines the one blurred picture of a frame that every redaction
// strategy agrees on. The frame is downscaled (nearest neighbour), blurred with a small
// separable Gaussian, and upscaled back (nearest neighbour). A redacted pixel is simply
// that blurred picture evaluated at the pixel's position.
//
// Key architectural principles:
// 1.  **One downscale per frame**: `BlurField` resizes the frame once. Whole-frame
//     redaction filters all of it; per-region redaction filters only crops of it.
// 2.  **Crops carry their margin**: A crop is widened by the kernel radius before it is
//     filtered and only its interior is kept, so every kept value saw the same
//     neighbours it sees in the whole-frame pass. At the real frame edges both passes
//     clamp to the same border pixel.
// 3.  **One nearest mapping**: Per-region upscaling picks source pixels with the same
//     rule `imageops::resize` applies for `FilterType::Nearest`.

use crate::core_modules::geometry::PixelRect;
use image::RgbImage;
use image::imageops::{self, FilterType};
use imageproc::filter::separable_filter_equal;

/// Normalized 1D Gaussian weights. Even sizes are bumped to the next odd size.
fn gaussian_weights(size: usize, sigma: f32) -> Vec<f32> {
    let radius = (size / 2) as i64;
    let sigma = if sigma > 0.0 { sigma } else { 0.3 * (radius as f32 - 1.0) + 0.8 };
    let weights: Vec<f32> = (-radius..=radius)
        .map(|i| (-((i * i) as f32) / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = weights.iter().sum();
    weights.into_iter().map(|w| w / sum).collect()
}

/// Source index `imageops::resize` reads for output index `out` when scaling a
/// `source_len` axis to `out_len` with `FilterType::Nearest`.
fn nearest_source(out: u32, out_len: u32, source_len: u32) -> u32 {
    let ratio = source_len as f32 / out_len as f32;
    let index = ((out as f32 + 0.5) * ratio).floor() as i64;
    index.clamp(0, source_len as i64 - 1) as u32
}

/// The blurred picture of one source frame.
pub struct BlurField {
    width: u32,
    height: u32,
    /// Nearest-neighbour downscale of the source.
    small: RgbImage,
    kernel: Vec<f32>,
}

impl BlurField {
    pub fn new(source: &RgbImage, downscale_factor: f32, kernel_size: usize, sigma: f32) -> Self {
        let (width, height) = source.dimensions();
        let small_width = ((width as f32 * downscale_factor).floor() as u32).clamp(1, width.max(1));
        let small_height = ((height as f32 * downscale_factor).floor() as u32).clamp(1, height.max(1));
        Self {
            width,
            height,
            small: imageops::resize(source, small_width, small_height, FilterType::Nearest),
            kernel: gaussian_weights(kernel_size, sigma),
        }
    }

    pub fn small_dimensions(&self) -> (u32, u32) {
        self.small.dimensions()
    }

    fn radius(&self) -> u32 {
        (self.kernel.len() / 2) as u32
    }

    /// Blurs the whole downscaled frame.
    pub fn blur_downscaled(&self) -> RgbImage {
        separable_filter_equal(&self.small, &self.kernel)
    }

    /// Scales a blurred downscaled frame back to source resolution.
    pub fn upscale(&self, blurred_small: &RgbImage) -> RgbImage {
        imageops::resize(blurred_small, self.width, self.height, FilterType::Nearest)
    }

    /// Evaluates the blurred picture over `rect` only.
    pub fn render_region(&self, rect: PixelRect) -> RgbImage {
        if rect.width == 0 || rect.height == 0 {
            return RgbImage::new(rect.width, rect.height);
        }
        let (small_width, small_height) = self.small.dimensions();
        let columns: Vec<u32> = (rect.x..rect.right())
            .map(|x| nearest_source(x, self.width, small_width))
            .collect();
        let rows: Vec<u32> = (rect.y..rect.bottom())
            .map(|y| nearest_source(y, self.height, small_height))
            .collect();

        // The mapping is monotonic, so the first and last entries bound the footprint.
        let radius = self.radius();
        let x0 = columns[0].saturating_sub(radius);
        let y0 = rows[0].saturating_sub(radius);
        let x1 = (columns[columns.len() - 1] + 1 + radius).min(small_width);
        let y1 = (rows[rows.len() - 1] + 1 + radius).min(small_height);

        let crop = imageops::crop_imm(&self.small, x0, y0, x1 - x0, y1 - y0).to_image();
        let blurred = separable_filter_equal(&crop, &self.kernel);
        RgbImage::from_fn(rect.width, rect.height, |dx, dy| {
            *blurred.get_pixel(columns[dx as usize] - x0, rows[dy as usize] - y0)
        })
    }
}
