// THEORY:
// The `Redactor` turns a frame plus its detections into a privacy-safe frame. It owns
// the cost heuristic that picks between two redaction strategies and the final
// re-encode/write-back step.
//
// Key architectural principles:
// 1.  **Strategy is a pure function**: `choose_strategy` looks only at the box count
//     and the summed box area. The same boxes on the same frame size always pick the
//     same strategy.
// 2.  **Strategies differ in cost, never in result**: Both strategies read the shared
//     `BlurField`. Per-region evaluates it inside each box; whole-frame evaluates it
//     everywhere once and composites through a mask. Output pixels are identical.
// 3.  **Originals are never read after being written**: Per-region computes every patch
//     from the pristine frame before pasting any of them, so overlapping boxes cannot
//     blur already-blurred pixels.
// 4.  **In-place replacement is atomic**: The encoded result goes to a temporary file
//     and is renamed over the original.

use crate::core_modules::blur::BlurField;
use crate::core_modules::frame::{
    METRIC_BLUR_TIME, METRIC_COMPOSITE_TIME, METRIC_DOWNSCALE_TIME, METRIC_MASK_TIME, METRIC_UPSCALE_TIME,
    METRIC_WRITE_TIME, Metrics,
};
use crate::core_modules::geometry::{BoundingBox, PixelRect};
use crate::core_modules::utils::image_helper;
use image::{GrayImage, Luma, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RedactionError {
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("writing redacted frame failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Tuning knobs for blurring and for the strategy heuristic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    /// Fraction of the original resolution the blur runs at.
    pub downscale_factor: f32,
    /// Gaussian kernel size in downscaled pixels (odd).
    pub kernel_size: usize,
    pub sigma: f32,
    /// JPEG quality of the rewritten frame.
    pub jpeg_quality: u8,
    /// Per-region redaction requires strictly fewer boxes than this.
    pub max_region_boxes: usize,
    /// Per-region redaction requires the summed box area to stay under this fraction
    /// of the frame area.
    pub max_region_area_ratio: f32,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            downscale_factor: 0.2,
            kernel_size: 5,
            sigma: 1.5,
            jpeg_quality: 80,
            max_region_boxes: 30,
            max_region_area_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedactionStrategy {
    /// Blur each box on its own. Cheap when few, small boxes are present.
    PerRegion,
    /// Blur the whole frame once and composite through a mask.
    WholeFrame,
}

/// Picks the cheaper strategy for `boxes` on a `width x height` frame.
pub fn choose_strategy(boxes: &[BoundingBox], width: u32, height: u32, config: &RedactionConfig) -> RedactionStrategy {
    let total_area: f64 = boxes.iter().map(|b| b.area() as f64).sum();
    let frame_area = width as f64 * height as f64;
    if boxes.len() < config.max_region_boxes && total_area < config.max_region_area_ratio as f64 * frame_area {
        RedactionStrategy::PerRegion
    } else {
        RedactionStrategy::WholeFrame
    }
}

pub struct Redactor {
    config: RedactionConfig,
}

impl Redactor {
    pub fn new(config: RedactionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RedactionConfig {
        &self.config
    }

    /// Redacts `boxes` on a copy of `image` using the strategy the heuristic picks.
    pub fn redact(
        &self,
        image: &RgbImage,
        boxes: &[BoundingBox],
        metrics: &mut Metrics,
    ) -> (RgbImage, RedactionStrategy) {
        let strategy = choose_strategy(boxes, image.width(), image.height(), &self.config);
        (self.redact_with(strategy, image, boxes, metrics), strategy)
    }

    /// Redacts with an explicit strategy.
    pub fn redact_with(
        &self,
        strategy: RedactionStrategy,
        image: &RgbImage,
        boxes: &[BoundingBox],
        metrics: &mut Metrics,
    ) -> RgbImage {
        let start = Instant::now();
        let (width, height) = image.dimensions();
        let rects: Vec<PixelRect> = boxes.iter().filter_map(|b| b.to_pixel_rect(width, height)).collect();
        if rects.is_empty() {
            return image.clone();
        }

        let downscale_start = Instant::now();
        let field = BlurField::new(image, self.config.downscale_factor, self.config.kernel_size, self.config.sigma);
        metrics.record(METRIC_DOWNSCALE_TIME, downscale_start.elapsed());
        let redacted = match strategy {
            RedactionStrategy::PerRegion => Self::redact_per_region(&field, image, &rects),
            RedactionStrategy::WholeFrame => Self::redact_whole_frame(&field, image, &rects, metrics),
        };
        metrics.record(METRIC_BLUR_TIME, start.elapsed());
        redacted
    }

    fn redact_per_region(field: &BlurField, image: &RgbImage, rects: &[PixelRect]) -> RgbImage {
        let patches: Vec<(PixelRect, RgbImage)> =
            rects.iter().map(|&rect| (rect, field.render_region(rect))).collect();
        let mut output = image.clone();
        for (rect, patch) in &patches {
            image::imageops::replace(&mut output, patch, rect.x as i64, rect.y as i64);
        }
        output
    }

    fn redact_whole_frame(
        field: &BlurField,
        image: &RgbImage,
        rects: &[PixelRect],
        metrics: &mut Metrics,
    ) -> RgbImage {
        let (width, height) = image.dimensions();

        let start = Instant::now();
        let blurred = field.upscale(&field.blur_downscaled());
        metrics.record(METRIC_UPSCALE_TIME, start.elapsed());

        let start = Instant::now();
        let mut mask = GrayImage::new(width, height);
        for rect in rects {
            draw_filled_rect_mut(
                &mut mask,
                Rect::at(rect.x as i32, rect.y as i32).of_size(rect.width, rect.height),
                Luma([255u8]),
            );
        }
        metrics.record(METRIC_MASK_TIME, start.elapsed());

        let start = Instant::now();
        let output = RgbImage::from_fn(width, height, |x, y| {
            if mask.get_pixel(x, y).0[0] != 0 {
                *blurred.get_pixel(x, y)
            } else {
                *image.get_pixel(x, y)
            }
        });
        metrics.record(METRIC_COMPOSITE_TIME, start.elapsed());
        output
    }

    /// Re-encodes `image` as JPEG and atomically replaces `path` with it.
    pub fn write(&self, image: &RgbImage, path: &Path, metrics: &mut Metrics) -> Result<(), RedactionError> {
        let start = Instant::now();
        let bytes = image_helper::encode_jpeg(image, self.config.jpeg_quality)?;
        image_helper::write_atomically(path, &bytes)?;
        metrics.record(METRIC_WRITE_TIME, start.elapsed());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn noisy(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let v = (x.wrapping_mul(2654435761) ^ y.wrapping_mul(40503)) >> 3;
            Rgb([(v % 256) as u8, ((v >> 8) % 256) as u8, ((v >> 16) % 256) as u8])
        })
    }

    #[test]
    fn forty_boxes_covering_most_of_the_frame_go_whole_frame() {
        let (w, h) = (2028u32, 1024u32);
        // 40 boxes totalling 60% of the frame area.
        let box_area = 0.6 * (w * h) as f32 / 40.0;
        let side = box_area.sqrt();
        let boxes: Vec<BoundingBox> = (0..40)
            .map(|i| {
                let x = (i % 8) as f32 * 250.0;
                let y = (i / 8) as f32 * 200.0;
                BoundingBox::new(x, y, x + side, y + side)
            })
            .collect();
        let config = RedactionConfig::default();
        assert_eq!(choose_strategy(&boxes, w, h, &config), RedactionStrategy::WholeFrame);
        // Count alone forces whole-frame.
        let tiny: Vec<BoundingBox> = (0..30).map(|i| BoundingBox::new(i as f32, 0.0, i as f32 + 1.0, 1.0)).collect();
        assert_eq!(choose_strategy(&tiny, w, h, &config), RedactionStrategy::WholeFrame);
    }

    #[test]
    fn sparse_boxes_go_per_region_and_large_area_goes_whole_frame() {
        let config = RedactionConfig::default();
        let few = vec![BoundingBox::new(0.0, 0.0, 100.0, 100.0)];
        assert_eq!(choose_strategy(&few, 1000, 1000, &config), RedactionStrategy::PerRegion);
        let big = vec![BoundingBox::new(0.0, 0.0, 1000.0, 600.0)];
        assert_eq!(choose_strategy(&big, 1000, 1000, &config), RedactionStrategy::WholeFrame);
        assert_eq!(choose_strategy(&[], 1000, 1000, &config), RedactionStrategy::PerRegion);
    }

    #[test]
    fn both_strategies_produce_identical_pixels() {
        let image = noisy(320, 160);
        let boxes = vec![
            BoundingBox::new(10.0, 10.0, 80.0, 60.0),
            BoundingBox::new(50.0, 40.0, 140.0, 120.0),
            BoundingBox::new(300.0, 150.0, 400.0, 200.0),
            BoundingBox::new(0.0, 100.0, 30.0, 160.0),
        ];
        let redactor = Redactor::new(RedactionConfig::default());
        let mut metrics = Metrics::new();
        let per_region = redactor.redact_with(RedactionStrategy::PerRegion, &image, &boxes, &mut metrics);
        let whole_frame = redactor.redact_with(RedactionStrategy::WholeFrame, &image, &boxes, &mut metrics);
        assert_eq!(per_region, whole_frame);
        assert_ne!(per_region, image);
        assert!(metrics.get(METRIC_MASK_TIME).is_some());
    }

    #[test]
    fn pixels_outside_boxes_are_untouched() {
        let image = noisy(200, 100);
        let boxes = vec![BoundingBox::new(20.0, 20.0, 60.0, 50.0)];
        let redactor = Redactor::new(RedactionConfig::default());
        let (output, strategy) = redactor.redact(&image, &boxes, &mut Metrics::new());
        assert_eq!(strategy, RedactionStrategy::PerRegion);
        for (x, y, pixel) in output.enumerate_pixels() {
            let inside = (20..60).contains(&x) && (20..50).contains(&y);
            if !inside {
                assert_eq!(pixel, image.get_pixel(x, y));
            }
        }
    }

    #[test]
    fn redaction_is_deterministic() {
        let image = noisy(128, 64);
        let boxes = vec![BoundingBox::new(5.0, 5.0, 100.0, 60.0)];
        let redactor = Redactor::new(RedactionConfig::default());
        let a = redactor.redact(&image, &boxes, &mut Metrics::new());
        let b = redactor.redact(&image, &boxes, &mut Metrics::new());
        assert_eq!(a, b);
    }

    #[test]
    fn write_replaces_the_file_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("frame.jpg");
        std::fs::write(&path, b"not a jpeg").expect("seed");
        let redactor = Redactor::new(RedactionConfig::default());
        let mut metrics = Metrics::new();
        redactor.write(&noisy(64, 32), &path, &mut metrics).expect("write");
        let decoded = image::open(&path).expect("decode");
        assert_eq!((decoded.width(), decoded.height()), (64, 32));
        assert!(metrics.get(METRIC_WRITE_TIME).is_some());
    }
}
