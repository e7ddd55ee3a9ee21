// THEORY:
// The `GridManager` is the Batch Assembler. It decides how claimed frames are grouped
// into inference batches and physically packs each batch into one square model input.
//
// Key architectural principles:
// 1.  **Planning is separate from pixels**: `partition` and `plan` only shuffle `Frame`
//     records and choose a `GridGeometry`. No image is touched until `assemble`, which
//     runs on a worker, off the watcher's path.
// 2.  **Defer, never drop**: A batch never holds more frames than its layout has cells.
//     Anything that does not fit is handed back to the caller as deferred and is
//     claimed again on a later round.
// 3.  **One bad image never sinks a batch**: A frame whose image cannot be decoded gets
//     a black cell and is reported in `load_errors`. The rest of the batch proceeds.
// 4.  **Originals ride along**: The unrotated, full-resolution original of every packed
//     frame is kept for the redaction step, so nothing is decoded twice.

use crate::core_modules::frame::{Frame, Orientation};
use crate::core_modules::geometry::GridGeometry;
use crate::core_modules::utils::image_helper;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("batch holds {frames} frames but the layout has {capacity} cells")]
    Overfull { frames: usize, capacity: usize },
    #[error("expected {expected} source paths, got {actual}")]
    SourceMismatch { expected: usize, actual: usize },
}

/// An ordered group of frames sharing one inference call.
#[derive(Debug, Clone)]
pub struct Batch {
    pub frames: Vec<Frame>,
    pub geometry: GridGeometry,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of cells left black because no frame occupies them.
    pub fn empty_cells(&self) -> usize {
        self.geometry.capacity().saturating_sub(self.frames.len())
    }
}

/// The packed model input of one batch plus what the later stages need from it.
pub struct AssembledBatch {
    /// `model_size x model_size` canvas, cells filled row by row.
    pub canvas: RgbImage,
    /// Original image per cell. `None` for empty cells and for frames that failed to load.
    pub originals: Vec<Option<RgbImage>>,
    /// `(cell index, message)` for every frame whose image could not be loaded.
    pub load_errors: Vec<(usize, String)>,
    /// Wall time spent decoding and packing.
    pub elapsed: Duration,
}

/// Groups frames into batches and packs them into model inputs.
pub struct GridManager {
    /// Canonical frame width in pixels.
    frame_width: u32,
    /// Canonical frame height in pixels.
    frame_height: u32,
    /// Largest square grid side the model accepts.
    max_dimension: u32,
    /// Whether two-frame batches use the stacked 1x2 layout.
    pair_layout: bool,
}

impl GridManager {
    pub fn new(frame_width: u32, frame_height: u32, max_dimension: u32, pair_layout: bool) -> Self {
        Self {
            frame_width,
            frame_height,
            max_dimension: max_dimension.max(1),
            pair_layout,
        }
    }

    /// The most frames any single batch can hold.
    pub fn max_capacity(&self) -> usize {
        (self.max_dimension * self.max_dimension) as usize
    }

    pub fn geometry_for(&self, count: usize) -> GridGeometry {
        GridGeometry::for_batch(
            count,
            self.max_dimension,
            self.pair_layout,
            self.frame_width,
            self.frame_height,
        )
    }

    /// Builds one batch from the front of `frames`. Frames beyond the chosen layout's
    /// capacity, or beyond `max_dimension²`, are returned as deferred in their original
    /// order.
    pub fn plan(&self, mut frames: Vec<Frame>) -> (Batch, Vec<Frame>) {
        let geometry = self.geometry_for(frames.len());
        let capacity = geometry.capacity().min(self.max_capacity());
        let deferred = if frames.len() > capacity {
            frames.split_off(capacity)
        } else {
            Vec::new()
        };
        (Batch { frames, geometry }, deferred)
    }

    /// Splits claimed frames into consecutive batches of at most `batch_size` frames.
    /// The last batch may be smaller and gets the smallest layout that fits it.
    pub fn partition(&self, frames: Vec<Frame>, batch_size: usize) -> (Vec<Batch>, Vec<Frame>) {
        let batch_size = batch_size.clamp(1, self.max_capacity());
        let mut batches = Vec::with_capacity(frames.len().div_ceil(batch_size));
        let mut deferred = Vec::new();
        let mut remaining = frames.into_iter().peekable();
        while remaining.peek().is_some() {
            let chunk: Vec<Frame> = remaining.by_ref().take(batch_size).collect();
            let (batch, overflow) = self.plan(chunk);
            batches.push(batch);
            deferred.extend(overflow);
        }
        (batches, deferred)
    }

    /// Loads every frame of `batch` from `sources` and packs it into a square canvas of
    /// side `model_size`.
    pub fn assemble(
        &self,
        batch: &Batch,
        sources: &[PathBuf],
        model_size: u32,
    ) -> Result<AssembledBatch, AssemblyError> {
        let geometry = batch.geometry;
        if batch.len() > geometry.capacity() {
            return Err(AssemblyError::Overfull {
                frames: batch.len(),
                capacity: geometry.capacity(),
            });
        }
        if sources.len() != batch.len() {
            return Err(AssemblyError::SourceMismatch {
                expected: batch.len(),
                actual: sources.len(),
            });
        }

        let start = Instant::now();
        let mut canvas = RgbImage::new(model_size, model_size);
        let mut originals: Vec<Option<RgbImage>> = vec![None; geometry.capacity()];
        let mut load_errors = Vec::new();
        let (cell_w, cell_h) = geometry.cell_pixel_size(model_size);

        for (index, (frame, source)) in batch.frames.iter().zip(sources).enumerate() {
            let original = match image_helper::load_rgb(source) {
                Ok(image) => image,
                Err(e) => {
                    load_errors.push((index, format!("failed to load {}: {e}", source.display())));
                    continue;
                }
            };

            let mut cell = imageops::resize(&original, cell_w, cell_h, FilterType::Nearest);
            if frame.orientation == Orientation::UpsideDown {
                imageops::rotate180_in_place(&mut cell);
            }
            let (x, y) = geometry.cell_pixel_origin(index, model_size);
            imageops::replace(&mut canvas, &cell, x as i64, y as i64);
            originals[index] = Some(original);
        }

        Ok(AssembledBatch {
            canvas,
            originals,
            load_errors,
            elapsed: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::utils::image_helper::save_png;
    use image::Rgb;
    use std::path::Path;

    fn frame(name: &str, orientation: Orientation) -> Frame {
        Frame {
            name: name.to_string(),
            storage_dir: PathBuf::from("/data"),
            speed: 0.0,
            orientation,
            captured_at_ms: 0,
        }
    }

    fn frames(n: usize) -> Vec<Frame> {
        (0..n).map(|i| frame(&format!("{i}.jpg"), Orientation::Upright)).collect()
    }

    fn solid(dir: &Path, name: &str, color: [u8; 3]) -> PathBuf {
        let path = dir.join(name);
        save_png(&path, &RgbImage::from_pixel(40, 20, Rgb(color))).expect("save");
        path
    }

    #[test]
    fn five_frames_plan_into_a_three_by_three_grid() {
        let manager = GridManager::new(2028, 1024, 3, true);
        let (batch, deferred) = manager.plan(frames(5));
        assert_eq!(batch.geometry.dimension(), 3);
        assert_eq!(batch.len(), 5);
        assert_eq!(batch.empty_cells(), 4);
        assert!(deferred.is_empty());
    }

    #[test]
    fn frames_beyond_the_maximum_grid_are_deferred_in_order() {
        let manager = GridManager::new(2028, 1024, 2, true);
        let (batch, deferred) = manager.plan(frames(7));
        assert_eq!(batch.geometry.capacity(), 4);
        let names: Vec<&str> = deferred.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["4.jpg", "5.jpg", "6.jpg"]);
    }

    #[test]
    fn partition_keeps_every_frame() {
        let manager = GridManager::new(2028, 1024, 3, true);
        let (batches, deferred) = manager.partition(frames(11), 4);
        assert!(deferred.is_empty());
        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, [4, 4, 3]);
        assert_eq!(batches[2].geometry.capacity(), 4);

        let (pairs, _) = manager.partition(frames(3), 2);
        assert_eq!(pairs[0].geometry, GridGeometry::stacked_pair(2028, 1024));
        assert_eq!(pairs[1].geometry, GridGeometry::stacked_pair(2028, 1024));
        assert_eq!(pairs[1].empty_cells(), 1);
    }

    #[test]
    fn a_single_grid_model_takes_one_frame_per_batch() {
        let manager = GridManager::new(2028, 1024, 1, true);
        let (batch, deferred) = manager.plan(frames(2));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.geometry.dimension(), 1);
        assert_eq!(deferred.len(), 1);
    }

    #[test]
    fn a_single_frame_is_letterboxed_into_the_top_half() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("white.png");
        save_png(&path, &RgbImage::from_pixel(2028, 1024, Rgb([255, 255, 255]))).expect("save");
        let manager = GridManager::new(2028, 1024, 3, true);
        let (batch, _) = manager.plan(vec![frame("white.png", Orientation::Upright)]);
        assert_eq!((batch.geometry.columns, batch.geometry.rows), (1, 2));

        let assembled = manager.assemble(&batch, &[path], 640).expect("assemble");
        let canvas = &assembled.canvas;
        assert_eq!(canvas.get_pixel(320, 100).0, [255, 255, 255]);
        assert_eq!(canvas.get_pixel(639, 319).0, [255, 255, 255]);
        assert_eq!(canvas.get_pixel(320, 600).0, [0, 0, 0]);
        assert_eq!(canvas.get_pixel(0, 320).0, [0, 0, 0]);
        let lit = canvas.pixels().filter(|p| p.0 != [0, 0, 0]).count();
        assert_eq!(lit, 640 * 320);
        assert!(assembled.originals[1].is_none());
    }

    #[test]
    fn assemble_packs_cells_and_zero_fills_the_rest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let red = solid(dir.path(), "red.png", [255, 0, 0]);
        let green = solid(dir.path(), "green.png", [0, 255, 0]);
        let manager = GridManager::new(2028, 1024, 3, true);
        let (batch, _) = manager.plan(frames(5));
        let sources = vec![red.clone(), green, red.clone(), red.clone(), red];

        let assembled = manager.assemble(&batch, &sources, 90).expect("assemble");
        assert_eq!(assembled.canvas.dimensions(), (90, 90));
        assert_eq!(assembled.canvas.get_pixel(5, 5).0, [255, 0, 0]);
        assert_eq!(assembled.canvas.get_pixel(35, 5).0, [0, 255, 0]);
        // Cell 8 (bottom right) has no frame.
        assert_eq!(assembled.canvas.get_pixel(85, 85).0, [0, 0, 0]);
        assert_eq!(assembled.originals.len(), 9);
        assert!(assembled.originals[4].is_some());
        assert!(assembled.originals[5].is_none());
        assert!(assembled.load_errors.is_empty());
    }

    #[test]
    fn unreadable_frames_become_black_cells() {
        let dir = tempfile::tempdir().expect("tempdir");
        let red = solid(dir.path(), "red.png", [255, 0, 0]);
        let manager = GridManager::new(2028, 1024, 3, false);
        let (batch, _) = manager.plan(frames(2));
        let sources = vec![dir.path().join("missing.jpg"), red];

        let assembled = manager.assemble(&batch, &sources, 64).expect("assemble");
        assert_eq!(assembled.load_errors.len(), 1);
        assert_eq!(assembled.load_errors[0].0, 0);
        assert_eq!(assembled.canvas.get_pixel(2, 2).0, [0, 0, 0]);
        assert_eq!(assembled.canvas.get_pixel(40, 2).0, [255, 0, 0]);
        assert!(assembled.originals[0].is_none());
    }

    #[test]
    fn upside_down_frames_are_rotated_in_their_cell() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("split.png");
        let image = RgbImage::from_fn(40, 20, |x, _| if x < 20 { Rgb([255, 255, 255]) } else { Rgb([0, 0, 255]) });
        save_png(&path, &image).expect("save");

        let manager = GridManager::new(2028, 1024, 1, true);
        let (batch, _) = manager.plan(vec![frame("split.png", Orientation::UpsideDown)]);
        let assembled = manager.assemble(&batch, &[path], 40).expect("assemble");
        assert_eq!(assembled.canvas.get_pixel(2, 10).0, [0, 0, 255]);
        assert_eq!(assembled.canvas.get_pixel(38, 10).0, [255, 255, 255]);
        assert_eq!(assembled.canvas.get_pixel(20, 30).0, [0, 0, 0]);
        // The kept original stays unrotated.
        let original = assembled.originals[0].as_ref().expect("original");
        assert_eq!(original.get_pixel(2, 2).0, [255, 255, 255]);
    }

    #[test]
    fn mismatched_sources_are_rejected() {
        let manager = GridManager::new(2028, 1024, 3, true);
        let (batch, _) = manager.plan(frames(2));
        assert!(matches!(
            manager.assemble(&batch, &[], 64),
            Err(AssemblyError::SourceMismatch { expected: 2, actual: 0 })
        ));
    }
}
