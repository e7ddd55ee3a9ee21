// THEORY:
// The `geometry` module is the single source of truth for every coordinate transform
// in the pipeline. A batch of frames is packed into one square model input, the model
// answers in its own coordinate convention, and each answer has to find its way back
// to the pixel grid of the frame it came from.
//
// Three coordinate spaces exist:
// 1.  **Original space**: pixels of one canonical frame (`frame_width x frame_height`).
// 2.  **Canvas space**: the whole packed model input, scaled so that it spans
//     `frame_width x frame_height` units. A cell of a `columns x rows` grid therefore
//     spans `frame_width / columns x frame_height / rows` units.
// 3.  **Model space**: whatever the network emits (normalized or input-pixel center
//     boxes). `encode` is the only bridge from model space into canvas space.
//
// Key architectural principles:
// 1.  **One parameterized layout**: `GridGeometry` covers the single frame, the stacked
//     pair and every square grid with the same formulas. There is no per-layout math.
// 2.  **Pure functions**: Nothing here performs I/O or holds state, so every transform
//     can be checked in isolation.
// 3.  **Clamp at the edge**: `to_original_space` floors and clamps, so downstream code
//     can index pixels without re-validating boxes.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Axis-aligned box in corner form. Which space it lives in depends on the caller.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f32 {
        (self.x1 - self.x0).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y1 - self.y0).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }

    /// Intersection over union. Degenerate boxes never overlap anything.
    pub fn iou(&self, other: &Self) -> f32 {
        let ix0 = self.x0.max(other.x0);
        let iy0 = self.y0.max(other.y0);
        let ix1 = self.x1.min(other.x1);
        let iy1 = self.y1.min(other.y1);
        let intersection = (ix1 - ix0).max(0.0) * (iy1 - iy0).max(0.0);
        if intersection <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 { 0.0 } else { intersection / union }
    }

    /// Scales both axes independently, e.g. from canonical to actual image resolution.
    pub fn scaled(&self, scale_x: f32, scale_y: f32) -> Self {
        Self::new(
            self.x0 * scale_x,
            self.y0 * scale_y,
            self.x1 * scale_x,
            self.y1 * scale_y,
        )
    }

    /// Converts the box to a half-open pixel rectangle inside a `width x height` image.
    /// Returns `None` when nothing of the box survives clamping.
    pub fn to_pixel_rect(&self, width: u32, height: u32) -> Option<PixelRect> {
        let x0 = self.x0.floor().clamp(0.0, width as f32) as u32;
        let y0 = self.y0.floor().clamp(0.0, height as f32) as u32;
        let x1 = self.x1.ceil().clamp(0.0, width as f32) as u32;
        let y1 = self.y1.ceil().clamp(0.0, height as f32) as u32;
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(PixelRect {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        })
    }
}

/// Integer pixel rectangle, half-open on the right and bottom edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }
}

/// A raw model box in center form, normalized to the packed canvas (`0.0..=1.0`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CenterBox {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

/// Converts a normalized center box into corner form scaled to a canvas of
/// `canvas_width x canvas_height` units.
pub fn encode(raw: CenterBox, canvas_width: f32, canvas_height: f32) -> BoundingBox {
    BoundingBox::new(
        (raw.cx - raw.w / 2.0) * canvas_width,
        (raw.cy - raw.h / 2.0) * canvas_height,
        (raw.cx + raw.w / 2.0) * canvas_width,
        (raw.cy + raw.h / 2.0) * canvas_height,
    )
}

/// Finds the grid cell holding the center of `bbox`. Centers outside the canvas are
/// attributed to the nearest edge cell.
pub fn cell_index(bbox: &BoundingBox, cell_width: f32, cell_height: f32, columns: u32, rows: u32) -> usize {
    let (cx, cy) = bbox.center();
    let column = ((cx / cell_width).floor().max(0.0) as u32).min(columns.saturating_sub(1));
    let row = ((cy / cell_height).floor().max(0.0) as u32).min(rows.saturating_sub(1));
    (row * columns + column) as usize
}

/// Undoes the grid placement of a canvas-space box: subtracts the cell offset, scales by
/// the layout's per-axis factor, floors to whole pixels and clamps to the frame.
pub fn to_original_space(
    bbox: &BoundingBox,
    cell_offset: (f32, f32),
    scale: (f32, f32),
    frame_width: u32,
    frame_height: u32,
) -> BoundingBox {
    let map_x = |x: f32| ((x - cell_offset.0) * scale.0).floor().clamp(0.0, frame_width as f32);
    let map_y = |y: f32| ((y - cell_offset.1) * scale.1).floor().clamp(0.0, frame_height as f32);
    BoundingBox::new(map_x(bbox.x0), map_y(bbox.y0), map_x(bbox.x1), map_y(bbox.y1))
}

/// Reflects a box through the frame center, matching a 180° rotation of the image.
pub fn rotate180(bbox: &BoundingBox, frame_width: u32, frame_height: u32) -> BoundingBox {
    let w = frame_width as f32;
    let h = frame_height as f32;
    BoundingBox::new(w - bbox.x1, h - bbox.y1, w - bbox.x0, h - bbox.y0)
}

/// Greedy non-max suppression. Returns the indices of the surviving boxes, highest score
/// first. Equal scores keep their input order.
pub fn nms(boxes: &[BoundingBox], scores: &[f32], iou_threshold: f32) -> Vec<usize> {
    let count = boxes.len().min(scores.len());
    let mut order: Vec<usize> = (0..count).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    });

    let mut keep: Vec<usize> = Vec::with_capacity(count);
    for candidate in order {
        if keep
            .iter()
            .all(|&kept| boxes[kept].iou(&boxes[candidate]) <= iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}

/// Smallest square grid side `d` with `d * d >= count`, never above `max_dimension`.
pub fn select_dimension(count: usize, max_dimension: u32) -> u32 {
    let max_dimension = max_dimension.max(1);
    let mut dimension = 1u32;
    while ((dimension * dimension) as usize) < count && dimension < max_dimension {
        dimension += 1;
    }
    dimension
}

/// Packing layout of one batch. Derived from the batch size and the canonical frame
/// resolution, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridGeometry {
    /// Number of cells across the canvas.
    pub columns: u32,
    /// Number of cells down the canvas.
    pub rows: u32,
    /// Canonical frame width in pixels.
    pub frame_width: u32,
    /// Canonical frame height in pixels.
    pub frame_height: u32,
}

impl GridGeometry {
    /// A `dimension x dimension` grid.
    pub fn square(dimension: u32, frame_width: u32, frame_height: u32) -> Self {
        let dimension = dimension.max(1);
        Self {
            columns: dimension,
            rows: dimension,
            frame_width,
            frame_height,
        }
    }

    /// The `1 x 2` layout: frames stacked vertically, each taking half the canvas. A lone
    /// frame sits in the top cell so its 2:1 aspect survives the square model input.
    pub fn stacked_pair(frame_width: u32, frame_height: u32) -> Self {
        Self {
            columns: 1,
            rows: 2,
            frame_width,
            frame_height,
        }
    }

    /// Chooses the layout for a batch of `count` frames.
    pub fn for_batch(
        count: usize,
        max_dimension: u32,
        pair_layout: bool,
        frame_width: u32,
        frame_height: u32,
    ) -> Self {
        if count == 2 && pair_layout && max_dimension >= 2 {
            return Self::stacked_pair(frame_width, frame_height);
        }
        match select_dimension(count, max_dimension) {
            1 => Self::stacked_pair(frame_width, frame_height),
            dimension => Self::square(dimension, frame_width, frame_height),
        }
    }

    pub fn capacity(&self) -> usize {
        (self.columns * self.rows) as usize
    }

    /// Grid dimension: the square side, or 1 for the stacked layout.
    pub fn dimension(&self) -> u32 {
        self.columns
    }

    /// Cell width in canvas units.
    pub fn cell_width(&self) -> f32 {
        self.frame_width as f32 / self.columns as f32
    }

    /// Cell height in canvas units.
    pub fn cell_height(&self) -> f32 {
        self.frame_height as f32 / self.rows as f32
    }

    /// Top-left corner of cell `index` in canvas units. Cells fill row by row.
    pub fn cell_offset(&self, index: usize) -> (f32, f32) {
        let column = index as u32 % self.columns;
        let row = index as u32 / self.columns;
        (column as f32 * self.cell_width(), row as f32 * self.cell_height())
    }

    pub fn cell_offsets(&self) -> Vec<(f32, f32)> {
        (0..self.capacity()).map(|i| self.cell_offset(i)).collect()
    }

    /// Per-axis factor between canvas units inside a cell and original pixels.
    pub fn scale(&self) -> (f32, f32) {
        (self.columns as f32, self.rows as f32)
    }

    /// Pixel size of one cell on a square model input of side `model_size`.
    pub fn cell_pixel_size(&self, model_size: u32) -> (u32, u32) {
        (
            (model_size / self.columns).max(1),
            (model_size / self.rows).max(1),
        )
    }

    /// Pixel origin of cell `index` on a square model input of side `model_size`.
    pub fn cell_pixel_origin(&self, index: usize, model_size: u32) -> (u32, u32) {
        let (cell_w, cell_h) = self.cell_pixel_size(model_size);
        let column = index as u32 % self.columns;
        let row = index as u32 / self.columns;
        (column * cell_w, row * cell_h)
    }

    /// Converts a normalized model box into canvas units.
    pub fn encode(&self, raw: CenterBox) -> BoundingBox {
        encode(raw, self.frame_width as f32, self.frame_height as f32)
    }

    pub fn cell_index(&self, bbox: &BoundingBox) -> usize {
        cell_index(bbox, self.cell_width(), self.cell_height(), self.columns, self.rows)
    }

    /// Maps a canvas-space box from cell `index` back to original frame pixels.
    pub fn to_original_space(&self, bbox: &BoundingBox, index: usize) -> BoundingBox {
        to_original_space(
            bbox,
            self.cell_offset(index),
            self.scale(),
            self.frame_width,
            self.frame_height,
        )
    }

    /// Places an original-space box into cell `index` of the canvas. Inverse of
    /// `to_original_space` up to flooring.
    pub fn from_original_space(&self, bbox: &BoundingBox, index: usize) -> BoundingBox {
        let (ox, oy) = self.cell_offset(index);
        let (sx, sy) = self.scale();
        BoundingBox::new(bbox.x0 / sx + ox, bbox.y0 / sy + oy, bbox.x1 / sx + ox, bbox.y1 / sy + oy)
    }
}

/// Domain-specific false-positive rules applied to boxes in original space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionFilter {
    /// Boxes wider than this fraction of the frame are suspicious...
    pub wide_box_ratio: f32,
    /// ...when their top edge lies below this fraction of the frame height (the hood).
    pub horizon_ratio: f32,
    /// Boxes covering more than this fraction of the frame area are suspicious...
    pub large_box_area_ratio: f32,
    /// ...when their score is less than this far above the confidence threshold.
    pub low_confidence_margin: f32,
}

impl Default for DetectionFilter {
    fn default() -> Self {
        Self {
            wide_box_ratio: 0.8,
            horizon_ratio: 0.5,
            large_box_area_ratio: 0.17,
            low_confidence_margin: 0.2,
        }
    }
}

impl DetectionFilter {
    pub fn rejects(
        &self,
        bbox: &BoundingBox,
        score: f32,
        conf_threshold: f32,
        frame_width: u32,
        frame_height: u32,
    ) -> bool {
        let fw = frame_width as f32;
        let fh = frame_height as f32;
        let on_the_hood = bbox.width() > self.wide_box_ratio * fw && bbox.y0 > self.horizon_ratio * fh;
        let large_and_weak =
            bbox.area() > self.large_box_area_ratio * fw * fh && score < conf_threshold + self.low_confidence_margin;
        on_the_hood || large_and_weak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u32 = 2028;
    const H: u32 = 1024;

    fn layouts() -> Vec<GridGeometry> {
        vec![
            GridGeometry::stacked_pair(W, H),
            GridGeometry::square(2, W, H),
            GridGeometry::square(3, W, H),
            GridGeometry::square(4, W, H),
        ]
    }

    #[test]
    fn dimension_is_minimal_and_capped() {
        for max in 1..=4u32 {
            for n in 0..=20usize {
                let d = select_dimension(n, max);
                assert!(d <= max);
                if (max * max) as usize >= n {
                    assert!((d * d) as usize >= n, "n={n} d={d}");
                    if d > 1 {
                        assert!((((d - 1) * (d - 1)) as usize) < n, "n={n} d={d} not minimal");
                    }
                } else {
                    assert_eq!(d, max);
                }
            }
        }
    }

    #[test]
    fn five_frames_resolve_to_three_by_three() {
        let geometry = GridGeometry::for_batch(5, 3, true, W, H);
        assert_eq!(geometry.dimension(), 3);
        assert_eq!(geometry.capacity(), 9);
    }

    #[test]
    fn two_frames_use_the_stacked_pair_when_enabled() {
        assert_eq!(GridGeometry::for_batch(2, 3, true, W, H), GridGeometry::stacked_pair(W, H));
        assert_eq!(GridGeometry::for_batch(2, 3, false, W, H), GridGeometry::square(2, W, H));
        assert_eq!(GridGeometry::for_batch(2, 1, true, W, H), GridGeometry::stacked_pair(W, H));
    }

    #[test]
    fn a_single_frame_takes_the_top_half_of_the_stacked_layout() {
        for pair_layout in [true, false] {
            for max in 1..=4 {
                let geometry = GridGeometry::for_batch(1, max, pair_layout, W, H);
                assert_eq!(geometry, GridGeometry::stacked_pair(W, H));
                assert_eq!(geometry.dimension(), 1);
            }
        }
        let geometry = GridGeometry::for_batch(1, 3, true, W, H);
        assert_eq!(geometry.cell_pixel_size(640), (640, 320));
        assert_eq!(geometry.cell_pixel_origin(1, 640), (0, 320));
        // Original pixels map 1:1 horizontally and 2:1 vertically.
        assert_eq!(geometry.scale(), (1.0, 2.0));
    }

    #[test]
    fn cell_zero_box_scales_by_three_and_clips() {
        let geometry = GridGeometry::square(3, W, H);
        let bbox = BoundingBox::new(100.0, 100.0, 200.0, 200.0);
        assert_eq!(geometry.cell_index(&bbox), 0);
        let original = geometry.to_original_space(&bbox, 0);
        assert_eq!(original, BoundingBox::new(300.0, 300.0, 600.0, 600.0));

        let overflowing = BoundingBox::new(600.0, 250.0, 700.0, 400.0);
        let clipped = to_original_space(&overflowing, (0.0, 0.0), geometry.scale(), W, H);
        assert_eq!(clipped, BoundingBox::new(1800.0, 750.0, W as f32, H as f32));
    }

    #[test]
    fn round_trip_through_every_cell_of_every_layout() {
        let originals = [
            BoundingBox::new(100.0, 50.0, 400.0, 300.0),
            BoundingBox::new(0.0, 0.0, 2028.0, 1024.0),
            BoundingBox::new(1500.0, 900.0, 1700.0, 1020.0),
        ];
        for geometry in layouts() {
            for index in 0..geometry.capacity() {
                for original in &originals {
                    let canvas = geometry.from_original_space(original, index);
                    let (cx, cy) = canvas.center();
                    let raw = CenterBox {
                        cx: cx / W as f32,
                        cy: cy / H as f32,
                        w: canvas.width() / W as f32,
                        h: canvas.height() / H as f32,
                    };
                    let encoded = geometry.encode(raw);
                    assert_eq!(geometry.cell_index(&encoded), index);
                    let back = geometry.to_original_space(&encoded, index);
                    for (a, b) in [
                        (back.x0, original.x0),
                        (back.y0, original.y0),
                        (back.x1, original.x1),
                        (back.y1, original.y1),
                    ] {
                        assert!((a - b).abs() <= 1.0, "{geometry:?} cell {index}: {back:?} vs {original:?}");
                    }
                }
            }
        }
    }

    #[test]
    fn rotate180_is_an_involution() {
        let bbox = BoundingBox::new(10.0, 20.0, 110.0, 220.0);
        let rotated = rotate180(&bbox, W, H);
        assert_eq!(rotated, BoundingBox::new(1918.0, 804.0, 2018.0, 1004.0));
        assert_eq!(rotate180(&rotated, W, H), bbox);
    }

    #[test]
    fn nms_keeps_highest_score_and_breaks_ties_by_order() {
        let boxes = vec![
            BoundingBox::new(0.0, 0.0, 100.0, 100.0),
            BoundingBox::new(5.0, 5.0, 105.0, 105.0),
            BoundingBox::new(500.0, 500.0, 600.0, 600.0),
            BoundingBox::new(2.0, 2.0, 102.0, 102.0),
        ];
        let scores = vec![0.6, 0.9, 0.5, 0.9];
        let keep = nms(&boxes, &scores, 0.5);
        assert_eq!(keep, vec![1, 2]);
    }

    #[test]
    fn nms_is_idempotent() {
        let boxes: Vec<BoundingBox> = (0..30)
            .map(|i| {
                let x = (i * 37 % 400) as f32;
                let y = (i * 53 % 300) as f32;
                BoundingBox::new(x, y, x + 80.0, y + 60.0)
            })
            .collect();
        let scores: Vec<f32> = (0..30).map(|i| ((i * 7919) % 100) as f32 / 100.0).collect();
        let first = nms(&boxes, &scores, 0.3);
        let kept_boxes: Vec<BoundingBox> = first.iter().map(|&i| boxes[i]).collect();
        let kept_scores: Vec<f32> = first.iter().map(|&i| scores[i]).collect();
        let second = nms(&kept_boxes, &kept_scores, 0.3);
        assert_eq!(second, (0..kept_boxes.len()).collect::<Vec<_>>());
    }

    #[test]
    fn filter_rejects_hood_and_large_weak_boxes() {
        let filter = DetectionFilter::default();
        let hood = BoundingBox::new(100.0, 600.0, 1900.0, 700.0);
        assert!(filter.rejects(&hood, 0.95, 0.2, W, H));

        let wide_but_high = BoundingBox::new(100.0, 100.0, 1900.0, 200.0);
        assert!(!filter.rejects(&wide_but_high, 0.95, 0.2, W, H));

        let large = BoundingBox::new(0.0, 0.0, 1000.0, 600.0);
        assert!(filter.rejects(&large, 0.3, 0.2, W, H));
        assert!(!filter.rejects(&large, 0.5, 0.2, W, H));
    }

    #[test]
    fn pixel_rect_clamps_and_drops_empty_boxes() {
        let rect = BoundingBox::new(-5.0, 10.0, 20.0, 5000.0).to_pixel_rect(100, 50).unwrap();
        assert_eq!(rect, PixelRect { x: 0, y: 10, width: 20, height: 40 });
        assert!(BoundingBox::new(200.0, 0.0, 300.0, 10.0).to_pixel_rect(100, 50).is_none());
    }
}
