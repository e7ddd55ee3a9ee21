// THEORY:
// The `OutputDecoder` turns one raw model output into per-frame detections. It is the
// only consumer of the model's tensor layout and the only place where the geometry
// transforms are chained together.
//
// Key architectural principles & algorithm steps:
// 1.  **Score**: Each prediction's class scores are reduced to the best class. Anything
//     under the confidence threshold is dropped before any geometry runs.
// 2.  **Encode**: Surviving center boxes are converted to corner form in canvas space.
// 3.  **Suppress**: Greedy NMS runs once over the whole canvas, across classes.
// 4.  **Route**: Each kept box is attributed to the cell holding its center. Boxes in
//     empty cells are discarded.
// 5.  **Restore**: The box is mapped back to original frame pixels, reflected if the
//     frame was packed rotated, and finally passed through the false-positive filter.

use crate::core_modules::frame::{Detection, Orientation};
use crate::core_modules::geometry::{self, BoundingBox, CenterBox, DetectionFilter};
use crate::core_modules::grid_manager::Batch;
use crate::engine::{BoxConvention, RawOutput};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("model output has {attributes} attributes; at least 5 are required")]
    TooFewAttributes { attributes: usize },
    #[error("model output holds {actual} values, expected {expected} for [1, {attributes}, {predictions}]")]
    ShapeMismatch {
        attributes: usize,
        predictions: usize,
        expected: usize,
        actual: usize,
    },
}

/// Decoding parameters shared by every batch a worker processes.
#[derive(Debug, Clone)]
pub struct OutputDecoder {
    pub conf_threshold: f32,
    pub nms_threshold: f32,
    pub filter: DetectionFilter,
    pub convention: BoxConvention,
    /// Side of the square model input, used to normalize pixel-convention outputs.
    pub model_size: u32,
}

struct Candidate {
    bbox: BoundingBox,
    score: f32,
    class_id: usize,
}

impl OutputDecoder {
    /// Returns one detection list per frame of `batch`, in batch order.
    pub fn decode(&self, output: &RawOutput, batch: &Batch) -> Result<Vec<Vec<Detection>>, DecodeError> {
        if output.attributes < 5 {
            return Err(DecodeError::TooFewAttributes {
                attributes: output.attributes,
            });
        }
        let expected = output.attributes * output.predictions;
        if output.data.len() != expected {
            return Err(DecodeError::ShapeMismatch {
                attributes: output.attributes,
                predictions: output.predictions,
                expected,
                actual: output.data.len(),
            });
        }

        let geometry = batch.geometry;
        let candidates = self.candidates(output, |raw| geometry.encode(raw));
        let boxes: Vec<BoundingBox> = candidates.iter().map(|c| c.bbox).collect();
        let scores: Vec<f32> = candidates.iter().map(|c| c.score).collect();
        let keep = geometry::nms(&boxes, &scores, self.nms_threshold);

        let mut per_frame: Vec<Vec<Detection>> = vec![Vec::new(); batch.len()];
        for index in keep {
            let candidate = &candidates[index];
            let cell = geometry.cell_index(&candidate.bbox);
            let Some(frame) = batch.frames.get(cell) else {
                continue;
            };

            let mut bbox = geometry.to_original_space(&candidate.bbox, cell);
            if frame.orientation == Orientation::UpsideDown {
                bbox = geometry::rotate180(&bbox, geometry.frame_width, geometry.frame_height);
            }
            if self.filter.rejects(
                &bbox,
                candidate.score,
                self.conf_threshold,
                geometry.frame_width,
                geometry.frame_height,
            ) {
                continue;
            }
            per_frame[cell].push(Detection {
                class_id: candidate.class_id,
                bbox,
                score: candidate.score,
            });
        }
        Ok(per_frame)
    }

    fn candidates<F>(&self, output: &RawOutput, encode: F) -> Vec<Candidate>
    where
        F: Fn(CenterBox) -> BoundingBox,
    {
        let norm = match self.convention {
            BoxConvention::Normalized => 1.0,
            BoxConvention::Pixels => self.model_size.max(1) as f32,
        };
        let mut candidates = Vec::new();
        for p in 0..output.predictions {
            let mut best_class = 0;
            let mut best_score = f32::MIN;
            for class in 0..output.attributes - 4 {
                let score = output.get(4 + class, p);
                if score > best_score {
                    best_score = score;
                    best_class = class;
                }
            }
            if best_score < self.conf_threshold {
                continue;
            }
            let raw = CenterBox {
                cx: output.get(0, p) / norm,
                cy: output.get(1, p) / norm,
                w: output.get(2, p) / norm,
                h: output.get(3, p) / norm,
            };
            candidates.push(Candidate {
                bbox: encode(raw),
                score: best_score,
                class_id: best_class,
            });
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::frame::Frame;
    use crate::core_modules::geometry::GridGeometry;
    use std::path::PathBuf;

    const W: u32 = 2028;
    const H: u32 = 1024;

    fn batch(count: usize, geometry: GridGeometry) -> Batch {
        Batch {
            frames: (0..count)
                .map(|i| Frame {
                    name: format!("{i}.jpg"),
                    storage_dir: PathBuf::from("/data"),
                    speed: 0.0,
                    orientation: Orientation::Upright,
                    captured_at_ms: i as i64,
                })
                .collect(),
            geometry,
        }
    }

    fn decoder(convention: BoxConvention) -> OutputDecoder {
        OutputDecoder {
            conf_threshold: 0.2,
            nms_threshold: 0.9,
            filter: DetectionFilter::default(),
            convention,
            model_size: 640,
        }
    }

    /// Builds a `[1, 4 + classes, n]` output from `(cx, cy, w, h, class scores)` rows.
    fn output(rows: &[([f32; 4], Vec<f32>)]) -> RawOutput {
        let classes = rows.first().map(|r| r.1.len()).unwrap_or(1);
        let attributes = 4 + classes;
        let predictions = rows.len();
        let mut data = vec![0.0; attributes * predictions];
        for (p, (bbox, scores)) in rows.iter().enumerate() {
            for a in 0..4 {
                data[a * predictions + p] = bbox[a];
            }
            for (c, s) in scores.iter().enumerate() {
                data[(4 + c) * predictions + p] = *s;
            }
        }
        RawOutput::new(attributes, predictions, data)
    }

    /// Normalized center box for a canvas-space corner box.
    fn normalized(b: BoundingBox) -> [f32; 4] {
        let (cx, cy) = b.center();
        [cx / W as f32, cy / H as f32, b.width() / W as f32, b.height() / H as f32]
    }

    #[test]
    fn routes_detections_to_their_frames_in_original_space() {
        let geometry = GridGeometry::square(3, W, H);
        let batch = batch(5, geometry);
        let in_cell_0 = BoundingBox::new(100.0, 100.0, 200.0, 200.0);
        let in_cell_4 = geometry.from_original_space(&BoundingBox::new(30.0, 60.0, 90.0, 120.0), 4);
        let out = output(&[
            (normalized(in_cell_0), vec![0.1, 0.8]),
            (normalized(in_cell_4), vec![0.7, 0.3]),
        ]);

        let per_frame = decoder(BoxConvention::Normalized).decode(&out, &batch).expect("decode");
        assert_eq!(per_frame.len(), 5);
        let first = per_frame[0][0];
        assert_eq!(first.class_id, 1);
        for (got, want) in [
            (first.bbox.x0, 300.0),
            (first.bbox.y0, 300.0),
            (first.bbox.x1, 600.0),
            (first.bbox.y1, 600.0),
        ] {
            assert!((got - want).abs() <= 1.0, "{:?}", first.bbox);
        }
        let fifth = per_frame[4][0];
        assert_eq!(fifth.class_id, 0);
        assert!((fifth.bbox.x0 - 30.0).abs() <= 1.0 && (fifth.bbox.y1 - 120.0).abs() <= 1.0);
        assert!(per_frame[1].is_empty());
    }

    #[test]
    fn boxes_in_empty_cells_and_below_threshold_are_dropped() {
        let geometry = GridGeometry::square(3, W, H);
        let batch = batch(5, geometry);
        let in_cell_8 = geometry.from_original_space(&BoundingBox::new(10.0, 10.0, 50.0, 50.0), 8);
        let weak = BoundingBox::new(10.0, 10.0, 50.0, 50.0);
        let out = output(&[(normalized(in_cell_8), vec![0.9]), (normalized(weak), vec![0.1])]);
        let per_frame = decoder(BoxConvention::Normalized).decode(&out, &batch).expect("decode");
        assert!(per_frame.iter().all(Vec::is_empty));
    }

    #[test]
    fn pixel_convention_is_normalized_by_model_size() {
        let geometry = GridGeometry::stacked_pair(W, H);
        let batch = batch(1, geometry);
        // Centered in the top half of a 640 input, a quarter of its size.
        let out = output(&[([320.0, 160.0, 160.0, 160.0], vec![0.9])]);
        let per_frame = decoder(BoxConvention::Pixels).decode(&out, &batch).expect("decode");
        let d = per_frame[0][0];
        assert_eq!(d.bbox, BoundingBox::new(760.0, 256.0, 1267.0, 768.0));
    }

    #[test]
    fn single_frame_layout_round_trips_and_ignores_the_empty_half() {
        let geometry = GridGeometry::stacked_pair(W, H);
        let batch = batch(1, geometry);
        let original = BoundingBox::new(400.0, 300.0, 700.0, 500.0);
        let in_frame = geometry.from_original_space(&original, 0);
        let in_padding = geometry.from_original_space(&original, 1);
        let out = output(&[(normalized(in_frame), vec![0.9]), (normalized(in_padding), vec![0.95])]);

        let per_frame = decoder(BoxConvention::Normalized).decode(&out, &batch).expect("decode");
        assert_eq!(per_frame.len(), 1);
        assert_eq!(per_frame[0].len(), 1);
        let bbox = per_frame[0][0].bbox;
        for (got, want) in [
            (bbox.x0, original.x0),
            (bbox.y0, original.y0),
            (bbox.x1, original.x1),
            (bbox.y1, original.y1),
        ] {
            assert!((got - want).abs() <= 1.0, "{bbox:?}");
        }
    }

    #[test]
    fn upside_down_frames_get_reflected_boxes() {
        let geometry = GridGeometry::stacked_pair(W, H);
        let mut batch = batch(1, geometry);
        batch.frames[0].orientation = Orientation::UpsideDown;
        let in_cell = geometry.from_original_space(&BoundingBox::new(100.0, 100.0, 200.0, 300.0), 0);
        let out = output(&[(normalized(in_cell), vec![0.9])]);
        let per_frame = decoder(BoxConvention::Normalized).decode(&out, &batch).expect("decode");
        let bbox = per_frame[0][0].bbox;
        assert!((bbox.x0 - 1828.0).abs() <= 1.0);
        assert!((bbox.y0 - 724.0).abs() <= 1.0);
    }

    #[test]
    fn hood_artifacts_are_filtered() {
        let geometry = GridGeometry::stacked_pair(W, H);
        let batch = batch(1, geometry);
        let hood = geometry.from_original_space(&BoundingBox::new(50.0, 700.0, 2000.0, 1000.0), 0);
        let out = output(&[(normalized(hood), vec![0.99])]);
        let per_frame = decoder(BoxConvention::Normalized).decode(&out, &batch).expect("decode");
        assert!(per_frame[0].is_empty());
    }

    #[test]
    fn malformed_outputs_are_rejected() {
        let batch = batch(1, GridGeometry::stacked_pair(W, H));
        let short = RawOutput::new(4, 1, vec![0.0; 4]);
        assert_eq!(
            decoder(BoxConvention::Normalized).decode(&short, &batch),
            Err(DecodeError::TooFewAttributes { attributes: 4 })
        );
        let truncated = RawOutput::new(5, 2, vec![0.0; 7]);
        assert!(matches!(
            decoder(BoxConvention::Normalized).decode(&truncated, &batch),
            Err(DecodeError::ShapeMismatch { expected: 10, actual: 7, .. })
        ));
    }

    #[test]
    fn empty_output_yields_empty_lists() {
        let batch = batch(4, GridGeometry::square(2, W, H));
        let per_frame = decoder(BoxConvention::Normalized)
            .decode(&RawOutput::empty(1), &batch)
            .expect("decode");
        assert_eq!(per_frame, vec![Vec::<Detection>::new(); 4]);
    }
}
