//! Face detection.
//!
//! [`FaceDetector`] is the capability the session depends on. [`ScrfdDetector`]
//! implements it with the SCRFD ONNX model: 3-stride anchor decoding followed
//! by neighbor-vote grouping controlled by [`DetectionConfig`].

use crate::alignment::sample_bilinear;
use crate::types::{FaceBox, Frame};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_SCORE_THRESHOLD: f32 = 0.5;
const SCRFD_GROUP_IOU: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("invalid detection config: {0}")]
    InvalidConfig(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates faces in a frame.
///
/// Implementations must return the same boxes in the same order for
/// identical input. No faces is an empty vector, not an error.
pub trait FaceDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceBox>, DetectorError>;
}

/// Detection tuning shared by all detector implementations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Boxes whose shorter side is below this many pixels are dropped.
    pub min_size: f32,
    /// Largest size ratio at which two raw candidates still vote for each other.
    pub scale_factor: f32,
    /// Raw candidates (including itself) a box needs to be kept.
    pub min_neighbors: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_size: 30.0,
            scale_factor: 1.3,
            min_neighbors: 2,
        }
    }
}

impl DetectionConfig {
    pub fn validate(&self) -> Result<(), DetectorError> {
        if !(self.min_size >= 0.0) {
            return Err(DetectorError::InvalidConfig(format!(
                "min_size must be >= 0, got {}",
                self.min_size
            )));
        }
        if !(self.scale_factor > 1.0) {
            return Err(DetectorError::InvalidConfig(format!(
                "scale_factor must be > 1.0, got {}",
                self.scale_factor
            )));
        }
        if self.min_neighbors < 1 {
            return Err(DetectorError::InvalidConfig(
                "min_neighbors must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize, target: usize) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((target as f32 - new_w) / 2.0).floor(),
            pad_y: ((target as f32 - new_h) / 2.0).floor(),
        }
    }

    fn to_frame(&self, (x, y): (f32, f32)) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputs = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    config: DetectionConfig,
    stride_outputs: [StrideOutputs; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model. Fails on a missing model or invalid config.
    pub fn load(model_path: &str, config: DetectionConfig) -> Result<Self, DetectorError> {
        config.validate()?;
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_outputs = map_stride_outputs(&output_names);
        tracing::info!(
            path = model_path,
            outputs = ?output_names,
            ?stride_outputs,
            min_size = config.min_size,
            scale_factor = config.scale_factor,
            min_neighbors = config.min_neighbors,
            "loaded SCRFD model"
        );

        Ok(Self {
            session,
            config,
            stride_outputs,
        })
    }

    /// Letterbox the frame into a normalized NCHW tensor.
    fn preprocess(frame: &Frame) -> (Array4<f32>, Letterbox) {
        let size = SCRFD_INPUT_SIZE;
        let letterbox = Letterbox::fit(frame.width as usize, frame.height as usize, size);
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for y in 0..size {
            for x in 0..size {
                let (sx, sy) = letterbox.to_frame((x as f32 + 0.5, y as f32 + 0.5));
                let inside = sx >= 0.0 && sy >= 0.0 && sx < frame.width as f32 && sy < frame.height as f32;
                // Padding at the mean normalizes to 0.0.
                let pixel = if inside {
                    sample_bilinear(frame, sx - 0.5, sy - 0.5)
                } else {
                    SCRFD_MEAN
                };
                let normalized = (pixel - SCRFD_MEAN) / SCRFD_STD;
                tensor[[0, 0, y, x]] = normalized;
                tensor[[0, 1, y, x]] = normalized;
                tensor[[0, 2, y, x]] = normalized;
            }
        }

        (tensor, letterbox)
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceBox>, DetectorError> {
        if frame.width == 0 || frame.height == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = Self::preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_outputs[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let tensors = StrideTensors {
                scores: extract(score_idx, "scores")?,
                bboxes: extract(bbox_idx, "bboxes")?,
                kps: extract(kps_idx, "kps")?,
            };
            candidates.extend(decode_stride(&tensors, stride, &letterbox));
        }

        let raw = candidates.len();
        let faces = group_candidates(candidates, &self.config);
        tracing::trace!(raw, kept = faces.len(), seq = frame.sequence, "SCRFD detections");
        Ok(faces)
    }
}

/// Map output tensors to stride slots.
///
/// Exports named "score_8", "bbox_16", "kps_32", ... are matched by name;
/// anything else uses the standard positional layout
/// [scores 8/16/32, bboxes 8/16/32, kps 8/16/32].
fn map_stride_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(v) if v.len() == 3 => [v[0], v[1], v[2]],
        _ => [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
    }
}

struct StrideTensors<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// Decode candidates above the score threshold for one stride level.
fn decode_stride(t: &StrideTensors<'_>, stride: usize, letterbox: &Letterbox) -> Vec<FaceBox> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut candidates = Vec::new();
    for idx in 0..num_anchors {
        let score = t.scores.get(idx).copied().unwrap_or(0.0);
        if score <= SCRFD_SCORE_THRESHOLD {
            continue;
        }
        let Some(offsets) = t.bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid_w) as f32 * s;
        let ay = (cell / grid_w) as f32 * s;

        let (x1, y1) = letterbox.to_frame((ax - offsets[0] * s, ay - offsets[1] * s));
        let (x2, y2) = letterbox.to_frame((ax + offsets[2] * s, ay + offsets[3] * s));

        let keypoints = t.kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| letterbox.to_frame((ax + k[i * 2] * s, ay + k[i * 2 + 1] * s)))
        });

        candidates.push(FaceBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            keypoints,
        });
    }
    candidates
}

/// Deterministic ordering: confidence descending, then top-left position.
fn by_confidence(a: &FaceBox, b: &FaceBox) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then(a.x.total_cmp(&b.x))
        .then(a.y.total_cmp(&b.y))
}

/// Group overlapping raw candidates into faces.
///
/// The strongest candidate of each overlapping cluster survives; the others
/// are suppressed and count as its neighbors when their size is within
/// `scale_factor`. Clusters with fewer than `min_neighbors` votes, or whose
/// survivor is smaller than `min_size`, are dropped.
fn group_candidates(mut candidates: Vec<FaceBox>, config: &DetectionConfig) -> Vec<FaceBox> {
    candidates.sort_by(by_confidence);

    let mut suppressed = vec![false; candidates.len()];
    let mut faces = Vec::new();

    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }
        let mut votes = 1usize;
        for j in (i + 1)..candidates.len() {
            if suppressed[j] || candidates[i].iou(&candidates[j]) <= SCRFD_GROUP_IOU {
                continue;
            }
            suppressed[j] = true;
            if same_scale(&candidates[i], &candidates[j], config.scale_factor) {
                votes += 1;
            }
        }

        let face = &candidates[i];
        if votes >= config.min_neighbors && face.min_side() >= config.min_size {
            faces.push(face.clone());
        }
    }

    faces
}

fn same_scale(a: &FaceBox, b: &FaceBox, scale_factor: f32) -> bool {
    let (sa, sb) = (a.min_side(), b.min_side());
    if sa <= 0.0 || sb <= 0.0 {
        return false;
    }
    sa.max(sb) / sa.min(sb) <= scale_factor
}
