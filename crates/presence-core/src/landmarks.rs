//! Dense facial landmarks.
//!
//! [`FaceMeshExtractor`] runs a 468-point face-mesh ONNX model on a
//! 192×192 crop around the detected face. Points come out normalized to the
//! crop and are projected back into frame pixels.

use crate::alignment;
use crate::types::{FaceBox, Frame};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const MESH_INPUT_SIZE: usize = 192;
/// The mesh model expects some forehead and chin around the face.
const MESH_CROP_MARGIN: f32 = 0.25;
const MESH_PRESENCE_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug)]
pub enum LandmarkError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Fixed point indices of a landmark topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshTopology {
    pub points: usize,
    /// Upper point of the eyebrow used for the liveness signal.
    pub eyebrow: usize,
    /// Eye point on the same side of the face as `eyebrow`.
    pub eye: usize,
}

/// 468-point face mesh; 105 sits on the left eyebrow, 33 on the left eye.
pub const FACE_MESH_468: MeshTopology = MeshTopology {
    points: 468,
    eyebrow: 105,
    eye: 33,
};

/// Landmarks for exactly one face, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkSet {
    points: Vec<(f32, f32)>,
    topology: MeshTopology,
}

impl LandmarkSet {
    /// Build from points already in frame pixels. `None` on a cardinality mismatch.
    pub fn new(points: Vec<(f32, f32)>, topology: MeshTopology) -> Option<Self> {
        let valid = points.len() == topology.points
            && topology.eyebrow < topology.points
            && topology.eye < topology.points;
        valid.then_some(Self { points, topology })
    }

    /// Project points normalized to [0,1] within `region` into frame pixels.
    pub fn from_normalized(normalized: &[(f32, f32)], region: &FaceBox, topology: MeshTopology) -> Option<Self> {
        let points = normalized
            .iter()
            .map(|&(nx, ny)| (nx * region.width + region.x, ny * region.height + region.y))
            .collect();
        Self::new(points, topology)
    }

    pub fn points(&self) -> &[(f32, f32)] {
        &self.points
    }

    pub fn topology(&self) -> MeshTopology {
        self.topology
    }

    pub fn eyebrow(&self) -> (f32, f32) {
        self.points[self.topology.eyebrow]
    }

    pub fn eye(&self) -> (f32, f32) {
        self.points[self.topology.eye]
    }

    /// Vertical pixel distance between the eyebrow and eye points.
    pub fn eyebrow_to_eye_distance(&self) -> f32 {
        (self.eyebrow().1 - self.eye().1).abs()
    }
}

/// Resolves a landmark set for a detected face.
///
/// `Ok(None)` means the face could not be resolved this frame (occluded,
/// turned away); it is not an error.
pub trait LandmarkExtractor {
    fn extract(&mut self, frame: &Frame, face: &FaceBox) -> Result<Option<LandmarkSet>, LandmarkError>;
}

/// Face-mesh landmark model (NHWC 1×192×192×3 input in [0, 1]).
///
/// Output 0 carries 468 × (x, y, z) in input pixels; output 1, when present,
/// is the face-presence logit.
pub struct FaceMeshExtractor {
    session: Session,
}

impl FaceMeshExtractor {
    pub fn load(model_path: &str) -> Result<Self, LandmarkError> {
        if !Path::new(model_path).exists() {
            return Err(LandmarkError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face mesh model"
        );

        Ok(Self { session })
    }
}

impl LandmarkExtractor for FaceMeshExtractor {
    fn extract(&mut self, frame: &Frame, face: &FaceBox) -> Result<Option<LandmarkSet>, LandmarkError> {
        let region = face.expanded(MESH_CROP_MARGIN);
        if region.width < 1.0 || region.height < 1.0 {
            return Ok(None);
        }
        let crop = alignment::crop_resize(frame, &region, MESH_INPUT_SIZE);
        let input = preprocess(&crop);
        let has_presence = self.session.outputs().len() > 1;

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let presence = if has_presence {
            let (_, flag) = outputs[1]
                .try_extract_tensor::<f32>()
                .map_err(|e| LandmarkError::InferenceFailed(format!("presence score: {e}")))?;
            flag.first().map(|&logit| sigmoid(logit)).unwrap_or(0.0)
        } else {
            1.0
        };
        if presence < MESH_PRESENCE_THRESHOLD {
            tracing::trace!(presence, "face mesh: no face in crop");
            return Ok(None);
        }

        let (_, coords) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LandmarkError::InferenceFailed(format!("landmarks: {e}")))?;

        Ok(decode_mesh(coords, &region))
    }
}

/// Decode (x, y, z) triples in input pixels into a projected landmark set.
fn decode_mesh(coords: &[f32], region: &FaceBox) -> Option<LandmarkSet> {
    let topology = FACE_MESH_468;
    if coords.len() < topology.points * 3 {
        return None;
    }
    let size = MESH_INPUT_SIZE as f32;
    let normalized: Vec<(f32, f32)> = coords
        .chunks_exact(3)
        .take(topology.points)
        .map(|p| (p[0] / size, p[1] / size))
        .collect();
    LandmarkSet::from_normalized(&normalized, region, topology)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn preprocess(crop: &[u8]) -> Array4<f32> {
    let size = MESH_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, size, size, 3));
    for y in 0..size {
        for x in 0..size {
            let v = crop.get(y * size + x).copied().unwrap_or(0) as f32 / 255.0;
            for c in 0..3 {
                tensor[[0, y, x, c]] = v;
            }
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A mesh whose every point sits at the crop center except the two
    /// liveness points.
    fn mesh_coords(eyebrow_y: f32, eye_y: f32) -> Vec<f32> {
        let mut coords = vec![96.0f32; FACE_MESH_468.points * 3];
        coords[FACE_MESH_468.eyebrow * 3 + 1] = eyebrow_y;
        coords[FACE_MESH_468.eye * 3 + 1] = eye_y;
        coords
    }

    #[test]
    fn test_decode_projects_into_frame() {
        let region = FaceBox::new(100.0, 50.0, 192.0, 384.0);
        let set = decode_mesh(&mesh_coords(48.0, 72.0), &region).unwrap();
        assert_eq!(set.points().len(), 468);
        // y: 48/192 * 384 + 50 = 146; 72/192 * 384 + 50 = 194
        assert_eq!(set.eyebrow().1, 146.0);
        assert_eq!(set.eye().1, 194.0);
        assert_eq!(set.eyebrow_to_eye_distance(), 48.0);
        assert_eq!(set.points()[0], (196.0, 242.0));
    }

    #[test]
    fn test_decode_short_output_is_absent() {
        let region = FaceBox::new(0.0, 0.0, 10.0, 10.0);
        assert!(decode_mesh(&[0.0; 30], &region).is_none());
    }

    #[test]
    fn test_landmark_set_cardinality() {
        assert!(LandmarkSet::new(vec![(0.0, 0.0); 10], FACE_MESH_468).is_none());
        assert!(LandmarkSet::new(vec![(0.0, 0.0); 468], FACE_MESH_468).is_some());
    }

    #[test]
    fn test_distance_is_vertical_only() {
        let topo = MeshTopology { points: 2, eyebrow: 0, eye: 1 };
        let set = LandmarkSet::new(vec![(0.0, 10.0), (50.0, 22.0)], topo).unwrap();
        assert_eq!(set.eyebrow_to_eye_distance(), 12.0);
    }

    #[test]
    fn test_preprocess_range() {
        let crop = vec![255u8; MESH_INPUT_SIZE * MESH_INPUT_SIZE];
        let tensor = preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, MESH_INPUT_SIZE, MESH_INPUT_SIZE, 3]);
        assert_eq!(tensor[[0, 10, 10, 2]], 1.0);
    }

    #[test]
    fn test_sigmoid() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(10.0) > 0.99);
    }

    #[test]
    fn test_missing_model() {
        assert!(matches!(
            FaceMeshExtractor::load("/nonexistent/face_landmark.onnx"),
            Err(LandmarkError::ModelNotFound(_))
        ));
    }
}
