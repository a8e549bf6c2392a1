//! Face recognition against a trained gallery.
//!
//! [`ArcFaceRecognizer`] extracts 512-dimensional ArcFace embeddings from
//! aligned face crops and reports the cosine distance to the nearest enrolled
//! template. Scores follow the "lower is better" convention.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{Classification, Embedding, FaceBox, Frame, IdentityId};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric normalization, unlike SCRFD
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("gallery not found: {0}; enroll at least one face first (presence enroll)")]
    GalleryNotFound(String),
    #[error("gallery {path} is unreadable: {source}")]
    GalleryIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("gallery is malformed: {0}")]
    GalleryMalformed(#[from] serde_json::Error),
    #[error("gallery is incompatible: {0}")]
    GalleryIncompatible(String),
    #[error("gallery has no templates")]
    EmptyGallery,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Classifies a detected face against the trained identity model.
pub trait FaceRecognizer {
    fn classify(&mut self, frame: &Frame, face: &FaceBox) -> Result<Classification, RecognizerError>;
}

/// One enrolled embedding for an identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceTemplate {
    pub identity: IdentityId,
    #[serde(default)]
    pub label: String,
    pub embedding: Embedding,
    #[serde(default)]
    pub created_at: String,
}

/// Trained recognition artifact: every template for every enrolled identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gallery {
    pub model_version: String,
    pub templates: Vec<FaceTemplate>,
}

impl Gallery {
    /// An empty gallery for the bundled ArcFace model.
    pub fn new() -> Self {
        Self {
            model_version: ARCFACE_MODEL_VERSION.to_string(),
            templates: Vec::new(),
        }
    }

    /// Load and validate a gallery JSON artifact for a recognition session.
    pub fn load(path: &Path) -> Result<Self, RecognizerError> {
        if !path.exists() {
            return Err(RecognizerError::GalleryNotFound(path.display().to_string()));
        }
        let gallery = Self::read(path)?;
        gallery.validate(ARCFACE_MODEL_VERSION, ARCFACE_EMBEDDING_DIM)?;

        tracing::info!(
            path = %path.display(),
            templates = gallery.templates.len(),
            model_version = %gallery.model_version,
            "loaded gallery"
        );
        Ok(gallery)
    }

    /// Load a gallery for editing. A missing file yields an empty gallery;
    /// an existing one must still match the model.
    pub fn open_or_new(path: &Path) -> Result<Self, RecognizerError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let gallery = Self::read(path)?;
        gallery.check_compatible(ARCFACE_MODEL_VERSION, ARCFACE_EMBEDDING_DIM)?;
        Ok(gallery)
    }

    /// Write the gallery as JSON, replacing `path` atomically.
    pub fn save(&self, path: &Path) -> Result<(), RecognizerError> {
        let io_err = |source: std::io::Error| RecognizerError::GalleryIo {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;

        tracing::info!(path = %path.display(), templates = self.templates.len(), "saved gallery");
        Ok(())
    }

    pub fn add(&mut self, template: FaceTemplate) {
        self.templates.push(template);
    }

    /// Drop every template of `identity`. Returns how many were removed.
    pub fn remove_identity(&mut self, identity: IdentityId) -> usize {
        let before = self.templates.len();
        self.templates.retain(|t| t.identity != identity);
        before - self.templates.len()
    }

    /// Template count per enrolled identity, in id order.
    pub fn counts(&self) -> BTreeMap<IdentityId, usize> {
        let mut counts = BTreeMap::new();
        for template in &self.templates {
            *counts.entry(template.identity).or_insert(0) += 1;
        }
        counts
    }

    pub fn validate(&self, model_version: &str, dim: usize) -> Result<(), RecognizerError> {
        self.check_compatible(model_version, dim)?;
        if self.templates.is_empty() {
            return Err(RecognizerError::EmptyGallery);
        }
        Ok(())
    }

    fn check_compatible(&self, model_version: &str, dim: usize) -> Result<(), RecognizerError> {
        if self.model_version != model_version {
            return Err(RecognizerError::GalleryIncompatible(format!(
                "trained with {}, recognizer is {model_version}",
                self.model_version
            )));
        }
        if let Some(t) = self.templates.iter().find(|t| t.embedding.values.len() != dim) {
            return Err(RecognizerError::GalleryIncompatible(format!(
                "template for identity {} has {} dimensions, expected {dim}",
                t.identity,
                t.embedding.values.len()
            )));
        }
        Ok(())
    }

    fn read(path: &Path) -> Result<Self, RecognizerError> {
        let raw = std::fs::read_to_string(path).map_err(|source| RecognizerError::GalleryIo {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Nearest template by cosine distance.
    ///
    /// Always visits every template, so the cost does not depend on where
    /// (or whether) the match sits in the gallery.
    pub fn nearest(&self, query: &Embedding) -> Option<Classification> {
        let mut best: Option<Classification> = None;
        for template in &self.templates {
            let score = query.cosine_distance(&template.embedding);
            let closer = best.map_or(true, |b| score < b.score);
            if closer {
                best = Some(Classification {
                    identity: template.identity,
                    score,
                });
            }
        }
        best
    }
}

impl Default for Gallery {
    fn default() -> Self {
        Self::new()
    }
}

/// ArcFace embedding extractor, usable without a gallery (enrollment).
pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Aligned, L2-normalized embedding of `face`.
    pub fn embed(&mut self, frame: &Frame, face: &FaceBox) -> Result<Embedding, RecognizerError> {
        let aligned = alignment::align_face(frame, face);
        let input = preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

/// ArcFace-based face recognizer.
pub struct ArcFaceRecognizer {
    embedder: ArcFaceEmbedder,
    gallery: Gallery,
}

impl ArcFaceRecognizer {
    /// Load the ArcFace model and its trained gallery. Both are required.
    pub fn load(model_path: &str, gallery_path: &Path) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }
        let gallery = Gallery::load(gallery_path)?;
        let embedder = ArcFaceEmbedder::load(model_path)?;
        Ok(Self { embedder, gallery })
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    pub fn embed(&mut self, frame: &Frame, face: &FaceBox) -> Result<Embedding, RecognizerError> {
        self.embedder.embed(frame, face)
    }
}

impl FaceRecognizer for ArcFaceRecognizer {
    fn classify(&mut self, frame: &Frame, face: &FaceBox) -> Result<Classification, RecognizerError> {
        let embedding = self.embed(frame, face)?;
        self.gallery.nearest(&embedding).ok_or(RecognizerError::EmptyGallery)
    }
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

/// 112x112 grayscale crop into an NCHW tensor with the gray value on all channels.
fn preprocess(aligned: &[u8]) -> Array4<f32> {
    let size = ALIGNED_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            let pixel = aligned.get(y * size + x).copied().unwrap_or(0) as f32;
            let normalized = (pixel - ARCFACE_MEAN) / ARCFACE_STD;
            for c in 0..3 {
                tensor[[0, c, y, x]] = normalized;
            }
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn template(id: u32, values: Vec<f32>) -> FaceTemplate {
        FaceTemplate {
            identity: IdentityId(id),
            label: "front".into(),
            embedding: Embedding { values, model_version: None },
            created_at: String::new(),
        }
    }

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn test_nearest_visits_whole_gallery() {
        let gallery = Gallery {
            model_version: ARCFACE_MODEL_VERSION.into(),
            templates: vec![
                template(1, vec![0.0, 1.0, 0.0]),
                template(2, vec![0.0, 0.0, 1.0]),
                template(3, vec![1.0, 0.0, 0.0]),
            ],
        };
        let query = Embedding { values: vec![1.0, 0.0, 0.0], model_version: None };
        let best = gallery.nearest(&query).unwrap();
        assert_eq!(best.identity, IdentityId(3));
        assert!(best.score.abs() < 1e-6, "lower is better; identical should be 0");
    }

    #[test]
    fn test_nearest_multiple_templates_per_identity() {
        let gallery = Gallery {
            model_version: ARCFACE_MODEL_VERSION.into(),
            templates: vec![
                template(7, vec![0.6, 0.8]),
                template(7, vec![1.0, 0.0]),
                template(9, vec![0.0, 1.0]),
            ],
        };
        let query = Embedding { values: vec![0.9, 0.1], model_version: None };
        assert_eq!(gallery.nearest(&query).unwrap().identity, IdentityId(7));
    }

    #[test]
    fn test_nearest_empty_gallery() {
        let gallery = Gallery { model_version: ARCFACE_MODEL_VERSION.into(), templates: vec![] };
        let query = Embedding { values: vec![1.0], model_version: None };
        assert!(gallery.nearest(&query).is_none());
    }

    #[test]
    fn test_validate_rejects_incompatible() {
        let mut gallery = Gallery {
            model_version: "other".into(),
            templates: vec![template(1, unit(4, 0))],
        };
        assert!(matches!(gallery.validate(ARCFACE_MODEL_VERSION, 4), Err(RecognizerError::GalleryIncompatible(_))));

        gallery.model_version = ARCFACE_MODEL_VERSION.into();
        assert!(gallery.validate(ARCFACE_MODEL_VERSION, 4).is_ok());
        assert!(matches!(gallery.validate(ARCFACE_MODEL_VERSION, 8), Err(RecognizerError::GalleryIncompatible(_))));

        gallery.templates.clear();
        assert!(matches!(gallery.validate(ARCFACE_MODEL_VERSION, 4), Err(RecognizerError::EmptyGallery)));
    }

    #[test]
    fn test_load_missing_gallery_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = Gallery::load(&dir.path().join("gallery.json")).unwrap_err();
        assert!(matches!(err, RecognizerError::GalleryNotFound(_)));
    }

    #[test]
    fn test_load_malformed_gallery() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        assert!(matches!(Gallery::load(file.path()), Err(RecognizerError::GalleryMalformed(_))));
    }

    #[test]
    fn test_load_valid_gallery() {
        let gallery = Gallery {
            model_version: ARCFACE_MODEL_VERSION.into(),
            templates: vec![template(7, unit(ARCFACE_EMBEDDING_DIM, 3))],
        };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(&gallery).unwrap().as_bytes()).unwrap();

        let loaded = Gallery::load(file.path()).unwrap();
        assert_eq!(loaded.templates.len(), 1);
        assert_eq!(loaded.templates[0].identity, IdentityId(7));
    }

    #[test]
    fn test_gallery_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("gallery.json");

        let mut gallery = Gallery::open_or_new(&path).unwrap();
        assert!(gallery.templates.is_empty());
        gallery.add(template(7, unit(ARCFACE_EMBEDDING_DIM, 1)));
        gallery.add(template(7, unit(ARCFACE_EMBEDDING_DIM, 2)));
        gallery.add(template(9, unit(ARCFACE_EMBEDDING_DIM, 3)));
        gallery.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let mut reopened = Gallery::open_or_new(&path).unwrap();
        assert_eq!(reopened.counts(), BTreeMap::from([(IdentityId(7), 2), (IdentityId(9), 1)]));
        let query = Embedding { values: unit(ARCFACE_EMBEDDING_DIM, 3), model_version: None };
        assert_eq!(Gallery::load(&path).unwrap().nearest(&query).unwrap().identity, IdentityId(9));

        assert_eq!(reopened.remove_identity(IdentityId(7)), 2);
        assert_eq!(reopened.remove_identity(IdentityId(7)), 0);
        reopened.save(&path).unwrap();
        assert_eq!(Gallery::load(&path).unwrap().counts(), BTreeMap::from([(IdentityId(9), 1)]));
    }

    #[test]
    fn test_emptied_gallery_saves_but_cannot_start_a_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        let mut gallery = Gallery::new();
        gallery.add(template(1, unit(ARCFACE_EMBEDDING_DIM, 0)));
        gallery.remove_identity(IdentityId(1));
        gallery.save(&path).unwrap();

        assert!(Gallery::open_or_new(&path).unwrap().templates.is_empty());
        assert!(matches!(Gallery::load(&path), Err(RecognizerError::EmptyGallery)));
    }

    #[test]
    fn test_open_or_new_rejects_other_model() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let gallery = Gallery { model_version: "buffalo_s".into(), templates: vec![] };
        file.write_all(serde_json::to_string(&gallery).unwrap().as_bytes()).unwrap();
        assert!(matches!(
            Gallery::open_or_new(file.path()),
            Err(RecognizerError::GalleryIncompatible(_))
        ));
    }

    #[test]
    fn test_embedder_requires_model() {
        assert!(matches!(
            ArcFaceEmbedder::load("/nonexistent/w600k_r50.onnx"),
            Err(RecognizerError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_recognizer_requires_model() {
        let dir = tempfile::tempdir().unwrap();
        let err = ArcFaceRecognizer::load("/nonexistent/w600k_r50.onnx", &dir.path().join("g.json"));
        assert!(matches!(err, Err(RecognizerError::ModelNotFound(_))));
    }

    #[test]
    fn test_preprocess_shape_and_channels() {
        let aligned = vec![100u8; ALIGNED_SIZE * ALIGNED_SIZE];
        let tensor = preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, ALIGNED_SIZE, ALIGNED_SIZE]);
        let expected = (100.0 - ARCFACE_MEAN) / ARCFACE_STD;
        for c in 0..3 {
            assert!((tensor[[0, c, 5, 9]] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
