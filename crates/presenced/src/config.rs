use presence_core::{DetectionConfig, SessionConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Daemon configuration.
///
/// Defaults, then the TOML file named by `PRESENCE_CONFIG` (if set), then
/// `PRESENCE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Enrolled gallery JSON; defaults to `gallery.json` in `model_dir`.
    pub gallery_path: Option<PathBuf>,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine distance below which a face is recognized.
    pub confidence_threshold: f32,
    /// Eyebrow distance change in pixels that counts as a gesture.
    pub movement_threshold: f32,
    pub min_face_size: f32,
    pub scale_factor: f32,
    pub min_neighbors: usize,
    /// Frames discarded at startup (camera AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Apply CLAHE to captured frames.
    pub enhance_contrast: bool,
    /// Annotated PNG preview, rewritten every `preview_interval` frames.
    pub preview_path: Option<PathBuf>,
    pub preview_interval: u32,
}

impl Default for Config {
    fn default() -> Self {
        let session = SessionConfig::default();
        let detection = DetectionConfig::default();
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            model_dir: presence_core::default_model_dir(),
            gallery_path: None,
            db_path: presence_store::default_db_path(),
            confidence_threshold: session.confidence_threshold,
            movement_threshold: session.movement_threshold,
            min_face_size: detection.min_size,
            scale_factor: detection.scale_factor,
            min_neighbors: detection.min_neighbors,
            warmup_frames: 4,
            enhance_contrast: true,
            preview_path: None,
            preview_interval: 5,
        }
    }
}

impl Config {
    /// Load from `PRESENCE_CONFIG` and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("PRESENCE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Override fields from `PRESENCE_*` variables resolved by `lookup`.
    /// Unparseable values are logged and ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = Env(&lookup);
        env.string("PRESENCE_CAMERA_DEVICE", &mut self.camera_device);
        env.parse("PRESENCE_CAMERA_WIDTH", &mut self.camera_width);
        env.parse("PRESENCE_CAMERA_HEIGHT", &mut self.camera_height);
        env.path("PRESENCE_MODEL_DIR", &mut self.model_dir);
        if let Some(v) = lookup("PRESENCE_GALLERY_PATH") {
            self.gallery_path = Some(PathBuf::from(v));
        }
        env.path("PRESENCE_DB_PATH", &mut self.db_path);
        env.parse("PRESENCE_CONFIDENCE_THRESHOLD", &mut self.confidence_threshold);
        env.parse("PRESENCE_MOVEMENT_THRESHOLD", &mut self.movement_threshold);
        env.parse("PRESENCE_MIN_FACE_SIZE", &mut self.min_face_size);
        env.parse("PRESENCE_SCALE_FACTOR", &mut self.scale_factor);
        env.parse("PRESENCE_MIN_NEIGHBORS", &mut self.min_neighbors);
        env.parse("PRESENCE_WARMUP_FRAMES", &mut self.warmup_frames);
        if let Some(v) = lookup("PRESENCE_ENHANCE_CONTRAST") {
            self.enhance_contrast = v != "0";
        }
        if let Some(v) = lookup("PRESENCE_PREVIEW_PATH") {
            self.preview_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        env.parse("PRESENCE_PREVIEW_INTERVAL", &mut self.preview_interval);
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            confidence_threshold: self.confidence_threshold,
            movement_threshold: self.movement_threshold,
        }
    }

    pub fn detection_config(&self) -> DetectionConfig {
        DetectionConfig {
            min_size: self.min_face_size,
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_file("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_file("w600k_r50.onnx")
    }

    /// Path to the 468-point face mesh model.
    pub fn face_mesh_model_path(&self) -> String {
        self.model_file("face_landmark.onnx")
    }

    pub fn gallery_path(&self) -> PathBuf {
        self.gallery_path
            .clone()
            .unwrap_or_else(|| self.model_dir.join("gallery.json"))
    }

    fn model_file(&self, name: &str) -> String {
        self.model_dir.join(name).to_string_lossy().into_owned()
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str, slot: &mut String) {
        if let Some(v) = (self.0)(key) {
            *slot = v;
        }
    }

    fn path(&self, key: &str, slot: &mut PathBuf) {
        if let Some(v) = (self.0)(key) {
            *slot = PathBuf::from(v);
        }
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, slot: &mut T) {
        let Some(v) = (self.0)(key) else {
            return;
        };
        match v.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(key, value = %v, "ignoring unparseable environment value"),
        }
    }
}
