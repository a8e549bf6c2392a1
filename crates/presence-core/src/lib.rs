//! presence-core — Liveness-gated face attendance engine.
//!
//! Uses SCRFD for face detection, ArcFace for recognition against an
//! enrolled gallery and a 468-point face mesh for the eyebrow liveness
//! gesture, all running via ONNX Runtime for CPU inference.
//! [`RecognitionSession`] ties them to an [`AttendanceLedger`].

pub mod alignment;
pub mod detector;
pub mod enroll;
pub mod landmarks;
pub mod ledger;
pub mod liveness;
pub mod recognizer;
pub mod render;
pub mod session;
pub mod types;

pub use detector::{DetectionConfig, FaceDetector, ScrfdDetector};
pub use landmarks::{FaceMeshExtractor, LandmarkExtractor, LandmarkSet};
pub use ledger::{AppendOutcome, AttendanceEntry, AttendanceLedger, IdentityDirectory, IdentityRecord, LedgerError};
pub use liveness::LivenessDetector;
pub use recognizer::{ArcFaceEmbedder, ArcFaceRecognizer, FaceRecognizer, FaceTemplate, Gallery};
pub use render::{Renderer, VisualState};
pub use session::{
    Capabilities, FaceEvent, FaceOutcome, FrameReport, FrameSource, FrameSourceError, RecognitionSession,
    SessionConfig, SessionError, SessionSummary, StopSignal,
};
pub use types::{Classification, FaceBox, Frame, IdentityId, IdentityLabel};

/// Default directory for ONNX models and the enrolled gallery.
///
/// `$XDG_DATA_HOME/presence/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> std::path::PathBuf {
    data_home().join("presence").join("models")
}

/// `$XDG_DATA_HOME`, or `~/.local/share` when unset.
pub fn data_home() -> std::path::PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        })
}
