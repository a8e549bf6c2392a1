//! Enrollment: pick the clearest face from a burst of frames.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::FaceTemplate;
use crate::types::{Embedding, FaceBox, Frame, IdentityId};
use chrono::NaiveDateTime;

/// The highest-confidence face across `frames`, with the index of its frame.
///
/// Every detected face is considered, so a second person in one frame does
/// not hide a better view of the subject in another. `None` if no frame
/// contains a face.
pub fn best_face(
    detector: &mut dyn FaceDetector,
    frames: &[Frame],
) -> Result<Option<(usize, FaceBox)>, DetectorError> {
    let mut best: Option<(usize, FaceBox)> = None;
    for (i, frame) in frames.iter().enumerate() {
        for face in detector.detect(frame)? {
            if best.as_ref().map_or(true, |(_, b)| face.confidence > b.confidence) {
                best = Some((i, face));
            }
        }
    }
    if let Some((i, face)) = &best {
        tracing::debug!(frame = i, confidence = face.confidence, "enroll: best face selected");
    }
    Ok(best)
}

/// Gallery template for a freshly extracted embedding.
pub fn template(identity: IdentityId, label: &str, embedding: Embedding, at: NaiveDateTime) -> FaceTemplate {
    FaceTemplate {
        identity,
        label: label.to_string(),
        embedding,
        created_at: at.format("%Y-%m-%dT%H:%M:%S").to_string(),
    }
}
