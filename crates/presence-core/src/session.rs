//! Recognition session: the per-frame attendance state machine.
//!
//! Each frame runs detect → classify → landmarks → liveness → ledger, then
//! hands every face outcome to the renderer. The session owns the only
//! cross-frame state: liveness baselines and attendance flags, both keyed by
//! identity and dropped when the session ends.

use crate::detector::FaceDetector;
use crate::landmarks::{LandmarkExtractor, LandmarkSet};
use crate::ledger::{AppendOutcome, AttendanceEntry, AttendanceLedger, IdentityDirectory};
use crate::liveness::{LivenessDetector, LivenessVerdict, DEFAULT_MOVEMENT_THRESHOLD};
use crate::recognizer::FaceRecognizer;
use crate::render::{Renderer, VisualState};
use crate::types::{FaceBox, Frame, IdentityId, IdentityLabel};
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Cosine distance below which a match is accepted.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.60;

#[derive(Error, Debug)]
pub enum FrameSourceError {
    #[error("frame source exhausted")]
    Exhausted,
    #[error("frame capture failed: {0}")]
    Failed(String),
}

/// Yields successive frames. May block on hardware I/O.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame, FrameSourceError>;
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("frame source: {0}")]
    Source(#[from] FrameSourceError),
    #[error("identity directory is empty; add identities before starting a session")]
    EmptyDirectory,
    #[error("invalid session config: {0}")]
    InvalidConfig(String),
}

/// Cooperative stop request, checked once per frame boundary.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    /// Recognizer scores at or above this are treated as unknown.
    pub confidence_threshold: f32,
    /// Eyebrow distance change, in frame pixels, that counts as a gesture.
    pub movement_threshold: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            movement_threshold: DEFAULT_MOVEMENT_THRESHOLD,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        for (name, value) in [
            ("confidence_threshold", self.confidence_threshold),
            ("movement_threshold", self.movement_threshold),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(SessionError::InvalidConfig(format!(
                    "{name} must be a positive number, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// What happened to one face in one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceEvent {
    /// Recognizer failed or the identity is not in the directory.
    Unrecognized,
    /// Score did not pass the confidence gate.
    LowConfidence,
    /// Already present today; liveness and ledger skipped.
    AlreadyMarked,
    LandmarksUnavailable,
    /// First liveness sample for this identity.
    Baseline,
    NoGesture,
    /// Gesture seen and the ledger recorded the entry.
    Marked,
    /// Gesture seen and the ledger already had today's entry.
    LedgerCaughtUp,
    /// Gesture seen but the ledger write failed; a later gesture retries.
    LedgerFailed,
}

#[derive(Debug, Clone)]
pub struct FaceOutcome {
    pub face: FaceBox,
    pub label: IdentityLabel,
    pub score: Option<f32>,
    pub landmarks: Option<LandmarkSet>,
    pub event: FaceEvent,
    pub state: VisualState,
}

#[derive(Debug, Clone)]
pub struct FrameReport {
    pub sequence: u32,
    pub captured_at: NaiveDateTime,
    pub faces: Vec<FaceOutcome>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub frames: u64,
    /// Identities marked present during this session, ascending.
    pub marked: Vec<IdentityId>,
}

/// Injected capabilities the session drives.
pub struct Capabilities {
    pub detector: Box<dyn FaceDetector>,
    pub recognizer: Box<dyn FaceRecognizer>,
    pub landmarks: Box<dyn LandmarkExtractor>,
    pub ledger: Box<dyn AttendanceLedger>,
    pub renderer: Box<dyn Renderer>,
}

/// Session-scoped mirror of the ledger for one identity.
///
/// Present once the ledger has been consulted for the identity. `marked`
/// never goes back to false within a session.
#[derive(Debug, Clone, Copy)]
struct AttendanceStatus {
    marked: bool,
}

pub struct RecognitionSession {
    config: SessionConfig,
    directory: IdentityDirectory,
    caps: Capabilities,
    liveness: LivenessDetector,
    attendance: HashMap<IdentityId, AttendanceStatus>,
    frames: u64,
}

impl RecognitionSession {
    pub fn new(
        config: SessionConfig,
        directory: IdentityDirectory,
        caps: Capabilities,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        if directory.is_empty() {
            return Err(SessionError::EmptyDirectory);
        }
        Ok(Self {
            liveness: LivenessDetector::new(config.movement_threshold),
            config,
            directory,
            caps,
            attendance: HashMap::new(),
            frames: 0,
        })
    }

    /// Whether `identity` has been marked present in this session.
    pub fn is_marked(&self, identity: IdentityId) -> bool {
        self.attendance.get(&identity).is_some_and(|s| s.marked)
    }

    pub fn liveness(&self) -> &LivenessDetector {
        &self.liveness
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames
    }

    pub fn summary(&self) -> SessionSummary {
        let mut marked: Vec<IdentityId> = self
            .attendance
            .iter()
            .filter(|(_, s)| s.marked)
            .map(|(id, _)| *id)
            .collect();
        marked.sort();
        SessionSummary {
            frames: self.frames,
            marked,
        }
    }

    /// Run one frame through the pipeline and render it.
    pub fn process_frame(&mut self, frame: &Frame) -> FrameReport {
        let day = frame.captured_at.date();
        let boxes = match self.caps.detector.detect(frame) {
            Ok(boxes) => boxes,
            Err(e) => {
                tracing::warn!(seq = frame.sequence, error = %e, "detection failed; skipping frame");
                Vec::new()
            }
        };

        let mut faces = Vec::with_capacity(boxes.len());
        for face in boxes {
            faces.push(self.process_face(frame, day, face));
        }

        self.caps.renderer.render(frame, &faces);
        self.frames += 1;

        FrameReport {
            sequence: frame.sequence,
            captured_at: frame.captured_at,
            faces,
        }
    }

    /// Pull frames until stopped. Consumes the session: the source and all
    /// per-identity state are released on return.
    pub fn run<S: FrameSource>(
        mut self,
        mut source: S,
        stop: &StopSignal,
        mut on_frame: impl FnMut(&FrameReport),
    ) -> Result<SessionSummary, SessionError> {
        tracing::info!(
            identities = self.directory.len(),
            confidence_threshold = self.config.confidence_threshold,
            movement_threshold = self.config.movement_threshold,
            "recognition session started"
        );

        let outcome = loop {
            if stop.is_stopped() {
                break Ok(());
            }
            match source.next_frame() {
                Ok(frame) => {
                    let report = self.process_frame(&frame);
                    on_frame(&report);
                }
                Err(e) => break Err(e),
            }
        };
        drop(source);

        let summary = self.summary();
        match outcome {
            Ok(()) => {
                tracing::info!(frames = summary.frames, marked = summary.marked.len(), "recognition session stopped");
                Ok(summary)
            }
            Err(e) => {
                tracing::error!(frames = summary.frames, error = %e, "recognition session aborted");
                Err(e.into())
            }
        }
    }

    fn process_face(&mut self, frame: &Frame, day: NaiveDate, face: FaceBox) -> FaceOutcome {
        let classification = match self.caps.recognizer.classify(frame, &face) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(seq = frame.sequence, error = %e, "classification failed");
                return unknown(face, None, FaceEvent::Unrecognized);
            }
        };

        // Lower is better: equal to the threshold is not a match.
        if !(classification.score < self.config.confidence_threshold) {
            return unknown(face, Some(classification.score), FaceEvent::LowConfidence);
        }

        let id = classification.identity;
        let Some(name) = self.directory.name(id).map(str::to_owned) else {
            tracing::debug!(identity = %id, "recognized identity missing from directory");
            return unknown(face, Some(classification.score), FaceEvent::Unrecognized);
        };

        let (landmarks, event) = self.gate(frame, &face, id, &name, day);
        let label = IdentityLabel::Known { id, name };
        FaceOutcome {
            state: VisualState::derive(&label, self.is_marked(id)),
            face,
            label,
            score: Some(classification.score),
            landmarks,
            event,
        }
    }

    /// Attendance gating for a confidently recognized identity.
    fn gate(
        &mut self,
        frame: &Frame,
        face: &FaceBox,
        id: IdentityId,
        name: &str,
        day: NaiveDate,
    ) -> (Option<LandmarkSet>, FaceEvent) {
        if self.sync_status(id, day) {
            return (None, FaceEvent::AlreadyMarked);
        }

        let landmarks = match self.caps.landmarks.extract(frame, face) {
            Ok(Some(landmarks)) => landmarks,
            Ok(None) => return (None, FaceEvent::LandmarksUnavailable),
            Err(e) => {
                tracing::warn!(identity = %id, error = %e, "landmark extraction failed");
                return (None, FaceEvent::LandmarksUnavailable);
            }
        };

        let event = match self.liveness.observe(id, &landmarks) {
            LivenessVerdict::Baseline => FaceEvent::Baseline,
            LivenessVerdict::NoGesture { .. } => FaceEvent::NoGesture,
            LivenessVerdict::Gesture { delta } => {
                tracing::debug!(identity = %id, delta, "eyebrow gesture detected");
                self.record(id, name, frame.captured_at)
            }
        };
        (Some(landmarks), event)
    }

    /// Reconcile `id` with the ledger on first sighting; returns `marked`.
    ///
    /// The ledger is consulted once per identity per session. A failed
    /// lookup is retried on the next sighting.
    fn sync_status(&mut self, id: IdentityId, day: NaiveDate) -> bool {
        if let Some(status) = self.attendance.get(&id) {
            return status.marked;
        }
        match self.caps.ledger.has_entry(id, day) {
            Ok(marked) => {
                if marked {
                    tracing::info!(identity = %id, %day, "attendance already recorded today");
                }
                self.attendance.insert(id, AttendanceStatus { marked });
                marked
            }
            Err(e) => {
                tracing::warn!(identity = %id, error = %e, "ledger lookup failed");
                false
            }
        }
    }

    fn record(&mut self, id: IdentityId, name: &str, at: NaiveDateTime) -> FaceEvent {
        let entry = AttendanceEntry {
            identity: id,
            name: name.to_string(),
            day: at.date(),
            time: at.time().with_nanosecond(0).unwrap_or(at.time()),
        };

        let event = match self.caps.ledger.append(&entry) {
            Ok(AppendOutcome::Recorded) => {
                tracing::info!(identity = %id, name, time = %entry.time, "attendance marked");
                FaceEvent::Marked
            }
            Ok(AppendOutcome::AlreadyExists) => {
                tracing::info!(identity = %id, name, "attendance already in ledger");
                FaceEvent::LedgerCaughtUp
            }
            Err(e) => {
                tracing::warn!(identity = %id, error = %e, "attendance write failed; waiting for another gesture");
                return FaceEvent::LedgerFailed;
            }
        };

        self.attendance.insert(id, AttendanceStatus { marked: true });
        event
    }
}

fn unknown(face: FaceBox, score: Option<f32>, event: FaceEvent) -> FaceOutcome {
    FaceOutcome {
        face,
        label: IdentityLabel::Unknown,
        score,
        landmarks: None,
        event,
        state: VisualState::Unknown,
    }
}
