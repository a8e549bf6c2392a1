use crate::config::Config;
use chrono::{DateTime, Local};
use presence_core::render::{self, NullRenderer};
use presence_core::{
    ArcFaceRecognizer, Capabilities, FaceEvent, FaceMeshExtractor, FaceOutcome, FrameReport, FrameSource,
    FrameSourceError, IdentityDirectory, IdentityLabel, RecognitionSession, Renderer, ScrfdDetector,
    SessionSummary, StopSignal,
};
use presence_hw::{Camera, CameraStream, Clahe};
use presence_store::Store;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] presence_hw::CameraError),
    #[error("detector error: {0}")]
    Detector(#[from] presence_core::detector::DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] presence_core::recognizer::RecognizerError),
    #[error("landmark model error: {0}")]
    Landmarks(#[from] presence_core::landmarks::LandmarkError),
    #[error("store error: {0}")]
    Store(#[from] presence_store::StoreError),
    #[error("session error: {0}")]
    Session(#[from] presence_core::SessionError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Someone marked present while the daemon has been running.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkedIdentity {
    pub id: u32,
    pub name: String,
}

/// Snapshot of the engine for the D-Bus `Status` call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStatus {
    pub camera: String,
    pub running: bool,
    pub frames: u64,
    pub faces_in_view: usize,
    pub marked: Vec<MarkedIdentity>,
    pub last_error: Option<String>,
}

/// Engine status shared between the engine thread and D-Bus handlers.
#[derive(Clone, Default)]
pub struct SharedStatus(Arc<Mutex<EngineStatus>>);

impl SharedStatus {
    pub fn new(camera: &str) -> Self {
        Self(Arc::new(Mutex::new(EngineStatus {
            camera: camera.to_string(),
            ..Default::default()
        })))
    }

    pub fn snapshot(&self) -> EngineStatus {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, EngineStatus> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_running(&self) {
        self.lock().running = true;
    }

    fn record(&self, report: &FrameReport) {
        let mut status = self.lock();
        status.frames += 1;
        status.faces_in_view = report.faces.len();
        for face in &report.faces {
            let counted = matches!(
                face.event,
                FaceEvent::Marked | FaceEvent::LedgerCaughtUp | FaceEvent::AlreadyMarked
            );
            if let (true, IdentityLabel::Known { id, name }) = (counted, &face.label) {
                if !status.marked.iter().any(|m| m.id == id.0) {
                    status.marked.push(MarkedIdentity {
                        id: id.0,
                        name: name.clone(),
                    });
                }
            }
        }
    }

    fn finish(&self, result: &Result<SessionSummary, EngineError>) {
        let mut status = self.lock();
        status.running = false;
        status.faces_in_view = 0;
        if let Err(e) = result {
            status.last_error = Some(e.to_string());
        }
    }
}

/// Handle to the running engine thread.
pub struct EngineHandle {
    pub stop: StopSignal,
    /// Resolves when the session ends, by stop request or failure.
    pub done: oneshot::Receiver<Result<SessionSummary, EngineError>>,
}

/// Spawn the recognition session on a dedicated OS thread.
///
/// Models, gallery, identity directory and camera are all opened on that
/// thread before this returns; any failure is reported here (fail-fast).
pub fn spawn_engine(config: Config, status: SharedStatus) -> Result<EngineHandle, EngineError> {
    let stop = StopSignal::new();
    let thread_stop = stop.clone();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), EngineError>>();
    let (done_tx, done_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("presence-engine".into())
        .spawn(move || {
            let (session, source) = match build_session(&config) {
                Ok(parts) => parts,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            tracing::info!("engine thread started");
            status.set_running();
            let result = session
                .run(source, &thread_stop, |report| status.record(report))
                .map_err(EngineError::from);
            status.finish(&result);
            tracing::info!("engine thread exiting");
            let _ = done_tx.send(result);
        })
        .map_err(EngineError::Spawn)?;

    ready_rx.recv().map_err(|_| EngineError::ChannelClosed)??;
    Ok(EngineHandle { stop, done: done_rx })
}

fn build_session(config: &Config) -> Result<(RecognitionSession, CameraSource), EngineError> {
    let store = Store::open(&config.db_path)?;
    let directory = store.load_directory()?;
    tracing::info!(path = %config.db_path.display(), identities = directory.len(), "identity directory loaded");

    let detector = ScrfdDetector::load(&config.scrfd_model_path(), config.detection_config())?;
    let recognizer = ArcFaceRecognizer::load(&config.arcface_model_path(), &config.gallery_path())?;
    warn_unlisted_templates(&recognizer, &directory);
    let landmarks = FaceMeshExtractor::load(&config.face_mesh_model_path())?;

    let renderer: Box<dyn Renderer> = match &config.preview_path {
        Some(path) => Box::new(PreviewRenderer::new(path.clone(), config.preview_interval)),
        None => Box::new(NullRenderer),
    };

    let session = RecognitionSession::new(
        config.session_config(),
        directory,
        Capabilities {
            detector: Box::new(detector),
            recognizer: Box::new(recognizer),
            landmarks: Box::new(landmarks),
            ledger: Box::new(store),
            renderer,
        },
    )?;

    let camera = Camera::open(&config.camera_device, config.camera_width, config.camera_height)?;
    tracing::info!(
        device = %config.camera_device,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );
    let mut stream = camera.into_stream(config.enhance_contrast.then(Clahe::default))?;
    if config.warmup_frames > 0 {
        tracing::info!(count = config.warmup_frames, "discarding warmup frames");
        stream.discard(config.warmup_frames)?;
    }

    Ok((session, CameraSource { stream }))
}

fn warn_unlisted_templates(recognizer: &ArcFaceRecognizer, directory: &IdentityDirectory) {
    for template in &recognizer.gallery().templates {
        if directory.name(template.identity).is_none() {
            tracing::warn!(
                identity = %template.identity,
                "gallery template has no identity record; matches will show as unknown"
            );
        }
    }
}

/// Live camera as a session frame source.
struct CameraSource {
    stream: CameraStream,
}

impl FrameSource for CameraSource {
    fn next_frame(&mut self) -> Result<presence_core::Frame, FrameSourceError> {
        let frame = self
            .stream
            .next_frame()
            .map_err(|e| FrameSourceError::Failed(e.to_string()))?;
        if frame.is_dark {
            tracing::trace!(seq = frame.sequence, "dark frame");
        }
        Ok(to_core_frame(frame))
    }
}

fn to_core_frame(frame: presence_hw::Frame) -> presence_core::Frame {
    presence_core::Frame {
        data: frame.data,
        width: frame.width,
        height: frame.height,
        sequence: frame.sequence,
        captured_at: DateTime::<Local>::from(frame.captured_at).naive_local(),
    }
}

/// Periodically writes the annotated frame to a PNG.
///
/// The file is replaced atomically so viewers never read a partial image.
pub struct PreviewRenderer {
    path: PathBuf,
    interval: u32,
    counter: u32,
}

impl PreviewRenderer {
    pub fn new(path: PathBuf, interval: u32) -> Self {
        Self {
            path,
            interval: interval.max(1),
            counter: 0,
        }
    }

    fn write(&self, frame: &presence_core::Frame, faces: &[FaceOutcome]) -> Result<(), image::ImageError> {
        let tmp = self.path.with_extension("png.tmp");
        render::annotate(frame, faces).save_with_format(&tmp, image::ImageFormat::Png)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Renderer for PreviewRenderer {
    fn render(&mut self, frame: &presence_core::Frame, faces: &[FaceOutcome]) {
        let due = self.counter % self.interval == 0;
        self.counter = self.counter.wrapping_add(1);
        if !due {
            return;
        }
        if let Err(e) = self.write(frame, faces) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to write preview");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::{FaceBox, IdentityId, VisualState};
    use std::time::{Duration, SystemTime};

    fn core_frame(seq: u32) -> presence_core::Frame {
        presence_core::Frame {
            data: vec![128u8; 32 * 24],
            width: 32,
            height: 24,
            sequence: seq,
            captured_at: chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
        }
    }

    fn outcome(id: u32, name: &str, event: FaceEvent) -> FaceOutcome {
        let label = IdentityLabel::Known { id: IdentityId(id), name: name.into() };
        FaceOutcome {
            face: FaceBox::new(4.0, 4.0, 10.0, 10.0),
            state: VisualState::derive(&label, event != FaceEvent::NoGesture),
            label,
            score: Some(0.3),
            landmarks: None,
            event,
        }
    }

    #[test]
    fn test_to_core_frame_uses_local_time() {
        let captured_at = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let frame = to_core_frame(presence_hw::Frame {
            data: vec![1, 2, 3, 4],
            width: 2,
            height: 2,
            captured_at,
            sequence: 42,
            is_dark: false,
        });
        assert_eq!(frame.sequence, 42);
        assert_eq!(frame.data, vec![1, 2, 3, 4]);
        assert_eq!(frame.captured_at, DateTime::<Local>::from(captured_at).naive_local());
    }

    #[test]
    fn test_status_tracks_marked_identities() {
        let status = SharedStatus::new("/dev/video0");
        status.set_running();
        let report = |faces| FrameReport {
            sequence: 0,
            captured_at: core_frame(0).captured_at,
            faces,
        };
        status.record(&report(vec![outcome(8, "Grace", FaceEvent::NoGesture)]));
        status.record(&report(vec![
            outcome(7, "Ada", FaceEvent::Marked),
            outcome(8, "Grace", FaceEvent::NoGesture),
        ]));
        status.record(&report(vec![outcome(7, "Ada", FaceEvent::AlreadyMarked)]));

        let snap = status.snapshot();
        assert!(snap.running);
        assert_eq!(snap.frames, 3);
        assert_eq!(snap.faces_in_view, 1);
        assert_eq!(snap.marked, vec![MarkedIdentity { id: 7, name: "Ada".into() }]);

        status.finish(&Err(EngineError::ChannelClosed));
        let snap = status.snapshot();
        assert!(!snap.running);
        assert_eq!(snap.last_error.as_deref(), Some("engine thread exited"));
    }

    #[test]
    fn test_preview_written_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.png");
        let mut renderer = PreviewRenderer::new(path.clone(), 2);

        renderer.render(&core_frame(0), &[outcome(7, "Ada", FaceEvent::Marked)]);
        assert!(path.exists());
        assert!(!dir.path().join("preview.png.tmp").exists());
        let written = image::open(&path).unwrap().to_rgb8();
        assert_eq!(written.dimensions(), (32, 24));
        assert_eq!(*written.get_pixel(4, 8), VisualState::Present.color());

        // Second frame is skipped, third rewrites.
        std::fs::remove_file(&path).unwrap();
        renderer.render(&core_frame(1), &[]);
        assert!(!path.exists());
        renderer.render(&core_frame(2), &[]);
        assert!(path.exists());
    }

    #[test]
    fn test_preview_failure_is_not_fatal() {
        let mut renderer = PreviewRenderer::new(PathBuf::from("/nonexistent/dir/preview.png"), 1);
        renderer.render(&core_frame(0), &[]);
    }
}
