//! Visual feedback for the operator.
//!
//! The state drawn for a face depends only on its identity label and
//! attendance flag, so tests can assert on [`VisualState`] instead of pixels.

use crate::session::FaceOutcome;
use crate::types::{FaceBox, Frame, IdentityLabel};
use image::{Rgb, RgbImage};

const BOX_THICKNESS: i64 = 2;
const LABEL_PLATE_HEIGHT: i64 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualState {
    /// Not recognized, or not confident enough.
    Unknown,
    /// Recognized, attendance not yet marked.
    Pending,
    /// Recognized and marked present today.
    Present,
}

impl VisualState {
    pub fn derive(label: &IdentityLabel, marked: bool) -> Self {
        match label {
            IdentityLabel::Unknown => VisualState::Unknown,
            IdentityLabel::Known { .. } if marked => VisualState::Present,
            IdentityLabel::Known { .. } => VisualState::Pending,
        }
    }

    pub fn color(&self) -> Rgb<u8> {
        match self {
            VisualState::Unknown => Rgb([220, 40, 40]),
            VisualState::Pending => Rgb([40, 80, 255]),
            VisualState::Present => Rgb([40, 200, 60]),
        }
    }
}

/// Presentation sink called once per processed frame.
pub trait Renderer {
    fn render(&mut self, frame: &Frame, faces: &[FaceOutcome]);
}

/// Discards all feedback.
pub struct NullRenderer;

impl Renderer for NullRenderer {
    fn render(&mut self, _frame: &Frame, _faces: &[FaceOutcome]) {}
}

/// Draw boxes, landmark meshes and label plates over the grayscale frame.
pub fn annotate(frame: &Frame, faces: &[FaceOutcome]) -> RgbImage {
    let mut image = RgbImage::from_fn(frame.width, frame.height, |x, y| {
        let g = frame.pixel(x as i64, y as i64);
        Rgb([g, g, g])
    });

    for face in faces {
        let color = face.state.color();
        draw_box(&mut image, &face.face, color);

        // Solid plate only; no glyphs are rasterized.
        if let IdentityLabel::Known { .. } = face.label {
            let x0 = face.face.x.round() as i64;
            let x1 = (face.face.x + face.face.width).round() as i64;
            let y1 = face.face.y.round() as i64 - BOX_THICKNESS;
            fill(&mut image, x0, y1 - LABEL_PLATE_HEIGHT, x1, y1, color);
        }

        if let Some(landmarks) = &face.landmarks {
            for &(x, y) in landmarks.points() {
                put(&mut image, x.round() as i64, y.round() as i64, color);
            }
        }
    }

    image
}

fn draw_box(image: &mut RgbImage, face: &FaceBox, color: Rgb<u8>) {
    let x0 = face.x.round() as i64;
    let y0 = face.y.round() as i64;
    let x1 = (face.x + face.width).round() as i64;
    let y1 = (face.y + face.height).round() as i64;

    fill(image, x0, y0, x1, y0 + BOX_THICKNESS, color);
    fill(image, x0, y1 - BOX_THICKNESS, x1, y1, color);
    fill(image, x0, y0, x0 + BOX_THICKNESS, y1, color);
    fill(image, x1 - BOX_THICKNESS, y0, x1, y1, color);
}

/// Fill the half-open rectangle [x0, x1) × [y0, y1), clipped to the image.
fn fill(image: &mut RgbImage, x0: i64, y0: i64, x1: i64, y1: i64, color: Rgb<u8>) {
    for y in y0.max(0)..y1.min(image.height() as i64) {
        for x in x0.max(0)..x1.min(image.width() as i64) {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn put(image: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && x < image.width() as i64 && y < image.height() as i64 {
        image.put_pixel(x as u32, y as u32, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarks::{LandmarkSet, MeshTopology};
    use crate::session::FaceEvent;
    use crate::types::IdentityId;
    use chrono::NaiveDate;

    fn frame() -> Frame {
        Frame {
            data: vec![90u8; 64 * 64],
            width: 64,
            height: 64,
            sequence: 1,
            captured_at: NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
        }
    }

    fn outcome(label: IdentityLabel, marked: bool) -> FaceOutcome {
        FaceOutcome {
            face: FaceBox::new(10.0, 20.0, 30.0, 30.0),
            state: VisualState::derive(&label, marked),
            label,
            score: Some(0.2),
            landmarks: None,
            event: FaceEvent::AlreadyMarked,
        }
    }

    #[test]
    fn test_state_derivation() {
        let ada = IdentityLabel::Known { id: IdentityId(7), name: "Ada".into() };
        assert_eq!(VisualState::derive(&IdentityLabel::Unknown, false), VisualState::Unknown);
        assert_eq!(VisualState::derive(&IdentityLabel::Unknown, true), VisualState::Unknown);
        assert_eq!(VisualState::derive(&ada, false), VisualState::Pending);
        assert_eq!(VisualState::derive(&ada, true), VisualState::Present);
    }

    #[test]
    fn test_annotate_draws_state_color() {
        let ada = IdentityLabel::Known { id: IdentityId(7), name: "Ada".into() };
        let image = annotate(&frame(), &[outcome(ada, true)]);
        assert_eq!(image.dimensions(), (64, 64));
        // Box edge, label plate, untouched interior.
        assert_eq!(*image.get_pixel(10, 30), VisualState::Present.color());
        assert_eq!(*image.get_pixel(20, 14), VisualState::Present.color());
        assert_eq!(*image.get_pixel(25, 35), Rgb([90, 90, 90]));
    }

    #[test]
    fn test_label_plate_does_not_depend_on_name() {
        let ada = IdentityLabel::Known { id: IdentityId(7), name: "Ada".into() };
        let grace = IdentityLabel::Known { id: IdentityId(9), name: "Grace Hopper".into() };
        let a = annotate(&frame(), &[outcome(ada, false)]);
        let b = annotate(&frame(), &[outcome(grace, false)]);
        assert_eq!(a, b);
        for x in 10..40 {
            assert_eq!(*a.get_pixel(x, 14), VisualState::Pending.color());
        }
    }

    #[test]
    fn test_unknown_has_no_label_plate() {
        let image = annotate(&frame(), &[outcome(IdentityLabel::Unknown, false)]);
        assert_eq!(*image.get_pixel(10, 30), VisualState::Unknown.color());
        assert_eq!(*image.get_pixel(20, 14), Rgb([90, 90, 90]));
    }

    #[test]
    fn test_landmarks_and_clipping() {
        let ada = IdentityLabel::Known { id: IdentityId(7), name: "Ada".into() };
        let mut face = outcome(ada, false);
        let topo = MeshTopology { points: 2, eyebrow: 0, eye: 1 };
        face.landmarks = LandmarkSet::new(vec![(25.0, 33.0), (500.0, -4.0)], topo);
        face.face = FaceBox::new(-10.0, 50.0, 100.0, 100.0);
        let image = annotate(&frame(), &[face]);
        assert_eq!(*image.get_pixel(25, 33), VisualState::Pending.color());
        assert_eq!(*image.get_pixel(0, 51), VisualState::Pending.color());
    }
}
