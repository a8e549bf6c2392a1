//! Face alignment and crop sampling.
//!
//! Warps detected faces into the canonical 112×112 ArcFace position using a
//! 4-DOF similarity transform fitted to the five detector keypoints, and
//! resamples arbitrary face regions for the landmark model.

use crate::types::{FaceBox, Frame};

/// ArcFace reference keypoints for a 112×112 output.
pub const REFERENCE_KEYPOINTS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

/// Similarity transform `dst = [[a, -b], [b, a]] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` points onto `dst` points.
    ///
    /// Closed form on centered coordinates; degenerate input (all source
    /// points coincident) yields a pure translation.
    pub fn estimate(src: &[(f32, f32)], dst: &[(f32, f32)]) -> Self {
        let n = src.len().min(dst.len()).max(1) as f32;
        let mean = |pts: &[(f32, f32)]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
            (sx / n, sy / n)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut norm = 0.0f32;
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx - msx, sy - msy);
            let (dx, dy) = (dx - mdx, dy - mdy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }

        let (a, b) = if norm > 1e-12 { (dot / norm, cross / norm) } else { (1.0, 0.0) };
        Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    /// Map a destination point back into source coordinates.
    pub fn invert(&self, (x, y): (f32, f32)) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some(((self.a * dx + self.b * dy) / det, (-self.b * dx + self.a * dy) / det))
    }
}

/// Bilinear sample of the frame at a sub-pixel position; outside reads as 0.
pub fn sample_bilinear(frame: &Frame, x: f32, y: f32) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let p = |px: i64, py: i64| frame.pixel(px, py) as f32;
    p(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + p(x0 + 1, y0) * fx * (1.0 - fy)
        + p(x0, y0 + 1) * (1.0 - fx) * fy
        + p(x0 + 1, y0 + 1) * fx * fy
}

fn warp(frame: &Frame, transform: &Similarity, out_size: usize) -> Vec<u8> {
    let mut output = vec![0u8; out_size * out_size];
    for oy in 0..out_size {
        for ox in 0..out_size {
            let Some((sx, sy)) = transform.invert((ox as f32, oy as f32)) else {
                return output;
            };
            output[oy * out_size + ox] = sample_bilinear(frame, sx, sy).round().clamp(0.0, 255.0) as u8;
        }
    }
    output
}

/// Align a face to a 112×112 crop for embedding extraction.
///
/// Uses the detector keypoints when present; otherwise falls back to a
/// square crop around the box center.
pub fn align_face(frame: &Frame, face: &FaceBox) -> Vec<u8> {
    match &face.keypoints {
        Some(kps) => {
            let transform = Similarity::estimate(kps, &REFERENCE_KEYPOINTS_112);
            warp(frame, &transform, ALIGNED_SIZE)
        }
        None => {
            let side = face.width.max(face.height);
            let square = FaceBox::new(
                face.x + (face.width - side) / 2.0,
                face.y + (face.height - side) / 2.0,
                side,
                side,
            );
            crop_resize(frame, &square, ALIGNED_SIZE)
        }
    }
}

/// Resample `region` of the frame into a `size`×`size` grayscale crop.
pub fn crop_resize(frame: &Frame, region: &FaceBox, size: usize) -> Vec<u8> {
    if size == 0 || region.width <= 0.0 || region.height <= 0.0 {
        return vec![0u8; size * size];
    }
    let step_x = region.width / size as f32;
    let step_y = region.height / size as f32;

    let mut output = vec![0u8; size * size];
    for oy in 0..size {
        let src_y = region.y + (oy as f32 + 0.5) * step_y - 0.5;
        for ox in 0..size {
            let src_x = region.x + (ox as f32 + 0.5) * step_x - 0.5;
            output[oy * size + ox] = sample_bilinear(frame, src_x, src_y).round().clamp(0.0, 255.0) as u8;
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn frame(width: u32, height: u32, fill: u8) -> Frame {
        Frame {
            data: vec![fill; (width * height) as usize],
            width,
            height,
            sequence: 0,
            captured_at: NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
        }
    }

    #[test]
    fn test_identity_transform() {
        let t = Similarity::estimate(&REFERENCE_KEYPOINTS_112, &REFERENCE_KEYPOINTS_112);
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_scaled_transform() {
        // Source keypoints at 2x scale: transform should halve them.
        let src: Vec<(f32, f32)> = REFERENCE_KEYPOINTS_112
            .iter()
            .map(|&(x, y)| (x * 2.0 + 10.0, y * 2.0 - 4.0))
            .collect();
        let t = Similarity::estimate(&src, &REFERENCE_KEYPOINTS_112);
        assert!((t.a - 0.5).abs() < 1e-3, "a = {}", t.a);
        let (x, y) = t.apply(src[2]);
        assert!((x - REFERENCE_KEYPOINTS_112[2].0).abs() < 1e-2);
        assert!((y - REFERENCE_KEYPOINTS_112[2].1).abs() < 1e-2);
    }

    #[test]
    fn test_rotation_inverts() {
        let t = Similarity { a: 0.0, b: 1.0, tx: 5.0, ty: -3.0 };
        let p = (12.0, 7.0);
        let back = t.invert(t.apply(p)).unwrap();
        assert!((back.0 - p.0).abs() < 1e-4 && (back.1 - p.1).abs() < 1e-4);
    }

    #[test]
    fn test_degenerate_transform_has_no_inverse() {
        let t = Similarity { a: 0.0, b: 0.0, tx: 0.0, ty: 0.0 };
        assert!(t.invert((1.0, 1.0)).is_none());
    }

    #[test]
    fn test_align_face_output_size() {
        let f = frame(640, 480, 128);
        let mut face = FaceBox::new(100.0, 100.0, 120.0, 150.0);
        assert_eq!(align_face(&f, &face).len(), ALIGNED_SIZE * ALIGNED_SIZE);
        face.keypoints = Some(REFERENCE_KEYPOINTS_112);
        assert_eq!(align_face(&f, &face).len(), ALIGNED_SIZE * ALIGNED_SIZE);
    }

    #[test]
    fn test_keypoint_lands_on_reference() {
        let mut f = frame(200, 200, 0);
        let kps: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        // Bright 5x5 patch at the left eye survives interpolation.
        for dy in 0..5 {
            for dx in 0..5 {
                f.data[(58 + dy) * 200 + 78 + dx] = 255;
            }
        }
        let mut face = FaceBox::new(60.0, 40.0, 80.0, 90.0);
        face.keypoints = Some(kps);
        let aligned = align_face(&f, &face);

        let rx = REFERENCE_KEYPOINTS_112[0].0.round() as usize;
        let ry = REFERENCE_KEYPOINTS_112[0].1.round() as usize;
        let max_val = (ry - 1..=ry + 1)
            .flat_map(|y| (rx - 1..=rx + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned[y * ALIGNED_SIZE + x])
            .max()
            .unwrap();
        assert!(max_val > 100, "expected bright patch near reference left eye, max={max_val}");
    }

    #[test]
    fn test_crop_resize_uniform() {
        let f = frame(100, 100, 128);
        let out = crop_resize(&f, &FaceBox::new(10.0, 10.0, 50.0, 50.0), 192);
        assert_eq!(out.len(), 192 * 192);
        assert!(out.iter().all(|&p| p == 128), "uniform crop should stay uniform");
    }

    #[test]
    fn test_crop_resize_empty_region() {
        let f = frame(10, 10, 200);
        let out = crop_resize(&f, &FaceBox::new(0.0, 0.0, 0.0, 5.0), 4);
        assert_eq!(out, vec![0u8; 16]);
    }
}
