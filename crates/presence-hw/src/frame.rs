//! Frame type and image processing — format conversion, dark detection, CLAHE.

use std::time::SystemTime;

/// A captured grayscale camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Wall-clock time the buffer was dequeued.
    pub captured_at: SystemTime,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {format} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            format: "YUYV",
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Downscale 16-bit little-endian grayscale to 8 bits (keeps the high byte).
pub fn y16_to_grayscale(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if y16.len() < expected {
        return Err(FrameError::InvalidLength {
            format: "Y16",
            expected,
            actual: y16.len(),
        });
    }
    Ok(y16[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

/// Copy out an 8-bit grayscale buffer, checking its length.
pub fn grey_to_grayscale(grey: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height) as usize;
    if grey.len() < expected {
        return Err(FrameError::InvalidLength {
            format: "GREY",
            expected,
            actual: grey.len(),
        });
    }
    Ok(grey[..expected].to_vec())
}

/// Check if a frame is dark: more than `threshold_pct` of pixels below 32.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

/// Contrast-Limited Adaptive Histogram Equalization.
///
/// Divides the image into a square grid of tiles, computes a clipped
/// histogram per tile, builds CDFs, and bilinearly interpolates between
/// neighbouring tile CDFs for smooth output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clahe {
    pub tiles: u32,
    /// Histogram clip limit as a fraction of tile pixels.
    pub clip_limit: f32,
}

impl Default for Clahe {
    fn default() -> Self {
        Self {
            tiles: 8,
            clip_limit: 0.02,
        }
    }
}

impl Clahe {
    /// Enhance `gray` in place. Images smaller than the tile grid are left alone.
    pub fn apply(&self, gray: &mut [u8], width: u32, height: u32) {
        let w = width as usize;
        let h = height as usize;
        let t = self.tiles as usize;
        if w == 0 || h == 0 || t == 0 || gray.len() < w * h {
            return;
        }
        let tile_w = w / t;
        let tile_h = h / t;
        if tile_w == 0 || tile_h == 0 {
            return;
        }

        let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(t * t);
        for row in 0..t {
            for col in 0..t {
                cdfs.push(self.tile_cdf(gray, w, col * tile_w, row * tile_h, tile_w, tile_h));
            }
        }

        for y in 0..h {
            let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, (t - 1) as f32);
            let r0 = fy as usize;
            let r1 = (r0 + 1).min(t - 1);
            let dy = fy - r0 as f32;

            for x in 0..w {
                let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, (t - 1) as f32);
                let c0 = fx as usize;
                let c1 = (c0 + 1).min(t - 1);
                let dx = fx - c0 as f32;

                let pixel = gray[y * w + x] as usize;
                let top = cdfs[r0 * t + c0][pixel] * (1.0 - dx) + cdfs[r0 * t + c1][pixel] * dx;
                let bot = cdfs[r1 * t + c0][pixel] * (1.0 - dx) + cdfs[r1 * t + c1][pixel] * dx;
                gray[y * w + x] = (top * (1.0 - dy) + bot * dy).round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    fn tile_cdf(&self, gray: &[u8], stride: usize, x0: usize, y0: usize, tw: usize, th: usize) -> [f32; 256] {
        let mut hist = [0u32; 256];
        for y in y0..y0 + th {
            for &p in &gray[y * stride + x0..y * stride + x0 + tw] {
                hist[p as usize] += 1;
            }
        }

        let pixels = tw * th;
        let clip = ((self.clip_limit * pixels as f32) as u32).max(1);
        let mut excess = 0u32;
        for bin in hist.iter_mut() {
            if *bin > clip {
                excess += *bin - clip;
                *bin = clip;
            }
        }
        let redist = excess / 256;
        let leftover = (excess % 256) as usize;
        for (i, bin) in hist.iter_mut().enumerate() {
            *bin += redist + u32::from(i < leftover);
        }

        let mut cdf = [0f32; 256];
        let mut acc = 0f32;
        for (slot, &count) in cdf.iter_mut().zip(hist.iter()) {
            acc += count as f32;
            *slot = acc;
        }
        let cdf_min = cdf.iter().copied().find(|&v| v > 0.0).unwrap_or(0.0);
        let denom = pixels as f32 - cdf_min;
        if denom > 0.0 {
            for v in cdf.iter_mut() {
                *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
            }
        }
        cdf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_grayscale() {
        // 4x2 image = 8 pixels, 16 YUYV bytes
        let yuyv: Vec<u8> = (0..16).collect();
        let gray = yuyv_to_grayscale(&yuyv, 4, 2).unwrap();
        assert_eq!(gray, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn test_short_buffers_rejected() {
        assert!(yuyv_to_grayscale(&[100, 128], 2, 1).is_err());
        assert!(y16_to_grayscale(&[0; 3], 2, 1).is_err());
        assert!(grey_to_grayscale(&[0; 3], 2, 2).is_err());
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        // 0x1234 and 0xff00, little-endian
        let gray = y16_to_grayscale(&[0x34, 0x12, 0x00, 0xff], 2, 1).unwrap();
        assert_eq!(gray, vec![0x12, 0xff]);
    }

    #[test]
    fn test_dark_frame_detection() {
        assert!(is_dark_frame(&[], 0.95));
        assert!(is_dark_frame(&[0u8; 1000], 0.95));
        assert!(!is_dark_frame(&[128u8; 1000], 0.95));

        // 96% dark is dark; 94% is not.
        let mut gray = vec![10u8; 960];
        gray.extend(vec![128u8; 40]);
        assert!(is_dark_frame(&gray, 0.95));
        let mut gray = vec![10u8; 940];
        gray.extend(vec![128u8; 60]);
        assert!(!is_dark_frame(&gray, 0.95));
    }

    #[test]
    fn test_clahe_increases_contrast() {
        // Low-contrast 16x16 image: all pixels between 100–110
        let (w, h) = (16u32, 16u32);
        let mut gray: Vec<u8> = (0..(w * h) as usize).map(|i| 100 + (i % 11) as u8).collect();

        let before = stddev(&gray);
        Clahe { tiles: 2, clip_limit: 0.02 }.apply(&mut gray, w, h);
        let after = stddev(&gray);
        assert!(after > before, "orig={before:.2}, new={after:.2}");
    }

    #[test]
    fn test_clahe_ignores_tiny_images() {
        let mut gray = vec![50u8, 60, 70, 80];
        Clahe::default().apply(&mut gray, 2, 2);
        assert_eq!(gray, vec![50, 60, 70, 80]);
    }

    fn stddev(data: &[u8]) -> f32 {
        let n = data.len() as f32;
        let mean = data.iter().map(|&b| b as f32).sum::<f32>() / n;
        let variance = data.iter().map(|&b| (b as f32 - mean).powi(2)).sum::<f32>() / n;
        variance.sqrt()
    }
}
