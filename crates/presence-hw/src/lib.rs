//! presence-hw — Hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access, pixel format conversion to grayscale
//! and CLAHE contrast enhancement for dim classroom lighting.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CameraStream, DeviceInfo, PixelFormat};
pub use frame::{Clahe, Frame};
