//! rollcall-hw — Camera sources for the recognition loop.
//!
//! A [`CameraSource`] opens a capture by URI (V4L2 device, RTSP stream, or
//! image directory); the returned [`CaptureHandle`]
//! yields frames and releases the device when dropped.

pub mod camera;
pub mod frame;
pub mod replay;
#[cfg(feature = "rtsp")]
pub mod rtsp;
pub mod source;

pub use camera::{DeviceInfo, PixelFormat, V4l2Capture};
pub use replay::ReplayCapture;
#[cfg(feature = "rtsp")]
pub use rtsp::RtspCapture;
pub use source::{acquire, CameraError, CameraSource, Capture, CaptureHandle, SystemCameras};
