//! Camera source abstraction and bounded acquisition.

use crate::camera::V4l2Capture;
use crate::replay::ReplayCapture;
#[cfg(feature = "rtsp")]
use crate::rtsp::RtspCapture;
use image::DynamicImage;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Delay between attempts while a device reports busy.
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("unsupported camera uri: {0} (expected /dev/videoN, rtsp://... or an image directory)")]
    Unsupported(String),
    /// The source has no more frames and never will.
    #[error("end of stream: {0}")]
    EndOfStream(String),
    #[error("camera {uri} not acquired within {secs}s")]
    Timeout { uri: String, secs: u64 },
}

/// An open capture. Dropping it releases the device.
pub trait CaptureHandle: Send {
    /// Next frame, or `None` when no usable frame is available right now.
    /// A source that is permanently out of frames returns [`CameraError::EndOfStream`].
    fn read_frame(&mut self) -> Result<Option<DynamicImage>, CameraError>;
}

/// Something that can open captures by URI.
pub trait CameraSource: Send {
    type Capture: CaptureHandle;

    fn open(&self, uri: &str) -> Result<Self::Capture, CameraError>;
}

/// Open `uri`, retrying while the device is busy, for at most `timeout`.
///
/// Any other failure is returned immediately.
pub fn acquire<S>(source: &S, uri: &str, timeout: Duration) -> Result<S::Capture, CameraError>
where
    S: CameraSource + ?Sized,
{
    let deadline = Instant::now() + timeout;
    loop {
        match source.open(uri) {
            Err(CameraError::DeviceBusy) if Instant::now() + BUSY_RETRY_DELAY < deadline => {
                tracing::debug!(uri, "camera busy; retrying");
                std::thread::sleep(BUSY_RETRY_DELAY);
            }
            Err(CameraError::DeviceBusy) => {
                return Err(CameraError::Timeout {
                    uri: uri.to_string(),
                    secs: timeout.as_secs(),
                })
            }
            other => return other,
        }
    }
}

/// Capture opened by [`SystemCameras`].
pub enum Capture {
    Device(V4l2Capture),
    Replay(ReplayCapture),
    #[cfg(feature = "rtsp")]
    Rtsp(RtspCapture),
}

impl CaptureHandle for Capture {
    fn read_frame(&mut self) -> Result<Option<DynamicImage>, CameraError> {
        match self {
            Self::Device(c) => c.read_frame(),
            Self::Replay(c) => c.read_frame(),
            #[cfg(feature = "rtsp")]
            Self::Rtsp(c) => c.read_frame(),
        }
    }
}

/// Dispatches on the URI: `/dev/video*` is a V4L2 device, `rtsp://` a
/// network camera, and an existing directory is replayed image by image.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCameras;

impl CameraSource for SystemCameras {
    type Capture = Capture;

    fn open(&self, uri: &str) -> Result<Capture, CameraError> {
        if uri.starts_with("/dev/video") {
            V4l2Capture::open(uri).map(Capture::Device)
        } else if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            open_rtsp(uri)
        } else if Path::new(uri).is_dir() {
            ReplayCapture::open(uri).map(Capture::Replay)
        } else {
            Err(CameraError::Unsupported(uri.to_string()))
        }
    }
}

#[cfg(feature = "rtsp")]
fn open_rtsp(uri: &str) -> Result<Capture, CameraError> {
    RtspCapture::open(uri).map(Capture::Rtsp)
}

#[cfg(not(feature = "rtsp"))]
fn open_rtsp(uri: &str) -> Result<Capture, CameraError> {
    Err(CameraError::Unsupported(format!("{uri} (built without the rtsp feature)")))
}
