//! Directory replay: feeds still images to the loop as if they were frames.
//!
//! Used for bench runs and tests where no camera is attached.

use crate::source::{CameraError, CaptureHandle};
use image::DynamicImage;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

pub struct ReplayCapture {
    dir: PathBuf,
    pending: VecDeque<PathBuf>,
}

impl ReplayCapture {
    /// Queue every image in `dir`, in file name order.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CameraError> {
        let dir = dir.as_ref().to_path_buf();
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| CameraError::DeviceNotFound(format!("{}: {e}", dir.display())))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_image(path))
            .collect();
        files.sort();

        tracing::info!(dir = %dir.display(), frames = files.len(), "replay source opened");
        Ok(Self {
            dir,
            pending: files.into(),
        })
    }

    /// Frames not yet read.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

impl CaptureHandle for ReplayCapture {
    /// [`CameraError::EndOfStream`] once every image has been returned.
    fn read_frame(&mut self) -> Result<Option<DynamicImage>, CameraError> {
        let Some(path) = self.pending.pop_front() else {
            return Err(CameraError::EndOfStream(self.dir.display().to_string()));
        };
        image::open(&path)
            .map(Some)
            .map_err(|e| CameraError::CaptureFailed(format!("{}: {e}", path.display())))
    }
}

impl Drop for ReplayCapture {
    fn drop(&mut self) {
        tracing::debug!(dir = %self.dir.display(), "replay source released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_png(dir: &Path, name: &str, color: [u8; 3]) {
        RgbImage::from_pixel(4, 4, Rgb(color))
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn test_frames_come_back_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "b.png", [0, 255, 0]);
        write_png(dir.path(), "a.png", [255, 0, 0]);
        std::fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

        let mut capture = ReplayCapture::open(dir.path()).unwrap();
        assert_eq!(capture.remaining(), 2);

        let first = capture.read_frame().unwrap().unwrap().to_rgb8();
        assert_eq!(first.get_pixel(0, 0), &Rgb([255, 0, 0]));
        let second = capture.read_frame().unwrap().unwrap().to_rgb8();
        assert_eq!(second.get_pixel(0, 0), &Rgb([0, 255, 0]));
        assert!(matches!(
            capture.read_frame(),
            Err(CameraError::EndOfStream(_))
        ));
        // Stays exhausted.
        assert!(matches!(
            capture.read_frame(),
            Err(CameraError::EndOfStream(_))
        ));
    }

    #[test]
    fn test_corrupt_image_is_a_capture_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.jpg"), b"not a jpeg").unwrap();

        let mut capture = ReplayCapture::open(dir.path()).unwrap();
        assert!(matches!(
            capture.read_frame(),
            Err(CameraError::CaptureFailed(_))
        ));
    }

    #[test]
    fn test_missing_directory() {
        let err = ReplayCapture::open("/nonexistent/rollcall-replay").err().unwrap();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
    }
}
