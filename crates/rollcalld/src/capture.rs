//! Enrolment capture: photograph a user into their dataset folder.

use crate::engine::EngineError;
use rollcall_core::FaceEmbedder;
use rollcall_hw::{acquire, CameraError, CameraSource, CaptureHandle};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// How many images a capture aims for and how long it may take.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub images: usize,
    pub timeout: Duration,
    /// Pause after each saved image so the subject can shift pose.
    pub interval: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            images: 10,
            timeout: Duration::from_secs(30),
            interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureReport {
    pub user_id: i64,
    pub images_captured: usize,
    pub directory: PathBuf,
    /// The deadline passed before the target count was reached.
    pub timed_out: bool,
}

/// Dataset folder the enrolment flow uses for `user_id`.
pub fn user_dir(dataset_root: &Path, user_id: i64) -> PathBuf {
    dataset_root.join(format!("user_{user_id}"))
}

pub fn create_user_dir(dataset_root: &Path, user_id: i64) -> Result<PathBuf, EngineError> {
    let dir = user_dir(dataset_root, user_id);
    std::fs::create_dir_all(&dir).map_err(|source| EngineError::Dataset {
        path: dir.clone(),
        source,
    })?;
    Ok(dir)
}

/// Remove the user's folder and its images. A missing folder is not an error.
pub fn remove_user_dir(dataset_root: &Path, user_id: i64) -> Result<(), EngineError> {
    let dir = user_dir(dataset_root, user_id);
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => {
            tracing::info!(dir = %dir.display(), "user dataset folder removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(EngineError::Dataset { path: dir, source }),
    }
}

/// Save frames holding exactly one face as `user.<id>.<n>.jpg` until
/// `settings.images` are stored, the deadline passes, or the source ends.
///
/// The camera is released when this returns, on every path.
pub fn run_capture<E, C>(
    cameras: &C,
    uri: &str,
    acquire_timeout: Duration,
    embedder: &mut E,
    dataset_root: &Path,
    user_id: i64,
    settings: &CaptureSettings,
) -> Result<CaptureReport, EngineError>
where
    E: FaceEmbedder + ?Sized,
    C: CameraSource + ?Sized,
{
    let dir = create_user_dir(dataset_root, user_id)?;
    let mut capture = acquire(cameras, uri, acquire_timeout)?;
    tracing::info!(user_id, dir = %dir.display(), "dataset capture started");

    let deadline = Instant::now() + settings.timeout;
    let mut saved = 0;
    let mut timed_out = false;

    while saved < settings.images {
        if Instant::now() >= deadline {
            tracing::warn!(user_id, saved, "dataset capture timed out");
            timed_out = true;
            break;
        }

        let frame = match capture.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(CameraError::EndOfStream(source)) => {
                tracing::warn!(user_id, saved, %source, "camera ran out of frames during capture");
                break;
            }
            Err(e) => return Err(e.into()),
        };

        let faces = embedder.detect(&frame)?.len();
        if faces != 1 {
            tracing::debug!(faces, "capture frame skipped; expected exactly one face");
            continue;
        }

        let path = dir.join(format!("user.{user_id}.{}.jpg", saved + 1));
        frame
            .to_rgb8()
            .save(&path)
            .map_err(|e| EngineError::Image {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        saved += 1;
        tracing::info!(user_id, image = %path.display(), "dataset image saved");

        if saved < settings.images {
            std::thread::sleep(settings.interval);
        }
    }

    tracing::info!(user_id, saved, "dataset capture finished");
    Ok(CaptureReport {
        user_id,
        images_captured: saved,
        directory: dir,
        timed_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use rollcall_core::ColorEmbedder;
    use rollcall_hw::SystemCameras;

    fn write_frame(dir: &Path, name: &str, img: RgbImage) {
        img.save(dir.join(name)).unwrap();
    }

    /// Left half red, right half green: two faces for a two-band embedder.
    fn two_faces() -> RgbImage {
        RgbImage::from_fn(8, 8, |x, _| {
            if x < 4 {
                Rgb([200, 0, 0])
            } else {
                Rgb([0, 200, 0])
            }
        })
    }

    fn quick(images: usize) -> CaptureSettings {
        CaptureSettings {
            images,
            timeout: Duration::from_secs(5),
            interval: Duration::ZERO,
        }
    }

    /// Left half `color`, right half black: one face for a two-band embedder.
    fn half(color: [u8; 3], left: bool) -> RgbImage {
        RgbImage::from_fn(8, 8, |x, _| if (x < 4) == left { Rgb(color) } else { Rgb([0, 0, 0]) })
    }

    #[test]
    fn test_capture_keeps_only_single_face_frames() {
        let frames = tempfile::tempdir().unwrap();
        let dataset = tempfile::tempdir().unwrap();
        write_frame(frames.path(), "01.png", two_faces());
        write_frame(frames.path(), "02.png", RgbImage::new(8, 8));
        write_frame(frames.path(), "03.png", half([200, 0, 0], true));
        write_frame(frames.path(), "04.png", two_faces());
        write_frame(frames.path(), "05.png", half([0, 0, 200], false));
        write_frame(frames.path(), "06.png", half([0, 200, 0], true));

        let mut embedder = ColorEmbedder::with_bands(2);
        let report = run_capture(
            &SystemCameras,
            &frames.path().to_string_lossy(),
            Duration::from_secs(1),
            &mut embedder,
            dataset.path(),
            7,
            &quick(2),
        )
        .unwrap();

        assert_eq!(report.images_captured, 2);
        assert!(!report.timed_out);
        assert_eq!(report.directory, dataset.path().join("user_7"));
        assert!(report.directory.join("user.7.1.jpg").is_file());
        assert!(report.directory.join("user.7.2.jpg").is_file());
        assert!(!report.directory.join("user.7.3.jpg").exists());
    }

    #[test]
    fn test_capture_skips_frames_without_exactly_one_face() {
        let frames = tempfile::tempdir().unwrap();
        let dataset = tempfile::tempdir().unwrap();
        write_frame(frames.path(), "01.png", two_faces());
        write_frame(frames.path(), "02.png", RgbImage::new(8, 8));
        write_frame(frames.path(), "03.png", two_faces());

        let mut embedder = ColorEmbedder::with_bands(2);
        let report = run_capture(
            &SystemCameras,
            &frames.path().to_string_lossy(),
            Duration::from_secs(1),
            &mut embedder,
            dataset.path(),
            3,
            &quick(10),
        )
        .unwrap();

        // Source ran dry: nothing saved, but the folder exists.
        assert_eq!(report.images_captured, 0);
        assert!(report.directory.is_dir());
        assert_eq!(std::fs::read_dir(&report.directory).unwrap().count(), 0);
    }

    #[test]
    fn test_capture_stops_at_deadline() {
        let frames = tempfile::tempdir().unwrap();
        let dataset = tempfile::tempdir().unwrap();
        for i in 0..5 {
            write_frame(
                frames.path(),
                &format!("{i:02}.png"),
                RgbImage::from_pixel(8, 8, Rgb([200, 0, 0])),
            );
        }

        let settings = CaptureSettings {
            images: 5,
            timeout: Duration::from_millis(150),
            interval: Duration::from_millis(100),
        };
        let report = run_capture(
            &SystemCameras,
            &frames.path().to_string_lossy(),
            Duration::from_secs(1),
            &mut ColorEmbedder::new(),
            dataset.path(),
            9,
            &settings,
        )
        .unwrap();

        assert!(report.timed_out);
        assert!(report.images_captured >= 1 && report.images_captured < 5);
    }

    #[test]
    fn test_capture_without_camera_fails() {
        let dataset = tempfile::tempdir().unwrap();
        let err = run_capture(
            &SystemCameras,
            "/nonexistent/rollcall-frames",
            Duration::from_millis(100),
            &mut ColorEmbedder::new(),
            dataset.path(),
            1,
            &quick(1),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Camera(_)));
    }

    #[test]
    fn test_remove_user_dir_tolerates_missing_folder() {
        let dataset = tempfile::tempdir().unwrap();
        let dir = create_user_dir(dataset.path(), 4).unwrap();
        std::fs::write(dir.join("user.4.1.jpg"), b"x").unwrap();

        remove_user_dir(dataset.path(), 4).unwrap();
        assert!(!dir.exists());
        remove_user_dir(dataset.path(), 4).unwrap();
    }
}
