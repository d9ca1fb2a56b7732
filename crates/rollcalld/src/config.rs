use rollcall_core::TieBreak;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Camera URI: a V4L2 device path, an `rtsp://` stream or an image directory
    /// (default: /dev/video0).
    pub camera_uri: String,
    /// Ceiling on camera acquisition, including busy retries.
    pub camera_timeout: Duration,
    /// Pause between frames while a session is running.
    pub frame_interval: Duration,
    /// Root of the labelled dataset (`<prefix>_<id>/` folders).
    pub dataset_dir: PathBuf,
    /// Fail reloads on any folder that cannot be mapped to a user.
    pub dataset_strict: bool,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Minimum detector score for a face.
    pub detection_confidence: f32,
    /// Faces smaller than this many pixels on either side are ignored.
    pub min_face_size: u32,
    /// Maximum embedding distance still considered a match.
    pub recognition_tolerance: f32,
    /// Minimum confidence for a match to be recorded.
    pub attendance_threshold: f32,
    /// Suppression window used when `dedup_enabled` is set.
    pub attendance_window_mins: i64,
    pub dedup_enabled: bool,
    pub tie_break: TieBreak,
    /// Images a dataset capture aims to save.
    pub capture_images: usize,
    /// Give up on a dataset capture after this long.
    pub capture_timeout: Duration,
    pub capture_interval: Duration,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = data_dir();

        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        let dataset_dir = std::env::var("ROLLCALL_DATASET_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("dataset"));

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let tie_break = match std::env::var("ROLLCALL_TIE_BREAK") {
            Ok(v) => v.parse().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "ignoring ROLLCALL_TIE_BREAK");
                TieBreak::default()
            }),
            Err(_) => TieBreak::default(),
        };

        Self {
            camera_uri: std::env::var("ROLLCALL_CAMERA_URI")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            camera_timeout: Duration::from_secs(env_parse("ROLLCALL_CAMERA_TIMEOUT_SECS", 5)),
            frame_interval: Duration::from_millis(env_parse("ROLLCALL_FRAME_INTERVAL_MS", 500)),
            dataset_dir,
            dataset_strict: env_flag("ROLLCALL_DATASET_STRICT", false),
            model_dir,
            db_path,
            detection_confidence: env_parse("ROLLCALL_DETECTION_CONFIDENCE", 0.5),
            min_face_size: env_parse("ROLLCALL_MIN_FACE_SIZE", 20),
            recognition_tolerance: env_parse("ROLLCALL_RECOGNITION_TOLERANCE", 0.6),
            attendance_threshold: env_parse("ROLLCALL_ATTENDANCE_THRESHOLD", 0.65),
            attendance_window_mins: env_parse("ROLLCALL_ATTENDANCE_WINDOW_MINS", 15),
            dedup_enabled: env_flag("ROLLCALL_DEDUP_ENABLED", false),
            tie_break,
            capture_images: env_parse("ROLLCALL_CAPTURE_IMAGES", 10),
            capture_timeout: Duration::from_secs(env_parse("ROLLCALL_CAPTURE_TIMEOUT_SECS", 30)),
            capture_interval: Duration::from_millis(env_parse("ROLLCALL_CAPTURE_INTERVAL_MS", 500)),
            session_bus: env_flag("ROLLCALL_SESSION_BUS", false),
        }
    }
}

/// `$XDG_DATA_HOME/rollcall`, falling back to `~/.local/share/rollcall`.
fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}
