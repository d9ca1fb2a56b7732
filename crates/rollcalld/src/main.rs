use anyhow::{Context, Result};
use rollcall_core::{
    AttendanceRecorder, FramePolicy, IdentityResolver, KnownFaceRegistry, OnnxEmbedder, TimeWindow,
};
use rollcall_hw::SystemCameras;
use rollcall_store::SqliteStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod capture;
mod config;
mod dbus_interface;
mod engine;

use capture::CaptureSettings;
use config::Config;
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use engine::{spawn_engine, EngineSettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");
    let config = Config::from_env();

    let embedder = OnnxEmbedder::load(&config.model_dir)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?
        .with_detection_threshold(config.detection_confidence)
        .with_min_face_size(config.min_face_size);
    tracing::info!(dir = %config.model_dir.display(), "face models loaded");

    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;

    let recorder = AttendanceRecorder::new(store);
    let recorder = if config.dedup_enabled {
        tracing::info!(minutes = config.attendance_window_mins, "attendance dedup window enabled");
        recorder.with_policy(TimeWindow::minutes(config.attendance_window_mins))
    } else {
        recorder
    };

    let registry = Arc::new(
        KnownFaceRegistry::new(&config.dataset_dir).with_strict_layout(config.dataset_strict),
    );

    let settings = EngineSettings {
        camera_uri: config.camera_uri.clone(),
        camera_timeout: config.camera_timeout,
        frame_interval: config.frame_interval,
        policy: FramePolicy {
            resolver: IdentityResolver::new(config.recognition_tolerance)
                .with_tie_break(config.tie_break),
            acceptance_threshold: config.attendance_threshold,
        },
        capture: CaptureSettings {
            images: config.capture_images,
            timeout: config.capture_timeout,
            interval: config.capture_interval,
        },
    };
    let engine = spawn_engine(embedder, recorder, SystemCameras, registry.clone(), settings)?;

    // Initial load; afterwards the registry only changes on an explicit Reload.
    if let Err(e) = engine.reload().await {
        tracing::error!(error = %e, "initial registry load failed; starting empty");
    }

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(engine.clone(), registry))?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(
        bus = if config.session_bus { "session" } else { "system" },
        name = BUS_NAME,
        camera = %config.camera_uri,
        "rollcalld ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    if let Ok(true) = engine.stop().await {
        tracing::info!("active session stopped");
    }

    Ok(())
}
