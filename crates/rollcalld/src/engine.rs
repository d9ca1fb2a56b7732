use crate::capture::{self, CaptureReport, CaptureSettings};
use chrono::{DateTime, Utc};
use rollcall_core::{
    process_frame, AttendanceRecord, AttendanceRecorder, AttendanceReportRow, EmbedderError,
    FaceEmbedder, FramePolicy, KnownFaceRegistry, NewAttendance, NewUser, RecorderError,
    RegistryError, ReloadReport, User, UserStore, UserUpdate,
};
use rollcall_hw::{acquire, CameraError, CameraSource, CaptureHandle};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("dataset folder {path}: {source}")]
    Dataset {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write image {path}: {reason}")]
    Image { path: PathBuf, reason: String },
    #[error("user {0} not found")]
    UnknownUser(i64),
    #[error("a recognition session is running; stop it first")]
    SessionActive,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Fixed parameters of the recognition loop.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub camera_uri: String,
    pub camera_timeout: Duration,
    pub frame_interval: Duration,
    pub policy: FramePolicy,
    pub capture: CaptureSettings,
}

/// Snapshot of what the engine is doing, as reported over D-Bus.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStatus {
    pub session_active: bool,
    pub subject: Option<String>,
    pub camera_open: bool,
    pub frames_processed: u64,
    pub faces_seen: u64,
    pub recorded: u64,
    pub loaded_users: usize,
    pub last_error: Option<String>,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Reload {
        reply: oneshot::Sender<Result<ReloadReport, EngineError>>,
    },
    Start {
        subject: String,
        reply: oneshot::Sender<bool>,
    },
    Stop {
        reply: oneshot::Sender<bool>,
    },
    Report {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        subject: Option<String>,
        reply: oneshot::Sender<Result<Vec<AttendanceReportRow>, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    CreateUser {
        user: NewUser,
        reply: oneshot::Sender<Result<User, EngineError>>,
    },
    ListUsers {
        offset: u32,
        limit: u32,
        reply: oneshot::Sender<Result<Vec<User>, EngineError>>,
    },
    GetUser {
        user_id: i64,
        reply: oneshot::Sender<Result<Option<User>, EngineError>>,
    },
    UpdateUser {
        user_id: i64,
        update: UserUpdate,
        reply: oneshot::Sender<Result<Option<User>, EngineError>>,
    },
    DeleteUser {
        user_id: i64,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    RecordManual {
        entry: NewAttendance,
        reply: oneshot::Sender<Result<AttendanceRecord, EngineError>>,
    },
    CaptureDataset {
        user_id: i64,
        reply: oneshot::Sender<Result<CaptureReport, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Rebuild the known-face registry from the dataset directory.
    pub async fn reload(&self) -> Result<ReloadReport, EngineError> {
        self.request(|reply| EngineRequest::Reload { reply }).await?
    }

    /// Begin recording attendance for `subject`. `false` if a session is already running.
    pub async fn start(&self, subject: String) -> Result<bool, EngineError> {
        self.request(|reply| EngineRequest::Start { subject, reply })
            .await
    }

    /// Stop the running session and release the camera. `false` if none was running.
    pub async fn stop(&self) -> Result<bool, EngineError> {
        self.request(|reply| EngineRequest::Stop { reply }).await
    }

    pub async fn report(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        subject: Option<String>,
    ) -> Result<Vec<AttendanceReportRow>, EngineError> {
        self.request(|reply| EngineRequest::Report {
            start,
            end,
            subject,
            reply,
        })
        .await?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }

    /// Register a user and create their `user_<id>` dataset folder.
    pub async fn create_user(&self, user: NewUser) -> Result<User, EngineError> {
        self.request(|reply| EngineRequest::CreateUser { user, reply })
            .await?
    }

    pub async fn list_users(&self, offset: u32, limit: u32) -> Result<Vec<User>, EngineError> {
        self.request(|reply| EngineRequest::ListUsers {
            offset,
            limit,
            reply,
        })
        .await?
    }

    pub async fn get_user(&self, user_id: i64) -> Result<Option<User>, EngineError> {
        self.request(|reply| EngineRequest::GetUser { user_id, reply })
            .await?
    }

    pub async fn update_user(
        &self,
        user_id: i64,
        update: UserUpdate,
    ) -> Result<Option<User>, EngineError> {
        self.request(|reply| EngineRequest::UpdateUser {
            user_id,
            update,
            reply,
        })
        .await?
    }

    /// Delete a user and their `user_<id>` dataset folder. `false` if unknown.
    pub async fn delete_user(&self, user_id: i64) -> Result<bool, EngineError> {
        self.request(|reply| EngineRequest::DeleteUser { user_id, reply })
            .await?
    }

    /// Append an attendance row entered by hand.
    pub async fn record_manual(&self, entry: NewAttendance) -> Result<AttendanceRecord, EngineError> {
        self.request(|reply| EngineRequest::RecordManual { entry, reply })
            .await?
    }

    /// Photograph `user_id` into their dataset folder. Refused while a session runs.
    pub async fn capture_dataset(&self, user_id: i64) -> Result<CaptureReport, EngineError> {
        self.request(|reply| EngineRequest::CaptureDataset { user_id, reply })
            .await?
    }
}

fn store_error(e: impl std::error::Error + Send + Sync + 'static) -> EngineError {
    EngineError::Store(Box::new(e))
}

struct Session<C> {
    subject: String,
    capture: Option<C>,
    frames_processed: u64,
    faces_seen: u64,
    recorded: u64,
}

struct Worker<E, S, C: CameraSource> {
    embedder: E,
    recorder: AttendanceRecorder<S>,
    cameras: C,
    registry: Arc<KnownFaceRegistry>,
    settings: EngineSettings,
    session: Option<Session<C::Capture>>,
    last_error: Option<String>,
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the embedder, the recorder and the camera source. While
/// idle it blocks on requests; while a session runs it processes one frame
/// per `frame_interval` and drains pending requests between frames.
pub fn spawn_engine<E, S, C>(
    embedder: E,
    recorder: AttendanceRecorder<S>,
    cameras: C,
    registry: Arc<KnownFaceRegistry>,
    settings: EngineSettings,
) -> Result<EngineHandle, EngineError>
where
    E: FaceEmbedder + 'static,
    S: UserStore + Send + 'static,
    C: CameraSource + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    let mut worker = Worker {
        embedder,
        recorder,
        cameras,
        registry,
        settings,
        session: None,
        last_error: None,
    };

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            loop {
                let request = if worker.session.is_some() {
                    match rx.try_recv() {
                        Ok(req) => Some(req),
                        Err(TryRecvError::Empty) => None,
                        Err(TryRecvError::Disconnected) => break,
                    }
                } else {
                    match rx.blocking_recv() {
                        Some(req) => Some(req),
                        None => break,
                    }
                };

                match request {
                    Some(req) => worker.handle(req),
                    None => {
                        worker.run_cycle();
                        std::thread::sleep(worker.settings.frame_interval);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

impl<E, S, C> Worker<E, S, C>
where
    E: FaceEmbedder,
    S: UserStore,
    C: CameraSource,
{
    fn handle(&mut self, request: EngineRequest) {
        match request {
            EngineRequest::Reload { reply } => {
                let result = self
                    .registry
                    .reload(&mut self.embedder)
                    .map_err(EngineError::from);
                match &result {
                    Ok(report) => {
                        for warning in &report.warnings {
                            tracing::warn!(%warning, "reload warning");
                        }
                        tracing::info!(
                            loaded = report.loaded,
                            users = report.users,
                            warnings = report.warnings.len(),
                            "registry reloaded"
                        );
                    }
                    Err(e) => tracing::error!(error = %e, "reload failed; previous registry kept"),
                }
                let _ = reply.send(result);
            }
            EngineRequest::Start { subject, reply } => {
                let started = self.session.is_none();
                if started {
                    tracing::info!(subject = %subject, "session started");
                    self.last_error = None;
                    self.session = Some(Session {
                        subject,
                        capture: None,
                        frames_processed: 0,
                        faces_seen: 0,
                        recorded: 0,
                    });
                } else {
                    tracing::warn!(subject = %subject, "session already running; start ignored");
                }
                let _ = reply.send(started);
            }
            EngineRequest::Stop { reply } => {
                // Dropping the session drops the capture, which releases the device.
                let stopped = match self.session.take() {
                    Some(session) => {
                        tracing::info!(
                            subject = %session.subject,
                            frames = session.frames_processed,
                            recorded = session.recorded,
                            "session stopped"
                        );
                        true
                    }
                    None => false,
                };
                let _ = reply.send(stopped);
            }
            EngineRequest::Report {
                start,
                end,
                subject,
                reply,
            } => {
                let result = self
                    .recorder
                    .report(start, end, subject.as_deref())
                    .map_err(store_error);
                let _ = reply.send(result);
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
            EngineRequest::CreateUser { user, reply } => {
                let _ = reply.send(self.create_user(&user));
            }
            EngineRequest::ListUsers {
                offset,
                limit,
                reply,
            } => {
                let result = self
                    .recorder
                    .store()
                    .users(offset, limit)
                    .map_err(store_error);
                let _ = reply.send(result);
            }
            EngineRequest::GetUser { user_id, reply } => {
                let result = self.recorder.store().user(user_id).map_err(store_error);
                let _ = reply.send(result);
            }
            EngineRequest::UpdateUser {
                user_id,
                update,
                reply,
            } => {
                let result = self
                    .recorder
                    .store_mut()
                    .update_user(user_id, &update)
                    .map_err(store_error);
                let _ = reply.send(result);
            }
            EngineRequest::DeleteUser { user_id, reply } => {
                let _ = reply.send(self.delete_user(user_id));
            }
            EngineRequest::RecordManual { entry, reply } => {
                let result = self.recorder.record_manual(&entry).map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::CaptureDataset { user_id, reply } => {
                let _ = reply.send(self.capture_dataset(user_id));
            }
        }
    }

    fn create_user(&mut self, user: &NewUser) -> Result<User, EngineError> {
        let created = self
            .recorder
            .store_mut()
            .create_user(user)
            .map_err(store_error)?;
        // The row is committed; a missing folder is recreated by the next capture.
        if let Err(e) = capture::create_user_dir(self.registry.dataset_root(), created.id) {
            tracing::warn!(user_id = created.id, error = %e, "user folder not created");
        }
        Ok(created)
    }

    fn delete_user(&mut self, user_id: i64) -> Result<bool, EngineError> {
        let deleted = self
            .recorder
            .store_mut()
            .delete_user(user_id)
            .map_err(store_error)?;
        if deleted {
            capture::remove_user_dir(self.registry.dataset_root(), user_id)?;
        }
        Ok(deleted)
    }

    fn capture_dataset(&mut self, user_id: i64) -> Result<CaptureReport, EngineError> {
        if self.session.is_some() {
            return Err(EngineError::SessionActive);
        }
        if self
            .recorder
            .store()
            .user(user_id)
            .map_err(store_error)?
            .is_none()
        {
            return Err(EngineError::UnknownUser(user_id));
        }
        capture::run_capture(
            &self.cameras,
            &self.settings.camera_uri,
            self.settings.camera_timeout,
            &mut self.embedder,
            self.registry.dataset_root(),
            user_id,
            &self.settings.capture,
        )
    }

    fn status(&self) -> EngineStatus {
        let mut status = EngineStatus {
            loaded_users: self.registry.snapshot().user_ids().len(),
            last_error: self.last_error.clone(),
            ..EngineStatus::default()
        };
        if let Some(session) = &self.session {
            status.session_active = true;
            status.subject = Some(session.subject.clone());
            status.camera_open = session.capture.is_some();
            status.frames_processed = session.frames_processed;
            status.faces_seen = session.faces_seen;
            status.recorded = session.recorded;
        }
        status
    }

    /// One frame: acquire the camera if needed, read, process.
    ///
    /// Camera failures drop the capture and are retried on the next cycle.
    fn run_cycle(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        if session.capture.is_none() {
            match acquire(
                &self.cameras,
                &self.settings.camera_uri,
                self.settings.camera_timeout,
            ) {
                Ok(capture) => session.capture = Some(capture),
                Err(e) => {
                    tracing::warn!(uri = %self.settings.camera_uri, error = %e, "camera unavailable");
                    self.last_error = Some(e.to_string());
                    return;
                }
            }
        }
        let Some(capture) = session.capture.as_mut() else {
            return;
        };

        let frame = match capture.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(CameraError::EndOfStream(source)) => {
                tracing::warn!(
                    subject = %session.subject,
                    %source,
                    frames = session.frames_processed,
                    recorded = session.recorded,
                    "camera stream ended; session stopped"
                );
                self.last_error = Some(format!("end of stream: {source}"));
                self.session = None;
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "frame read failed; releasing camera");
                self.last_error = Some(e.to_string());
                session.capture = None;
                return;
            }
        };

        let snapshot = self.registry.snapshot();
        match process_frame(
            &frame,
            &mut self.embedder,
            &snapshot,
            &self.settings.policy,
            &mut self.recorder,
            &session.subject,
        ) {
            Ok(report) => {
                session.frames_processed += 1;
                session.faces_seen += report.matches.len() as u64;
                session.recorded += report.recorded as u64;
            }
            Err(e) => {
                tracing::warn!(error = %e, "frame processing failed");
                self.last_error = Some(e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use rollcall_core::{AttendanceStatus, ColorEmbedder, IdentityResolver, UserRole};
    use rollcall_hw::SystemCameras;
    use rollcall_store::SqliteStore;
    use std::path::Path;
    use tempfile::TempDir;

    const RED: [u8; 3] = [220, 30, 30];

    fn write_face(dir: &Path, name: &str, color: [u8; 3]) {
        std::fs::create_dir_all(dir).unwrap();
        RgbImage::from_pixel(8, 8, Rgb(color))
            .save(dir.join(name))
            .unwrap();
    }

    fn new_user(national_id: &str, first_name: &str) -> NewUser {
        NewUser {
            national_id: national_id.into(),
            first_name: first_name.into(),
            last_name: "Gómez".into(),
            role: UserRole::Student,
            schedule: None,
            faculty: None,
            university: None,
        }
    }

    struct Fixture {
        dataset: TempDir,
        _frames: TempDir,
        handle: EngineHandle,
    }

    /// Engine over an empty store; the camera replays `frames` red images
    /// unless `camera_uri` says otherwise.
    fn spawn(camera_uri: Option<&str>, frames: usize) -> Fixture {
        let dataset = tempfile::tempdir().unwrap();
        let frame_dir = tempfile::tempdir().unwrap();
        for i in 0..frames {
            write_face(frame_dir.path(), &format!("{i:04}.png"), RED);
        }

        let uri = camera_uri
            .map(str::to_string)
            .unwrap_or_else(|| frame_dir.path().to_string_lossy().into_owned());
        let handle = spawn_engine(
            ColorEmbedder::new(),
            AttendanceRecorder::new(SqliteStore::open_in_memory().unwrap()),
            SystemCameras,
            Arc::new(KnownFaceRegistry::new(dataset.path())),
            EngineSettings {
                camera_uri: uri,
                camera_timeout: Duration::from_millis(200),
                frame_interval: Duration::from_millis(10),
                policy: FramePolicy {
                    resolver: IdentityResolver::new(0.6),
                    acceptance_threshold: 0.65,
                },
                capture: CaptureSettings {
                    images: 3,
                    timeout: Duration::from_secs(5),
                    interval: Duration::ZERO,
                },
            },
        )
        .unwrap();

        Fixture {
            dataset,
            _frames: frame_dir,
            handle,
        }
    }

    /// Create a user through the engine and give them one enrolment image.
    async fn enrol(fx: &Fixture, national_id: &str, color: [u8; 3]) -> User {
        let user = fx.handle.create_user(new_user(national_id, "María")).await.unwrap();
        let folder = fx.dataset.path().join(format!("user_{}", user.id));
        assert!(folder.is_dir());
        write_face(&folder, "a.png", color);
        user
    }

    async fn wait_for(handle: &EngineHandle, done: impl Fn(&EngineStatus) -> bool) -> EngineStatus {
        for _ in 0..300 {
            let status = handle.status().await.unwrap();
            if done(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("engine did not reach expected state");
    }

    fn last_hour() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc::now() - chrono::Duration::hours(1),
            Utc::now() + chrono::Duration::hours(1),
        )
    }

    #[tokio::test]
    async fn test_user_created_through_engine_gets_recorded() {
        let fx = spawn(None, 100);
        let maria = enrol(&fx, "12345678", RED).await;
        let reload = fx.handle.reload().await.unwrap();
        assert_eq!(reload.users, 1);

        assert!(fx.handle.start("Math101".into()).await.unwrap());
        assert!(!fx.handle.start("History".into()).await.unwrap());

        let status = wait_for(&fx.handle, |s| s.recorded >= 1).await;
        assert_eq!(status.subject.as_deref(), Some("Math101"));
        assert!(status.camera_open);

        assert!(fx.handle.stop().await.unwrap());
        assert!(!fx.handle.stop().await.unwrap());

        let (from, to) = last_hour();
        let rows = fx.handle.report(from, to, Some("Math101".into())).await.unwrap();
        assert!(!rows.is_empty());
        assert_eq!(rows[0].record.user_id, maria.id);
        assert_eq!(rows[0].last_name, "Gómez");
    }

    #[tokio::test]
    async fn test_nothing_recorded_before_reload() {
        let fx = spawn(None, 100);
        enrol(&fx, "12345678", RED).await;
        assert!(fx.handle.start("Math101".into()).await.unwrap());

        let status = wait_for(&fx.handle, |s| s.frames_processed >= 1).await;
        assert_eq!(status.loaded_users, 0);
        assert_eq!(status.recorded, 0);
        assert_eq!(status.faces_seen, 1);
    }

    #[tokio::test]
    async fn test_unavailable_camera_keeps_session_running() {
        let fx = spawn(Some("/nonexistent/rollcall-camera"), 0);
        assert!(fx.handle.start("Physics".into()).await.unwrap());

        let status = wait_for(&fx.handle, |s| s.last_error.is_some()).await;
        assert!(status.session_active);
        assert!(!status.camera_open);
        assert!(fx.handle.stop().await.unwrap());
    }

    #[tokio::test]
    async fn test_exhausted_replay_ends_session_with_error() {
        let fx = spawn(None, 2);
        enrol(&fx, "12345678", RED).await;
        fx.handle.reload().await.unwrap();
        assert!(fx.handle.start("Math101".into()).await.unwrap());

        let status = wait_for(&fx.handle, |s| !s.session_active).await;
        let error = status.last_error.unwrap_or_default();
        assert!(error.contains("end of stream"), "{error}");
        assert!(!fx.handle.stop().await.unwrap());

        let (from, to) = last_hour();
        assert_eq!(fx.handle.report(from, to, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_user_crud_round_trip() {
        let fx = spawn(None, 0);
        let ana = fx.handle.create_user(new_user("V-1", "Ana")).await.unwrap();
        let luis = fx.handle.create_user(new_user("V-2", "Luis")).await.unwrap();
        assert!(fx.handle.create_user(new_user("V-1", "Dup")).await.is_err());

        let all = fx.handle.list_users(0, 100).await.unwrap();
        assert_eq!(all.iter().map(|u| u.id).collect::<Vec<_>>(), vec![ana.id, luis.id]);
        assert_eq!(fx.handle.list_users(1, 100).await.unwrap().len(), 1);

        let update = UserUpdate {
            schedule: Some("Evening".into()),
            ..UserUpdate::default()
        };
        let updated = fx.handle.update_user(luis.id, update).await.unwrap().unwrap();
        assert_eq!(updated.schedule.as_deref(), Some("Evening"));
        assert_eq!(fx.handle.get_user(luis.id).await.unwrap(), Some(updated));

        let folder = fx.dataset.path().join(format!("user_{}", ana.id));
        write_face(&folder, "a.png", RED);
        assert!(fx.handle.delete_user(ana.id).await.unwrap());
        assert!(!folder.exists());
        assert_eq!(fx.handle.get_user(ana.id).await.unwrap(), None);
        assert!(!fx.handle.delete_user(ana.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_manual_attendance_is_reported() {
        let fx = spawn(None, 0);
        let ana = fx.handle.create_user(new_user("V-1", "Ana")).await.unwrap();

        let row = fx
            .handle
            .record_manual(NewAttendance {
                user_id: ana.id,
                subject: "Chemistry".into(),
                timestamp: Utc::now() - chrono::Duration::minutes(5),
                confidence: 0.0,
                status: AttendanceStatus::Absent,
            })
            .await
            .unwrap();
        assert_eq!(row.status, AttendanceStatus::Absent);

        let unknown = fx
            .handle
            .record_manual(NewAttendance {
                user_id: ana.id + 50,
                subject: "Chemistry".into(),
                timestamp: Utc::now(),
                confidence: 0.5,
                status: AttendanceStatus::Present,
            })
            .await;
        assert!(matches!(unknown, Err(EngineError::Recorder(_))));

        let (from, to) = last_hour();
        let rows = fx.handle.report(from, to, Some("Chemistry".into())).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].first_name, "Ana");
    }

    #[tokio::test]
    async fn test_capture_dataset_fills_user_folder() {
        let fx = spawn(None, 5);
        let ana = fx.handle.create_user(new_user("V-1", "Ana")).await.unwrap();

        let report = fx.handle.capture_dataset(ana.id).await.unwrap();
        assert_eq!(report.images_captured, 3);
        for n in 1..=3 {
            let image = report.directory.join(format!("user.{}.{n}.jpg", ana.id));
            assert!(image.is_file(), "{}", image.display());
        }

        // The captured images are what the next reload learns.
        let reload = fx.handle.reload().await.unwrap();
        assert_eq!(reload.loaded, 3);
        assert_eq!(reload.users, 1);
    }

    #[tokio::test]
    async fn test_capture_refused_for_unknown_user_or_running_session() {
        let fx = spawn(None, 100);
        assert!(matches!(
            fx.handle.capture_dataset(41).await,
            Err(EngineError::UnknownUser(41))
        ));

        let ana = fx.handle.create_user(new_user("V-1", "Ana")).await.unwrap();
        assert!(fx.handle.start("Art".into()).await.unwrap());
        assert!(matches!(
            fx.handle.capture_dataset(ana.id).await,
            Err(EngineError::SessionActive)
        ));
        assert!(fx.handle.stop().await.unwrap());
    }
}
