//! rollcall-core — Face-matching attendance pipeline.
//!
//! Frames are encoded by a [`FaceEmbedder`], matched against the
//! [`KnownFaceRegistry`] by an [`IdentityResolver`], and accepted matches
//! become rows through the [`AttendanceRecorder`].

pub mod alignment;
pub mod embedder;
pub mod export;
pub mod onnx;
pub mod pipeline;
pub mod recorder;
pub mod registry;
pub mod resolver;
pub mod types;

pub use export::write_attendance_csv;
pub use embedder::{ColorEmbedder, EmbedderError, EuclideanMetric, FaceEmbedder, FaceMetric};
pub use onnx::OnnxEmbedder;
pub use pipeline::{process_frame, FramePolicy, FrameReport};
pub use recorder::{
    AdmissionPolicy, AttendanceRecorder, AttendanceStore, PassThrough, RecordOutcome,
    RecorderError, TimeWindow, UserStore,
};
pub use registry::{KnownFaceRegistry, RegistryError, RegistryWarning, ReloadReport};
pub use resolver::{IdentityResolver, TieBreak};
pub use types::{
    AttendanceRecord, AttendanceReportRow, AttendanceStatus, BoundingBox, Detection, Embedding,
    KnownFace, MatchResult, NewAttendance, NewUser, Snapshot, User, UserRole, UserUpdate,
};
