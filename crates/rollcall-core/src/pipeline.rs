//! One pass of the recognition loop over a single frame.

use crate::embedder::{EmbedderError, FaceEmbedder};
use crate::recorder::{AttendanceRecorder, AttendanceStore};
use crate::resolver::IdentityResolver;
use crate::types::{MatchResult, Snapshot};
use image::DynamicImage;

/// What happened to one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    /// One result per detected face, in detection order.
    pub matches: Vec<MatchResult>,
    /// Rows actually written.
    pub recorded: usize,
}

/// Per-frame policy values.
#[derive(Debug, Clone, Copy)]
pub struct FramePolicy {
    pub resolver: IdentityResolver,
    /// Minimum confidence for a match to reach the recorder.
    pub acceptance_threshold: f32,
}

/// Detect faces in `frame`, resolve each against `snapshot`, and record
/// every identified face whose confidence clears the acceptance threshold.
///
/// Faces are independent: one face failing to match or record does not
/// affect the others.
pub fn process_frame<E, S>(
    frame: &DynamicImage,
    embedder: &mut E,
    snapshot: &Snapshot,
    policy: &FramePolicy,
    recorder: &mut AttendanceRecorder<S>,
    subject: &str,
) -> Result<FrameReport, EmbedderError>
where
    E: FaceEmbedder + ?Sized,
    S: AttendanceStore,
{
    let detections = embedder.detect(frame)?;
    let mut report = FrameReport::default();

    for detection in &detections {
        let result = policy.resolver.resolve(&detection.embedding, snapshot, &*embedder);
        report.matches.push(result);

        let Some(user_id) = result.user_id else {
            continue;
        };
        if result.confidence < policy.acceptance_threshold {
            tracing::debug!(
                user_id,
                confidence = result.confidence,
                "match below attendance threshold"
            );
            continue;
        }
        if recorder.record(user_id, subject, result.confidence) {
            report.recorded += 1;
        }
    }

    tracing::debug!(
        faces = detections.len(),
        recorded = report.recorded,
        "frame processed"
    );
    Ok(report)
}
