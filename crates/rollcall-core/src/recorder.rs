//! Attendance recording on top of an append-only store.

use crate::types::{
    AttendanceRecord, AttendanceReportRow, AttendanceStatus, NewAttendance, NewUser, User,
    UserUpdate,
};
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

/// Durable home for users and attendance rows.
///
/// `append` must be atomic: on error nothing of the attempted write remains.
pub trait AttendanceStore {
    type Error: std::error::Error + Send + Sync + 'static;

    fn append(&mut self, record: &NewAttendance) -> Result<AttendanceRecord, Self::Error>;

    /// Timestamp of the newest row for this user and subject.
    fn latest_for(&self, user_id: i64, subject: &str) -> Result<Option<DateTime<Utc>>, Self::Error>;

    /// Rows with `start <= timestamp <= end`, optionally for one subject,
    /// ordered by timestamp.
    fn records_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        subject: Option<&str>,
    ) -> Result<Vec<AttendanceReportRow>, Self::Error>;

    fn user(&self, user_id: i64) -> Result<Option<User>, Self::Error>;
}

/// User administration on top of an [`AttendanceStore`].
pub trait UserStore: AttendanceStore {
    /// Register a person; the store assigns and returns the id.
    fn create_user(&mut self, user: &NewUser) -> Result<User, Self::Error>;

    /// Users ordered by id, skipping `offset` and returning at most `limit`.
    fn users(&self, offset: u32, limit: u32) -> Result<Vec<User>, Self::Error>;

    /// Apply `update`; `None` when no such user exists.
    fn update_user(&mut self, user_id: i64, update: &UserUpdate) -> Result<Option<User>, Self::Error>;

    /// Remove a user; `false` when no such user exists.
    fn delete_user(&mut self, user_id: i64) -> Result<bool, Self::Error>;
}

/// Decides whether an accepted recognition becomes a new row.
pub trait AdmissionPolicy: Send {
    /// Whether [`admit`](Self::admit) looks at the previous row at all.
    fn needs_history(&self) -> bool {
        true
    }

    fn admit(&self, previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool;
}

/// Every accepted recognition is recorded.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl AdmissionPolicy for PassThrough {
    fn needs_history(&self) -> bool {
        false
    }

    fn admit(&self, _previous: Option<DateTime<Utc>>, _now: DateTime<Utc>) -> bool {
        true
    }
}

/// At most one row per user and subject within `window`.
#[derive(Debug, Clone, Copy)]
pub struct TimeWindow {
    pub window: Duration,
}

impl TimeWindow {
    pub fn minutes(minutes: i64) -> Self {
        Self {
            window: Duration::minutes(minutes),
        }
    }
}

impl AdmissionPolicy for TimeWindow {
    fn admit(&self, previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match previous {
            Some(at) => now - at >= self.window,
            None => true,
        }
    }
}

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("confidence {0} outside [0, 1]")]
    InvalidConfidence(f32),
    #[error("subject must not be empty")]
    EmptySubject,
    #[error("persistence failure: {0}")]
    Persistence(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Recorded(AttendanceRecord),
    /// The admission policy declined the event.
    Suppressed,
}

pub struct AttendanceRecorder<S> {
    store: S,
    policy: Box<dyn AdmissionPolicy>,
}

impl<S: AttendanceStore> AttendanceRecorder<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            policy: Box::new(PassThrough),
        }
    }

    pub fn with_policy(mut self, policy: impl AdmissionPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Record a PRESENT row for `user_id`. Returns `true` if a row was written.
    ///
    /// Failures are logged and reported as `false`; the store has already
    /// rolled back the attempted write.
    pub fn record(&mut self, user_id: i64, subject: &str, confidence: f32) -> bool {
        match self.try_record(user_id, subject, confidence) {
            Ok(RecordOutcome::Recorded(_)) => true,
            Ok(RecordOutcome::Suppressed) => false,
            Err(e) => {
                tracing::error!(user_id, subject, error = %e, "attendance not recorded");
                false
            }
        }
    }

    pub fn try_record(
        &mut self,
        user_id: i64,
        subject: &str,
        confidence: f32,
    ) -> Result<RecordOutcome, RecorderError> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(RecorderError::InvalidConfidence(confidence));
        }

        let now = Utc::now();
        if self.policy.needs_history() {
            let previous = self
                .store
                .latest_for(user_id, subject)
                .map_err(|e| RecorderError::Persistence(Box::new(e)))?;
            if !self.policy.admit(previous, now) {
                tracing::debug!(user_id, subject, "attendance suppressed by admission policy");
                return Ok(RecordOutcome::Suppressed);
            }
        }

        let record = self
            .store
            .append(&NewAttendance {
                user_id,
                subject: subject.to_string(),
                timestamp: now,
                confidence,
                status: AttendanceStatus::Present,
            })
            .map_err(|e| RecorderError::Persistence(Box::new(e)))?;

        tracing::info!(id = record.id, user_id, subject, confidence, "attendance recorded");
        Ok(RecordOutcome::Recorded(record))
    }

    /// Write a row entered by hand, with its own timestamp and status.
    ///
    /// The admission policy only governs recognitions, so it is not consulted.
    pub fn record_manual(&mut self, entry: &NewAttendance) -> Result<AttendanceRecord, RecorderError> {
        if !(0.0..=1.0).contains(&entry.confidence) {
            return Err(RecorderError::InvalidConfidence(entry.confidence));
        }
        if entry.subject.trim().is_empty() {
            return Err(RecorderError::EmptySubject);
        }

        let record = self
            .store
            .append(entry)
            .map_err(|e| RecorderError::Persistence(Box::new(e)))?;
        tracing::info!(
            id = record.id,
            user_id = record.user_id,
            subject = %record.subject,
            status = %record.status,
            "manual attendance recorded"
        );
        Ok(record)
    }

    /// Attendance in `[start, end]`, optionally for one subject.
    pub fn report(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        subject: Option<&str>,
    ) -> Result<Vec<AttendanceReportRow>, S::Error> {
        self.store.records_between(start, end, subject)
    }
}
