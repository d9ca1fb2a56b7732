use crate::engine::{EngineError, EngineHandle};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rollcall_core::{
    write_attendance_csv, AttendanceStatus, KnownFaceRegistry, NewAttendance, NewUser, User,
    UserUpdate,
};
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    engine: EngineHandle,
    registry: Arc<KnownFaceRegistry>,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle, registry: Arc<KnownFaceRegistry>) -> Self {
        Self { engine, registry }
    }
}

fn engine_error(e: EngineError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn invalid(message: impl Into<String>) -> zbus::fdo::Error {
    zbus::fdo::Error::InvalidArgs(message.into())
}

fn not_found(user_id: i64) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(format!("user {user_id} not found"))
}

/// Names and the national id are required and must not be blank.
fn validate_new_user(user: &NewUser) -> Result<(), String> {
    for (field, value) in [
        ("national_id", &user.national_id),
        ("first_name", &user.first_name),
        ("last_name", &user.last_name),
    ] {
        if value.trim().is_empty() {
            return Err(format!("{field} must not be empty"));
        }
    }
    Ok(())
}

fn user_json(user: Option<User>, user_id: i64) -> zbus::fdo::Result<String> {
    match user {
        Some(user) => to_json(&user),
        None => Err(not_found(user_id)),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

/// Accepts RFC 3339 or a bare `YYYY-MM-DD`, which covers the whole day:
/// midnight as a start bound, the last millisecond as an end bound.
fn parse_range(start: &str, end: &str) -> zbus::fdo::Result<(DateTime<Utc>, DateTime<Utc>)> {
    let from = parse_bound(start, false).map_err(invalid)?;
    let to = parse_bound(end, true).map_err(invalid)?;
    if from > to {
        return Err(invalid(format!("start {start} is after end {end}")));
    }
    Ok((from, to))
}

fn subject_filter(subject: &str) -> Option<String> {
    Some(subject.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn parse_bound(value: &str, end_of_day: bool) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| format!("invalid date: {value} (expected YYYY-MM-DD or RFC 3339)"))?;
    let time = if end_of_day {
        NaiveTime::from_hms_milli_opt(23, 59, 59, 999)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    }
    .ok_or_else(|| "invalid time of day".to_string())?;
    Ok(date.and_time(time).and_utc())
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Rebuild the known-face registry; returns a JSON summary with warnings.
    async fn reload(&self) -> zbus::fdo::Result<String> {
        tracing::info!("reload requested");
        let report = self.engine.reload().await.map_err(engine_error)?;
        let warnings: Vec<String> = report.warnings.iter().map(ToString::to_string).collect();
        to_json(&serde_json::json!({
            "loaded": report.loaded,
            "users": report.users,
            "warnings": warnings,
        }))
    }

    /// User ids with at least one loaded embedding.
    async fn loaded_users(&self) -> Vec<i64> {
        self.registry.loaded_users()
    }

    /// Start recording attendance for `subject`.
    async fn start_session(&self, subject: &str) -> zbus::fdo::Result<bool> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("subject must not be empty".into()));
        }
        tracing::info!(subject, "start_session requested");
        self.engine
            .start(subject.to_string())
            .await
            .map_err(engine_error)
    }

    async fn stop_session(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop_session requested");
        self.engine.stop().await.map_err(engine_error)
    }

    /// Attendance rows between `start` and `end` (inclusive) as JSON.
    /// An empty `subject` means every subject.
    async fn report(&self, start: &str, end: &str, subject: &str) -> zbus::fdo::Result<String> {
        let (from, to) = parse_range(start, end)?;
        let rows = self
            .engine
            .report(from, to, subject_filter(subject))
            .await
            .map_err(engine_error)?;
        to_json(&rows)
    }

    /// Same rows as `Report`, rendered as CSV with a header line.
    async fn export_report(&self, start: &str, end: &str, subject: &str) -> zbus::fdo::Result<String> {
        let (from, to) = parse_range(start, end)?;
        let rows = self
            .engine
            .report(from, to, subject_filter(subject))
            .await
            .map_err(engine_error)?;

        let mut csv = Vec::new();
        write_attendance_csv(&rows, &mut csv)
            .map_err(|e| zbus::fdo::Error::Failed(format!("csv export: {e}")))?;
        tracing::info!(rows = rows.len(), "attendance report exported");
        String::from_utf8(csv).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Append an attendance row by hand. An empty `timestamp` means now;
    /// `status` is PRESENT or ABSENT.
    async fn record_attendance(
        &self,
        user_id: i64,
        subject: &str,
        timestamp: &str,
        confidence: f64,
        status: &str,
    ) -> zbus::fdo::Result<String> {
        let timestamp = if timestamp.trim().is_empty() {
            Utc::now()
        } else {
            DateTime::parse_from_rfc3339(timestamp)
                .map_err(|e| invalid(format!("invalid timestamp {timestamp}: {e}")))?
                .with_timezone(&Utc)
        };
        let status: AttendanceStatus = status.trim().to_uppercase().parse().map_err(invalid)?;

        let record = self
            .engine
            .record_manual(NewAttendance {
                user_id,
                subject: subject.trim().to_string(),
                timestamp,
                confidence: confidence as f32,
                status,
            })
            .await
            .map_err(engine_error)?;
        to_json(&record)
    }

    /// Register a user from a JSON object; returns the stored user as JSON.
    async fn create_user(&self, user: &str) -> zbus::fdo::Result<String> {
        let user: NewUser = serde_json::from_str(user).map_err(|e| invalid(e.to_string()))?;
        validate_new_user(&user).map_err(invalid)?;
        let created = self.engine.create_user(user).await.map_err(engine_error)?;
        tracing::info!(user_id = created.id, "create_user handled");
        to_json(&created)
    }

    /// Users ordered by id, as a JSON array.
    async fn list_users(&self, offset: u32, limit: u32) -> zbus::fdo::Result<String> {
        let users = self
            .engine
            .list_users(offset, limit)
            .await
            .map_err(engine_error)?;
        to_json(&users)
    }

    async fn get_user(&self, user_id: i64) -> zbus::fdo::Result<String> {
        let user = self.engine.get_user(user_id).await.map_err(engine_error)?;
        user_json(user, user_id)
    }

    /// Apply a JSON object of changed fields; absent fields are left alone.
    async fn update_user(&self, user_id: i64, update: &str) -> zbus::fdo::Result<String> {
        let update: UserUpdate = serde_json::from_str(update).map_err(|e| invalid(e.to_string()))?;
        if update.is_empty() {
            return Err(invalid("no fields to update"));
        }
        let user = self
            .engine
            .update_user(user_id, update)
            .await
            .map_err(engine_error)?;
        user_json(user, user_id)
    }

    /// Remove a user and their dataset folder.
    async fn delete_user(&self, user_id: i64) -> zbus::fdo::Result<()> {
        if self.engine.delete_user(user_id).await.map_err(engine_error)? {
            Ok(())
        } else {
            Err(not_found(user_id))
        }
    }

    /// Photograph a registered user into `user_<id>/`; returns a JSON summary.
    async fn capture_dataset(&self, user_id: i64) -> zbus::fdo::Result<String> {
        tracing::info!(user_id, "capture_dataset requested");
        let report = self
            .engine
            .capture_dataset(user_id)
            .await
            .map_err(engine_error)?;
        to_json(&report)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(engine_error)?;
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "dataset": self.registry.dataset_root().display().to_string(),
            "engine": status,
        }))
    }
}
