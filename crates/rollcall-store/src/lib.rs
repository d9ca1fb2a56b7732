//! rollcall-store — SQLite persistence for users and attendance.
//!
//! Attendance rows are append-only. Timestamps are stored as integer Unix
//! milliseconds so range queries compare numbers, not strings.

use chrono::{DateTime, Utc};
use rollcall_core::recorder::{AttendanceStore, UserStore};
use rollcall_core::types::{
    AttendanceRecord, AttendanceReportRow, AttendanceStatus, NewAttendance, NewUser, User,
    UserRole, UserUpdate,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id          INTEGER PRIMARY KEY,
    national_id TEXT    NOT NULL UNIQUE,
    first_name  TEXT    NOT NULL,
    last_name   TEXT    NOT NULL,
    role        TEXT    NOT NULL CHECK (role IN ('student', 'teacher')),
    schedule    TEXT,
    faculty     TEXT,
    university  TEXT
);

CREATE TABLE IF NOT EXISTS attendance (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id        INTEGER NOT NULL REFERENCES users(id),
    subject        TEXT    NOT NULL,
    recorded_at_ms INTEGER NOT NULL,
    confidence     REAL    NOT NULL CHECK (confidence BETWEEN 0 AND 1),
    status         TEXT    NOT NULL CHECK (status IN ('PRESENT', 'ABSENT'))
);

CREATE INDEX IF NOT EXISTS idx_attendance_time ON attendance (recorded_at_ms);
CREATE INDEX IF NOT EXISTS idx_attendance_user_subject ON attendance (user_id, subject);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("a user with national id {0} already exists")]
    DuplicateNationalId(String),
    #[error("user {user_id} has {rows} attendance rows and cannot be deleted")]
    UserHasAttendance { user_id: i64, rows: u64 },
}

const USER_COLUMNS: &str =
    "id, national_id, first_name, last_name, role, schedule, faculty, university";

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let store = Self::init(Connection::open(path)?)?;
        tracing::info!(path = %path.display(), "attendance store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn attendance_count(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM attendance", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn conversion_error(idx: usize, ty: Type, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, msg.into())
}

fn timestamp_from_ms(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| conversion_error(idx, Type::Integer, format!("timestamp out of range: {ms}")))
}

/// Columns: id, user_id, subject, recorded_at_ms, confidence, status.
fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let status: String = row.get(5)?;
    Ok(AttendanceRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        subject: row.get(2)?,
        timestamp: timestamp_from_ms(3, row.get(3)?)?,
        confidence: row.get::<_, f64>(4)? as f32,
        status: status
            .parse::<AttendanceStatus>()
            .map_err(|e| conversion_error(5, Type::Text, e))?,
    })
}

fn role_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<UserRole> {
    let role: String = row.get(idx)?;
    role.parse::<UserRole>()
        .map_err(|e| conversion_error(idx, Type::Text, e))
}

/// Columns in [`USER_COLUMNS`] order.
fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        national_id: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        role: role_at(row, 4)?,
        schedule: row.get(5)?,
        faculty: row.get(6)?,
        university: row.get(7)?,
    })
}

/// Whether `national_id` belongs to someone other than `except`.
fn national_id_taken(
    conn: &Connection,
    national_id: &str,
    except: Option<i64>,
) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM users WHERE national_id = ?1 AND id IS NOT ?2)",
        params![national_id, except],
        |row| row.get(0),
    )
}

impl AttendanceStore for SqliteStore {
    type Error = StoreError;

    /// Single insert inside a transaction; a constraint failure leaves no row.
    fn append(&mut self, record: &NewAttendance) -> Result<AttendanceRecord, StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO attendance (user_id, subject, recorded_at_ms, confidence, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.user_id,
                record.subject,
                record.timestamp.timestamp_millis(),
                f64::from(record.confidence),
                record.status.as_str(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(AttendanceRecord {
            id,
            user_id: record.user_id,
            subject: record.subject.clone(),
            // Round-trip through the stored precision.
            timestamp: timestamp_from_ms(0, record.timestamp.timestamp_millis())?,
            confidence: record.confidence,
            status: record.status,
        })
    }

    fn latest_for(&self, user_id: i64, subject: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let ms: Option<i64> = self.conn.query_row(
            "SELECT MAX(recorded_at_ms) FROM attendance WHERE user_id = ?1 AND subject = ?2",
            params![user_id, subject],
            |row| row.get(0),
        )?;
        Ok(ms.map(|ms| timestamp_from_ms(0, ms)).transpose()?)
    }

    fn records_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        subject: Option<&str>,
    ) -> Result<Vec<AttendanceReportRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT a.id, a.user_id, a.subject, a.recorded_at_ms, a.confidence, a.status,
                    u.national_id, u.first_name, u.last_name, u.role, u.schedule
             FROM attendance a
             JOIN users u ON u.id = a.user_id
             WHERE a.recorded_at_ms BETWEEN ?1 AND ?2
               AND (?3 IS NULL OR a.subject = ?3)
             ORDER BY a.recorded_at_ms, a.id",
        )?;
        let rows = stmt
            .query_map(
                params![start.timestamp_millis(), end.timestamp_millis(), subject],
                |row| {
                    Ok(AttendanceReportRow {
                        record: record_from_row(row)?,
                        national_id: row.get(6)?,
                        first_name: row.get(7)?,
                        last_name: row.get(8)?,
                        role: role_at(row, 9)?,
                        schedule: row.get(10)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn user(&self, user_id: i64) -> Result<Option<User>, StoreError> {
        let user = self
            .conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![user_id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }
}

impl UserStore for SqliteStore {
    fn create_user(&mut self, user: &NewUser) -> Result<User, StoreError> {
        let tx = self.conn.transaction()?;
        if national_id_taken(&tx, &user.national_id, None)? {
            return Err(StoreError::DuplicateNationalId(user.national_id.clone()));
        }
        tx.execute(
            "INSERT INTO users (national_id, first_name, last_name, role, schedule, faculty, university)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user.national_id,
                user.first_name,
                user.last_name,
                user.role.as_str(),
                user.schedule,
                user.faculty,
                user.university,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        tracing::info!(user_id = id, role = %user.role, "user created");
        Ok(User {
            id,
            national_id: user.national_id.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            role: user.role,
            schedule: user.schedule.clone(),
            faculty: user.faculty.clone(),
            university: user.university.clone(),
        })
    }

    fn users(&self, offset: u32, limit: u32) -> Result<Vec<User>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY id LIMIT ?1 OFFSET ?2"
        ))?;
        let users = stmt
            .query_map(params![limit, offset], user_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(users)
    }

    fn update_user(&mut self, user_id: i64, update: &UserUpdate) -> Result<Option<User>, StoreError> {
        let tx = self.conn.transaction()?;
        let Some(mut user) = tx
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![user_id],
                user_from_row,
            )
            .optional()?
        else {
            return Ok(None);
        };

        if let Some(national_id) = &update.national_id {
            if national_id_taken(&tx, national_id, Some(user_id))? {
                return Err(StoreError::DuplicateNationalId(national_id.clone()));
            }
        }
        update.apply_to(&mut user);
        tx.execute(
            "UPDATE users SET national_id = ?2, first_name = ?3, last_name = ?4,
                              schedule = ?5, faculty = ?6, university = ?7
             WHERE id = ?1",
            params![
                user.id,
                user.national_id,
                user.first_name,
                user.last_name,
                user.schedule,
                user.faculty,
                user.university,
            ],
        )?;
        tx.commit()?;

        tracing::info!(user_id, "user updated");
        Ok(Some(user))
    }

    /// Attendance rows are never rewritten, so a user with history stays.
    fn delete_user(&mut self, user_id: i64) -> Result<bool, StoreError> {
        let tx = self.conn.transaction()?;
        let rows: i64 = tx.query_row(
            "SELECT COUNT(*) FROM attendance WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        if rows > 0 {
            return Err(StoreError::UserHasAttendance {
                user_id,
                rows: rows as u64,
            });
        }
        let deleted = tx.execute("DELETE FROM users WHERE id = ?1", params![user_id])?;
        tx.commit()?;

        if deleted > 0 {
            tracing::info!(user_id, "user deleted");
        }
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn student(national_id: &str) -> NewUser {
        NewUser {
            national_id: national_id.into(),
            first_name: "Ana".into(),
            last_name: "Pérez".into(),
            role: UserRole::Student,
            schedule: Some("Morning".into()),
            faculty: Some("Engineering".into()),
            university: None,
        }
    }

    fn present(user_id: i64, subject: &str, timestamp: DateTime<Utc>) -> NewAttendance {
        NewAttendance {
            user_id,
            subject: subject.into(),
            timestamp,
            confidence: 0.9,
            status: AttendanceStatus::Present,
        }
    }

    #[test]
    fn test_created_user_round_trips() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let created = store.create_user(&student("V-1")).unwrap();

        assert_eq!(store.user(created.id).unwrap(), Some(created.clone()));
        assert_eq!(created.schedule.as_deref(), Some("Morning"));
        assert_eq!(store.user(created.id + 1).unwrap(), None);
    }

    #[test]
    fn test_duplicate_national_id_rejected() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.create_user(&student("V-7")).unwrap();
        assert!(matches!(
            store.create_user(&student("V-7")),
            Err(StoreError::DuplicateNationalId(id)) if id == "V-7"
        ));
        assert_eq!(store.users(0, 100).unwrap().len(), 1);
    }

    #[test]
    fn test_users_pages_by_id() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let ids: Vec<i64> = (0..5)
            .map(|i| store.create_user(&student(&format!("V-{i}"))).unwrap().id)
            .collect();

        let page: Vec<i64> = store.users(1, 2).unwrap().iter().map(|u| u.id).collect();
        assert_eq!(page, ids[1..3].to_vec());
        assert!(store.users(10, 5).unwrap().is_empty());
    }

    #[test]
    fn test_update_user_changes_only_given_fields() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let ana = store.create_user(&student("V-1")).unwrap();
        let other = store.create_user(&student("V-2")).unwrap();

        let update = UserUpdate {
            last_name: Some("Gómez".into()),
            university: Some("UCV".into()),
            ..UserUpdate::default()
        };
        let updated = store.update_user(ana.id, &update).unwrap().unwrap();
        assert_eq!(updated.last_name, "Gómez");
        assert_eq!(updated.first_name, "Ana");
        assert_eq!(store.user(ana.id).unwrap(), Some(updated));

        let clash = UserUpdate {
            national_id: Some("V-2".into()),
            ..UserUpdate::default()
        };
        assert!(matches!(
            store.update_user(ana.id, &clash),
            Err(StoreError::DuplicateNationalId(_))
        ));
        // Re-saving your own national id is not a clash.
        let same = UserUpdate {
            national_id: Some("V-2".into()),
            ..UserUpdate::default()
        };
        assert!(store.update_user(other.id, &same).unwrap().is_some());
        assert_eq!(store.update_user(999, &update).unwrap(), None);
    }

    #[test]
    fn test_delete_user_refuses_when_attendance_exists() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let kept = store.create_user(&student("V-1")).unwrap();
        let gone = store.create_user(&student("V-2")).unwrap();
        store.append(&present(kept.id, "Math101", Utc::now())).unwrap();

        assert!(matches!(
            store.delete_user(kept.id),
            Err(StoreError::UserHasAttendance { rows: 1, .. })
        ));
        assert!(store.delete_user(gone.id).unwrap());
        assert!(!store.delete_user(gone.id).unwrap());
        assert!(store.user(kept.id).unwrap().is_some());
    }

    #[test]
    fn test_append_for_unknown_user_leaves_no_row() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let err = store.append(&present(99, "Math101", Utc::now()));
        assert!(matches!(err, Err(StoreError::Sqlite(_))));
        assert_eq!(store.attendance_count().unwrap(), 0);
    }

    #[test]
    fn test_confidence_check_constraint() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let user = store.create_user(&student("V-1")).unwrap();
        let bad = NewAttendance {
            confidence: 1.5,
            ..present(user.id, "Math101", Utc::now())
        };
        assert!(store.append(&bad).is_err());
        assert_eq!(store.attendance_count().unwrap(), 0);
    }

    #[test]
    fn test_records_between_is_inclusive_and_ordered() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let one = store.create_user(&student("V-00000001")).unwrap().id;
        let two = store
            .create_user(&NewUser {
                role: UserRole::Teacher,
                ..student("V-00000002")
            })
            .unwrap()
            .id;

        let t0 = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let t1 = t0 + Duration::minutes(5);
        let t2 = t0 + Duration::minutes(10);
        store.append(&present(two, "History", t2)).unwrap();
        store.append(&present(one, "Math101", t0)).unwrap();
        store.append(&present(two, "Math101", t1)).unwrap();

        let all = store.records_between(t0, t2, None).unwrap();
        let order: Vec<_> = all.iter().map(|r| r.record.timestamp).collect();
        assert_eq!(order, vec![t0, t1, t2]);
        assert_eq!(all[0].national_id, "V-00000001");
        assert_eq!(all[0].role, UserRole::Student);
        assert_eq!(all[1].role, UserRole::Teacher);
        assert_eq!(all[1].schedule.as_deref(), Some("Morning"));

        let math = store.records_between(t0, t2, Some("Math101")).unwrap();
        assert_eq!(math.len(), 2);
        assert!(math.iter().all(|r| r.record.subject == "Math101"));

        assert_eq!(store.records_between(t1, t1, None).unwrap().len(), 1);
        assert!(store
            .records_between(t2 + Duration::milliseconds(1), t2 + Duration::hours(1), None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_latest_for_is_per_subject() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let id = store.create_user(&student("V-3")).unwrap().id;
        assert_eq!(store.latest_for(id, "Art").unwrap(), None);

        let t0 = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        store.append(&present(id, "Art", t0)).unwrap();
        store.append(&present(id, "Art", t0 + Duration::minutes(1))).unwrap();
        store.append(&present(id, "Music", t0 + Duration::minutes(2))).unwrap();

        assert_eq!(
            store.latest_for(id, "Art").unwrap(),
            Some(t0 + Duration::minutes(1))
        );
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("attendance.db");
        let id = {
            let mut store = SqliteStore::open(&path).unwrap();
            store.create_user(&student("V-5")).unwrap().id
        };
        let reopened = SqliteStore::open(&path).unwrap();
        assert!(reopened.user(id).unwrap().is_some());
    }
}
