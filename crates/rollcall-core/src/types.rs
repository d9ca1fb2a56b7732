use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Bounding box for a detected face, in source-image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    #[serde(default)]
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Cosine similarity in [-1, 1]. Zero vectors compare as 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Euclidean distance between two embeddings.
    ///
    /// Dimensions beyond the shorter vector are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One face found in an image: where it is and what it looks like.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// A labelled embedding loaded from the dataset directory.
#[derive(Debug, Clone, PartialEq)]
pub struct KnownFace {
    pub user_id: i64,
    pub embedding: Embedding,
}

/// Immutable view of the known-face registry at a point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    faces: Vec<KnownFace>,
    user_ids: BTreeSet<i64>,
}

impl Snapshot {
    pub fn new(faces: Vec<KnownFace>) -> Self {
        let user_ids = faces.iter().map(|f| f.user_id).collect();
        Self { faces, user_ids }
    }

    /// Known faces in load order.
    pub fn faces(&self) -> &[KnownFace] {
        &self.faces
    }

    /// Distinct user ids with at least one loaded embedding.
    pub fn user_ids(&self) -> &BTreeSet<i64> {
        &self.user_ids
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }
}

/// Outcome of resolving one query embedding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchResult {
    /// Matched user, if any known embedding was within tolerance.
    pub user_id: Option<i64>,
    /// 1 - closest distance over all known embeddings, clamped to [0, 1].
    pub confidence: f32,
}

impl MatchResult {
    pub fn absent() -> Self {
        Self {
            user_id: None,
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "PRESENT",
            Self::Absent => "ABSENT",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PRESENT" => Ok(Self::Present),
            "ABSENT" => Ok(Self::Absent),
            other => Err(format!("unknown attendance status: {other}")),
        }
    }
}

/// An attendance row about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAttendance {
    pub user_id: i64,
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
    pub status: AttendanceStatus,
}

/// A persisted attendance row. Never updated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub user_id: i64,
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Student,
    Teacher,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Teacher => "teacher",
        }
    }
}

impl FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(Self::Student),
            "teacher" => Ok(Self::Teacher),
            other => Err(format!("unknown user role: {other}")),
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered person, as the store knows them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    /// National identity document number.
    pub national_id: String,
    pub first_name: String,
    pub last_name: String,
    pub role: UserRole,
    /// Course or timetable slot the person belongs to.
    pub schedule: Option<String>,
    pub faculty: Option<String>,
    pub university: Option<String>,
}

/// Fields for registering a person. The store assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUser {
    pub national_id: String,
    pub first_name: String,
    pub last_name: String,
    pub role: UserRole,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub faculty: Option<String>,
    #[serde(default)]
    pub university: Option<String>,
}

/// Partial update: only the fields that are `Some` change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserUpdate {
    pub national_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub schedule: Option<String>,
    pub faculty: Option<String>,
    pub university: Option<String>,
}

impl UserUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Copy every set field onto `user`.
    pub fn apply_to(&self, user: &mut User) {
        if let Some(v) = &self.national_id {
            user.national_id = v.clone();
        }
        if let Some(v) = &self.first_name {
            user.first_name = v.clone();
        }
        if let Some(v) = &self.last_name {
            user.last_name = v.clone();
        }
        if let Some(v) = &self.schedule {
            user.schedule = Some(v.clone());
        }
        if let Some(v) = &self.faculty {
            user.faculty = Some(v.clone());
        }
        if let Some(v) = &self.university {
            user.university = Some(v.clone());
        }
    }
}

/// An attendance row joined with the display fields of its user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceReportRow {
    #[serde(flatten)]
    pub record: AttendanceRecord,
    pub national_id: String,
    pub first_name: String,
    pub last_name: String,
    pub role: UserRole,
    pub schedule: Option<String>,
}
