//! Attendance report export as CSV.
//!
//! Column names and cell formats follow the spreadsheet the registry office
//! already consumes, so they are kept in Spanish.

use crate::types::{AttendanceReportRow, AttendanceStatus, UserRole};
use std::io;

pub const CSV_HEADER: [&str; 9] = [
    "ID",
    "ASISTENCIA",
    "CEDULA",
    "NOMBRE",
    "APELLIDO",
    "MATERIA",
    "CURSO",
    "CONFIDENT",
    "DOCENTE",
];

/// Confidence as a whole percentage; a zero confidence means nobody measured it.
fn confidence_cell(confidence: f32) -> String {
    if confidence > 0.0 {
        format!("{:.0}%", confidence * 100.0)
    } else {
        "SIN REGISTRO".to_string()
    }
}

/// Write `rows` as CSV with a header line, one line per attendance row.
pub fn write_attendance_csv<W: io::Write>(
    rows: &[AttendanceReportRow],
    writer: W,
) -> Result<(), csv::Error> {
    let mut out = csv::Writer::from_writer(writer);
    out.write_record(CSV_HEADER)?;

    for row in rows {
        let present = row.record.status == AttendanceStatus::Present;
        let teacher = if row.role == UserRole::Teacher {
            row.first_name.as_str()
        } else {
            ""
        };
        out.write_record([
            row.record.user_id.to_string().as_str(),
            if present { "SI" } else { "NO" },
            row.national_id.as_str(),
            row.first_name.as_str(),
            row.last_name.as_str(),
            row.record.subject.as_str(),
            row.schedule.as_deref().unwrap_or(""),
            confidence_cell(row.record.confidence).as_str(),
            teacher,
        ])?;
    }

    out.flush()?;
    Ok(())
}
