use chrono::NaiveDate;
use rollsync_core::{AttendanceStatus, StatusVocabulary};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];

/// One attendance row as assembled from internal facts and match results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAttendanceRow {
    pub student_id: String,
    pub date: String,
    pub status: String,
    pub external_row_reference: Option<String>,
    pub external_name: Option<String>,
}

/// A row after trimming and canonicalization. Dates are `YYYY-MM-DD` when
/// parseable, statuses are canonical tokens when the vocabulary knows them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRow {
    pub student_id: String,
    pub date: String,
    pub status: String,
    pub external_row_reference: Option<String>,
    pub external_name: Option<String>,
}

impl NormalizedRow {
    pub fn entity_key(&self, classroom_id: &str) -> String {
        attendance_entity_key(classroom_id, &self.student_id, &self.date)
    }
}

/// `classroom:student:date`; a student on two rosters gets separate keys.
pub fn attendance_entity_key(classroom_id: &str, student_id: &str, date: &str) -> String {
    format!("{classroom_id}:{student_id}:{date}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscardedRow {
    pub row: RawAttendanceRow,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedDataset {
    pub rows: Vec<NormalizedRow>,
    pub discarded: Vec<DiscardedRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowValidationError {
    #[error("row has no student id")]
    MissingStudentId,
    #[error("row has no date")]
    MissingDate,
    #[error("date '{0}' is not a valid YYYY-MM-DD date")]
    InvalidDate(String),
    #[error("row has no status")]
    MissingStatus,
    #[error("status '{0}' is not one of present, absent, late, excused")]
    UnknownStatus(String),
    #[error("row has no portal row reference")]
    MissingReference,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    pub row: NormalizedRow,
    pub error: RowValidationError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatedDataset {
    pub valid: Vec<NormalizedRow>,
    pub errors: Vec<RowError>,
}

/// Canonicalizes raw rows, dropping those that cannot identify a student.
#[derive(Debug, Clone, Default)]
pub struct DatasetNormalizer {
    vocabulary: StatusVocabulary,
}

impl DatasetNormalizer {
    pub fn new(vocabulary: StatusVocabulary) -> Self {
        Self { vocabulary }
    }

    pub fn vocabulary(&self) -> &StatusVocabulary {
        &self.vocabulary
    }

    pub fn normalize(&self, rows: Vec<RawAttendanceRow>) -> NormalizedDataset {
        let mut dataset = NormalizedDataset::default();
        for row in rows {
            let student_id = row.student_id.trim();
            if student_id.is_empty() {
                warn!(date = %row.date, "discarding attendance row without student id");
                dataset.discarded.push(DiscardedRow {
                    row,
                    reason: "row has no student id".into(),
                });
                continue;
            }

            let status = row.status.trim();
            let status = match self.vocabulary.resolve(status) {
                Some(known) => known.as_str().to_string(),
                None => status.to_lowercase(),
            };

            dataset.rows.push(NormalizedRow {
                student_id: student_id.to_string(),
                date: normalize_date(&row.date),
                status,
                external_row_reference: non_empty(row.external_row_reference.as_deref()),
                external_name: row
                    .external_name
                    .as_deref()
                    .map(|n| n.split_whitespace().collect::<Vec<_>>().join(" "))
                    .filter(|n| !n.is_empty()),
            });
        }
        dataset
    }
}

/// Normalizes with the built-in status vocabulary.
pub fn normalize_rows(rows: Vec<RawAttendanceRow>) -> NormalizedDataset {
    DatasetNormalizer::default().normalize(rows)
}

/// Splits rows into those ready to map and those with a field-level problem.
pub fn validate_rows(rows: Vec<NormalizedRow>) -> ValidatedDataset {
    let mut dataset = ValidatedDataset::default();
    for row in rows {
        match check_row(&row) {
            Ok(()) => dataset.valid.push(row),
            Err(error) => dataset.errors.push(RowError { row, error }),
        }
    }
    dataset
}

fn check_row(row: &NormalizedRow) -> Result<(), RowValidationError> {
    if row.student_id.is_empty() {
        return Err(RowValidationError::MissingStudentId);
    }
    if row.date.is_empty() {
        return Err(RowValidationError::MissingDate);
    }
    if NaiveDate::parse_from_str(&row.date, "%Y-%m-%d").is_err() {
        return Err(RowValidationError::InvalidDate(row.date.clone()));
    }
    if row.status.is_empty() {
        return Err(RowValidationError::MissingStatus);
    }
    if AttendanceStatus::parse(&row.status).is_none() {
        return Err(RowValidationError::UnknownStatus(row.status.clone()));
    }
    if row.external_row_reference.is_none() {
        return Err(RowValidationError::MissingReference);
    }
    Ok(())
}

fn normalize_date(raw: &str) -> String {
    let trimmed = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
        .map(|date| date.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}
