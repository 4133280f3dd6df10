//! Core domain model for attendance reconciliation against the external portal.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rollsync-core";

/// Entity type used for every attendance mark pushed to the portal.
pub const ATTENDANCE_ENTITY: &str = "attendance";

/// Key under which a payload hash is remembered between runs.
pub fn hash_cache_key(entity_type: &str, entity_key: &str) -> String {
    format!("{entity_type}:{entity_key}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalStudent {
    pub student_id: String,
    pub first_name: String,
    pub last_name: String,
}

/// Attendance mark as recorded internally; `status` is the raw stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceFact {
    pub student_id: String,
    pub date: NaiveDate,
    pub status: String,
}

/// One student row scraped from the portal's attendance view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalNameRow {
    /// Displayed as "Last, First".
    pub name: String,
    pub external_row_reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub student_id: String,
    pub matched: bool,
    pub external_name: Option<String>,
    pub external_row_reference: Option<String>,
    pub confidence: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
}

impl AttendanceStatus {
    pub const ALL: [AttendanceStatus; 4] = [
        AttendanceStatus::Present,
        AttendanceStatus::Absent,
        AttendanceStatus::Late,
        AttendanceStatus::Excused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Excused => "excused",
        }
    }

    /// Accepts canonical tokens only; aliases go through [`StatusVocabulary`].
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive alias table from portal/internal status spellings to the enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusVocabulary {
    aliases: BTreeMap<String, AttendanceStatus>,
}

impl Default for StatusVocabulary {
    fn default() -> Self {
        let mut vocab = Self::empty();
        for status in AttendanceStatus::ALL {
            vocab.insert(status.as_str(), status);
        }
        vocab.insert("p", AttendanceStatus::Present);
        vocab.insert("here", AttendanceStatus::Present);
        vocab.insert("a", AttendanceStatus::Absent);
        vocab.insert("t", AttendanceStatus::Late);
        vocab.insert("tardy", AttendanceStatus::Late);
        vocab.insert("e", AttendanceStatus::Excused);
        vocab.insert("excused absence", AttendanceStatus::Excused);
        vocab
    }
}

impl StatusVocabulary {
    pub fn empty() -> Self {
        Self {
            aliases: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, alias: &str, status: AttendanceStatus) {
        self.aliases.insert(Self::fold(alias), status);
    }

    pub fn resolve(&self, raw: &str) -> Option<AttendanceStatus> {
        self.aliases.get(&Self::fold(raw)).copied()
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    fn fold(raw: &str) -> String {
        raw.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    DryRun,
    Execute,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::DryRun => "dry_run",
            SyncMode::Execute => "execute",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "dry_run" => Some(Self::DryRun),
            "execute" => Some(Self::Execute),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl SyncJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncJobStatus::Pending => "pending",
            SyncJobStatus::Running => "running",
            SyncJobStatus::Completed => "completed",
            SyncJobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncJobStatus::Completed | SyncJobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Success,
    Skipped,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Success => "success",
            ItemStatus::Skipped => "skipped",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "skipped" => Some(Self::Skipped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub planned: u32,
    pub upserted: u32,
    pub skipped: u32,
    pub failed: u32,
}

impl SyncSummary {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    pub fn record(&mut self, status: ItemStatus) {
        match status {
            ItemStatus::Success => self.upserted += 1,
            ItemStatus::Skipped => self.skipped += 1,
            ItemStatus::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub classroom_id: String,
    pub mode: SyncMode,
    pub status: SyncJobStatus,
    pub summary: SyncSummary,
    pub error_message: Option<String>,
    pub created_by: String,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJobItem {
    pub id: Uuid,
    pub sync_job_id: Uuid,
    pub entity_type: String,
    pub entity_key: String,
    pub status: ItemStatus,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Inclusive calendar range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self { from, to }
    }

    pub fn is_valid(&self) -> bool {
        self.from <= self.to
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date <= self.to
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub classroom_id: String,
    pub mode: SyncMode,
    pub created_by: String,
    pub date_range: DateRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncErrorMessage {
    pub message: String,
}

/// What the trigger surface hands back to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunResult {
    pub ok: bool,
    pub job_id: Uuid,
    pub errors: Vec<SyncErrorMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Noop,
    Upsert,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedOperation {
    pub entity_type: String,
    pub entity_key: String,
    pub payload: JsonValue,
    /// Write target in the portal; not part of the hashed payload.
    pub external_row_reference: String,
}

impl MappedOperation {
    pub fn cache_key(&self) -> String {
        hash_cache_key(&self.entity_type, &self.entity_key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedOperation {
    #[serde(flatten)]
    pub operation: MappedOperation,
    pub payload_hash: String,
    pub action: PlanAction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_folds_case_and_spacing() {
        let vocab = StatusVocabulary::default();
        assert_eq!(vocab.resolve("  Excused   Absence "), Some(AttendanceStatus::Excused));
        assert_eq!(vocab.resolve("T"), Some(AttendanceStatus::Late));
        assert_eq!(vocab.resolve("sick"), None);
    }

    #[test]
    fn canonical_status_tokens_only() {
        assert_eq!(AttendanceStatus::parse("late"), Some(AttendanceStatus::Late));
        assert_eq!(AttendanceStatus::parse("Late"), None);
        assert_eq!(AttendanceStatus::parse("tardy"), None);
    }

    #[test]
    fn summary_counts_by_item_status() {
        let mut summary = SyncSummary::default();
        assert!(summary.is_zero());
        summary.record(ItemStatus::Success);
        summary.record(ItemStatus::Skipped);
        summary.record(ItemStatus::Skipped);
        summary.record(ItemStatus::Failed);
        assert_eq!(summary.upserted, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.failed, 1);
    }
}
