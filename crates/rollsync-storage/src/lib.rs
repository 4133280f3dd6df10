//! Sync state persistence, internal roster access and credential sealing.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use rollsync_core::{
    AttendanceFact, DateRange, InternalStudent, ItemStatus, SyncJob, SyncJobItem, SyncJobStatus,
    SyncMode, SyncSummary,
};
use sha2::{Digest, Sha256};
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

mod cipher;
mod memory;
mod postgres;

pub use cipher::{CipherError, CredentialCipher};
pub use memory::{MemoryDataSource, MemorySyncStateStore};
pub use postgres::PostgresRepository;

pub const CRATE_NAME: &str = "rollsync-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] MigrateError),

    #[error("sync job {0} not found")]
    JobNotFound(Uuid),

    #[error("sync job {0} has already been finalized")]
    AlreadyFinalized(Uuid),

    #[error("classroom '{0}' has no portal settings")]
    ClassroomNotConfigured(String),

    #[error("invalid {field} value '{value}'")]
    InvalidValue { field: &'static str, value: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSyncJob {
    pub classroom_id: String,
    pub mode: SyncMode,
    pub created_by: String,
    pub date_range: DateRange,
}

impl NewSyncJob {
    /// Builds the record as it is persisted: created pending and started immediately.
    pub fn into_running(self) -> SyncJob {
        let now = Utc::now();
        let mut job = SyncJob {
            id: Uuid::new_v4(),
            classroom_id: self.classroom_id,
            mode: self.mode,
            status: SyncJobStatus::Pending,
            summary: SyncSummary::default(),
            error_message: None,
            created_by: self.created_by,
            date_from: self.date_range.from,
            date_to: self.date_range.to,
            started_at: None,
            finished_at: None,
            created_at: now,
        };
        job.status = SyncJobStatus::Running;
        job.started_at = Some(now);
        job
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSyncJobItem {
    pub sync_job_id: Uuid,
    pub entity_type: String,
    pub entity_key: String,
    pub status: ItemStatus,
    pub detail: Option<String>,
}

impl NewSyncJobItem {
    pub fn into_item(self) -> SyncJobItem {
        SyncJobItem {
            id: Uuid::new_v4(),
            sync_job_id: self.sync_job_id,
            entity_type: self.entity_type,
            entity_key: self.entity_key,
            status: self.status,
            detail: self.detail,
            created_at: Utc::now(),
        }
    }
}

/// Terminal state written once when a job finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub status: SyncJobStatus,
    pub summary: SyncSummary,
    pub error_message: Option<String>,
}

impl JobOutcome {
    pub fn completed(summary: SyncSummary) -> Self {
        Self {
            status: SyncJobStatus::Completed,
            summary,
            error_message: None,
        }
    }

    pub fn failed(summary: SyncSummary, error_message: impl Into<String>) -> Self {
        Self {
            status: SyncJobStatus::Failed,
            summary,
            error_message: Some(error_message.into()),
        }
    }

    fn ensure_terminal(&self) -> Result<(), StoreError> {
        if self.status.is_terminal() {
            Ok(())
        } else {
            Err(StoreError::InvalidValue {
                field: "terminal status",
                value: self.status.as_str().to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashCacheEntry {
    pub entity_type: String,
    pub entity_key: String,
    pub payload_hash: String,
    pub sync_job_id: Uuid,
}

#[async_trait]
pub trait SyncStateStore: Send + Sync {
    /// Persists a new job already moved to `running`.
    async fn insert_sync_job(&self, job: NewSyncJob) -> Result<SyncJob, StoreError>;

    async fn insert_sync_job_item(&self, item: NewSyncJobItem) -> Result<SyncJobItem, StoreError>;

    /// Moves a running job to its terminal state; fails if it already has one.
    async fn finalize_sync_job(
        &self,
        job_id: Uuid,
        outcome: JobOutcome,
    ) -> Result<SyncJob, StoreError>;

    async fn fetch_sync_job(&self, job_id: Uuid) -> Result<SyncJob, StoreError>;

    async fn list_sync_job_items(&self, job_id: Uuid) -> Result<Vec<SyncJobItem>, StoreError>;

    /// Known payload hashes keyed by `entity_type:entity_key`.
    async fn load_known_hashes(
        &self,
        entity_type: &str,
    ) -> Result<HashMap<String, String>, StoreError>;

    async fn save_hashes(&self, entries: &[HashCacheEntry]) -> Result<(), StoreError>;
}

/// Portal login and course binding for one classroom. The password stays sealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalSettings {
    pub classroom_id: String,
    pub course_identifier: String,
    pub username: String,
    pub encrypted_password: String,
}

#[async_trait]
pub trait InternalDataSource: Send + Sync {
    async fn load_portal_settings(&self, classroom_id: &str) -> Result<PortalSettings, StoreError>;

    async fn load_roster(&self, classroom_id: &str) -> Result<Vec<InternalStudent>, StoreError>;

    async fn load_attendance(
        &self,
        classroom_id: &str,
        range: DateRange,
    ) -> Result<Vec<AttendanceFact>, StoreError>;
}

fn summary_count(field: &'static str, value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::InvalidValue {
        field,
        value: value.to_string(),
    })
}
