use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use rollsync_core::{
    hash_cache_key, AttendanceFact, DateRange, InternalStudent, ItemStatus, SyncJob, SyncJobItem,
    SyncJobStatus, SyncMode, SyncSummary,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::{
    summary_count, HashCacheEntry, InternalDataSource, JobOutcome, NewSyncJob, NewSyncJobItem,
    PortalSettings, StoreError, SyncStateStore,
};

const JOB_COLUMNS: &str = r#"
    id, classroom_id, mode, status, planned, upserted, skipped, failed,
    error_message, created_by, date_from, date_to, started_at, finished_at, created_at
"#;

#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn job_from_row(row: &PgRow) -> Result<SyncJob, StoreError> {
    let mode_str: String = row.try_get("mode")?;
    let mode = SyncMode::parse(&mode_str).ok_or(StoreError::InvalidValue {
        field: "mode",
        value: mode_str.clone(),
    })?;
    let status_str: String = row.try_get("status")?;
    let status = SyncJobStatus::parse(&status_str).ok_or(StoreError::InvalidValue {
        field: "status",
        value: status_str.clone(),
    })?;

    Ok(SyncJob {
        id: row.try_get("id")?,
        classroom_id: row.try_get("classroom_id")?,
        mode,
        status,
        summary: SyncSummary {
            planned: summary_count("planned", row.try_get("planned")?)?,
            upserted: summary_count("upserted", row.try_get("upserted")?)?,
            skipped: summary_count("skipped", row.try_get("skipped")?)?,
            failed: summary_count("failed", row.try_get("failed")?)?,
        },
        error_message: row.try_get("error_message")?,
        created_by: row.try_get("created_by")?,
        date_from: row.try_get("date_from")?,
        date_to: row.try_get("date_to")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<SyncJobItem, StoreError> {
    let status_str: String = row.try_get("status")?;
    let status = ItemStatus::parse(&status_str).ok_or(StoreError::InvalidValue {
        field: "item status",
        value: status_str.clone(),
    })?;
    Ok(SyncJobItem {
        id: row.try_get("id")?,
        sync_job_id: row.try_get("sync_job_id")?,
        entity_type: row.try_get("entity_type")?,
        entity_key: row.try_get("entity_key")?,
        status,
        detail: row.try_get("detail")?,
        created_at: row.try_get("created_at")?,
    })
}

fn count_param(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl SyncStateStore for PostgresRepository {
    async fn insert_sync_job(&self, job: NewSyncJob) -> Result<SyncJob, StoreError> {
        let job = job.into_running();
        sqlx::query(
            r#"
            INSERT INTO sync_jobs (
                id, classroom_id, mode, status, created_by,
                date_from, date_to, started_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(job.id)
        .bind(&job.classroom_id)
        .bind(job.mode.as_str())
        .bind(job.status.as_str())
        .bind(&job.created_by)
        .bind(job.date_from)
        .bind(job.date_to)
        .bind(job.started_at)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;

        debug!(job_id = %job.id, "inserted sync job");
        Ok(job)
    }

    async fn insert_sync_job_item(&self, item: NewSyncJobItem) -> Result<SyncJobItem, StoreError> {
        let item = item.into_item();
        sqlx::query(
            r#"
            INSERT INTO sync_job_items (
                id, sync_job_id, entity_type, entity_key, status, detail, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(item.id)
        .bind(item.sync_job_id)
        .bind(&item.entity_type)
        .bind(&item.entity_key)
        .bind(item.status.as_str())
        .bind(&item.detail)
        .bind(item.created_at)
        .execute(&self.pool)
        .await?;
        Ok(item)
    }

    async fn finalize_sync_job(
        &self,
        job_id: Uuid,
        outcome: JobOutcome,
    ) -> Result<SyncJob, StoreError> {
        outcome.ensure_terminal()?;
        let row = sqlx::query(&format!(
            r#"
            UPDATE sync_jobs
            SET status = $2,
                planned = $3,
                upserted = $4,
                skipped = $5,
                failed = $6,
                error_message = $7,
                finished_at = $8
            WHERE id = $1 AND status IN ('pending', 'running')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(outcome.status.as_str())
        .bind(count_param(outcome.summary.planned))
        .bind(count_param(outcome.summary.upserted))
        .bind(count_param(outcome.summary.skipped))
        .bind(count_param(outcome.summary.failed))
        .bind(&outcome.error_message)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => job_from_row(&row),
            None => {
                // Either missing or already terminal.
                self.fetch_sync_job(job_id).await?;
                Err(StoreError::AlreadyFinalized(job_id))
            }
        }
    }

    async fn fetch_sync_job(&self, job_id: Uuid) -> Result<SyncJob, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(StoreError::JobNotFound(job_id)),
        }
    }

    async fn list_sync_job_items(&self, job_id: Uuid) -> Result<Vec<SyncJobItem>, StoreError> {
        self.fetch_sync_job(job_id).await?;
        let rows = sqlx::query(
            r#"
            SELECT id, sync_job_id, entity_type, entity_key, status, detail, created_at
            FROM sync_job_items
            WHERE sync_job_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn load_known_hashes(
        &self,
        entity_type: &str,
    ) -> Result<HashMap<String, String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT entity_type, entity_key, payload_hash
            FROM sync_hash_cache
            WHERE entity_type = $1
            "#,
        )
        .bind(entity_type)
        .fetch_all(&self.pool)
        .await?;

        let mut known = HashMap::with_capacity(rows.len());
        for row in rows {
            let ty: String = row.try_get("entity_type")?;
            let key: String = row.try_get("entity_key")?;
            known.insert(hash_cache_key(&ty, &key), row.try_get("payload_hash")?);
        }
        Ok(known)
    }

    async fn save_hashes(&self, entries: &[HashCacheEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO sync_hash_cache (entity_type, entity_key, payload_hash, sync_job_id, updated_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (entity_type, entity_key) DO UPDATE SET
                    payload_hash = EXCLUDED.payload_hash,
                    sync_job_id = EXCLUDED.sync_job_id,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&entry.entity_type)
            .bind(&entry.entity_key)
            .bind(&entry.payload_hash)
            .bind(entry.sync_job_id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl InternalDataSource for PostgresRepository {
    async fn load_portal_settings(&self, classroom_id: &str) -> Result<PortalSettings, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT classroom_id, course_identifier, portal_username, portal_password_encrypted
            FROM classroom_portal_settings
            WHERE classroom_id = $1
            "#,
        )
        .bind(classroom_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(StoreError::ClassroomNotConfigured(classroom_id.to_string()));
        };
        Ok(PortalSettings {
            classroom_id: row.try_get("classroom_id")?,
            course_identifier: row.try_get("course_identifier")?,
            username: row.try_get("portal_username")?,
            encrypted_password: row.try_get("portal_password_encrypted")?,
        })
    }

    async fn load_roster(&self, classroom_id: &str) -> Result<Vec<InternalStudent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT student_id, first_name, last_name
            FROM students
            WHERE classroom_id = $1
            ORDER BY last_name, first_name, student_id
            "#,
        )
        .bind(classroom_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<InternalStudent, StoreError> {
                Ok(InternalStudent {
                    student_id: row.try_get("student_id")?,
                    first_name: row.try_get("first_name")?,
                    last_name: row.try_get("last_name")?,
                })
            })
            .collect()
    }

    async fn load_attendance(
        &self,
        classroom_id: &str,
        range: DateRange,
    ) -> Result<Vec<AttendanceFact>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT student_id, attendance_date, status
            FROM attendance_records
            WHERE classroom_id = $1
              AND attendance_date BETWEEN $2 AND $3
            ORDER BY attendance_date, student_id
            "#,
        )
        .bind(classroom_id)
        .bind(range.from)
        .bind(range.to)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<AttendanceFact, StoreError> {
                Ok(AttendanceFact {
                    student_id: row.try_get("student_id")?,
                    date: row.try_get("attendance_date")?,
                    status: row.try_get("status")?,
                })
            })
            .collect()
    }
}
