use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use rollsync_core::{
    hash_cache_key, AttendanceFact, DateRange, InternalStudent, SyncJob, SyncJobItem,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    HashCacheEntry, InternalDataSource, JobOutcome, NewSyncJob, NewSyncJobItem, PortalSettings,
    StoreError, SyncStateStore,
};

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<Uuid, SyncJob>,
    items: Vec<SyncJobItem>,
    hashes: HashMap<(String, String), String>,
}

/// Process-local store for tests and offline dry runs.
#[derive(Debug, Default)]
pub struct MemorySyncStateStore {
    state: Mutex<MemoryState>,
    fail_hash_writes: AtomicBool,
}

impl MemorySyncStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later `save_hashes` call fail.
    pub fn fail_hash_writes(&self, fail: bool) {
        self.fail_hash_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn seed_hash(&self, entity_type: &str, entity_key: &str, payload_hash: &str) {
        let mut state = self.state.lock().await;
        state.hashes.insert(
            (entity_type.to_string(), entity_key.to_string()),
            payload_hash.to_string(),
        );
    }

    pub async fn jobs(&self) -> Vec<SyncJob> {
        let state = self.state.lock().await;
        let mut jobs = state.jobs.values().cloned().collect::<Vec<_>>();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }
}

#[async_trait]
impl SyncStateStore for MemorySyncStateStore {
    async fn insert_sync_job(&self, job: NewSyncJob) -> Result<SyncJob, StoreError> {
        let job = job.into_running();
        let mut state = self.state.lock().await;
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn insert_sync_job_item(&self, item: NewSyncJobItem) -> Result<SyncJobItem, StoreError> {
        let mut state = self.state.lock().await;
        if !state.jobs.contains_key(&item.sync_job_id) {
            return Err(StoreError::JobNotFound(item.sync_job_id));
        }
        let item = item.into_item();
        state.items.push(item.clone());
        Ok(item)
    }

    async fn finalize_sync_job(
        &self,
        job_id: Uuid,
        outcome: JobOutcome,
    ) -> Result<SyncJob, StoreError> {
        outcome.ensure_terminal()?;
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        if job.status.is_terminal() {
            return Err(StoreError::AlreadyFinalized(job_id));
        }
        job.status = outcome.status;
        job.summary = outcome.summary;
        job.error_message = outcome.error_message;
        job.finished_at = Some(Utc::now());
        Ok(job.clone())
    }

    async fn fetch_sync_job(&self, job_id: Uuid) -> Result<SyncJob, StoreError> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::JobNotFound(job_id))
    }

    async fn list_sync_job_items(&self, job_id: Uuid) -> Result<Vec<SyncJobItem>, StoreError> {
        let state = self.state.lock().await;
        if !state.jobs.contains_key(&job_id) {
            return Err(StoreError::JobNotFound(job_id));
        }
        Ok(state
            .items
            .iter()
            .filter(|item| item.sync_job_id == job_id)
            .cloned()
            .collect())
    }

    async fn load_known_hashes(
        &self,
        entity_type: &str,
    ) -> Result<HashMap<String, String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .hashes
            .iter()
            .filter(|((ty, _), _)| ty == entity_type)
            .map(|((ty, key), hash)| (hash_cache_key(ty, key), hash.clone()))
            .collect())
    }

    async fn save_hashes(&self, entries: &[HashCacheEntry]) -> Result<(), StoreError> {
        if self.fail_hash_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("hash cache write rejected".into()));
        }
        let mut state = self.state.lock().await;
        for entry in entries {
            state.hashes.insert(
                (entry.entity_type.clone(), entry.entity_key.clone()),
                entry.payload_hash.clone(),
            );
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemorySources {
    settings: HashMap<String, PortalSettings>,
    rosters: HashMap<String, Vec<InternalStudent>>,
    attendance: HashMap<String, Vec<AttendanceFact>>,
    unavailable: Option<String>,
}

/// Roster and attendance fixtures standing in for the classroom database.
#[derive(Debug, Default)]
pub struct MemoryDataSource {
    inner: Mutex<MemorySources>,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_settings(&self, settings: PortalSettings) {
        let mut inner = self.inner.lock().await;
        inner.settings.insert(settings.classroom_id.clone(), settings);
    }

    pub async fn put_roster(&self, classroom_id: &str, students: Vec<InternalStudent>) {
        let mut inner = self.inner.lock().await;
        inner.rosters.insert(classroom_id.to_string(), students);
    }

    pub async fn put_attendance(&self, classroom_id: &str, facts: Vec<AttendanceFact>) {
        let mut inner = self.inner.lock().await;
        inner.attendance.insert(classroom_id.to_string(), facts);
    }

    /// Every read fails with `message` until cleared with `None`.
    pub async fn set_unavailable(&self, message: Option<&str>) {
        let mut inner = self.inner.lock().await;
        inner.unavailable = message.map(ToString::to_string);
    }

    fn check(inner: &MemorySources) -> Result<(), StoreError> {
        match &inner.unavailable {
            Some(message) => Err(StoreError::Unavailable(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl InternalDataSource for MemoryDataSource {
    async fn load_portal_settings(&self, classroom_id: &str) -> Result<PortalSettings, StoreError> {
        let inner = self.inner.lock().await;
        Self::check(&inner)?;
        inner
            .settings
            .get(classroom_id)
            .cloned()
            .ok_or_else(|| StoreError::ClassroomNotConfigured(classroom_id.to_string()))
    }

    async fn load_roster(&self, classroom_id: &str) -> Result<Vec<InternalStudent>, StoreError> {
        let inner = self.inner.lock().await;
        Self::check(&inner)?;
        Ok(inner.rosters.get(classroom_id).cloned().unwrap_or_default())
    }

    async fn load_attendance(
        &self,
        classroom_id: &str,
        range: DateRange,
    ) -> Result<Vec<AttendanceFact>, StoreError> {
        let inner = self.inner.lock().await;
        Self::check(&inner)?;
        let mut facts = inner
            .attendance
            .get(classroom_id)
            .map(|facts| {
                facts
                    .iter()
                    .filter(|f| range.contains(f.date))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        facts.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.student_id.cmp(&b.student_id)));
        Ok(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rollsync_core::{ItemStatus, SyncJobStatus, SyncMode, SyncSummary};

    fn new_job() -> NewSyncJob {
        let day = NaiveDate::from_ymd_opt(2026, 3, 2).expect("date");
        NewSyncJob {
            classroom_id: "room-12".into(),
            mode: SyncMode::Execute,
            created_by: "ops".into(),
            date_range: DateRange::new(day, day),
        }
    }

    #[tokio::test]
    async fn finalize_happens_exactly_once() {
        let store = MemorySyncStateStore::new();
        let job = store.insert_sync_job(new_job()).await.expect("insert");

        let summary = SyncSummary {
            planned: 2,
            upserted: 1,
            skipped: 1,
            failed: 0,
        };
        let done = store
            .finalize_sync_job(job.id, JobOutcome::completed(summary))
            .await
            .expect("finalize");
        assert_eq!(done.status, SyncJobStatus::Completed);
        assert_eq!(done.summary, summary);
        assert!(done.finished_at.is_some());

        let again = store
            .finalize_sync_job(job.id, JobOutcome::failed(summary, "late failure"))
            .await;
        assert!(matches!(again, Err(StoreError::AlreadyFinalized(id)) if id == job.id));
        let stored = store.fetch_sync_job(job.id).await.expect("fetch");
        assert_eq!(stored.status, SyncJobStatus::Completed);
        assert_eq!(stored.error_message, None);
    }

    #[tokio::test]
    async fn items_belong_to_their_job() {
        let store = MemorySyncStateStore::new();
        let first = store.insert_sync_job(new_job()).await.expect("insert");
        let second = store.insert_sync_job(new_job()).await.expect("insert");

        for (job_id, key) in [(first.id, "s1:2026-03-02"), (second.id, "s2:2026-03-02")] {
            store
                .insert_sync_job_item(NewSyncJobItem {
                    sync_job_id: job_id,
                    entity_type: "attendance".into(),
                    entity_key: key.into(),
                    status: ItemStatus::Skipped,
                    detail: None,
                })
                .await
                .expect("item");
        }

        let items = store.list_sync_job_items(first.id).await.expect("list");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].entity_key, "s1:2026-03-02");

        let orphan = store
            .insert_sync_job_item(NewSyncJobItem {
                sync_job_id: Uuid::new_v4(),
                entity_type: "attendance".into(),
                entity_key: "s3:2026-03-02".into(),
                status: ItemStatus::Failed,
                detail: None,
            })
            .await;
        assert!(matches!(orphan, Err(StoreError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn hash_cache_is_last_write_wins_per_key() {
        let store = MemorySyncStateStore::new();
        let job_id = Uuid::new_v4();
        let entry = |key: &str, hash: &str| HashCacheEntry {
            entity_type: "attendance".into(),
            entity_key: key.into(),
            payload_hash: hash.into(),
            sync_job_id: job_id,
        };
        store
            .save_hashes(&[entry("s1:2026-03-02", "aaa"), entry("s2:2026-03-02", "bbb")])
            .await
            .expect("save");
        store
            .save_hashes(&[entry("s1:2026-03-02", "ccc")])
            .await
            .expect("save");
        store.seed_hash("other", "x", "zzz").await;

        let known = store.load_known_hashes("attendance").await.expect("load");
        assert_eq!(known.len(), 2);
        assert_eq!(known["attendance:s1:2026-03-02"], "ccc");
        assert_eq!(known["attendance:s2:2026-03-02"], "bbb");

        store.fail_hash_writes(true);
        assert!(store.save_hashes(&[entry("s1:2026-03-02", "ddd")]).await.is_err());
    }

    #[tokio::test]
    async fn data_source_filters_by_range_and_reports_outages() {
        let source = MemoryDataSource::new();
        let d = |day| NaiveDate::from_ymd_opt(2026, 3, day).expect("date");
        source
            .put_attendance(
                "room-12",
                vec![
                    AttendanceFact { student_id: "s2".into(), date: d(3), status: "present".into() },
                    AttendanceFact { student_id: "s1".into(), date: d(3), status: "absent".into() },
                    AttendanceFact { student_id: "s1".into(), date: d(9), status: "late".into() },
                ],
            )
            .await;

        let facts = source
            .load_attendance("room-12", DateRange::new(d(2), d(6)))
            .await
            .expect("load");
        assert_eq!(
            facts.iter().map(|f| f.student_id.as_str()).collect::<Vec<_>>(),
            vec!["s1", "s2"]
        );

        assert!(matches!(
            source.load_portal_settings("room-12").await,
            Err(StoreError::ClassroomNotConfigured(_))
        ));

        source.set_unavailable(Some("connection refused")).await;
        assert!(matches!(
            source.load_roster("room-12").await,
            Err(StoreError::Unavailable(msg)) if msg == "connection refused"
        ));
    }
}
