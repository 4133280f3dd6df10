use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use rollsync_adapters::{AttendancePortal, PortalCredentials, PortalError};
use rollsync_core::{
    AttendanceFact, AttendanceStatus, InternalStudent, ItemStatus, MatchResult, PlanAction,
    PlannedOperation, StatusVocabulary, SyncErrorMessage, SyncJob, SyncJobStatus, SyncMode,
    SyncRequest, SyncRunResult, SyncSummary, ATTENDANCE_ENTITY,
};
use rollsync_storage::{
    CipherError, CredentialCipher, HashCacheEntry, InternalDataSource, JobOutcome, NewSyncJob,
    NewSyncJobItem, PortalSettings, StoreError, SyncStateStore,
};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dataset::{attendance_entity_key, validate_rows, DatasetNormalizer, RawAttendanceRow};
use crate::mapper::{map_dataset_to_operations, WriteTarget};
use crate::matcher::StudentMatcher;
use crate::planner::plan_operations;
use crate::report::write_run_report;

/// Item detail for a `noop` plan.
pub const DETAIL_UNCHANGED: &str = "unchanged";
/// Item detail for an upsert that a dry run did not write.
pub const DETAIL_PLANNED_ONLY: &str = "planned-only";

/// Errors that end a job as `failed`. Messages end up in `error_message`.
#[derive(Debug, Error)]
enum JobError {
    #[error("invalid date range: {from} is after {to}")]
    InvalidRange { from: NaiveDate, to: NaiveDate },
    #[error("failed to load internal data: {0}")]
    Load(StoreError),
    #[error("portal credentials unusable: {0}")]
    Credentials(#[from] CipherError),
    #[error("failed to open portal session: {0}")]
    Session(PortalError),
    #[error("attendance view for {date} unavailable: {source}")]
    View { date: NaiveDate, source: PortalError },
    #[error("sync aborted: {0}")]
    Aborted(PortalError),
    #[error("failed to record sync item: {0}")]
    Store(StoreError),
}

fn view_error(date: NaiveDate, source: PortalError) -> JobError {
    if source.is_fatal() {
        JobError::Aborted(source)
    } else {
        JobError::View { date, source }
    }
}

/// Mutable bookkeeping for one job while it runs.
struct JobRun {
    job_id: Uuid,
    mode: SyncMode,
    summary: SyncSummary,
    written: Vec<HashCacheEntry>,
}

/// Drives one attendance sync job end to end against a portal session.
pub struct SyncOrchestrator<P: AttendancePortal> {
    portal: P,
    store: Arc<dyn SyncStateStore>,
    source: Arc<dyn InternalDataSource>,
    cipher: CredentialCipher,
    matcher: StudentMatcher,
    normalizer: DatasetNormalizer,
    reports_dir: Option<PathBuf>,
}

impl<P: AttendancePortal> SyncOrchestrator<P> {
    pub fn new(
        portal: P,
        store: Arc<dyn SyncStateStore>,
        source: Arc<dyn InternalDataSource>,
        cipher: CredentialCipher,
    ) -> Self {
        Self {
            portal,
            store,
            source,
            cipher,
            matcher: StudentMatcher::default(),
            normalizer: DatasetNormalizer::default(),
            reports_dir: None,
        }
    }

    pub fn with_matcher(mut self, matcher: StudentMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_vocabulary(mut self, vocabulary: StatusVocabulary) -> Self {
        self.normalizer = DatasetNormalizer::new(vocabulary);
        self
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    pub fn portal(&self) -> &P {
        &self.portal
    }

    /// Runs one job to a terminal state.
    ///
    /// Job-level failures are reported through the returned result and the
    /// stored job; `Err` means the job record itself could not be created or
    /// finalized.
    pub async fn run_attendance_sync(&self, request: SyncRequest) -> Result<SyncRunResult, StoreError> {
        let job = self
            .store
            .insert_sync_job(NewSyncJob {
                classroom_id: request.classroom_id.clone(),
                mode: request.mode,
                created_by: request.created_by.clone(),
                date_range: request.date_range,
            })
            .await?;

        let span = info_span!(
            "sync_job",
            job_id = %job.id,
            classroom_id = %job.classroom_id,
            mode = job.mode.as_str()
        );
        async move {
            info!(
                from = %request.date_range.from,
                to = %request.date_range.to,
                created_by = %request.created_by,
                "sync job running"
            );
            let mut run = JobRun {
                job_id: job.id,
                mode: job.mode,
                summary: SyncSummary::default(),
                written: Vec::new(),
            };
            let outcome = self.run_job(&request, &mut run).await;

            let mut errors = Vec::new();
            if let Err(err) = &outcome {
                error!(error = %err, "sync job failed");
                errors.push(SyncErrorMessage {
                    message: err.to_string(),
                });
            }

            // Writes already landed, so their hashes are kept even when the job failed.
            if !run.written.is_empty() {
                if let Err(err) = self.store.save_hashes(&run.written).await {
                    warn!(
                        error = %err,
                        writes = run.written.len(),
                        "hash cache update failed; these writes will be replayed next run"
                    );
                    errors.push(SyncErrorMessage {
                        message: format!("hash cache update failed: {err}"),
                    });
                }
            }

            let job_outcome = match outcome {
                Ok(()) => JobOutcome::completed(run.summary),
                Err(err) => JobOutcome::failed(run.summary, err.to_string()),
            };
            let finished = self.store.finalize_sync_job(job.id, job_outcome).await?;
            info!(
                status = finished.status.as_str(),
                planned = finished.summary.planned,
                upserted = finished.summary.upserted,
                skipped = finished.summary.skipped,
                failed = finished.summary.failed,
                "sync job finished"
            );

            if let Some(dir) = &self.reports_dir {
                self.write_report(dir, &finished).await;
            }

            Ok(SyncRunResult {
                ok: finished.status == SyncJobStatus::Completed,
                job_id: finished.id,
                errors,
            })
        }
        .instrument(span)
        .await
    }

    async fn run_job(&self, request: &SyncRequest, run: &mut JobRun) -> Result<(), JobError> {
        let range = request.date_range;
        if !range.is_valid() {
            return Err(JobError::InvalidRange {
                from: range.from,
                to: range.to,
            });
        }

        let classroom_id = request.classroom_id.as_str();
        let settings = self
            .source
            .load_portal_settings(classroom_id)
            .await
            .map_err(JobError::Load)?;
        let roster = self
            .source
            .load_roster(classroom_id)
            .await
            .map_err(JobError::Load)?;
        let facts = self
            .source
            .load_attendance(classroom_id, range)
            .await
            .map_err(JobError::Load)?;
        let known_hashes = self
            .store
            .load_known_hashes(ATTENDANCE_ENTITY)
            .await
            .map_err(JobError::Load)?;

        let mut by_date: BTreeMap<NaiveDate, Vec<AttendanceFact>> = BTreeMap::new();
        for fact in facts.into_iter().filter(|f| range.contains(f.date)) {
            by_date.entry(fact.date).or_default().push(fact);
        }
        info!(
            students = roster.len(),
            dates = by_date.len(),
            known_hashes = known_hashes.len(),
            "loaded internal attendance"
        );
        if by_date.is_empty() {
            info!("no attendance recorded in range; nothing to sync");
            return Ok(());
        }

        let target = WriteTarget {
            classroom_id: classroom_id.to_string(),
            course_identifier: settings.course_identifier.clone(),
        };
        let mut session = self.portal.launch_browser().await.map_err(JobError::Session)?;
        let result = self
            .drive_session(
                &mut session,
                &settings,
                &target,
                &roster,
                &by_date,
                &known_hashes,
                run,
            )
            .await;
        if let Err(err) = self.portal.close_browser(session).await {
            warn!(error = %err, "failed to close portal session");
        }
        result
    }

    async fn drive_session(
        &self,
        session: &mut P::Session,
        settings: &PortalSettings,
        target: &WriteTarget,
        roster: &[InternalStudent],
        by_date: &BTreeMap<NaiveDate, Vec<AttendanceFact>>,
        known_hashes: &HashMap<String, String>,
        run: &mut JobRun,
    ) -> Result<(), JobError> {
        let mut page = self
            .portal
            .create_page(session)
            .await
            .map_err(JobError::Session)?;

        let credentials = PortalCredentials {
            username: settings.username.clone(),
            password: self.cipher.open(&settings.encrypted_password)?,
        };
        let login = self
            .portal
            .login_to_external_system(&mut page, &credentials)
            .await;
        drop(credentials);
        login.map_err(JobError::Session)?;

        self.portal
            .select_course(&mut page, &settings.course_identifier)
            .await
            .map_err(JobError::Session)?;
        info!(course = %settings.course_identifier, "portal session ready");

        for (date, facts) in by_date {
            self.sync_date(&mut page, target, *date, facts, roster, known_hashes, run)
                .await?;
        }
        Ok(())
    }

    async fn sync_date(
        &self,
        page: &mut P::Page,
        target: &WriteTarget,
        date: NaiveDate,
        facts: &[AttendanceFact],
        roster: &[InternalStudent],
        known_hashes: &HashMap<String, String>,
        run: &mut JobRun,
    ) -> Result<(), JobError> {
        self.portal
            .navigate_to_attendance_view(page, date)
            .await
            .map_err(|source| view_error(date, source))?;
        let external = self
            .portal
            .read_attendance_rows(page)
            .await
            .map_err(|source| view_error(date, source))?;

        let matches = self.matcher.match_students(roster, &external);
        let by_student: HashMap<&str, &MatchResult> = matches
            .iter()
            .map(|m| (m.student_id.as_str(), m))
            .collect();

        let date_key = date.format("%Y-%m-%d").to_string();
        let mut raw_rows = Vec::with_capacity(facts.len());
        for fact in facts {
            let matched = by_student.get(fact.student_id.as_str()).copied();
            match matched {
                Some(m) if m.matched => raw_rows.push(RawAttendanceRow {
                    student_id: fact.student_id.clone(),
                    date: date_key.clone(),
                    status: fact.status.clone(),
                    external_row_reference: m.external_row_reference.clone(),
                    external_name: m.external_name.clone(),
                }),
                // Left for the normalizer to discard.
                _ if fact.student_id.trim().is_empty() => raw_rows.push(RawAttendanceRow {
                    student_id: fact.student_id.clone(),
                    date: date_key.clone(),
                    status: fact.status.clone(),
                    external_row_reference: None,
                    external_name: None,
                }),
                Some(m) => {
                    warn!(
                        student_id = %fact.student_id,
                        %date,
                        confidence = m.confidence,
                        "no portal row matched student"
                    );
                    self.record(
                        run,
                        attendance_entity_key(&target.classroom_id, &fact.student_id, &date_key),
                        ItemStatus::Failed,
                        Some(format!(
                            "no portal row matched student (best confidence {})",
                            m.confidence
                        )),
                    )
                    .await?;
                }
                None => {
                    warn!(student_id = %fact.student_id, %date, "attendance for student outside roster");
                    self.record(
                        run,
                        attendance_entity_key(&target.classroom_id, &fact.student_id, &date_key),
                        ItemStatus::Failed,
                        Some("student is not on the classroom roster".into()),
                    )
                    .await?;
                }
            }
        }

        let normalized = self.normalizer.normalize(raw_rows);
        for discarded in normalized.discarded {
            let key = attendance_entity_key(
                &target.classroom_id,
                discarded.row.student_id.trim(),
                &date_key,
            );
            self.record(run, key, ItemStatus::Failed, Some(discarded.reason))
                .await?;
        }

        let validated = validate_rows(normalized.rows);
        for row_error in validated.errors {
            warn!(
                entity_key = %row_error.row.entity_key(&target.classroom_id),
                error = %row_error.error,
                "attendance row failed validation"
            );
            self.record(
                run,
                row_error.row.entity_key(&target.classroom_id),
                ItemStatus::Failed,
                Some(row_error.error.to_string()),
            )
            .await?;
        }

        let planned = plan_operations(
            map_dataset_to_operations(target, &validated.valid),
            known_hashes,
        );
        run.summary.planned += planned.len() as u32;
        info!(
            %date,
            portal_rows = external.len(),
            planned = planned.len(),
            upserts = planned.iter().filter(|p| p.action == PlanAction::Upsert).count(),
            "planned attendance writes"
        );

        for operation in planned {
            self.apply(page, operation, run).await?;
        }
        Ok(())
    }

    async fn apply(
        &self,
        page: &mut P::Page,
        planned: PlannedOperation,
        run: &mut JobRun,
    ) -> Result<(), JobError> {
        let PlannedOperation {
            operation,
            payload_hash,
            action,
        } = planned;

        match (action, run.mode) {
            (PlanAction::Noop, _) => {
                self.record(
                    run,
                    operation.entity_key,
                    ItemStatus::Skipped,
                    Some(DETAIL_UNCHANGED.into()),
                )
                .await
            }
            (PlanAction::Upsert, SyncMode::DryRun) => {
                self.record(
                    run,
                    operation.entity_key,
                    ItemStatus::Skipped,
                    Some(DETAIL_PLANNED_ONLY.into()),
                )
                .await
            }
            (PlanAction::Upsert, SyncMode::Execute) => {
                let status = operation
                    .payload
                    .get("status")
                    .and_then(|v| v.as_str())
                    .and_then(AttendanceStatus::parse);
                let Some(status) = status else {
                    return self
                        .record(
                            run,
                            operation.entity_key,
                            ItemStatus::Failed,
                            Some("payload carries no writable status".into()),
                        )
                        .await;
                };

                let written = self
                    .portal
                    .record_attendance_for_row(page, &operation.external_row_reference, status)
                    .await;
                match written {
                    Ok(()) => {
                        run.written.push(HashCacheEntry {
                            entity_type: operation.entity_type.clone(),
                            entity_key: operation.entity_key.clone(),
                            payload_hash,
                            sync_job_id: run.job_id,
                        });
                        let detail = format!(
                            "{status} recorded on row {}",
                            operation.external_row_reference
                        );
                        self.record(run, operation.entity_key, ItemStatus::Success, Some(detail))
                            .await
                    }
                    Err(err) if err.is_fatal() => {
                        self.record(
                            run,
                            operation.entity_key,
                            ItemStatus::Failed,
                            Some(err.to_string()),
                        )
                        .await?;
                        Err(JobError::Aborted(err))
                    }
                    Err(err) => {
                        warn!(entity_key = %operation.entity_key, error = %err, "attendance write failed");
                        self.record(
                            run,
                            operation.entity_key,
                            ItemStatus::Failed,
                            Some(err.to_string()),
                        )
                        .await
                    }
                }
            }
        }
    }

    async fn record(
        &self,
        run: &mut JobRun,
        entity_key: String,
        status: ItemStatus,
        detail: Option<String>,
    ) -> Result<(), JobError> {
        self.store
            .insert_sync_job_item(NewSyncJobItem {
                sync_job_id: run.job_id,
                entity_type: ATTENDANCE_ENTITY.to_string(),
                entity_key,
                status,
                detail,
            })
            .await
            .map_err(JobError::Store)?;
        run.summary.record(status);
        Ok(())
    }

    async fn write_report(&self, dir: &Path, job: &SyncJob) {
        let items = match self.store.list_sync_job_items(job.id).await {
            Ok(items) => items,
            Err(err) => {
                warn!(error = %err, "skipping run report; items unavailable");
                return;
            }
        };
        match write_run_report(dir, job, &items).await {
            Ok(path) => info!(report_dir = %path.display(), "wrote run report"),
            Err(err) => warn!(error = %format!("{err:#}"), "failed to write run report"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnects_during_navigation_abort_the_job() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 4).expect("date");
        assert!(matches!(
            view_error(date, PortalError::Disconnected("gone".into())),
            JobError::Aborted(_)
        ));
        let err = view_error(date, PortalError::Navigation("404".into()));
        assert_eq!(
            err.to_string(),
            "attendance view for 2024-03-04 unavailable: portal navigation failed: 404"
        );
    }

    #[test]
    fn job_errors_do_not_leak_credentials() {
        let err = JobError::Credentials(CipherError::Decrypt);
        assert_eq!(
            err.to_string(),
            "portal credentials unusable: credential could not be decrypted with the configured key"
        );
    }
}
