use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use rollsync_core::{ItemStatus, SyncJob, SyncJobItem};
use rollsync_storage::sha256_hex;
use serde::Serialize;
use tokio::fs;

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub job_id: String,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `<root>/<job_id>/` with a markdown summary, the item ledger as JSON
/// and a parquet snapshot of the items plus its manifest. Returns the job's
/// report directory.
pub async fn write_run_report(root: &Path, job: &SyncJob, items: &[SyncJobItem]) -> Result<PathBuf> {
    let report_dir = root.join(job.id.to_string());
    let snapshot_dir = report_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let summary_path = report_dir.join("summary.md");
    fs::write(&summary_path, summary_markdown(job, items))
        .await
        .with_context(|| format!("writing {}", summary_path.display()))?;

    let items_path = report_dir.join("items.json");
    let items_json = serde_json::to_vec_pretty(&serde_json::json!({
        "job": job,
        "items": items,
    }))
    .context("serializing sync job items")?;
    fs::write(&items_path, items_json)
        .await
        .with_context(|| format!("writing {}", items_path.display()))?;

    let parquet_path = snapshot_dir.join("items.parquet");
    write_items_parquet(&parquet_path, items)?;

    let manifest = ReportManifest {
        schema_version: 1,
        job_id: job.id.to_string(),
        files: vec![
            manifest_entry("summary", &report_dir, &summary_path)?,
            manifest_entry("items", &report_dir, &items_path)?,
            manifest_entry("items_snapshot", &report_dir, &parquet_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(report_dir)
}

pub fn summary_markdown(job: &SyncJob, items: &[SyncJobItem]) -> String {
    let mut failures: BTreeMap<&str, usize> = BTreeMap::new();
    for item in items.iter().filter(|i| i.status == ItemStatus::Failed) {
        *failures
            .entry(item.detail.as_deref().unwrap_or("no detail"))
            .or_default() += 1;
    }

    let mut out = format!(
        "# Attendance Sync {}\n\n- Classroom: `{}`\n- Mode: {}\n- Status: {}\n- Range: {} to {}\n- Requested by: {}\n- Started: {}\n- Finished: {}\n\n## Summary\n- planned: {}\n- upserted: {}\n- skipped: {}\n- failed: {}\n",
        job.id,
        job.classroom_id,
        job.mode.as_str(),
        job.status.as_str(),
        job.date_from,
        job.date_to,
        job.created_by,
        job.started_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
        job.finished_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
        job.summary.planned,
        job.summary.upserted,
        job.summary.skipped,
        job.summary.failed,
    );
    if let Some(message) = &job.error_message {
        out.push_str(&format!("\n## Error\n{message}\n"));
    }
    if !failures.is_empty() {
        out.push_str("\n## Failures\n");
        for (detail, count) in failures {
            out.push_str(&format!("- {detail}: {count}\n"));
        }
    }
    out
}

fn write_items_parquet(path: &PathBuf, items: &[SyncJobItem]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("entity_type", DataType::Utf8, false),
        ArrowField::new("entity_key", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("detail", DataType::Utf8, true),
        ArrowField::new("created_at", DataType::Utf8, false),
    ]));

    let entity_types = StringArray::from(
        items
            .iter()
            .map(|i| Some(i.entity_type.as_str()))
            .collect::<Vec<_>>(),
    );
    let entity_keys = StringArray::from(
        items
            .iter()
            .map(|i| Some(i.entity_key.as_str()))
            .collect::<Vec<_>>(),
    );
    let statuses = StringArray::from(
        items
            .iter()
            .map(|i| Some(i.status.as_str()))
            .collect::<Vec<_>>(),
    );
    let details = StringArray::from(items.iter().map(|i| i.detail.as_deref()).collect::<Vec<_>>());
    let created = StringArray::from(
        items
            .iter()
            .map(|i| Some(i.created_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(entity_types),
            Arc::new(entity_keys),
            Arc::new(statuses),
            Arc::new(details),
            Arc::new(created),
        ],
    )
    .context("building sync items record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, report_dir: &Path, path: &Path) -> Result<ReportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(report_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ReportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use rollsync_core::{SyncJobStatus, SyncMode, SyncSummary};
    use uuid::Uuid;

    fn job() -> SyncJob {
        let day = NaiveDate::from_ymd_opt(2024, 3, 4).expect("date");
        SyncJob {
            id: Uuid::new_v4(),
            classroom_id: "room-7".into(),
            mode: SyncMode::Execute,
            status: SyncJobStatus::Completed,
            summary: SyncSummary {
                planned: 2,
                upserted: 1,
                skipped: 0,
                failed: 2,
            },
            error_message: None,
            created_by: "scheduler".into(),
            date_from: day,
            date_to: day,
            started_at: Some(Utc::now()),
            finished_at: Some(Utc::now()),
            created_at: Utc::now(),
        }
    }

    fn item(job_id: Uuid, key: &str, status: ItemStatus, detail: Option<&str>) -> SyncJobItem {
        SyncJobItem {
            id: Uuid::new_v4(),
            sync_job_id: job_id,
            entity_type: "attendance".into(),
            entity_key: key.into(),
            status,
            detail: detail.map(Into::into),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn markdown_groups_failures() {
        let job = job();
        let items = vec![
            item(job.id, "s1:2024-03-04", ItemStatus::Success, None),
            item(job.id, "s2:2024-03-04", ItemStatus::Failed, Some("row locked")),
            item(job.id, "s3:2024-03-04", ItemStatus::Failed, Some("row locked")),
        ];
        let md = summary_markdown(&job, &items);
        assert!(md.contains("- Classroom: `room-7`"));
        assert!(md.contains("- upserted: 1"));
        assert!(md.contains("- row locked: 2"));
        assert!(!md.contains("## Error"));
    }

    #[tokio::test]
    async fn writes_report_tree_with_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let job = job();
        let items = vec![item(job.id, "s1:2024-03-04", ItemStatus::Success, Some("present"))];

        let report_dir = write_run_report(dir.path(), &job, &items)
            .await
            .expect("report");
        assert_eq!(report_dir, dir.path().join(job.id.to_string()));
        assert!(report_dir.join("summary.md").exists());
        assert!(report_dir.join("snapshots/items.parquet").exists());

        let manifest: serde_json::Value = serde_json::from_slice(
            &std::fs::read(report_dir.join("snapshots/manifest.json")).expect("manifest"),
        )
        .expect("json");
        let files = manifest["files"].as_array().expect("files");
        assert_eq!(files.len(), 3);
        assert_eq!(files[2]["path"], "snapshots/items.parquet");
        assert_eq!(files[0]["sha256"].as_str().map(str::len), Some(64));

        let ledger: serde_json::Value = serde_json::from_slice(
            &std::fs::read(report_dir.join("items.json")).expect("items"),
        )
        .expect("json");
        assert_eq!(ledger["items"][0]["entity_key"], "s1:2024-03-04");
        assert_eq!(ledger["job"]["status"], "completed");
    }
}
