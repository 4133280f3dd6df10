use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rollsync_core::{DateRange, SyncMode, SyncRequest};
use rollsync_storage::{PostgresRepository, SyncStateStore};
use rollsync_sync::{DatabaseConfig, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "rollsync-cli")]
#[command(about = "Push classroom attendance into the district portal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync one classroom for an inclusive date range (dry run unless --execute).
    Sync {
        #[arg(long)]
        classroom: String,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
        #[arg(long)]
        execute: bool,
        #[arg(long, default_value = "cli")]
        created_by: String,
    },
    Migrate,
    /// Print a sync job and its items as JSON.
    Job { job_id: Uuid },
    /// Print the at-rest form of a portal password.
    EncryptCredential { plaintext: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sync {
            classroom,
            from,
            to,
            execute,
            created_by,
        } => {
            let request = SyncRequest {
                classroom_id: classroom,
                mode: if execute {
                    SyncMode::Execute
                } else {
                    SyncMode::DryRun
                },
                created_by,
                date_range: DateRange::new(from, to),
            };
            let result = rollsync_sync::run_attendance_sync_from_env(request).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.ok {
                bail!("sync job {} failed", result.job_id);
            }
        }
        Commands::Migrate => {
            let repository = connect().await?;
            repository
                .run_migrations()
                .await
                .context("running migrations")?;
            info!("migrations applied");
        }
        Commands::Job { job_id } => {
            let repository = connect().await?;
            let job = repository.fetch_sync_job(job_id).await?;
            let items = repository.list_sync_job_items(job_id).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "job": job, "items": items }))?
            );
        }
        Commands::EncryptCredential { plaintext } => {
            let config = SyncConfig::from_env()?;
            println!("{}", config.cipher().seal(&plaintext)?);
        }
    }

    Ok(())
}

async fn connect() -> Result<PostgresRepository> {
    DatabaseConfig::from_env().connect().await
}
