mod shutdown;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use taxmirror_core::{normalize_rut, PortalCredentials, Session};
use taxmirror_storage::{CredentialStore, DocumentStore, FileCredentialStore, PgDocumentStore};
use taxmirror_sync::{export_snapshot, StoreMode, SyncConfig, SyncScheduler, SyncServices};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "taxmirror-cli")]
#[command(about = "Mirror tax-portal documents and forms into local storage")]
struct Cli {
    /// Fallback log filter when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync purchases, sales and receipts for the most recent periods.
    Sync {
        #[arg(long)]
        session: Uuid,
        #[arg(long, default_value_t = 1)]
        months: usize,
        /// Keep records in memory instead of the database.
        #[arg(long)]
        dry_run: bool,
        /// Write sync_report.json and summary.md under the reports directory.
        #[arg(long)]
        report: bool,
    },
    /// List monthly declaration forms for the most recent years.
    Forms {
        #[arg(long)]
        session: Uuid,
        #[arg(long, default_value_t = 1)]
        years: usize,
    },
    /// Download one form artifact.
    Download {
        #[arg(long)]
        artifact: Uuid,
        #[arg(long)]
        session: Uuid,
    },
    /// Download every pending form artifact of an entity.
    DownloadPending {
        #[arg(long)]
        entity: Uuid,
        #[arg(long)]
        session: Uuid,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Fetch the taxpayer profile behind a session.
    Whoami {
        #[arg(long)]
        session: Uuid,
    },
    /// Write a parquet snapshot of an entity's documents.
    Export {
        #[arg(long)]
        entity: Uuid,
        #[arg(long)]
        out: PathBuf,
    },
    Migrate,
    /// Run the cron scheduler until interrupted.
    Schedule {
        /// Sync all active sessions once before waiting for the schedule.
        #[arg(long)]
        run_now: bool,
    },
    #[command(subcommand)]
    Session(SessionCommands),
}

#[derive(Debug, Subcommand)]
enum SessionCommands {
    /// Register portal credentials for an entity.
    Add {
        #[arg(long)]
        entity: Uuid,
        #[arg(long)]
        rut: String,
        #[arg(long, env = "TAXMIRROR_PORTAL_PASSWORD", hide_env_values = true)]
        password: String,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .init();

    let config = SyncConfig::from_env();
    match cli.command {
        Commands::Sync {
            session,
            months,
            dry_run,
            report,
        } => {
            let mode = if dry_run { StoreMode::DryRun } else { StoreMode::Postgres };
            let services = SyncServices::from_config(config, mode).await?;
            let cancel = shutdown::install_signal_handler()?;
            let stored = services.credentials.get(session).await?;
            let summary = services
                .orchestrator(stored.entity_id)
                .sync(session, months, &cancel)
                .await?;
            if report {
                let dir = services.reports().write_sync_report(&summary).await?;
                info!(dir = %dir.display(), "sync report written");
            }
            let overall = summary.totals.overall();
            println!(
                "sync complete: run_id={} periods={} total={} new={} updated={} errors={}",
                summary.run_id,
                summary.periods_processed,
                overall.total,
                overall.new,
                overall.updated,
                summary.errors.len()
            );
        }
        Commands::Forms { session, years } => {
            let services = SyncServices::from_config(config, StoreMode::Postgres).await?;
            let cancel = shutdown::install_signal_handler()?;
            let stored = services.credentials.get(session).await?;
            let summary = services
                .orchestrator(stored.entity_id)
                .sync_forms(session, years, &cancel)
                .await?;
            print_json(&summary)?;
        }
        Commands::Download { artifact, session } => {
            let services = SyncServices::from_config(config, StoreMode::Postgres).await?;
            let outcome = services.artifact_pipeline().download(artifact, session).await?;
            print_json(&outcome)?;
        }
        Commands::DownloadPending { entity, session, limit } => {
            let services = SyncServices::from_config(config, StoreMode::Postgres).await?;
            let outcomes = services
                .artifact_pipeline()
                .download_pending(entity, session, limit)
                .await?;
            let stored = outcomes.iter().filter(|o| o.success).count();
            print_json(&outcomes)?;
            println!("downloaded {stored} of {}", outcomes.len());
        }
        Commands::Whoami { session } => {
            let services = SyncServices::from_config(config, StoreMode::DryRun).await?;
            let stored = services.credentials.get(session).await?;
            let profile = services.orchestrator(stored.entity_id).contributor_info(session).await?;
            print_json(&profile)?;
        }
        Commands::Export { entity, out } => {
            let services = SyncServices::from_config(config, StoreMode::Postgres).await?;
            let documents = services.documents.list_documents(entity).await?;
            let manifest = export_snapshot(&out, entity, &documents)?;
            println!("exported {} documents: {}", documents.len(), manifest.display());
        }
        Commands::Migrate => {
            let store = PgDocumentStore::connect(&config.database_url)
                .await
                .context("connecting to document database")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule { run_now } => {
            let services = SyncServices::from_config(config, StoreMode::Postgres).await?;
            let cancel = shutdown::install_signal_handler()?;
            let scheduler = SyncScheduler::new(services, cancel.clone());
            if run_now {
                let results = scheduler.run_once().await?;
                let failed = results.iter().filter(|r| r.result.is_err()).count();
                info!(sessions = results.len(), failed, "initial sync finished");
            }
            let Some(mut sched) = scheduler.build().await? else {
                bail!("scheduler is disabled; set TAXMIRROR_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running, press Ctrl+C to stop");
            cancel.cancelled().await;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Session(SessionCommands::Add { entity, rut, password }) => {
            let Some(rut) = normalize_rut(&rut) else {
                bail!("not a valid RUT: {rut}");
            };
            let store = FileCredentialStore::new(config.sessions_dir.clone());
            let session = Session::new(entity, PortalCredentials { rut, password });
            store.save(&session).await?;
            println!("session {} registered for entity {entity}", session.id);
        }
    }

    Ok(())
}
