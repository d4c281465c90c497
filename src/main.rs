use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

use media_sync::config::{self, Config};
use media_sync::index::IndexGenerator;
use media_sync::jobs::{self, JobRunner, JobStore};
use media_sync::model::ResourceType;
use media_sync::scanner::FileScanner;
use media_sync::security::{self, Access};
use media_sync::storage::{self, PresignMethod, StorageClient};
use media_sync::sync::{ProgressFn, SyncEngine, SyncProgress};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the files of one resource type
    Scan { resource_type: ResourceType },
    /// Regenerate index documents
    Index {
        /// Only this type; defaults to every indexed type
        #[arg(long = "type")]
        resource_type: Option<ResourceType>,
        #[arg(long)]
        sequential: bool,
        #[arg(long)]
        workers: Option<usize>,
        /// Run as a tracked job
        #[arg(long)]
        job: bool,
    },
    /// Upload resource files to the object store
    Sync {
        #[arg(long = "type")]
        resource_type: Option<ResourceType>,
        #[arg(long)]
        dry_run: bool,
        /// Run as a tracked job
        #[arg(long)]
        job: bool,
    },
    /// Resolve a user-supplied path inside the media root
    Resolve { path: String },
    /// Issue a time-limited download URL
    Presign {
        key: String,
        #[arg(long, default_value_t = 3600)]
        ttl: u64,
    },
    /// List recorded jobs (needs `app.job_database`)
    Jobs,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    match args.command {
        Command::Scan { resource_type } => {
            let scanner = FileScanner::from_config(&cfg);
            print_json(&scanner.scan(resource_type))?;
        }
        Command::Index {
            resource_type,
            sequential,
            workers,
            job,
        } => {
            let generator = IndexGenerator::from_config(&cfg);
            let workers = workers.unwrap_or(cfg.app.max_workers);
            if job {
                let runner = job_runner(&cfg).await?;
                let running = runner.spawn_index(generator, !sequential, workers).await?;
                let id = running.id;
                running.wait().await;
                print_json(&runner.store().get(id).await?)?;
            } else {
                let types = match resource_type {
                    Some(rt) => vec![rt],
                    None => ResourceType::INDEXED.to_vec(),
                };
                let report = generator.generate_types(&types, !sequential, workers).await;
                print_json(&report.summary())?;
                if !report.success {
                    bail!("index generation failed");
                }
            }
        }
        Command::Sync {
            resource_type,
            dry_run,
            job,
        } => {
            let engine = sync_engine(&cfg)?;
            if job {
                let runner = job_runner(&cfg).await?;
                let running = runner.spawn_sync(engine, dry_run).await?;
                let id = running.id;
                running.wait().await;
                print_json(&runner.store().get(id).await?)?;
                return Ok(());
            }
            let log_progress = |p: &SyncProgress| {
                info!(
                    index = p.global_index,
                    total = p.global_total,
                    section = %p.section,
                    file = %p.file_name,
                    "syncing"
                );
            };
            let progress: ProgressFn<'_> = &log_progress;
            match resource_type {
                Some(rt) => {
                    let result = engine.sync_resource_type(rt, dry_run, Some(progress)).await;
                    print_json(&result)?;
                }
                None => {
                    let results = engine.sync_all(dry_run, Some(progress)).await;
                    print_json(&results)?;
                }
            }
        }
        Command::Resolve { path } => {
            let scanner = FileScanner::from_config(&cfg);
            let resolved = security::resolve(scanner.root(), &path, Access::Read)?;
            let metadata = scanner.compute_metadata(&path)?;
            print_json(&json!({
                "path": resolved.display().to_string(),
                "resource_type": scanner.infer_resource_type(&resolved),
                "metadata": metadata,
            }))?;
        }
        Command::Presign { key, ttl } => {
            let client = StorageClient::new(storage::connect(&cfg)?, &cfg.retry);
            let Some(url) = client.presigned_url(&key, ttl, PresignMethod::Get) else {
                bail!("could not presign {key}");
            };
            print_json(&json!({ "key": key, "url": url, "expires_in": ttl }))?;
        }
        Command::Jobs => {
            let store = jobs::persistent_store(&cfg).await?;
            print_json(&store.list().await?)?;
        }
    }
    Ok(())
}

fn sync_engine(cfg: &Config) -> Result<SyncEngine> {
    let backend = storage::connect(cfg).context("failed to configure object store")?;
    Ok(SyncEngine::from_config(cfg, StorageClient::new(backend, &cfg.retry)))
}

async fn job_runner(cfg: &Config) -> Result<JobRunner> {
    Ok(JobRunner::new(jobs::store_from_config(cfg).await?))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
