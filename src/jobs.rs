//! Long-running index and sync runs tracked through an injected [`JobStore`].
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{self, Pool};
use crate::index::IndexGenerator;
use crate::model::{Job, JobKind, JobState, ResourceType, SyncResult};
use crate::sync::{ProgressFn, SyncEngine, SyncProgress};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("app.job_database is not set; jobs are only kept in memory for a single run")]
    NotPersistent,
    #[error("job store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, kind: JobKind) -> Result<Job, JobError>;
    async fn get(&self, id: Uuid) -> Result<Option<Job>, JobError>;
    /// Replace the stored job with `job`. Fails with `NotFound` for unknown ids.
    async fn update(&self, job: &Job) -> Result<(), JobError>;
    async fn delete(&self, id: Uuid) -> Result<bool, JobError>;
    /// Oldest first.
    async fn list(&self) -> Result<Vec<Job>, JobError>;
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, kind: JobKind) -> Result<Job, JobError> {
        let job = Job::new(kind);
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, JobError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<(), JobError> {
        match self.jobs.write().await.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(JobError::NotFound(job.id)),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool, JobError> {
        Ok(self.jobs.write().await.remove(&id).is_some())
    }

    async fn list(&self) -> Result<Vec<Job>, JobError> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }
}

/// Jobs persisted in SQLite so they survive a restart.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: Pool,
}

impl SqliteJobStore {
    /// Open (or create) the database and apply migrations.
    pub async fn connect(database_url: &str) -> Result<Self, JobError> {
        let pool = db::init_pool(database_url).await?;
        db::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, kind: JobKind) -> Result<Job, JobError> {
        let job = Job::new(kind);
        db::insert_job(&self.pool, &job).await?;
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, JobError> {
        Ok(db::fetch_job(&self.pool, id).await?)
    }

    async fn update(&self, job: &Job) -> Result<(), JobError> {
        if db::update_job(&self.pool, job).await? {
            Ok(())
        } else {
            Err(JobError::NotFound(job.id))
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool, JobError> {
        Ok(db::delete_job(&self.pool, id).await?)
    }

    async fn list(&self) -> Result<Vec<Job>, JobError> {
        Ok(db::list_jobs(&self.pool).await?)
    }
}

/// SQLite store when `app.job_database` is set, otherwise a per-process
/// memory store.
pub async fn store_from_config(cfg: &Config) -> Result<Arc<dyn JobStore>, JobError> {
    match persistent_store(cfg).await {
        Ok(store) => Ok(Arc::new(store)),
        Err(JobError::NotPersistent) => Ok(Arc::new(MemoryJobStore::new())),
        Err(err) => Err(err),
    }
}

/// The configured SQLite store. Reading back earlier runs needs one.
pub async fn persistent_store(cfg: &Config) -> Result<SqliteJobStore, JobError> {
    match &cfg.app.job_database {
        Some(url) => SqliteJobStore::connect(url).await,
        None => Err(JobError::NotPersistent),
    }
}

/// Handle to a spawned job. The store stays the source of truth; the handle
/// only lets callers wait for the run to end.
#[derive(Debug)]
pub struct RunningJob {
    pub id: Uuid,
    handle: JoinHandle<()>,
}

impl RunningJob {
    pub async fn wait(self) {
        if let Err(err) = self.handle.await {
            error!(job = %self.id, ?err, "job task aborted");
        }
    }
}

#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn JobStore>,
}

impl JobRunner {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Run `sync_all` in the background. Per-file progress is streamed into
    /// the store; the job fails when any file failed.
    #[instrument(skip(self, engine))]
    pub async fn spawn_sync(&self, engine: SyncEngine, dry_run: bool) -> Result<RunningJob, JobError> {
        let mut job = self.store.create(JobKind::Sync).await?;
        job.state = JobState::Running;
        job.updated_at = Utc::now();
        self.store.update(&job).await?;
        info!(job = %job.id, dry_run, "sync job started");

        let store = self.store.clone();
        let id = job.id;
        let handle = tokio::spawn(async move {
            let (tx, rx) = mpsc::unbounded_channel::<SyncProgress>();
            let started = job.clone();
            let writer = tokio::spawn(record_progress(store.clone(), job, rx));
            let callback = move |p: &SyncProgress| {
                let _ = tx.send(p.clone());
            };
            let progress: ProgressFn<'_> = &callback;
            let results = engine.sync_all(dry_run, Some(progress)).await;
            // Closing the sender lets the writer drain and hand the job back.
            drop(callback);

            let (state, message) = sync_summary(&results);
            let mut job = match writer.await {
                Ok(job) => job,
                Err(err) => {
                    error!(job = %id, ?err, "progress writer aborted");
                    let mut job = started;
                    let message = format!("progress tracking failed; {message}");
                    finish(store.as_ref(), &mut job, JobState::Failed, message).await;
                    return;
                }
            };
            finish(store.as_ref(), &mut job, state, message).await;
        });
        Ok(RunningJob { id, handle })
    }

    /// Regenerate every indexed type in the background.
    #[instrument(skip(self, generator))]
    pub async fn spawn_index(
        &self,
        generator: IndexGenerator,
        parallel: bool,
        max_workers: usize,
    ) -> Result<RunningJob, JobError> {
        let mut job = self.store.create(JobKind::Index).await?;
        job.state = JobState::Running;
        job.progress.total = ResourceType::INDEXED.len();
        job.updated_at = Utc::now();
        self.store.update(&job).await?;
        info!(job = %job.id, parallel, max_workers, "index job started");

        let store = self.store.clone();
        let id = job.id;
        let handle = tokio::spawn(async move {
            let report = generator.generate_all(parallel, max_workers).await;
            let generated = report.results.values().filter(|r| r.is_ok()).count();
            job.progress.current = generated;
            let state = if report.success {
                JobState::Completed
            } else {
                JobState::Failed
            };
            let message = format!(
                "generated {generated} of {} indexes",
                report.results.len()
            );
            finish(store.as_ref(), &mut job, state, message).await;
        });
        Ok(RunningJob { id, handle })
    }
}

async fn record_progress(
    store: Arc<dyn JobStore>,
    mut job: Job,
    mut rx: mpsc::UnboundedReceiver<SyncProgress>,
) -> Job {
    while let Some(p) = rx.recv().await {
        job.progress.current = p.global_index;
        job.progress.total = p.global_total;
        job.progress.section = Some(p.section.as_str().to_string());
        job.progress.file = Some(p.file_name);
        job.updated_at = Utc::now();
        if let Err(err) = store.update(&job).await {
            warn!(job = %job.id, error = %err, "failed to record job progress");
        }
    }
    job
}

fn sync_summary(results: &BTreeMap<ResourceType, SyncResult>) -> (JobState, String) {
    let total: usize = results.values().map(|r| r.total_files).sum();
    let synced: usize = results.values().map(|r| r.synced_count).sum();
    let errors: usize = results.values().map(|r| r.error_count).sum();
    let state = if errors == 0 {
        JobState::Completed
    } else {
        JobState::Failed
    };
    (state, format!("synced {synced} of {total} files, {errors} errors"))
}

async fn finish(store: &dyn JobStore, job: &mut Job, state: JobState, message: String) {
    job.state = state;
    job.message = Some(message);
    job.updated_at = Utc::now();
    match store.update(job).await {
        Ok(()) => info!(job = %job.id, state = state.as_str(), "job finished"),
        Err(err) => error!(job = %job.id, error = %err, "failed to record job result"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_crud() {
        let store = MemoryJobStore::new();
        let mut job = store.create(JobKind::Index).await.unwrap();
        assert_eq!(job.state, JobState::Pending);

        job.state = JobState::Running;
        store.update(&job).await.unwrap();
        assert_eq!(store.get(job.id).await.unwrap().unwrap().state, JobState::Running);

        let other = store.create(JobKind::Sync).await.unwrap();
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);

        assert!(store.delete(job.id).await.unwrap());
        assert!(!store.delete(job.id).await.unwrap());
        assert!(store.get(job.id).await.unwrap().is_none());
        assert!(matches!(store.update(&job).await, Err(JobError::NotFound(id)) if id == job.id));
        assert_eq!(store.list().await.unwrap()[0].id, other.id);
    }

    #[test]
    fn sync_summary_fails_on_any_error() {
        let mut results = BTreeMap::new();
        let mut ok = SyncResult::empty(ResourceType::Pages, false);
        ok.total_files = 2;
        ok.synced_count = 2;
        results.insert(ResourceType::Pages, ok);
        assert_eq!(sync_summary(&results).0, JobState::Completed);

        let mut bad = SyncResult::empty(ResourceType::Endpoints, false);
        bad.total_files = 1;
        bad.error_count = 1;
        results.insert(ResourceType::Endpoints, bad);
        let (state, message) = sync_summary(&results);
        assert_eq!(state, JobState::Failed);
        assert_eq!(message, "synced 2 of 3 files, 1 errors");
    }
}
