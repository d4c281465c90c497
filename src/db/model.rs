//! Row models returned by the job repository.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::model::{Job, JobKind, JobProgress, JobState};

/// One `jobs` row. Timestamps are RFC 3339 text.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub kind: String,
    pub state: String,
    pub progress_current: i64,
    pub progress_total: i64,
    pub progress_section: Option<String>,
    pub progress_file: Option<String>,
    pub message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl JobRow {
    pub fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            state: row.try_get("state")?,
            progress_current: row.try_get("progress_current")?,
            progress_total: row.try_get("progress_total")?,
            progress_section: row.try_get("progress_section")?,
            progress_file: row.try_get("progress_file")?,
            message: row.try_get("message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub fn from_job(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            kind: job.kind.as_str().to_string(),
            state: job.state.as_str().to_string(),
            progress_current: job.progress.current as i64,
            progress_total: job.progress.total as i64,
            progress_section: job.progress.section.clone(),
            progress_file: job.progress.file.clone(),
            message: job.message.clone(),
            created_at: job.created_at.to_rfc3339(),
            updated_at: job.updated_at.to_rfc3339(),
        }
    }

    pub fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id.parse().with_context(|| format!("bad job id {}", self.id))?,
            kind: JobKind::parse_kind(&self.kind).ok_or_else(|| anyhow!("unknown job kind {}", self.kind))?,
            state: JobState::parse_state(&self.state)
                .ok_or_else(|| anyhow!("unknown job state {}", self.state))?,
            progress: JobProgress {
                current: self.progress_current.max(0) as usize,
                total: self.progress_total.max(0) as usize,
                section: self.progress_section,
                file: self.progress_file,
            },
            message: self.message,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp {s}"))?
        .with_timezone(&Utc))
}
