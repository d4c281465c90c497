use super::model::JobRow;
use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::instrument;
use uuid::Uuid;

use crate::model::Job;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let in_memory = normalized.starts_with("sqlite::memory");
    let mut options = SqliteConnectOptions::from_str(&normalized)?.create_if_missing(true);
    if !in_memory {
        options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
    }
    // Every in-memory connection is its own database, so keep exactly one alive.
    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new()
    };
    Ok(pool_options.connect_with(options).await?)
}

/// Expand a leading `~/` in a file-backed SQLite URL and make sure the parent
/// directory exists. In-memory and non-sqlite URLs are returned untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }

    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded}");
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn insert_job(pool: &Pool, job: &Job) -> Result<()> {
    let row = JobRow::from_job(job);
    sqlx::query(
        "INSERT INTO jobs (id, kind, state, progress_current, progress_total, progress_section, \
         progress_file, message, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&row.id)
    .bind(&row.kind)
    .bind(&row.state)
    .bind(row.progress_current)
    .bind(row.progress_total)
    .bind(&row.progress_section)
    .bind(&row.progress_file)
    .bind(&row.message)
    .bind(&row.created_at)
    .bind(&row.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn fetch_job(pool: &Pool, id: Uuid) -> Result<Option<Job>> {
    let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;
    row.map(|r| JobRow::from_row(&r)?.into_job()).transpose()
}

/// Returns false when no row has `job.id`.
#[instrument(skip_all)]
pub async fn update_job(pool: &Pool, job: &Job) -> Result<bool> {
    let row = JobRow::from_job(job);
    let res = sqlx::query(
        "UPDATE jobs SET state = ?, progress_current = ?, progress_total = ?, progress_section = ?, \
         progress_file = ?, message = ?, updated_at = ? WHERE id = ?",
    )
    .bind(&row.state)
    .bind(row.progress_current)
    .bind(row.progress_total)
    .bind(&row.progress_section)
    .bind(&row.progress_file)
    .bind(&row.message)
    .bind(&row.updated_at)
    .bind(&row.id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn delete_job(pool: &Pool, id: Uuid) -> Result<bool> {
    let res = sqlx::query("DELETE FROM jobs WHERE id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn list_jobs(pool: &Pool) -> Result<Vec<Job>> {
    let rows = sqlx::query("SELECT * FROM jobs ORDER BY created_at, id")
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|r| JobRow::from_row(r)?.into_job())
        .collect()
}
