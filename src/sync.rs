//! Push resource files to the object store with per-file failure accounting.
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::model::{ErrorDetail, FileRecord, ResourceType, SyncResult, SyncedFile};
use crate::scanner::FileScanner;
use crate::security::{self, Access};
use crate::storage::StorageClient;

/// Progress for one file, reported before its upload. Indexes are 1-based;
/// `global_*` spans every resource type of a `sync_all` batch.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SyncProgress {
    pub global_index: usize,
    pub global_total: usize,
    pub section: ResourceType,
    pub section_index: usize,
    pub section_total: usize,
    pub file_name: String,
}

pub type ProgressFn<'a> = &'a (dyn Fn(&SyncProgress) + Sync);

/// Validates and normalizes a parsed document before upload.
pub trait DocumentValidator: Send + Sync {
    fn validate(
        &self,
        resource_type: ResourceType,
        record: &FileRecord,
        doc: Map<String, Value>,
    ) -> Result<Map<String, Value>>;
}

/// Default validator: n8n workflows always carry `workflow_id`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Normalizer;

impl DocumentValidator for Normalizer {
    fn validate(
        &self,
        resource_type: ResourceType,
        record: &FileRecord,
        mut doc: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        if resource_type == ResourceType::N8n && !doc.contains_key("workflow_id") {
            let id = match doc.get("id") {
                Some(Value::String(s)) if !s.is_empty() => Value::String(s.clone()),
                Some(Value::Number(n)) => Value::String(n.to_string()),
                _ => Value::String(record.stem().to_string()),
            };
            doc.insert("workflow_id".into(), id);
        }
        Ok(doc)
    }
}

/// Pretty-printed, newline-terminated JSON. Object keys come out sorted
/// because `Map` is ordered; numbers keep their source digits.
pub fn canonical_json(value: &Value) -> serde_json::Result<Vec<u8>> {
    let mut out = serde_json::to_vec_pretty(value)?;
    out.push(b'\n');
    Ok(out)
}

fn content_type(extension: &str) -> &'static str {
    match extension {
        "json" => "application/json",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "md" => "text/markdown",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

#[derive(Clone)]
pub struct SyncEngine {
    scanner: Arc<FileScanner>,
    storage: StorageClient,
    validator: Arc<dyn DocumentValidator>,
    max_file_size: u64,
    max_error_details: usize,
}

impl SyncEngine {
    pub fn new(scanner: Arc<FileScanner>, storage: StorageClient) -> Self {
        Self {
            scanner,
            storage,
            validator: Arc::new(Normalizer),
            max_file_size: 10 * 1024 * 1024,
            max_error_details: 100,
        }
    }

    pub fn from_config(cfg: &Config, storage: StorageClient) -> Self {
        Self::new(Arc::new(FileScanner::from_config(cfg)), storage)
            .with_limits(cfg.security.max_file_size_bytes, cfg.app.max_error_details)
    }

    pub fn with_validator(mut self, validator: Arc<dyn DocumentValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_limits(mut self, max_file_size: u64, max_error_details: usize) -> Self {
        self.max_file_size = max_file_size;
        self.max_error_details = max_error_details;
        self
    }

    pub fn scanner(&self) -> &FileScanner {
        &self.scanner
    }

    fn records_for(&self, resource_type: ResourceType) -> Vec<FileRecord> {
        if !resource_type.is_synced() {
            debug!(%resource_type, "resource type is never synced");
            return Vec::new();
        }
        self.scanner.scan(resource_type)
    }

    /// Sync one resource type. In dry-run mode nothing is read or uploaded and
    /// every file is projected as synced.
    #[instrument(skip(self, progress))]
    pub async fn sync_resource_type(
        &self,
        resource_type: ResourceType,
        dry_run: bool,
        progress: Option<ProgressFn<'_>>,
    ) -> SyncResult {
        let records = self.records_for(resource_type);
        let total = records.len();
        self.sync_records(resource_type, &records, dry_run, progress, 0, total)
            .await
    }

    /// Sync every resource type in turn so the global progress index only
    /// ever increases.
    #[instrument(skip(self, progress))]
    pub async fn sync_all(
        &self,
        dry_run: bool,
        progress: Option<ProgressFn<'_>>,
    ) -> BTreeMap<ResourceType, SyncResult> {
        let batches: Vec<(ResourceType, Vec<FileRecord>)> = ResourceType::ALL
            .into_iter()
            .map(|rt| (rt, self.records_for(rt)))
            .collect();
        let global_total = batches.iter().map(|(_, r)| r.len()).sum();

        let mut results = BTreeMap::new();
        let mut offset = 0;
        for (rt, records) in batches {
            let result = self
                .sync_records(rt, &records, dry_run, progress, offset, global_total)
                .await;
            offset += records.len();
            results.insert(rt, result);
        }
        results
    }

    async fn sync_records(
        &self,
        resource_type: ResourceType,
        records: &[FileRecord],
        dry_run: bool,
        progress: Option<ProgressFn<'_>>,
        offset: usize,
        global_total: usize,
    ) -> SyncResult {
        let mut result = SyncResult::empty(resource_type, dry_run);
        result.total_files = records.len();

        for (i, record) in records.iter().enumerate() {
            if let Some(callback) = progress {
                report(
                    callback,
                    &SyncProgress {
                        global_index: offset + i + 1,
                        global_total,
                        section: resource_type,
                        section_index: i + 1,
                        section_total: records.len(),
                        file_name: record.name.clone(),
                    },
                );
            }

            let outcome = if dry_run {
                Ok(())
            } else {
                self.upload(resource_type, record).await
            };
            match outcome {
                Ok(()) => {
                    result.synced_count += 1;
                    result.success_files.push(SyncedFile {
                        file: record.relative_path.clone(),
                        storage_key: record.storage_key.clone(),
                    });
                }
                Err(err) => {
                    result.error_count += 1;
                    let detail = format!("{err:#}");
                    warn!(
                        %resource_type,
                        file = %record.relative_path,
                        error = %detail,
                        "file sync failed"
                    );
                    if result.error_details.len() < self.max_error_details {
                        result.error_details.push(ErrorDetail {
                            file: record.relative_path.clone(),
                            error: detail,
                        });
                    }
                }
            }
        }

        info!(
            %resource_type,
            dry_run,
            total = result.total_files,
            synced = result.synced_count,
            errors = result.error_count,
            "resource type synced"
        );
        result
    }

    async fn upload(&self, resource_type: ResourceType, record: &FileRecord) -> Result<()> {
        security::validate_size(record.size_bytes, self.max_file_size)?;
        let path = security::resolve(self.scanner.root(), &record.relative_path, Access::Read)?;
        let raw = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", record.relative_path))?;
        // Size may have changed since the scan.
        security::validate_size(raw.len() as u64, self.max_file_size)?;

        let body = if record.extension == "json" {
            let doc = match serde_json::from_slice::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                Ok(_) => bail!("document is not a JSON object"),
                Err(e) => return Err(anyhow!("malformed JSON: {e}")),
            };
            let doc = self
                .validator
                .validate(resource_type, record, doc)
                .context("document validation failed")?;
            canonical_json(&Value::Object(doc))?
        } else {
            raw
        };

        self.storage
            .put(&record.storage_key, &body, content_type(&record.extension))
            .await?;
        Ok(())
    }
}

/// A panicking callback must never abort the sync.
fn report(callback: ProgressFn<'_>, progress: &SyncProgress) {
    if panic::catch_unwind(AssertUnwindSafe(|| callback(progress))).is_err() {
        warn!(file = %progress.file_name, "progress callback panicked; ignoring");
    }
}
