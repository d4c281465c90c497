//! Derived per-resource-type index documents.
//!
//! Each generation rebuilds the document from the filesystem and atomically
//! replaces `index.json`; nothing is patched incrementally, so entries for
//! deleted source files cannot survive a regeneration.
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::model::{FileRecord, ResourceType};
use crate::scanner::FileScanner;
use crate::security::{self, Access, PathError};

pub mod extract;

pub use extract::{extractor_for, IndexExtractor, IndexKey, ItemSummary};

pub const INDEX_VERSION: &str = "2.0";
pub const INDEX_FILE: &str = "index.json";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("failed to write index {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize index: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("index worker failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SecondaryIndex {
    Grouped(BTreeMap<String, Vec<String>>),
    Unique(BTreeMap<String, String>),
}

impl SecondaryIndex {
    fn referenced_ids(&self) -> Vec<&str> {
        match self {
            SecondaryIndex::Grouped(map) => map.values().flatten().map(String::as_str).collect(),
            SecondaryIndex::Unique(map) => map.values().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    pub resource_type: ResourceType,
    pub version: String,
    pub last_updated: DateTime<Utc>,
    pub items: Vec<ItemSummary>,
    pub indexes: BTreeMap<String, SecondaryIndex>,
    pub statistics: BTreeMap<String, Value>,
}

impl IndexDocument {
    pub fn total(&self) -> usize {
        self.items.len()
    }

    /// `total == len(items)` holds by construction; this checks that every
    /// secondary-index entry points at a listed item.
    pub fn is_consistent(&self) -> bool {
        let ids: BTreeSet<&str> = self.items.iter().map(|i| i.id.as_str()).collect();
        ids.len() == self.items.len()
            && self
                .indexes
                .values()
                .flat_map(SecondaryIndex::referenced_ids)
                .all(|id| ids.contains(id))
    }

    /// On-disk shape; the items list is keyed by the resource type name.
    pub fn to_json(&self) -> Value {
        let items: Vec<Value> = self
            .items
            .iter()
            .map(|i| Value::Object(i.fields.clone()))
            .collect();
        let mut doc = Map::new();
        doc.insert("version".into(), json!(self.version));
        doc.insert("last_updated".into(), json!(self.last_updated.to_rfc3339()));
        doc.insert("total".into(), json!(self.total()));
        doc.insert(self.resource_type.as_str().into(), Value::Array(items));
        doc.insert("indexes".into(), json!(self.indexes));
        doc.insert("statistics".into(), json!(self.statistics));
        Value::Object(doc)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SkippedFile {
    pub file: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct GeneratedIndex {
    pub document: IndexDocument,
    pub path: PathBuf,
    pub skipped: Vec<SkippedFile>,
}

#[derive(Debug)]
pub struct GenerateAllReport {
    pub results: BTreeMap<ResourceType, Result<GeneratedIndex, IndexError>>,
    pub success: bool,
}

impl GenerateAllReport {
    pub fn summary(&self) -> Value {
        let mut out = Map::new();
        for (rt, res) in &self.results {
            let entry = match res {
                Ok(g) => json!({
                    "ok": true,
                    "total": g.document.total(),
                    "path": g.path.display().to_string(),
                    "skipped": g.skipped,
                }),
                Err(e) => json!({ "ok": false, "error": e.to_string() }),
            };
            out.insert(rt.as_str().into(), entry);
        }
        json!({ "success": self.success, "results": out })
    }
}

#[derive(Debug, Clone)]
pub struct IndexGenerator {
    scanner: Arc<FileScanner>,
    max_file_size: u64,
}

impl IndexGenerator {
    pub fn new(scanner: Arc<FileScanner>, max_file_size: u64) -> Self {
        Self {
            scanner,
            max_file_size,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(Arc::new(FileScanner::from_config(cfg)), cfg.security.max_file_size_bytes)
    }

    /// Build the document from the current files without writing it.
    /// Malformed or oversized files are skipped and reported.
    pub fn build(&self, resource_type: ResourceType) -> (IndexDocument, Vec<SkippedFile>) {
        let extractor = extractor_for(resource_type);
        let records = self.scanner.scan(resource_type);

        let mut items: Vec<ItemSummary> = Vec::with_capacity(records.len());
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut grouped: BTreeMap<&'static str, BTreeMap<String, Vec<String>>> = BTreeMap::new();
        let mut unique: BTreeMap<&'static str, BTreeMap<String, String>> = BTreeMap::new();
        let mut skipped = Vec::new();
        let mut total_bytes = 0u64;

        for record in &records {
            let extraction = match self.load(record) {
                Ok(doc) => extractor.extract(record, &doc).map_err(|e| e.to_string()),
                Err(reason) => Err(reason),
            };
            let extraction = match extraction {
                Ok(x) => x,
                Err(reason) => {
                    warn!(%resource_type, file = %record.relative_path, %reason, "skipping document");
                    skipped.push(SkippedFile {
                        file: record.relative_path.clone(),
                        reason,
                    });
                    continue;
                }
            };
            if !seen.insert(extraction.item.id.clone()) {
                let reason = format!("duplicate id {}", extraction.item.id);
                warn!(%resource_type, file = %record.relative_path, %reason, "skipping document");
                skipped.push(SkippedFile {
                    file: record.relative_path.clone(),
                    reason,
                });
                continue;
            }

            let id = extraction.item.id.clone();
            for key in extraction.keys {
                if key.unique {
                    unique
                        .entry(key.index)
                        .or_default()
                        .entry(key.key)
                        .or_insert_with(|| id.clone());
                } else {
                    grouped
                        .entry(key.index)
                        .or_default()
                        .entry(key.key)
                        .or_default()
                        .push(id.clone());
                }
            }
            total_bytes += record.size_bytes;
            items.push(extraction.item);
        }

        let mut statistics = BTreeMap::new();
        statistics.insert("total".to_string(), json!(items.len()));
        statistics.insert("total_bytes".to_string(), json!(total_bytes));
        statistics.insert("skipped".to_string(), json!(skipped.len()));
        for (name, groups) in &grouped {
            let counts: BTreeMap<&str, usize> =
                groups.iter().map(|(k, ids)| (k.as_str(), ids.len())).collect();
            statistics.insert((*name).to_string(), json!(counts));
        }

        let mut indexes: BTreeMap<String, SecondaryIndex> = grouped
            .into_iter()
            .map(|(name, map)| (name.to_string(), SecondaryIndex::Grouped(map)))
            .collect();
        indexes.extend(
            unique
                .into_iter()
                .map(|(name, map)| (name.to_string(), SecondaryIndex::Unique(map))),
        );

        let document = IndexDocument {
            resource_type,
            version: INDEX_VERSION.to_string(),
            last_updated: Utc::now(),
            items,
            indexes,
            statistics,
        };
        (document, skipped)
    }

    fn load(&self, record: &FileRecord) -> Result<Map<String, Value>, String> {
        security::validate_size(record.size_bytes, self.max_file_size).map_err(|e| e.to_string())?;
        let path = security::resolve(self.scanner.root(), &record.relative_path, Access::Read)
            .map_err(|e| e.to_string())?;
        let raw = fs::read_to_string(&path).map_err(|e| format!("read failed: {e}"))?;
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err("document is not a JSON object".to_string()),
            Err(e) => Err(format!("malformed JSON: {e}")),
        }
    }

    /// Rebuild and atomically replace the index for one resource type.
    #[instrument(skip(self))]
    pub fn generate_index(&self, resource_type: ResourceType) -> Result<GeneratedIndex, IndexError> {
        let (document, skipped) = self.build(resource_type);
        let path = self.write_index(&document)?;
        info!(
            %resource_type,
            total = document.total(),
            skipped = skipped.len(),
            path = %path.display(),
            "index generated"
        );
        Ok(GeneratedIndex {
            document,
            path,
            skipped,
        })
    }

    fn write_index(&self, document: &IndexDocument) -> Result<PathBuf, IndexError> {
        let dir_name = self.scanner.resource_dir_name(document.resource_type);
        let path = security::resolve(
            self.scanner.root(),
            &format!("{dir_name}/{INDEX_FILE}"),
            Access::Create,
        )?;
        let write_err = |source: io::Error| IndexError::Write {
            path: path.display().to_string(),
            source,
        };
        let parent = path
            .parent()
            .ok_or_else(|| write_err(io::Error::new(io::ErrorKind::Other, "index has no parent")))?;
        fs::create_dir_all(parent).map_err(write_err)?;

        let body = serde_json::to_vec_pretty(&document.to_json())?;
        let tmp = parent.join(format!(".{INDEX_FILE}.tmp"));
        fs::write(&tmp, body).map_err(write_err)?;
        fs::rename(&tmp, &path).map_err(write_err)?;
        debug!(path = %path.display(), "index replaced");
        Ok(path)
    }

    /// Regenerate the default indexed types.
    pub async fn generate_all(&self, parallel: bool, max_workers: usize) -> GenerateAllReport {
        self.generate_types(&ResourceType::INDEXED, parallel, max_workers)
            .await
    }

    /// Regenerate `types`, at most `max_workers` at a time when `parallel`.
    /// Generators share no state, so no locking is needed between them.
    #[instrument(skip(self))]
    pub async fn generate_types(
        &self,
        types: &[ResourceType],
        parallel: bool,
        max_workers: usize,
    ) -> GenerateAllReport {
        let workers = if parallel { max_workers.max(1) } else { 1 };
        let results: BTreeMap<_, _> = stream::iter(types.iter().copied())
            .map(|rt| {
                let generator = self.clone();
                async move {
                    let res = tokio::task::spawn_blocking(move || generator.generate_index(rt))
                        .await
                        .map_err(|e| IndexError::Task(e.to_string()))
                        .and_then(|r| r);
                    (rt, res)
                }
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let success = results.values().all(Result::is_ok);
        if !success {
            for (rt, res) in &results {
                if let Err(err) = res {
                    warn!(resource_type = %rt, error = %err, "index generation failed");
                }
            }
        }
        GenerateAllReport { results, success }
    }
}
