//! Resource directory scanning and per-file metadata.
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::config::Config;
use crate::model::{FileMetadata, FileRecord, ResourceType};
use crate::security::{self, Access, PathError};
use crate::storage::derive_storage_key;

const HASH_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct FileScanner {
    root: PathBuf,
    data_prefix: String,
    allowed_extensions: Vec<String>,
}

impl FileScanner {
    pub fn new(root: impl Into<PathBuf>, data_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            data_prefix: data_prefix.into(),
            allowed_extensions: Vec::new(),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.media_root(), cfg.app.data_prefix.clone())
            .with_extensions(cfg.security.allowed_extensions.clone())
    }

    /// Restrict scans to these extensions. Empty means no restriction.
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.allowed_extensions = extensions;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_prefix(&self) -> &str {
        &self.data_prefix
    }

    /// First existing directory among the type's candidate names.
    pub fn resource_dir(&self, resource_type: ResourceType) -> Option<PathBuf> {
        resource_type
            .directory_candidates()
            .iter()
            .map(|name| self.root.join(name))
            .find(|p| p.is_dir())
    }

    /// Directory name in use for this deployment, or the canonical one when
    /// none exists yet.
    pub fn resource_dir_name(&self, resource_type: ResourceType) -> &'static str {
        let candidates = resource_type.directory_candidates();
        candidates
            .iter()
            .copied()
            .find(|name| self.root.join(name).is_dir())
            .unwrap_or(candidates[0])
    }

    /// List every file of a resource type, sorted by lowercase name then
    /// relative path. Unreadable entries are skipped with a warning.
    pub fn scan(&self, resource_type: ResourceType) -> Vec<FileRecord> {
        let root = match self.root.canonicalize() {
            Ok(r) => r,
            Err(err) => {
                warn!(root = %self.root.display(), error = %err, "media root unavailable");
                return Vec::new();
            }
        };
        let Some(dir) = resource_type
            .directory_candidates()
            .iter()
            .map(|name| root.join(name))
            .find(|p| p.is_dir())
        else {
            debug!(%resource_type, "resource directory missing");
            return Vec::new();
        };

        let mut records = Vec::new();
        if resource_type.is_recursive() {
            self.collect(&root, &dir, &dir, resource_type, usize::MAX, None, &mut records);
        } else {
            self.collect(&root, &dir, &dir, resource_type, 1, None, &mut records);
            for sub in resource_type.subdirectories() {
                let subdir = dir.join(sub);
                if subdir.is_dir() {
                    self.collect(&root, &dir, &subdir, resource_type, 1, Some(sub), &mut records);
                }
            }
        }

        records.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.relative_path.cmp(&b.relative_path))
        });
        debug!(%resource_type, files = records.len(), "scan complete");
        records
    }

    #[allow(clippy::too_many_arguments)]
    fn collect(
        &self,
        root: &Path,
        resource_dir: &Path,
        base: &Path,
        resource_type: ResourceType,
        max_depth: usize,
        subdirectory: Option<&str>,
        out: &mut Vec<FileRecord>,
    ) {
        let excluded = resource_type.index_file_names();
        let walker = WalkDir::new(base)
            .min_depth(1)
            .max_depth(max_depth)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !is_hidden(e));

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    warn!(%resource_type, error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if excluded.iter().any(|x| x == &name) {
                continue;
            }
            if let Err(err) = security::validate_extension(&name, &self.allowed_extensions) {
                debug!(file = %name, reason = %err, "extension filtered");
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(err) => {
                    warn!(file = %entry.path().display(), error = %err, "skipping unreadable file");
                    continue;
                }
            };

            let Some(beneath) = slash_path(entry.path(), resource_dir) else {
                continue;
            };
            let Some(relative_path) = slash_path(entry.path(), root) else {
                continue;
            };
            let subdirectory = match subdirectory {
                Some(s) => Some(s.to_string()),
                None => beneath.rsplit_once('/').map(|(parent, _)| parent.to_string()),
            };
            let extension = name
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_ascii_lowercase())
                .unwrap_or_default();

            out.push(FileRecord {
                absolute_path: entry.path().to_path_buf(),
                relative_path,
                storage_key: derive_storage_key(&self.data_prefix, resource_type, &beneath),
                name,
                size_bytes: meta.len(),
                modified_at: meta.modified().ok().map(DateTime::<Utc>::from).unwrap_or_default(),
                extension,
                resource_type,
                subdirectory,
            });
        }
    }

    /// Size, mtime and streaming SHA-256 of a file under the media root. A
    /// missing file yields `exists == false` instead of an error.
    pub fn compute_metadata(&self, relative_path: &str) -> Result<FileMetadata, PathError> {
        let path = match security::resolve(&self.root, relative_path, Access::Read) {
            Ok(p) => p,
            Err(PathError::NotFound(_)) => return Ok(FileMetadata::default()),
            Err(err) => return Err(err),
        };
        let io_err = |source: io::Error| PathError::Io {
            path: relative_path.to_string(),
            source,
        };
        let meta = std::fs::metadata(&path).map_err(io_err)?;
        let content_hash = hash_file(&path).map_err(io_err)?;
        Ok(FileMetadata {
            exists: true,
            size: meta.len(),
            modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
            content_hash: Some(content_hash),
        })
    }

    /// Classify by the first segment beneath the media root.
    pub fn infer_resource_type(&self, path: &Path) -> ResourceType {
        let relative = if path.is_absolute() {
            let canonical_root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
            path.strip_prefix(&canonical_root)
                .or_else(|_| path.strip_prefix(&self.root))
                .unwrap_or(path)
        } else {
            path
        };
        relative
            .components()
            .find_map(|c| match c {
                Component::Normal(s) => Some(ResourceType::from_segment(&s.to_string_lossy())),
                _ => None,
            })
            .unwrap_or(ResourceType::Project)
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

fn slash_path(path: &Path, base: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let parts: Vec<_> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Hex SHA-256 of a file, read in fixed-size chunks.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
