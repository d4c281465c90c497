use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::debug;
use walkdir::WalkDir;

use super::{BackendError, ObjectInfo, ObjectStore, PresignMethod};
use crate::security::{self, Access, PathError};

/// Directory replica: every key is a file beneath `root`. Keys go through
/// the sandbox resolver so none can land outside it.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, BackendError> {
        let root = root.as_ref();
        if root.as_os_str().is_empty() {
            return Err(BackendError::Configuration("local_dir must be set".into()));
        }
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str, access: Access) -> Result<PathBuf, BackendError> {
        security::resolve(&self.root, key, access).map_err(|err| match err {
            PathError::NotFound(_) | PathError::NotAFile(_) => BackendError::NotFound(key.to_string()),
            PathError::Io { source, .. } => BackendError::Io(source),
            other => BackendError::Invalid(format!("key {key}: {other}")),
        })
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, body: &[u8], _content_type: &str) -> Result<(), BackendError> {
        let path = self.key_path(key, Access::Create)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| BackendError::Invalid(format!("key {key} has no file name")))?;
        let tmp = path.with_file_name(format!(".{file_name}.tmp"));
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &path).await?;
        debug!(key, path = %path.display(), "stored object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BackendError> {
        let path = self.key_path(key, Access::Read)?;
        Ok(fs::read(path).await?)
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let path = self.key_path(key, Access::Read)?;
        fs::remove_file(path).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        match self.key_path(key, Access::Read) {
            Ok(_) => Ok(true),
            Err(BackendError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, prefix: &str, max_keys: usize) -> Result<Vec<ObjectInfo>, BackendError> {
        let root = self.root.clone();
        let prefix = prefix.trim_start_matches('/').to_string();
        if max_keys == 0 {
            return Ok(Vec::new());
        }
        let listed = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for entry in WalkDir::new(&root).sort_by_file_name() {
                let entry = entry.map_err(|e| BackendError::Transport(e.to_string()))?;
                if !entry.file_type().is_file() || entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !key.starts_with(&prefix) {
                    continue;
                }
                let meta = entry
                    .metadata()
                    .map_err(|e| BackendError::Transport(e.to_string()))?;
                out.push(ObjectInfo {
                    key,
                    size: meta.len(),
                    modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
                });
                if out.len() >= max_keys {
                    break;
                }
            }
            Ok::<_, BackendError>(out)
        })
        .await
        .map_err(|e| BackendError::Transport(format!("listing task failed: {e}")))??;
        Ok(listed)
    }

    /// Metadata is not persisted by the directory replica.
    async fn copy(
        &self,
        from: &str,
        to: &str,
        _metadata: &BTreeMap<String, String>,
    ) -> Result<(), BackendError> {
        let source = self.key_path(from, Access::Read)?;
        let dest = self.key_path(to, Access::Create)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&source, &dest).await?;
        Ok(())
    }

    fn presign(&self, key: &str, _ttl: Duration, method: PresignMethod) -> Result<String, BackendError> {
        let access = match method {
            PresignMethod::Get => Access::Read,
            PresignMethod::Put => Access::Create,
        };
        let path = self.key_path(key, access)?;
        Url::from_file_path(&path)
            .map(String::from)
            .map_err(|_| BackendError::Invalid(format!("cannot express {} as a url", path.display())))
    }
}
