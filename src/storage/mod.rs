//! Object-store contract, retrying client and storage-key derivation.
//!
//! Backends implement [`ObjectStore`] and report raw [`BackendError`]s.
//! [`StorageClient`] wraps any backend with retry policies and maps failures
//! onto the operation-level [`StorageError`] taxonomy.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{self, Backend, Config};
use crate::model::ResourceType;
use crate::retry::{self, RetryPolicy};

pub mod http;
pub mod local;

pub use http::HttpObjectStore;
pub use local::LocalObjectStore;

/// Raw failure reported by a backend for a single request.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },
    #[error("request rejected {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("storage configuration error: {0}")]
    Configuration(String),
}

impl BackendError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            BackendError::Server { status, .. } | BackendError::Rejected { status, .. } => {
                Some(*status)
            }
            BackendError::NotFound(_) => Some(404),
            _ => None,
        }
    }

    /// Connection, timeout and DNS-class failures.
    pub fn is_network(&self) -> bool {
        matches!(self, BackendError::Network(_))
    }

    /// 5xx responses, plus 429 throttling.
    pub fn is_server_error(&self) -> bool {
        matches!(self.status_code(), Some(s) if s >= 500 || s == 429)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }
}

/// Operation-level failures surfaced to callers after retries.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("upload of {key} failed after {attempts} attempt(s): {source}")]
    UploadFailed {
        key: String,
        attempts: u32,
        source: BackendError,
    },
    #[error("object not found: {key}")]
    NotFound { key: String },
    #[error("download of {key} failed after {attempts} attempt(s): {source}")]
    DownloadFailed {
        key: String,
        attempts: u32,
        source: BackendError,
    },
    #[error("delete of {key} failed after {attempts} attempt(s): {source}")]
    DeleteFailed {
        key: String,
        attempts: u32,
        source: BackendError,
    },
    #[error("copy {from} -> {to} failed after {attempts} attempt(s): {source}")]
    CopyFailed {
        from: String,
        to: String,
        attempts: u32,
        source: BackendError,
    },
    #[error("request for {key} failed after {attempts} attempt(s): {source}")]
    RequestFailed {
        key: String,
        attempts: u32,
        source: BackendError,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    #[serde(default, alias = "last_modified")]
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PresignMethod {
    Get,
    Put,
}

impl PresignMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresignMethod::Get => "GET",
            PresignMethod::Put => "PUT",
        }
    }
}

/// A remote key/value blob store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: &[u8], content_type: &str) -> Result<(), BackendError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, BackendError>;

    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    async fn exists(&self, key: &str) -> Result<bool, BackendError>;

    async fn list(&self, prefix: &str, max_keys: usize) -> Result<Vec<ObjectInfo>, BackendError>;

    async fn copy(
        &self,
        from: &str,
        to: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), BackendError>;

    fn presign(&self, key: &str, ttl: Duration, method: PresignMethod)
        -> Result<String, BackendError>;
}

impl RetryPolicy<BackendError> {
    /// Retry connection/timeout/DNS-class failures only.
    pub fn network_errors(self) -> Self {
        self.with_predicate(BackendError::is_network)
    }

    /// Retry 5xx-class responses only.
    pub fn server_errors(self) -> Self {
        self.with_predicate(BackendError::is_server_error)
    }

    /// Retry either class.
    pub fn transient_errors(self) -> Self {
        self.with_predicate(|e: &BackendError| e.is_network() || e.is_server_error())
    }
}

/// Retrying facade over an [`ObjectStore`].
#[derive(Clone)]
pub struct StorageClient {
    backend: Arc<dyn ObjectStore>,
    reads: RetryPolicy<BackendError>,
    writes: RetryPolicy<BackendError>,
}

impl fmt::Debug for StorageClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageClient")
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .finish_non_exhaustive()
    }
}

impl StorageClient {
    /// Reads use the network-error policy; writes also retry server errors.
    pub fn new(backend: Arc<dyn ObjectStore>, settings: &config::Retry) -> Self {
        let base = RetryPolicy::from_config(settings);
        Self::with_policies(backend, base.clone().network_errors(), base.transient_errors())
    }

    pub fn with_policies(
        backend: Arc<dyn ObjectStore>,
        reads: RetryPolicy<BackendError>,
        writes: RetryPolicy<BackendError>,
    ) -> Self {
        Self {
            backend,
            reads,
            writes,
        }
    }

    pub async fn put(&self, key: &str, body: &[u8], content_type: &str) -> Result<(), StorageError> {
        retry::execute(&self.writes, "put", || self.backend.put(key, body, content_type))
            .await
            .map_err(|e| StorageError::UploadFailed {
                key: key.to_string(),
                attempts: e.attempts,
                source: e.source,
            })?;
        debug!(key, bytes = body.len(), "object uploaded");
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        retry::execute(&self.reads, "get", || self.backend.get(key))
            .await
            .map_err(|e| {
                if e.source.is_not_found() {
                    StorageError::NotFound {
                        key: key.to_string(),
                    }
                } else {
                    StorageError::DownloadFailed {
                        key: key.to_string(),
                        attempts: e.attempts,
                        source: e.source,
                    }
                }
            })
    }

    /// Deleting a missing key succeeds.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match retry::execute(&self.reads, "delete", || self.backend.delete(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.source.is_not_found() => {
                debug!(key, "delete of missing object treated as success");
                Ok(())
            }
            Err(e) => Err(StorageError::DeleteFailed {
                key: key.to_string(),
                attempts: e.attempts,
                source: e.source,
            }),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match retry::execute(&self.reads, "exists", || self.backend.exists(key)).await {
            Ok(found) => Ok(found),
            Err(e) if e.source.is_not_found() => Ok(false),
            Err(e) => Err(StorageError::RequestFailed {
                key: key.to_string(),
                attempts: e.attempts,
                source: e.source,
            }),
        }
    }

    /// Not retried. Any failure degrades to an empty listing.
    pub async fn list_by_prefix(&self, prefix: &str, max_keys: usize) -> Vec<ObjectInfo> {
        match self.backend.list(prefix, max_keys).await {
            Ok(objects) => objects,
            Err(err) => {
                warn!(prefix, error = %err, "listing failed; returning no objects");
                Vec::new()
            }
        }
    }

    pub async fn copy(
        &self,
        from: &str,
        to: &str,
        metadata: Option<&BTreeMap<String, String>>,
    ) -> Result<(), StorageError> {
        let empty = BTreeMap::new();
        let metadata = metadata.unwrap_or(&empty);
        retry::execute(&self.writes, "copy", || self.backend.copy(from, to, metadata))
            .await
            .map_err(|e| StorageError::CopyFailed {
                from: from.to_string(),
                to: to.to_string(),
                attempts: e.attempts,
                source: e.source,
            })
    }

    /// `None` on any failure; never errors.
    pub fn presigned_url(&self, key: &str, ttl_seconds: u64, method: PresignMethod) -> Option<String> {
        match self
            .backend
            .presign(key, Duration::from_secs(ttl_seconds), method)
        {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(key, error = %err, "failed to presign url");
                None
            }
        }
    }
}

/// `{data_prefix}/{resource_type}/{path}` with separators normalized to `/`.
/// Pure; identical inputs always yield identical keys.
pub fn derive_storage_key(data_prefix: &str, resource_type: ResourceType, path: &str) -> String {
    let prefix = data_prefix.trim_matches('/');
    let suffix = path
        .split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/");
    if prefix.is_empty() {
        format!("{}/{}", resource_type.as_str(), suffix)
    } else {
        format!("{}/{}/{}", prefix, resource_type.as_str(), suffix)
    }
}

/// Build the configured backend. Missing settings fail immediately.
pub fn connect(cfg: &Config) -> Result<Arc<dyn ObjectStore>, BackendError> {
    let timeout = Duration::from_secs(cfg.storage.timeout_seconds);
    match cfg.storage.backend {
        Backend::Http => Ok(Arc::new(HttpObjectStore::new(
            &cfg.storage.endpoint,
            &cfg.storage.bucket,
            &cfg.storage.token,
            timeout,
        )?)),
        Backend::Local => Ok(Arc::new(LocalObjectStore::new(&cfg.storage.local_dir)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[test]
    fn storage_key_preserves_nesting() {
        assert_eq!(
            derive_storage_key("data", ResourceType::Relationships, "by-page/x.json"),
            "data/relationships/by-page/x.json"
        );
        assert_eq!(
            derive_storage_key("/data/", ResourceType::Pages, "a.json"),
            "data/pages/a.json"
        );
        assert_eq!(derive_storage_key("", ResourceType::N8n, "w.json"), "n8n/w.json");
        assert_eq!(
            derive_storage_key("data", ResourceType::Postman, "collection\\c.postman_collection.json"),
            "data/postman/collection/c.postman_collection.json"
        );
    }

    #[test]
    fn storage_key_is_deterministic_and_collision_free() {
        let a = derive_storage_key("data", ResourceType::Pages, "a.json");
        assert_eq!(a, derive_storage_key("data", ResourceType::Pages, "a.json"));
        assert_ne!(a, derive_storage_key("data", ResourceType::Endpoints, "a.json"));
        assert_ne!(a, derive_storage_key("data", ResourceType::Pages, "sub/a.json"));
    }

    /// Backend that replays scripted results and counts calls.
    #[derive(Default)]
    struct ScriptedStore {
        results: Mutex<VecDeque<Result<(), BackendError>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedStore {
        fn with(results: Vec<Result<(), BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                calls: Mutex::new(0),
            })
        }

        fn next(&self) -> Result<(), BackendError> {
            *self.calls.lock().unwrap() += 1;
            self.results.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ObjectStore for ScriptedStore {
        async fn put(&self, _key: &str, _body: &[u8], _ct: &str) -> Result<(), BackendError> {
            self.next()
        }
        async fn get(&self, _key: &str) -> Result<Vec<u8>, BackendError> {
            self.next().map(|_| b"{}".to_vec())
        }
        async fn delete(&self, _key: &str) -> Result<(), BackendError> {
            self.next()
        }
        async fn exists(&self, _key: &str) -> Result<bool, BackendError> {
            self.next().map(|_| true)
        }
        async fn list(&self, _prefix: &str, _max: usize) -> Result<Vec<ObjectInfo>, BackendError> {
            self.next().map(|_| Vec::new())
        }
        async fn copy(
            &self,
            _from: &str,
            _to: &str,
            _m: &BTreeMap<String, String>,
        ) -> Result<(), BackendError> {
            self.next()
        }
        fn presign(&self, key: &str, _ttl: Duration, _m: PresignMethod) -> Result<String, BackendError> {
            if key.is_empty() {
                Err(BackendError::Invalid("empty key".into()))
            } else {
                Ok(format!("https://signed/{key}"))
            }
        }
    }

    fn client(store: Arc<ScriptedStore>) -> StorageClient {
        let base = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
        StorageClient::with_policies(store, base.clone().network_errors(), base.transient_errors())
    }

    fn net() -> BackendError {
        BackendError::Network("connection refused".into())
    }

    fn server() -> BackendError {
        BackendError::Server {
            status: 503,
            body: "busy".into(),
        }
    }

    #[tokio::test]
    async fn put_retries_network_then_succeeds() {
        let store = ScriptedStore::with(vec![Err(net()), Err(server()), Ok(())]);
        client(store.clone()).put("k", b"{}", "application/json").await.unwrap();
        assert_eq!(store.calls(), 3);
    }

    #[tokio::test]
    async fn put_reports_attempts_when_exhausted() {
        let store = ScriptedStore::with(vec![Err(net()), Err(net()), Err(net()), Ok(())]);
        let err = client(store.clone())
            .put("k", b"{}", "application/json")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UploadFailed { attempts: 3, .. }));
        assert_eq!(store.calls(), 3);
    }

    #[tokio::test]
    async fn reads_do_not_retry_server_errors() {
        let store = ScriptedStore::with(vec![Err(server()), Ok(())]);
        let err = client(store.clone()).get("k").await.unwrap_err();
        assert!(matches!(err, StorageError::DownloadFailed { attempts: 1, .. }));
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn get_maps_not_found() {
        let store = ScriptedStore::with(vec![Err(BackendError::NotFound("k".into()))]);
        let err = client(store).get("k").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_missing_is_ok() {
        let store = ScriptedStore::with(vec![Err(BackendError::NotFound("k".into()))]);
        client(store).delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn exists_false_on_not_found_and_propagates_others() {
        let store = ScriptedStore::with(vec![Err(BackendError::NotFound("k".into()))]);
        assert!(!client(store).exists("k").await.unwrap());

        let store = ScriptedStore::with(vec![Err(BackendError::Rejected {
            status: 403,
            body: "denied".into(),
        })]);
        assert!(matches!(
            client(store).exists("k").await,
            Err(StorageError::RequestFailed { .. })
        ));
    }

    #[tokio::test]
    async fn list_degrades_to_empty_without_retry() {
        let store = ScriptedStore::with(vec![Err(net())]);
        assert!(client(store.clone()).list_by_prefix("data/", 100).await.is_empty());
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn copy_wraps_failure() {
        let store = ScriptedStore::with(vec![Err(BackendError::Rejected {
            status: 400,
            body: "bad".into(),
        })]);
        let err = client(store).copy("a", "b", None).await.unwrap_err();
        assert!(matches!(err, StorageError::CopyFailed { attempts: 1, .. }));
    }

    #[test]
    fn presign_failure_is_none() {
        let store = ScriptedStore::with(vec![]);
        let c = client(store);
        assert_eq!(
            c.presigned_url("data/pages/a.json", 60, PresignMethod::Get).as_deref(),
            Some("https://signed/data/pages/a.json")
        );
        assert!(c.presigned_url("", 60, PresignMethod::Get).is_none());
    }

    #[test]
    fn error_classes() {
        assert!(net().is_network());
        assert!(server().is_server_error());
        assert!(BackendError::Rejected { status: 429, body: String::new() }.is_server_error());
        assert!(!BackendError::Rejected { status: 400, body: String::new() }.is_server_error());
        assert_eq!(BackendError::NotFound("x".into()).status_code(), Some(404));
    }
}
