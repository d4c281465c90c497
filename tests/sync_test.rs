use async_trait::async_trait;
use media_sync::model::ResourceType;
use media_sync::retry::RetryPolicy;
use media_sync::scanner::FileScanner;
use media_sync::storage::{BackendError, ObjectInfo, ObjectStore, PresignMethod, StorageClient};
use media_sync::sync::{ProgressFn, SyncEngine, SyncProgress};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::sync::Mutex;
use tokio::time::Duration;

/// Object store fake that records every put attempt.
#[derive(Clone, Default)]
struct RecordingStore {
    attempts: Arc<Mutex<Vec<String>>>,
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    /// Keys that always fail with a non-retryable rejection.
    rejected: Arc<Mutex<HashSet<String>>>,
    /// Per-key server statuses returned before the put succeeds.
    flaky: Arc<Mutex<HashMap<String, VecDeque<u16>>>>,
    reject_all: bool,
}

impl RecordingStore {
    fn rejecting_all() -> Self {
        Self {
            reject_all: true,
            ..Self::default()
        }
    }

    async fn reject(&self, key: &str) {
        self.rejected.lock().await.insert(key.to_string());
    }

    async fn flaky(&self, key: &str, statuses: &[u16]) {
        self.flaky
            .lock()
            .await
            .insert(key.to_string(), statuses.iter().copied().collect());
    }
}

#[async_trait]
impl ObjectStore for RecordingStore {
    async fn put(&self, key: &str, body: &[u8], _content_type: &str) -> Result<(), BackendError> {
        self.attempts.lock().await.push(key.to_string());
        if self.reject_all || self.rejected.lock().await.contains(key) {
            return Err(BackendError::Rejected {
                status: 400,
                body: "rejected".into(),
            });
        }
        if let Some(status) = self
            .flaky
            .lock()
            .await
            .get_mut(key)
            .and_then(VecDeque::pop_front)
        {
            return Err(BackendError::Server {
                status,
                body: "unavailable".into(),
            });
        }
        self.objects.lock().await.insert(key.to_string(), body.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BackendError> {
        self.objects
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.objects.lock().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.objects.lock().await.contains_key(key))
    }

    async fn list(&self, prefix: &str, max_keys: usize) -> Result<Vec<ObjectInfo>, BackendError> {
        Ok(self
            .objects
            .lock()
            .await
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .take(max_keys)
            .map(|(k, v)| ObjectInfo {
                key: k.clone(),
                size: v.len() as u64,
                modified_at: None,
            })
            .collect())
    }

    async fn copy(
        &self,
        from: &str,
        to: &str,
        _metadata: &BTreeMap<String, String>,
    ) -> Result<(), BackendError> {
        let body = self.get(from).await?;
        self.objects.lock().await.insert(to.to_string(), body);
        Ok(())
    }

    fn presign(&self, key: &str, _ttl: Duration, _method: PresignMethod) -> Result<String, BackendError> {
        Ok(format!("memory://{key}"))
    }
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn engine(root: &Path, store: &RecordingStore) -> SyncEngine {
    let fast = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
    let client = StorageClient::with_policies(
        Arc::new(store.clone()),
        fast.clone().network_errors(),
        fast.transient_errors(),
    );
    let scanner = FileScanner::new(root, "data").with_extensions(vec!["json".to_string()]);
    SyncEngine::new(Arc::new(scanner), client)
}

#[tokio::test]
async fn dry_run_projects_every_file_without_uploading() {
    let td = tempdir().unwrap();
    for i in 0..5 {
        write(td.path(), &format!("endpoints/e{i}.json"), r#"{"endpoint_id": "x"}"#);
    }
    let store = RecordingStore::default();

    let result = engine(td.path(), &store)
        .sync_resource_type(ResourceType::Endpoints, true, None)
        .await;

    assert!(result.dry_run);
    assert_eq!(result.total_files, 5);
    assert_eq!(result.synced_count, 5);
    assert_eq!(result.error_count, 0);
    assert_eq!(result.success_files.len(), 5);
    assert_eq!(result.success_files[0].storage_key, "data/endpoints/e0.json");
    assert!(store.attempts.lock().await.is_empty());
}

#[tokio::test]
async fn partial_failure_keeps_counts_consistent() {
    let td = tempdir().unwrap();
    for name in ["a", "b", "c", "d"] {
        write(td.path(), &format!("pages/{name}.json"), r#"{"page_id": "p"}"#);
    }
    write(td.path(), "pages/e.json", "{not json");
    let store = RecordingStore::default();
    store.reject("data/pages/b.json").await;

    let result = engine(td.path(), &store)
        .sync_resource_type(ResourceType::Pages, false, None)
        .await;

    assert_eq!(result.total_files, 5);
    assert_eq!(result.synced_count, 3);
    assert_eq!(result.error_count, 2);
    assert_eq!(result.synced_count + result.error_count, result.total_files);
    assert!(!result.is_success());

    let failed: Vec<_> = result.error_details.iter().map(|d| d.file.as_str()).collect();
    assert_eq!(failed, vec!["pages/b.json", "pages/e.json"]);
    assert!(result.error_details[1].error.contains("malformed JSON"));

    // The malformed file never reaches the store; the rejected one is tried once.
    let attempts = store.attempts.lock().await.clone();
    assert_eq!(attempts.iter().filter(|k| k.ends_with("b.json")).count(), 1);
    assert!(!attempts.iter().any(|k| k.ends_with("e.json")));
}

#[tokio::test]
async fn missing_directory_yields_empty_result() {
    let td = tempdir().unwrap();
    let store = RecordingStore::default();
    let result = engine(td.path(), &store)
        .sync_resource_type(ResourceType::Postman, false, None)
        .await;
    assert_eq!(result.total_files, 0);
    assert_eq!(result.synced_count, 0);
    assert_eq!(result.error_count, 0);
    assert!(result.is_success());
}

#[tokio::test]
async fn every_upload_failing_is_counted() {
    let td = tempdir().unwrap();
    for i in 0..3 {
        write(td.path(), &format!("n8n/w{i}.json"), r#"{"id": 1}"#);
    }
    let store = RecordingStore::rejecting_all();
    let result = engine(td.path(), &store)
        .sync_resource_type(ResourceType::N8n, false, None)
        .await;
    assert_eq!(result.total_files, 3);
    assert_eq!(result.error_count, 3);
    assert_eq!(result.synced_count, 0);
    assert!(result.success_files.is_empty());
}

#[tokio::test]
async fn error_details_are_capped_but_counted() {
    let td = tempdir().unwrap();
    for i in 0..4 {
        write(td.path(), &format!("pages/p{i}.json"), r#"{"page_id": "p"}"#);
    }
    let store = RecordingStore::rejecting_all();
    let result = engine(td.path(), &store)
        .with_limits(10 * 1024 * 1024, 2)
        .sync_resource_type(ResourceType::Pages, false, None)
        .await;
    assert_eq!(result.error_count, 4);
    assert_eq!(result.error_details.len(), 2);
}

#[tokio::test]
async fn oversized_file_is_rejected_before_upload() {
    let td = tempdir().unwrap();
    write(td.path(), "pages/big.json", r#"{"page_id": "a-very-long-identifier"}"#);
    write(td.path(), "pages/ok.json", "{}");
    let store = RecordingStore::default();
    let result = engine(td.path(), &store)
        .with_limits(8, 100)
        .sync_resource_type(ResourceType::Pages, false, None)
        .await;
    assert_eq!(result.synced_count, 1);
    assert_eq!(result.error_count, 1);
    assert_eq!(result.error_details[0].file, "pages/big.json");
    assert_eq!(*store.attempts.lock().await, vec!["data/pages/ok.json".to_string()]);
}

#[tokio::test]
async fn server_errors_are_retried() {
    let td = tempdir().unwrap();
    write(td.path(), "pages/a.json", r#"{"page_id": "a"}"#);
    let store = RecordingStore::default();
    store.flaky("data/pages/a.json", &[503, 502]).await;

    let result = engine(td.path(), &store)
        .sync_resource_type(ResourceType::Pages, false, None)
        .await;

    assert_eq!(result.synced_count, 1);
    assert_eq!(store.attempts.lock().await.len(), 3);
}

#[tokio::test]
async fn uploads_canonical_json() {
    let td = tempdir().unwrap();
    write(td.path(), "pages/a.json", r#"{"b": 1, "a": {"d": 2, "c": 3}}"#);
    write(td.path(), "n8n/flow.json", r#"{"name": "flow"}"#);
    let store = RecordingStore::default();
    let engine = engine(td.path(), &store);

    engine.sync_resource_type(ResourceType::Pages, false, None).await;
    engine.sync_resource_type(ResourceType::N8n, false, None).await;

    let objects = store.objects.lock().await;
    let page = String::from_utf8(objects["data/pages/a.json"].clone()).unwrap();
    assert_eq!(page, "{\n  \"a\": {\n    \"c\": 3,\n    \"d\": 2\n  },\n  \"b\": 1\n}\n");

    let flow: serde_json::Value = serde_json::from_slice(&objects["data/n8n/flow.json"]).unwrap();
    assert_eq!(flow["workflow_id"], "flow");
}

#[tokio::test]
async fn large_numbers_reach_the_store_unchanged() {
    let td = tempdir().unwrap();
    write(
        td.path(),
        "pages/a.json",
        r#"{"page_id": "a", "big": 123456789012345678901234567890, "ratio": 0.1}"#,
    );
    let store = RecordingStore::default();

    let result = engine(td.path(), &store)
        .sync_resource_type(ResourceType::Pages, false, None)
        .await;

    assert_eq!(result.synced_count, 1);
    let objects = store.objects.lock().await;
    let body = String::from_utf8(objects["data/pages/a.json"].clone()).unwrap();
    assert!(body.contains("\"big\": 123456789012345678901234567890"), "{body}");
    assert!(body.contains("\"ratio\": 0.1"), "{body}");
}

#[tokio::test]
async fn panicking_progress_callback_is_ignored() {
    let td = tempdir().unwrap();
    write(td.path(), "pages/a.json", "{}");
    write(td.path(), "pages/b.json", "{}");
    let store = RecordingStore::default();

    let explode = |_: &SyncProgress| panic!("callback failure");
    let progress: ProgressFn<'_> = &explode;
    let result = engine(td.path(), &store)
        .sync_resource_type(ResourceType::Pages, false, Some(progress))
        .await;

    assert_eq!(result.synced_count, 2);
    assert_eq!(store.objects.lock().await.len(), 2);
}

#[tokio::test]
async fn sync_all_reports_monotonic_global_progress() {
    let td = tempdir().unwrap();
    write(td.path(), "pages/a.json", "{}");
    write(td.path(), "pages/b.json", "{}");
    write(td.path(), "endpoints/e.json", "{}");
    write(td.path(), "relationship/by-page/r.json", "{}");
    write(td.path(), "project/readme.json", "{}");
    let store = RecordingStore::default();

    let seen = std::sync::Mutex::new(Vec::<SyncProgress>::new());
    let record = |p: &SyncProgress| seen.lock().unwrap().push(p.clone());
    let progress: ProgressFn<'_> = &record;
    let results = engine(td.path(), &store).sync_all(false, Some(progress)).await;

    assert_eq!(results.len(), ResourceType::ALL.len());
    assert_eq!(results[&ResourceType::Project].total_files, 0);
    assert_eq!(results[&ResourceType::Pages].synced_count, 2);
    assert_eq!(results[&ResourceType::Relationships].synced_count, 1);

    let seen = seen.into_inner().unwrap();
    let indexes: Vec<usize> = seen.iter().map(|p| p.global_index).collect();
    assert_eq!(indexes, vec![1, 2, 3, 4]);
    assert!(seen.iter().all(|p| p.global_total == 4));
    assert!(seen.iter().all(|p| p.section_index >= 1 && p.section_index <= p.section_total));

    // Legacy directory name, canonical storage key.
    assert!(store
        .objects
        .lock()
        .await
        .contains_key("data/relationships/by-page/r.json"));
}
