use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use super::{BackendError, ObjectInfo, ObjectStore, PresignMethod};

/// Path-style REST blob store: `{endpoint}/{bucket}/{key}`.
#[derive(Clone)]
pub struct HttpObjectStore {
    http: Client,
    endpoint: Url,
    bucket: String,
    token: String,
}

impl fmt::Debug for HttpObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpObjectStore")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    objects: Vec<ObjectInfo>,
}

impl HttpObjectStore {
    pub fn new(
        endpoint: &str,
        bucket: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| BackendError::Configuration(format!("invalid endpoint {endpoint}: {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(BackendError::Configuration(format!(
                "endpoint {endpoint} cannot carry a path"
            )));
        }
        if bucket.trim().is_empty() {
            return Err(BackendError::Configuration("bucket must be set".into()));
        }
        if token.trim().is_empty() {
            return Err(BackendError::Configuration("token must be set".into()));
        }
        let http = Client::builder()
            .user_agent("media-sync/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Configuration(format!("http client: {e}")))?;
        Ok(Self {
            http,
            endpoint,
            bucket: bucket.to_string(),
            token: token.to_string(),
        })
    }

    fn bucket_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(&self.bucket);
        }
        url
    }

    /// Each key segment is pushed separately so it gets percent-encoded.
    pub fn object_url(&self, key: &str) -> Result<Url, BackendError> {
        let segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return Err(BackendError::Invalid("empty object key".into()));
        }
        let mut url = self.bucket_url();
        if let Ok(mut path) = url.path_segments_mut() {
            path.extend(segments);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
    }

    pub fn build_put(
        &self,
        key: &str,
        body: &[u8],
        content_type: &str,
    ) -> Result<reqwest::Request, BackendError> {
        self.request(Method::PUT, self.object_url(key)?)
            .header("Content-Type", content_type)
            .body(body.to_vec())
            .build()
            .map_err(|e| BackendError::Invalid(format!("failed to build put request: {e}")))
    }

    pub fn build_copy(
        &self,
        from: &str,
        to: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<reqwest::Request, BackendError> {
        let mut builder = self
            .request(Method::PUT, self.object_url(to)?)
            .header("x-copy-source", format!("/{}/{}", self.bucket, from.trim_start_matches('/')));
        for (name, value) in metadata {
            builder = builder.header(format!("x-meta-{}", name.to_ascii_lowercase()), value);
        }
        builder
            .build()
            .map_err(|e| BackendError::Invalid(format!("failed to build copy request: {e}")))
    }

    pub fn build_list(&self, prefix: &str, max_keys: usize) -> Result<reqwest::Request, BackendError> {
        let mut url = self.bucket_url();
        url.query_pairs_mut()
            .append_pair("prefix", prefix)
            .append_pair("max-keys", &max_keys.to_string());
        self.request(Method::GET, url)
            .build()
            .map_err(|e| BackendError::Invalid(format!("failed to build list request: {e}")))
    }

    async fn send(&self, request: reqwest::Request, key: &str) -> Result<reqwest::Response, BackendError> {
        debug!(method = %request.method(), url = %request.url(), "storage request");
        let res = self.http.execute(request).await.map_err(classify)?;
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        Err(status_error(status, key, body))
    }

    /// Deterministic signature for a given expiry timestamp.
    pub fn presign_at(&self, key: &str, method: PresignMethod, expires: i64) -> Result<String, BackendError> {
        let mut url = self.object_url(key)?;
        let mut hasher = Sha256::new();
        hasher.update(self.token.as_bytes());
        hasher.update(b"\n");
        hasher.update(method.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
        hasher.update(expires.to_string().as_bytes());
        let signature = hex::encode(hasher.finalize());
        url.query_pairs_mut()
            .append_pair("method", method.as_str())
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &signature);
        Ok(url.into())
    }
}

/// Connect, timeout and DNS failures are the retryable network class.
fn classify(err: reqwest::Error) -> BackendError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        BackendError::Network(err.to_string())
    } else {
        BackendError::Transport(err.to_string())
    }
}

/// Longest response body kept on an error; error pages can be large.
const MAX_ERROR_BODY: usize = 256;

fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
        body.push_str("...");
    }
    body
}

pub(crate) fn status_error(status: StatusCode, key: &str, body: String) -> BackendError {
    let body = truncate_body(body);
    if status == StatusCode::NOT_FOUND {
        BackendError::NotFound(key.to_string())
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        BackendError::Server {
            status: status.as_u16(),
            body,
        }
    } else {
        BackendError::Rejected {
            status: status.as_u16(),
            body,
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, key: &str, body: &[u8], content_type: &str) -> Result<(), BackendError> {
        let request = self.build_put(key, body, content_type)?;
        self.send(request, key).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BackendError> {
        let request = self
            .request(Method::GET, self.object_url(key)?)
            .build()
            .map_err(|e| BackendError::Invalid(e.to_string()))?;
        let res = self.send(request, key).await?;
        let bytes = res.bytes().await.map_err(classify)?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let request = self
            .request(Method::DELETE, self.object_url(key)?)
            .build()
            .map_err(|e| BackendError::Invalid(e.to_string()))?;
        self.send(request, key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        let request = self
            .request(Method::HEAD, self.object_url(key)?)
            .build()
            .map_err(|e| BackendError::Invalid(e.to_string()))?;
        match self.send(request, key).await {
            Ok(_) => Ok(true),
            Err(BackendError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, prefix: &str, max_keys: usize) -> Result<Vec<ObjectInfo>, BackendError> {
        let request = self.build_list(prefix, max_keys)?;
        let res = self.send(request, prefix).await?;
        let payload: ListResponse = res
            .json()
            .await
            .map_err(|e| BackendError::Transport(format!("invalid listing: {e}")))?;
        let mut objects = payload.objects;
        objects.truncate(max_keys);
        Ok(objects)
    }

    async fn copy(
        &self,
        from: &str,
        to: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), BackendError> {
        let request = self.build_copy(from, to, metadata)?;
        self.send(request, from).await?;
        Ok(())
    }

    fn presign(&self, key: &str, ttl: Duration, method: PresignMethod) -> Result<String, BackendError> {
        if ttl.is_zero() {
            return Err(BackendError::Invalid("presign ttl must be > 0".into()));
        }
        let ttl = i64::try_from(ttl.as_secs())
            .map_err(|_| BackendError::Invalid("presign ttl too large".into()))?;
        self.presign_at(key, method, Utc::now().timestamp() + ttl)
    }
}
