//! Configuration loader and validator for the media sync engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub security: Security,
    pub storage: Storage,
    #[serde(default)]
    pub retry: Retry,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub media_root: String,
    #[serde(default = "default_data_prefix")]
    pub data_prefix: String,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_error_details")]
    pub max_error_details: usize,
    /// SQLite URL for the job store; jobs are kept in memory when unset.
    #[serde(default)]
    pub job_database: Option<String>,
}

/// Filesystem boundary limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Security {
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
}

impl Default for Security {
    fn default() -> Self {
        Self {
            allowed_extensions: default_allowed_extensions(),
            max_file_size_bytes: default_max_file_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Http,
    Local,
}

/// Object store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Storage {
    pub backend: Backend,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub local_dir: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// Retry tuning shared by every object-store call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Retry {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    pub jitter_fraction: f64,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            exponential_base: 2.0,
            jitter_fraction: 0.1,
        }
    }
}

impl Retry {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

fn default_data_prefix() -> String {
    "data".into()
}

fn default_max_workers() -> usize {
    4
}

fn default_max_error_details() -> usize {
    100
}

fn default_allowed_extensions() -> Vec<String> {
    vec!["json".into()]
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Config {
    /// Ensure required directories exist (creates `app.media_root` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(&self.app.media_root)?;
        if self.storage.backend == Backend::Local {
            fs::create_dir_all(&self.storage.local_dir)?;
        }
        Ok(())
    }

    pub fn media_root(&self) -> PathBuf {
        PathBuf::from(&self.app.media_root)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.media_root.trim().is_empty() {
        return Err(ConfigError::Invalid("app.media_root must be non-empty"));
    }
    if cfg.app.max_workers == 0 {
        return Err(ConfigError::Invalid("app.max_workers must be > 0"));
    }
    if cfg.app.data_prefix.contains("..") {
        return Err(ConfigError::Invalid("app.data_prefix must not contain '..'"));
    }

    if cfg.security.max_file_size_bytes == 0 {
        return Err(ConfigError::Invalid("security.max_file_size_bytes must be > 0"));
    }

    match cfg.storage.backend {
        Backend::Http => {
            if cfg.storage.endpoint.trim().is_empty() {
                return Err(ConfigError::Invalid("storage.endpoint must be non-empty"));
            }
            if cfg.storage.bucket.trim().is_empty() {
                return Err(ConfigError::Invalid("storage.bucket must be non-empty"));
            }
            if cfg.storage.token.trim().is_empty() {
                return Err(ConfigError::Invalid("storage.token must be non-empty"));
            }
        }
        Backend::Local => {
            if cfg.storage.local_dir.trim().is_empty() {
                return Err(ConfigError::Invalid("storage.local_dir must be non-empty"));
            }
        }
    }
    if cfg.storage.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("storage.timeout_seconds must be > 0"));
    }

    let r = &cfg.retry;
    if r.max_attempts == 0 {
        return Err(ConfigError::Invalid("retry.max_attempts must be > 0"));
    }
    if r.exponential_base < 1.0 {
        return Err(ConfigError::Invalid("retry.exponential_base must be >= 1.0"));
    }
    if !(0.0..=1.0).contains(&r.jitter_fraction) {
        return Err(ConfigError::Invalid("retry.jitter_fraction must be within 0..=1"));
    }
    if r.initial_delay_ms > r.max_delay_ms {
        return Err(ConfigError::Invalid("retry.initial_delay_ms must be <= max_delay_ms"));
    }

    Ok(())
}

/// Returns an example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  media_root: "./media"
  data_prefix: "data"
  max_workers: 4
  max_error_details: 100
  job_database: "sqlite://./state/jobs.db"

security:
  allowed_extensions:
    - json
  max_file_size_bytes: 10485760

storage:
  backend: http
  endpoint: "https://storage.example.com/"
  bucket: "docs-media"
  token: "YOUR_STORAGE_TOKEN"
  timeout_seconds: 30

retry:
  max_attempts: 3
  initial_delay_ms: 500
  max_delay_ms: 10000
  exponential_base: 2.0
  jitter_fraction: 0.1
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.max_workers, 4);
        assert_eq!(cfg.storage.backend, Backend::Http);
    }

    #[test]
    fn defaults_fill_optional_sections() {
        let yaml = r#"app:
  media_root: "./media"
storage:
  backend: local
  local_dir: "./replica"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.data_prefix, "data");
        assert_eq!(cfg.app.max_error_details, 100);
        assert_eq!(cfg.security.allowed_extensions, vec!["json".to_string()]);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.max_delay(), Duration::from_secs(10));
    }

    #[test]
    fn http_backend_requires_bucket() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.storage.bucket = "".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("storage.bucket")), _ => panic!("wrong error") }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.storage.token = " ".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn local_backend_requires_dir() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.storage.backend = Backend::Local;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("local_dir")), _ => panic!("wrong error") }
    }

    #[test]
    fn invalid_retry_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.retry.max_attempts = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.retry.jitter_fraction = 1.5;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.retry.initial_delay_ms = 20_000;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_media_root() {
        let td = tempdir().unwrap();
        let media = td.path().join("media");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.media_root = media.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(media.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.storage.bucket, "docs-media");
    }
}
