use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Classification of a documentation artifact. Decides which directory
/// subtree is scanned and which storage-key segment is used.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Pages,
    Endpoints,
    Relationships,
    Postman,
    N8n,
    Project,
    Result,
    Media,
}

impl ResourceType {
    pub const ALL: [ResourceType; 8] = [
        ResourceType::Pages,
        ResourceType::Endpoints,
        ResourceType::Relationships,
        ResourceType::Postman,
        ResourceType::N8n,
        ResourceType::Project,
        ResourceType::Result,
        ResourceType::Media,
    ];

    /// Types whose index is rebuilt by `IndexGenerator::generate_all`.
    pub const INDEXED: [ResourceType; 4] = [
        ResourceType::Pages,
        ResourceType::Endpoints,
        ResourceType::Relationships,
        ResourceType::Postman,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Pages => "pages",
            ResourceType::Endpoints => "endpoints",
            ResourceType::Relationships => "relationships",
            ResourceType::Postman => "postman",
            ResourceType::N8n => "n8n",
            ResourceType::Project => "project",
            ResourceType::Result => "result",
            ResourceType::Media => "media",
        }
    }

    /// On-disk directory names in probe order. The first one that exists
    /// under the media root wins.
    pub fn directory_candidates(&self) -> &'static [&'static str] {
        match self {
            ResourceType::Relationships => &["relationships", "relationship"],
            ResourceType::Pages => &["pages"],
            ResourceType::Endpoints => &["endpoints"],
            ResourceType::Postman => &["postman"],
            ResourceType::N8n => &["n8n"],
            ResourceType::Project => &["project"],
            ResourceType::Result => &["result"],
            ResourceType::Media => &["media"],
        }
    }

    /// Known subdirectories scanned one level deep in addition to the
    /// resource directory itself.
    pub fn subdirectories(&self) -> &'static [&'static str] {
        match self {
            ResourceType::Relationships => &["by-page", "by-endpoint"],
            ResourceType::Postman => &["collection", "environments", "configurations"],
            ResourceType::Result => &[
                "pages",
                "endpoints",
                "relationships",
                "postman",
                "n8n",
                "project",
            ],
            _ => &[],
        }
    }

    /// Media uploads may nest arbitrarily deep.
    pub fn is_recursive(&self) -> bool {
        matches!(self, ResourceType::Media)
    }

    /// Project documents stay local and are never pushed to the object store.
    pub fn is_synced(&self) -> bool {
        !matches!(self, ResourceType::Project)
    }

    /// Derived index file names that scans must never pick up.
    pub fn index_file_names(&self) -> [String; 2] {
        ["index.json".to_string(), format!("{}_index.json", self.as_str())]
    }

    /// Classify a relative directory segment. Unknown segments fall back to
    /// `Project`.
    pub fn from_segment(segment: &str) -> ResourceType {
        match segment {
            "pages" => ResourceType::Pages,
            "endpoints" => ResourceType::Endpoints,
            "relationships" | "relationship" => ResourceType::Relationships,
            "postman" => ResourceType::Postman,
            "n8n" => ResourceType::N8n,
            "result" => ResourceType::Result,
            "media" => ResourceType::Media,
            _ => ResourceType::Project,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resource type: {0}")]
pub struct UnknownResourceType(pub String);

impl FromStr for ResourceType {
    type Err = UnknownResourceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        ResourceType::ALL
            .into_iter()
            .find(|t| t.as_str() == lowered)
            .or_else(|| (lowered == "relationship").then_some(ResourceType::Relationships))
            .ok_or(UnknownResourceType(s.to_string()))
    }
}

/// One discovered file. Rebuilt on every scan, never persisted.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileRecord {
    pub absolute_path: PathBuf,
    /// Slash-separated path relative to the media root.
    pub relative_path: String,
    pub name: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
    pub extension: String,
    pub resource_type: ResourceType,
    pub storage_key: String,
    pub subdirectory: Option<String>,
}

impl FileRecord {
    /// File name without its final extension.
    pub fn stem(&self) -> &str {
        match self.name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => &self.name,
        }
    }
}

/// Result of `FileScanner::compute_metadata`. A missing path yields
/// `exists == false` with every other field empty.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct FileMetadata {
    pub exists: bool,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDetail {
    pub file: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncedFile {
    pub file: String,
    pub storage_key: String,
}

/// Outcome of synchronizing one resource type.
///
/// `synced_count + error_count == total_files` always holds. `error_details`
/// is capped; `error_count` is not.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncResult {
    pub resource_type: ResourceType,
    pub dry_run: bool,
    pub total_files: usize,
    pub synced_count: usize,
    pub error_count: usize,
    pub error_details: Vec<ErrorDetail>,
    pub success_files: Vec<SyncedFile>,
}

impl SyncResult {
    pub fn empty(resource_type: ResourceType, dry_run: bool) -> Self {
        Self {
            resource_type,
            dry_run,
            total_files: 0,
            synced_count: 0,
            error_count: 0,
            error_details: Vec::new(),
            success_files: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_count == 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Index,
    Sync,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Index => "index",
            JobKind::Sync => "sync",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "index" => Some(JobKind::Index),
            "sync" => Some(JobKind::Sync),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobProgress {
    pub current: usize,
    pub total: usize,
    pub section: Option<String>,
    pub file: Option<String>,
}

/// A long-running index or sync run tracked by a job store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: uuid::Uuid,
    pub kind: JobKind,
    pub state: JobState,
    pub progress: JobProgress,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(kind: JobKind) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4(),
            kind,
            state: JobState::Pending,
            progress: JobProgress::default(),
            message: None,
            created_at: now,
            updated_at: now,
        }
    }
}
