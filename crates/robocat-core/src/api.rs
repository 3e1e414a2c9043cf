use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Commit, FileChange, MrId, MrState, Mergeability, PipelineInfo};

// ── Error taxonomy ───────────────────────────────────────────────────────

/// Transport-level classification for forge/tracker calls. The engine's
/// retry and finding behavior depends on which variant comes back.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Network trouble, 5xx, 429: worth retrying with backoff.
    #[error("transient failure talking to {service}: {message}")]
    Transient { service: &'static str, message: String },

    /// The object does not exist (404).
    #[error("{service}: not found: {message}")]
    NotFound { service: &'static str, message: String },

    /// Permanent 4xx rejection (permissions, validation). Not retried.
    #[error("{service}: permanent rejection ({status}): {message}")]
    Permanent { service: &'static str, status: u16, message: String },
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

// ── Forge data ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeUser {
    pub id: u64,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MrDetails {
    pub id: MrId,
    pub title: String,
    pub description: String,
    pub source_branch: String,
    pub target_branch: String,
    pub author: String,
    pub squash: bool,
    pub draft: bool,
    pub state: MrState,
    pub head_sha: String,
    pub merge_commit_sha: Option<String>,
    pub mergeability: Mergeability,
    pub assignees: BTreeSet<String>,
    /// True when the forge's code-owner approval rule is satisfied (or not
    /// enforced for this MR).
    pub code_owner_approved: bool,
}

/// A plain (non-resolvable) comment on an MR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: u64,
    pub author: String,
    pub body: String,
}

/// A resolvable discussion thread; `first_note_author`/`first_note_body`
/// identify ownership and carry the fingerprint marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discussion {
    pub id: String,
    pub first_note_author: String,
    pub first_note_body: String,
    pub resolved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub name: String,
    pub stage: String,
    pub manual: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// The forge refused because the MR is not currently mergeable.
    NotMergeable,
}

#[derive(Debug, Clone)]
pub struct CreateMrRequest {
    pub source_branch: String,
    pub target_branch: String,
    pub title: String,
    pub description: String,
    pub assignees: BTreeSet<String>,
    pub draft: bool,
    pub squash: bool,
}

// ── Capability traits ────────────────────────────────────────────────────

/// Forge (GitLab-class) operations the engine consumes. Implementations
/// must be internally thread-safe; the engine shares one instance.
#[async_trait]
pub trait Forge: Send + Sync {
    /// The bot's own identity; doubles as the boot-time reachability probe.
    async fn current_user(&self) -> ApiResult<ForgeUser>;

    async fn list_open_mrs(&self) -> ApiResult<Vec<MrId>>;
    async fn get_mr(&self, mr: MrId) -> ApiResult<MrDetails>;
    async fn list_commits(&self, mr: MrId) -> ApiResult<Vec<Commit>>;
    async fn list_changed_files(&self, mr: MrId) -> ApiResult<Vec<FileChange>>;

    async fn list_notes(&self, mr: MrId) -> ApiResult<Vec<Note>>;
    async fn post_note(&self, mr: MrId, body: &str) -> ApiResult<()>;

    async fn list_discussions(&self, mr: MrId) -> ApiResult<Vec<Discussion>>;
    /// Returns the new discussion id.
    async fn create_discussion(&self, mr: MrId, body: &str) -> ApiResult<String>;
    async fn resolve_discussion(&self, mr: MrId, discussion_id: &str) -> ApiResult<()>;

    async fn list_approvals(&self, mr: MrId) -> ApiResult<BTreeSet<String>>;
    async fn add_assignees(&self, mr: MrId, users: &BTreeSet<String>) -> ApiResult<()>;

    async fn get_pipeline(&self, mr: MrId) -> ApiResult<Option<PipelineInfo>>;
    async fn list_manual_jobs(&self, pipeline_id: u64) -> ApiResult<Vec<Job>>;
    async fn play_job(&self, job_id: u64) -> ApiResult<()>;

    async fn branch_head(&self, branch: &str) -> ApiResult<Option<String>>;

    /// Merge with an optional squash message; `sha` guards against a head
    /// that moved since planning.
    async fn merge(
        &self,
        mr: MrId,
        message: Option<&str>,
        squash: bool,
        sha: &str,
    ) -> ApiResult<MergeOutcome>;

    async fn create_mr(&self, req: &CreateMrRequest) -> ApiResult<MrId>;
}

// ── Tracker ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerIssue {
    pub key: String,
    pub project: String,
    pub status: String,
    pub fix_versions: Vec<String>,
    pub assignee: Option<String>,
}

/// Issue tracker (Jira-class) operations the engine consumes.
#[async_trait]
pub trait Tracker: Send + Sync {
    async fn get_issue(&self, key: &str) -> ApiResult<TrackerIssue>;
    /// Transition names the tracker currently allows for the issue.
    async fn available_transitions(&self, key: &str) -> ApiResult<Vec<String>>;
    async fn transition_issue(&self, key: &str, to: &str) -> ApiResult<()>;
    async fn post_comment(&self, key: &str, body: &str) -> ApiResult<()>;
}
