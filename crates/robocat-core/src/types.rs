use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Forge-side MR identifier (the per-project iid).
pub type MrId = u64;

// ── Events ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MrUpdated,
    MrNoteAdded,
    PipelineStateChanged,
    /// Synthesized from a note whose first line matches the command grammar.
    CommandInvoked,
    /// Periodic reconciliation pass.
    TimerTick,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MrUpdated => "mr_updated",
            Self::MrNoteAdded => "mr_note_added",
            Self::PipelineStateChanged => "pipeline_state_changed",
            Self::CommandInvoked => "command_invoked",
            Self::TimerTick => "timer_tick",
        }
    }
}

/// A normalized external event, as handed to the actor registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub mr_id: MrId,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl Event {
    pub fn new(mr_id: MrId, kind: EventKind, payload: serde_json::Value) -> Self {
        Self { mr_id, kind, payload, received_at: Utc::now() }
    }

    /// Stable hash of the payload, used for duplicate suppression.
    pub fn payload_hash(&self) -> String {
        let canonical = self.payload.to_string();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex_digest(&hasher.finalize()[..8])
    }
}

// ── MR snapshot ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mergeability {
    Mergeable,
    Conflicts,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Running,
    Success,
    Failed,
    Canceled,
    /// Blocked on manual jobs.
    ManualPending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub id: u64,
    pub status: PipelineStatus,
    /// Commit the pipeline ran against.
    pub sha: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    pub message: String,
    pub parent_shas: Vec<String>,
}

/// One changed file in the MR diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    /// Previous path when renamed, otherwise equal to `path`.
    pub old_path: String,
    pub new_file: bool,
    pub deleted_file: bool,
    pub diff: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MrState {
    Opened,
    Merged,
    Closed,
}

/// A bot-owned resolvable discussion, recovered from forge state by its
/// embedded fingerprint marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotDiscussion {
    pub discussion_id: String,
    pub fingerprint: String,
    pub resolved: bool,
}

/// Immutable projection of one MR, rebuilt per evaluation cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MrSnapshot {
    pub id: MrId,
    pub title: String,
    pub description: String,
    pub source_branch: String,
    pub target_branch: String,
    pub author: String,
    pub squash: bool,
    pub draft: bool,
    pub state: MrState,
    /// Head of the source branch.
    pub head_sha: String,
    /// Head of the target branch at projection time.
    pub target_head_sha: Option<String>,
    /// Squash/merge commit once merged.
    pub merge_commit_sha: Option<String>,
    pub mergeability: Mergeability,
    pub pipeline: Option<PipelineInfo>,
    pub commits: Vec<Commit>,
    pub changed_files: Vec<FileChange>,
    /// Usernames that currently approve the MR.
    pub approved_by: BTreeSet<String>,
    /// Whether the forge reports the code-owner rule as satisfied.
    pub code_owner_approved: bool,
    /// Names of manual jobs still pending, when the pipeline is blocked on
    /// manual action.
    pub pending_manual_jobs: Vec<String>,
    pub assignees: BTreeSet<String>,
    /// Issue keys mentioned in title/description/commit messages.
    pub issues: BTreeSet<String>,
    pub discussions: Vec<BotDiscussion>,
    /// Bodies of plain notes the bot already posted, for comment dedup.
    pub bot_notes: Vec<String>,
    /// Derived from the marker emoji or the cherry-pick phrase.
    pub is_follow_up: bool,
}

impl MrSnapshot {
    /// Content hash used to detect "nothing changed" between cycles.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.head_sha.as_bytes());
        hasher.update(self.title.as_bytes());
        hasher.update(self.description.as_bytes());
        for a in &self.approved_by {
            hasher.update(a.as_bytes());
        }
        if let Some(p) = &self.pipeline {
            hasher.update(p.sha.as_bytes());
            hasher.update([p.status as u8]);
        }
        hex_digest(&hasher.finalize()[..8])
    }

    /// The commit message a squash merge must carry.
    pub fn squash_message(&self) -> String {
        format!("{}\n\n{}", self.title, self.description)
    }

    pub fn open(&self) -> bool {
        self.state == MrState::Opened
    }
}

// ── Issue snapshot ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueSnapshot {
    pub key: String,
    pub project: String,
    /// Workflow-dependent status string (e.g. "In Review").
    pub status: String,
    /// Ordered version labels, mapped to branches by `branch_for_version`.
    pub fix_versions: Vec<String>,
    pub assignee: Option<String>,
}

/// Project prefix of an issue key ("PROJ-17" → "PROJ").
pub fn issue_project(key: &str) -> &str {
    key.split_once('-').map(|(p, _)| p).unwrap_or(key)
}

/// Map a fix-version label to its release branch: `v5.0`/`5.0` → `vms_5.0`.
/// Labels not starting with a digit (after an optional `v`) do not map.
pub fn branch_for_version(label: &str) -> Option<String> {
    let trimmed = label.trim();
    let rest = trimmed.strip_prefix('v').unwrap_or(trimmed);
    if rest.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        Some(format!("vms_{rest}"))
    } else {
        None
    }
}

// ── Findings ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Pass,
    Info,
    Warn,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Workflow,
    CommitConvention,
    OpenSourceCompliance,
    SubmoduleConsistency,
    FixVersionSanity,
    Pipeline,
    Approval,
    MergeReadiness,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::CommitConvention => "commit-convention",
            Self::OpenSourceCompliance => "open-source-compliance",
            Self::SubmoduleConsistency => "submodule-consistency",
            Self::FixVersionSanity => "fix-version-sanity",
            Self::Pipeline => "pipeline",
            Self::Approval => "approval",
            Self::MergeReadiness => "merge-readiness",
        }
    }

    /// Whether an open discussion of this category may be auto-resolved
    /// once the underlying finding disappears. Compliance findings require
    /// human resolution.
    pub fn is_self_healing(&self) -> bool {
        matches!(self, Self::Pipeline | Self::Approval | Self::MergeReadiness)
    }
}

/// One evaluation result produced by a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub category: Category,
    /// Stable idempotence key: category + affected object.
    pub fingerprint: String,
    pub message: String,
    /// Approvers whose sign-off clears this finding (compliance only).
    #[serde(default)]
    pub required_approvers: BTreeSet<String>,
}

impl Finding {
    pub fn new(severity: Severity, category: Category, scope: &str, message: impl Into<String>) -> Self {
        Self {
            severity,
            category,
            fingerprint: fingerprint(category, scope),
            message: message.into(),
            required_approvers: BTreeSet::new(),
        }
    }

    pub fn with_approvers(mut self, approvers: BTreeSet<String>) -> Self {
        self.required_approvers = approvers;
        self
    }

    pub fn blocks(&self) -> bool {
        self.severity == Severity::Block
    }
}

/// Stable fingerprint for a finding scope within one MR. The category is
/// kept as a readable prefix so it can be recovered from forge state.
pub fn fingerprint(category: Category, scope: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(category.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(scope.as_bytes());
    format!("{}-{}", category.as_str(), hex_digest(&hasher.finalize()[..10]))
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Workflow,
        Category::CommitConvention,
        Category::OpenSourceCompliance,
        Category::SubmoduleConsistency,
        Category::FixVersionSanity,
        Category::Pipeline,
        Category::Approval,
        Category::MergeReadiness,
    ];

    /// Recover the category from a fingerprint's readable prefix.
    pub fn from_fingerprint(fp: &str) -> Option<Category> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| fp.starts_with(c.as_str()) && fp[c.as_str().len()..].starts_with('-'))
    }
}

// ── Actions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCause {
    FirstRun,
    Command,
    DiffChanged,
}

/// A planned external side effect. Each action carries enough content to
/// derive its idempotence key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    CreateDiscussion {
        fingerprint: String,
        message: String,
    },
    ResolveDiscussion {
        discussion_id: String,
        fingerprint: String,
    },
    AddAssignees {
        users: BTreeSet<String>,
    },
    /// Rebase the source branch onto the current target head.
    Rebase,
    TriggerPipeline {
        cause: TriggerCause,
    },
    Merge {
        /// Commit message for squash merges.
        message: Option<String>,
        squash: bool,
        /// Head sha the merge is valid for (stale-head protection).
        sha: String,
    },
    TransitionIssue {
        key: String,
        to: String,
    },
    CommentOnIssue {
        key: String,
        body: String,
    },
    CommentOnMr {
        body: String,
    },
    GenerateFollowUps {
        draft: bool,
    },
}

impl Action {
    /// Idempotence key: (action kind, content fingerprint). The MR id is
    /// implicit; plans never cross MR boundaries.
    pub fn key(&self) -> String {
        match self {
            Self::CreateDiscussion { fingerprint, .. } => format!("discussion:{fingerprint}"),
            Self::ResolveDiscussion { fingerprint, .. } => format!("resolve:{fingerprint}"),
            Self::AddAssignees { users } => {
                format!("assignees:{}", users.iter().cloned().collect::<Vec<_>>().join(","))
            }
            Self::Rebase => "rebase".into(),
            Self::TriggerPipeline { cause } => format!("pipeline:{cause:?}"),
            Self::Merge { sha, .. } => format!("merge:{sha}"),
            Self::TransitionIssue { key, to } => format!("transition:{key}:{to}"),
            Self::CommentOnIssue { key, body } => {
                format!("issue-comment:{key}:{}", short_hash(body))
            }
            Self::CommentOnMr { body } => format!("mr-comment:{}", short_hash(body)),
            Self::GenerateFollowUps { draft } => format!("follow-ups:draft={draft}"),
        }
    }
}

// ── Cycle outcome ────────────────────────────────────────────────────────

/// Result of one evaluation cycle, returned up the call chain instead of
/// using non-local control flow.
#[derive(Debug)]
pub enum CycleOutcome {
    Completed,
    /// Transient trouble; a timer tick will re-attempt.
    Deferred(String),
    Failed(String),
}

// ── Follow-up mode ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpMode {
    #[default]
    Normal,
    Draft,
}

// ── Discussion fingerprint marker ────────────────────────────────────────

/// Marker embedded in the opening note of every bot-owned discussion so
/// the discussion ledger can be rebuilt from forge state alone.
pub const FINGERPRINT_MARKER_PREFIX: &str = "<!-- robocat:fingerprint:";
pub const FINGERPRINT_MARKER_SUFFIX: &str = " -->";

pub fn fingerprint_marker(fp: &str) -> String {
    format!("{FINGERPRINT_MARKER_PREFIX}{fp}{FINGERPRINT_MARKER_SUFFIX}")
}

/// Recover the fingerprint from a discussion's opening note, if present.
pub fn extract_fingerprint(body: &str) -> Option<String> {
    let start = body.find(FINGERPRINT_MARKER_PREFIX)? + FINGERPRINT_MARKER_PREFIX.len();
    let end = body[start..].find(FINGERPRINT_MARKER_SUFFIX)? + start;
    let fp = body[start..end].trim();
    (!fp.is_empty()).then(|| fp.to_string())
}

/// Marker phrase placed in follow-up MR descriptions.
pub const CHERRY_PICK_PHRASE: &str = "(cherry-picked from commit ";

/// Emoji marker that also classifies an MR as a follow-up.
pub const FOLLOW_UP_EMOJI: &str = "\u{1F916}";

// ── Helpers ──────────────────────────────────────────────────────────────

fn hex_digest(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
    }
    s
}

pub(crate) fn short_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex_digest(&hasher.finalize()[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_per_category_and_scope() {
        let a = fingerprint(Category::Pipeline, "mr-7");
        let b = fingerprint(Category::Pipeline, "mr-7");
        let c = fingerprint(Category::Approval, "mr-7");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn category_is_recoverable_from_fingerprint() {
        for category in Category::ALL {
            let fp = fingerprint(category, "scope");
            assert_eq!(Category::from_fingerprint(&fp), Some(category), "{fp}");
        }
        assert_eq!(Category::from_fingerprint("mystery-abc"), None);
    }

    #[test]
    fn branch_for_version_maps_release_labels() {
        assert_eq!(branch_for_version("v5.0").as_deref(), Some("vms_5.0"));
        assert_eq!(branch_for_version("5.1").as_deref(), Some("vms_5.1"));
        assert_eq!(branch_for_version("5.0_patch").as_deref(), Some("vms_5.0_patch"));
        assert_eq!(branch_for_version("Future"), None);
        assert_eq!(branch_for_version(""), None);
    }

    #[test]
    fn issue_project_splits_on_first_dash() {
        assert_eq!(issue_project("PROJ-123"), "PROJ");
        assert_eq!(issue_project("VMS-1-2"), "VMS");
        assert_eq!(issue_project("nodash"), "nodash");
    }

    #[test]
    fn severity_orders_block_highest() {
        assert!(Severity::Block > Severity::Warn);
        assert!(Severity::Warn > Severity::Info);
        assert!(Severity::Info > Severity::Pass);
    }

    #[test]
    fn self_healing_categories() {
        assert!(Category::Pipeline.is_self_healing());
        assert!(Category::Approval.is_self_healing());
        assert!(Category::MergeReadiness.is_self_healing());
        assert!(!Category::OpenSourceCompliance.is_self_healing());
        assert!(!Category::Workflow.is_self_healing());
    }

    #[test]
    fn fingerprint_marker_round_trips() {
        let fp = fingerprint(Category::OpenSourceCompliance, "open/foo.cpp");
        let body = format!("Some message.\n\n{}", fingerprint_marker(&fp));
        assert_eq!(extract_fingerprint(&body).as_deref(), Some(fp.as_str()));
        assert!(extract_fingerprint("no marker here").is_none());
    }

    #[test]
    fn event_payload_hash_distinguishes_payloads() {
        let a = Event::new(1, EventKind::MrUpdated, serde_json::json!({"sha": "aaa"}));
        let b = Event::new(1, EventKind::MrUpdated, serde_json::json!({"sha": "bbb"}));
        assert_ne!(a.payload_hash(), b.payload_hash());
    }
}
