use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::api::ApiError;
use crate::engine::Context;
use crate::types::{
    extract_fingerprint, issue_project, branch_for_version, BotDiscussion, Category, Finding,
    IssueSnapshot, MrId, MrSnapshot, Severity, CHERRY_PICK_PHRASE, FOLLOW_UP_EMOJI,
};

#[allow(clippy::expect_used)]
static ISSUE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][A-Z0-9]+-[0-9]+\b").expect("issue key regex"));

/// How building a snapshot can fail. The engine maps these onto cycle
/// outcomes: transient → deferred, permanent → escalation finding.
#[derive(Debug)]
pub enum ProjectionError {
    /// Retryable transport trouble; re-attempt on the next timer tick.
    Transient(String),
    /// Permanent 4xx other than 404; needs escalation, not retry.
    Permanent(String),
    /// The MR no longer exists on the forge.
    Gone,
}

/// Everything one evaluation cycle needs, assembled from live forge,
/// tracker and git queries. Each sub-query runs exactly once per cycle.
pub struct Projection {
    pub snapshot: MrSnapshot,
    /// Supported-project issues only; unsupported references stay
    /// informational in `snapshot.issues`.
    pub issues: BTreeMap<String, IssueSnapshot>,
    /// Existence of every branch named by the referenced fix-versions.
    pub known_branches: HashMap<String, bool>,
    /// Findings produced during projection itself (missing issues,
    /// permanent tracker rejections).
    pub issue_findings: Vec<Finding>,
    /// For merged MRs: per follow-up target branch, whether the follow-up
    /// topic branch already exists on the forge. Lets the planner converge
    /// to an empty plan once follow-ups are created.
    pub followup_branches: HashMap<String, bool>,
    /// Whether rebasing onto the current target head would change the MR's
    /// tree (merge base moves with a non-empty tree diff).
    pub rebase_affects_diff: bool,
}

/// Extract issue keys from free-form text (titles, descriptions, commit
/// messages).
pub fn extract_issue_keys(text: &str) -> BTreeSet<String> {
    ISSUE_KEY.find_iter(text).map(|m| m.as_str().to_string()).collect()
}

fn classify(err: ApiError) -> ProjectionError {
    match err {
        ApiError::Transient { .. } => ProjectionError::Transient(err.to_string()),
        ApiError::NotFound { .. } => ProjectionError::Gone,
        ApiError::Permanent { .. } => ProjectionError::Permanent(err.to_string()),
    }
}

/// Same classification for sub-queries where a 404 is data, not death.
fn classify_sub(err: ApiError) -> ProjectionError {
    match err {
        ApiError::Transient { .. } => ProjectionError::Transient(err.to_string()),
        _ => ProjectionError::Permanent(err.to_string()),
    }
}

/// Build an authoritative snapshot of one MR. Pure with respect to the
/// engine: no side effects besides the queries themselves.
pub async fn project(ctx: &Context, mr_id: MrId) -> Result<Projection, ProjectionError> {
    let forge = &*ctx.forge;

    let details = forge.get_mr(mr_id).await.map_err(classify)?;
    let commits = forge.list_commits(mr_id).await.map_err(classify_sub)?;
    let changed_files = forge.list_changed_files(mr_id).await.map_err(classify_sub)?;
    let approved_by = forge.list_approvals(mr_id).await.map_err(classify_sub)?;
    let pipeline = forge.get_pipeline(mr_id).await.map_err(classify_sub)?;
    let raw_discussions = forge.list_discussions(mr_id).await.map_err(classify_sub)?;
    let notes = forge.list_notes(mr_id).await.map_err(classify_sub)?;

    let bot_notes: Vec<String> = notes
        .into_iter()
        .filter(|n| n.author == ctx.bot.username)
        .map(|n| n.body)
        .collect();

    // Issue references from title, description and every commit message.
    let mut issues = extract_issue_keys(&details.title);
    issues.extend(extract_issue_keys(&details.description));
    for commit in &commits {
        issues.extend(extract_issue_keys(&commit.message));
    }

    let is_follow_up = details.description.contains(CHERRY_PICK_PHRASE)
        || details.description.contains(FOLLOW_UP_EMOJI);

    // The ledger: discussions the bot opened, identified by author and
    // embedded fingerprint marker.
    let discussions: Vec<BotDiscussion> = raw_discussions
        .iter()
        .filter(|d| d.first_note_author == ctx.bot.username)
        .filter_map(|d| {
            extract_fingerprint(&d.first_note_body).map(|fingerprint| BotDiscussion {
                discussion_id: d.id.clone(),
                fingerprint,
                resolved: d.resolved,
            })
        })
        .collect();

    let target_head_sha = forge
        .branch_head(&details.target_branch)
        .await
        .map_err(classify_sub)?;

    // When the pipeline is blocked on manual action, the names of the
    // still-pending manual jobs decide whether that counts as done.
    let mut pending_manual_jobs = Vec::new();
    if let Some(p) = &pipeline {
        if p.status == crate::types::PipelineStatus::ManualPending {
            let jobs = forge.list_manual_jobs(p.id).await.map_err(classify_sub)?;
            pending_manual_jobs = jobs.into_iter().filter(|j| j.manual).map(|j| j.name).collect();
        }
    }

    // Would a rebase onto the current target head actually change this
    // MR's tree? Only meaningful for open MRs that already have a
    // pipeline; a failed probe downgrades to "no" rather than killing the
    // cycle (the next tick re-checks).
    let mut rebase_affects_diff = false;
    if details.state == crate::types::MrState::Opened && pipeline.is_some() {
        let probe = async {
            ctx.workspace.fetch().await?;
            ctx.workspace
                .rebase_would_change(&details.source_branch, &details.target_branch)
                .await
        }
        .await;
        match probe {
            Ok(affects) => rebase_affects_diff = affects,
            Err(e) => warn!("rebase impact probe for {}: {e:#}", details.source_branch),
        }
    }

    // Supported-project issues drive workflow state; fetch each once.
    let mut issue_map = BTreeMap::new();
    let mut issue_findings = Vec::new();
    for key in &issues {
        if !ctx.config.jira.is_supported_project(issue_project(key)) {
            continue;
        }
        if issue_map.contains_key(key) {
            continue;
        }
        match ctx.tracker.get_issue(key).await {
            Ok(issue) => {
                issue_map.insert(
                    key.clone(),
                    IssueSnapshot {
                        key: issue.key,
                        project: issue.project,
                        status: issue.status,
                        fix_versions: issue.fix_versions,
                        assignee: issue.assignee,
                    },
                );
            }
            Err(ApiError::NotFound { .. }) => {
                issue_findings.push(Finding::new(
                    Severity::Block,
                    Category::Workflow,
                    &format!("missing-issue-{key}"),
                    format!("Referenced issue {key} does not exist in the tracker."),
                ));
            }
            Err(err @ ApiError::Transient { .. }) => return Err(classify(err)),
            Err(err) => {
                warn!("tracker rejected get_issue({key}): {err}");
                issue_findings.push(Finding::new(
                    Severity::Block,
                    Category::Workflow,
                    &format!("issue-fetch-{key}"),
                    format!("Cannot read issue {key} from the tracker: {err}"),
                ));
            }
        }
    }

    // Resolve the branches named by fix-versions once per cycle, so the
    // sanity rule can stay synchronous.
    let mut known_branches = HashMap::new();
    for issue in issue_map.values() {
        for version in &issue.fix_versions {
            let Some(branch) = branch_for_version(version) else { continue };
            if known_branches.contains_key(&branch) {
                continue;
            }
            let exists = forge.branch_head(&branch).await.map_err(classify_sub)?.is_some();
            known_branches.insert(branch, exists);
        }
    }

    // For merged MRs, observe which follow-up topic branches already exist
    // so repeated events do not re-plan follow-up creation.
    let mut followup_branches = HashMap::new();
    if details.state == crate::types::MrState::Merged {
        for issue in issue_map.values() {
            for version in &issue.fix_versions {
                let Some(branch) = branch_for_version(version) else { continue };
                if branch == details.target_branch || followup_branches.contains_key(&branch) {
                    continue;
                }
                let topic = format!("{}-followup-{}", details.source_branch, branch);
                let exists = forge.branch_head(&topic).await.map_err(classify_sub)?.is_some();
                followup_branches.insert(branch, exists);
            }
        }
    }

    let snapshot = MrSnapshot {
        id: details.id,
        title: details.title,
        description: details.description,
        source_branch: details.source_branch,
        target_branch: details.target_branch,
        author: details.author,
        squash: details.squash,
        draft: details.draft,
        state: details.state,
        head_sha: details.head_sha,
        target_head_sha,
        merge_commit_sha: details.merge_commit_sha,
        mergeability: details.mergeability,
        pipeline,
        commits,
        changed_files,
        approved_by,
        code_owner_approved: details.code_owner_approved,
        pending_manual_jobs,
        assignees: details.assignees,
        issues,
        discussions,
        bot_notes,
        is_follow_up,
    };

    Ok(Projection {
        snapshot,
        issues: issue_map,
        known_branches,
        issue_findings,
        followup_branches,
        rebase_affects_diff,
    })
}
