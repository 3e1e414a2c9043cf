use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::rules::{approvals_sufficient, ready_to_merge};
use crate::types::{
    Action, Category, Finding, FollowUpMode, IssueSnapshot, Mergeability, MrSnapshot, Severity,
    TriggerCause,
};

pub mod issue_status {
    pub const IN_REVIEW: &str = "In Review";
    pub const IN_PROGRESS: &str = "In Progress";
    pub const WAITING_FOR_QA: &str = "Waiting for QA";
    pub const CLOSED: &str = "Closed";
}

/// Everything the planner diffs desired state against.
pub struct PlanInputs<'a> {
    pub snapshot: &'a MrSnapshot,
    pub issues: &'a BTreeMap<String, IssueSnapshot>,
    pub findings: &'a [Finding],
    /// Observed follow-up branch existence (merged MRs only).
    pub followup_branches: &'a HashMap<String, bool>,
    /// Whether rebasing onto the current target head would change the
    /// MR's tree (projector's merge-base probe).
    pub rebase_affects_diff: bool,
    /// A `run-pipeline` command is pending.
    pub force_pipeline: bool,
    /// A post-merge `follow-up`/`draft-follow-up` command is pending.
    pub regenerate_followups: bool,
    pub followup_mode: FollowUpMode,
    /// Issues already warned about an unexpected status.
    pub warned_issues: &'a BTreeSet<String>,
}

/// Compute the minimal action set that converges the forge/tracker onto
/// the desired state. An MR in steady state yields an empty plan.
pub fn plan(inputs: &PlanInputs<'_>) -> Vec<Action> {
    let snapshot = inputs.snapshot;
    let mut actions = Vec::new();

    if snapshot.open() {
        plan_discussions(inputs, &mut actions);
        plan_assignees(inputs, &mut actions);
        plan_pipeline(inputs, &mut actions);

        // A planned trigger means the head is about to move and the new
        // pipeline must pass first; merging waits for the next cycle.
        let trigger_planned =
            actions.iter().any(|a| matches!(a, Action::TriggerPipeline { .. }));
        if !trigger_planned && ready_to_merge(inputs.findings) {
            // Issue transitions and follow-ups are planned by the
            // post-merge pass that runs right after a successful merge,
            // once the merge commit exists.
            actions.push(Action::Merge {
                message: snapshot.squash.then(|| snapshot.squash_message()),
                squash: snapshot.squash,
                sha: snapshot.head_sha.clone(),
            });
        }
    } else {
        plan_post_merge(inputs, &mut actions);
    }

    actions
}

fn plan_discussions(inputs: &PlanInputs<'_>, actions: &mut Vec<Action>) {
    let snapshot = inputs.snapshot;
    let existing: BTreeSet<&str> =
        snapshot.discussions.iter().map(|d| d.fingerprint.as_str()).collect();

    // Group by fingerprint: several findings may share a scope.
    let mut wanted: BTreeMap<&str, Vec<&Finding>> = BTreeMap::new();
    for finding in inputs.findings.iter().filter(|f| f.severity >= Severity::Warn) {
        wanted.entry(finding.fingerprint.as_str()).or_default().push(finding);
    }

    for (fp, findings) in &wanted {
        if existing.contains(fp) {
            continue;
        }
        let message =
            findings.iter().map(|f| f.message.as_str()).collect::<Vec<_>>().join("\n\n");
        actions.push(Action::CreateDiscussion { fingerprint: (*fp).to_string(), message });
    }

    // Auto-resolve only self-healing categories; compliance discussions
    // wait for a human.
    for discussion in snapshot.discussions.iter().filter(|d| !d.resolved) {
        if wanted.contains_key(discussion.fingerprint.as_str()) {
            continue;
        }
        let self_healing = Category::from_fingerprint(&discussion.fingerprint)
            .is_some_and(|c| c.is_self_healing());
        if self_healing {
            actions.push(Action::ResolveDiscussion {
                discussion_id: discussion.discussion_id.clone(),
                fingerprint: discussion.fingerprint.clone(),
            });
        }
    }
}

fn plan_assignees(inputs: &PlanInputs<'_>, actions: &mut Vec<Action>) {
    let mut required: BTreeSet<String> = BTreeSet::new();
    for finding in inputs.findings {
        if finding.category == Category::OpenSourceCompliance && finding.severity >= Severity::Warn
        {
            required.extend(finding.required_approvers.iter().cloned());
        }
    }
    let missing: BTreeSet<String> = required
        .into_iter()
        .filter(|u| !inputs.snapshot.assignees.contains(u))
        .collect();
    if !missing.is_empty() {
        // Assignees are only ever added; humans remove them.
        actions.push(Action::AddAssignees { users: missing });
    }
}

fn plan_pipeline(inputs: &PlanInputs<'_>, actions: &mut Vec<Action>) {
    let snapshot = inputs.snapshot;

    let cause = if inputs.force_pipeline {
        Some(TriggerCause::Command)
    } else if snapshot.pipeline.is_none() {
        Some(TriggerCause::FirstRun)
    } else {
        // New commits since the last run, or a rebase whose merge-base
        // movement would actually change the tree.
        let new_commits = snapshot
            .pipeline
            .as_ref()
            .is_some_and(|p| p.sha != snapshot.head_sha);
        let affected = new_commits || inputs.rebase_affects_diff;
        let eligible = !snapshot.draft
            && approvals_sufficient(inputs.findings)
            && snapshot.mergeability == Mergeability::Mergeable;
        (affected && eligible).then_some(TriggerCause::DiffChanged)
    };

    if let Some(cause) = cause {
        // A trigger is always preceded by a rebase onto the target head.
        actions.push(Action::Rebase);
        actions.push(Action::TriggerPipeline { cause });
    }
}

fn plan_post_merge(inputs: &PlanInputs<'_>, actions: &mut Vec<Action>) {
    let snapshot = inputs.snapshot;

    for issue in inputs.issues.values() {
        match issue.status.as_str() {
            issue_status::IN_REVIEW => {
                actions.push(Action::TransitionIssue {
                    key: issue.key.clone(),
                    to: issue_status::WAITING_FOR_QA.to_string(),
                });
            }
            issue_status::IN_PROGRESS => {
                let body = format!(
                    "Issue {} is still `In Progress`; it was not transitioned after the merge.",
                    issue.key
                );
                if !snapshot.bot_notes.contains(&body) {
                    actions.push(Action::CommentOnMr { body });
                }
            }
            // Already where the workflow puts it; nothing to do.
            issue_status::WAITING_FOR_QA | issue_status::CLOSED => {}
            other => {
                if !inputs.warned_issues.contains(&issue.key) {
                    actions.push(Action::CommentOnIssue {
                        key: issue.key.clone(),
                        body: format!(
                            "MR !{} was merged into `{}`, but this issue is in status \
                             `{other}`; please update it manually.",
                            snapshot.id, snapshot.target_branch
                        ),
                    });
                }
            }
        }
    }

    if snapshot.is_follow_up {
        return;
    }
    let draft = inputs.followup_mode == FollowUpMode::Draft;
    if inputs.regenerate_followups {
        actions.push(Action::GenerateFollowUps { draft });
    } else if inputs.followup_branches.values().any(|exists| !exists) {
        actions.push(Action::GenerateFollowUps { draft });
    }
}
