use std::collections::BTreeSet;

use super::{Rule, RuleContext};
use crate::projector::extract_issue_keys;
use crate::types::{Category, Finding, Severity};

/// Without squash every commit lands on the target branch as-is, so each
/// commit message must mention an issue key (any project), and everything
/// referenced in the title/description must be covered by the commits.
pub struct CommitIssueMentionRule;

impl Rule for CommitIssueMentionRule {
    fn name(&self) -> &'static str {
        "commit-issue-mention"
    }

    fn applies_to(&self, cx: &RuleContext<'_>) -> bool {
        !cx.snapshot.squash && !cx.snapshot.is_follow_up
    }

    fn evaluate(&self, cx: &RuleContext<'_>, _prior: &[Finding]) -> Vec<Finding> {
        let snapshot = cx.snapshot;
        let mut findings = Vec::new();

        let mut commit_issues: BTreeSet<String> = BTreeSet::new();
        let mut unmentioned: Vec<&str> = Vec::new();
        for commit in &snapshot.commits {
            let keys = extract_issue_keys(&commit.message);
            if keys.is_empty() {
                unmentioned.push(&commit.sha);
            }
            commit_issues.extend(keys);
        }

        if !unmentioned.is_empty() {
            let shas: Vec<String> =
                unmentioned.iter().map(|s| s.chars().take(10).collect()).collect();
            findings.push(Finding::new(
                Severity::Block,
                Category::CommitConvention,
                "commit-issue-mention",
                format!(
                    "Every commit message must mention an issue key; missing in: {}.",
                    shas.join(", ")
                ),
            ));
        }

        let title_issues: BTreeSet<String> = extract_issue_keys(&snapshot.title)
            .into_iter()
            .chain(extract_issue_keys(&snapshot.description))
            .collect();
        let uncovered: Vec<&String> =
            title_issues.iter().filter(|k| !commit_issues.contains(*k)).collect();
        if !uncovered.is_empty() {
            let keys: Vec<&str> = uncovered.iter().map(|k| k.as_str()).collect();
            findings.push(Finding::new(
                Severity::Block,
                Category::CommitConvention,
                "title-issues-covered",
                format!(
                    "Issues mentioned in the title/description but in no commit message: {}.",
                    keys.join(", ")
                ),
            ));
        }

        if findings.is_empty() {
            findings.push(Finding::new(
                Severity::Pass,
                Category::CommitConvention,
                "commit-issue-mention",
                "All commits mention issues and cover the title references.",
            ));
        }
        findings
    }
}
