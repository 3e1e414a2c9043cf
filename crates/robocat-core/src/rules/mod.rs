use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::checkers::{ApprovalRuleset, ComplianceChecker, SubmoduleChecker};
use crate::config::Config;
use crate::types::{Finding, IssueSnapshot, MrSnapshot};

mod approvals;
mod commit_issues;
mod fix_versions;
mod issue_mention;
mod merge_readiness;
mod open_source;
mod pipeline_status;
mod submodules;
mod title_format;

pub use approvals::{approvals_sufficient, ApprovalRule};
pub use commit_issues::CommitIssueMentionRule;
pub use fix_versions::FixVersionRule;
pub use issue_mention::IssueMentionRule;
pub use merge_readiness::{ready_to_merge, MergeReadinessRule};
pub use open_source::OpenSourceComplianceRule;
pub use pipeline_status::PipelineStatusRule;
pub use submodules::SubmoduleConsistencyRule;
pub use title_format::TitleFormatRule;

/// Read-only inputs shared by every rule in one evaluation cycle.
pub struct RuleContext<'a> {
    pub snapshot: &'a MrSnapshot,
    pub issues: &'a BTreeMap<String, IssueSnapshot>,
    pub known_branches: &'a HashMap<String, bool>,
    pub config: &'a Config,
    pub rulesets: &'a [ApprovalRuleset],
    pub compliance: Option<&'a dyn ComplianceChecker>,
    pub submodules: Option<&'a dyn SubmoduleChecker>,
    pub repo_dir: &'a Path,
}

/// One rule module. Rules are values; the pipeline is an ordered list of
/// them. `prior` carries the findings accumulated by earlier rules so late
/// composites (merge readiness) can fold over them.
pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;
    fn applies_to(&self, cx: &RuleContext<'_>) -> bool;
    fn evaluate(&self, cx: &RuleContext<'_>, prior: &[Finding]) -> Vec<Finding>;
}

/// The mandatory rule battery, in evaluation order. Merge readiness must
/// stay last: it folds over everything before it.
pub fn standard_rules() -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(IssueMentionRule),
        Box::new(TitleFormatRule),
        Box::new(CommitIssueMentionRule),
        Box::new(FixVersionRule),
        Box::new(OpenSourceComplianceRule),
        Box::new(SubmoduleConsistencyRule),
        Box::new(ApprovalRule),
        Box::new(PipelineStatusRule),
        Box::new(MergeReadinessRule),
    ]
}

/// Run the battery over one snapshot. `seed` carries findings produced
/// outside the rules proper (projection failures, executor failures from
/// the previous cycle).
pub fn evaluate_all(
    rules: &[Box<dyn Rule>],
    cx: &RuleContext<'_>,
    seed: Vec<Finding>,
) -> Vec<Finding> {
    let mut findings = seed;
    for rule in rules {
        if !rule.applies_to(cx) {
            continue;
        }
        let mut produced = rule.evaluate(cx, &findings);
        findings.append(&mut produced);
    }
    findings
}
