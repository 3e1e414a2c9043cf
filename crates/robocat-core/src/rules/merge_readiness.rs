use super::{Rule, RuleContext};
use crate::types::{Category, Finding, Mergeability, Severity};

/// Composite verdict over the whole battery: the MR is ready to merge iff
/// nothing before this rule blocks, the MR is not a draft, and there are
/// no merge conflicts. Must run last.
pub struct MergeReadinessRule;

impl Rule for MergeReadinessRule {
    fn name(&self) -> &'static str {
        "merge-readiness"
    }

    fn applies_to(&self, cx: &RuleContext<'_>) -> bool {
        cx.snapshot.open()
    }

    fn evaluate(&self, cx: &RuleContext<'_>, prior: &[Finding]) -> Vec<Finding> {
        let snapshot = cx.snapshot;

        if snapshot.mergeability == Mergeability::Conflicts {
            return vec![Finding::new(
                Severity::Block,
                Category::MergeReadiness,
                "merge-readiness",
                "The MR has merge conflicts with its target branch.",
            )];
        }

        let blockers = prior.iter().filter(|f| f.blocks()).count();
        if blockers > 0 {
            return vec![Finding::new(
                Severity::Info,
                Category::MergeReadiness,
                "merge-readiness",
                format!("Not ready to merge: {blockers} blocking finding(s) remain."),
            )];
        }

        if snapshot.draft {
            return vec![Finding::new(
                Severity::Info,
                Category::MergeReadiness,
                "merge-readiness",
                "The MR is a draft.",
            )];
        }

        // Sign-off discussions (e.g. open-source warnings) hold the merge
        // until a human resolves them.
        let unresolved = snapshot.discussions.iter().filter(|d| !d.resolved).count();
        if unresolved > 0 {
            return vec![Finding::new(
                Severity::Info,
                Category::MergeReadiness,
                "merge-readiness",
                format!("Not ready to merge: {unresolved} robocat discussion(s) unresolved."),
            )];
        }

        vec![Finding::new(
            Severity::Pass,
            Category::MergeReadiness,
            "merge-readiness",
            "All checks passed; the MR is ready to merge.",
        )]
    }
}

/// True iff the battery concluded the MR can merge now.
pub fn ready_to_merge(findings: &[Finding]) -> bool {
    findings
        .iter()
        .any(|f| f.category == Category::MergeReadiness && f.severity == Severity::Pass)
}
