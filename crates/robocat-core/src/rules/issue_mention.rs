use super::{Rule, RuleContext};
use crate::types::{issue_project, Category, Finding, Severity};

/// The MR must reference at least one issue in a supported project.
/// Unsupported-project references are informational only.
pub struct IssueMentionRule;

impl Rule for IssueMentionRule {
    fn name(&self) -> &'static str {
        "issue-mention"
    }

    fn applies_to(&self, _cx: &RuleContext<'_>) -> bool {
        true
    }

    fn evaluate(&self, cx: &RuleContext<'_>, _prior: &[Finding]) -> Vec<Finding> {
        let supported = cx
            .snapshot
            .issues
            .iter()
            .any(|key| cx.config.jira.is_supported_project(issue_project(key)));
        if supported {
            return vec![Finding::new(
                Severity::Pass,
                Category::Workflow,
                "issue-mention",
                "MR references a supported-project issue.",
            )];
        }
        let projects = cx.config.jira.project_keys.join(", ");
        vec![Finding::new(
            Severity::Block,
            Category::Workflow,
            "issue-mention",
            format!(
                "The MR must mention at least one issue from a supported project ({projects}) \
                 in its title, description or commit messages."
            ),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::tests::{context, snapshot_with};

    #[test]
    fn supported_reference_passes() {
        let snapshot = snapshot_with(|s| {
            s.issues.insert("PROJ-1".into());
        });
        let harness = context(&snapshot);
        let findings = IssueMentionRule.evaluate(&harness.cx(), &[]);
        assert_eq!(findings[0].severity, Severity::Pass);
    }

    #[test]
    fn unsupported_only_blocks() {
        let snapshot = snapshot_with(|s| {
            s.issues.insert("OTHER-9".into());
        });
        let harness = context(&snapshot);
        let findings = IssueMentionRule.evaluate(&harness.cx(), &[]);
        assert_eq!(findings[0].severity, Severity::Block);
    }

    #[test]
    fn no_reference_blocks() {
        let snapshot = snapshot_with(|_| {});
        let harness = context(&snapshot);
        let findings = IssueMentionRule.evaluate(&harness.cx(), &[]);
        assert_eq!(findings[0].severity, Severity::Block);
    }
}
