use super::{Rule, RuleContext};
use crate::types::{Category, Finding, Severity};

/// The MR is approved when every applicable ruleset has at least one
/// approval from its resolved approver set, and the code-owner rule holds
/// when the repo requires it.
pub struct ApprovalRule;

impl Rule for ApprovalRule {
    fn name(&self) -> &'static str {
        "approval-sufficiency"
    }

    fn applies_to(&self, cx: &RuleContext<'_>) -> bool {
        cx.snapshot.open()
    }

    fn evaluate(&self, cx: &RuleContext<'_>, _prior: &[Finding]) -> Vec<Finding> {
        let snapshot = cx.snapshot;
        let mut findings = Vec::new();

        for ruleset in cx.rulesets {
            let Some(required) = ruleset.required_approvers(&snapshot.changed_files) else {
                continue;
            };
            let satisfied = required.iter().any(|a| snapshot.approved_by.contains(a));
            let scope = format!("approval-{}", ruleset.name);
            if satisfied {
                findings.push(Finding::new(
                    Severity::Pass,
                    Category::Approval,
                    &scope,
                    format!("Ruleset `{}` is approved.", ruleset.name),
                ));
            } else {
                let names: Vec<&str> = required.iter().map(String::as_str).collect();
                findings.push(
                    Finding::new(
                        Severity::Block,
                        Category::Approval,
                        &scope,
                        format!(
                            "Ruleset `{}` needs an approval from one of: {}.",
                            ruleset.name,
                            names.join(", ")
                        ),
                    )
                    .with_approvers(required.clone()),
                );
            }
        }

        if cx.config.repo.need_code_owner_approval && !snapshot.code_owner_approved {
            findings.push(Finding::new(
                Severity::Block,
                Category::Approval,
                "approval-code-owner",
                "Code-owner approval is required and not yet given.",
            ));
        }

        if findings.is_empty() {
            findings.push(Finding::new(
                Severity::Pass,
                Category::Approval,
                "approval",
                "No approval ruleset applies to this change.",
            ));
        }
        findings
    }
}

/// Convenience used by the planner's pipeline-trigger condition.
pub fn approvals_sufficient(findings: &[Finding]) -> bool {
    !findings.iter().any(|f| f.category == Category::Approval && f.blocks())
}
